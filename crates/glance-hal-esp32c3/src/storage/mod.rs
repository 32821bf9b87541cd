pub mod flash_config;

pub use flash_config::{FlashConfigError, FlashConfigStore};
