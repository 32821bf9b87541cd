#![no_std]

//! Board support for the ESP32-C3 Glance hardware: flash-backed config
//! persistence, battery scaling, the status LED and the built-in status
//! screens.

pub mod battery;
pub mod led;
pub mod render;
pub mod storage;
