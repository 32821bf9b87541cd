//! Persisted device configuration.

use heapless::String;

pub const SSID_MAX: usize = 32;
pub const PASS_MAX: usize = 64;
pub const SERVER_MAX: usize = 200;
pub const CONTENT_DOC_MAX: usize = 2048;
pub const TOKEN_MAX: usize = 64;

/// Sleep-interval clamp bounds, minutes.
pub const SLEEP_MINUTES_FLOOR: u16 = 10;
pub const SLEEP_MINUTES_CEIL: u16 = 1440;
pub const SLEEP_MINUTES_DEFAULT: u16 = 60;

/// Everything that must survive a power cycle, persisted as one record.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceConfig {
    pub ssid: String<SSID_MAX>,
    pub pass: String<PASS_MAX>,
    pub server: String<SERVER_MAX>,
    /// Content-configuration JSON document; opaque to the firmware and
    /// forwarded verbatim to the backend.
    pub content_doc: String<CONTENT_DOC_MAX>,
    pub token: String<TOKEN_MAX>,
    pub sleep_minutes: u16,
    pub retry_count: u8,
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self {
            sleep_minutes: SLEEP_MINUTES_DEFAULT,
            ..Self::default()
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.ssid.is_empty()
    }

    pub fn has_server(&self) -> bool {
        !self.server.is_empty()
    }

    /// Stores a new content document and recomputes the derived sleep
    /// interval from its `refreshInterval` field, clamped to bounds.
    ///
    /// Returns `false` (leaving the config untouched) when the document
    /// exceeds the persisted-field capacity.
    pub fn set_content_doc(&mut self, doc: &str) -> bool {
        let Ok(stored) = String::try_from(doc) else {
            return false;
        };
        self.content_doc = stored;
        if let Some(minutes) = refresh_interval_minutes(doc) {
            self.sleep_minutes = clamp_sleep_minutes(minutes);
        }
        true
    }
}

/// Clamps a requested refresh interval to the supported range.
pub fn clamp_sleep_minutes(minutes: u32) -> u16 {
    minutes
        .clamp(SLEEP_MINUTES_FLOOR as u32, SLEEP_MINUTES_CEIL as u32) as u16
}

/// Pulls the integer `refreshInterval` value out of the content document
/// without a full JSON parse; the document is otherwise opaque.
pub fn refresh_interval_minutes(doc: &str) -> Option<u32> {
    let key_at = doc.find("\"refreshInterval\"")?;
    let rest = &doc[key_at..];
    let colon = rest.find(':')?;
    let value = rest[colon + 1..].trim_start();

    let digits_len = value.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len == 0 {
        return None;
    }
    value[..digits_len].parse().ok()
}

/// Persistence backend for the device configuration.
///
/// Implementations open and close their storage session inside each call
/// so storage is never left mounted between operations.
pub trait ConfigStore {
    type Error;

    fn load(&mut self) -> Result<Option<DeviceConfig>, Self::Error>;
    fn save(&mut self, config: &DeviceConfig) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_minutes_clamp_to_supported_range() {
        assert_eq!(clamp_sleep_minutes(5), 10);
        assert_eq!(clamp_sleep_minutes(10), 10);
        assert_eq!(clamp_sleep_minutes(90), 90);
        assert_eq!(clamp_sleep_minutes(1440), 1440);
        assert_eq!(clamp_sleep_minutes(2000), 1440);
    }

    #[test]
    fn refresh_interval_is_extracted_from_the_document() {
        assert_eq!(
            refresh_interval_minutes(r#"{"modes":["zen"],"refreshInterval":30}"#),
            Some(30)
        );
        assert_eq!(
            refresh_interval_minutes(r#"{"refreshInterval": 240, "modes": []}"#),
            Some(240)
        );
        assert_eq!(refresh_interval_minutes(r#"{"modes":[]}"#), None);
        assert_eq!(
            refresh_interval_minutes(r#"{"refreshInterval":"soon"}"#),
            None
        );
    }

    #[test]
    fn content_doc_updates_the_derived_sleep_interval() {
        let mut cfg = DeviceConfig::new();
        assert_eq!(cfg.sleep_minutes, 60);

        assert!(cfg.set_content_doc(r#"{"modes":[],"refreshInterval":5}"#));
        assert_eq!(cfg.sleep_minutes, 10);

        assert!(cfg.set_content_doc(r#"{"modes":[],"refreshInterval":2000}"#));
        assert_eq!(cfg.sleep_minutes, 1440);

        // No interval field: previous derived value stands.
        assert!(cfg.set_content_doc(r#"{"modes":["daily"]}"#));
        assert_eq!(cfg.sleep_minutes, 1440);
    }

    #[test]
    fn oversized_document_is_rejected_without_side_effects() {
        let mut cfg = DeviceConfig::new();
        let doc = "x".repeat(CONTENT_DOC_MAX + 1);
        assert!(!cfg.set_content_doc(&doc));
        assert!(cfg.content_doc.is_empty());
        assert_eq!(cfg.sleep_minutes, 60);
    }
}
