//! Provisioning-portal request logic: input sanitation, validation,
//! routing and form decoding. The socket loop lives in the firmware
//! binary; everything here is pure so it can be tested on the host.

use core::fmt::Write;

use heapless::String;

use crate::config::{PASS_MAX, SERVER_MAX, SSID_MAX};

pub const CONFIG_FIELD_MAX: usize = 2048;
pub const AP_NAME_MAX: usize = 16;

/// Strips markup-significant characters so persisted free text can never
/// inject into the portal page or the JSON we emit: angle brackets always;
/// quotes, ampersands and backslashes from free-text fields.
fn push_sanitized<const N: usize>(out: &mut String<N>, input: &str, strict: bool) {
    for c in input.trim().chars() {
        let dropped = matches!(c, '<' | '>')
            || (strict && matches!(c, '"' | '\'' | '&' | '\\'));
        if dropped {
            continue;
        }
        if out.push(c).is_err() {
            break;
        }
    }
}

/// Sanitizes a structured field (URLs): length cap + angle brackets.
pub fn sanitize_input<const N: usize>(input: &str) -> String<N> {
    let mut out = String::new();
    push_sanitized(&mut out, input, false);
    out
}

/// Sanitizes a free-text field (passphrases, documents).
pub fn sanitize_text<const N: usize>(input: &str) -> String<N> {
    let mut out = String::new();
    push_sanitized(&mut out, input, true);
    out
}

/// Sanitizes an SSID: free-text rules plus control-character removal
/// (multi-byte UTF-8 is kept).
pub fn sanitize_ssid(input: &str) -> String<SSID_MAX> {
    let mut out = String::new();
    for c in input.trim().chars() {
        if matches!(c, '<' | '>' | '"' | '\'' | '&' | '\\') || c.is_control() {
            continue;
        }
        if out.push(c).is_err() {
            break;
        }
    }
    out
}

pub fn sanitize_pass(input: &str) -> String<PASS_MAX> {
    sanitize_text(input)
}

/// Validates and normalizes a server URL: scheme required, trailing
/// slashes stripped.
pub fn normalize_server_url(input: &str) -> Option<String<SERVER_MAX>> {
    let cleaned: String<SERVER_MAX> = sanitize_input(input);
    if !(cleaned.starts_with("http://") || cleaned.starts_with("https://")) {
        return None;
    }
    let trimmed = cleaned.as_str().trim_end_matches('/');
    Some(String::try_from(trimmed).ok()?)
}

/// Minimal shape check for the content document: a JSON object carrying
/// the expected top-level `modes` field. The firmware never parses the
/// rest.
pub fn is_valid_config_doc(doc: &str) -> bool {
    let doc = doc.trim();
    doc.len() >= 2
        && doc.starts_with('{')
        && doc.ends_with('}')
        && doc.contains("\"modes\"")
}

/// Structured reason a provisioning join attempt failed, surfaced to the
/// portal client.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum JoinFailure {
    NoSuchNetwork,
    AuthFailed,
    Timeout,
}

impl JoinFailure {
    pub fn code(self) -> &'static str {
        match self {
            Self::NoSuchNetwork => "NO_SSID",
            Self::AuthFailed => "AUTH_FAIL",
            Self::Timeout => "TIMEOUT",
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::NoSuchNetwork => "Network not found",
            Self::AuthFailed => "Wrong password",
            Self::Timeout => "Connection timed out, try again",
        }
    }
}

/// Where an incoming portal request is dispatched.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Route {
    Home,
    Scan,
    Info,
    SaveWifi,
    SaveConfig,
    Restart,
    /// Captive-portal probe: answer 204 so the OS does not pop a browser
    /// over an already-open portal page.
    Probe,
    /// Icon/image side requests: plain 404.
    NotFound,
    /// Everything else redirects to the portal root.
    Redirect,
}

const PROBE_PATHS: [&str; 6] = [
    "/generate_204",
    "/gen_204",
    "/hotspot-detect.html",
    "/canonical.html",
    "/success.txt",
    "/ncsi.txt",
];

pub fn route(method: &str, path: &str) -> Route {
    let path = path.split('?').next().unwrap_or(path);
    match (method, path) {
        ("GET", "/") => Route::Home,
        ("GET", "/scan") => Route::Scan,
        ("GET", "/info") => Route::Info,
        ("POST", "/save_wifi") => Route::SaveWifi,
        ("POST", "/save_config") => Route::SaveConfig,
        ("POST", "/restart") => Route::Restart,
        _ if PROBE_PATHS.contains(&path) => Route::Probe,
        _ if path.ends_with(".ico") || path.ends_with(".png") || path.ends_with(".jpg") => {
            Route::NotFound
        }
        _ => Route::Redirect,
    }
}

/// Parses the request line of an HTTP request head into method and path.
pub fn parse_request_line(head: &str) -> Option<(&str, &str)> {
    let line = head.lines().next()?;
    let mut parts = line.split_ascii_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    if !path.starts_with('/') {
        return None;
    }
    Some((method, path))
}

/// Extracts one `application/x-www-form-urlencoded` field, percent- and
/// plus-decoded. Returns `None` when the key is absent.
pub fn form_value<const N: usize>(body: &str, key: &str) -> Option<String<N>> {
    for pair in body.split('&') {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        if k != key {
            continue;
        }

        let mut out = String::new();
        let bytes = v.as_bytes();
        let mut i = 0;
        // Percent-decoding works on bytes; multi-byte UTF-8 arrives as
        // consecutive %XX escapes.
        let mut decoded = heapless::Vec::<u8, N>::new();
        while i < bytes.len() {
            let b = match bytes[i] {
                b'+' => {
                    i += 1;
                    b' '
                }
                b'%' => {
                    // A malformed escape fails the whole field.
                    let hi = hex_nibble(*bytes.get(i + 1)?)?;
                    let lo = hex_nibble(*bytes.get(i + 2)?)?;
                    i += 3;
                    (hi << 4) | lo
                }
                other => {
                    i += 1;
                    other
                }
            };
            decoded.push(b).ok()?;
        }
        let text = core::str::from_utf8(&decoded).ok()?;
        out.push_str(text).ok()?;
        return Some(out);
    }
    None
}

fn hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Provisioning AP name: fixed prefix plus the hardware-address suffix.
pub fn ap_name(mac: &[u8; 6]) -> String<AP_NAME_MAX> {
    let mut name = String::new();
    let _ = write!(name, "Glance-{:02X}{:02X}", mac[4], mac[5]);
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizers_strip_markup_and_trim() {
        let url: String<64> = sanitize_input("  http://h/<script>  ");
        assert_eq!(url.as_str(), "http://h/script");

        let pass: String<64> = sanitize_text(r#"pa"ss'&\word"#);
        assert_eq!(pass.as_str(), "password");
    }

    #[test]
    fn ssid_sanitizer_drops_control_characters_keeps_utf8() {
        let ssid = sanitize_ssid("caf\u{e9} \x07shed\x1b");
        assert_eq!(ssid.as_str(), "caf\u{e9} shed");
    }

    #[test]
    fn sanitizers_cap_length() {
        let long = "a".repeat(100);
        let ssid = sanitize_ssid(&long);
        assert_eq!(ssid.len(), SSID_MAX);
    }

    #[test]
    fn server_url_requires_scheme_and_loses_trailing_slashes() {
        assert_eq!(
            normalize_server_url("http://192.168.1.5:8080///").unwrap().as_str(),
            "http://192.168.1.5:8080"
        );
        assert!(normalize_server_url("https://glance.example").is_some());
        assert!(normalize_server_url("ftp://x").is_none());
        assert!(normalize_server_url("192.168.1.5").is_none());
    }

    #[test]
    fn config_doc_must_be_an_object_with_modes() {
        assert!(is_valid_config_doc(r#"{"modes":["zen"]}"#));
        assert!(is_valid_config_doc(" {\"modes\":[]} "));
        assert!(!is_valid_config_doc(r#"["modes"]"#));
        assert!(!is_valid_config_doc(r#"{"mode":[]}"#));
        assert!(!is_valid_config_doc("{"));
    }

    #[test]
    fn routing_covers_endpoints_probes_assets_and_redirect() {
        assert_eq!(route("GET", "/"), Route::Home);
        assert_eq!(route("GET", "/scan"), Route::Scan);
        assert_eq!(route("GET", "/info"), Route::Info);
        assert_eq!(route("POST", "/save_wifi"), Route::SaveWifi);
        assert_eq!(route("POST", "/save_config"), Route::SaveConfig);
        assert_eq!(route("POST", "/restart"), Route::Restart);
        assert_eq!(route("GET", "/generate_204"), Route::Probe);
        assert_eq!(route("GET", "/hotspot-detect.html"), Route::Probe);
        assert_eq!(route("GET", "/favicon.ico"), Route::NotFound);
        assert_eq!(route("GET", "/anything/else"), Route::Redirect);
        // Wrong method on a known path falls through to the redirect.
        assert_eq!(route("GET", "/save_wifi"), Route::Redirect);
        // Query strings do not defeat routing.
        assert_eq!(route("GET", "/scan?x=1"), Route::Scan);
    }

    #[test]
    fn request_line_parses_method_and_path() {
        assert_eq!(
            parse_request_line("POST /save_wifi HTTP/1.1\r\nHost: x\r\n"),
            Some(("POST", "/save_wifi"))
        );
        assert_eq!(parse_request_line("GARBAGE"), None);
    }

    #[test]
    fn form_values_decode_plus_and_percent_escapes() {
        let body = "ssid=My+Caf%C3%A9&pass=p%26w&server=http%3A%2F%2Fh%3A81";
        let ssid: String<32> = form_value(body, "ssid").unwrap();
        assert_eq!(ssid.as_str(), "My Caf\u{e9}");
        let pass: String<64> = form_value(body, "pass").unwrap();
        assert_eq!(pass.as_str(), "p&w");
        let server: String<64> = form_value(body, "server").unwrap();
        assert_eq!(server.as_str(), "http://h:81");
        assert!(form_value::<8>(body, "missing").is_none());
    }

    #[test]
    fn ap_name_uses_the_address_suffix() {
        let name = ap_name(&[0xA1, 0xB2, 0xC3, 0xD4, 0xE5, 0x0F]);
        assert_eq!(name.as_str(), "Glance-E50F");
    }

    #[test]
    fn join_failure_reasons_are_structured() {
        assert_eq!(JoinFailure::NoSuchNetwork.code(), "NO_SSID");
        assert_eq!(JoinFailure::AuthFailed.code(), "AUTH_FAIL");
        assert_eq!(JoinFailure::Timeout.code(), "TIMEOUT");
    }
}
