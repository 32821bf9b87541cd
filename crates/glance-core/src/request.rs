//! Backend request-path building and server-address parsing.

use core::fmt::Write;

use heapless::String;

use ssd1683::protocol::{HEIGHT, WIDTH};

pub const PATH_MAX: usize = 192;

/// Split form of the persisted server base URL.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ServerAddress<'a> {
    pub host: &'a str,
    pub port: u16,
    /// Path prefix of the base URL, without a trailing slash ("" when
    /// the server lives at the root).
    pub base_path: &'a str,
}

/// Parses `http://host[:port][/base]` into its parts. TLS endpoints are
/// not supported by the fetch path, so an `https://` address is
/// rejected here rather than failing mid-stream.
pub fn parse_server_url(url: &str) -> Option<ServerAddress<'_>> {
    let rest = url.strip_prefix("http://")?;

    let (hostport, base_path) = match rest.find('/') {
        Some(at) => (&rest[..at], rest[at..].trim_end_matches('/')),
        None => (rest, ""),
    };
    if hostport.is_empty() {
        return None;
    }

    match hostport.split_once(':') {
        Some((host, port)) if !host.is_empty() => Some(ServerAddress {
            host,
            port: port.parse().ok()?,
            base_path,
        }),
        Some(_) => None,
        None => Some(ServerAddress {
            host: hostport,
            port: 80,
            base_path,
        }),
    }
}

/// Builds the image-fetch request path. Voltage travels as volts with two
/// decimals; `next` asks the backend to advance to the next content mode.
pub fn render_path(
    voltage_mv: u32,
    device_id: &str,
    rssi_dbm: i32,
    next_mode: bool,
) -> String<PATH_MAX> {
    let mut path = String::new();
    let _ = write!(
        path,
        "/render?voltage={}.{:02}&device_id={}&rssi={}&width={}&height={}",
        voltage_mv / 1000,
        voltage_mv % 1000 / 10,
        device_id,
        rssi_dbm,
        WIDTH,
        HEIGHT,
    );
    if next_mode {
        let _ = path.push_str("&next=1");
    }
    path
}

/// Formats a hardware address as the colon-free device identifier used in
/// request paths, telemetry bodies and the provisioning AP name.
pub fn device_id(mac: &[u8; 6]) -> String<12> {
    let mut id = String::new();
    for byte in mac {
        let _ = write!(id, "{:02X}", byte);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_url_with_port_parses() {
        let addr = parse_server_url("http://192.168.3.30:8080").unwrap();
        assert_eq!(addr.host, "192.168.3.30");
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.base_path, "");
    }

    #[test]
    fn server_url_defaults_to_port_80_and_drops_trailing_slash() {
        let addr = parse_server_url("http://glance.lan/").unwrap();
        assert_eq!(addr.host, "glance.lan");
        assert_eq!(addr.port, 80);
        assert_eq!(addr.base_path, "");
    }

    #[test]
    fn server_url_keeps_a_base_path() {
        let addr = parse_server_url("http://gateway:8080/glance/").unwrap();
        assert_eq!(addr.host, "gateway");
        assert_eq!(addr.port, 8080);
        assert_eq!(addr.base_path, "/glance");
    }

    #[test]
    fn https_and_garbage_are_rejected() {
        assert!(parse_server_url("https://example.com").is_none());
        assert!(parse_server_url("example.com").is_none());
        assert!(parse_server_url("http://").is_none());
        assert!(parse_server_url("http://:8080").is_none());
        assert!(parse_server_url("http://host:notaport").is_none());
    }

    #[test]
    fn render_path_encodes_telemetry() {
        let path = render_path(3_920, "A1B2C3D4E5F6", -67, false);
        assert_eq!(
            path.as_str(),
            "/render?voltage=3.92&device_id=A1B2C3D4E5F6&rssi=-67&width=400&height=300"
        );
    }

    #[test]
    fn next_mode_appends_the_flag() {
        let path = render_path(4_100, "A1B2C3D4E5F6", -40, true);
        assert!(path.as_str().ends_with("&next=1"));
    }

    #[test]
    fn voltage_pads_fractional_digits() {
        let path = render_path(3_005, "AA", 0, false);
        assert!(path.as_str().contains("voltage=3.00&"));
    }

    #[test]
    fn device_id_is_uppercase_hex() {
        let id = device_id(&[0xA1, 0xB2, 0xC3, 0x04, 0xE5, 0xF6]);
        assert_eq!(id.as_str(), "A1B2C304E5F6");
    }
}
