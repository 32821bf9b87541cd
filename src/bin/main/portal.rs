// Provisioning service: access point, captive-portal web server, DNS
// redirector and a minimal DHCP responder, multiplexed over two network
// stacks (AP side for the portal, station side for the post-join config
// forward). Terminal for the boot cycle: every exit path is a restart.
//
// Route decisions, sanitization and packet codecs live in
// `glance_core::portal` / `dns` / `dhcp`; this module owns the sockets.

use core::fmt::Write as FmtWrite;
use core::net::Ipv4Addr;

use embassy_futures::join::{join, join4};
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpEndpoint, IpListenEndpoint, Ipv4Cidr, Stack, StaticConfigV4, tcp::TcpSocket};
use embassy_time::{Duration, Instant, Timer, WithTimeout};
use embedded_io_async::Write as AsyncWrite;
use esp_radio::wifi::{
    AccessPointConfig, AuthMethod, ClientConfig, ModeConfig, ScanConfig, WifiController,
};
use heapless::String;
use log::{info, warn};
use static_cell::StaticCell;

use glance_core::config::{ConfigStore, DeviceConfig, PASS_MAX, SSID_MAX};
use glance_core::portal::{
    self, CONFIG_FIELD_MAX, JoinFailure, Route, form_value, parse_request_line,
};
use glance_core::request::{device_id, parse_server_url};
use glance_core::{dhcp, dns};
use glance_hal_esp32c3::storage::FlashConfigStore;

use crate::net::{self, WIFI_CONNECT_TIMEOUT_MS};

const PORTAL_HTML: &str = include_str!("../../../data/portal.html");

const AP_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 4, 1);
const PORTAL_URL: &str = "http://192.168.4.1/";

/// Grace period between a config save and the scheduled restart; gives
/// the client time to show its confirmation. `/restart` pre-empts it,
/// a later save re-arms it.
const DEFERRED_RESTART_SECS: u64 = 30;

const REQUEST_MAX: usize = 4096;
const SCAN_LIMIT: usize = 16;

static AP_RESOURCES: StaticCell<embassy_net::StackResources<8>> = StaticCell::new();
static STA_RESOURCES: StaticCell<embassy_net::StackResources<4>> = StaticCell::new();
static RADIO: StaticCell<esp_radio::Controller<'static>> = StaticCell::new();

/// Runs the provisioning portal forever (until a restart).
pub async fn run_portal(
    wifi: esp_hal::peripherals::WIFI<'static>,
    mut config: DeviceConfig,
    mut store: Option<FlashConfigStore>,
    mac: [u8; 6],
    battery: &mut dyn FnMut() -> u32,
) -> ! {
    let ap_name = portal::ap_name(&mac);
    info!("portal: starting AP '{}'", ap_name);

    let radio = match esp_radio::init() {
        Ok(radio) => radio,
        Err(err) => {
            warn!("portal: radio init failed: {:?}", err);
            halt().await
        }
    };
    let radio: &'static esp_radio::Controller<'static> = RADIO.init(radio);

    let (mut controller, interfaces) =
        match esp_radio::wifi::new(radio, wifi, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("portal: wifi init failed: {:?}", err);
                halt().await
            }
        };

    let ap_config = AccessPointConfig::default().with_ssid(ap_name.as_str().into());
    if let Err(err) =
        controller.set_config(&ModeConfig::ApSta(ClientConfig::default(), ap_config.clone()))
    {
        warn!("portal: mode config failed: {:?}", err);
        halt().await
    }
    if let Err(err) = controller.start_async().await {
        warn!("portal: wifi start failed: {:?}", err);
        halt().await
    }

    let rng = esp_hal::rng::Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;

    let mut dns_servers = heapless::Vec::new();
    let _ = dns_servers.push(AP_IP);
    let ap_net_config = embassy_net::Config::ipv4_static(StaticConfigV4 {
        address: Ipv4Cidr::new(AP_IP, 24),
        gateway: Some(AP_IP),
        dns_servers,
    });
    let (ap_stack, mut ap_runner) = embassy_net::new(
        interfaces.ap,
        ap_net_config,
        AP_RESOURCES.init(embassy_net::StackResources::new()),
        seed,
    );

    let sta_net_config = embassy_net::Config::dhcpv4(Default::default());
    let (sta_stack, mut sta_runner) = embassy_net::new(
        interfaces.sta,
        sta_net_config,
        STA_RESOURCES.init(embassy_net::StackResources::new()),
        seed ^ 0x9E37_79B9,
    );

    info!("portal: serving at {}", PORTAL_URL);

    join4(
        ap_runner.run(),
        sta_runner.run(),
        http_loop(
            ap_stack,
            sta_stack,
            &mut controller,
            &ap_config,
            &mut config,
            &mut store,
            mac,
            battery,
        ),
        join(dns_loop(ap_stack), dhcp_loop(ap_stack)),
    )
    .await;
    unreachable!()
}

async fn halt() -> ! {
    loop {
        Timer::after_secs(1).await;
    }
}

// ── HTTP ────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn http_loop(
    ap_stack: Stack<'_>,
    sta_stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    ap_config: &AccessPointConfig,
    config: &mut DeviceConfig,
    store: &mut Option<FlashConfigStore>,
    mac: [u8; 6],
    battery: &mut dyn FnMut() -> u32,
) -> ! {
    let mut rx_buf = [0u8; 2048];
    let mut tx_buf = [0u8; 2048];
    let mut request = [0u8; REQUEST_MAX];
    let mut restart_at: Option<Instant> = None;
    let mut sta_joined = false;

    loop {
        if let Some(at) = restart_at
            && Instant::now() >= at
        {
            info!("portal: deferred restart");
            Timer::after_millis(200).await;
            esp_hal::system::software_reset();
        }

        let mut socket = TcpSocket::new(ap_stack, &mut rx_buf, &mut tx_buf);
        socket.set_timeout(Some(Duration::from_secs(10)));

        let accepted = socket
            .accept(IpListenEndpoint {
                addr: None,
                port: 80,
            })
            .with_timeout(Duration::from_secs(1))
            .await;
        match accepted {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                Timer::after_millis(100).await;
                continue;
            }
            // Accept timeout: loop back to poll the restart deadline.
            Err(_) => continue,
        }

        let Some(len) = read_request(&mut socket, &mut request).await else {
            finish(&mut socket).await;
            continue;
        };

        let (head, body) = split_request(&request[..len]);
        let Some((method, path)) = parse_request_line(head) else {
            finish(&mut socket).await;
            continue;
        };
        info!("portal: {} {}", method, path);

        match portal::route(method, path) {
            Route::Home => {
                respond(&mut socket, "200 OK", "text/html", PORTAL_HTML).await;
            }
            Route::Scan => {
                let json = scan_json(controller).await;
                respond(&mut socket, "200 OK", "application/json", &json).await;
            }
            Route::Info => {
                let json = info_json(mac, battery(), config);
                respond(&mut socket, "200 OK", "application/json", &json).await;
            }
            Route::SaveWifi => {
                let json = handle_save_wifi(
                    controller, ap_config, config, store, body, &mut sta_joined,
                )
                .await;
                respond(&mut socket, "200 OK", "application/json", &json).await;
            }
            Route::SaveConfig => {
                let json = handle_save_config(
                    sta_stack,
                    config,
                    store,
                    mac,
                    body,
                    sta_joined,
                    &mut restart_at,
                )
                .await;
                respond(&mut socket, "200 OK", "application/json", &json).await;
            }
            Route::Restart => {
                respond(&mut socket, "200 OK", "application/json", r#"{"ok":true}"#).await;
                info!("portal: manual restart");
                Timer::after_millis(500).await;
                esp_hal::system::software_reset();
            }
            Route::Probe => {
                respond(&mut socket, "204 No Content", "text/plain", "").await;
            }
            Route::NotFound => {
                respond(&mut socket, "404 Not Found", "text/plain", "").await;
            }
            Route::Redirect => {
                redirect(&mut socket).await;
            }
        }

        finish(&mut socket).await;
    }
}

/// Reads the request head and, for POSTs, enough body to satisfy
/// Content-Length (bounded by the request buffer).
async fn read_request(socket: &mut TcpSocket<'_>, buf: &mut [u8]) -> Option<usize> {
    let mut filled = 0usize;
    let mut head_end = None;

    loop {
        if filled == buf.len() {
            return Some(filled);
        }
        let n = match socket.read(&mut buf[filled..]).await {
            Ok(0) => return (filled > 0).then_some(filled),
            Ok(n) => n,
            Err(_) => return None,
        };
        filled += n;

        if head_end.is_none() {
            head_end = buf[..filled]
                .windows(4)
                .position(|w| w == b"\r\n\r\n")
                .map(|at| at + 4);
        }

        if let Some(end) = head_end {
            let head = core::str::from_utf8(&buf[..end]).ok()?;
            let content_length = head
                .lines()
                .find_map(|line| {
                    let (name, value) = line.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            let wanted = (end + content_length).min(buf.len());
            if filled >= wanted {
                return Some(filled);
            }
        }
    }
}

fn split_request(request: &[u8]) -> (&str, &str) {
    let boundary = request
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
        .unwrap_or(request.len());
    let head = core::str::from_utf8(&request[..boundary]).unwrap_or("");
    let body = core::str::from_utf8(&request[boundary..]).unwrap_or("");
    (head, body)
}

async fn respond(socket: &mut TcpSocket<'_>, status: &str, content_type: &str, body: &str) {
    let mut head: String<160> = String::new();
    let _ = write!(
        head,
        "HTTP/1.0 {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    if !body.is_empty() {
        let _ = socket.write_all(body.as_bytes()).await;
    }
}

async fn redirect(socket: &mut TcpSocket<'_>) {
    let mut head: String<160> = String::new();
    let _ = write!(
        head,
        "HTTP/1.0 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        PORTAL_URL
    );
    let _ = socket.write_all(head.as_bytes()).await;
}

async fn finish(socket: &mut TcpSocket<'_>) {
    let _ = socket.flush().await;
    Timer::after_millis(50).await;
    socket.close();
    Timer::after_millis(50).await;
    socket.abort();
}

// ── Handlers ────────────────────────────────────────────────────────────

async fn scan_json(controller: &mut WifiController<'static>) -> String<1536> {
    let mut json: String<1536> = String::new();
    let _ = json.push_str("{\"networks\":[");

    match controller
        .scan_with_config_async(ScanConfig::default().with_max(SCAN_LIMIT))
        .await
    {
        Ok(networks) => {
            info!("portal: scan found {} networks", networks.len());
            let mut first = true;
            for ap in networks.iter() {
                let secure = !matches!(ap.auth_method, Some(AuthMethod::None));
                let mut entry: String<96> = String::new();
                let _ = entry.push_str(if first { "{" } else { ",{" });
                let _ = entry.push_str("\"ssid\":\"");
                for c in ap.ssid.chars() {
                    if c == '"' || c == '\\' || c.is_control() {
                        continue;
                    }
                    if entry.push(c).is_err() {
                        break;
                    }
                }
                let _ = write!(
                    entry,
                    "\",\"rssi\":{},\"secure\":{}}}",
                    ap.signal_strength, secure
                );
                if json.push_str(&entry).is_err() {
                    break;
                }
                first = false;
            }
        }
        Err(err) => warn!("portal: scan failed: {:?}", err),
    }

    let _ = json.push_str("]}");
    json
}

fn info_json(mac: [u8; 6], battery_mv: u32, config: &DeviceConfig) -> String<320> {
    let mut json: String<320> = String::new();
    let _ = write!(
        json,
        "{{\"device_id\":\"{}\",\"battery\":\"{}.{:02}V\",\"server_url\":\"{}\"}}",
        device_id(&mac),
        battery_mv / 1000,
        battery_mv % 1000 / 10,
        config.server
    );
    json
}

async fn handle_save_wifi(
    controller: &mut WifiController<'static>,
    ap_config: &AccessPointConfig,
    config: &mut DeviceConfig,
    store: &mut Option<FlashConfigStore>,
    body: &str,
    sta_joined: &mut bool,
) -> String<192> {
    let ssid = form_value::<SSID_MAX>(body, "ssid")
        .map(|raw| portal::sanitize_ssid(&raw))
        .unwrap_or_default();
    let pass = form_value::<PASS_MAX>(body, "pass")
        .map(|raw| portal::sanitize_pass(&raw))
        .unwrap_or_default();

    if ssid.is_empty() {
        return failure_json("EMPTY_SSID", "SSID empty");
    }

    if let Some(raw_server) = form_value::<{ glance_core::config::SERVER_MAX }>(body, "server")
        && !raw_server.trim().is_empty()
    {
        let Some(server) = portal::normalize_server_url(&raw_server) else {
            return failure_json(
                "BAD_URL",
                "Server address must start with http:// or https://",
            );
        };
        config.server = server;
        info!("portal: server saved: {}", config.server);
    }

    match join_network(controller, ap_config, &ssid, &pass).await {
        Ok(()) => {
            config.ssid = ssid;
            config.pass = pass;
            persist(store, config);
            *sta_joined = true;
            info!("portal: wifi credentials saved");
            String::try_from(r#"{"ok":true}"#).unwrap()
        }
        Err(failure) => {
            warn!("portal: join failed: {}", failure.code());
            failure_json(failure.code(), failure.message())
        }
    }
}

/// Attempts the association with the AP kept up, classifying failures
/// for the client.
async fn join_network(
    controller: &mut WifiController<'static>,
    ap_config: &AccessPointConfig,
    ssid: &str,
    pass: &str,
) -> Result<(), JoinFailure> {
    let found = match controller
        .scan_with_config_async(ScanConfig::default().with_max(SCAN_LIMIT))
        .await
    {
        Ok(list) => list.iter().any(|ap| ap.ssid == ssid),
        // A failed scan must not block the attempt.
        Err(_) => true,
    };
    if !found {
        return Err(JoinFailure::NoSuchNetwork);
    }

    let client = ClientConfig::default()
        .with_ssid(ssid.into())
        .with_password(pass.into());
    if controller
        .set_config(&ModeConfig::ApSta(client, ap_config.clone()))
        .is_err()
    {
        return Err(JoinFailure::Timeout);
    }

    match controller
        .connect_async()
        .with_timeout(Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS))
        .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(_)) => {
            let _ = controller.disconnect_async().await;
            Err(JoinFailure::AuthFailed)
        }
        Err(_) => {
            let _ = controller.disconnect_async().await;
            Err(JoinFailure::Timeout)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_save_config(
    sta_stack: Stack<'_>,
    config: &mut DeviceConfig,
    store: &mut Option<FlashConfigStore>,
    mac: [u8; 6],
    body: &str,
    sta_joined: bool,
    restart_at: &mut Option<Instant>,
) -> String<192> {
    let Some(raw) = form_value::<CONFIG_FIELD_MAX>(body, "config") else {
        return failure_json("EMPTY_CONFIG", "Config empty");
    };
    let doc = portal::sanitize_input::<CONFIG_FIELD_MAX>(&raw);

    if doc.is_empty() {
        return failure_json("EMPTY_CONFIG", "Config empty");
    }
    if !portal::is_valid_config_doc(&doc) {
        return failure_json("BAD_CONFIG", "Invalid config format");
    }
    if !config.set_content_doc(&doc) {
        return failure_json("BAD_CONFIG", "Config too large");
    }

    persist(store, config);
    info!(
        "portal: content config saved, sleep interval {} min",
        config.sleep_minutes
    );

    // Best-effort forward so the backend sees the new document before
    // the device's first fetch.
    if sta_joined && sta_stack.config_v4().is_some() {
        forward_config(sta_stack, config, mac).await;
    }

    *restart_at = Some(Instant::now() + Duration::from_secs(DEFERRED_RESTART_SECS));
    info!(
        "portal: restart scheduled in {}s (or sooner via /restart)",
        DEFERRED_RESTART_SECS
    );

    String::try_from(r#"{"ok":true}"#).unwrap()
}

async fn forward_config(sta_stack: Stack<'_>, config: &DeviceConfig, mac: [u8; 6]) {
    let Some(server) = parse_server_url(&config.server) else {
        return;
    };
    let Some(body) = config_with_device_id(&config.content_doc, mac) else {
        return;
    };

    match net::post_json(sta_stack, &server, "/config", &body).await {
        Ok(status) => info!("portal: POST /config -> {}", status),
        Err(err) => warn!("portal: config forward failed: {:?}", err),
    }
}

/// Injects the device identifier as the first field of the document.
fn config_with_device_id(
    doc: &str,
    mac: [u8; 6],
) -> Option<String<{ CONFIG_FIELD_MAX + 64 }>> {
    let rest = doc.strip_prefix('{')?;
    let mut body: String<{ CONFIG_FIELD_MAX + 64 }> = String::new();
    write!(body, "{{\"device_id\":\"{}\",", device_id(&mac)).ok()?;
    body.push_str(rest).ok()?;
    Some(body)
}

fn persist(store: &mut Option<FlashConfigStore>, config: &DeviceConfig) {
    match store {
        Some(store) => {
            if let Err(err) = store.save(config) {
                warn!("portal: config save failed: {:?}", err);
            }
        }
        None => warn!("portal: storage unavailable, settings are volatile"),
    }
}

fn failure_json(code: &str, msg: &str) -> String<192> {
    let mut json: String<192> = String::new();
    let _ = write!(json, "{{\"ok\":false,\"reason\":\"{}\",\"msg\":\"{}\"}}", code, msg);
    json
}

// ── DNS redirector ──────────────────────────────────────────────────────

async fn dns_loop(stack: Stack<'_>) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buf = [0u8; 512];
    let mut tx_buf = [0u8; 512];
    let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
    socket.bind(53).expect("dns bind");

    let mut query = [0u8; 256];
    let mut answer = [0u8; 320];
    loop {
        let Ok((len, meta)) = socket.recv_from(&mut query).await else {
            continue;
        };
        if let Some(out_len) = dns::answer_query(&query[..len], AP_IP.octets(), &mut answer) {
            let _ = socket.send_to(&answer[..out_len], meta.endpoint).await;
        }
    }
}

// ── DHCP responder ──────────────────────────────────────────────────────

async fn dhcp_loop(stack: Stack<'_>) -> ! {
    let mut rx_meta = [PacketMetadata::EMPTY; 4];
    let mut tx_meta = [PacketMetadata::EMPTY; 4];
    let mut rx_buf = [0u8; 1024];
    let mut tx_buf = [0u8; 1024];
    let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
    socket.bind(67).expect("dhcp bind");

    let mut message = [0u8; 576];
    let mut reply = [0u8; dhcp::REPLY_LEN];
    loop {
        let Ok((len, _meta)) = socket.recv_from(&mut message).await else {
            continue;
        };
        if let Some(out_len) = dhcp::handle_message(&message[..len], AP_IP.octets(), &mut reply) {
            // Replies go to the broadcast address: the client does not
            // own its offered address yet.
            let broadcast = IpEndpoint::new(
                embassy_net::IpAddress::Ipv4(Ipv4Addr::new(255, 255, 255, 255)),
                68,
            );
            let _ = socket.send_to(&reply[..out_len], broadcast).await;
        }
    }
}
