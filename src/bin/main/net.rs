// Network pipeline: station association, the streamed image fetch, the
// best-effort telemetry POSTs and the SNTP clock query.
//
// The HTTP client is hand-rolled over a TcpSocket: every request here is
// a one-shot exchange against a known host, so a full client stack would
// buy nothing. Each blocking point carries an explicit bounded timeout;
// there is no cancellation anywhere in the pipeline.

use core::fmt::Write as FmtWrite;
use core::net::Ipv4Addr;

use embassy_net::dns::DnsQueryType;
use embassy_net::udp::{PacketMetadata, UdpSocket};
use embassy_net::{IpAddress, Stack, tcp::TcpSocket};
use embassy_time::{Duration, WithTimeout};
use embedded_io_async::Write as AsyncWrite;
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use heapless::String;
use log::{debug, info, warn};

use glance_core::bitmap::{BitmapError, FrameAssembler};
use glance_core::request::ServerAddress;
use ssd1683::FrameBuffer;

pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 15_000;
const DHCP_TIMEOUT_MS: u64 = 15_000;
/// Idle timeout for every socket read during a fetch; a stream that
/// stalls longer than this is a failed fetch.
const HTTP_READ_TIMEOUT_MS: u64 = 10_000;
const SNTP_TIMEOUT_MS: u64 = 5_000;
const SNTP_SERVER: &str = "pool.ntp.org";
// time.cloudflare.com; used when DNS is unavailable.
const SNTP_FALLBACK: Ipv4Addr = Ipv4Addr::new(162, 159, 200, 1);
const SNTP_PORT: u16 = 123;

const HEAD_MAX: usize = 1024;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectError {
    /// Not associated (or no address) within the timeout.
    Timeout,
    /// The radio rejected the attempt outright.
    Radio,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchError {
    Dns,
    Connect,
    Socket,
    /// Non-success HTTP status.
    Status(u16),
    /// Malformed response head or bitmap header.
    Header,
    /// Stream ended or stalled before the frame completed.
    Truncated,
}

/// Associates to the configured network and waits for an address.
pub async fn connect_station(
    controller: &mut WifiController<'static>,
    stack: Stack<'_>,
    ssid: &str,
    password: &str,
) -> Result<(), ConnectError> {
    info!("wifi: connecting to '{}'", ssid);

    let client = ClientConfig::default()
        .with_ssid(ssid.into())
        .with_password(password.into());
    controller
        .set_config(&ModeConfig::Client(client))
        .map_err(|_| ConnectError::Radio)?;

    if !controller.is_started().unwrap_or(false) {
        controller
            .start_async()
            .await
            .map_err(|_| ConnectError::Radio)?;
    }

    match controller
        .connect_async()
        .with_timeout(Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS))
        .await
    {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            warn!("wifi: connect failed: {:?}", err);
            return Err(ConnectError::Radio);
        }
        Err(_) => return Err(ConnectError::Timeout),
    }

    stack
        .wait_config_up()
        .with_timeout(Duration::from_millis(DHCP_TIMEOUT_MS))
        .await
        .map_err(|_| ConnectError::Timeout)?;

    info!("wifi: associated, dhcp ready");
    Ok(())
}

/// Drops the association and powers the radio down for sleep.
pub async fn shutdown_station(controller: &mut WifiController<'static>) {
    let _ = controller.disconnect_async().await;
    let _ = controller.stop_async().await;
}

async fn resolve(stack: Stack<'_>, host: &str) -> Option<IpAddress> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        return Some(IpAddress::Ipv4(ip));
    }
    let addrs = stack.dns_query(host, DnsQueryType::A).await.ok()?;
    addrs.first().copied()
}

/// Streams `GET <path>` into `staging` through the frame assembler.
///
/// The staging frame may be torn after an error; callers commit it to
/// the live frame only on `Ok`.
pub async fn fetch_image(
    stack: Stack<'_>,
    server: &ServerAddress<'_>,
    path: &str,
    staging: &mut FrameBuffer,
) -> Result<(), FetchError> {
    let addr = resolve(stack, server.host).await.ok_or(FetchError::Dns)?;

    let mut rx_buf = [0u8; 1536];
    let mut tx_buf = [0u8; 1536];
    let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
    socket.set_timeout(Some(Duration::from_millis(HTTP_READ_TIMEOUT_MS)));

    socket
        .connect((addr, server.port))
        .await
        .map_err(|_| FetchError::Connect)?;

    let mut request: String<320> = String::new();
    let _ = write!(
        request,
        "GET {}{} HTTP/1.0\r\nHost: {}\r\nConnection: close\r\n\r\n",
        server.base_path, path, server.host
    );
    socket
        .write_all(request.as_bytes())
        .await
        .map_err(|_| FetchError::Socket)?;

    // Read the response head, keeping whatever body bytes follow it.
    let mut head = [0u8; HEAD_MAX];
    let mut filled = 0usize;
    let body_start = loop {
        if filled == head.len() {
            return Err(FetchError::Header);
        }
        let n = socket
            .read(&mut head[filled..])
            .await
            .map_err(|_| FetchError::Socket)?;
        if n == 0 {
            return Err(FetchError::Header);
        }
        filled += n;
        if let Some(at) = find_blank_line(&head[..filled]) {
            break at;
        }
    };

    let status = parse_status(&head[..body_start]).ok_or(FetchError::Header)?;
    if status != 200 {
        warn!("fetch: http status {}", status);
        return Err(FetchError::Status(status));
    }

    let mut assembler = FrameAssembler::new();
    push_chunk(&mut assembler, &head[body_start..filled], staging)?;

    let mut chunk = [0u8; 1536];
    while !assembler.is_complete() {
        let n = socket
            .read(&mut chunk)
            .await
            .map_err(|_| FetchError::Truncated)?;
        if n == 0 {
            // Peer closed before every row arrived.
            return Err(FetchError::Truncated);
        }
        push_chunk(&mut assembler, &chunk[..n], staging)?;
    }

    socket.close();
    debug!("fetch: frame complete ({} rows)", assembler.rows_done());
    Ok(())
}

fn push_chunk(
    assembler: &mut FrameAssembler,
    chunk: &[u8],
    staging: &mut FrameBuffer,
) -> Result<(), FetchError> {
    assembler.push(chunk, staging).map_err(|err| match err {
        BitmapError::BadHeader => FetchError::Header,
    })
}

fn find_blank_line(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|at| at + 4)
}

fn parse_status(head: &[u8]) -> Option<u16> {
    let text = core::str::from_utf8(head).ok()?;
    let line = text.lines().next()?;
    line.split_ascii_whitespace().nth(1)?.parse().ok()
}

/// Fire-and-forget JSON POST; the status code is returned for logging
/// but failures are never retried here.
pub async fn post_json(
    stack: Stack<'_>,
    server: &ServerAddress<'_>,
    path: &str,
    body: &str,
) -> Result<u16, FetchError> {
    let addr = resolve(stack, server.host).await.ok_or(FetchError::Dns)?;

    let mut rx_buf = [0u8; 1024];
    let mut tx_buf = [0u8; 1024];
    let mut socket = TcpSocket::new(stack, &mut rx_buf, &mut tx_buf);
    socket.set_timeout(Some(Duration::from_millis(HTTP_READ_TIMEOUT_MS)));

    socket
        .connect((addr, server.port))
        .await
        .map_err(|_| FetchError::Connect)?;

    let mut head: String<320> = String::new();
    let _ = write!(
        head,
        "POST {}{} HTTP/1.0\r\nHost: {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        server.base_path,
        path,
        server.host,
        body.len()
    );
    socket
        .write_all(head.as_bytes())
        .await
        .map_err(|_| FetchError::Socket)?;
    socket
        .write_all(body.as_bytes())
        .await
        .map_err(|_| FetchError::Socket)?;

    let mut response = [0u8; 256];
    let mut filled = 0usize;
    loop {
        match socket.read(&mut response[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                filled += n;
                if response[..filled].windows(2).any(|w| w == b"\r\n") || filled == response.len()
                {
                    break;
                }
            }
        }
    }
    socket.close();

    parse_status(&response[..filled]).ok_or(FetchError::Header)
}

/// One SNTP exchange. Returns NTP-era seconds, or `None` on any failure
/// so the caller can fall back to the clock baseline.
pub async fn sntp_query(stack: Stack<'_>) -> Option<u32> {
    let server = match resolve(stack, SNTP_SERVER).await {
        Some(addr) => addr,
        None => IpAddress::Ipv4(SNTP_FALLBACK),
    };

    let mut rx_meta = [PacketMetadata::EMPTY; 2];
    let mut tx_meta = [PacketMetadata::EMPTY; 2];
    let mut rx_buf = [0u8; 128];
    let mut tx_buf = [0u8; 128];
    let mut socket = UdpSocket::new(stack, &mut rx_meta, &mut rx_buf, &mut tx_meta, &mut tx_buf);
    socket.bind(48_123).ok()?;

    // Client request: version 3, mode 3, rest zero.
    let mut packet = [0u8; 48];
    packet[0] = 0x1B;
    socket.send_to(&packet, (server, SNTP_PORT)).await.ok()?;

    let mut response = [0u8; 64];
    let (len, _remote) = socket
        .recv_from(&mut response)
        .with_timeout(Duration::from_millis(SNTP_TIMEOUT_MS))
        .await
        .ok()?
        .ok()?;
    if len < 44 {
        return None;
    }

    // Transmit timestamp, seconds field.
    Some(u32::from_be_bytes([
        response[40],
        response[41],
        response[42],
        response[43],
    ]))
}
