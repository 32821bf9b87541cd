#![no_std]
#![no_main]
#![deny(
    clippy::mem_forget,
    reason = "mem::forget is generally not safe to do with esp_hal types, especially those \
    holding buffers for the duration of a data transfer."
)]

// Battery-powered companion e-paper display. Each boot cycle runs one
// awake pass: load config, join WiFi, fetch a rendered frame from the
// backend, drive the panel, then deep sleep until the next refresh.
// Provisioning runs a captive portal when no usable config exists.
// With the `tethered` feature the device stays awake instead, ticking a
// live clock and refreshing on a short interval or button gestures.

use core::fmt::Write as FmtWrite;

use embassy_executor::Spawner;
use embassy_futures::select::select;
use embassy_net::{Stack, StackResources};
#[cfg(feature = "tethered")]
use embassy_time::{Duration, Instant, Timer};
use embedded_hal_bus::spi::ExclusiveDevice;
use esp_hal::{
    Blocking,
    analog::adc::{Adc, AdcConfig, AdcPin, Attenuation},
    clock::CpuClock,
    delay::Delay,
    gpio::{Input, InputConfig, Level, Output, OutputConfig, Pull},
    peripherals::{ADC1, GPIO0},
    rtc_cntl::{SocResetReason, reset_reason, wakeup_cause},
    spi::master::Spi,
    system::Cpu,
    time::Rate,
    timer::timg::TimerGroup,
};
use esp_radio::wifi::WifiController;
use heapless::String;
use log::{LevelFilter, info, warn};
use static_cell::StaticCell;

#[cfg(feature = "tethered")]
use glance_core::button::ClickDecoder;
use glance_core::clock::WallClock;
use glance_core::config::{ConfigStore, DeviceConfig};
#[cfg(feature = "tethered")]
use glance_core::controller::{ControllerAction, action_for};
use glance_core::controller::{
    BootRoute, FailureReason, MAX_RETRY_COUNT, RefreshMode, RefreshSchedule, RetryPlan,
    boot_route, failure_plan,
};
use glance_core::portal::ap_name;
#[cfg(feature = "tethered")]
use glance_core::request::ServerAddress;
use glance_core::request::{device_id, parse_server_url, render_path};
use glance_hal_esp32c3::battery::adc_to_millivolts;
use glance_hal_esp32c3::led::{LedPattern, StatusLed};
use glance_hal_esp32c3::render;
use glance_hal_esp32c3::storage::FlashConfigStore;
use ssd1683::{FrameBuffer, Ssd1683};

#[path = "main/net.rs"]
mod net;
#[path = "main/portal.rs"]
mod portal;
#[path = "main/power.rs"]
mod power;

use net::FetchError;

const EPD_SPI_HZ: u32 = 10_000_000;
const BUTTON_POLL_MS: u64 = 10;
/// Fixed zone applied to the wall clock after SNTP.
const NTP_UTC_OFFSET_SECS: i32 = 8 * 3600;
#[cfg(feature = "tethered")]
const TETHERED_REFRESH_MINUTES: u64 = 1;

type EpdSpi = ExclusiveDevice<Spi<'static, Blocking>, Output<'static>, Delay>;
type Epd = Ssd1683<EpdSpi, Output<'static>, Output<'static>, Input<'static>>;
type BatteryAdc = Adc<'static, ADC1<'static>, Blocking>;
type BatteryPin = AdcPin<GPIO0<'static>, ADC1<'static>>;
type Led = StatusLed<Output<'static>>;

static NET_RESOURCES: StaticCell<StackResources<4>> = StaticCell::new();

#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    loop {}
}

// This creates a default app-descriptor required by the esp-idf bootloader.
esp_bootloader_esp_idf::esp_app_desc!();

fn read_battery_mv(adc: &mut BatteryAdc, pin: &mut BatteryPin) -> u32 {
    adc_to_millivolts(nb::block!(adc.read_oneshot(pin)).unwrap_or(0))
}

#[esp_rtos::main]
async fn main(_spawner: Spawner) -> ! {
    esp_println::logger::init_logger(LevelFilter::Info);
    esp_println::println!("boot: glance starting");

    let hal_config = esp_hal::Config::default().with_cpu_clock(CpuClock::max());
    let peripherals = esp_hal::init(hal_config);
    let boot_reset_reason = reset_reason(Cpu::ProCpu);
    let woke_from_deep_sleep = boot_reset_reason == Some(SocResetReason::CoreDeepSleep);
    info!(
        "boot reset_reason={:?} wakeup_cause={:?}",
        boot_reset_reason,
        wakeup_cause()
    );

    // esp-radio requires an allocator.
    esp_alloc::heap_allocator!(size: 72 * 1024);

    let timg0 = TimerGroup::new(peripherals.TIMG0);
    let software_interrupt =
        esp_hal::interrupt::software::SoftwareInterruptControl::new(peripherals.SW_INTERRUPT);
    esp_rtos::start(timg0.timer0, software_interrupt.software_interrupt0);

    // Panel wiring: SCK=GPIO4 MOSI=GPIO6 CS=GPIO7 DC=GPIO1 RST=GPIO2 BUSY=GPIO10
    let mut delay = Delay::new();
    let spi_config = esp_hal::spi::master::Config::default()
        .with_frequency(Rate::from_hz(EPD_SPI_HZ))
        .with_mode(esp_hal::spi::Mode::_0);
    let spi = Spi::new(peripherals.SPI2, spi_config)
        .unwrap()
        .with_sck(peripherals.GPIO4)
        .with_mosi(peripherals.GPIO6);
    let cs = Output::new(peripherals.GPIO7, Level::High, OutputConfig::default());
    let dc = Output::new(peripherals.GPIO1, Level::High, OutputConfig::default());
    let rst = Output::new(peripherals.GPIO2, Level::High, OutputConfig::default());
    let busy = Input::new(peripherals.GPIO10, InputConfig::default());
    let spi_device = ExclusiveDevice::new(spi, cs, Delay::new()).unwrap();
    let mut epd: Epd = Ssd1683::new(spi_device, dc, rst, busy);

    // GPIO9 is the boot button; held low at boot it forces the portal.
    let button = Input::new(
        peripherals.GPIO9,
        InputConfig::default().with_pull(Pull::Up),
    );
    let mut led = StatusLed::new(Output::new(
        peripherals.GPIO8,
        Level::Low,
        OutputConfig::default(),
    ));

    let mut adc_config = AdcConfig::new();
    let mut battery_pin = adc_config.enable_pin(peripherals.GPIO0, Attenuation::_11dB);
    let mut adc = Adc::new(peripherals.ADC1, adc_config);

    let mac = esp_hal::efuse::Efuse::mac_address();

    let mut store = match FlashConfigStore::new() {
        Ok(store) => Some(store),
        Err(err) => {
            warn!("config storage unavailable: {:?}", err);
            None
        }
    };
    let config = match store.as_mut().map(|store| store.load()) {
        Some(Ok(Some(saved))) => saved,
        Some(Ok(None)) => {
            info!("no saved config, using defaults");
            DeviceConfig::new()
        }
        Some(Err(err)) => {
            warn!("config load failed: {:?}, using defaults", err);
            DeviceConfig::new()
        }
        None => DeviceConfig::new(),
    };

    let portal_gesture = button.is_low() && !woke_from_deep_sleep;
    if boot_route(&config, portal_gesture) == BootRoute::Portal {
        info!(
            "{} -> portal",
            if portal_gesture {
                "config button held"
            } else {
                "incomplete config"
            }
        );
        led.show(LedPattern::Portal, &mut delay);

        let mut frame = FrameBuffer::new();
        render::setup_screen(&mut frame, &ap_name(&mac));
        if epd.display_full(&frame, &mut delay).is_err() {
            warn!("setup screen display failed");
        }

        portal::run_portal(peripherals.WIFI, config, store, mac, &mut || {
            read_battery_mv(&mut adc, &mut battery_pin)
        })
        .await
    }

    // Normal operation.
    info!("retry count: {}/{}", config.retry_count, MAX_RETRY_COUNT);

    let mut ctx = DeviceCtx {
        config,
        store,
        epd,
        delay,
        led,
    };

    let radio = match esp_radio::init() {
        Ok(radio) => radio,
        Err(err) => {
            warn!("esp-radio init failed: {:?}", err);
            ctx.fail_and_sleep(FailureReason::Wifi)
        }
    };
    let (mut controller, interfaces) =
        match esp_radio::wifi::new(&radio, peripherals.WIFI, esp_radio::wifi::Config::default()) {
            Ok(parts) => parts,
            Err(err) => {
                warn!("wifi peripheral init failed: {:?}", err);
                ctx.fail_and_sleep(FailureReason::Wifi)
            }
        };

    let rng = esp_hal::rng::Rng::new();
    let seed = (rng.random() as u64) << 32 | rng.random() as u64;
    let stack_config = embassy_net::Config::dhcpv4(Default::default());
    let (stack, mut runner) = embassy_net::new(
        interfaces.sta,
        stack_config,
        NET_RESOURCES.init(StackResources::new()),
        seed,
    );

    select(
        runner.run(),
        awake_cycle(
            stack,
            &mut controller,
            &mut ctx,
            &button,
            &mut adc,
            &mut battery_pin,
            mac,
        ),
    )
    .await;
    unreachable!()
}

/// Everything the failure handler and display path need in one place,
/// passed by reference through the awake cycle.
struct DeviceCtx {
    config: DeviceConfig,
    store: Option<FlashConfigStore>,
    epd: Epd,
    delay: Delay,
    led: Led,
}

impl DeviceCtx {
    fn persist(&mut self) {
        if let Some(store) = self.store.as_mut()
            && let Err(err) = store.save(&self.config)
        {
            warn!("config save failed: {:?}", err);
        }
    }

    fn display(&mut self, frame: &FrameBuffer, mode: RefreshMode) {
        let result = match mode {
            RefreshMode::Full => self.epd.display_full(frame, &mut self.delay),
            RefreshMode::Fast | RefreshMode::Partial => {
                self.epd.display_fast(frame, &mut self.delay)
            }
        };
        if result.is_err() {
            warn!("panel refresh failed ({:?})", mode);
        }
    }

    fn draw_clock(&mut self, clock: &WallClock) {
        let strip = render::clock_strip(clock);
        if self
            .epd
            .display_partial(&strip, render::CLOCK_REGION, &mut self.delay)
            .is_err()
        {
            warn!("clock partial refresh failed");
        }
    }

    /// Bounded-retry failure handler: draws the error (best-effort),
    /// persists the bumped counter and deep sleeps. Never returns; the
    /// timer wake restarts the boot sequence.
    fn fail_and_sleep(&mut self, reason: FailureReason) -> ! {
        self.led.show(LedPattern::Fail, &mut self.delay);

        let plan = failure_plan(self.config.retry_count, self.config.sleep_minutes);
        let mut frame = FrameBuffer::new();

        match plan {
            RetryPlan::RetryAfter {
                delay_seconds,
                next_retry_count,
            } => {
                let mut msg: String<48> = String::new();
                let _ = write!(
                    msg,
                    "{} {}/{} {}s",
                    reason.label(),
                    next_retry_count,
                    MAX_RETRY_COUNT,
                    delay_seconds
                );
                render::error_screen(&mut frame, &msg);
                if self.epd.display_full(&frame, &mut self.delay).is_err() {
                    warn!("error screen display failed");
                }
                let _ = self.epd.sleep(&mut self.delay);

                self.config.retry_count = next_retry_count;
                self.persist();
                info!(
                    "{}, retry {}/{} in {}s",
                    reason.label(),
                    next_retry_count,
                    MAX_RETRY_COUNT,
                    delay_seconds
                );
                power::deep_sleep_seconds(delay_seconds as u64)
            }
            RetryPlan::GiveUp {
                sleep_minutes,
                next_retry_count,
            } => {
                render::error_screen(&mut frame, "Sleep. Press btn.");
                if self.epd.display_full(&frame, &mut self.delay).is_err() {
                    warn!("error screen display failed");
                }
                let _ = self.epd.sleep(&mut self.delay);

                self.config.retry_count = next_retry_count;
                self.persist();
                info!("max retries reached, sleeping {} min", sleep_minutes);
                power::deep_sleep_minutes(sleep_minutes as u64)
            }
        }
    }
}

/// One awake pass: connect, fetch, display, sync the clock, then either
/// deep sleep or hand over to the tethered loop.
async fn awake_cycle(
    stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    ctx: &mut DeviceCtx,
    button: &Input<'static>,
    adc: &mut BatteryAdc,
    battery_pin: &mut BatteryPin,
    mac: [u8; 6],
) -> ! {
    ctx.led.show(LedPattern::Connecting, &mut ctx.delay);
    if let Err(err) =
        net::connect_station(controller, stack, &ctx.config.ssid, &ctx.config.pass).await
    {
        warn!("wifi connect failed: {:?}", err);
        ctx.fail_and_sleep(FailureReason::Wifi)
    }

    let mut live = FrameBuffer::new();
    let mut staging = FrameBuffer::new();
    let mut schedule = RefreshSchedule::new();

    ctx.led.show(LedPattern::Downloading, &mut ctx.delay);
    let battery_mv = read_battery_mv(adc, battery_pin);
    if let Err(err) =
        fetch_into(stack, controller, &ctx.config, &mut staging, battery_mv, mac, false).await
    {
        warn!("fetch failed: {:?}", err);
        ctx.fail_and_sleep(FailureReason::Server)
    }

    // Success: the staging frame is complete, commit and display it.
    if ctx.config.retry_count != 0 {
        ctx.config.retry_count = 0;
        ctx.persist();
    }
    live.copy_from(&staging);
    let mode = schedule.next();
    ctx.display(&live, mode);
    ctx.led.show(LedPattern::Success, &mut ctx.delay);

    #[cfg_attr(not(feature = "tethered"), allow(unused_mut))]
    let mut clock = sync_clock(stack).await;
    ctx.draw_clock(&clock);

    if !ctx.config.token.is_empty() {
        post_token(stack, &ctx.config, mac).await;
    }

    #[cfg(feature = "tethered")]
    {
        net::shutdown_station(controller).await;
        tethered_loop(
            stack, controller, ctx, button, adc, battery_pin, mac, live, staging, schedule,
            &mut clock,
        )
        .await
    }

    #[cfg(not(feature = "tethered"))]
    {
        let _ = button;
        net::shutdown_station(controller).await;
        let _ = ctx.epd.sleep(&mut ctx.delay);
        ctx.led.show(LedPattern::Off, &mut ctx.delay);
        info!("refresh in {} min", ctx.config.sleep_minutes);
        power::deep_sleep_minutes(ctx.config.sleep_minutes as u64)
    }
}

async fn sync_clock(stack: Stack<'_>) -> WallClock {
    match net::sntp_query(stack).await {
        Some(seconds) => {
            let clock = WallClock::from_ntp_seconds(seconds, NTP_UTC_OFFSET_SECS);
            let (h, m, s) = clock.hms();
            info!("sntp synced: {:02}:{:02}:{:02}", h, m, s);
            clock
        }
        None => {
            // Reset to the baseline rather than keeping a stale value.
            warn!("sntp failed, clock reset to 00:00:00");
            WallClock::midnight()
        }
    }
}

async fn fetch_into(
    stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    config: &DeviceConfig,
    staging: &mut FrameBuffer,
    battery_mv: u32,
    mac: [u8; 6],
    next_mode: bool,
) -> Result<(), FetchError> {
    let server = parse_server_url(&config.server).ok_or(FetchError::Dns)?;
    let rssi = controller.rssi().map(i32::from).unwrap_or(0);
    let path = render_path(battery_mv, &device_id(&mac), rssi, next_mode);
    info!("GET {}{} (rssi={})", config.server, path, rssi);
    net::fetch_image(stack, &server, &path, staging).await
}

async fn post_token(stack: Stack<'_>, config: &DeviceConfig, mac: [u8; 6]) {
    let Some(server) = parse_server_url(&config.server) else {
        return;
    };
    let mut body: String<128> = String::new();
    let _ = write!(
        body,
        "{{\"device_id\":\"{}\",\"token\":\"{}\"}}",
        device_id(&mac),
        config.token
    );
    match net::post_json(stack, &server, "/token", &body).await {
        Ok(status) => info!("POST /token -> {}", status),
        Err(err) => warn!("token post failed: {:?}", err),
    }
}

#[cfg(feature = "tethered")]
async fn post_favorite(stack: Stack<'_>, server: &ServerAddress<'_>, mac: [u8; 6]) -> bool {
    let mut body: String<64> = String::new();
    let _ = write!(body, "{{\"device_id\":\"{}\"}}", device_id(&mac));
    match net::post_json(stack, server, "/favorite", &body).await {
        Ok(status) => {
            info!("POST /favorite -> {}", status);
            (200..300).contains(&status)
        }
        Err(err) => {
            warn!("favorite post failed: {:?}", err);
            false
        }
    }
}

// ── Tethered (continuously-powered) posture ─────────────────────────────

/// Stays awake ticking the live clock; re-enters the connect/fetch flow
/// on the short refresh interval or on button gestures. A failed
/// refresh keeps the prior frame on the panel.
#[cfg(feature = "tethered")]
#[allow(clippy::too_many_arguments)]
async fn tethered_loop(
    stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    ctx: &mut DeviceCtx,
    button: &Input<'static>,
    adc: &mut BatteryAdc,
    battery_pin: &mut BatteryPin,
    mac: [u8; 6],
    mut live: FrameBuffer,
    mut staging: FrameBuffer,
    mut schedule: RefreshSchedule,
    clock: &mut WallClock,
) -> ! {
    let interval = Duration::from_secs(TETHERED_REFRESH_MINUTES * 60);
    info!(
        "tethered: staying awake, refresh every {} min (configured: {} min)",
        TETHERED_REFRESH_MINUTES, ctx.config.sleep_minutes
    );

    let start = Instant::now();
    let mut decoder = ClickDecoder::new();
    let mut last_second = Instant::now();
    let mut next_fetch_at = Instant::now() + interval;

    loop {
        Timer::after_millis(BUTTON_POLL_MS).await;
        let now_ms = start.elapsed().as_millis();

        if let Some(event) = decoder.poll(button.is_low(), now_ms) {
            match action_for(event) {
                ControllerAction::Refresh { next_mode } => {
                    info!("button: refresh (next_mode={})", next_mode);
                    ctx.led.show(LedPattern::Ack, &mut ctx.delay);
                    refresh_inline(
                        stack, controller, ctx, adc, battery_pin, mac, &mut live, &mut staging,
                        &mut schedule, clock, next_mode,
                    )
                    .await;
                    next_fetch_at = Instant::now() + interval;
                }
                ControllerAction::Favorite => {
                    info!("button: favorite");
                    ctx.led.show(LedPattern::Ack, &mut ctx.delay);
                    favorite_inline(stack, controller, ctx, mac).await;
                }
                ControllerAction::EnterPortal => {
                    info!("button held, restarting into portal");
                    let mut frame = FrameBuffer::new();
                    render::error_screen(&mut frame, "Restarting");
                    let _ = ctx.epd.display_full(&frame, &mut ctx.delay);
                    Timer::after_millis(500).await;
                    esp_hal::system::software_reset();
                }
            }
        }

        let mut ticked = false;
        while last_second.elapsed() >= Duration::from_secs(1) {
            clock.tick();
            last_second += Duration::from_secs(1);
            ticked = true;
        }
        if ticked {
            ctx.draw_clock(clock);
        }

        if Instant::now() >= next_fetch_at {
            info!("{} min elapsed, refreshing content", TETHERED_REFRESH_MINUTES);
            refresh_inline(
                stack, controller, ctx, adc, battery_pin, mac, &mut live, &mut staging,
                &mut schedule, clock, false,
            )
            .await;
            next_fetch_at = Instant::now() + interval;
        }
    }
}

/// Inline Connecting -> Fetching pass from the awake loop; redisplays
/// only on full success.
#[cfg(feature = "tethered")]
#[allow(clippy::too_many_arguments)]
async fn refresh_inline(
    stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    ctx: &mut DeviceCtx,
    adc: &mut BatteryAdc,
    battery_pin: &mut BatteryPin,
    mac: [u8; 6],
    live: &mut FrameBuffer,
    staging: &mut FrameBuffer,
    schedule: &mut RefreshSchedule,
    clock: &mut WallClock,
    next_mode: bool,
) {
    ctx.led.show(LedPattern::Connecting, &mut ctx.delay);
    if let Err(err) =
        net::connect_station(controller, stack, &ctx.config.ssid, &ctx.config.pass).await
    {
        warn!("refresh: wifi reconnect failed: {:?}", err);
        ctx.led.show(LedPattern::Fail, &mut ctx.delay);
        return;
    }

    ctx.led.show(LedPattern::Downloading, &mut ctx.delay);
    let battery_mv = read_battery_mv(adc, battery_pin);
    match fetch_into(stack, controller, &ctx.config, staging, battery_mv, mac, next_mode).await {
        Ok(()) => {
            if ctx.config.retry_count != 0 {
                ctx.config.retry_count = 0;
                ctx.persist();
            }
            live.copy_from(staging);
            let mode = schedule.next();
            ctx.display(live, mode);
            ctx.led.show(LedPattern::Success, &mut ctx.delay);
            *clock = sync_clock(stack).await;
            ctx.draw_clock(clock);
        }
        Err(err) => {
            // Prior frame stays on the panel.
            warn!("refresh: fetch failed, keeping old content: {:?}", err);
            ctx.led.show(LedPattern::Fail, &mut ctx.delay);
        }
    }

    net::shutdown_station(controller).await;
}

/// Best-effort favorite POST; no redisplay either way.
#[cfg(feature = "tethered")]
async fn favorite_inline(
    stack: Stack<'_>,
    controller: &mut WifiController<'static>,
    ctx: &mut DeviceCtx,
    mac: [u8; 6],
) {
    if let Err(err) =
        net::connect_station(controller, stack, &ctx.config.ssid, &ctx.config.pass).await
    {
        warn!("favorite: wifi reconnect failed: {:?}", err);
        ctx.led.show(LedPattern::Fail, &mut ctx.delay);
        return;
    }

    let posted = match parse_server_url(&ctx.config.server) {
        Some(server) => post_favorite(stack, &server, mac).await,
        None => false,
    };
    let pattern = if posted {
        LedPattern::Favorite
    } else {
        LedPattern::Fail
    };
    ctx.led.show(pattern, &mut ctx.delay);

    net::shutdown_station(controller).await;
}
