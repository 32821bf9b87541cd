#![cfg_attr(not(test), no_std)]

//! SSD1683 e-paper controller driver (400x300, 1bpp).
//!
//! Command/data protocol over SPI with DC, RST and BUSY lines. Three
//! refresh strategies: full (ghost-clearing GC waveform), fast (reduced
//! flash via a temperature-register LUT override) and partial
//! (sub-rectangle update with the border pinned).

mod framebuffer;
pub mod protocol;

pub use framebuffer::FrameBuffer;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};
use embedded_hal::spi::SpiDevice;
use log::warn;

use protocol::{cmd, seq};

/// Worst-case documented refresh is ~4 s; the timeout is sized well past it.
const BUSY_TIMEOUT_MS: u32 = 10_000;
const BUSY_POLL_MS: u32 = 10;

const RESET_SETTLE_MS: u32 = 100;
const RESET_PULSE_MS: u32 = 2;
const SLEEP_SETTLE_MS: u32 = 200;

/// Initialization variant; selects the waveform family loaded at init.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InitMode {
    Full,
    Fast,
}

/// Byte-aligned panel sub-rectangle for partial updates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Region {
    pub x: u16,
    pub y: u16,
    pub w: u16,
    pub h: u16,
}

impl Region {
    pub const fn new(x: u16, y: u16, w: u16, h: u16) -> Self {
        Self { x, y, w, h }
    }

    /// Payload length expected by `display_partial` for this region.
    pub const fn data_len(&self) -> usize {
        (self.w as usize / 8) * self.h as usize
    }
}

/// Driver errors.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Error<SpiErr, PinErr> {
    /// SPI transaction failed.
    Spi(SpiErr),
    /// DC/RST/BUSY pin operation failed.
    Pin(PinErr),
    /// Region or payload outside supported bounds.
    InvalidInput,
}

pub type DriverResult<SpiErr, PinErr> = Result<(), Error<SpiErr, PinErr>>;

/// SSD1683 driver.
pub struct Ssd1683<SPI, DC, RST, BUSY> {
    spi: SPI,
    dc: DC,
    rst: RST,
    busy: BUSY,
    ready: Option<InitMode>,
}

impl<SPI, DC, RST, BUSY, PinErr> Ssd1683<SPI, DC, RST, BUSY>
where
    SPI: SpiDevice<u8>,
    DC: OutputPin<Error = PinErr>,
    RST: OutputPin<Error = PinErr>,
    BUSY: InputPin<Error = PinErr>,
{
    pub fn new(spi: SPI, dc: DC, rst: RST, busy: BUSY) -> Self {
        Self {
            spi,
            dc,
            rst,
            busy,
            ready: None,
        }
    }

    /// Releases owned bus and pins.
    pub fn release(self) -> (SPI, DC, RST, BUSY) {
        (self.spi, self.dc, self.rst, self.busy)
    }

    /// Initializes the panel for the given refresh family.
    ///
    /// Idempotent: re-initializing in the same mode is a no-op, so callers
    /// may invoke this before every display without double resets.
    pub fn initialize(
        &mut self,
        mode: InitMode,
        delay: &mut impl DelayNs,
    ) -> DriverResult<SPI::Error, PinErr> {
        if self.ready == Some(mode) {
            return Ok(());
        }

        self.hardware_reset(delay)?;
        self.wait_busy(delay)?;

        self.send_command(cmd::SW_RESET)?;
        self.wait_busy(delay)?;

        self.send_command(cmd::DISPLAY_UPDATE_CONTROL_1)?;
        self.send_data(&[0x40, 0x00])?;

        self.send_command(cmd::BORDER_WAVEFORM)?;
        self.send_data(&[protocol::BORDER_NORMAL])?;

        if mode == InitMode::Fast {
            self.send_command(cmd::WRITE_TEMP_REGISTER)?;
            self.send_data(&[protocol::FAST_LUT_TEMP])?;

            self.send_command(cmd::DISPLAY_UPDATE_CONTROL_2)?;
            self.send_data(&[seq::LOAD_LUT])?;
            self.send_command(cmd::MASTER_ACTIVATION)?;
            self.wait_busy(delay)?;
        }

        self.set_window(0, 0, protocol::WIDTH as u16 - 1, protocol::HEIGHT as u16 - 1)?;
        self.wait_busy(delay)?;

        self.ready = Some(mode);
        Ok(())
    }

    /// Writes `frame` to both RAM planes and runs the full GC update.
    ///
    /// Both planes must carry the image or the controller produces a
    /// half-refresh artifact on the next differential update.
    pub fn display_full(
        &mut self,
        frame: &FrameBuffer,
        delay: &mut impl DelayNs,
    ) -> DriverResult<SPI::Error, PinErr> {
        self.initialize(InitMode::Full, delay)?;
        self.write_both_planes(frame)?;
        self.activate(seq::UPDATE_FULL, delay)
    }

    /// Writes `frame` to both RAM planes and runs the reduced-flash update.
    pub fn display_fast(
        &mut self,
        frame: &FrameBuffer,
        delay: &mut impl DelayNs,
    ) -> DriverResult<SPI::Error, PinErr> {
        self.initialize(InitMode::Fast, delay)?;
        self.write_both_planes(frame)?;
        self.activate(seq::UPDATE_FAST, delay)
    }

    /// Updates only `region` with `data` (packed rows, byte-aligned).
    ///
    /// The border is pinned for the duration so the partial waveform does
    /// not flash the full panel.
    pub fn display_partial(
        &mut self,
        data: &[u8],
        region: Region,
        delay: &mut impl DelayNs,
    ) -> DriverResult<SPI::Error, PinErr> {
        if region.x % 8 != 0
            || region.w % 8 != 0
            || region.w == 0
            || region.h == 0
            || (region.x + region.w) as usize > protocol::WIDTH
            || (region.y + region.h) as usize > protocol::HEIGHT
            || data.len() != region.data_len()
        {
            return Err(Error::InvalidInput);
        }

        if self.ready.is_none() {
            self.initialize(InitMode::Full, delay)?;
        }

        self.send_command(cmd::BORDER_WAVEFORM)?;
        self.send_data(&[protocol::BORDER_PARTIAL])?;

        self.send_command(cmd::DISPLAY_UPDATE_CONTROL_1)?;
        self.send_data(&[0x00, 0x00])?;

        self.set_window(
            region.x,
            region.y,
            region.x + region.w - 1,
            region.y + region.h - 1,
        )?;

        self.send_command(cmd::WRITE_RAM_BW)?;
        self.send_data(data)?;

        self.activate(seq::UPDATE_PARTIAL, delay)
    }

    /// Puts the controller in deep sleep; the panel keeps its image but
    /// cannot refresh until re-initialized.
    pub fn sleep(&mut self, delay: &mut impl DelayNs) -> DriverResult<SPI::Error, PinErr> {
        self.send_command(cmd::DEEP_SLEEP)?;
        self.send_data(&[0x01])?;
        delay.delay_ms(SLEEP_SETTLE_MS);
        self.ready = None;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.ready.is_some()
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn hardware_reset(&mut self, delay: &mut impl DelayNs) -> DriverResult<SPI::Error, PinErr> {
        self.rst.set_high().map_err(Error::Pin)?;
        delay.delay_ms(RESET_SETTLE_MS);
        self.rst.set_low().map_err(Error::Pin)?;
        delay.delay_ms(RESET_PULSE_MS);
        self.rst.set_high().map_err(Error::Pin)?;
        delay.delay_ms(RESET_SETTLE_MS);
        Ok(())
    }

    fn write_both_planes(&mut self, frame: &FrameBuffer) -> DriverResult<SPI::Error, PinErr> {
        for ram_cmd in [cmd::WRITE_RAM_BW, cmd::WRITE_RAM_RED] {
            self.send_command(ram_cmd)?;
            self.send_data(frame.bytes())?;
        }
        Ok(())
    }

    fn activate(&mut self, sequence: u8, delay: &mut impl DelayNs) -> DriverResult<SPI::Error, PinErr> {
        self.send_command(cmd::DISPLAY_UPDATE_CONTROL_2)?;
        self.send_data(&[sequence])?;
        self.send_command(cmd::MASTER_ACTIVATION)?;
        self.wait_busy(delay)
    }

    fn set_window(&mut self, x0: u16, y0: u16, x1: u16, y1: u16) -> DriverResult<SPI::Error, PinErr> {
        self.send_command(cmd::DATA_ENTRY_MODE)?;
        self.send_data(&[protocol::DATA_ENTRY_XY_INC])?;

        self.send_command(cmd::SET_RAM_X_RANGE)?;
        self.send_data(&protocol::x_range(x0, x1))?;

        self.send_command(cmd::SET_RAM_Y_RANGE)?;
        self.send_data(&protocol::y_range(y0, y1))?;

        self.send_command(cmd::SET_RAM_X_COUNTER)?;
        self.send_data(&protocol::x_counter(x0))?;

        self.send_command(cmd::SET_RAM_Y_COUNTER)?;
        self.send_data(&protocol::y_counter(y0))?;

        Ok(())
    }

    /// Blocks until BUSY clears. A timeout is logged and treated as
    /// "proceed anyway": the controller reports no distinct failure, so
    /// correctness relies on the timeout dwarfing the documented
    /// worst-case refresh duration.
    fn wait_busy(&mut self, delay: &mut impl DelayNs) -> DriverResult<SPI::Error, PinErr> {
        let mut waited_ms = 0u32;
        while self.busy.is_high().map_err(Error::Pin)? {
            if waited_ms >= BUSY_TIMEOUT_MS {
                warn!("ssd1683: busy timeout after {}ms", waited_ms);
                return Ok(());
            }
            delay.delay_ms(BUSY_POLL_MS);
            waited_ms += BUSY_POLL_MS;
        }
        Ok(())
    }

    fn send_command(&mut self, command: u8) -> DriverResult<SPI::Error, PinErr> {
        self.dc.set_low().map_err(Error::Pin)?;
        self.spi.write(&[command]).map_err(Error::Spi)?;
        self.dc.set_high().map_err(Error::Pin)
    }

    fn send_data(&mut self, data: &[u8]) -> DriverResult<SPI::Error, PinErr> {
        self.dc.set_high().map_err(Error::Pin)?;
        self.spi.write(data).map_err(Error::Spi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::convert::Infallible;
    use std::rc::Rc;
    use std::vec::Vec;

    use embedded_hal::spi::{ErrorType, Operation};

    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    enum BusByte {
        Cmd(u8),
        Data(u8),
    }

    #[derive(Default)]
    struct BusState {
        dc_high: bool,
        reset_pulses: u32,
        log: Vec<BusByte>,
    }

    #[derive(Clone)]
    struct Shared(Rc<RefCell<BusState>>);

    struct MockSpi(Shared);

    impl ErrorType for MockSpi {
        type Error = Infallible;
    }

    impl SpiDevice<u8> for MockSpi {
        fn transaction(
            &mut self,
            operations: &mut [Operation<'_, u8>],
        ) -> Result<(), Self::Error> {
            let mut state = self.0.0.borrow_mut();
            for op in operations {
                if let Operation::Write(words) = op {
                    for &w in words.iter() {
                        let byte = if state.dc_high {
                            BusByte::Data(w)
                        } else {
                            BusByte::Cmd(w)
                        };
                        state.log.push(byte);
                    }
                }
            }
            Ok(())
        }
    }

    enum PinRole {
        Dc,
        Rst,
    }

    struct MockPin {
        role: PinRole,
        shared: Shared,
        level_high: bool,
    }

    impl embedded_hal::digital::ErrorType for MockPin {
        type Error = Infallible;
    }

    impl OutputPin for MockPin {
        fn set_low(&mut self) -> Result<(), Self::Error> {
            match self.role {
                PinRole::Dc => self.shared.0.borrow_mut().dc_high = false,
                PinRole::Rst => {
                    if self.level_high {
                        self.shared.0.borrow_mut().reset_pulses += 1;
                    }
                }
            }
            self.level_high = false;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Self::Error> {
            if let PinRole::Dc = self.role {
                self.shared.0.borrow_mut().dc_high = true;
            }
            self.level_high = true;
            Ok(())
        }
    }

    struct IdleBusy;

    impl embedded_hal::digital::ErrorType for IdleBusy {
        type Error = Infallible;
    }

    impl InputPin for IdleBusy {
        fn is_high(&mut self) -> Result<bool, Self::Error> {
            Ok(false)
        }

        fn is_low(&mut self) -> Result<bool, Self::Error> {
            Ok(true)
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn make_driver() -> (Ssd1683<MockSpi, MockPin, MockPin, IdleBusy>, Shared) {
        let shared = Shared(Rc::new(RefCell::new(BusState::default())));
        let driver = Ssd1683::new(
            MockSpi(shared.clone()),
            MockPin {
                role: PinRole::Dc,
                shared: shared.clone(),
                level_high: false,
            },
            MockPin {
                role: PinRole::Rst,
                shared: shared.clone(),
                level_high: false,
            },
            IdleBusy,
        );
        (driver, shared)
    }

    #[test]
    fn initialize_is_idempotent_per_mode() {
        let (mut driver, shared) = make_driver();
        let mut delay = NoDelay;

        driver.initialize(InitMode::Full, &mut delay).unwrap();
        let first = shared.0.borrow().log.clone();
        let pulses = shared.0.borrow().reset_pulses;
        assert!(!first.is_empty());
        assert_eq!(pulses, 1);

        driver.initialize(InitMode::Full, &mut delay).unwrap();
        assert_eq!(shared.0.borrow().log, first);
        assert_eq!(shared.0.borrow().reset_pulses, 1);
    }

    #[test]
    fn fast_init_loads_the_lut_override() {
        let (mut driver, shared) = make_driver();
        let mut delay = NoDelay;

        driver.initialize(InitMode::Fast, &mut delay).unwrap();
        let log = shared.0.borrow().log.clone();

        let temp_at = log
            .iter()
            .position(|&b| b == BusByte::Cmd(cmd::WRITE_TEMP_REGISTER))
            .expect("temperature register written");
        assert_eq!(log[temp_at + 1], BusByte::Data(protocol::FAST_LUT_TEMP));
        assert!(log.contains(&BusByte::Data(seq::LOAD_LUT)));
    }

    #[test]
    fn full_display_writes_both_ram_planes() {
        let (mut driver, shared) = make_driver();
        let mut delay = NoDelay;
        let frame = FrameBuffer::new();

        driver.display_full(&frame, &mut delay).unwrap();
        let log = shared.0.borrow().log.clone();

        assert!(log.contains(&BusByte::Cmd(cmd::WRITE_RAM_BW)));
        assert!(log.contains(&BusByte::Cmd(cmd::WRITE_RAM_RED)));
        let data_bytes = log
            .iter()
            .filter(|b| matches!(b, BusByte::Data(_)))
            .count();
        assert!(data_bytes >= 2 * protocol::BUFFER_SIZE);
        assert_eq!(*log.last().unwrap(), BusByte::Cmd(cmd::MASTER_ACTIVATION));
    }

    #[test]
    fn partial_display_rejects_unaligned_regions() {
        let (mut driver, _shared) = make_driver();
        let mut delay = NoDelay;
        let data = [0xFFu8; 7 * 18];

        let err = driver
            .display_partial(&data, Region::new(3, 6, 56, 18), &mut delay)
            .unwrap_err();
        assert_eq!(err, Error::InvalidInput);

        let err = driver
            .display_partial(&data[..10], Region::new(8, 6, 56, 18), &mut delay)
            .unwrap_err();
        assert_eq!(err, Error::InvalidInput);
    }

    #[test]
    fn partial_display_pins_the_border_and_uses_partial_sequence() {
        let (mut driver, shared) = make_driver();
        let mut delay = NoDelay;
        driver.initialize(InitMode::Full, &mut delay).unwrap();
        shared.0.borrow_mut().log.clear();

        let region = Region::new(8, 6, 56, 18);
        let data = vec![0xFFu8; region.data_len()];
        driver.display_partial(&data, region, &mut delay).unwrap();

        let log = shared.0.borrow().log.clone();
        let border_at = log
            .iter()
            .position(|&b| b == BusByte::Cmd(cmd::BORDER_WAVEFORM))
            .unwrap();
        assert_eq!(log[border_at + 1], BusByte::Data(protocol::BORDER_PARTIAL));
        assert!(log.contains(&BusByte::Data(seq::UPDATE_PARTIAL)));
        assert!(!log.contains(&BusByte::Cmd(cmd::WRITE_RAM_RED)));
    }

    #[test]
    fn sleep_requires_reinitialization() {
        let (mut driver, _shared) = make_driver();
        let mut delay = NoDelay;

        driver.initialize(InitMode::Full, &mut delay).unwrap();
        assert!(driver.is_initialized());
        driver.sleep(&mut delay).unwrap();
        assert!(!driver.is_initialized());
    }
}
