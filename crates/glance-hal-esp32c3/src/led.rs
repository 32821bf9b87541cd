//! Status LED feedback patterns.
//!
//! The panel takes seconds to refresh, so the LED is the only prompt
//! acknowledgement the user gets for button input and network progress.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LedPattern {
    /// Two quick blinks: input acknowledged.
    Ack,
    /// Single medium blink per attempt.
    Connecting,
    /// Three medium blinks.
    Downloading,
    /// One long blink.
    Success,
    /// Five rapid blinks.
    Fail,
    /// Two-second hold.
    Favorite,
    /// Held on for the lifetime of the portal.
    Portal,
    Off,
}

pub struct StatusLed<P> {
    pin: P,
}

impl<P: OutputPin> StatusLed<P> {
    pub fn new(pin: P) -> Self {
        Self { pin }
    }

    /// Plays a pattern; blocks for its duration.
    pub fn show(&mut self, pattern: LedPattern, delay: &mut impl DelayNs) {
        match pattern {
            LedPattern::Ack => self.blink(2, 80, 80, delay),
            LedPattern::Connecting => self.blink(1, 200, 200, delay),
            LedPattern::Downloading => self.blink(3, 150, 150, delay),
            LedPattern::Success => self.blink(1, 1_000, 0, delay),
            LedPattern::Fail => self.blink(5, 60, 60, delay),
            LedPattern::Favorite => self.blink(1, 2_000, 0, delay),
            LedPattern::Portal => {
                let _ = self.pin.set_high();
            }
            LedPattern::Off => {
                let _ = self.pin.set_low();
            }
        }
    }

    fn blink(&mut self, times: u32, on_ms: u32, off_ms: u32, delay: &mut impl DelayNs) {
        for _ in 0..times {
            let _ = self.pin.set_high();
            delay.delay_ms(on_ms);
            let _ = self.pin.set_low();
            if off_ms > 0 {
                delay.delay_ms(off_ms);
            }
        }
    }
}
