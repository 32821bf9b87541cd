//! Single-pin button gesture decoder.
//!
//! Classifies raw pin samples into click gestures without hardware
//! debounce. One, two and three clicks are disambiguated by a pending
//! count held open for the multi-click window, trading a fixed latency
//! (the window) for unambiguous classification.

/// Minimum hold time for a press to count as a click.
pub const DEBOUNCE_MIN_MS: u64 = 50;
/// Hold time at which a press becomes a long press.
pub const LONG_PRESS_MS: u64 = 2_000;
/// Maximum gap between clicks of one multi-click gesture.
pub const MULTI_CLICK_WINDOW_MS: u64 = 500;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ButtonEvent {
    ShortPress,
    DoublePress,
    TriplePress,
    LongPress,
}

/// Poll-driven gesture decoder; feed it the raw pin level on a fixed
/// cadence together with a monotonic millisecond timestamp.
#[derive(Debug, Default)]
pub struct ClickDecoder {
    pressed_at: Option<u64>,
    long_fired: bool,
    last_release_at: Option<u64>,
    pending_clicks: u8,
}

impl ClickDecoder {
    pub const fn new() -> Self {
        Self {
            pressed_at: None,
            long_fired: false,
            last_release_at: None,
            pending_clicks: 0,
        }
    }

    /// Advances the decoder one sample. Returns at most one event.
    pub fn poll(&mut self, pressed: bool, now_ms: u64) -> Option<ButtonEvent> {
        if pressed {
            return self.poll_pressed(now_ms);
        }
        self.poll_released(now_ms)
    }

    fn poll_pressed(&mut self, now_ms: u64) -> Option<ButtonEvent> {
        let Some(t0) = self.pressed_at else {
            self.pressed_at = Some(now_ms);
            return None;
        };

        // Long press fires while still held and cancels any pending
        // click sequence; nothing further until release.
        if !self.long_fired && now_ms.saturating_sub(t0) >= LONG_PRESS_MS {
            self.long_fired = true;
            self.pending_clicks = 0;
            self.last_release_at = None;
            return Some(ButtonEvent::LongPress);
        }

        None
    }

    fn poll_released(&mut self, now_ms: u64) -> Option<ButtonEvent> {
        if let Some(t0) = self.pressed_at.take() {
            if self.long_fired {
                self.long_fired = false;
                return None;
            }

            let held = now_ms.saturating_sub(t0);
            if !(DEBOUNCE_MIN_MS..LONG_PRESS_MS).contains(&held) {
                return None;
            }

            let in_window = self
                .last_release_at
                .is_some_and(|t| now_ms.saturating_sub(t) < MULTI_CLICK_WINDOW_MS);
            self.pending_clicks = if in_window { self.pending_clicks + 1 } else { 1 };
            self.last_release_at = Some(now_ms);

            if self.pending_clicks >= 3 {
                self.pending_clicks = 0;
                self.last_release_at = None;
                return Some(ButtonEvent::TriplePress);
            }

            // One or two clicks stay pending until the window closes in
            // case another click follows.
            return None;
        }

        let window_closed = self
            .last_release_at
            .is_some_and(|t| now_ms.saturating_sub(t) >= MULTI_CLICK_WINDOW_MS);
        if !window_closed {
            return None;
        }

        let clicks = self.pending_clicks;
        self.pending_clicks = 0;
        self.last_release_at = None;
        match clicks {
            1 => Some(ButtonEvent::ShortPress),
            2 => Some(ButtonEvent::DoublePress),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Runs the decoder over `(pressed, at_ms)` samples, collecting events.
    fn run(decoder: &mut ClickDecoder, samples: &[(bool, u64)]) -> Vec<ButtonEvent> {
        samples
            .iter()
            .filter_map(|&(pressed, at)| decoder.poll(pressed, at))
            .collect()
    }

    #[test]
    fn isolated_click_finalizes_exactly_when_the_window_elapses() {
        let mut d = ClickDecoder::new();
        assert_eq!(d.poll(true, 100), None);
        assert_eq!(d.poll(false, 180), None);

        // Not earlier than release + window...
        assert_eq!(d.poll(false, 679), None);
        // ...and exactly one ShortPress once it elapses.
        assert_eq!(d.poll(false, 680), Some(ButtonEvent::ShortPress));
        assert_eq!(d.poll(false, 690), None);
        assert_eq!(d.poll(false, 2_000), None);
    }

    #[test]
    fn two_clicks_then_silence_yield_exactly_one_double_press() {
        let mut d = ClickDecoder::new();
        let events = run(
            &mut d,
            &[
                (true, 0),
                (false, 80),
                (true, 250),
                (false, 330),
                (false, 700),
                (false, 830),
                (false, 1_500),
            ],
        );
        assert_eq!(events, vec![ButtonEvent::DoublePress]);
    }

    #[test]
    fn third_click_fires_triple_immediately() {
        let mut d = ClickDecoder::new();
        assert_eq!(d.poll(true, 0), None);
        assert_eq!(d.poll(false, 80), None);
        assert_eq!(d.poll(true, 200), None);
        assert_eq!(d.poll(false, 280), None);
        assert_eq!(d.poll(true, 400), None);
        // Finalized on the third release, not after the window.
        assert_eq!(d.poll(false, 480), Some(ButtonEvent::TriplePress));
        assert_eq!(d.poll(false, 2_000), None);
    }

    #[test]
    fn long_press_fires_while_held_and_only_once() {
        let mut d = ClickDecoder::new();
        assert_eq!(d.poll(true, 0), None);
        assert_eq!(d.poll(true, 1_999), None);
        assert_eq!(d.poll(true, 2_000), Some(ButtonEvent::LongPress));
        assert_eq!(d.poll(true, 2_500), None);
        assert_eq!(d.poll(false, 2_600), None);
        assert_eq!(d.poll(false, 4_000), None);
    }

    #[test]
    fn long_press_cancels_a_pending_click_sequence() {
        let mut d = ClickDecoder::new();
        assert_eq!(d.poll(true, 0), None);
        assert_eq!(d.poll(false, 80), None);
        assert_eq!(d.poll(true, 200), None);
        assert_eq!(d.poll(true, 2_200), Some(ButtonEvent::LongPress));
        assert_eq!(d.poll(false, 2_300), None);
        // The earlier click must not resurface as a ShortPress.
        assert_eq!(d.poll(false, 5_000), None);
    }

    #[test]
    fn sub_debounce_blips_are_ignored() {
        let mut d = ClickDecoder::new();
        let events = run(&mut d, &[(true, 0), (false, 30), (false, 600), (false, 900)]);
        assert!(events.is_empty());
    }

    #[test]
    fn clicks_outside_the_window_start_a_new_gesture() {
        let mut d = ClickDecoder::new();
        let events = run(
            &mut d,
            &[
                (true, 0),
                (false, 80),
                (false, 600),
                // Second click arrives after the window: two ShortPresses.
                (true, 700),
                (false, 780),
                (false, 1_400),
                (false, 1_500),
            ],
        );
        assert_eq!(events, vec![ButtonEvent::ShortPress, ButtonEvent::ShortPress]);
    }
}
