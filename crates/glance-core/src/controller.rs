//! Device state machine decisions.
//!
//! The firmware binary performs the effects (radio, sockets, panel); the
//! routing, retry and refresh-scheduling decisions live here so they can
//! be tested on the host.

use log::debug;

use crate::button::ButtonEvent;
use crate::config::DeviceConfig;

/// Operating mode of the device across one boot cycle.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceState {
    Boot,
    Portal,
    Connecting,
    Fetching,
    Displaying,
    Refreshing,
    Error,
    Sleeping,
}

/// What went wrong during an awake cycle; shown on the error screen.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureReason {
    Wifi,
    Server,
}

impl FailureReason {
    pub fn label(self) -> &'static str {
        match self {
            Self::Wifi => "WiFi failed",
            Self::Server => "Server error",
        }
    }
}

/// Consecutive failures tolerated before the device stops burning battery
/// on rapid retries.
pub const MAX_RETRY_COUNT: u8 = 5;

/// Retry back-off tiers, seconds, indexed by the persisted retry counter.
pub const RETRY_DELAYS_SEC: [u16; 4] = [10, 20, 40, 80];

/// Display cycles between forced ghost-clearing full refreshes.
pub const FULL_REFRESH_INTERVAL: u32 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BootRoute {
    /// Run the provisioning portal; terminal for this boot cycle.
    Portal,
    /// Connect and fetch normally.
    Normal,
}

/// Decides where boot goes: provisioning whenever the config cannot
/// support a fetch, or when the portal gesture is asserted.
pub fn boot_route(config: &DeviceConfig, portal_gesture: bool) -> BootRoute {
    if portal_gesture || !config.has_credentials() || !config.has_server() {
        BootRoute::Portal
    } else {
        BootRoute::Normal
    }
}

/// Outcome of one Error-state transition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RetryPlan {
    /// Sleep for a tiered delay, persist the bumped counter, reboot.
    RetryAfter {
        delay_seconds: u16,
        next_retry_count: u8,
    },
    /// Budget exhausted: persist a zeroed counter and sleep for the
    /// normal refresh interval instead of retrying indefinitely.
    GiveUp {
        sleep_minutes: u16,
        next_retry_count: u8,
    },
}

/// Maps the persisted retry counter to the next recovery step.
pub fn failure_plan(retry_count: u8, sleep_minutes: u16) -> RetryPlan {
    let plan = match RETRY_DELAYS_SEC.get(retry_count as usize) {
        Some(&delay_seconds) => RetryPlan::RetryAfter {
            delay_seconds,
            next_retry_count: retry_count + 1,
        },
        None => RetryPlan::GiveUp {
            sleep_minutes,
            next_retry_count: 0,
        },
    };
    debug!("failure plan for retry_count={}: {:?}", retry_count, plan);
    plan
}

/// Which panel-driving sequence a display cycle should use.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RefreshMode {
    Full,
    Fast,
    Partial,
}

/// Ghosting-mitigation schedule: every Nth cycle is promoted to a full
/// refresh even when fast would otherwise be used. Owned by the
/// controller, not the panel driver.
#[derive(Debug, Default)]
pub struct RefreshSchedule {
    cycles: u32,
}

impl RefreshSchedule {
    pub const fn new() -> Self {
        Self { cycles: 0 }
    }

    /// Mode for the next display cycle; advances the cycle counter.
    pub fn next(&mut self) -> RefreshMode {
        let mode = if self.cycles % FULL_REFRESH_INTERVAL == 0 {
            RefreshMode::Full
        } else {
            RefreshMode::Fast
        };
        self.cycles = self.cycles.wrapping_add(1);
        mode
    }
}

/// Controller reaction to a button gesture while awake.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ControllerAction {
    Refresh { next_mode: bool },
    Favorite,
    EnterPortal,
}

pub fn action_for(event: ButtonEvent) -> ControllerAction {
    match event {
        ButtonEvent::ShortPress => ControllerAction::Refresh { next_mode: false },
        ButtonEvent::DoublePress => ControllerAction::Refresh { next_mode: true },
        ButtonEvent::TriplePress => ControllerAction::Favorite,
        ButtonEvent::LongPress => ControllerAction::EnterPortal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapless::String;

    fn provisioned() -> DeviceConfig {
        let mut cfg = DeviceConfig::new();
        cfg.ssid = String::try_from("shed").unwrap();
        cfg.pass = String::try_from("hunter2").unwrap();
        cfg.server = String::try_from("http://10.0.0.7:8080").unwrap();
        cfg
    }

    #[test]
    fn missing_ssid_boots_straight_into_the_portal() {
        let mut cfg = provisioned();
        cfg.ssid.clear();
        assert_eq!(boot_route(&cfg, false), BootRoute::Portal);
    }

    #[test]
    fn missing_server_boots_into_the_portal() {
        let mut cfg = provisioned();
        cfg.server.clear();
        assert_eq!(boot_route(&cfg, false), BootRoute::Portal);
    }

    #[test]
    fn portal_gesture_overrides_a_complete_config() {
        let cfg = provisioned();
        assert_eq!(boot_route(&cfg, true), BootRoute::Portal);
        assert_eq!(boot_route(&cfg, false), BootRoute::Normal);
    }

    #[test]
    fn retry_delays_escalate_then_reset_after_max_transitions() {
        let sleep_minutes = 45;
        let mut retry_count = 0u8;
        let mut seen = Vec::new();

        // Drive MAX_RETRY_COUNT consecutive failures with no success.
        for transition in 1..=MAX_RETRY_COUNT {
            match failure_plan(retry_count, sleep_minutes) {
                RetryPlan::RetryAfter {
                    delay_seconds,
                    next_retry_count,
                } => {
                    assert!(transition < MAX_RETRY_COUNT);
                    seen.push(delay_seconds);
                    retry_count = next_retry_count;
                }
                RetryPlan::GiveUp {
                    sleep_minutes: m,
                    next_retry_count,
                } => {
                    // Exactly the MAX_RETRY_COUNTth transition gives up,
                    // resets the counter, and sleeps the normal interval.
                    assert_eq!(transition, MAX_RETRY_COUNT);
                    assert_eq!(m, sleep_minutes);
                    assert_eq!(next_retry_count, 0);
                    retry_count = next_retry_count;
                }
            }
        }

        assert_eq!(seen, vec![10, 20, 40, 80]);
        assert_eq!(retry_count, 0);
    }

    #[test]
    fn refresh_schedule_forces_full_every_nth_cycle() {
        let mut schedule = RefreshSchedule::new();
        assert_eq!(schedule.next(), RefreshMode::Full);
        for _ in 1..FULL_REFRESH_INTERVAL {
            assert_eq!(schedule.next(), RefreshMode::Fast);
        }
        assert_eq!(schedule.next(), RefreshMode::Full);
    }

    #[test]
    fn button_gestures_map_to_controller_actions() {
        assert_eq!(
            action_for(ButtonEvent::ShortPress),
            ControllerAction::Refresh { next_mode: false }
        );
        assert_eq!(
            action_for(ButtonEvent::DoublePress),
            ControllerAction::Refresh { next_mode: true }
        );
        assert_eq!(action_for(ButtonEvent::TriplePress), ControllerAction::Favorite);
        assert_eq!(action_for(ButtonEvent::LongPress), ControllerAction::EnterPortal);
    }
}
