// Deep-sleep entry. The RTC timer is the only wake source on this board:
// the boot button is not an RTC-capable pad on the C3, so button intent
// is expressed by holding it through the next timer wake instead.

use esp_hal::peripherals::LPWR;
use esp_hal::rtc_cntl::{Rtc, sleep::TimerWakeupSource};
use log::info;

pub fn deep_sleep_seconds(seconds: u64) -> ! {
    info!("power: deep sleep for {}s", seconds);
    let mut rtc = Rtc::new(unsafe { LPWR::steal() });
    let timer = TimerWakeupSource::new(core::time::Duration::from_secs(seconds));
    rtc.sleep_deep(&[&timer]);
}

pub fn deep_sleep_minutes(minutes: u64) -> ! {
    deep_sleep_seconds(minutes * 60)
}
