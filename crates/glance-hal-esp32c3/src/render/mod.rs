//! Built-in status screens and the live-clock strip.

pub mod font;

use glance_core::clock::WallClock;
use ssd1683::protocol::{HEIGHT, WIDTH};
use ssd1683::{FrameBuffer, Region};

use font::{draw_text, text_width};

/// Partial-refresh window holding the live clock.
pub const CLOCK_REGION: Region = Region::new(8, 6, 56, 18);
/// Clock strip payload size.
pub const CLOCK_STRIP_LEN: usize = (CLOCK_REGION.w as usize / 8) * CLOCK_REGION.h as usize;

fn centered_x(text: &str, scale: usize) -> i32 {
    (WIDTH as i32 - text_width(text.chars().count(), scale) as i32) / 2
}

/// Full-screen provisioning instructions shown while the portal runs.
pub fn setup_screen(frame: &mut FrameBuffer, ap_name: &str) {
    frame.clear();

    let title = "Setup WiFi";
    draw_text(frame, title, centered_x(title, 3), 40, 3);

    let join = "Connect phone to";
    draw_text(frame, join, centered_x(join, 2), 110, 2);

    draw_text(frame, ap_name, centered_x(ap_name, 3), 145, 3);

    let open = "Open browser";
    draw_text(frame, open, centered_x(open, 2), 200, 2);
}

/// Full-screen centered error message.
pub fn error_screen(frame: &mut FrameBuffer, msg: &str) {
    frame.clear();
    draw_text(frame, msg, centered_x(msg, 2), HEIGHT as i32 / 2 - 7, 2);
}

/// Renders `HH:MM:SS` into a clock-strip payload for
/// `display_partial(.., CLOCK_REGION, ..)`.
pub fn clock_strip(clock: &WallClock) -> [u8; CLOCK_STRIP_LEN] {
    let mut strip = [0xFFu8; CLOCK_STRIP_LEN];
    let row_bytes = CLOCK_REGION.w as usize / 8;

    let mut text = [0u8; 8];
    clock.format(&mut text);

    let sx = 4usize;
    let sy = (CLOCK_REGION.h as usize - font::GLYPH_ROWS) / 2;

    for (index, &byte) in text.iter().enumerate() {
        let glyph = font::glyph(byte as char);
        let cx = sx + index * font::advance(1);
        for (col, bits) in glyph.iter().enumerate() {
            for row in 0..font::GLYPH_ROWS {
                if bits & (1 << row) == 0 {
                    continue;
                }
                let px = cx + col;
                let py = sy + row;
                if px < CLOCK_REGION.w as usize && py < CLOCK_REGION.h as usize {
                    strip[py * row_bytes + px / 8] &= !(0x80 >> (px % 8));
                }
            }
        }
    }

    strip
}
