//! 5x7 status font, column-major, bit 0 = top row.
//!
//! Covers only what the built-in screens print: digits, the letters of
//! the status messages, and a little punctuation. Unknown characters
//! render as a space.

use ssd1683::FrameBuffer;

pub const GLYPH_COLS: usize = 5;
pub const GLYPH_ROWS: usize = 7;

pub fn glyph(c: char) -> &'static [u8; GLYPH_COLS] {
    match c {
        // Uppercase
        'C' => &[0x3E, 0x41, 0x41, 0x41, 0x22],
        'F' => &[0x7F, 0x09, 0x09, 0x09, 0x01],
        'G' => &[0x3E, 0x41, 0x49, 0x49, 0x7A],
        'I' => &[0x00, 0x41, 0x7F, 0x41, 0x00],
        'N' => &[0x7F, 0x08, 0x10, 0x20, 0x7F],
        'O' => &[0x3E, 0x41, 0x41, 0x41, 0x3E],
        'P' => &[0x7F, 0x09, 0x09, 0x09, 0x06],
        'R' => &[0x7F, 0x09, 0x19, 0x29, 0x46],
        'S' => &[0x26, 0x49, 0x49, 0x49, 0x32],
        'T' => &[0x01, 0x01, 0x7F, 0x01, 0x01],
        'W' => &[0x3F, 0x40, 0x38, 0x40, 0x3F],
        'X' => &[0x63, 0x14, 0x08, 0x14, 0x63],
        // Lowercase
        'a' => &[0x20, 0x54, 0x54, 0x54, 0x78],
        'b' => &[0x7F, 0x48, 0x44, 0x44, 0x38],
        'c' => &[0x38, 0x44, 0x44, 0x44, 0x28],
        'd' => &[0x38, 0x44, 0x44, 0x28, 0x7F],
        'e' => &[0x38, 0x54, 0x54, 0x54, 0x18],
        'f' => &[0x00, 0x08, 0x7E, 0x09, 0x02],
        'g' => &[0x18, 0xA4, 0xA4, 0xA4, 0x7C],
        'h' => &[0x7F, 0x08, 0x04, 0x04, 0x78],
        'i' => &[0x00, 0x44, 0x7D, 0x40, 0x00],
        'k' => &[0x7F, 0x10, 0x28, 0x44, 0x00],
        'l' => &[0x00, 0x41, 0x7F, 0x40, 0x00],
        'm' => &[0x7C, 0x04, 0x18, 0x04, 0x78],
        'n' => &[0x7C, 0x08, 0x04, 0x04, 0x78],
        'o' => &[0x38, 0x44, 0x44, 0x44, 0x38],
        'p' => &[0x7C, 0x14, 0x14, 0x14, 0x08],
        'r' => &[0x7C, 0x08, 0x04, 0x04, 0x08],
        's' => &[0x48, 0x54, 0x54, 0x54, 0x24],
        't' => &[0x04, 0x3F, 0x44, 0x40, 0x20],
        'u' => &[0x3C, 0x40, 0x40, 0x20, 0x7C],
        'v' => &[0x1C, 0x20, 0x40, 0x20, 0x1C],
        'w' => &[0x3C, 0x40, 0x30, 0x40, 0x3C],
        // Digits
        '0' => &[0x3E, 0x51, 0x49, 0x45, 0x3E],
        '1' => &[0x00, 0x42, 0x7F, 0x40, 0x00],
        '2' => &[0x42, 0x61, 0x51, 0x49, 0x46],
        '3' => &[0x21, 0x41, 0x45, 0x4B, 0x31],
        '4' => &[0x18, 0x14, 0x12, 0x7F, 0x10],
        '5' => &[0x27, 0x45, 0x45, 0x45, 0x39],
        '6' => &[0x3C, 0x4A, 0x49, 0x49, 0x30],
        '7' => &[0x01, 0x71, 0x09, 0x05, 0x03],
        '8' => &[0x36, 0x49, 0x49, 0x49, 0x36],
        '9' => &[0x06, 0x49, 0x49, 0x29, 0x1E],
        // Punctuation
        ':' => &[0x00, 0x00, 0x36, 0x36, 0x00],
        '-' => &[0x08, 0x08, 0x08, 0x08, 0x08],
        '.' => &[0x00, 0x60, 0x60, 0x00, 0x00],
        '/' => &[0x20, 0x10, 0x08, 0x04, 0x02],
        _ => &[0x00, 0x00, 0x00, 0x00, 0x00],
    }
}

/// Advance per character at the given scale (glyph plus one column gap).
pub const fn advance(scale: usize) -> usize {
    GLYPH_COLS * scale + scale
}

/// Pixel width of `chars` characters at the given scale.
pub const fn text_width(chars: usize, scale: usize) -> usize {
    if chars == 0 {
        0
    } else {
        chars * advance(scale) - scale
    }
}

/// Draws black text into the frame with integer scaling; pixels outside
/// the panel are clipped.
pub fn draw_text(frame: &mut FrameBuffer, msg: &str, x: i32, y: i32, scale: usize) {
    for (index, c) in msg.chars().enumerate() {
        let glyph = glyph(c);
        let cx = x + (index * advance(scale)) as i32;
        for (col, bits) in glyph.iter().enumerate() {
            for row in 0..GLYPH_ROWS {
                if bits & (1 << row) == 0 {
                    continue;
                }
                for dy in 0..scale {
                    for dx in 0..scale {
                        let px = cx + (col * scale + dx) as i32;
                        let py = y + (row * scale + dy) as i32;
                        if px >= 0 && py >= 0 {
                            frame.set_pixel(px as usize, py as usize, true);
                        }
                    }
                }
            }
        }
    }
}
