//! Streaming bitmap-container parser.
//!
//! The backend returns a bitmap byte stream: a 14-byte file header whose
//! bytes 10..14 hold the little-endian pixel-data offset, then 1bpp rows
//! padded to a 4-byte stride, stored bottom-up. The assembler is fed
//! arbitrary chunks as they arrive off the wire and writes each completed
//! row (vertically flipped) into the caller's frame through a fixed-size
//! row buffer, so memory stays bounded regardless of body size.
//!
//! Callers stream into a staging frame and copy it over the live frame
//! only once `is_complete` reports true; an aborted stream therefore
//! never alters what is displayed.

use log::warn;
use ssd1683::FrameBuffer;
use ssd1683::protocol::{HEIGHT, ROW_BYTES};

/// Bitmap file-header length.
pub const HEADER_LEN: usize = 14;
/// Wire row length: payload padded to a 4-byte boundary.
pub const ROW_STRIDE: usize = (ROW_BYTES + 3) & !3;
/// Full body length from the pixel-data offset onward.
pub const PIXEL_BYTES: usize = ROW_STRIDE * HEIGHT;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BitmapError {
    /// Header shorter than 14 bytes of meaning: pixel offset points
    /// inside the header.
    BadHeader,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Phase {
    Header { got: usize },
    Skip { remaining: u32 },
    Rows { row: usize, got: usize },
    Done,
}

/// Incremental frame assembler; create one per fetch.
pub struct FrameAssembler {
    phase: Phase,
    header: [u8; HEADER_LEN],
    row_buf: [u8; ROW_STRIDE],
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAssembler {
    pub const fn new() -> Self {
        Self {
            phase: Phase::Header { got: 0 },
            header: [0; HEADER_LEN],
            row_buf: [0; ROW_STRIDE],
        }
    }

    /// True once every panel row has been written into the frame.
    pub fn is_complete(&self) -> bool {
        self.phase == Phase::Done
    }

    /// Number of fully assembled rows so far.
    pub fn rows_done(&self) -> usize {
        match self.phase {
            Phase::Header { .. } | Phase::Skip { .. } => 0,
            Phase::Rows { row, .. } => row,
            Phase::Done => HEIGHT,
        }
    }

    /// Consumes one chunk from the wire, advancing the parse.
    ///
    /// Bytes past the final row are ignored (the container may carry
    /// trailing padding).
    pub fn push(&mut self, mut chunk: &[u8], frame: &mut FrameBuffer) -> Result<(), BitmapError> {
        while !chunk.is_empty() {
            match self.phase {
                Phase::Header { got } => {
                    let take = chunk.len().min(HEADER_LEN - got);
                    self.header[got..got + take].copy_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    let got = got + take;
                    if got < HEADER_LEN {
                        self.phase = Phase::Header { got };
                        continue;
                    }

                    let offset = u32::from_le_bytes([
                        self.header[10],
                        self.header[11],
                        self.header[12],
                        self.header[13],
                    ]);
                    if offset < HEADER_LEN as u32 {
                        warn!("bitmap: pixel offset {} points inside the header", offset);
                        return Err(BitmapError::BadHeader);
                    }

                    self.phase = match offset as usize - HEADER_LEN {
                        0 => Phase::Rows { row: 0, got: 0 },
                        n => Phase::Skip { remaining: n as u32 },
                    };
                }

                Phase::Skip { remaining } => {
                    let take = chunk.len().min(remaining as usize);
                    chunk = &chunk[take..];

                    let remaining = remaining - take as u32;
                    self.phase = if remaining == 0 {
                        Phase::Rows { row: 0, got: 0 }
                    } else {
                        Phase::Skip { remaining }
                    };
                }

                Phase::Rows { row, got } => {
                    let take = chunk.len().min(ROW_STRIDE - got);
                    self.row_buf[got..got + take].copy_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    let got = got + take;
                    if got < ROW_STRIDE {
                        self.phase = Phase::Rows { row, got };
                        continue;
                    }

                    // Wire rows run bottom-up; the panel wants top-down.
                    let dest_y = HEIGHT - 1 - row;
                    let payload: &[u8; ROW_BYTES] =
                        self.row_buf[..ROW_BYTES].try_into().unwrap();
                    frame.set_row(dest_y, payload);

                    let row = row + 1;
                    self.phase = if row == HEIGHT {
                        Phase::Done
                    } else {
                        Phase::Rows { row, got: 0 }
                    };
                }

                Phase::Done => return Ok(()),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIXEL_OFFSET: usize = 62;

    /// Builds a valid wire stream: header with the given pixel offset,
    /// info-header padding, then rows whose first byte tags the wire row
    /// index (bottom-up).
    fn wire_stream(pixel_offset: usize) -> Vec<u8> {
        let mut out = vec![0u8; pixel_offset + PIXEL_BYTES];
        out[0] = b'B';
        out[1] = b'M';
        out[10..14].copy_from_slice(&(pixel_offset as u32).to_le_bytes());
        for row in 0..HEIGHT {
            let start = pixel_offset + row * ROW_STRIDE;
            out[start] = (row % 251) as u8;
            out[start + 1] = 0xEE;
        }
        out
    }

    fn push_in_chunks(
        assembler: &mut FrameAssembler,
        stream: &[u8],
        chunk: usize,
        frame: &mut FrameBuffer,
    ) -> Result<(), BitmapError> {
        for part in stream.chunks(chunk) {
            assembler.push(part, frame)?;
        }
        Ok(())
    }

    #[test]
    fn full_stream_assembles_with_vertical_flip() {
        let stream = wire_stream(PIXEL_OFFSET);
        let mut frame = FrameBuffer::new();
        let mut assembler = FrameAssembler::new();

        push_in_chunks(&mut assembler, &stream, 97, &mut frame).unwrap();
        assert!(assembler.is_complete());

        // Wire row 0 (bottom of the image) lands on the last panel row.
        assert_eq!(frame.row(HEIGHT - 1).unwrap()[0], 0);
        assert_eq!(frame.row(0).unwrap()[0], ((HEIGHT - 1) % 251) as u8);
        assert_eq!(frame.row(HEIGHT - 1).unwrap()[1], 0xEE);
    }

    #[test]
    fn chunk_size_does_not_change_the_result() {
        let stream = wire_stream(PIXEL_OFFSET);

        let mut one = FrameBuffer::new();
        let mut a = FrameAssembler::new();
        push_in_chunks(&mut a, &stream, 1, &mut one).unwrap();

        let mut big = FrameBuffer::new();
        let mut b = FrameAssembler::new();
        push_in_chunks(&mut b, &stream, 1536, &mut big).unwrap();

        assert!(a.is_complete() && b.is_complete());
        assert_eq!(one.bytes()[..], big.bytes()[..]);
    }

    #[test]
    fn pixel_offset_inside_the_header_is_malformed() {
        let mut stream = wire_stream(PIXEL_OFFSET);
        stream[10..14].copy_from_slice(&10u32.to_le_bytes());

        let mut frame = FrameBuffer::new();
        let mut assembler = FrameAssembler::new();
        assert_eq!(
            assembler.push(&stream[..64], &mut frame),
            Err(BitmapError::BadHeader)
        );
    }

    #[test]
    fn truncated_body_never_completes_and_live_frame_stays_intact() {
        // Offset-62 container cut short of 62 + ROW_STRIDE * HEIGHT bytes.
        let stream = wire_stream(PIXEL_OFFSET);
        let truncated = &stream[..stream.len() - 3 * ROW_STRIDE - 7];

        let mut live = FrameBuffer::new();
        live.set_pixel(13, 13, true);
        let before = *live.bytes();

        // The fetch pipeline: assemble into staging, commit only on
        // completion.
        let mut staging = FrameBuffer::new();
        let mut assembler = FrameAssembler::new();
        push_in_chunks(&mut assembler, truncated, 512, &mut staging).unwrap();

        assert!(!assembler.is_complete());
        assert!(assembler.rows_done() < HEIGHT);
        if assembler.is_complete() {
            live.copy_from(&staging);
        }

        assert_eq!(*live.bytes(), before);
    }

    #[test]
    fn trailing_bytes_after_the_last_row_are_ignored() {
        let mut stream = wire_stream(PIXEL_OFFSET);
        stream.extend_from_slice(&[0xAB; 17]);

        let mut frame = FrameBuffer::new();
        let mut assembler = FrameAssembler::new();
        push_in_chunks(&mut assembler, &stream, 700, &mut frame).unwrap();
        assert!(assembler.is_complete());
    }
}
