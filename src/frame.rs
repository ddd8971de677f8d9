//! Receive-side framing and checksum gate.
//!
//! Wire format (PCI side):
//! ```text
//! \ HEX(BODY.. CHK) [LF] CR      command / monitor frame
//! <tag> .|!  CR                  confirmation
//! ~                              reset echo
//! #                              PCI error
//! ```
//!
//! `CHK` makes the decoded body sum to 0 mod 256. [`RxBuffer::feed`] buffers
//! partial data across calls, so it can be fed arbitrary TCP or serial read
//! boundaries. The framer is pure: no timers, no I/O.

use crate::codec;
use crate::error::{Result, WireError};
use crate::tags::is_tag;

/// Frame start marker for hex-bodied frames.
pub const FRAME_START: u8 = b'\\';
/// Frame terminator.
pub const CR: u8 = 0x0D;
const LF: u8 = 0x0A;
/// Reset echo byte.
pub const RESET: u8 = b'~';
/// PCI error byte.
pub const PCI_ERROR: u8 = b'#';

/// Hard cap on buffered undecoded bytes. A full buffer with no terminator in
/// sight is dropped wholesale to resynchronise.
const RX_CAP: usize = 256;

/// Splits a byte stream into decoded frame bodies.
///
/// Each item in the returned vector is either a decoded body (checksum
/// verified and stripped for hex frames; raw ASCII for confirmation, reset,
/// and error frames) or the decode error for one discarded frame.
pub struct RxBuffer {
    buf: Vec<u8>,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(RX_CAP),
        }
    }

    /// Feed new data and extract any complete frames.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Vec<u8>>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();

        'scan: loop {
            let mut i = 0;
            while i < self.buf.len() {
                match self.buf[i] {
                    FRAME_START => {
                        match self.buf[i + 1..].iter().position(|&b| b == CR) {
                            Some(rel) => {
                                let end = i + 1 + rel;
                                let mut body_end = end;
                                // Optional LF directly before the CR.
                                if body_end > i + 1 && self.buf[body_end - 1] == LF {
                                    body_end -= 1;
                                }
                                out.push(decode_body(&self.buf[i + 1..body_end]));
                                self.buf.drain(..=end);
                                continue 'scan;
                            }
                            None => {
                                // Incomplete frame. Drop the noise prefix and
                                // wait — unless the buffer has hit its cap.
                                self.buf.drain(..i);
                                if self.buf.len() >= RX_CAP {
                                    self.buf.clear();
                                }
                                break 'scan;
                            }
                        }
                    }
                    RESET | PCI_ERROR => {
                        let body = vec![self.buf[i]];
                        self.buf.drain(..=i);
                        out.push(Ok(body));
                        continue 'scan;
                    }
                    b if is_tag(b) => {
                        if i + 1 >= self.buf.len() {
                            // Might be the start of a confirmation; wait.
                            self.buf.drain(..i);
                            break 'scan;
                        }
                        let mark = self.buf[i + 1];
                        if mark == b'.' || mark == b'!' {
                            let body = vec![b, mark];
                            self.buf.drain(..=i + 1);
                            out.push(Ok(body));
                            continue 'scan;
                        }
                        // Stray tag byte; treat as noise.
                        i += 1;
                    }
                    _ => i += 1,
                }
            }
            // Nothing but noise left.
            self.buf.clear();
            break;
        }

        out
    }

    /// Drop all buffered bytes (connection teardown).
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    #[cfg(test)]
    fn buffered(&self) -> usize {
        self.buf.len()
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Hex-decode a candidate body, validate its checksum, strip it.
fn decode_body(ascii: &[u8]) -> Result<Vec<u8>> {
    let mut body = codec::decode_hex(ascii)?;
    codec::verify_checksum(&body)?;
    body.pop();
    if body.is_empty() {
        return Err(WireError::ShortFrame { len: 0 });
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    /// `\` + hex(body + checksum) + CR
    fn wire(body: &[u8]) -> Vec<u8> {
        let mut full = body.to_vec();
        full.push(codec::checksum(body));
        let mut w = vec![FRAME_START];
        codec::encode_hex(&full, &mut w);
        w.push(CR);
        w
    }

    const LIGHT_ON: &[u8] = &[0x05, 0xFF, 0x38, 0x00, 0x79, 0x64];

    #[test]
    fn extracts_single_frame() {
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&wire(LIGHT_ON));
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), LIGHT_ON);
        assert_eq!(rx.buffered(), 0);
    }

    #[test]
    fn arbitrary_chunking_is_a_noop() {
        // Two valid frames survive any split point.
        let mut stream = wire(LIGHT_ON);
        stream.extend_from_slice(&wire(&[0x05, 0xFF, 0x38, 0x00, 0x01, 0x64]));
        for split in 0..stream.len() {
            let mut rx = RxBuffer::new();
            let mut frames = rx.feed(&stream[..split]);
            frames.extend(rx.feed(&stream[split..]));
            let ok: Vec<_> = frames.into_iter().map(|f| f.unwrap()).collect();
            assert_eq!(ok.len(), 2, "split at {split}");
            assert_eq!(ok[0], LIGHT_ON);
        }
    }

    #[test]
    fn confirmation_frame() {
        let mut rx = RxBuffer::new();
        let frames = rx.feed(b"h.\r");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].as_ref().unwrap(), b"h.");
    }

    #[test]
    fn confirmation_split_across_reads() {
        let mut rx = RxBuffer::new();
        assert!(rx.feed(b"h").is_empty());
        let frames = rx.feed(b"!\r");
        assert_eq!(frames[0].as_ref().unwrap(), b"h!");
    }

    #[test]
    fn reset_echo_and_error() {
        let mut rx = RxBuffer::new();
        let frames = rx.feed(b"~#");
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref().unwrap(), b"~");
        assert_eq!(frames[1].as_ref().unwrap(), b"#");
    }

    #[test]
    fn bad_checksum_reported_and_skipped() {
        let mut w = wire(LIGHT_ON);
        let corrupt_at = w.len() - 3;
        w[corrupt_at] = b'0';
        w.extend_from_slice(&wire(LIGHT_ON));
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&w);
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], Err(WireError::BadChecksum { .. })));
        assert_eq!(frames[1].as_ref().unwrap(), LIGHT_ON);
    }

    #[test]
    fn corrupt_interleaved_with_valid() {
        // First frame fails hex decode; the second still delivers.
        let mut stream = b"\\05FFzz\r".to_vec();
        stream.extend_from_slice(&wire(LIGHT_ON));
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&stream);
        assert_eq!(frames.len(), 2);
        assert!(frames[0].is_err());
        assert_eq!(frames[1].as_ref().unwrap(), LIGHT_ON);
    }

    #[test]
    fn garbage_prefix_discarded() {
        let mut stream = vec![0x00, 0x01, 0x42];
        stream.extend_from_slice(&wire(LIGHT_ON));
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&stream);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].is_ok());
    }

    #[test]
    fn lf_before_cr_consumed() {
        let mut w = wire(LIGHT_ON);
        w.insert(w.len() - 1, 0x0A);
        let mut rx = RxBuffer::new();
        let frames = rx.feed(&w);
        assert_eq!(frames[0].as_ref().unwrap(), LIGHT_ON);
    }

    #[test]
    fn unterminated_frame_dropped_at_cap() {
        let mut rx = RxBuffer::new();
        let mut stream = vec![FRAME_START];
        stream.extend_from_slice(&[b'0'; 300]);
        assert!(rx.feed(&stream).is_empty());
        assert_eq!(rx.buffered(), 0);
        // And the buffer still works afterwards.
        let frames = rx.feed(&wire(LIGHT_ON));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn empty_hex_body_rejected() {
        let mut rx = RxBuffer::new();
        let frames = rx.feed(b"\\\r");
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], Err(WireError::ShortFrame { .. })));
    }
}
