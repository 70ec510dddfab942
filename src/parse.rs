//! Byte-level helpers for the LPF2 wire format.
//!
//! Everything here is pure and never panics on short input: readers return
//! `None` when the requested bytes are not present, so decoders can bail out
//! with `?` on truncated notifications.
//!
//! | Item | Purpose |
//! |---|---|
//! | [`MessageFramer`] | Reassembles length-prefixed frames from notification chunks |
//! | [`read_u8`] … [`read_f32_le`] | Bounds-checked little-endian field readers |
//! | [`decode_version`] | Packed 32-bit firmware/hardware version → `"1.0.00.0224"` |
//! | [`decode_mac_address`] | Raw bytes → `"90:84:2b:01:02:03"` |
//! | [`compare_versions`] | Orders dotted version strings numerically |

use std::cmp::Ordering;

use log::warn;

// ── Field readers ─────────────────────────────────────────────────────────────

pub fn read_u8(data: &[u8], offset: usize) -> Option<u8> {
    data.get(offset).copied()
}

pub fn read_i8(data: &[u8], offset: usize) -> Option<i8> {
    read_u8(data, offset).map(|b| b as i8)
}

fn read_array<const N: usize>(data: &[u8], offset: usize) -> Option<[u8; N]> {
    data.get(offset..offset.checked_add(N)?)?.try_into().ok()
}

pub fn read_u16_le(data: &[u8], offset: usize) -> Option<u16> {
    read_array(data, offset).map(u16::from_le_bytes)
}

pub fn read_i16_le(data: &[u8], offset: usize) -> Option<i16> {
    read_array(data, offset).map(i16::from_le_bytes)
}

pub fn read_u32_le(data: &[u8], offset: usize) -> Option<u32> {
    read_array(data, offset).map(u32::from_le_bytes)
}

pub fn read_i32_le(data: &[u8], offset: usize) -> Option<i32> {
    read_array(data, offset).map(i32::from_le_bytes)
}

pub fn read_f32_le(data: &[u8], offset: usize) -> Option<f32> {
    read_array(data, offset).map(f32::from_le_bytes)
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Splits the LPF2 characteristic's notification stream into messages.
///
/// Every LPF2 message starts with its own total length.  BLE may deliver a
/// message across several notifications or pack several messages into one,
/// so chunks are buffered and complete messages are cut off the front:
///
/// ```
/// # use poweredup_rs::parse::MessageFramer;
/// let mut framer = MessageFramer::new();
/// assert!(framer.push(&[0x05, 0x00, 0x01]).is_empty());      // incomplete
/// let msgs = framer.push(&[0x02, 0x06, 0x04, 0x00, 0x82, 0x00]);
/// assert_eq!(msgs, vec![vec![0x05, 0x00, 0x01, 0x02, 0x06], vec![0x04, 0x00, 0x82, 0x00]]);
/// assert!(framer.is_empty());
/// ```
///
/// After each [`push`](Self::push) the buffer holds either nothing or a
/// prefix shorter than the length its first byte declares.
#[derive(Debug, Default)]
pub struct MessageFramer {
    buffer: Vec<u8>,
}

impl MessageFramer {
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Append a chunk and return every message it completes, in order.
    ///
    /// A declared length of zero can never be satisfied and would stall the
    /// stream forever, so the whole buffer is discarded when one is seen.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);

        let mut messages = Vec::new();
        while let Some(&len) = self.buffer.first() {
            let len = len as usize;
            if len == 0 {
                warn!(
                    "framing error: zero-length message header, dropping {} buffered byte(s)",
                    self.buffer.len()
                );
                self.buffer.clear();
                break;
            }
            if self.buffer.len() < len {
                break;
            }
            messages.push(self.buffer.drain(..len).collect());
        }
        messages
    }

    /// Bytes waiting for the rest of their message.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Forget any partial message, e.g. when a new connection starts.
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

// ── Hub property payloads ─────────────────────────────────────────────────────

/// Decode a packed version number into its dotted form.
///
/// The value is rendered as eight hex digits and split 1/1/2/4:
///
/// ```
/// # use poweredup_rs::parse::decode_version;
/// assert_eq!(decode_version(0x1000_0004), "1.0.00.0004");
/// assert_eq!(decode_version(0x0001_1234), "0.0.01.1234");
/// ```
pub fn decode_version(version: u32) -> String {
    let hex = format!("{version:08x}");
    format!("{}.{}.{}.{}", &hex[0..1], &hex[1..2], &hex[2..4], &hex[4..8])
}

/// Format raw address bytes as colon-separated lowercase hex pairs.
pub fn decode_mac_address(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Compare two dotted version strings part by part as integers.
///
/// Parts are parsed as hex so `"1.0.00.0a00"` orders correctly; a part that
/// fails to parse counts as zero and a missing trailing part is lower than
/// any present one.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u32> {
        s.split('.')
            .map(|p| u32::from_str_radix(p, 16).unwrap_or(0))
            .collect()
    };
    parse(a).cmp(&parse(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(chunks: &[&[u8]]) -> Vec<Vec<u8>> {
        let mut framer = MessageFramer::new();
        chunks.iter().flat_map(|c| framer.push(c)).collect()
    }

    #[test]
    fn test_framing_is_split_independent() {
        let msg1 = [0x05, 0x00, 0x82, 0x00, 0x0a];
        let msg2 = [0x04, 0x00, 0x01, 0x02];
        let stream: Vec<u8> = msg1.iter().chain(msg2.iter()).copied().collect();
        let expected = vec![msg1.to_vec(), msg2.to_vec()];

        assert_eq!(frames(&[&stream]), expected);
        assert_eq!(frames(&[&stream[..3], &stream[3..]]), expected);

        let singles: Vec<&[u8]> = stream.chunks(1).collect();
        assert_eq!(frames(&singles), expected);

        for split in 0..=stream.len() {
            assert_eq!(frames(&[&stream[..split], &stream[split..]]), expected);
        }
    }

    #[test]
    fn test_framer_keeps_incomplete_tail() {
        let mut framer = MessageFramer::new();
        let out = framer.push(&[0x03, 0x00, 0x02, 0x06, 0x00]);
        assert_eq!(out, vec![vec![0x03, 0x00, 0x02]]);
        assert_eq!(framer.pending(), 2);
        assert!(framer.push(&[0x00]).is_empty());
        assert_eq!(framer.push(&[0x01, 0x02, 0x03]).len(), 1);
        assert!(framer.is_empty());
    }

    #[test]
    fn test_framer_zero_length_discards_buffer() {
        let mut framer = MessageFramer::new();
        let out = framer.push(&[0x03, 0x00, 0x02, 0x00, 0x07, 0x07]);
        assert_eq!(out, vec![vec![0x03, 0x00, 0x02]]);
        assert!(framer.is_empty());

        // Recovers on the next well-formed chunk.
        assert_eq!(framer.push(&[0x03, 0x00, 0x01]).len(), 1);
    }

    #[test]
    fn test_decode_version_pairs() {
        assert_eq!(decode_version(0x0001_1234), "0.0.01.1234");
        assert_eq!(decode_version(0x1100_0004), "1.1.00.0004");
        assert_eq!(decode_version(0x2000_0017), "2.0.00.0017");
        assert_eq!(decode_version(0x1002_0000), "1.0.02.0000");
        assert_eq!(decode_version(0), "0.0.00.0000");
    }

    #[test]
    fn test_decode_mac_address() {
        assert_eq!(
            decode_mac_address(&[0x90, 0x84, 0x2b, 0x0a, 0x01, 0xff]),
            "90:84:2b:0a:01:ff"
        );
        assert_eq!(decode_mac_address(&[]), "");
    }

    #[test]
    fn test_compare_versions() {
        assert_eq!(compare_versions("1.1.00.0004", "1.1.00.0004"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.00.0224", "1.1.00.0004"), Ordering::Less);
        assert_eq!(compare_versions("2.0.00.0023", "2.0.00.0017"), Ordering::Greater);
        assert_eq!(compare_versions("1.1.00.000a", "1.1.00.0004"), Ordering::Greater);
    }

    #[test]
    fn test_readers_are_bounds_checked() {
        let data = [0x01, 0xff, 0x7f, 0x00];
        assert_eq!(read_i8(&data, 1), Some(-1));
        assert_eq!(read_u16_le(&data, 1), Some(0x7fff));
        assert_eq!(read_i16_le(&data, 3), None);
        assert_eq!(read_u32_le(&data, 0), Some(0x007f_ff01));
        assert_eq!(read_i32_le(&data, 1), None);
        assert_eq!(read_u8(&data, usize::MAX), None);
        assert_eq!(read_u16_le(&data, usize::MAX), None);
    }
}
