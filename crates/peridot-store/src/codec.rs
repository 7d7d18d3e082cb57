//! On-disk framing for commit log records.
//!
//! # Frame Format
//!
//! ```text
//! [FRAME_START:u32][length:u32][payload:bytes][blake3:32B][FRAME_END:u32]
//!        4B            4B         variable        32B           4B
//! ```
//!
//! Sentinel markers enable torn write detection: a frame whose end sentinel
//! is missing was incompletely written (power loss) and replay stops there.
//! A checksum mismatch inside an intact frame is corruption and fails the
//! open instead.

use crate::StoreError;

/// Magic number marking the start of a frame.
const FRAME_START: u32 = 0x5045_5244; // "PERD"

/// Magic number marking the end of a complete frame.
const FRAME_END: u32 = 0x4C4F_4700; // "LOG\0"

/// Checksum length (blake3).
const CHECKSUM_LEN: usize = 32;

/// Fixed overhead per frame: start(4) + length(4) + checksum(32) + end(4).
pub const FRAME_OVERHEAD: usize = 44;

/// Result of decoding one frame from a buffer.
#[derive(Debug)]
pub enum DecodedFrame {
    /// A complete, verified frame and the total bytes it consumed.
    Complete { payload: Vec<u8>, consumed: usize },

    /// The buffer ends inside a frame: a torn write. Replay stops here.
    Torn,
}

/// Encodes a payload into a framed record.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + FRAME_OVERHEAD);
    out.extend_from_slice(&FRAME_START.to_le_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out.extend_from_slice(blake3::hash(payload).as_bytes());
    out.extend_from_slice(&FRAME_END.to_le_bytes());
    out
}

/// Decodes one frame from the front of `buf`.
///
/// Returns [`DecodedFrame::Torn`] if the buffer ends before the frame does,
/// and `CorruptStore` if the frame is intact but fails verification.
pub fn decode_frame(buf: &[u8]) -> Result<DecodedFrame, StoreError> {
    if buf.len() < 8 {
        return Ok(DecodedFrame::Torn);
    }

    let start = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if start != FRAME_START {
        return Err(StoreError::CorruptStore {
            reason: format!("bad frame start marker {start:#010x}"),
        });
    }

    let length = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]) as usize;
    let total = length + FRAME_OVERHEAD;
    if buf.len() < total {
        return Ok(DecodedFrame::Torn);
    }

    let payload = &buf[8..8 + length];
    let checksum = &buf[8 + length..8 + length + CHECKSUM_LEN];
    let end_off = 8 + length + CHECKSUM_LEN;
    let end = u32::from_le_bytes([
        buf[end_off],
        buf[end_off + 1],
        buf[end_off + 2],
        buf[end_off + 3],
    ]);

    if end != FRAME_END {
        // Start marker present but end marker wrong: the tail of the file
        // was overwritten by a partial later write.
        return Ok(DecodedFrame::Torn);
    }

    if blake3::hash(payload).as_bytes() != checksum {
        return Err(StoreError::CorruptStore {
            reason: "frame checksum mismatch".to_string(),
        });
    }

    Ok(DecodedFrame::Complete {
        payload: payload.to_vec(),
        consumed: total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let payload = b"some commit record bytes";
        let framed = encode_frame(payload);

        match decode_frame(&framed).unwrap() {
            DecodedFrame::Complete { payload: p, consumed } => {
                assert_eq!(p, payload);
                assert_eq!(consumed, framed.len());
            }
            DecodedFrame::Torn => panic!("expected complete frame"),
        }
    }

    #[test]
    fn torn_tail_is_detected() {
        let framed = encode_frame(b"payload");
        let torn = &framed[..framed.len() - 5];
        assert!(matches!(decode_frame(torn).unwrap(), DecodedFrame::Torn));
    }

    #[test]
    fn corrupted_payload_fails() {
        let mut framed = encode_frame(b"payload");
        framed[10] ^= 0xFF;
        assert!(matches!(
            decode_frame(&framed),
            Err(StoreError::CorruptStore { .. })
        ));
    }

    #[test]
    fn bad_start_marker_fails() {
        let mut framed = encode_frame(b"payload");
        framed[0] ^= 0xFF;
        assert!(matches!(
            decode_frame(&framed),
            Err(StoreError::CorruptStore { .. })
        ));
    }

    #[test]
    fn empty_payload_roundtrip() {
        let framed = encode_frame(b"");
        match decode_frame(&framed).unwrap() {
            DecodedFrame::Complete { payload, consumed } => {
                assert!(payload.is_empty());
                assert_eq!(consumed, FRAME_OVERHEAD);
            }
            DecodedFrame::Torn => panic!("expected complete frame"),
        }
    }
}
