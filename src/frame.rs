//! On-wire HID frame codec (spec.md §4.3).
//!
//! A frame is always exactly 65 bytes: `[report-id=0][type][len][payload..][pad]`.
//! `len` never exceeds 62, leaving room for the 3-byte header inside a
//! single 65-byte HID report.

use crate::error::FrameError;

/// Maximum payload length that fits in one frame.
pub const MAX_PAYLOAD_LEN: usize = 62;

/// Size in bytes of a complete HID frame (report id + type + len + payload + pad).
pub const FRAME_LEN: usize = 65;

/// Encode `payload` as a 65-byte frame of the given message `type`.
///
/// Fails iff `payload.len() > MAX_PAYLOAD_LEN`.
pub fn encode(message_type: u8, payload: &[u8]) -> Result<[u8; FRAME_LEN], FrameError> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(FrameError::PayloadTooLong(payload.len()));
    }

    let mut frame = [0u8; FRAME_LEN];
    frame[0] = 0; // HID report id, always 0
    frame[1] = message_type;
    frame[2] = payload.len() as u8;
    frame[3..3 + payload.len()].copy_from_slice(payload);
    Ok(frame)
}

/// Decode a raw frame into its message type and payload.
///
/// Trusts the length byte; callers that read a frame straight off a
/// HID report should pad it to [`FRAME_LEN`] first.
pub fn decode(frame: &[u8]) -> (u8, Vec<u8>) {
    let message_type = frame[1];
    let len = frame[2] as usize;
    let payload = frame[3..3 + len].to_vec();
    (message_type, payload)
}
