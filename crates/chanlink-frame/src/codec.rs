use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};

/// Numeric identity of a channel type on the wire.
pub type ChannelTypeId = u32;

/// Application frame header: channel type id (4 bytes, big-endian).
pub const HEADER_SIZE: usize = 4;

/// A decoded application frame borrowing from its packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef<'a> {
    /// The sender's channel type id.
    pub id: ChannelTypeId,
    /// Everything after the header.
    pub payload: &'a [u8],
}

/// Encode an application frame.
///
/// Wire format:
/// ```text
/// ┌──────────────────────┬──────────────────────┐
/// │ ChannelTypeId (4B BE)│ Payload              │
/// └──────────────────────┴──────────────────────┘
/// ```
pub fn encode_frame(id: ChannelTypeId, payload: &[u8], dst: &mut BytesMut) {
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_u32(id);
    dst.put_slice(payload);
}

/// Split a packet into its channel id and payload.
pub fn decode_frame(packet: &[u8]) -> Result<FrameRef<'_>> {
    if packet.len() < HEADER_SIZE {
        return Err(FrameError::TooShort {
            len: packet.len(),
            need: HEADER_SIZE,
        });
    }
    let (header, payload) = packet.split_at(HEADER_SIZE);
    let id = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    Ok(FrameRef { id, payload })
}
