use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TransportError};

/// Stream frame header: magic (2) + length (4) + kind (1) = 7 bytes.
pub const HEADER_SIZE: usize = 7;

/// Magic bytes: "CL" (0x43 0x4C).
pub const MAGIC: [u8; 2] = [0x43, 0x4C];

/// Default maximum packet size carried by one stream frame: 16 MiB.
pub const DEFAULT_MAX_PACKET: usize = 16 * 1024 * 1024;

/// What a stream frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Sent once by the accepting side; confirms the session to the connector.
    Session,
    /// One application packet.
    Packet,
}

impl FrameKind {
    fn to_byte(self) -> u8 {
        match self {
            FrameKind::Session => 0,
            FrameKind::Packet => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameKind::Session),
            1 => Some(FrameKind::Packet),
            _ => None,
        }
    }
}

/// Encode one packet into the stream format.
///
/// ```text
/// ┌──────────────┬───────────┬────────┬──────────────────┐
/// │ Magic (2B)   │ Length    │ Kind   │ Packet           │
/// │ 0x43 0x4C    │ (4B LE)   │ (1B)   │ (Length bytes)   │
/// └──────────────┴───────────┴────────┴──────────────────┘
/// ```
pub fn encode_stream_frame(kind: FrameKind, payload: &[u8], dst: &mut BytesMut) -> Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(TransportError::PacketTooLarge {
            size: payload.len(),
            max: u32::MAX as usize,
        });
    }
    dst.reserve(HEADER_SIZE + payload.len());
    dst.put_slice(&MAGIC);
    dst.put_u32_le(payload.len() as u32);
    dst.put_u8(kind.to_byte());
    dst.put_slice(payload);
    Ok(())
}

/// Decode one frame from a stream buffer.
///
/// Returns `Ok(None)` until the buffer holds a complete frame, then consumes it.
pub fn decode_stream_frame(
    src: &mut BytesMut,
    max_packet: usize,
) -> Result<Option<(FrameKind, Bytes)>> {
    if src.len() < HEADER_SIZE {
        return Ok(None);
    }

    if src[0..2] != MAGIC {
        return Err(TransportError::InvalidFrame("bad magic"));
    }

    let len = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
    let kind = FrameKind::from_byte(src[6]).ok_or(TransportError::InvalidFrame("unknown kind"))?;

    if len > max_packet {
        return Err(TransportError::PacketTooLarge {
            size: len,
            max: max_packet,
        });
    }

    if src.len() < HEADER_SIZE + len {
        return Ok(None);
    }

    src.advance(HEADER_SIZE);
    Ok(Some((kind, src.split_to(len).freeze())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_waits_for_complete_frame() {
        let mut buf = BytesMut::new();
        encode_stream_frame(FrameKind::Packet, b"hello", &mut buf).unwrap();
        let full = buf.clone();

        let mut partial = BytesMut::from(&full[..HEADER_SIZE + 2]);
        assert!(decode_stream_frame(&mut partial, DEFAULT_MAX_PACKET)
            .unwrap()
            .is_none());

        let (kind, payload) = decode_stream_frame(&mut buf, DEFAULT_MAX_PACKET)
            .unwrap()
            .unwrap();
        assert_eq!(kind, FrameKind::Packet);
        assert_eq!(payload.as_ref(), b"hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn session_frame_is_empty() {
        let mut buf = BytesMut::new();
        encode_stream_frame(FrameKind::Session, &[], &mut buf).unwrap();
        assert_eq!(buf.len(), HEADER_SIZE);

        let (kind, payload) = decode_stream_frame(&mut buf, DEFAULT_MAX_PACKET)
            .unwrap()
            .unwrap();
        assert_eq!(kind, FrameKind::Session);
        assert!(payload.is_empty());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut buf = BytesMut::from(&[0xFF, 0xFF, 0, 0, 0, 0, 1][..]);
        assert!(matches!(
            decode_stream_frame(&mut buf, DEFAULT_MAX_PACKET),
            Err(TransportError::InvalidFrame(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_slice(&MAGIC);
        buf.put_u32_le(1024);
        buf.put_u8(1);
        assert!(matches!(
            decode_stream_frame(&mut buf, 16),
            Err(TransportError::PacketTooLarge { .. })
        ));
    }

    #[test]
    fn back_to_back_frames() {
        let mut buf = BytesMut::new();
        encode_stream_frame(FrameKind::Session, &[], &mut buf).unwrap();
        encode_stream_frame(FrameKind::Packet, b"x", &mut buf).unwrap();

        let first = decode_stream_frame(&mut buf, DEFAULT_MAX_PACKET).unwrap().unwrap();
        let second = decode_stream_frame(&mut buf, DEFAULT_MAX_PACKET).unwrap().unwrap();
        assert_eq!(first.0, FrameKind::Session);
        assert_eq!((second.0, second.1.as_ref()), (FrameKind::Packet, b"x".as_ref()));
    }
}
