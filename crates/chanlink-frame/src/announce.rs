//! Channel announce packets.
//!
//! Sent once per locally created channel so the remote end learns which
//! numeric id the sender uses for a channel type name:
//!
//! ```text
//! CHANNEL|<type-name>|<decimal-id>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{decode_frame, ChannelTypeId, FrameRef};
use crate::error::{FrameError, Result};

/// Literal prefix that marks an announce packet.
pub const ANNOUNCE_PREFIX: &[u8] = b"CHANNEL|";

/// Maximum type name length accepted in an announce, in bytes.
pub const MAX_TYPE_NAME_LEN: usize = 256;

/// A remote channel's type name and wire id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelAnnounce {
    pub type_name: String,
    pub id: ChannelTypeId,
}

impl ChannelAnnounce {
    pub fn new(type_name: impl Into<String>, id: ChannelTypeId) -> Self {
        Self {
            type_name: type_name.into(),
            id,
        }
    }

    /// Encode the full announce packet, prefix included.
    pub fn encode(&self) -> Bytes {
        let id = self.id.to_string();
        let mut buf =
            BytesMut::with_capacity(ANNOUNCE_PREFIX.len() + self.type_name.len() + 1 + id.len());
        buf.put_slice(ANNOUNCE_PREFIX);
        buf.put_slice(self.type_name.as_bytes());
        buf.put_u8(b'|');
        buf.put_slice(id.as_bytes());
        buf.freeze()
    }

    /// Parse an announce body, the bytes following [`ANNOUNCE_PREFIX`].
    ///
    /// The id is taken after the last `|`, so type names may themselves
    /// contain the separator.
    pub fn parse(body: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(body).map_err(|_| FrameError::InvalidUtf8)?;
        let (type_name, id) = text
            .rsplit_once('|')
            .ok_or(FrameError::MissingSeparator)?;

        if type_name.is_empty() {
            return Err(FrameError::EmptyTypeName);
        }
        if type_name.len() > MAX_TYPE_NAME_LEN {
            return Err(FrameError::TypeNameTooLong {
                len: type_name.len(),
                max: MAX_TYPE_NAME_LEN,
            });
        }

        let id = id
            .parse::<ChannelTypeId>()
            .map_err(|_| FrameError::InvalidChannelId(id.to_string()))?;

        Ok(Self::new(type_name, id))
    }
}

/// What an inbound packet turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub enum Inbound<'a> {
    /// A channel announce, parsed or not.
    Announce(Result<ChannelAnnounce>),
    /// An application frame.
    Data(FrameRef<'a>),
}

/// Classify an inbound packet.
///
/// A packet is an announce when it starts with [`ANNOUNCE_PREFIX`] and has
/// something after it; everything else is decoded as an application frame.
pub fn classify(packet: &[u8]) -> Result<Inbound<'_>> {
    match packet.strip_prefix(ANNOUNCE_PREFIX) {
        Some(body) if !body.is_empty() => Ok(Inbound::Announce(ChannelAnnounce::parse(body))),
        _ => decode_frame(packet).map(Inbound::Data),
    }
}
