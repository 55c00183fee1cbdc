//! Wire protocol for chanlink connections.
//!
//! Two kinds of packet share one transport session:
//! - Application frames: a 4-byte big-endian channel type id followed by the
//!   payload bytes, opaque at this layer
//! - Channel announces: the ASCII prefix `CHANNEL|` followed by
//!   `<type-name>|<decimal-id>`, telling the remote end which id a channel
//!   type uses on the wire
//!
//! [`classify`] tells them apart.

pub mod announce;
pub mod codec;
pub mod error;

pub use announce::{classify, ChannelAnnounce, Inbound, ANNOUNCE_PREFIX, MAX_TYPE_NAME_LEN};
pub use codec::{decode_frame, encode_frame, ChannelTypeId, FrameRef, HEADER_SIZE};
pub use error::{FrameError, Result};
