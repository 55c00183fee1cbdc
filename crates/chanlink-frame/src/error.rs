/// Errors that can occur while encoding or decoding chanlink packets.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The packet is shorter than the channel id header.
    #[error("packet too short for a channel header ({len} bytes, need {need})")]
    TooShort { len: usize, need: usize },

    /// An announce body has no `|` between the type name and the id.
    #[error("channel announce is missing the '|' separator")]
    MissingSeparator,

    /// The announced id is not a decimal u32.
    #[error("channel announce has an invalid id '{0}'")]
    InvalidChannelId(String),

    /// The announce body is not valid UTF-8.
    #[error("channel announce is not valid UTF-8")]
    InvalidUtf8,

    /// The announced type name is empty.
    #[error("channel announce has an empty type name")]
    EmptyTypeName,

    /// The announced type name exceeds the allowed length.
    #[error("channel type name too long ({len} bytes, max {max})")]
    TypeNameTooLong { len: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
