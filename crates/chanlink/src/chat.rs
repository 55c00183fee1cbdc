//! Chat messages, the channel every chanlink tool speaks.

use chanlink_peer::{ChannelType, Json};
use serde::{Deserialize, Serialize};

/// One chat line. On the wire: `{"msg":"..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub msg: String,
}

impl ChatMessage {
    pub fn new(msg: impl Into<String>) -> Self {
        Self { msg: msg.into() }
    }
}

/// Channel carrying [`ChatMessage`]s as JSON.
pub struct ChatChannel;

impl ChannelType for ChatChannel {
    type Payload = Json<ChatMessage>;

    fn type_name() -> &'static str {
        "chanlink.chat"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chanlink_peer::Payload;

    #[test]
    fn wire_shape_is_a_single_msg_field() {
        let bytes = Json(ChatMessage::new("hi")).serialize().unwrap();
        assert_eq!(bytes, br#"{"msg":"hi"}"#);
    }

    #[test]
    fn parse_rejects_missing_field() {
        assert!(Json::<ChatMessage>::parse(br#"{"text":"hi"}"#).is_err());
    }

    #[test]
    fn type_name_is_stable() {
        assert_eq!(ChatChannel::type_name(), "chanlink.chat");
    }
}
