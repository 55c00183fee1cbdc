//! Payload contract and the built-in payload types.

use std::fmt;
use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{DecodeError, EncodeError};

/// A value carried by a channel.
///
/// `parse` receives the packet body with the channel header already removed.
pub trait Payload: Sized + Send + 'static {
    fn parse(bytes: &[u8]) -> Result<Self, DecodeError>;
    fn serialize(&self) -> Result<Vec<u8>, EncodeError>;
}

/// Uninterpreted bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RawBytes(pub Bytes);

impl RawBytes {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }
}

impl Deref for RawBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<&'static [u8]> for RawBytes {
    fn from(bytes: &'static [u8]) -> Self {
        Self(Bytes::from_static(bytes))
    }
}

impl From<Vec<u8>> for RawBytes {
    fn from(bytes: Vec<u8>) -> Self {
        Self(Bytes::from(bytes))
    }
}

impl Payload for RawBytes {
    fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(Bytes::copy_from_slice(bytes)))
    }

    fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(self.0.to_vec())
    }
}

/// JSON-encoded payload for any serde type.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Deref for Json<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> DerefMut for Json<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: fmt::Debug> fmt::Debug for Json<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<T> From<T> for Json<T> {
    fn from(value: T) -> Self {
        Self(value)
    }
}

impl<T> Payload for Json<T>
where
    T: Serialize + DeserializeOwned + Send + 'static,
{
    fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        Ok(Self(serde_json::from_slice(bytes)?))
    }

    fn serialize(&self) -> Result<Vec<u8>, EncodeError> {
        Ok(serde_json::to_vec(&self.0)?)
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Position {
        x: i32,
        y: i32,
    }

    #[test]
    fn raw_bytes_pass_through() {
        let payload = RawBytes::from(&b"\x00\x01binary"[..]);
        let encoded = payload.serialize().unwrap();
        assert_eq!(encoded, b"\x00\x01binary");
        assert_eq!(RawBytes::parse(&encoded).unwrap(), payload);
    }

    #[test]
    fn json_payload_uses_serde() {
        let payload = Json(Position { x: 3, y: -4 });
        let encoded = payload.serialize().unwrap();
        assert_eq!(encoded, br#"{"x":3,"y":-4}"#);
        assert_eq!(Json::<Position>::parse(&encoded).unwrap().x, 3);
    }

    #[test]
    fn json_parse_failure_is_a_decode_error() {
        let err = Json::<Position>::parse(b"{\"x\":").unwrap_err();
        assert!(matches!(err, DecodeError::Json(_)));
    }
}
