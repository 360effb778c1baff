//! Payload codecs keyed by content type.
//!
//! Event payloads travel as opaque bytes tagged with a content type. JSON is
//! the wire default and stays readable by non-Rust consumers; `MsgPack` is
//! available for internal traffic.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Content type tag carried with every event payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ContentType {
    #[default]
    #[serde(rename = "application/json")]
    Json,
    #[serde(rename = "application/msgpack")]
    MsgPack,
}

impl ContentType {
    /// MIME string placed in the message properties.
    #[must_use]
    pub fn as_mime(self) -> &'static str {
        match self {
            Self::Json => "application/json",
            Self::MsgPack => "application/msgpack",
        }
    }

    /// Serializes `value` in this content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Encode`] if serialization fails.
    pub fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => serde_json::to_vec(value).map_err(|e| CodecError::Encode {
                content_type: self,
                reason: e.to_string(),
            }),
            Self::MsgPack => rmp_serde::to_vec_named(value).map_err(|e| CodecError::Encode {
                content_type: self,
                reason: e.to_string(),
            }),
        }
    }

    /// Deserializes `bytes` in this content type.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::Decode`] if the bytes are not a valid encoding of `T`.
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => serde_json::from_slice(bytes).map_err(|e| CodecError::Decode {
                content_type: self,
                reason: e.to_string(),
            }),
            Self::MsgPack => rmp_serde::from_slice(bytes).map_err(|e| CodecError::Decode {
                content_type: self,
                reason: e.to_string(),
            }),
        }
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_mime())
    }
}

impl FromStr for ContentType {
    type Err = CodecError;

    /// Parses a MIME string, ignoring parameters such as `; charset=utf-8`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let essence = s.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "application/json" | "text/json" => Ok(Self::Json),
            "application/msgpack" | "application/x-msgpack" => Ok(Self::MsgPack),
            _ => Err(CodecError::UnsupportedContentType(s.to_string())),
        }
    }
}

/// Errors from encoding or decoding event payloads.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode {content_type} payload: {reason}")]
    Encode {
        content_type: ContentType,
        reason: String,
    },
    #[error("failed to decode {content_type} payload: {reason}")]
    Decode {
        content_type: ContentType,
        reason: String,
    },
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
}
