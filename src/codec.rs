//! Content codec abstraction (§1, §3, §4.7, §6).
//!
//! Concrete record (de)serialization is out of scope for the core — it is
//! "assumed provided by a code-generator that yields per-method
//! encode/decode/toJSON/fromJSON" (§1). [`Message`] is the trait such
//! generated code implements; the core only ever calls through it.

use crate::status::TempoError;

/// The two codecs a channel/router can speak (§1, §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentCodec {
    Binary,
    Json,
}

impl ContentCodec {
    /// `application/tempo+bebop` or `application/tempo+json; charset=utf-8`
    /// (§4.7, §6). The binary codec's wire name is `bebop`, matching the
    /// record format the spec's code-generator targets.
    pub fn content_type(self) -> &'static str {
        match self {
            ContentCodec::Binary => "application/tempo+bebop",
            ContentCodec::Json => "application/tempo+json; charset=utf-8",
        }
    }

    /// Parse the codec component out of a `content-type` header value,
    /// ignoring a trailing `; charset=...` parameter.
    pub fn from_content_type(value: &str) -> Option<Self> {
        let base = value.split(';').next()?.trim();
        match base {
            "application/tempo+bebop" => Some(ContentCodec::Binary),
            "application/tempo+json" => Some(ContentCodec::Json),
            _ => None,
        }
    }
}

/// A record type a generated method can encode/decode in either codec.
pub trait Message: Sized + Send + Sync + 'static {
    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, TempoError>;
    fn encode_json(&self) -> Result<String, TempoError>;
    fn decode_json(text: &str) -> Result<Self, TempoError>;

    fn encode_with(&self, codec: ContentCodec) -> Result<Vec<u8>, TempoError> {
        match codec {
            ContentCodec::Binary => Ok(self.encode()),
            ContentCodec::Json => Ok(self.encode_json()?.into_bytes()),
        }
    }

    fn decode_with(bytes: &[u8], codec: ContentCodec) -> Result<Self, TempoError> {
        match codec {
            ContentCodec::Binary => Self::decode(bytes),
            ContentCodec::Json => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    crate::status::TempoError::new(
                        crate::status::StatusCode::InvalidArgument,
                        e.to_string(),
                    )
                })?;
                Self::decode_json(text)
            }
        }
    }
}

/// Implement [`Message`] for any `serde`-compatible type using JSON for the
/// JSON codec and JSON bytes for the binary codec too — a pragmatic default
/// for services that haven't run the binary-record code-generator. Real
/// generated types implement [`Message`] directly with their own binary
/// encoder instead of using this blanket impl.
#[macro_export]
macro_rules! impl_message_via_serde {
    ($ty:ty) => {
        impl $crate::codec::Message for $ty {
            fn encode(&self) -> Vec<u8> {
                serde_json::to_vec(self).expect("serde_json encode of a well-formed record")
            }

            fn decode(bytes: &[u8]) -> Result<Self, $crate::status::TempoError> {
                serde_json::from_slice(bytes).map_err(Into::into)
            }

            fn encode_json(&self) -> Result<String, $crate::status::TempoError> {
                serde_json::to_string(self).map_err(Into::into)
            }

            fn decode_json(text: &str) -> Result<Self, $crate::status::TempoError> {
                serde_json::from_str(text).map_err(Into::into)
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_type_roundtrip() {
        assert_eq!(
            ContentCodec::from_content_type("application/tempo+bebop"),
            Some(ContentCodec::Binary)
        );
        assert_eq!(
            ContentCodec::from_content_type("application/tempo+json; charset=utf-8"),
            Some(ContentCodec::Json)
        );
        assert_eq!(ContentCodec::from_content_type("text/plain"), None);
    }
}
