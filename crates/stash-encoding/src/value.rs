//! Value coders: typed values to bytes and back.
//!
//! Decoding distinguishes bytes that are not valid for the wire format
//! ([`EncodingError::Malformed`]) from valid bytes that do not fit the
//! requested type ([`EncodingError::Mismatch`]). Empty input is a no-op.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::error::Category;

use crate::error::{EncodingError, EncodingResult};

/// Serialization format for stored values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueCodec {
    /// `serde_json` text.
    Json,
    /// CBOR via `ciborium`.
    Cbor,
}

impl ValueCodec {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Cbor => "cbor",
        }
    }

    /// Serialize `value` into a fresh buffer.
    pub fn encode<V: Serialize + ?Sized>(&self, value: &V) -> EncodingResult<Vec<u8>> {
        match self {
            Self::Json => {
                serde_json::to_vec(value).map_err(|e| EncodingError::Encode(e.to_string()))
            }
            Self::Cbor => {
                let mut out = Vec::new();
                ciborium::into_writer(value, &mut out)
                    .map_err(|e| EncodingError::Encode(e.to_string()))?;
                Ok(out)
            }
        }
    }

    /// Decode `data` into `out`. Leaves `out` untouched when `data` is empty.
    pub fn decode_into<V: DeserializeOwned>(&self, data: &[u8], out: &mut V) -> EncodingResult<()> {
        if data.is_empty() {
            return Ok(());
        }
        *out = self.decode_nonempty(data)?;
        Ok(())
    }

    /// Decode `data` into a fresh value, `V::default()` when `data` is empty.
    pub fn decode<V: DeserializeOwned + Default>(&self, data: &[u8]) -> EncodingResult<V> {
        let mut out = V::default();
        self.decode_into(data, &mut out)?;
        Ok(out)
    }

    fn decode_nonempty<V: DeserializeOwned>(&self, data: &[u8]) -> EncodingResult<V> {
        match self {
            Self::Json => serde_json::from_slice(data).map_err(|e| match e.classify() {
                Category::Data => EncodingError::Mismatch(e.to_string()),
                Category::Io | Category::Syntax | Category::Eof => {
                    EncodingError::Malformed(e.to_string())
                }
            }),
            Self::Cbor => {
                let mut rest = data;
                let value = ciborium::from_reader(&mut rest).map_err(|e| match e {
                    ciborium::de::Error::Semantic(_, msg) => EncodingError::Mismatch(msg),
                    other => EncodingError::Malformed(other.to_string()),
                })?;
                if !rest.is_empty() {
                    return Err(EncodingError::Malformed(format!(
                        "{} trailing bytes after CBOR value",
                        rest.len()
                    )));
                }
                Ok(value)
            }
        }
    }
}

impl std::str::FromStr for ValueCodec {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(Self::Json),
            "cbor" => Ok(Self::Cbor),
            other => Err(EncodingError::UnknownCodec(other.to_string())),
        }
    }
}
