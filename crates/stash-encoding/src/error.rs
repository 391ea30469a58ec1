use thiserror::Error;

/// Errors produced by key and value coders.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EncodingError {
    /// A key or bucket segment contains a symbol reserved by the key codec.
    #[error("segment {segment:?} collides with reserved symbol {symbol:?}")]
    ReservedSymbol { segment: String, symbol: String },

    /// Key and bucket segments must be non-empty.
    #[error("empty path segment")]
    EmptySegment,

    /// Custom key codec symbols are unusable.
    #[error("invalid key symbols: {0}")]
    InvalidSymbols(String),

    /// A codec name did not match any known key or value codec.
    #[error("unknown codec {0:?}")]
    UnknownCodec(String),

    /// The value could not be serialized.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The bytes are not valid for the codec's wire format.
    #[error("invalid data: {0}")]
    Malformed(String),

    /// The bytes are well formed but do not fit the requested type.
    #[error("decode failed: {0}")]
    Mismatch(String),

    /// A coder was built without a key or value codec.
    #[error("{0} coder not set")]
    MissingCoder(&'static str),

    /// A registered custom coder was handed a value of another type.
    #[error("custom coder for {type_name} received a value of another type")]
    OverrideType { type_name: &'static str },
}

impl EncodingError {
    /// Returns `true` for failures while turning bytes back into a value.
    pub fn is_decode(&self) -> bool {
        matches!(self, Self::Malformed(_) | Self::Mismatch(_))
    }
}

/// Result alias for coder operations.
pub type EncodingResult<T> = Result<T, EncodingError>;
