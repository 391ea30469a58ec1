//! Key coders: flatten key paths and bucket paths into single strings.
//!
//! A flattened key is its segments joined by the delimiter. A bucket path is
//! joined the same way and then wrapped in a marker pair, so `[users]` can
//! never be confused with the plain key `users`. Keys stored inside a bucket
//! are `<bucket><delimiter><key>`.
//!
//! Key segments are validated on the way in: a segment may not be empty, may
//! not contain the delimiter, and may not end with a partial delimiter (with
//! `//` the segment `a/` would make `a///b` split as `a`, `/b`).
//!
//! Bucket inputs are normalized before validation the same way
//! [`KeyCodec::decode_bucket`] reads them: markers at either end are treated
//! as wrapping, delimiters split, empty pieces vanish. Encoding an already
//! encoded bucket is therefore a no-op. A marker left inside a piece after
//! that is rejected.

use crate::error::{EncodingError, EncodingResult};

/// Marker and delimiter symbols used by a [`KeyCodec`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Symbols {
    /// Opens a flattened bucket path.
    pub bucket_open: &'static str,
    /// Closes a flattened bucket path.
    pub bucket_close: &'static str,
    /// Separates path segments.
    pub delimiter: &'static str,
}

impl Symbols {
    /// Control-byte symbols that never collide with printable content.
    pub const BINARY: Symbols = Symbols {
        bucket_open: "\x1D",
        bucket_close: "\x1F",
        delimiter: "\x1E",
    };

    /// Human-readable symbols for debugging and hand-edited files.
    pub const SIMPLE: Symbols = Symbols {
        bucket_open: "[",
        bucket_close: "]",
        delimiter: "//",
    };

    fn validate(&self) -> EncodingResult<()> {
        let all = [self.bucket_open, self.bucket_close, self.delimiter];
        if all.iter().any(|s| s.is_empty()) {
            return Err(EncodingError::InvalidSymbols("symbols must be non-empty".into()));
        }
        if self.bucket_open == self.bucket_close
            || self.bucket_open.contains(self.delimiter)
            || self.bucket_close.contains(self.delimiter)
            || self.delimiter.contains(self.bucket_open)
            || self.delimiter.contains(self.bucket_close)
        {
            return Err(EncodingError::InvalidSymbols(format!(
                "markers {:?}/{:?} and delimiter {:?} must be distinct",
                self.bucket_open, self.bucket_close, self.delimiter
            )));
        }
        Ok(())
    }
}

/// A key codec: one symbol set plus the flattening rules.
///
/// Both families share the same algorithm and differ only in their symbols,
/// so switching between them never changes the behaviour of anything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KeyCodec {
    name: &'static str,
    symbols: Symbols,
}

impl KeyCodec {
    /// Control-byte delimiters and markers.
    pub fn binary() -> Self {
        Self {
            name: "binary",
            symbols: Symbols::BINARY,
        }
    }

    /// ASCII `[`, `]` and `//`.
    pub fn simple() -> Self {
        Self {
            name: "simple",
            symbols: Symbols::SIMPLE,
        }
    }

    /// A codec with caller-chosen symbols.
    pub fn with_symbols(name: &'static str, symbols: Symbols) -> EncodingResult<Self> {
        symbols.validate()?;
        Ok(Self { name, symbols })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn symbols(&self) -> Symbols {
        self.symbols
    }

    /// Join key segments with the delimiter. No segments encode to `""`.
    pub fn encode_key<S: AsRef<str>>(&self, segments: &[S]) -> EncodingResult<String> {
        for segment in segments {
            self.check_key_segment(segment.as_ref())?;
        }
        Ok(self.join(segments))
    }

    /// Split a flattened key back into its segments.
    pub fn decode_key(&self, key: &str) -> Vec<String> {
        if key.is_empty() {
            return Vec::new();
        }
        key.split(self.symbols.delimiter).map(str::to_string).collect()
    }

    /// Join bucket segments and wrap them in the bucket markers.
    ///
    /// Accepts wrapped inputs, so `encode_bucket(&[encode_bucket(s)?])` is
    /// the same string as `encode_bucket(s)`.
    pub fn encode_bucket<S: AsRef<str>>(&self, segments: &[S]) -> EncodingResult<String> {
        let segments = self.decode_bucket(segments);
        for segment in &segments {
            self.check_bucket_segment(segment)?;
        }
        Ok(format!(
            "{}{}{}",
            self.symbols.bucket_open,
            self.join(&segments),
            self.symbols.bucket_close
        ))
    }

    /// Wrap `literal` in the bucket markers as one unvalidated segment.
    ///
    /// Markers already at either end are dropped first, so an encoded bucket
    /// comes back unchanged.
    pub fn wrap_bucket(&self, literal: &str) -> String {
        format!(
            "{}{}{}",
            self.symbols.bucket_open,
            self.trim_markers(literal),
            self.symbols.bucket_close
        )
    }

    /// Strip bucket markers from every input and split on the delimiter.
    ///
    /// Inputs may be wrapped bucket strings, bare segments, or a mix; the
    /// segments of all inputs are concatenated in order and empty pieces are
    /// dropped, so re-wrapping never changes the result.
    pub fn decode_bucket<S: AsRef<str>>(&self, buckets: &[S]) -> Vec<String> {
        let mut segments = Vec::new();
        for bucket in buckets {
            for piece in self.trim_markers(bucket.as_ref()).split(self.symbols.delimiter) {
                let piece = self.trim_markers(piece);
                if !piece.is_empty() {
                    segments.push(piece.to_string());
                }
            }
        }
        segments
    }

    /// Flattened key of `key` inside the already-encoded bucket `prefix`.
    pub fn bucket_key(&self, prefix: &str, key: &str) -> EncodingResult<String> {
        self.check_key_segment(key)?;
        Ok(format!("{prefix}{}{key}", self.symbols.delimiter))
    }

    /// Prefix shared by every key stored directly in bucket `prefix`.
    pub fn bucket_scan_prefix(&self, prefix: &str) -> String {
        format!("{prefix}{}", self.symbols.delimiter)
    }

    /// Inverse of [`bucket_key`](Self::bucket_key): the bucket-relative part
    /// of `full`, or `None` when `full` lives elsewhere.
    pub fn strip_bucket<'a>(&self, prefix: &str, full: &'a str) -> Option<&'a str> {
        full.strip_prefix(prefix)?.strip_prefix(self.symbols.delimiter)
    }

    fn join<S: AsRef<str>>(&self, segments: &[S]) -> String {
        let parts: Vec<&str> = segments.iter().map(AsRef::as_ref).collect();
        parts.join(self.symbols.delimiter)
    }

    fn trim_markers<'a>(&self, mut s: &'a str) -> &'a str {
        let Symbols {
            bucket_open,
            bucket_close,
            ..
        } = self.symbols;
        loop {
            let before = s.len();
            s = s.strip_prefix(bucket_open).unwrap_or(s);
            s = s.strip_prefix(bucket_close).unwrap_or(s);
            s = s.strip_suffix(bucket_open).unwrap_or(s);
            s = s.strip_suffix(bucket_close).unwrap_or(s);
            if s.len() == before {
                return s;
            }
        }
    }

    fn check_key_segment(&self, segment: &str) -> EncodingResult<()> {
        if segment.is_empty() {
            return Err(EncodingError::EmptySegment);
        }
        let delimiter = self.symbols.delimiter;
        let reserved = segment.contains(delimiter)
            || (1..delimiter.len())
                .filter(|&i| delimiter.is_char_boundary(i))
                .any(|i| segment.ends_with(&delimiter[..i]));
        if reserved {
            return Err(EncodingError::ReservedSymbol {
                segment: segment.to_string(),
                symbol: delimiter.to_string(),
            });
        }
        Ok(())
    }

    fn check_bucket_segment(&self, segment: &str) -> EncodingResult<()> {
        self.check_key_segment(segment)?;
        for marker in [self.symbols.bucket_open, self.symbols.bucket_close] {
            if segment.contains(marker) {
                return Err(EncodingError::ReservedSymbol {
                    segment: segment.to_string(),
                    symbol: marker.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl std::str::FromStr for KeyCodec {
    type Err = EncodingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "binary" => Ok(Self::binary()),
            "simple" => Ok(Self::simple()),
            other => Err(EncodingError::UnknownCodec(other.to_string())),
        }
    }
}
