//! Key and value coders for the stash storage facade.
//!
//! Every store turns hierarchical key paths into flat strings and typed
//! values into bytes before touching its backend. This crate owns both
//! directions of that mapping.
//!
//! # Key codecs
//!
//! - [`KeyCodec::binary`] -- control bytes `0x1D`/`0x1F` wrap buckets,
//!   `0x1E` separates segments
//! - [`KeyCodec::simple`] -- `[`, `]` and `//`, readable in dumps and files
//!
//! # Value codecs
//!
//! - [`ValueCodec::Json`] -- `serde_json`
//! - [`ValueCodec::Cbor`] -- `ciborium`
//!
//! # Coder
//!
//! A [`Coder`] pairs one of each and carries a table of [`CustomValue`]
//! overrides keyed by `TypeId`. Build one with [`Coder::builder`]; a coder
//! missing either codec fails to build.

pub mod coder;
pub mod error;
pub mod key;
pub mod value;

pub use coder::{Coder, CoderBuilder, CustomValue};
pub use error::{EncodingError, EncodingResult};
pub use key::{KeyCodec, Symbols};
pub use value::ValueCodec;
