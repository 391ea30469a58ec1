use thiserror::Error;

use stash_core::StoreError;
use stash_encoding::EncodingError;

#[derive(Debug, Error)]
pub enum StashError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<toml::de::Error> for StashError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

pub type StashResult<T> = Result<T, StashError>;
