//! Items and change events produced by iterate and watch.

use thiserror::Error;

/// One key/value pair from an iteration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Item<V = Vec<u8>> {
    pub key: String,
    pub value: V,
}

/// An item that could not be produced, in place of the bad record.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("{key}: {message}")]
pub struct ItemError {
    pub key: String,
    pub message: String,
}

/// Element of a typed iteration stream.
pub type ItemResult<V> = Result<Item<V>, ItemError>;

/// Discriminant of an [`Event`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum EventKind {
    Put,
    Delete,
    Error,
}

/// A change observed by a watcher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event<V = Vec<u8>> {
    /// The key was created or overwritten.
    Put { key: String, value: V },
    /// The key was removed, explicitly or by TTL expiry.
    Delete { key: String },
    /// The watcher missed events or could not decode one.
    Error { key: String, message: String },
}

impl<V> Event<V> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Put { .. } => EventKind::Put,
            Self::Delete { .. } => EventKind::Delete,
            Self::Error { .. } => EventKind::Error,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. } | Self::Delete { key } | Self::Error { key, .. } => key,
        }
    }

    /// Same event with the key replaced.
    pub fn with_key(self, key: String) -> Self {
        match self {
            Self::Put { value, .. } => Self::Put { key, value },
            Self::Delete { .. } => Self::Delete { key },
            Self::Error { message, .. } => Self::Error { key, message },
        }
    }
}
