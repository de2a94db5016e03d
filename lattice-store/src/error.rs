//! Error types.
//!
//! Public mutation entry points never hand these to UI callers as panics:
//! they log them and keep the previous state. The `try_*` variants of the
//! State API return them for callers that want to branch on the failure.

use thiserror::Error;

use crate::key::Key;
use crate::value::ValueType;

/// Errors produced by the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A value doesn't match the type declared with `State::set_type`.
    #[error("value of type '{actual}' doesn't match the declared type '{expected}'")]
    TypeMismatch {
        expected: ValueType,
        actual: &'static str,
    },

    /// `set_type_tag` received an unknown tag.
    #[error("'{0}' is not a valid value type")]
    InvalidTypeTag(String),

    /// An object was required (patch target, patch changes, collected payload).
    #[error("{target} must be an object")]
    NotAnObject { target: &'static str },

    /// `invert` was called on a non-boolean value.
    #[error("only boolean values can be inverted, found '{0}'")]
    NotBoolean(&'static str),

    /// A collected payload has no usable primary key.
    #[error("payload has no valid primary key at '{0}'")]
    MissingPrimaryKey(String),

    /// The runtime an instance was created on has been dropped.
    #[error("no runtime is reachable from this instance")]
    MissingRuntime,

    /// The collection an Item, Group or Selector belongs to has been dropped.
    #[error("no collection is reachable from this instance")]
    MissingCollection,

    /// A tracking session was started while another one was active.
    #[error("a tracking session is already active")]
    NestedTracking,

    /// An Item key is already taken by a collected Item.
    #[error("an item with key '{0}' already exists")]
    DuplicateItemKey(Key),

    /// Neither an explicit persist key nor an instance key is available.
    #[error("no valid persist key found")]
    InvalidPersistKey,

    /// A storage name that isn't registered was used.
    #[error("storage '{0}' is not registered")]
    UnknownStorage(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Failures reported by storage backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to encode value: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode value: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),
}

/// Result alias used across the crate.
pub type StoreResult<T> = Result<T, StoreError>;
