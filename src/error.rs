//! Error types for the cloudsave core library.

use thiserror::Error;

use crate::codec::DataType;
use crate::variable::MergePolicy;

/// Errors that can occur while decoding, merging or persisting cloud data.
///
/// This enum is exposed to Swift/Kotlin via UniFFI as a flat error type,
/// meaning the error variants are exposed as simple enum cases with string messages.
#[derive(Error, Debug, Clone, PartialEq)]
#[cfg_attr(feature = "uniffi", derive(uniffi::Error))]
#[cfg_attr(feature = "uniffi", uniffi(flat_error))]
pub enum SyncError {
    /// Error serializing/deserializing JSON
    #[error("JSON error: {0}")]
    JsonError(String),

    /// A stored value does not parse as its declared type.
    /// Recovered by substituting the declared default.
    #[error("value '{value}' is not a valid {data_type}")]
    Format { data_type: DataType, value: String },

    /// A document is missing every alias of a required field.
    #[error("cannot deserialize {owner}: missing field '{alias}'")]
    Deserialization { owner: String, alias: String },

    /// A peer stored a variable under a different merge policy than the local declaration.
    #[error("merge policy mismatch for '{key}': local {local}, remote {remote}")]
    MergePolicyMismatch {
        key: String,
        local: MergePolicy,
        remote: MergePolicy,
    },

    /// Two ledgers for different currencies were handed to the currency merge.
    #[error("cannot merge currency '{local}' with currency '{remote}'")]
    CurrencyIdentityMismatch { local: String, remote: String },

    /// Highest/Lowest declared on a type without an ordering.
    #[error("merge policy {policy} is not supported for {data_type} variable '{key}'")]
    UnsupportedPolicy {
        key: String,
        policy: MergePolicy,
        data_type: DataType,
    },

    /// The declaration registry is invalid
    #[error("invalid declaration: {0}")]
    Declaration(String),

    /// Key is not declared in the registry
    #[error("unknown cloud variable '{0}'")]
    UnknownKey(String),

    /// Typed access with a type other than the declared one
    #[error("cloud variable '{key}' is declared as {declared}, not {requested}")]
    TypeMismatch {
        key: String,
        declared: DataType,
        requested: DataType,
    },

    /// A merge cycle was requested while another one is still running
    #[error("a merge cycle is already in progress")]
    MergeInProgress,

    /// Error reported by the cloud transport
    #[error("transport error: {0}")]
    Transport(String),

    /// Error reading or writing the local cache
    #[error("I/O error: {0}")]
    Io(String),

    /// General error
    #[error("Error: {0}")]
    General(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::JsonError(err.to_string())
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Io(err.to_string())
    }
}

/// Result type alias for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;
