//! Typed error handling for dispatch operations.
//!
//! Only a few failures are hard errors for a caller:
//! - Resolution failures (group expansion failed or timed out) abort `resolve()`
//! - Policy misconfiguration fails fast when a retention policy is parsed
//! - Store and configuration failures
//!
//! Invalid addresses and transport failures are never raised; they are
//! bookkept in the report and the blacklist instead.

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::types::{GroupExpression, MessageId, SenderId};

/// Top-level dispatch error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Resolution failed: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("Retention policy error: {0}")]
    Policy(#[from] PolicyError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Unknown sender: {0}")]
    UnknownSender(SenderId),
}

impl DispatchError {
    /// Returns `true` if retrying the same call later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Resolution(ResolutionError::Timeout { .. } | ResolutionError::Unavailable(_))
        )
    }
}

/// Errors raised while expanding recipient groups.
#[derive(Debug, Error)]
pub enum ResolutionError {
    /// The group resolver does not know the expression.
    #[error("Unknown group: {0}")]
    UnknownGroup(GroupExpression),

    /// The group resolver could not be reached or failed internally.
    #[error("Group resolver unavailable: {0}")]
    Unavailable(String),

    /// Expansion did not complete within the configured timeout.
    #[error("Expanding {group} timed out after {secs} seconds")]
    Timeout { group: GroupExpression, secs: u64 },
}

/// Outcome of a failed transport call for one address.
///
/// Permanent failures are terminal for the address; temporary ones leave it
/// pending for the next delivery pass.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("Permanent failure: {0}")]
    Permanent(String),

    #[error("Temporary failure: {0}")]
    Temporary(String),
}

impl SendError {
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }

    #[must_use]
    pub const fn is_temporary(&self) -> bool {
        matches!(self, Self::Temporary(_))
    }

    /// The human readable reason, without the classification prefix.
    #[must_use]
    pub fn reason(&self) -> &str {
        match self {
            Self::Permanent(reason) | Self::Temporary(reason) => reason,
        }
    }
}

/// Malformed retention policy serializations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PolicyError {
    #[error("Empty retention policy token")]
    EmptyToken,

    #[error("Unknown retention policy token: {0}")]
    UnknownToken(String),

    #[error("Invalid message count: {0}")]
    InvalidCount(String),

    #[error("Invalid period: {0}")]
    InvalidPeriod(String),
}

/// Persistence failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Message not found: {0}")]
    MessageNotFound(MessageId),

    #[error("Message already exists: {0}")]
    AlreadyExists(MessageId),

    #[error("Internal store error: {0}")]
    Internal(String),
}

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config from {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("No configuration file found. Tried:\n{0}")]
    NotFound(String),

    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}
