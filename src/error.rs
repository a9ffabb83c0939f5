use std::time::Duration;

use thiserror::Error;

use crate::codec::CodecError;
use crate::retry::RetryError;
use crate::transport::TransportError;

/// Errors surfaced by the user store client
#[derive(Debug, Error)]
pub enum UserStoreError {
    /// Invalid or unresolvable configuration. Fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    #[error("user not found: {0}")]
    NotFound(String),

    /// A remote call failed and the retry policy gave up on it
    #[error("{context} after {attempts} attempt(s): {source}")]
    Operation {
        context: &'static str,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("{context}: deadline of {elapsed:?} exceeded")]
    Timeout {
        context: &'static str,
        elapsed: Duration,
    },

    #[error("{context}: {remaining} item(s) still unprocessed")]
    UnprocessedItems {
        context: &'static str,
        remaining: usize,
    },

    #[error("malformed item: {0}")]
    Codec(#[from] CodecError),
}

impl UserStoreError {
    /// Attach the failing operation's context to a retry outcome
    pub fn from_retry(context: &'static str, err: RetryError) -> Self {
        match err {
            RetryError::GaveUp {
                attempts, source, ..
            } => Self::Operation {
                context,
                attempts,
                source,
            },
            RetryError::DeadlineExceeded(elapsed) => Self::Timeout { context, elapsed },
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, UserStoreError>;
