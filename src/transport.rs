use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::codec::{AttributeValue, Item};

#[cfg(test)]
use mockall::automock;

/// Remote requests issued against the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    PutItem,
    GetItem,
    UpdateItem,
    DeleteItem,
    Scan,
    BatchWriteItem,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PutItem => "PutItem",
            Self::GetItem => "GetItem",
            Self::UpdateItem => "UpdateItem",
            Self::DeleteItem => "DeleteItem",
            Self::Scan => "Scan",
            Self::BatchWriteItem => "BatchWriteItem",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    /// The request timed out before a response arrived
    Timeout,
    /// The request could not be sent (connection, DNS, TLS)
    Dispatch,
    /// The service answered with a modeled error
    Service,
    /// The response could not be read or parsed
    Response,
    /// The request could not be built locally
    Construction,
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::Dispatch => "dispatch",
            Self::Service => "service",
            Self::Response => "response",
            Self::Construction => "construction",
        };
        f.write_str(name)
    }
}

/// A single failed request, classified for the retry policy
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} error{}: {message}", detail(.code, .status))]
pub struct TransportError {
    pub kind: TransportErrorKind,
    /// Service error code such as `ThrottlingException`
    pub code: Option<String>,
    pub status: Option<u16>,
    pub message: String,
}

fn detail(code: &Option<String>, status: &Option<u16>) -> String {
    match (code, status) {
        (Some(code), Some(status)) => format!(" ({code}, HTTP {status})"),
        (Some(code), None) => format!(" ({code})"),
        (None, Some(status)) => format!(" (HTTP {status})"),
        (None, None) => String::new(),
    }
}

impl TransportError {
    pub fn service(code: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Service,
            code: Some(code.into()),
            status,
            message: message.into(),
        }
    }

    pub fn response(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Response,
            code: None,
            status,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::bare(TransportErrorKind::Timeout, message)
    }

    pub fn dispatch(message: impl Into<String>) -> Self {
        Self::bare(TransportErrorKind::Dispatch, message)
    }

    pub fn construction(message: impl Into<String>) -> Self {
        Self::bare(TransportErrorKind::Construction, message)
    }

    fn bare(kind: TransportErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: None,
            status: None,
            message: message.into(),
        }
    }

    pub fn code(&self) -> Option<&str> {
        self.code.as_deref()
    }
}

/// `attribute = value` equality filter
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub attribute: String,
    pub value: AttributeValue,
}

impl Filter {
    pub fn equals(attribute: impl Into<String>, value: AttributeValue) -> Self {
        Self {
            attribute: attribute.into(),
            value,
        }
    }

    pub fn matches(&self, item: &Item) -> bool {
        item.get(&self.attribute) == Some(&self.value)
    }
}

/// Partial update: assign each attribute, optionally only when the item exists
#[derive(Debug, Clone, PartialEq, Default)]
pub struct UpdateRequest {
    pub set: Vec<(String, AttributeValue)>,
    /// Name of an attribute that must already exist on the item
    pub require_existing: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanRequest {
    pub filter: Option<Filter>,
    /// Continuation cursor from the previous page
    pub exclusive_start_key: Option<Item>,
    /// Maximum number of items evaluated for this page
    pub limit: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    pub last_evaluated_key: Option<Item>,
}

/// One method per remote request. Implementations issue exactly one request per
/// call and never retry; retries belong to [`crate::retry::RetryingStore`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ItemStore: Send + Sync + 'static {
    async fn put_item(&self, table: &str, item: Item) -> Result<(), TransportError>;

    /// `Ok(None)` when no item has this key
    async fn get_item(&self, table: &str, key: Item) -> Result<Option<Item>, TransportError>;

    async fn update_item(
        &self,
        table: &str,
        key: Item,
        update: UpdateRequest,
    ) -> Result<(), TransportError>;

    /// Succeeds whether or not the item exists
    async fn delete_item(&self, table: &str, key: Item) -> Result<(), TransportError>;

    async fn scan(&self, table: &str, request: ScanRequest) -> Result<ScanPage, TransportError>;

    /// Writes a batch of puts, returning the items the service left unprocessed
    async fn batch_put(&self, table: &str, items: Vec<Item>) -> Result<Vec<Item>, TransportError>;
}
