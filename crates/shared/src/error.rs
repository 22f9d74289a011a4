//! Error types shared across crates.

use thiserror::Error;

/// Failure talking to the document store endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("deserialization error: {0}")]
    Deserialize(String),
    /// The store understood the request and refused it.
    #[error("request rejected: {0}")]
    Rejected(String),
}

/// A push notification that cannot be turned into a change event.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown operation type `{0}`")]
    UnknownOperation(String),
    #[error("`{0}` notification carries no document id")]
    MissingDocumentId(String),
}
