use thiserror::Error;

use crate::{executor::BoxError, gateway::GatewayError, store::StoreError};

/// An error surfaced to the host, failing the invocation so it can be
/// retried. Protocol misuse never appears here; it is answered with close
/// codes instead.
#[derive(Debug, Error)]
pub enum Error {
    /// The shared store failed.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// The gateway rejected an operation the machine cannot continue without.
    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    /// An application hook failed.
    #[error("hook error: {0}")]
    Hook(#[source] BoxError),

    /// The subscription resolver failed; the client socket has already been
    /// closed with code 4400.
    #[error("subscription resolver error: {0}")]
    Resolver(#[source] BoxError),

    /// The query or mutation executor failed.
    #[error("execution error: {0}")]
    Execution(#[source] BoxError),

    /// An outbound frame could not be encoded.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A Complete message referenced a subscription with no stored payload
    /// record.
    #[error("no subscribe payload record for subscription `{0}`")]
    MissingSubscriptionRecord(String),

    /// A publisher was given an empty topic name.
    #[error("topic names must be non-empty")]
    InvalidTopic,
}
