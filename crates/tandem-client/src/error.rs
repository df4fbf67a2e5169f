//! Error types for the coordination core.

use thiserror::Error;

use crate::document::DocumentError;
use crate::rpc::RpcError;

/// Errors returned by [`Client`](crate::Client) operations.
#[derive(Error, Debug)]
pub enum ClientError {
    /// The operation requires an activated client.
    #[error("client is not active")]
    ClientNotActive,

    /// Attach of a key that is already in the registry.
    #[error("document already attached: {0}")]
    DocumentAlreadyAttached(String),

    /// Detach of a key that is not in the registry.
    #[error("document is not attached: {0}")]
    DocumentNotAttached(String),

    /// Transport failure, surfaced verbatim.
    #[error(transparent)]
    Rpc(#[from] RpcError),

    /// The engine rejected a change pack received from the agent.
    #[error(transparent)]
    Document(#[from] DocumentError),
}
