//! Agent RPC surface.
//!
//! The transport (framing, connection management, deadlines) is an external
//! collaborator; the core talks to the coordinating agent through
//! [`AgentService`]: five unary calls plus the server-streaming
//! WatchDocuments call. Every outbound call carries an [`RpcContext`] so
//! the transport can inject the session's bearer token as metadata.

use std::collections::HashMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::document::{ActorId, ChangePack, DocumentKey, Metadata};

/// Transport metadata attached to every outbound call.
#[derive(Debug, Clone, Default)]
pub struct RpcContext {
    /// Bearer token, when the session was configured with one.
    pub auth_token: Option<String>,
}

/// Errors surfaced by the transport layer.
#[derive(Error, Debug, Clone)]
pub enum RpcError {
    /// The call never reached the agent, or the connection dropped mid-call.
    #[error("transport error: {0}")]
    Transport(String),

    /// The agent answered with a failure status.
    #[error("agent rejected the call: {0}")]
    Rejected(String),
}

// ============================================================================
// Unary messages
// ============================================================================

#[derive(Debug, Clone)]
pub struct ActivateClientRequest {
    pub client_key: String,
}

#[derive(Debug, Clone)]
pub struct ActivateClientResponse {
    pub client_id: ActorId,
}

#[derive(Debug, Clone)]
pub struct DeactivateClientRequest {
    pub client_id: ActorId,
}

#[derive(Debug, Clone)]
pub struct AttachDocumentRequest {
    pub client_id: ActorId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone)]
pub struct AttachDocumentResponse {
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone)]
pub struct DetachDocumentRequest {
    pub client_id: ActorId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone)]
pub struct DetachDocumentResponse {
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone)]
pub struct PushPullRequest {
    pub client_id: ActorId,
    pub change_pack: ChangePack,
}

#[derive(Debug, Clone)]
pub struct PushPullResponse {
    pub change_pack: ChangePack,
}

// ============================================================================
// Watch stream messages
// ============================================================================

/// Identity plus presence metadata, as advertised on the watch stream.
#[derive(Debug, Clone)]
pub struct WatchClient {
    pub client_id: ActorId,
    pub metadata: Metadata,
}

#[derive(Debug, Clone)]
pub struct WatchDocumentsRequest {
    pub client: WatchClient,
    pub document_keys: Vec<DocumentKey>,
}

/// One frame on the watch stream.
#[derive(Debug, Clone)]
pub enum WatchDocumentsResponse {
    /// Sent once at stream start: the current peer set per watched
    /// document, keyed by combined document key.
    Initialization {
        peers_by_doc: HashMap<String, Vec<WatchClient>>,
    },
    /// Peer or change notification.
    Event(DocEvent),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocEventType {
    /// A peer started watching the listed documents.
    DocumentsWatched,
    /// A peer stopped watching the listed documents.
    DocumentsUnwatched,
    /// The listed documents changed on the agent.
    DocumentsChanged,
}

#[derive(Debug, Clone)]
pub struct DocEvent {
    pub event_type: DocEventType,
    pub publisher: WatchClient,
    pub document_keys: Vec<DocumentKey>,
}

/// Server-push frames; the stream ends when the agent closes the watch.
pub type WatchStream = BoxStream<'static, Result<WatchDocumentsResponse, RpcError>>;

// ============================================================================
// Service trait
// ============================================================================

/// The agent's RPC surface as consumed by the coordination core.
///
/// Implementations wrap a concrete transport and are responsible for
/// injecting `ctx.auth_token` into each call's metadata.
#[async_trait]
pub trait AgentService: Send + Sync + 'static {
    async fn activate_client(
        &self,
        ctx: RpcContext,
        req: ActivateClientRequest,
    ) -> Result<ActivateClientResponse, RpcError>;

    async fn deactivate_client(
        &self,
        ctx: RpcContext,
        req: DeactivateClientRequest,
    ) -> Result<(), RpcError>;

    async fn attach_document(
        &self,
        ctx: RpcContext,
        req: AttachDocumentRequest,
    ) -> Result<AttachDocumentResponse, RpcError>;

    async fn detach_document(
        &self,
        ctx: RpcContext,
        req: DetachDocumentRequest,
    ) -> Result<DetachDocumentResponse, RpcError>;

    async fn push_pull(
        &self,
        ctx: RpcContext,
        req: PushPullRequest,
    ) -> Result<PushPullResponse, RpcError>;

    async fn watch_documents(
        &self,
        ctx: RpcContext,
        req: WatchDocumentsRequest,
    ) -> Result<WatchStream, RpcError>;
}
