//! Tandem client coordination core.
//!
//! Represents a single end user's session to the coordinating agent and
//! drives replication of CRDT documents between that user and remote
//! peers. Three concerns live here: session lifecycle, attachment
//! bookkeeping, and the two background loops (sync and watch). The CRDT
//! engine and the RPC transport are external collaborators behind the
//! [`DocumentHandle`] and [`AgentService`] traits.
//!
//! ```text
//!   attach/detach/sync ──▶ Client ──▶ attachment registry
//!                            │              ▲
//!              sync loop ◀───┤              │ peer sets, dirty bits
//!             watch loop ◀───┴─ wake   demultiplexer ──▶ event bus
//! ```

pub mod client;
pub mod constants;
pub mod document;
pub mod error;
pub mod rpc;
pub mod subscriptions;

mod attachment;
mod sync;
mod watch;


pub use client::{Client, ClientOptions, ClientStatus};
pub use document::{
    ActorId, ChangePack, Checkpoint, DocumentError, DocumentHandle, DocumentKey, Metadata,
};
pub use error::ClientError;
pub use rpc::{
    AgentService, DocEvent, DocEventType, RpcContext, RpcError, WatchClient,
    WatchDocumentsRequest, WatchDocumentsResponse, WatchStream,
};
pub use subscriptions::{ClientEvent, DocumentSyncedStatus, StreamConnectionStatus};
