//! Document-engine seam.
//!
//! The coordination core drives replication for documents it does not
//! implement: the CRDT engine lives behind [`DocumentHandle`], and the core
//! only moves opaque [`ChangePack`]s between the engine and the agent. Wire
//! serialization of packs is owned by the transport layer.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Presence metadata advertised to peers (display name, color, ...).
pub type Metadata = HashMap<String, String>;

/// Agent-assigned client identity.
///
/// Raw bytes on the wire; rendered as lowercase hex everywhere the core
/// keys or logs peers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ActorId(Vec<u8>);

impl ActorId {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lowercase hex form, the peer-map key.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }
}

impl From<Vec<u8>> for ActorId {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ActorId({})", self.to_hex())
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Rich document key used on the wire.
///
/// The combined id string keys the attachment registry and must equal what
/// [`DocumentHandle::key`] returns for the same document.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentKey {
    pub collection: String,
    pub document: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, document: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            document: document.into(),
        }
    }

    /// Combined form, `collection$document`.
    pub fn id_string(&self) -> String {
        format!("{}${}", self.collection, self.document)
    }
}

/// Monotone cursor marking the last mutually acknowledged position of a
/// document's change history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Checkpoint {
    pub server_seq: u64,
    pub client_seq: u32,
}

impl Checkpoint {
    pub const INITIAL: Checkpoint = Checkpoint {
        server_seq: 0,
        client_seq: 0,
    };

    /// Merge with `other`, keeping the furthest position on both axes.
    /// Never moves backwards, so redelivery of an old pack is safe.
    pub fn forward(&self, other: &Checkpoint) -> Checkpoint {
        Checkpoint {
            server_seq: self.server_seq.max(other.server_seq),
            client_seq: self.client_seq.max(other.client_seq),
        }
    }
}

/// Opaque batch of encoded CRDT changes plus the checkpoint they advance.
///
/// Produced and consumed by the engine; the core only forwards packs and
/// reads [`change_count`](ChangePack::change_count) for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangePack {
    pub document_key: DocumentKey,
    pub checkpoint: Checkpoint,
    pub changes: Vec<Vec<u8>>,
}

impl ChangePack {
    pub fn new(document_key: DocumentKey, checkpoint: Checkpoint, changes: Vec<Vec<u8>>) -> Self {
        Self {
            document_key,
            checkpoint,
            changes,
        }
    }

    pub fn change_count(&self) -> usize {
        self.changes.len()
    }
}

/// Errors surfaced by the document engine while applying a remote pack.
#[derive(Error, Debug)]
pub enum DocumentError {
    /// Pack addressed to a different document.
    #[error("change pack is for document '{got}', expected '{expected}'")]
    KeyMismatch { expected: String, got: String },

    /// The engine rejected the pack contents.
    #[error("failed to apply change pack: {0}")]
    Apply(String),
}

/// Handle to a CRDT document driven by the coordination core.
///
/// Implementations own their interior synchronization: the core may call
/// these methods from the sync loop and from user tasks concurrently, and
/// `apply_change_pack` calls for one document must take effect in
/// invocation order.
pub trait DocumentHandle: std::fmt::Debug + Send + Sync {
    /// Bind the CRDT actor to the agent-assigned client identity.
    fn set_actor(&self, actor: ActorId);

    /// Stable registry key; equals `document_key().id_string()`.
    fn key(&self) -> String;

    /// Rich key for wire use.
    fn document_key(&self) -> DocumentKey;

    /// Drain local unsynced changes into a transmittable pack.
    fn create_change_pack(&self) -> ChangePack;

    /// Apply a pack received from the agent.
    fn apply_change_pack(&self, pack: ChangePack) -> Result<(), DocumentError>;

    /// Whether local changes are waiting to be pushed.
    fn has_local_changes(&self) -> bool;
}
