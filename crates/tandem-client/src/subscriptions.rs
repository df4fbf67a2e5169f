//! Session event types and fan-out.
//!
//! Provides [`ClientEvent`], the typed union of everything a session
//! reports to observers, and the crate-internal [`EventBus`] that fans
//! events out over a tokio broadcast channel: hot, in-order per receiver,
//! and with no replay of events published before `subscribe`.

use std::collections::HashMap;

use tokio::sync::broadcast;

use crate::client::ClientStatus;
use crate::document::Metadata;

// ============================================================================
// Event Types
// ============================================================================

/// Watch stream connectivity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamConnectionStatus {
    Connected,
    Disconnected,
}

/// Outcome of a push-pull, as reported to observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSyncedStatus {
    /// One document finished a push-pull.
    Synced,
    /// At least one push-pull in a batch failed.
    SyncFailed,
}

/// Events published by a [`Client`](crate::Client).
///
/// Subscribe via [`Client::subscribe`](crate::Client::subscribe).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The session moved between Activated and Deactivated.
    StatusChanged(ClientStatus),
    /// Remote peers changed the listed documents; a push-pull follows on
    /// the next sync tick.
    DocumentsChanged(Vec<String>),
    /// Peer sets changed for the listed documents
    /// (document key → peer id → metadata).
    PeersChanged(HashMap<String, HashMap<String, Metadata>>),
    /// The watch stream connected or dropped.
    StreamConnectionStatusChanged(StreamConnectionStatus),
    /// A push-pull completed, or a sync batch failed.
    DocumentSynced(DocumentSyncedStatus),
}

// ============================================================================
// Event Bus
// ============================================================================

/// Single-producer fan-out of [`ClientEvent`]s.
///
/// Observers never see events published before they subscribed, and a slow
/// receiver only lags itself; siblings keep receiving.
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish to every live subscriber. A send error just means nobody is
    /// listening right now.
    pub(crate) fn publish(&self, event: ClientEvent) {
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Tests
// ============================================================================
