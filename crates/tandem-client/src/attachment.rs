//! Per-document attachment records.
//!
//! An attachment is the client's bookkeeping for one replicated document:
//! the engine handle, the sync mode, the co-editing peer set, and the dirty
//! bit the watch demultiplexer raises when remote changes land. The
//! registry is owned by the client and never exposed; every mutation
//! happens under the client's state lock.

use std::collections::HashMap;
use std::sync::Arc;

use crate::document::{DocumentHandle, Metadata};

/// One attached document.
pub(crate) struct Attachment {
    /// Engine handle, shared with the caller.
    pub(crate) doc: Arc<dyn DocumentHandle>,
    /// Driven by the background loops when true; only explicit `sync()`
    /// moves data when false.
    pub(crate) realtime_sync: bool,
    /// Remote peers currently watching this document, by hex client id.
    pub(crate) peer_clients: HashMap<String, Metadata>,
    /// Raised by the watch demultiplexer, cleared by the sync loop when a
    /// push-pull is issued.
    pub(crate) remote_dirty: bool,
}

impl Attachment {
    pub(crate) fn new(doc: Arc<dyn DocumentHandle>, realtime_sync: bool) -> Self {
        Self {
            doc,
            realtime_sync,
            peer_clients: HashMap::new(),
            remote_dirty: false,
        }
    }
}

/// Document key → attachment.
#[derive(Default)]
pub(crate) struct AttachmentRegistry {
    entries: HashMap<String, Attachment>,
}

impl AttachmentRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub(crate) fn insert(&mut self, key: String, attachment: Attachment) {
        self.entries.insert(key, attachment);
    }

    pub(crate) fn remove(&mut self, key: &str) -> Option<Attachment> {
        self.entries.remove(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn get(&self, key: &str) -> Option<&Attachment> {
        self.entries.get(key)
    }

    pub(crate) fn get_mut(&mut self, key: &str) -> Option<&mut Attachment> {
        self.entries.get_mut(key)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Attachment)> {
        self.entries.iter()
    }

    /// All attached documents, realtime or manual, for `sync()`.
    pub(crate) fn documents(&self) -> Vec<(String, Arc<dyn DocumentHandle>)> {
        self.entries
            .iter()
            .map(|(k, a)| (k.clone(), a.doc.clone()))
            .collect()
    }

    /// Realtime documents that need a push-pull this tick.
    ///
    /// Clears each selected attachment's dirty bit before returning it: a
    /// remote change arriving while the RPC is in flight must re-raise the
    /// bit and trigger a follow-up sync.
    pub(crate) fn take_sync_targets(&mut self) -> Vec<(String, Arc<dyn DocumentHandle>)> {
        self.entries
            .iter_mut()
            .filter(|(_, a)| a.realtime_sync && (a.remote_dirty || a.doc.has_local_changes()))
            .map(|(k, a)| {
                a.remote_dirty = false;
                (k.clone(), a.doc.clone())
            })
            .collect()
    }
}

// ============================================================================
// Tests
// ============================================================================
