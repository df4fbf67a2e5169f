//! Session lifecycle and attachment bookkeeping.
//!
//! A [`Client`] represents one end user's session with the coordinating
//! agent. Activation obtains a server-assigned identity and spawns the two
//! background loops; attach/detach maintain the replicated-document set and
//! wake the watch loop so its subscription matches the registry.
//!
//! ```text
//!   Deactivated ──activate()──▶ Activated
//!   Activated ──deactivate()──▶ Deactivated
//! ```
//!
//! Transitions are driven solely by acknowledged RPCs; a failed call leaves
//! the state machine where it was.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};
use tracing::{debug, error};
use uuid::Uuid;

use crate::attachment::{Attachment, AttachmentRegistry};
use crate::constants::{
    DEFAULT_RECONNECT_STREAM_DELAY, DEFAULT_SYNC_LOOP_DURATION, EVENT_CHANNEL_CAPACITY,
};
use crate::document::{ActorId, DocumentHandle, Metadata};
use crate::error::ClientError;
use crate::rpc::{
    ActivateClientRequest, AgentService, AttachDocumentRequest, DeactivateClientRequest,
    DetachDocumentRequest, RpcContext,
};
use crate::subscriptions::{ClientEvent, DocumentSyncedStatus, EventBus};
use crate::sync::{push_pull, spawn_sync_loop};
use crate::watch::spawn_watch_loop;

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Deactivated,
    Activated,
}

/// Client construction options. Everything has a default.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Local key, unique per process instance; generated when not supplied.
    pub key: Option<String>,
    /// Presence metadata advertised to peers.
    pub metadata: Metadata,
    /// Bearer token injected on every outbound RPC.
    pub token: Option<String>,
    /// Sync loop tick while the watch stream is connected.
    pub sync_loop_duration: Duration,
    /// Stream reconnect backoff; degraded sync tick while disconnected.
    pub reconnect_stream_delay: Duration,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            key: None,
            metadata: Metadata::new(),
            token: None,
            sync_loop_duration: DEFAULT_SYNC_LOOP_DURATION,
            reconnect_stream_delay: DEFAULT_RECONNECT_STREAM_DELAY,
        }
    }
}

impl ClientOptions {
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Mutable session state. Guarded by one lock that is never held across an
/// await; RPC continuations and loop tasks re-check `epoch` before touching
/// it.
pub(crate) struct ClientState {
    pub(crate) status: ClientStatus,
    pub(crate) server_id: Option<ActorId>,
    pub(crate) attachments: AttachmentRegistry,
    /// Watch stream connectivity; decides the sync loop cadence.
    pub(crate) stream_connected: bool,
    /// Bumped on every acknowledged activate/deactivate. Tasks and late
    /// RPC responses compare epochs and drop stale work.
    pub(crate) epoch: u64,
    /// True while a DeactivateClient RPC is in flight; parks the watch
    /// loop with its stream closed.
    pub(crate) watch_suspended: bool,
}

/// Shared core behind a [`Client`] handle.
pub(crate) struct ClientInner {
    pub(crate) agent: Arc<dyn AgentService>,
    pub(crate) key: String,
    pub(crate) metadata: Metadata,
    pub(crate) token: Option<String>,
    pub(crate) sync_loop_duration: Duration,
    pub(crate) reconnect_stream_delay: Duration,
    pub(crate) state: Mutex<ClientState>,
    pub(crate) events: EventBus,
    /// Wakes the watch loop to resubscribe, resume, or exit.
    pub(crate) watch_wake: Notify,
}

impl ClientInner {
    pub(crate) fn rpc_context(&self) -> RpcContext {
        RpcContext {
            auth_token: self.token.clone(),
        }
    }

    pub(crate) fn is_active(&self) -> bool {
        self.state.lock().status == ClientStatus::Activated
    }

    /// Whether the activation that spawned `epoch` is still current.
    pub(crate) fn is_active_epoch(&self, epoch: u64) -> bool {
        let st = self.state.lock();
        st.status == ClientStatus::Activated && st.epoch == epoch
    }

    /// Server id, or `ClientNotActive` while deactivated.
    pub(crate) fn require_server_id(&self) -> Result<ActorId, ClientError> {
        let st = self.state.lock();
        match (st.status, &st.server_id) {
            (ClientStatus::Activated, Some(id)) => Ok(id.clone()),
            _ => Err(ClientError::ClientNotActive),
        }
    }
}

/// Handle to one session with the coordinating agent.
///
/// Cheap to clone; all clones share the same session.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Create a deactivated client talking to `agent`.
    pub fn new(agent: Arc<dyn AgentService>, options: ClientOptions) -> Self {
        let key = options
            .key
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            inner: Arc::new(ClientInner {
                agent,
                key,
                metadata: options.metadata,
                token: options.token,
                sync_loop_duration: options.sync_loop_duration,
                reconnect_stream_delay: options.reconnect_stream_delay,
                state: Mutex::new(ClientState {
                    status: ClientStatus::Deactivated,
                    server_id: None,
                    attachments: AttachmentRegistry::new(),
                    stream_connected: false,
                    epoch: 0,
                    watch_suspended: false,
                }),
                events: EventBus::new(EVENT_CHANNEL_CAPACITY),
                watch_wake: Notify::new(),
            }),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Hex form of the agent-assigned identity; present while activated.
    pub fn id(&self) -> Option<String> {
        self.inner.state.lock().server_id.as_ref().map(ActorId::to_hex)
    }

    /// The local key this client registers under.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    /// Presence metadata advertised to peers.
    pub fn metadata(&self) -> &Metadata {
        &self.inner.metadata
    }

    pub fn status(&self) -> ClientStatus {
        self.inner.state.lock().status
    }

    pub fn is_active(&self) -> bool {
        self.inner.is_active()
    }

    /// Snapshot of an attached document's peer set, by hex client id.
    pub fn peers(&self, doc_key: &str) -> Option<HashMap<String, Metadata>> {
        self.inner
            .state
            .lock()
            .attachments
            .get(doc_key)
            .map(|a| a.peer_clients.clone())
    }

    /// Subscribe to session events.
    ///
    /// Hot: only events published after this call are delivered. Dropping
    /// the receiver unsubscribes.
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Register with the agent and start the background loops.
    ///
    /// Idempotent while activated. On RPC failure nothing changes and no
    /// event is published.
    pub async fn activate(&self) -> Result<(), ClientError> {
        if self.inner.is_active() {
            return Ok(());
        }

        let req = ActivateClientRequest {
            client_key: self.inner.key.clone(),
        };
        let resp = self
            .inner
            .agent
            .activate_client(self.inner.rpc_context(), req)
            .await
            .map_err(|e| {
                error!("AC: activate failed for '{}': {e}", self.inner.key);
                e
            })?;

        let id_hex = resp.client_id.to_hex();
        let epoch = {
            let mut st = self.inner.state.lock();
            st.server_id = Some(resp.client_id);
            st.status = ClientStatus::Activated;
            st.stream_connected = false;
            st.watch_suspended = false;
            st.epoch += 1;
            st.epoch
        };
        debug!("AC: activated '{}' as {id_hex}", self.inner.key);

        spawn_sync_loop(self.inner.clone(), epoch);
        spawn_watch_loop(self.inner.clone(), epoch);
        self.inner
            .events
            .publish(ClientEvent::StatusChanged(ClientStatus::Activated));
        Ok(())
    }

    /// Release the server-assigned identity and stop the background loops.
    ///
    /// Idempotent while deactivated. The watch stream is closed before the
    /// RPC goes out; on RPC failure the status stays Activated and the
    /// stream is reopened.
    pub async fn deactivate(&self) -> Result<(), ClientError> {
        let client_id = {
            let mut st = self.inner.state.lock();
            if st.status == ClientStatus::Deactivated {
                return Ok(());
            }
            let Some(client_id) = st.server_id.clone() else {
                return Err(ClientError::ClientNotActive);
            };
            st.watch_suspended = true;
            client_id
        };
        // Drop the stream before telling the agent we are leaving.
        self.inner.watch_wake.notify_one();

        let req = DeactivateClientRequest { client_id };
        if let Err(e) = self
            .inner
            .agent
            .deactivate_client(self.inner.rpc_context(), req)
            .await
        {
            error!("DC: deactivate failed for '{}': {e}", self.inner.key);
            self.inner.state.lock().watch_suspended = false;
            self.inner.watch_wake.notify_one();
            return Err(e.into());
        }

        {
            let mut st = self.inner.state.lock();
            st.status = ClientStatus::Deactivated;
            st.server_id = None;
            st.stream_connected = false;
            st.watch_suspended = false;
            st.epoch += 1;
        }
        // Let the loops observe the stale epoch and exit.
        self.inner.watch_wake.notify_one();
        debug!("DC: deactivated '{}'", self.inner.key);
        self.inner
            .events
            .publish(ClientEvent::StatusChanged(ClientStatus::Deactivated));
        Ok(())
    }

    // ========================================================================
    // Attachments
    // ========================================================================

    /// Start replicating `doc` through this session.
    ///
    /// With `manual_sync` the background loops leave the document alone and
    /// only explicit [`sync`](Client::sync) calls move data.
    pub async fn attach(
        &self,
        doc: Arc<dyn DocumentHandle>,
        manual_sync: bool,
    ) -> Result<(), ClientError> {
        let client_id = self.inner.require_server_id()?;
        let key = doc.key();
        if self.inner.state.lock().attachments.contains(&key) {
            return Err(ClientError::DocumentAlreadyAttached(key));
        }

        doc.set_actor(client_id.clone());
        let req = AttachDocumentRequest {
            client_id,
            change_pack: doc.create_change_pack(),
        };
        let resp = self
            .inner
            .agent
            .attach_document(self.inner.rpc_context(), req)
            .await
            .map_err(|e| {
                error!("AD: attach failed for '{key}': {e}");
                e
            })?;
        doc.apply_change_pack(resp.change_pack)?;

        {
            let mut st = self.inner.state.lock();
            st.attachments
                .insert(key.clone(), Attachment::new(doc, !manual_sync));
        }
        debug!("AD: attached '{key}' (realtime={})", !manual_sync);
        // Resubscribe the watch stream with the new key set.
        self.inner.watch_wake.notify_one();
        Ok(())
    }

    /// Stop replicating `doc`, flushing its final local changes.
    pub async fn detach(&self, doc: Arc<dyn DocumentHandle>) -> Result<(), ClientError> {
        let client_id = self.inner.require_server_id()?;
        let key = doc.key();
        if !self.inner.state.lock().attachments.contains(&key) {
            return Err(ClientError::DocumentNotAttached(key));
        }

        let req = DetachDocumentRequest {
            client_id,
            change_pack: doc.create_change_pack(),
        };
        let resp = self
            .inner
            .agent
            .detach_document(self.inner.rpc_context(), req)
            .await
            .map_err(|e| {
                error!("DD: detach failed for '{key}': {e}");
                e
            })?;
        doc.apply_change_pack(resp.change_pack)?;

        self.inner.state.lock().attachments.remove(&key);
        debug!("DD: detached '{key}'");
        self.inner.watch_wake.notify_one();
        Ok(())
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Push-pull every attached document once, realtime and manual alike.
    ///
    /// Resolves with the attached document handles when all push-pulls
    /// complete. If any fails, one `DocumentSynced(SyncFailed)` event is
    /// published and the first error is returned.
    pub async fn sync(&self) -> Result<Vec<Arc<dyn DocumentHandle>>, ClientError> {
        self.inner.require_server_id()?;
        let (epoch, targets) = {
            let st = self.inner.state.lock();
            (st.epoch, st.attachments.documents())
        };

        let results = futures::future::join_all(targets.iter().map(|(key, doc)| {
            push_pull(self.inner.clone(), epoch, key.clone(), doc.clone())
        }))
        .await;

        let mut first_err = None;
        for result in results {
            if let Err(e) = result {
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }
        if let Some(e) = first_err {
            if self.inner.is_active_epoch(epoch) {
                self.inner
                    .events
                    .publish(ClientEvent::DocumentSynced(DocumentSyncedStatus::SyncFailed));
            }
            return Err(e);
        }
        Ok(targets.into_iter().map(|(_, doc)| doc).collect())
    }
}
