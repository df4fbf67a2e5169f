//! Test doubles for driving a client end to end: a scriptable agent that
//! records every RPC and hands out controllable watch streams, and a mock
//! document handle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use tandem_client::{
    ActorId, AgentService, ChangePack, Checkpoint, ClientEvent, DocEvent, DocEventType,
    DocumentError, DocumentHandle, DocumentKey, Metadata, RpcContext, RpcError, WatchClient,
    WatchDocumentsRequest, WatchDocumentsResponse, WatchStream,
};
use tandem_client::rpc::{
    ActivateClientRequest, ActivateClientResponse, AttachDocumentRequest, AttachDocumentResponse,
    DeactivateClientRequest, DetachDocumentRequest, DetachDocumentResponse, PushPullRequest,
    PushPullResponse,
};

// ============================================================================
// Recorded calls
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Activate { client_key: String },
    Deactivate { client_id: ActorId },
    Attach { key: String },
    Detach { key: String },
    PushPull { key: String, change_count: usize },
    Watch { keys: Vec<String> },
}

/// Sender side of one watch stream the agent handed out.
#[derive(Clone)]
pub struct WatchHandle {
    pub keys: Vec<String>,
    tx: mpsc::UnboundedSender<Result<WatchDocumentsResponse, RpcError>>,
}

impl WatchHandle {
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub fn send_init(&self, peers: Vec<(&str, Vec<WatchClient>)>) {
        let peers_by_doc = peers
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        self.tx
            .send(Ok(WatchDocumentsResponse::Initialization { peers_by_doc }))
            .expect("watch stream gone");
    }

    pub fn send_init_empty(&self) {
        self.send_init(Vec::new());
    }

    pub fn send_event(&self, event_type: DocEventType, publisher: WatchClient, keys: &[&str]) {
        self.tx
            .send(Ok(WatchDocumentsResponse::Event(DocEvent {
                event_type,
                publisher,
                document_keys: keys.iter().map(|k| doc_key(k)).collect(),
            })))
            .expect("watch stream gone");
    }

    pub fn send_changed(&self, keys: &[&str]) {
        self.send_event(DocEventType::DocumentsChanged, peer(0xee, "publisher"), keys);
    }

    pub fn send_err(&self) {
        self.tx
            .send(Err(RpcError::Transport("stream torn down".to_string())))
            .expect("watch stream gone");
    }
}

// ============================================================================
// Mock agent
// ============================================================================

pub struct MockAgent {
    client_id: Vec<u8>,
    calls: Mutex<Vec<Call>>,
    tokens_seen: Mutex<Vec<Option<String>>>,
    watch_streams: Mutex<Vec<WatchHandle>>,
    pp_hold: Mutex<Option<Arc<Notify>>>,
    pub fail_activate: AtomicBool,
    pub fail_deactivate: AtomicBool,
    pub fail_attach: AtomicBool,
    pub fail_detach: AtomicBool,
    pub fail_push_pull: AtomicBool,
}

impl MockAgent {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            client_id: vec![0xab, 0xcd],
            calls: Mutex::new(Vec::new()),
            tokens_seen: Mutex::new(Vec::new()),
            watch_streams: Mutex::new(Vec::new()),
            pp_hold: Mutex::new(None),
            fail_activate: AtomicBool::new(false),
            fail_deactivate: AtomicBool::new(false),
            fail_attach: AtomicBool::new(false),
            fail_detach: AtomicBool::new(false),
            fail_push_pull: AtomicBool::new(false),
        })
    }

    /// Hex id every activation hands out.
    pub fn client_id_hex(&self) -> String {
        hex::encode(&self.client_id)
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn tokens_seen(&self) -> Vec<Option<String>> {
        self.tokens_seen.lock().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    pub fn activate_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Activate { .. }))
    }

    pub fn deactivate_count(&self) -> usize {
        self.count(|c| matches!(c, Call::Deactivate { .. }))
    }

    pub fn push_pull_count(&self) -> usize {
        self.count(|c| matches!(c, Call::PushPull { .. }))
    }

    pub fn push_pull_count_for(&self, key: &str) -> usize {
        self.count(|c| matches!(c, Call::PushPull { key: k, .. } if k == key))
    }

    pub fn watch_count(&self) -> usize {
        self.watch_streams.lock().len()
    }

    pub fn watch(&self, idx: usize) -> WatchHandle {
        self.watch_streams.lock()[idx].clone()
    }

    /// Make the next push-pull park until the returned latch is notified.
    pub fn hold_push_pull(&self) -> Arc<Notify> {
        let latch = Arc::new(Notify::new());
        *self.pp_hold.lock() = Some(latch.clone());
        latch
    }

    fn record(&self, ctx: &RpcContext, call: Call) {
        self.calls.lock().push(call);
        self.tokens_seen.lock().push(ctx.auth_token.clone());
    }

    fn echo_pack(pack: &ChangePack) -> ChangePack {
        ChangePack::new(pack.document_key.clone(), pack.checkpoint, Vec::new())
    }
}

fn injected() -> RpcError {
    RpcError::Rejected("injected failure".to_string())
}

#[async_trait]
impl AgentService for MockAgent {
    async fn activate_client(
        &self,
        ctx: RpcContext,
        req: ActivateClientRequest,
    ) -> Result<ActivateClientResponse, RpcError> {
        self.record(&ctx, Call::Activate {
            client_key: req.client_key,
        });
        if self.fail_activate.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(ActivateClientResponse {
            client_id: ActorId::new(self.client_id.clone()),
        })
    }

    async fn deactivate_client(
        &self,
        ctx: RpcContext,
        req: DeactivateClientRequest,
    ) -> Result<(), RpcError> {
        self.record(&ctx, Call::Deactivate {
            client_id: req.client_id,
        });
        if self.fail_deactivate.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(())
    }

    async fn attach_document(
        &self,
        ctx: RpcContext,
        req: AttachDocumentRequest,
    ) -> Result<AttachDocumentResponse, RpcError> {
        self.record(&ctx, Call::Attach {
            key: req.change_pack.document_key.id_string(),
        });
        if self.fail_attach.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(AttachDocumentResponse {
            change_pack: Self::echo_pack(&req.change_pack),
        })
    }

    async fn detach_document(
        &self,
        ctx: RpcContext,
        req: DetachDocumentRequest,
    ) -> Result<DetachDocumentResponse, RpcError> {
        self.record(&ctx, Call::Detach {
            key: req.change_pack.document_key.id_string(),
        });
        if self.fail_detach.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(DetachDocumentResponse {
            change_pack: Self::echo_pack(&req.change_pack),
        })
    }

    async fn push_pull(
        &self,
        ctx: RpcContext,
        req: PushPullRequest,
    ) -> Result<PushPullResponse, RpcError> {
        self.record(&ctx, Call::PushPull {
            key: req.change_pack.document_key.id_string(),
            change_count: req.change_pack.change_count(),
        });
        let hold = self.pp_hold.lock().take();
        if let Some(latch) = hold {
            latch.notified().await;
        }
        if self.fail_push_pull.load(Ordering::SeqCst) {
            return Err(injected());
        }
        Ok(PushPullResponse {
            change_pack: Self::echo_pack(&req.change_pack),
        })
    }

    async fn watch_documents(
        &self,
        ctx: RpcContext,
        req: WatchDocumentsRequest,
    ) -> Result<WatchStream, RpcError> {
        let keys: Vec<String> = req
            .document_keys
            .iter()
            .map(DocumentKey::id_string)
            .collect();
        self.record(&ctx, Call::Watch { keys: keys.clone() });

        let (tx, rx) = mpsc::unbounded_channel();
        self.watch_streams.lock().push(WatchHandle { keys, tx });
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }
}

// ============================================================================
// Mock document
// ============================================================================

#[derive(Debug)]
pub struct MockDocument {
    key: DocumentKey,
    actor: Mutex<Option<ActorId>>,
    local_changes: AtomicBool,
    sticky_changes: AtomicBool,
    applied: Mutex<Vec<ChangePack>>,
}

impl MockDocument {
    pub fn new(collection: &str, document: &str) -> Arc<Self> {
        Arc::new(Self {
            key: DocumentKey::new(collection, document),
            actor: Mutex::new(None),
            local_changes: AtomicBool::new(false),
            sticky_changes: AtomicBool::new(false),
            applied: Mutex::new(Vec::new()),
        })
    }

    pub fn set_local_changes(&self, value: bool) {
        self.local_changes.store(value, Ordering::SeqCst);
    }

    /// Keep reporting local changes even after packs are drained, so the
    /// sync loop fires on every tick.
    pub fn set_sticky_changes(&self, value: bool) {
        self.sticky_changes.store(value, Ordering::SeqCst);
        if value {
            self.local_changes.store(true, Ordering::SeqCst);
        }
    }

    pub fn actor(&self) -> Option<ActorId> {
        self.actor.lock().clone()
    }

    pub fn applied_count(&self) -> usize {
        self.applied.lock().len()
    }
}

impl DocumentHandle for MockDocument {
    fn set_actor(&self, actor: ActorId) {
        *self.actor.lock() = Some(actor);
    }

    fn key(&self) -> String {
        self.key.id_string()
    }

    fn document_key(&self) -> DocumentKey {
        self.key.clone()
    }

    fn create_change_pack(&self) -> ChangePack {
        let change_count = if self.local_changes.load(Ordering::SeqCst) {
            1
        } else {
            0
        };
        if !self.sticky_changes.load(Ordering::SeqCst) {
            self.local_changes.store(false, Ordering::SeqCst);
        }
        ChangePack::new(
            self.key.clone(),
            Checkpoint::INITIAL,
            vec![vec![0u8]; change_count],
        )
    }

    fn apply_change_pack(&self, pack: ChangePack) -> Result<(), DocumentError> {
        self.applied.lock().push(pack);
        Ok(())
    }

    fn has_local_changes(&self) -> bool {
        self.local_changes.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Call at the top of a test to see client traces under `RUST_LOG`.
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn doc_key(combined: &str) -> DocumentKey {
    let (collection, document) = combined.split_once('$').expect("combined key");
    DocumentKey::new(collection, document)
}

pub fn meta(name: &str) -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("name".to_string(), name.to_string());
    metadata
}

pub fn peer(id: u8, name: &str) -> WatchClient {
    WatchClient {
        client_id: ActorId::new(vec![id]),
        metadata: meta(name),
    }
}

/// Yield to the scheduler until `cond` holds, without letting virtual time
/// advance. Panics when the scheduler drains without progress.
pub async fn yield_until(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..1000 {
        if cond() {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition never reached: {what}");
}

/// Poll `cond` on a 10ms virtual-time cadence until it holds.
pub async fn wait_for(what: &str, timeout: Duration, cond: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for: {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event, or panic once the (virtual) clock runs 5s dry.
pub async fn next_event(rx: &mut broadcast::Receiver<ClientEvent>) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Skip events until one matches `pred`.
pub async fn expect_event(
    rx: &mut broadcast::Receiver<ClientEvent>,
    what: &str,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    for _ in 0..100 {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
    panic!("event never observed: {what}");
}
