//! Watch stream maintenance and frame demultiplexing.
//!
//! One long-lived task per activation keeps a WatchDocuments stream open
//! for the realtime attachment set. The task is event-driven, not
//! periodic: attach, detach, and deactivation wake it through a
//! single-slot signal, and a dropped stream schedules a reopen after the
//! reconnect delay.
//!
//! ```text
//!   attach/detach ──wake──▶ recompute keys ──▶ open stream ──frames──▶ demux
//!                                ▲                  │
//!                                └── reconnect delay ┘ (end/error)
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{debug, warn};

use crate::client::{ClientInner, ClientState};
use crate::document::{DocumentKey, Metadata};
use crate::rpc::{
    DocEvent, DocEventType, WatchClient, WatchDocumentsRequest, WatchDocumentsResponse,
};
use crate::subscriptions::{ClientEvent, StreamConnectionStatus};

/// Spawn the watch loop for the activation identified by `epoch`.
pub(crate) fn spawn_watch_loop(inner: Arc<ClientInner>, epoch: u64) {
    tokio::spawn(async move {
        debug!("watch loop started (epoch {epoch})");
        'restart: loop {
            if !inner.is_active_epoch(epoch) {
                break;
            }
            if inner.state.lock().watch_suspended {
                // Deactivation in flight; hold the stream closed until the
                // RPC settles.
                inner.watch_wake.notified().await;
                continue;
            }

            let (client_id, doc_keys) = {
                let st = inner.state.lock();
                let Some(id) = st.server_id.clone() else { break };
                let doc_keys: Vec<DocumentKey> = st
                    .attachments
                    .iter()
                    .filter(|(_, a)| a.realtime_sync)
                    .map(|(_, a)| a.doc.document_key())
                    .collect();
                (id, doc_keys)
            };
            if doc_keys.is_empty() {
                debug!("watch loop idle: no realtime attachments");
                inner.watch_wake.notified().await;
                continue;
            }
            let watch_keys: Vec<String> = doc_keys.iter().map(DocumentKey::id_string).collect();

            let req = WatchDocumentsRequest {
                client: WatchClient {
                    client_id,
                    metadata: inner.metadata.clone(),
                },
                document_keys: doc_keys,
            };
            let mut stream = match inner.agent.watch_documents(inner.rpc_context(), req).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("watch stream open failed: {e}");
                    on_stream_disconnect(&inner, epoch).await;
                    continue;
                }
            };
            debug!("watch stream opened for {} document(s)", watch_keys.len());

            loop {
                tokio::select! {
                    _ = inner.watch_wake.notified() => {
                        // The key set changed or deactivation wants the
                        // stream closed; reopen from the top.
                        debug!("watch stream restarting");
                        continue 'restart;
                    }
                    frame = stream.next() => match frame {
                        Some(Ok(resp)) => {
                            if !inner.is_active_epoch(epoch) {
                                break 'restart;
                            }
                            mark_stream_connected(&inner);
                            handle_watch_response(&inner, &watch_keys, resp);
                        }
                        Some(Err(e)) => {
                            warn!("watch stream error: {e}");
                            on_stream_disconnect(&inner, epoch).await;
                            continue 'restart;
                        }
                        None => {
                            warn!("watch stream ended by agent");
                            on_stream_disconnect(&inner, epoch).await;
                            continue 'restart;
                        }
                    }
                }
            }
        }
        debug!("watch loop exiting (epoch {epoch})");
    });
}

/// First frame after a (re)open: record connectivity and tell subscribers.
fn mark_stream_connected(inner: &ClientInner) {
    let was_connected = {
        let mut st = inner.state.lock();
        std::mem::replace(&mut st.stream_connected, true)
    };
    if !was_connected {
        inner.events.publish(ClientEvent::StreamConnectionStatusChanged(
            StreamConnectionStatus::Connected,
        ));
    }
}

/// Mark disconnected, tell subscribers, and hold off the reconnect delay
/// before the next open. A wake (attach/detach/deactivate) cuts the wait
/// short.
async fn on_stream_disconnect(inner: &ClientInner, epoch: u64) {
    inner.state.lock().stream_connected = false;
    if inner.is_active_epoch(epoch) {
        inner.events.publish(ClientEvent::StreamConnectionStatusChanged(
            StreamConnectionStatus::Disconnected,
        ));
    }
    tokio::select! {
        _ = tokio::time::sleep(inner.reconnect_stream_delay) => {}
        _ = inner.watch_wake.notified() => {}
    }
}

// ============================================================================
// Demultiplexer
// ============================================================================

/// Interpret one stream frame: update peer sets and dirty bits first, then
/// publish the matching session event, so a subscriber's view of the peer
/// map is consistent with the payload. Frames for keys no longer attached
/// are dropped silently.
pub(crate) fn handle_watch_response(
    inner: &ClientInner,
    watch_keys: &[String],
    resp: WatchDocumentsResponse,
) {
    match resp {
        WatchDocumentsResponse::Initialization { peers_by_doc } => {
            let payload = {
                let mut st = inner.state.lock();
                for (key, clients) in peers_by_doc {
                    if let Some(att) = st.attachments.get_mut(&key) {
                        att.peer_clients = peer_map(clients);
                    }
                }
                collect_peers(&st, watch_keys)
            };
            if !payload.is_empty() {
                inner.events.publish(ClientEvent::PeersChanged(payload));
            }
        }
        WatchDocumentsResponse::Event(event) => handle_doc_event(inner, event),
    }
}

fn handle_doc_event(inner: &ClientInner, event: DocEvent) {
    let DocEvent {
        event_type,
        publisher,
        document_keys,
    } = event;
    let publisher_id = publisher.client_id.to_hex();
    let keys: Vec<String> = document_keys.iter().map(DocumentKey::id_string).collect();

    match event_type {
        DocEventType::DocumentsWatched | DocEventType::DocumentsUnwatched => {
            let payload = {
                let mut st = inner.state.lock();
                let mut affected = Vec::new();
                for key in &keys {
                    let Some(att) = st.attachments.get_mut(key) else {
                        continue;
                    };
                    match event_type {
                        DocEventType::DocumentsWatched => {
                            att.peer_clients
                                .insert(publisher_id.clone(), publisher.metadata.clone());
                        }
                        _ => {
                            att.peer_clients.remove(&publisher_id);
                        }
                    }
                    affected.push(key.clone());
                }
                collect_peers(&st, &affected)
            };
            if !payload.is_empty() {
                inner.events.publish(ClientEvent::PeersChanged(payload));
            }
        }
        DocEventType::DocumentsChanged => {
            let affected = {
                let mut st = inner.state.lock();
                let mut affected = Vec::new();
                for key in keys {
                    if let Some(att) = st.attachments.get_mut(&key) {
                        att.remote_dirty = true;
                        affected.push(key);
                    }
                }
                affected
            };
            if !affected.is_empty() {
                inner.events.publish(ClientEvent::DocumentsChanged(affected));
            }
        }
    }
}

fn peer_map(clients: Vec<WatchClient>) -> HashMap<String, Metadata> {
    clients
        .into_iter()
        .map(|c| (c.client_id.to_hex(), c.metadata))
        .collect()
}

/// Peer maps for `keys`, cloned into an event payload; keys without an
/// attachment are skipped.
fn collect_peers(
    state: &ClientState,
    keys: &[String],
) -> HashMap<String, HashMap<String, Metadata>> {
    keys.iter()
        .filter_map(|k| {
            state
                .attachments
                .get(k)
                .map(|a| (k.clone(), a.peer_clients.clone()))
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
