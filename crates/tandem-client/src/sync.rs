//! Background push-pull loop.
//!
//! One cooperative task per activation. Each tick scans the registry for
//! realtime attachments with work (local changes or a raised dirty bit) and
//! push-pulls the selected documents concurrently. The dirty bit is cleared
//! before the RPC goes out, so a remote change arriving mid-call re-raises
//! it and triggers a follow-up tick.
//!
//! The cadence degrades to the reconnect delay while the watch stream is
//! down: without a remote-dirty signal the client must not flood the agent.

use std::sync::Arc;

use futures::future::join_all;
use tracing::{debug, error, warn};

use crate::client::ClientInner;
use crate::document::DocumentHandle;
use crate::error::ClientError;
use crate::rpc::PushPullRequest;
use crate::subscriptions::{ClientEvent, DocumentSyncedStatus};

/// Spawn the sync loop for the activation identified by `epoch`.
///
/// The task exits on its next tick once the epoch goes stale.
pub(crate) fn spawn_sync_loop(inner: Arc<ClientInner>, epoch: u64) {
    tokio::spawn(async move {
        debug!("sync loop started (epoch {epoch})");
        loop {
            if !inner.is_active_epoch(epoch) {
                debug!("sync loop exiting (epoch {epoch})");
                return;
            }

            let targets = {
                let mut st = inner.state.lock();
                st.attachments.take_sync_targets()
            };

            let results = join_all(
                targets
                    .into_iter()
                    .map(|(key, doc)| push_pull(inner.clone(), epoch, key, doc)),
            )
            .await;
            let failed = results.iter().any(Result::is_err);

            if failed && inner.is_active_epoch(epoch) {
                inner
                    .events
                    .publish(ClientEvent::DocumentSynced(DocumentSyncedStatus::SyncFailed));
            }

            let delay = {
                let st = inner.state.lock();
                if failed || !st.stream_connected {
                    inner.reconnect_stream_delay
                } else {
                    inner.sync_loop_duration
                }
            };
            tokio::time::sleep(delay).await;
        }
    });
}

/// One push-pull: drain local changes into a pack, exchange packs with the
/// agent, apply the remote pack, report `DocumentSynced(Synced)`.
///
/// Responses that outlive the activation epoch are dropped without applying
/// or publishing.
pub(crate) async fn push_pull(
    inner: Arc<ClientInner>,
    epoch: u64,
    key: String,
    doc: Arc<dyn DocumentHandle>,
) -> Result<(), ClientError> {
    let client_id = inner.require_server_id()?;
    let change_pack = doc.create_change_pack();
    debug!(
        "PP: pushing {} change(s) for '{key}'",
        change_pack.change_count()
    );

    let req = PushPullRequest {
        client_id,
        change_pack,
    };
    let resp = inner
        .agent
        .push_pull(inner.rpc_context(), req)
        .await
        .map_err(|e| {
            error!("PP: push-pull failed for '{key}': {e}");
            e
        })?;

    if !inner.is_active_epoch(epoch) {
        warn!("PP: dropping stale response for '{key}'");
        return Ok(());
    }

    doc.apply_change_pack(resp.change_pack)?;
    inner
        .events
        .publish(ClientEvent::DocumentSynced(DocumentSyncedStatus::Synced));
    Ok(())
}
