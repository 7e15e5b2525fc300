//! Share lifecycle for a history: create, invite, revoke.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, Either};
use history_core::{HistoryStore, LookupInfo, RecordId, SavePolicy};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cloud::{CloudError, CloudShare, CloudSharing, LookupOutcome, Participant, SharePermission};

#[derive(Debug, Error)]
pub enum ShareError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] history_core::StoreError),
    #[error("No history {0} to share")]
    UnknownHistory(RecordId),
}

pub type Result<T> = std::result::Result<T, ShareError>;

/// What inviting people to a history produced.
#[derive(Debug)]
pub struct ShareOutcome {
    pub share: CloudShare,
    /// Participants added by this call.
    pub added: usize,
    /// Addresses that did not resolve to an account.
    pub failed: Vec<LookupInfo>,
    /// True when this call created the share.
    pub newly_shared: bool,
}

#[derive(Clone)]
pub struct ShareManager {
    store: Arc<HistoryStore>,
    cloud: Arc<dyn CloudSharing>,
}

impl ShareManager {
    pub fn new(store: Arc<HistoryStore>, cloud: Arc<dyn CloudSharing>) -> Self {
        Self { store, cloud }
    }

    /// The share covering one of our histories, created on first use.
    /// Returns the share and whether this call created it.
    pub async fn prepare_own_share(&self, history_id: RecordId) -> Result<(CloudShare, bool)> {
        if self.store.history(history_id).is_none() {
            return Err(ShareError::UnknownHistory(history_id));
        }
        if let Some(share) = self.cloud.share_for_history(history_id).await? {
            debug!("History {} already shared at {}", history_id, share.url);
            return Ok((share, false));
        }
        let share = self.cloud.create_share(history_id).await?;
        info!("Created share {} for history {}", share.url, history_id);
        Ok((share, true))
    }

    /// Invite people to a history, creating the share if needed.
    ///
    /// The address list is deduplicated and addresses already on the
    /// share are skipped. One unresolvable address never blocks the
    /// rest; it lands in `ShareOutcome::failed`.
    pub async fn share_with(
        &self,
        history_id: RecordId,
        lookups: &[LookupInfo],
    ) -> Result<ShareOutcome> {
        let (mut share, newly_shared) = self.prepare_own_share(history_id).await?;

        let mut to_resolve: Vec<LookupInfo> = Vec::new();
        for lookup in lookups {
            if share.has_participant(lookup) {
                debug!("{} is already on share {}", lookup.raw(), share.url);
                continue;
            }
            if to_resolve.iter().any(|l| l.matches(lookup)) {
                continue;
            }
            to_resolve.push(lookup.clone());
        }

        let mut added = 0;
        let mut failed = Vec::new();
        if !to_resolve.is_empty() {
            for outcome in self.cloud.lookup_participants(&to_resolve).await? {
                match outcome {
                    LookupOutcome::Found(participant) => {
                        share.participants.push(Participant {
                            permission: SharePermission::ReadWrite,
                            ..participant
                        });
                        added += 1;
                    }
                    LookupOutcome::Failed { lookup, reason } => {
                        warn!("Could not resolve {}: {}", lookup.raw(), reason);
                        failed.push(lookup);
                    }
                }
            }
            if added > 0 {
                self.cloud.save_share(&share).await?;
                info!("Added {} participants to share {}", added, share.url);
            }
        }

        Ok(ShareOutcome {
            share,
            added,
            failed,
            newly_shared,
        })
    }

    /// Stop sharing a history by re-homing its records: deep-clone the
    /// tree into a fresh private history, delete the shared one, then
    /// purge the server-side zone. Reciprocation markers stay behind;
    /// they describe the shared life of the old history and die with it.
    pub async fn unshare(&self, history_id: RecordId) -> Result<RecordId> {
        let original = self
            .store
            .history(history_id)
            .ok_or(ShareError::UnknownHistory(history_id))?;
        let replacement = original.clone_as_new();

        let mut txn = self.store.begin();
        txn.upsert_history(replacement.clone());
        for category in self.store.categories_of(history_id) {
            let new_category = category.clone_as_new(replacement.id);
            txn.upsert_category(new_category.clone());
            for task in self.store.tasks_of(category.id) {
                let new_task = task.clone_as_new(new_category.id);
                txn.upsert_task(new_task.clone());
                for session in self.store.sessions_of(task.id) {
                    txn.upsert_session(session.clone_as_new(new_task.id));
                }
            }
        }
        txn.delete_history(history_id);
        txn.commit(SavePolicy::LocalWins)?;

        // Best effort: the records are already re-homed locally
        if let Err(e) = self.cloud.purge_share_zone(history_id).await {
            warn!("Share zone for {} not purged: {}", history_id, e);
        }
        info!("Unshared history {} into {}", history_id, replacement.id);
        Ok(replacement.id)
    }
}

/// Ceiling on how long a caller blocks on share work before it detaches.
pub const SHARE_OVERLAY_CEILING: Duration = Duration::from_secs(5);

/// Whether share work finished while the caller was still watching.
#[derive(Debug)]
pub enum OverlayOutcome<T> {
    Completed(T),
    /// Still running; the handle resolves when it lands.
    TimedOut(JoinHandle<T>),
}

/// Run `work` for at most `ceiling`, detaching it onto the runtime if it
/// runs long. The work itself always runs to completion; only the wait
/// is bounded.
pub async fn with_share_overlay<T, F>(ceiling: Duration, work: F) -> OverlayOutcome<T>
where
    F: Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let work = Box::pin(work);
    let deadline = Box::pin(tokio::time::sleep(ceiling));
    match future::select(work, deadline).await {
        Either::Left((value, _)) => OverlayOutcome::Completed(value),
        Either::Right(((), work)) => {
            debug!("Share work still running after {:?}, detaching", ceiling);
            OverlayOutcome::TimedOut(tokio::spawn(work))
        }
    }
}
