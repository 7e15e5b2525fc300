//! The engine wires the store, duplicate merge, shares, reciprocation,
//! and roster together and drives them from store change events.
//!
//! Call `bootstrap()` once, spawn `run()`, and use the facade methods
//! from the UI layer. The event loop reacts to replication the same way
//! it reacts to local edits: any record change delivers pending
//! reciprocation links and requests a throttled roster refresh, and a
//! newly created history additionally triggers a duplicate-merge check.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use history_core::{
    ensure_session_home, ADay, ChangeKind, HistoryStore, LookupInfo, RecordId, RecordKind,
    Session, SessionHome, StoreEvent,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::cloud::{CloudShare, CloudSharing, ShareUrl};
use crate::identity::OwnershipResolver;
use crate::merge::MergeEngine;
use crate::reciprocation::{ReciprocationError, ReciprocationService};
use crate::roster::{Person, RosterError, RosterRefresher, ROSTER_THROTTLE};
use crate::share::{
    with_share_overlay, OverlayOutcome, ShareError, ShareManager, ShareOutcome,
    SHARE_OVERLAY_CEILING,
};

/// Engine tunables. The defaults are the production values.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Minimum spacing between change-driven roster recomputations.
    pub roster_throttle: Duration,
    /// How long callers block on share work before it detaches.
    pub share_overlay_ceiling: Duration,
    /// Timezone offset for bucketing sessions into days.
    pub day_offset: FixedOffset,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roster_throttle: ROSTER_THROTTLE,
            share_overlay_ceiling: SHARE_OVERLAY_CEILING,
            day_offset: Utc.fix(),
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Engine has not been bootstrapped")]
    NotBootstrapped,
    #[error(transparent)]
    Store(#[from] history_core::StoreError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error(transparent)]
    Reciprocation(#[from] ReciprocationError),
}

pub struct Engine {
    store: Arc<HistoryStore>,
    config: EngineConfig,
    shares: ShareManager,
    reciprocation: ReciprocationService,
    merge: MergeEngine,
    refresher: Arc<RosterRefresher>,
    links_tx: mpsc::UnboundedSender<ShareUrl>,
    links_rx: Mutex<Option<mpsc::UnboundedReceiver<ShareUrl>>>,
    session_home: Mutex<Option<SessionHome>>,
}

impl Engine {
    pub fn new(store: Arc<HistoryStore>, cloud: Arc<dyn CloudSharing>, config: EngineConfig) -> Self {
        let resolver = OwnershipResolver::new(Arc::clone(&cloud));
        let shares = ShareManager::new(Arc::clone(&store), Arc::clone(&cloud));
        let reciprocation =
            ReciprocationService::new(Arc::clone(&store), Arc::clone(&cloud), shares.clone());
        let merge = MergeEngine::new(Arc::clone(&store), resolver.clone());
        let refresher = Arc::new(RosterRefresher::new(
            Arc::clone(&store),
            cloud,
            resolver,
            reciprocation.clone(),
            config.roster_throttle,
        ));
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        Self {
            store,
            config,
            shares,
            reciprocation,
            merge,
            refresher,
            links_tx,
            links_rx: Mutex::new(Some(links_rx)),
            session_home: Mutex::new(None),
        }
    }

    /// Ensure the default session chain exists and remember it. Must run
    /// before sessions are recorded or reciprocations accepted.
    pub fn bootstrap(&self) -> Result<SessionHome, history_core::StoreError> {
        let home = ensure_session_home(&self.store)?;
        let mut slot = self.session_home.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(home);
        Ok(home)
    }

    /// Drive the engine from store change events. Spawn this; it runs for
    /// the life of the store.
    pub async fn run(self: Arc<Self>) {
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let _subscription = self.store.subscribe(move |event| {
            let _ = event_tx.send(event);
        });

        // Startup pass: fold duplicates that accrued while we were gone,
        // then publish a first roster
        self.check_merge().await;
        if let Err(e) = self.refresher.refresh().await {
            warn!("Initial roster refresh failed: {}", e);
        }

        info!("Engine running");
        while let Some(event) = event_rx.recv().await {
            self.handle_event(event).await;
        }
        debug!("Engine event stream ended");
    }

    async fn handle_event(self: &Arc<Self>, event: StoreEvent) {
        match event {
            StoreEvent::RecordsChanged { kind, change } => {
                if kind == RecordKind::History && change == ChangeKind::Created {
                    // A replicated history may duplicate ours. The merge
                    // deletes rather than creates histories, so it cannot
                    // retrigger itself.
                    let this = Arc::clone(self);
                    tokio::spawn(async move { this.check_merge().await });
                }
                self.deliver_incoming_links();
                self.refresher.request_refresh();
            }
            StoreEvent::ShareAccepted {
                display_name,
                lookup,
            } => {
                self.refresher.note_share_accepted(display_name, lookup);
                // Bypass the throttle: the user is looking at the roster
                if let Err(e) = self.refresher.refresh().await {
                    warn!("Roster refresh after share acceptance failed: {}", e);
                }
            }
        }
    }

    async fn check_merge(&self) {
        match self.merge.merge_owned_histories().await {
            Ok(report) if report.has_changes() => {
                info!(
                    "Folded {} duplicate histories ({} sessions cloned, {} skipped)",
                    report.histories_deleted,
                    report.sessions_cloned,
                    report.duplicate_sessions_skipped
                );
                self.rehome();
            }
            Ok(_) => {}
            Err(e) => warn!("History merge failed: {}", e),
        }
    }

    /// A merge or unshare can delete the history the session home pointed
    /// at. Point the home at the surviving default chain.
    fn rehome(&self) {
        let mut slot = self.session_home.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            return;
        }
        match ensure_session_home(&self.store) {
            Ok(home) => *slot = Some(home),
            Err(e) => warn!("Could not re-home sessions: {}", e),
        }
    }

    fn deliver_incoming_links(&self) {
        let home = {
            let slot = self.session_home.lock().unwrap_or_else(|e| e.into_inner());
            *slot
        };
        let Some(home) = home else { return };
        match self.reciprocation.take_incoming_links(home.history) {
            Ok(links) => {
                for link in links {
                    let _ = self.links_tx.send(link);
                }
            }
            Err(e) => warn!("Could not collect reciprocation links: {}", e),
        }
    }

    // ---- facade ----

    /// Invite people to a history. `Completed` means the share work
    /// finished within the overlay ceiling; `TimedOut` means it is still
    /// running in the background and will land on its own.
    pub async fn share_history(
        &self,
        history_id: RecordId,
        lookups: Vec<LookupInfo>,
    ) -> OverlayOutcome<Result<ShareOutcome, ShareError>> {
        let shares = self.shares.clone();
        with_share_overlay(self.config.share_overlay_ceiling, async move {
            shares.share_with(history_id, &lookups).await
        })
        .await
    }

    /// Stop sharing a history, re-homing its records privately.
    pub async fn unshare_history(&self, history_id: RecordId) -> Result<RecordId, ShareError> {
        let replacement = self.shares.unshare(history_id).await?;
        let was_home = self
            .session_home()
            .is_some_and(|home| home.history == history_id);
        if was_home {
            self.rehome();
        }
        Ok(replacement)
    }

    /// Share our own history back to whoever shared `remote_history`.
    pub async fn accept_reciprocation(
        &self,
        remote_history: RecordId,
    ) -> Result<CloudShare, EngineError> {
        let home = self
            .session_home()
            .ok_or(EngineError::NotBootstrapped)?;
        Ok(self
            .reciprocation
            .accept(remote_history, home.history)
            .await?)
    }

    pub async fn decline_reciprocation(&self, remote_history: RecordId) -> Result<(), EngineError> {
        Ok(self.reciprocation.decline(remote_history).await?)
    }

    /// Platform callback for the user accepting someone's share
    /// invitation. Feeds the roster's placeholder row.
    pub fn notify_share_accepted(&self, display_name: String, lookup: LookupInfo) {
        self.store.share_accepted(display_name, lookup);
    }

    pub fn roster(&self) -> watch::Receiver<Vec<Person>> {
        self.refresher.watch()
    }

    /// Recompute the roster immediately, bypassing the throttle.
    pub async fn refresh_roster(&self) -> Result<(), RosterError> {
        self.refresher.refresh().await
    }

    /// Take the reciprocation deep-link stream. Yields each incoming
    /// share URL exactly once. Only the first caller gets the stream.
    pub fn take_deep_links(&self) -> Option<mpsc::UnboundedReceiver<ShareUrl>> {
        self.links_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    pub fn day_of(&self, instant: DateTime<Utc>) -> ADay {
        ADay::from_instant(instant, self.config.day_offset)
    }

    /// Sessions of a history that started on the given day.
    pub fn sessions_on(&self, history_id: RecordId, day: ADay) -> Vec<Session> {
        self.store
            .sessions_of_history(history_id)
            .into_iter()
            .filter(|s| {
                s.start_date
                    .map(|start| ADay::from_instant(start, self.config.day_offset) == day)
                    .unwrap_or(false)
            })
            .collect()
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    pub fn session_home(&self) -> Option<SessionHome> {
        *self.session_home.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
