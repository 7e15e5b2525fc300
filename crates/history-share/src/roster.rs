//! The people roster: one row per visible history.
//!
//! Recomputing the roster touches the cloud (share metadata, own-share
//! lookups), so it is rate limited and cancellable. Change notifications
//! funnel through [`RosterRefresher::request_refresh`], which runs at
//! most once per throttle window and schedules a single trailing run for
//! whatever arrives inside the window. A newer refresh cancels an older
//! in-flight one; the published roster only ever moves forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use history_core::{History, HistoryStore, Lane, LookupInfo, RecordId, Session};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{CloudError, CloudShare, CloudSharing};
use crate::identity::{IdentityError, OwnershipResolver};
use crate::reciprocation::{ReciprocationError, ReciprocationService};

#[derive(Debug, Error)]
pub enum RosterError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Reciprocation(#[from] ReciprocationError),
}

pub type Result<T> = std::result::Result<T, RosterError>;

/// One row of the peers list.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Person {
    /// Id of the backing history; the placeholder id until records arrive.
    pub id: RecordId,
    pub name: String,
    pub session_count: usize,
    pub is_owner: bool,
    /// Whether we share our sessions back with this person. `None` until
    /// we have answered their invitation.
    pub is_reciprocating: Option<bool>,
}

impl Person {
    /// Provisional row for someone whose records have not replicated yet.
    pub fn placeholder(display_name: impl Into<String>) -> Self {
        Self {
            id: RecordId::placeholder(),
            name: display_name.into(),
            session_count: 0,
            is_owner: false,
            is_reciprocating: None,
        }
    }
}

/// Everything the roster computation needs about one history.
#[derive(Debug, Clone)]
pub struct RosterSource {
    pub history: History,
    pub sessions: Vec<Session>,
    pub is_owner: bool,
    pub display_name: String,
    pub is_reciprocating: Option<bool>,
}

/// Build roster rows from per-history sources.
///
/// Pure, and the ordering is part of the contract: our own row first,
/// then people by their earliest counted session, then people with no
/// sessions yet, by id. Only completed-start pomodoro sessions count;
/// on our own row, only private-lane ones, so records passing through a
/// shared lane are not double counted.
pub fn compute_roster(sources: &[RosterSource]) -> Vec<Person> {
    let mut rows: Vec<(Person, Option<DateTime<Utc>>)> = sources
        .iter()
        .map(|source| {
            let counted: Vec<&Session> = source
                .sessions
                .iter()
                .filter(|s| s.counts_for_roster())
                .filter(|s| !source.is_owner || s.lane == Lane::Private)
                .collect();
            let earliest = counted.iter().filter_map(|s| s.start_date).min();
            let person = Person {
                id: source.history.id,
                name: source.display_name.clone(),
                session_count: counted.len(),
                is_owner: source.is_owner,
                is_reciprocating: source.is_reciprocating,
            };
            (person, earliest)
        })
        .collect();

    rows.sort_by(|a, b| {
        b.0.is_owner
            .cmp(&a.0.is_owner)
            .then(a.1.is_none().cmp(&b.1.is_none()))
            .then(a.1.cmp(&b.1))
            .then(a.0.id.cmp(&b.0.id))
    });
    rows.into_iter().map(|(person, _)| person).collect()
}

pub const ROSTER_THROTTLE: Duration = Duration::from_secs(10);

/// Rate limiter for roster recomputation. At most one run per window.
pub struct RefreshThrottle {
    window: Duration,
    last_run: Mutex<Option<Instant>>,
}

impl RefreshThrottle {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            last_run: Mutex::new(None),
        }
    }

    /// Claim the run slot at `now`. False means the window is still
    /// closed and the slot was not claimed.
    pub fn try_begin(&self, now: Instant) -> bool {
        let mut last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) if now.duration_since(prev) < self.window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Time until the window reopens.
    pub fn remaining(&self, now: Instant) -> Duration {
        let last = self.last_run.lock().unwrap_or_else(|e| e.into_inner());
        match *last {
            Some(prev) => self.window.saturating_sub(now.duration_since(prev)),
            None => Duration::ZERO,
        }
    }
}

struct PendingPlaceholder {
    display_name: String,
    lookup: LookupInfo,
}

/// Recomputes and publishes the roster.
pub struct RosterRefresher {
    store: Arc<HistoryStore>,
    cloud: Arc<dyn CloudSharing>,
    resolver: OwnershipResolver,
    reciprocation: ReciprocationService,
    throttle: RefreshThrottle,
    current: Mutex<Option<CancellationToken>>,
    roster_tx: watch::Sender<Vec<Person>>,
    trailing_scheduled: AtomicBool,
    pending: Mutex<Option<PendingPlaceholder>>,
}

impl RosterRefresher {
    pub fn new(
        store: Arc<HistoryStore>,
        cloud: Arc<dyn CloudSharing>,
        resolver: OwnershipResolver,
        reciprocation: ReciprocationService,
        throttle_window: Duration,
    ) -> Self {
        let (roster_tx, _) = watch::channel(Vec::new());
        Self {
            store,
            cloud,
            resolver,
            reciprocation,
            throttle: RefreshThrottle::new(throttle_window),
            current: Mutex::new(None),
            roster_tx,
            trailing_scheduled: AtomicBool::new(false),
            pending: Mutex::new(None),
        }
    }

    /// Watch the published roster. The receiver starts on the latest
    /// value and updates on every publish.
    pub fn watch(&self) -> watch::Receiver<Vec<Person>> {
        self.roster_tx.subscribe()
    }

    pub fn latest(&self) -> Vec<Person> {
        self.roster_tx.borrow().clone()
    }

    /// Remember someone whose share we just accepted, so the roster can
    /// show them before their records replicate down.
    pub fn note_share_accepted(&self, display_name: String, lookup: LookupInfo) {
        debug!("Expecting records from {}", display_name);
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some(PendingPlaceholder {
            display_name,
            lookup,
        });
    }

    /// Throttled entry point for change-driven refreshes. Runs now when
    /// the window allows, otherwise schedules exactly one trailing run
    /// for when it reopens.
    pub fn request_refresh(self: &Arc<Self>) {
        let now = Instant::now();
        if self.throttle.try_begin(now) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = this.refresh().await {
                    warn!("Roster refresh failed: {}", e);
                }
            });
            return;
        }
        if self.trailing_scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let delay = self.throttle.remaining(now);
        debug!("Roster refresh throttled, trailing run in {:?}", delay);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            this.trailing_scheduled.store(false, Ordering::SeqCst);
            if this.throttle.try_begin(Instant::now()) {
                if let Err(e) = this.refresh().await {
                    warn!("Roster refresh failed: {}", e);
                }
            }
        });
    }

    /// Recompute and publish the roster now.
    ///
    /// Phase one classifies every history against the store and aborts on
    /// any failure, leaving the previous roster in place. Phase two
    /// resolves display names and reciprocation per foreign history and
    /// degrades per row instead of failing the pass. A refresh started
    /// after this one cancels it at the next phase boundary.
    pub async fn refresh(&self) -> Result<()> {
        let token = CancellationToken::new();
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(previous) = current.replace(token.clone()) {
                previous.cancel();
            }
        }

        let mut own_history: Option<RecordId> = None;
        let mut rows: Vec<(History, Vec<Session>, bool, Option<CloudShare>)> = Vec::new();
        for history in self.store.histories() {
            let ownership = self.resolver.classify(history.id).await?;
            if ownership.owned && own_history.is_none() {
                own_history = Some(history.id);
            }
            let sessions = self.store.sessions_of_history(history.id);
            rows.push((history, sessions, ownership.owned, ownership.share));
        }
        if token.is_cancelled() {
            debug!("Roster refresh superseded");
            return Ok(());
        }

        let resolved: Vec<(RosterSource, Option<LookupInfo>)> = join_all(rows.into_iter().map(
            |(history, sessions, is_owner, share)| async move {
                if is_owner {
                    let source = RosterSource {
                        display_name: history.owner_name.clone(),
                        history,
                        sessions,
                        is_owner,
                        is_reciprocating: None,
                    };
                    return (source, None);
                }

                let (display_name, is_reciprocating, owner_lookup) = match share {
                    Some(share) => {
                        let display_name = match self.cloud.share_metadata(&share.url).await {
                            Ok(metadata) => metadata.owner_display_name,
                            Err(e) => {
                                warn!(
                                    "Falling back to replicated owner name for {}: {}",
                                    history.id, e
                                );
                                history.owner_name.clone()
                            }
                        };
                        let is_reciprocating = match self
                            .reciprocation
                            .derive_is_reciprocating(&share, own_history)
                            .await
                        {
                            Ok(state) => state,
                            Err(e) => {
                                warn!("Could not derive reciprocation for {}: {}", history.id, e);
                                None
                            }
                        };
                        let owner_lookup = share.owner().map(|o| o.lookup.clone());
                        (display_name, is_reciprocating, owner_lookup)
                    }
                    None => (history.owner_name.clone(), None, None),
                };
                let source = RosterSource {
                    display_name,
                    history,
                    sessions,
                    is_owner,
                    is_reciprocating,
                };
                (source, owner_lookup)
            },
        ))
        .await;
        if token.is_cancelled() {
            debug!("Roster refresh superseded");
            return Ok(());
        }

        let sources: Vec<RosterSource> = resolved.iter().map(|(s, _)| s.clone()).collect();
        let mut roster = compute_roster(&sources);

        let expected = {
            let pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending
                .as_ref()
                .map(|p| (p.display_name.clone(), p.lookup.clone()))
        };
        if let Some((display_name, lookup)) = expected {
            let arrived = resolved
                .iter()
                .filter_map(|(_, owner)| owner.as_ref())
                .any(|owner| owner.matches(&lookup));
            if arrived {
                info!("Records from {} arrived, dropping placeholder", display_name);
                let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
                // Only drop the placeholder we checked for; a newer one stays
                if pending.as_ref().is_some_and(|p| p.lookup.matches(&lookup)) {
                    *pending = None;
                }
            } else {
                roster.push(Person::placeholder(display_name));
            }
        }

        if token.is_cancelled() {
            debug!("Roster refresh superseded before publish");
            return Ok(());
        }
        self.roster_tx.send_replace(roster);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudBackend, InMemoryCloud};
    use crate::share::ShareManager;
    use history_core::{SavePolicy, TimerType};

    fn email(addr: &str) -> LookupInfo {
        LookupInfo::Email(addr.into())
    }

    fn session(start: Option<&str>, timer_type: TimerType, lane: Lane) -> Session {
        let mut session = Session::new(RecordId::generate(), 1500, timer_type);
        session.start_date = start.map(|s| s.parse().unwrap());
        session.lane = lane;
        session
    }

    fn source(history: History, is_owner: bool, name: &str, sessions: Vec<Session>) -> RosterSource {
        RosterSource {
            history,
            sessions,
            is_owner,
            display_name: name.into(),
            is_reciprocating: None,
        }
    }

    // ========== compute_roster ==========

    #[test]
    fn test_owner_first_then_earliest_start() {
        let mut a = History::new("Ada");
        a.created_at = "2024-01-01T00:00:00Z".parse().unwrap();
        let b = History::new("Brin");
        let mine = History::new("");

        let sources = vec![
            source(
                a.clone(),
                false,
                "Ada",
                vec![session(Some("2024-06-02T09:00:00Z"), TimerType::Pomodoro, Lane::Shared)],
            ),
            source(
                mine.clone(),
                true,
                "",
                vec![session(Some("2024-06-03T09:00:00Z"), TimerType::Pomodoro, Lane::Private)],
            ),
            source(
                b.clone(),
                false,
                "Brin",
                vec![session(Some("2024-06-01T09:00:00Z"), TimerType::Pomodoro, Lane::Shared)],
            ),
        ];

        let roster = compute_roster(&sources);
        let names: Vec<&str> = roster.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["", "Brin", "Ada"]);
        assert!(roster[0].is_owner);
    }

    #[test]
    fn test_empty_histories_sort_last_by_id() {
        let a = History::new("A");
        let b = History::new("B");
        let first = a.id.min(b.id);

        let sources = vec![
            source(a.clone(), false, "A", vec![]),
            source(b.clone(), false, "B", vec![]),
        ];
        let roster = compute_roster(&sources);
        assert_eq!(roster[0].id, first);
        assert_eq!(roster[0].session_count, 0);
    }

    #[test]
    fn test_counts_completed_pomodoros_only() {
        let h = History::new("Ada");
        let sources = vec![source(
            h,
            false,
            "Ada",
            vec![
                session(Some("2024-06-01T09:00:00Z"), TimerType::Pomodoro, Lane::Shared),
                session(Some("2024-06-01T10:00:00Z"), TimerType::ShortBreak, Lane::Shared),
                session(None, TimerType::Pomodoro, Lane::Shared),
            ],
        )];
        let roster = compute_roster(&sources);
        assert_eq!(roster[0].session_count, 1);
    }

    #[test]
    fn test_owner_counts_private_lane_only() {
        let mine = History::new("");
        let sources = vec![source(
            mine,
            true,
            "",
            vec![
                session(Some("2024-06-01T09:00:00Z"), TimerType::Pomodoro, Lane::Private),
                session(Some("2024-06-01T10:00:00Z"), TimerType::Pomodoro, Lane::Shared),
            ],
        )];
        let roster = compute_roster(&sources);
        assert_eq!(roster[0].session_count, 1);
    }

    #[test]
    fn test_placeholder_person() {
        let person = Person::placeholder("Ada");
        assert!(person.id.is_placeholder());
        assert_eq!(person.session_count, 0);
        assert_eq!(person.is_reciprocating, None);
    }

    #[test]
    fn test_person_serializes_camel_case() {
        let person = Person {
            id: RecordId::placeholder(),
            name: "Ada".into(),
            session_count: 3,
            is_owner: false,
            is_reciprocating: Some(true),
        };
        let json = serde_json::to_string(&person).unwrap();
        assert!(json.contains("\"sessionCount\":3"));
        assert!(json.contains("\"isOwner\":false"));
        assert!(json.contains("\"isReciprocating\":true"));
    }

    // ========== RefreshThrottle ==========

    #[tokio::test]
    async fn test_throttle_window() {
        let throttle = RefreshThrottle::new(Duration::from_secs(10));
        let t0 = Instant::now();

        assert!(throttle.try_begin(t0));
        assert!(!throttle.try_begin(t0 + Duration::from_secs(5)));
        assert_eq!(
            throttle.remaining(t0 + Duration::from_secs(4)),
            Duration::from_secs(6)
        );
        assert!(throttle.try_begin(t0 + Duration::from_secs(10)));
    }

    #[tokio::test]
    async fn test_throttle_first_run_is_free() {
        let throttle = RefreshThrottle::new(Duration::from_secs(10));
        assert_eq!(throttle.remaining(Instant::now()), Duration::ZERO);
        assert!(throttle.try_begin(Instant::now()));
    }

    // ========== RosterRefresher ==========

    struct Fixture {
        store: Arc<HistoryStore>,
        cloud: Arc<InMemoryCloud>,
        refresher: Arc<RosterRefresher>,
    }

    fn fixture_with(backend: Arc<CloudBackend>, address: &str, name: &str) -> Fixture {
        let store = Arc::new(HistoryStore::new());
        let cloud = Arc::new(InMemoryCloud::with_backend(backend, email(address), name));
        let dyn_cloud: Arc<dyn CloudSharing> = Arc::clone(&cloud) as Arc<dyn CloudSharing>;
        let shares = ShareManager::new(Arc::clone(&store), Arc::clone(&dyn_cloud));
        let reciprocation =
            ReciprocationService::new(Arc::clone(&store), Arc::clone(&dyn_cloud), shares);
        let refresher = Arc::new(RosterRefresher::new(
            Arc::clone(&store),
            dyn_cloud,
            OwnershipResolver::new(Arc::clone(&cloud) as Arc<dyn CloudSharing>),
            reciprocation,
            Duration::from_millis(50),
        ));
        Fixture {
            store,
            cloud,
            refresher,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(CloudBackend::new(), "me@example.com", "Me")
    }

    fn seed_own_history(fixture: &Fixture, starts: &[&str]) -> RecordId {
        let mut txn = fixture.store.begin();
        let history = txn.create_history("");
        let category = txn.create_category(history.id, None);
        let task = txn.create_task(category.id, None);
        for start in starts {
            let mut session = Session::new(task.id, 1500, TimerType::Pomodoro);
            session.start_date = Some(start.parse().unwrap());
            txn.upsert_session(session);
        }
        txn.commit(SavePolicy::LocalWins).unwrap();
        history.id
    }

    #[tokio::test]
    async fn test_refresh_publishes_roster() {
        let fixture = fixture();
        seed_own_history(&fixture, &["2024-06-01T09:00:00Z", "2024-06-02T09:00:00Z"]);

        let mut watch = fixture.refresher.watch();
        fixture.refresher.refresh().await.unwrap();

        watch.changed().await.unwrap();
        let roster = watch.borrow().clone();
        assert_eq!(roster.len(), 1);
        assert!(roster[0].is_owner);
        assert_eq!(roster[0].session_count, 2);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_previous_roster() {
        let fixture = fixture();
        seed_own_history(&fixture, &["2024-06-01T09:00:00Z"]);
        fixture.refresher.refresh().await.unwrap();

        // Break the cloud so classification cannot run
        fixture.cloud.fail_share_fetch(true);
        seed_own_history(&fixture, &[]);
        assert!(fixture.refresher.refresh().await.is_err());

        let roster = fixture.refresher.latest();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].session_count, 1);
    }

    #[tokio::test]
    async fn test_placeholder_until_records_arrive() {
        let backend = CloudBackend::new();
        let ada = fixture_with(Arc::clone(&backend), "ada@example.com", "Ada");
        let me = fixture_with(backend, "me@example.com", "Me");
        seed_own_history(&me, &["2024-06-01T09:00:00Z"]);

        // We accepted Ada's share; nothing has replicated yet
        me.refresher
            .note_share_accepted("Ada".into(), email("ada@example.com"));
        me.refresher.refresh().await.unwrap();

        let roster = me.refresher.latest();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[1].name, "Ada");
        assert!(roster[1].id.is_placeholder());

        // Ada's history and share arrive
        let mut ada_history = History::new("Ada");
        ada_history.lane = Lane::Shared;
        let mut txn = ada.store.begin();
        txn.upsert_history(ada_history.clone());
        txn.commit(SavePolicy::LocalWins).unwrap();
        let share = ada.cloud.create_share(ada_history.id).await.unwrap();
        me.cloud.accept_invite(&share.url).unwrap();
        let mut txn = me.store.begin();
        txn.upsert_history(ada_history.clone());
        txn.commit(SavePolicy::LocalWins).unwrap();

        me.refresher.refresh().await.unwrap();
        let roster = me.refresher.latest();
        assert_eq!(roster.len(), 2);
        assert_eq!(roster[1].name, "Ada");
        assert_eq!(roster[1].id, ada_history.id);
        assert!(!roster[1].id.is_placeholder());
    }

    #[tokio::test]
    async fn test_foreign_row_uses_share_metadata_name() {
        let backend = CloudBackend::new();
        let ada = fixture_with(Arc::clone(&backend), "ada@example.com", "Ada Lovelace");
        let me = fixture_with(backend, "me@example.com", "Me");

        let mut ada_history = History::new("stale name");
        ada_history.lane = Lane::Shared;
        let mut txn = ada.store.begin();
        txn.upsert_history(ada_history.clone());
        txn.commit(SavePolicy::LocalWins).unwrap();
        let share = ada.cloud.create_share(ada_history.id).await.unwrap();
        me.cloud.accept_invite(&share.url).unwrap();
        let mut txn = me.store.begin();
        txn.upsert_history(ada_history.clone());
        txn.commit(SavePolicy::LocalWins).unwrap();

        me.refresher.refresh().await.unwrap();
        let roster = me.refresher.latest();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].name, "Ada Lovelace");
        assert!(!roster[0].is_owner);
    }

    #[tokio::test]
    async fn test_request_refresh_coalesces_bursts() {
        let fixture = fixture();
        seed_own_history(&fixture, &["2024-06-01T09:00:00Z"]);

        for _ in 0..5 {
            fixture.refresher.request_refresh();
        }
        // One immediate run plus at most one trailing run
        tokio::time::sleep(Duration::from_millis(200)).await;

        let roster = fixture.refresher.latest();
        assert_eq!(roster.len(), 1);
        assert_eq!(roster[0].session_count, 1);
    }
}
