//! HistoryStore: in-memory record store with transactional batch commits.
//!
//! All mutation goes through `begin()` → staged writes → `commit(policy)`.
//! A commit applies its whole batch under one write lock, so readers never
//! observe a half-applied merge, and emits coalesced change events only
//! after the batch lands. Records that changed underneath an open
//! transaction are resolved per record by the commit's `SavePolicy`.
//!
//! Structural damage (a session whose task is missing, possible mid-sync)
//! is tolerated: tree reads skip dangling records and `audit()` reports
//! them. Deletes cascade and always apply regardless of policy.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{ChangeKind, EventBus, RecordKind, StoreEvent, Subscription};
use crate::model::{Category, History, Lane, LookupInfo, Reciprocate, Session, Task};
use crate::record_id::RecordId;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Refusing to store {kind:?} under the placeholder id")]
    PlaceholderId { kind: RecordKind },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// How a commit resolves records that changed underneath the transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SavePolicy {
    /// Keep what the store has; conflicting staged writes are dropped.
    StoreWins,
    /// The staged write wins; whatever changed underneath is overwritten.
    LocalWins,
}

#[derive(Debug, Clone)]
struct Versioned<T> {
    record: T,
    version: u64,
}

#[derive(Default)]
struct Tables {
    histories: HashMap<RecordId, Versioned<History>>,
    categories: HashMap<RecordId, Versioned<Category>>,
    tasks: HashMap<RecordId, Versioned<Task>>,
    sessions: HashMap<RecordId, Versioned<Session>>,
    reciprocates: HashMap<RecordId, Versioned<Reciprocate>>,
}

impl Tables {
    fn versions(&self) -> HashMap<RecordId, u64> {
        let mut versions = HashMap::new();
        versions.extend(self.histories.iter().map(|(id, v)| (*id, v.version)));
        versions.extend(self.categories.iter().map(|(id, v)| (*id, v.version)));
        versions.extend(self.tasks.iter().map(|(id, v)| (*id, v.version)));
        versions.extend(self.sessions.iter().map(|(id, v)| (*id, v.version)));
        versions.extend(self.reciprocates.iter().map(|(id, v)| (*id, v.version)));
        versions
    }
}

/// Diagnostics from a store consistency pass. Reported, never repaired.
#[derive(Debug, Default)]
pub struct StoreAudit {
    /// Sessions whose task no longer exists.
    pub orphaned_sessions: Vec<RecordId>,
    /// Tasks whose category no longer exists.
    pub orphaned_tasks: Vec<RecordId>,
    /// Categories whose history no longer exists.
    pub orphaned_categories: Vec<RecordId>,
    /// Surplus default-data candidates: private histories beyond the first,
    /// untitled categories/tasks beyond the first under their parent.
    pub ambiguous_defaults: Vec<RecordId>,
}

impl StoreAudit {
    pub fn is_clean(&self) -> bool {
        self.orphaned_sessions.is_empty()
            && self.orphaned_tasks.is_empty()
            && self.orphaned_categories.is_empty()
            && self.ambiguous_defaults.is_empty()
    }
}

/// The typed record store.
///
/// Thread-safe for use in a multi-threaded Tokio runtime.
/// Wrap in `Arc` for shared ownership.
pub struct HistoryStore {
    tables: RwLock<Tables>,
    bus: Arc<EventBus>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            bus: Arc::new(EventBus::new()),
        }
    }
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to change events. Returns `Subscription` that
    /// unsubscribes on drop.
    pub fn subscribe(
        &self,
        callback: impl Fn(StoreEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.bus.subscribe(callback)
    }

    /// Inject a share-acceptance signal from the platform share UI.
    /// The accepted records arrive later through replication; this event
    /// lets the roster show the sharer immediately.
    pub fn share_accepted(&self, display_name: String, lookup: LookupInfo) {
        self.bus.emit(StoreEvent::ShareAccepted {
            display_name,
            lookup,
        });
    }

    /// Open a transaction. Writes are staged and only become visible at
    /// `commit`.
    pub fn begin(&self) -> StoreTxn<'_> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        StoreTxn {
            store: self,
            begin_versions: tables.versions(),
            ops: Vec::new(),
        }
    }

    // ---- reads ----

    pub fn history(&self, id: RecordId) -> Option<History> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.histories.get(&id).map(|v| v.record.clone())
    }

    /// All histories, oldest first (created_at, then id).
    pub fn histories(&self) -> Vec<History> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut histories: Vec<History> =
            tables.histories.values().map(|v| v.record.clone()).collect();
        histories.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        histories
    }

    pub fn category(&self, id: RecordId) -> Option<Category> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.categories.get(&id).map(|v| v.record.clone())
    }

    /// Categories under a history, in id order.
    pub fn categories_of(&self, history_id: RecordId) -> Vec<Category> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut categories: Vec<Category> = tables
            .categories
            .values()
            .filter(|v| v.record.history_id == history_id)
            .map(|v| v.record.clone())
            .collect();
        categories.sort_by_key(|c| c.id);
        categories
    }

    pub fn task(&self, id: RecordId) -> Option<Task> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.tasks.get(&id).map(|v| v.record.clone())
    }

    /// Tasks under a category, in id order.
    pub fn tasks_of(&self, category_id: RecordId) -> Vec<Task> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut tasks: Vec<Task> = tables
            .tasks
            .values()
            .filter(|v| v.record.category_id == category_id)
            .map(|v| v.record.clone())
            .collect();
        tasks.sort_by_key(|t| t.id);
        tasks
    }

    pub fn session(&self, id: RecordId) -> Option<Session> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        tables.sessions.get(&id).map(|v| v.record.clone())
    }

    /// Sessions under a task, earliest start first.
    pub fn sessions_of(&self, task_id: RecordId) -> Vec<Session> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|v| v.record.task_id == task_id)
            .map(|v| v.record.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Every session reachable from a history through the category/task
    /// tree. Dangling sessions are not reachable and so never counted.
    pub fn sessions_of_history(&self, history_id: RecordId) -> Vec<Session> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let category_ids: HashSet<RecordId> = tables
            .categories
            .values()
            .filter(|v| v.record.history_id == history_id)
            .map(|v| v.record.id)
            .collect();
        let task_ids: HashSet<RecordId> = tables
            .tasks
            .values()
            .filter(|v| category_ids.contains(&v.record.category_id))
            .map(|v| v.record.id)
            .collect();
        let mut sessions: Vec<Session> = tables
            .sessions
            .values()
            .filter(|v| task_ids.contains(&v.record.task_id))
            .map(|v| v.record.clone())
            .collect();
        sessions.sort_by(|a, b| a.start_date.cmp(&b.start_date).then(a.id.cmp(&b.id)));
        sessions
    }

    /// Reciprocation markers under a history, in id order.
    pub fn reciprocates_of(&self, history_id: RecordId) -> Vec<Reciprocate> {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut markers: Vec<Reciprocate> = tables
            .reciprocates
            .values()
            .filter(|v| v.record.history_id == history_id)
            .map(|v| v.record.clone())
            .collect();
        markers.sort_by_key(|m| m.id);
        markers
    }

    /// Consistency pass over the whole store. Orphans are warned about
    /// here and skipped by tree reads; nothing is repaired.
    pub fn audit(&self) -> StoreAudit {
        let tables = self.tables.read().unwrap_or_else(|e| e.into_inner());
        let mut audit = StoreAudit::default();

        for v in tables.categories.values() {
            if !tables.histories.contains_key(&v.record.history_id) {
                audit.orphaned_categories.push(v.record.id);
            }
        }
        for v in tables.tasks.values() {
            if !tables.categories.contains_key(&v.record.category_id) {
                audit.orphaned_tasks.push(v.record.id);
            }
        }
        for v in tables.sessions.values() {
            if !tables.tasks.contains_key(&v.record.task_id) {
                audit.orphaned_sessions.push(v.record.id);
            }
        }

        // Surplus private histories (duplicates awaiting merge)
        let mut private: Vec<&History> = tables
            .histories
            .values()
            .map(|v| &v.record)
            .filter(|h| h.lane == Lane::Private)
            .collect();
        private.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        audit
            .ambiguous_defaults
            .extend(private.iter().skip(1).map(|h| h.id));

        // Surplus untitled categories/tasks under one parent
        let mut untitled_categories: HashMap<RecordId, Vec<RecordId>> = HashMap::new();
        for v in tables.categories.values() {
            if v.record.title.is_none() {
                untitled_categories
                    .entry(v.record.history_id)
                    .or_default()
                    .push(v.record.id);
            }
        }
        let mut untitled_tasks: HashMap<RecordId, Vec<RecordId>> = HashMap::new();
        for v in tables.tasks.values() {
            if v.record.title.is_none() {
                untitled_tasks
                    .entry(v.record.category_id)
                    .or_default()
                    .push(v.record.id);
            }
        }
        for group in untitled_categories.values_mut().chain(untitled_tasks.values_mut()) {
            group.sort();
            audit.ambiguous_defaults.extend(group.iter().skip(1));
        }

        audit.orphaned_sessions.sort();
        audit.orphaned_tasks.sort();
        audit.orphaned_categories.sort();
        audit.ambiguous_defaults.sort();

        for id in &audit.orphaned_sessions {
            warn!("Orphaned session {} (task missing, possibly mid-sync)", id);
        }
        for id in &audit.orphaned_tasks {
            warn!("Orphaned task {} (category missing)", id);
        }
        for id in &audit.orphaned_categories {
            warn!("Orphaned category {} (history missing)", id);
        }

        audit
    }
}

enum Op {
    PutHistory(History),
    PutCategory(Category),
    PutTask(Task),
    PutSession(Session),
    PutReciprocate(Reciprocate),
    DeleteHistory(RecordId),
    DeleteSession(RecordId),
}

impl Op {
    fn staged_id(&self) -> Option<(RecordKind, RecordId)> {
        match self {
            Op::PutHistory(h) => Some((RecordKind::History, h.id)),
            Op::PutCategory(c) => Some((RecordKind::Category, c.id)),
            Op::PutTask(t) => Some((RecordKind::Task, t.id)),
            Op::PutSession(s) => Some((RecordKind::Session, s.id)),
            Op::PutReciprocate(r) => Some((RecordKind::Reciprocate, r.id)),
            Op::DeleteHistory(_) | Op::DeleteSession(_) => None,
        }
    }
}

/// A staged batch of writes against a [`HistoryStore`].
///
/// Nothing is visible to readers until `commit`. Dropping the transaction
/// discards it.
pub struct StoreTxn<'a> {
    store: &'a HistoryStore,
    begin_versions: HashMap<RecordId, u64>,
    ops: Vec<Op>,
}

impl StoreTxn<'_> {
    /// Stage a brand-new locally-created history. The store assigns the
    /// creation timestamp.
    pub fn create_history(&mut self, owner_name: impl Into<String>) -> History {
        let history = History::new(owner_name);
        self.ops.push(Op::PutHistory(history.clone()));
        history
    }

    /// Stage a fresh category under `history_id`.
    pub fn create_category(&mut self, history_id: RecordId, title: Option<String>) -> Category {
        let category = Category::new(history_id, title);
        self.ops.push(Op::PutCategory(category.clone()));
        category
    }

    /// Stage a fresh task under `category_id`.
    pub fn create_task(&mut self, category_id: RecordId, title: Option<String>) -> Task {
        let task = Task::new(category_id, title);
        self.ops.push(Op::PutTask(task.clone()));
        task
    }

    /// Stage a history exactly as given. This is the seam the replication
    /// adapter and the merge engine write through: ids, lanes, and
    /// server-assigned timestamps are preserved.
    pub fn upsert_history(&mut self, history: History) {
        self.ops.push(Op::PutHistory(history));
    }

    pub fn upsert_category(&mut self, category: Category) {
        self.ops.push(Op::PutCategory(category));
    }

    pub fn upsert_task(&mut self, task: Task) {
        self.ops.push(Op::PutTask(task));
    }

    pub fn upsert_session(&mut self, session: Session) {
        self.ops.push(Op::PutSession(session));
    }

    pub fn upsert_reciprocate(&mut self, marker: Reciprocate) {
        self.ops.push(Op::PutReciprocate(marker));
    }

    /// Stage deletion of a history and everything under it: categories,
    /// tasks, sessions, reciprocation markers.
    pub fn delete_history(&mut self, id: RecordId) {
        self.ops.push(Op::DeleteHistory(id));
    }

    pub fn delete_session(&mut self, id: RecordId) {
        self.ops.push(Op::DeleteSession(id));
    }

    /// Apply the batch. Conflicts against records that changed since
    /// `begin()` are resolved per record by `policy`; deletes always
    /// apply. Events are emitted after the batch is visible.
    pub fn commit(self, policy: SavePolicy) -> Result<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        for op in &self.ops {
            if let Some((kind, id)) = op.staged_id() {
                if id.is_placeholder() {
                    return Err(StoreError::PlaceholderId { kind });
                }
            }
        }

        let mut changes: BTreeSet<(RecordKind, ChangeKind)> = BTreeSet::new();
        // (kind, child, parent) for a post-apply dangling-parent warning
        let mut links: Vec<(RecordKind, RecordId, RecordId)> = Vec::new();

        {
            let mut tables = self.store.tables.write().unwrap_or_else(|e| e.into_inner());
            for op in self.ops {
                match op {
                    Op::PutHistory(h) => {
                        apply_put(
                            &mut tables.histories,
                            h,
                            |h| h.id,
                            &self.begin_versions,
                            policy,
                            RecordKind::History,
                            &mut changes,
                        );
                    }
                    Op::PutCategory(c) => {
                        links.push((RecordKind::Category, c.id, c.history_id));
                        apply_put(
                            &mut tables.categories,
                            c,
                            |c| c.id,
                            &self.begin_versions,
                            policy,
                            RecordKind::Category,
                            &mut changes,
                        );
                    }
                    Op::PutTask(t) => {
                        links.push((RecordKind::Task, t.id, t.category_id));
                        apply_put(
                            &mut tables.tasks,
                            t,
                            |t| t.id,
                            &self.begin_versions,
                            policy,
                            RecordKind::Task,
                            &mut changes,
                        );
                    }
                    Op::PutSession(s) => {
                        links.push((RecordKind::Session, s.id, s.task_id));
                        apply_put(
                            &mut tables.sessions,
                            s,
                            |s| s.id,
                            &self.begin_versions,
                            policy,
                            RecordKind::Session,
                            &mut changes,
                        );
                    }
                    Op::PutReciprocate(r) => {
                        links.push((RecordKind::Reciprocate, r.id, r.history_id));
                        apply_put(
                            &mut tables.reciprocates,
                            r,
                            |r| r.id,
                            &self.begin_versions,
                            policy,
                            RecordKind::Reciprocate,
                            &mut changes,
                        );
                    }
                    Op::DeleteHistory(id) => delete_history_cascade(&mut tables, id, &mut changes),
                    Op::DeleteSession(id) => {
                        if tables.sessions.remove(&id).is_some() {
                            changes.insert((RecordKind::Session, ChangeKind::Deleted));
                        } else {
                            debug!("Delete of unknown session {} ignored", id);
                        }
                    }
                }
            }

            for (kind, child, parent) in links {
                let present = match kind {
                    RecordKind::Category | RecordKind::Reciprocate => {
                        tables.histories.contains_key(&parent)
                    }
                    RecordKind::Task => tables.categories.contains_key(&parent),
                    RecordKind::Session => tables.tasks.contains_key(&parent),
                    RecordKind::History => true,
                };
                if !present {
                    warn!(
                        "Committed {:?} {} references missing parent {} (possibly mid-sync)",
                        kind, child, parent
                    );
                }
            }
        }

        for (kind, change) in changes {
            self.store.bus.emit(StoreEvent::RecordsChanged { kind, change });
        }
        Ok(())
    }
}

fn apply_put<T>(
    map: &mut HashMap<RecordId, Versioned<T>>,
    record: T,
    id_of: impl Fn(&T) -> RecordId,
    begin_versions: &HashMap<RecordId, u64>,
    policy: SavePolicy,
    kind: RecordKind,
    changes: &mut BTreeSet<(RecordKind, ChangeKind)>,
) {
    let id = id_of(&record);
    match map.get_mut(&id) {
        Some(existing) => {
            let unchanged = begin_versions.get(&id) == Some(&existing.version);
            if policy == SavePolicy::StoreWins && !unchanged {
                debug!(
                    "Dropping staged write to {:?} {} (changed since the transaction began)",
                    kind, id
                );
                return;
            }
            existing.record = record;
            existing.version += 1;
            changes.insert((kind, ChangeKind::Updated));
        }
        None => {
            map.insert(
                id,
                Versioned {
                    record,
                    version: 1,
                },
            );
            changes.insert((kind, ChangeKind::Created));
        }
    }
}

fn delete_history_cascade(
    tables: &mut Tables,
    id: RecordId,
    changes: &mut BTreeSet<(RecordKind, ChangeKind)>,
) {
    if tables.histories.remove(&id).is_some() {
        changes.insert((RecordKind::History, ChangeKind::Deleted));
    } else {
        debug!("Delete of unknown history {} ignored", id);
    }

    let category_ids: HashSet<RecordId> = tables
        .categories
        .values()
        .filter(|v| v.record.history_id == id)
        .map(|v| v.record.id)
        .collect();
    let task_ids: HashSet<RecordId> = tables
        .tasks
        .values()
        .filter(|v| category_ids.contains(&v.record.category_id))
        .map(|v| v.record.id)
        .collect();
    let session_ids: Vec<RecordId> = tables
        .sessions
        .values()
        .filter(|v| task_ids.contains(&v.record.task_id))
        .map(|v| v.record.id)
        .collect();
    let marker_ids: Vec<RecordId> = tables
        .reciprocates
        .values()
        .filter(|v| v.record.history_id == id)
        .map(|v| v.record.id)
        .collect();

    for sid in &session_ids {
        tables.sessions.remove(sid);
    }
    for tid in &task_ids {
        tables.tasks.remove(tid);
    }
    for cid in &category_ids {
        tables.categories.remove(cid);
    }
    for mid in &marker_ids {
        tables.reciprocates.remove(mid);
    }

    if !category_ids.is_empty() {
        changes.insert((RecordKind::Category, ChangeKind::Deleted));
    }
    if !task_ids.is_empty() {
        changes.insert((RecordKind::Task, ChangeKind::Deleted));
    }
    if !session_ids.is_empty() {
        changes.insert((RecordKind::Session, ChangeKind::Deleted));
    }
    if !marker_ids.is_empty() {
        changes.insert((RecordKind::Reciprocate, ChangeKind::Deleted));
    }
}
