//! Duplicate-history merge.
//!
//! Replication can materialize the same user's history twice: a fresh
//! install creates default records before the old ones finish syncing
//! down. A merge pass keeps the best history and folds the others into it
//! by title, cloning whatever the winner is missing and skipping sessions
//! it already has. The fold lands in one transaction, so observers see
//! either the duplicated state or the merged one.

use std::collections::HashMap;
use std::sync::Arc;

use history_core::{
    Category, History, HistoryStore, RecordId, SavePolicy, Session, StoreTxn, Task,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::identity::{IdentityError, OwnershipResolver};

#[derive(Debug, Error)]
pub enum MergeError {
    #[error(transparent)]
    Identity(#[from] IdentityError),
    #[error(transparent)]
    Store(#[from] history_core::StoreError),
}

pub type Result<T> = std::result::Result<T, MergeError>;

/// What a merge pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub histories_deleted: usize,
    pub categories_cloned: usize,
    pub tasks_cloned: usize,
    pub sessions_cloned: usize,
    pub duplicate_sessions_skipped: usize,
}

impl MergeReport {
    pub fn has_changes(&self) -> bool {
        self.histories_deleted > 0
    }
}

/// Folds duplicate owned histories into one.
pub struct MergeEngine {
    store: Arc<HistoryStore>,
    resolver: OwnershipResolver,
}

impl MergeEngine {
    pub fn new(store: Arc<HistoryStore>, resolver: OwnershipResolver) -> Self {
        Self { store, resolver }
    }

    /// Merge all histories owned by the current user down to one.
    ///
    /// Foreign histories are never touched. If any history cannot be
    /// classified the pass aborts before writing anything; a guess here
    /// could fold someone else's history into ours.
    pub async fn merge_owned_histories(&self) -> Result<MergeReport> {
        let mut owned: Vec<(History, bool)> = Vec::new();
        for history in self.store.histories() {
            let ownership = self.resolver.classify(history.id).await?;
            if ownership.owned {
                owned.push((history, ownership.share.is_some()));
            }
        }
        if owned.len() <= 1 {
            return Ok(MergeReport::default());
        }

        // Best history first: already shared, then oldest
        owned.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(a.0.created_at.cmp(&b.0.created_at))
                .then(a.0.id.cmp(&b.0.id))
        });
        let winner = owned[0].0.clone();
        debug!(
            "Merging {} duplicate histories into {}",
            owned.len() - 1,
            winner.id
        );

        let mut view = WinnerView::load(&self.store, winner.id);
        let mut report = MergeReport::default();
        let mut txn = self.store.begin();

        for (loser, _) in &owned[1..] {
            let loser_categories = self.store.categories_of(loser.id);
            if loser_categories.is_empty() {
                warn!("History {} has no categories, deleting without merging", loser.id);
            }
            for loser_category in loser_categories {
                match view.category_id_by_title(&loser_category.title) {
                    None => self.clone_category_subtree(
                        &mut txn,
                        &mut view,
                        &loser_category,
                        &mut report,
                    ),
                    Some(winner_category) => {
                        for loser_task in self.store.tasks_of(loser_category.id) {
                            match view.task_id_by_title(winner_category, &loser_task.title) {
                                None => self.clone_task_subtree(
                                    &mut txn,
                                    &mut view,
                                    &loser_task,
                                    winner_category,
                                    &mut report,
                                ),
                                Some(winner_task) => {
                                    for session in self.store.sessions_of(loser_task.id) {
                                        if view.has_session_like(winner_task, &session) {
                                            report.duplicate_sessions_skipped += 1;
                                        } else {
                                            let cloned = session.clone_as_new(winner_task);
                                            txn.upsert_session(cloned.clone());
                                            view.insert_session(winner_task, cloned);
                                            report.sessions_cloned += 1;
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
            txn.delete_history(loser.id);
            report.histories_deleted += 1;
        }

        txn.commit(SavePolicy::LocalWins)?;
        info!(
            "Merged {} histories into {}: {} categories, {} tasks, {} sessions cloned, {} duplicates skipped",
            report.histories_deleted + 1,
            winner.id,
            report.categories_cloned,
            report.tasks_cloned,
            report.sessions_cloned,
            report.duplicate_sessions_skipped
        );
        Ok(report)
    }

    fn clone_category_subtree(
        &self,
        txn: &mut StoreTxn<'_>,
        view: &mut WinnerView,
        category: &Category,
        report: &mut MergeReport,
    ) {
        let cloned = category.clone_as_new(view.history_id);
        let into = cloned.id;
        txn.upsert_category(cloned.clone());
        view.categories.push(cloned);
        report.categories_cloned += 1;

        for task in self.store.tasks_of(category.id) {
            self.clone_task_subtree(txn, view, &task, into, report);
        }
    }

    fn clone_task_subtree(
        &self,
        txn: &mut StoreTxn<'_>,
        view: &mut WinnerView,
        task: &Task,
        into_category: RecordId,
        report: &mut MergeReport,
    ) {
        let cloned = task.clone_as_new(into_category);
        let into = cloned.id;
        txn.upsert_task(cloned.clone());
        view.tasks.entry(into_category).or_default().push(cloned);
        report.tasks_cloned += 1;

        // A fresh task cannot already hold any of these sessions
        for session in self.store.sessions_of(task.id) {
            let cloned = session.clone_as_new(into);
            txn.upsert_session(cloned.clone());
            view.insert_session(into, cloned);
            report.sessions_cloned += 1;
        }
    }
}

/// The winner's tree as it grows during the fold. Later losers dedup
/// against clones staged for earlier ones, not just the committed state.
struct WinnerView {
    history_id: RecordId,
    categories: Vec<Category>,
    tasks: HashMap<RecordId, Vec<Task>>,
    sessions: HashMap<RecordId, Vec<Session>>,
}

impl WinnerView {
    fn load(store: &HistoryStore, history_id: RecordId) -> Self {
        let categories = store.categories_of(history_id);
        let mut tasks: HashMap<RecordId, Vec<Task>> = HashMap::new();
        let mut sessions: HashMap<RecordId, Vec<Session>> = HashMap::new();
        for category in &categories {
            let category_tasks = store.tasks_of(category.id);
            for task in &category_tasks {
                sessions.insert(task.id, store.sessions_of(task.id));
            }
            tasks.insert(category.id, category_tasks);
        }
        Self {
            history_id,
            categories,
            tasks,
            sessions,
        }
    }

    fn category_id_by_title(&self, title: &Option<String>) -> Option<RecordId> {
        self.categories
            .iter()
            .find(|c| &c.title == title)
            .map(|c| c.id)
    }

    fn task_id_by_title(&self, category_id: RecordId, title: &Option<String>) -> Option<RecordId> {
        self.tasks
            .get(&category_id)?
            .iter()
            .find(|t| &t.title == title)
            .map(|t| t.id)
    }

    fn has_session_like(&self, task_id: RecordId, session: &Session) -> bool {
        self.sessions
            .get(&task_id)
            .is_some_and(|sessions| sessions.iter().any(|s| s.same_event(session)))
    }

    fn insert_session(&mut self, task_id: RecordId, session: Session) {
        self.sessions.entry(task_id).or_default().push(session);
    }
}
