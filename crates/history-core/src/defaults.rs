//! Default-data bootstrap.
//!
//! New sessions always land under an untitled task in an untitled category
//! in the user's private history. This module finds that chain, creating
//! whatever is missing, and warns when replication has left more than one
//! candidate (the merge engine resolves duplicate histories later; surplus
//! untitled containers are left alone).

use tracing::{debug, warn};

use crate::model::Lane;
use crate::record_id::RecordId;
use crate::store::{HistoryStore, Result, SavePolicy};

/// Where locally-created sessions go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHome {
    pub history: RecordId,
    pub category: RecordId,
    pub task: RecordId,
}

/// Resolve the default history/category/task chain, creating missing
/// pieces in one transaction. Idempotent: a second call returns the same
/// ids.
pub fn ensure_session_home(store: &HistoryStore) -> Result<SessionHome> {
    let mut txn = store.begin();

    let private: Vec<_> = store
        .histories()
        .into_iter()
        .filter(|h| h.lane == Lane::Private)
        .collect();
    let history_id = match private.first() {
        Some(first) => {
            if private.len() > 1 {
                warn!(
                    "Multiple private histories ({}), defaulting to the oldest {}",
                    private.len(),
                    first.id
                );
            }
            first.id
        }
        None => {
            debug!("No private history, creating one");
            txn.create_history("").id
        }
    };

    let untitled: Vec<_> = store
        .categories_of(history_id)
        .into_iter()
        .filter(|c| c.title.is_none())
        .collect();
    let category_id = match untitled.first() {
        Some(first) => {
            if untitled.len() > 1 {
                warn!(
                    "Multiple untitled categories under history {}, defaulting to {}",
                    history_id, first.id
                );
            }
            first.id
        }
        None => txn.create_category(history_id, None).id,
    };

    let untitled: Vec<_> = store
        .tasks_of(category_id)
        .into_iter()
        .filter(|t| t.title.is_none())
        .collect();
    let task_id = match untitled.first() {
        Some(first) => {
            if untitled.len() > 1 {
                warn!(
                    "Multiple untitled tasks under category {}, defaulting to {}",
                    category_id, first.id
                );
            }
            first.id
        }
        None => txn.create_task(category_id, None).id,
    };

    txn.commit(SavePolicy::LocalWins)?;
    Ok(SessionHome {
        history: history_id,
        category: category_id,
        task: task_id,
    })
}
