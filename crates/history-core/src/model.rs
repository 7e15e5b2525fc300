//! Record types for the pomodoro history tree.
//!
//! The tree is History → Category → Task → Session, plus Reciprocate
//! markers parented directly to a History. Records are plain data; the
//! store owns persistence and the share layer owns cloud semantics.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::record_id::RecordId;

/// Which replication lane a record lives in.
///
/// Locally created records are `Private`; records that arrived through a
/// share are `Shared`. The owner's roster counts only `Private` sessions,
/// so foreign records can never inflate the owner's own totals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lane {
    Private,
    Shared,
}

/// Timer flavor for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerType {
    Pomodoro,
    ShortBreak,
    LongBreak,
}

/// An address by which a person can be invited to a share.
///
/// Comparison of addresses always goes through [`LookupInfo::matches`],
/// which compares canonical forms: emails are trimmed and lowercased,
/// phone numbers are reduced to their digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "value")]
pub enum LookupInfo {
    Email(String),
    Phone(String),
}

impl LookupInfo {
    /// Canonical form used for equality and hashing.
    pub fn normalized(&self) -> LookupInfo {
        match self {
            LookupInfo::Email(addr) => LookupInfo::Email(addr.trim().to_ascii_lowercase()),
            LookupInfo::Phone(number) => {
                LookupInfo::Phone(number.chars().filter(|c| c.is_ascii_digit()).collect())
            }
        }
    }

    /// Address equality on canonical forms.
    pub fn matches(&self, other: &LookupInfo) -> bool {
        self.normalized() == other.normalized()
    }

    /// The address as entered, without normalization.
    pub fn raw(&self) -> &str {
        match self {
            LookupInfo::Email(addr) => addr,
            LookupInfo::Phone(number) => number,
        }
    }
}

/// Root of one person's record tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct History {
    pub id: RecordId,
    /// Display name of the history's owner. Empty for the local user's own
    /// history; the roster resolves fresher names from share metadata.
    pub owner_name: String,
    pub allow_reactions: bool,
    pub allow_comments: bool,
    /// Assigned by the store on first save; server-assigned values are
    /// preserved when a record arrives through replication.
    pub created_at: DateTime<Utc>,
    pub lane: Lane,
}

impl History {
    /// Fresh locally-owned history.
    pub fn new(owner_name: impl Into<String>) -> Self {
        Self {
            id: RecordId::generate(),
            owner_name: owner_name.into(),
            allow_reactions: true,
            allow_comments: true,
            created_at: Utc::now(),
            lane: Lane::Private,
        }
    }

    /// Copy with a fresh id on the private lane, same scalars.
    ///
    /// Used when unsharing: the replacement history must be a new record
    /// so it lands outside the old share's zone.
    pub fn clone_as_new(&self) -> Self {
        Self {
            id: RecordId::generate(),
            owner_name: self.owner_name.clone(),
            allow_reactions: self.allow_reactions,
            allow_comments: self.allow_comments,
            created_at: self.created_at,
            lane: Lane::Private,
        }
    }
}

/// Groups tasks within a history. A `None` title marks the default
/// category created by the session-home bootstrap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Category {
    pub id: RecordId,
    pub history_id: RecordId,
    pub title: Option<String>,
}

impl Category {
    pub fn new(history_id: RecordId, title: Option<String>) -> Self {
        Self {
            id: RecordId::generate(),
            history_id,
            title,
        }
    }

    /// Copy with a fresh id, reparented under `history_id`.
    pub fn clone_as_new(&self, history_id: RecordId) -> Self {
        Self {
            id: RecordId::generate(),
            history_id,
            title: self.title.clone(),
        }
    }
}

/// A unit of work within a category. A `None` title marks the default task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: RecordId,
    pub category_id: RecordId,
    pub title: Option<String>,
}

impl Task {
    pub fn new(category_id: RecordId, title: Option<String>) -> Self {
        Self {
            id: RecordId::generate(),
            category_id,
            title,
        }
    }

    /// Copy with a fresh id, reparented under `category_id`.
    pub fn clone_as_new(&self, category_id: RecordId) -> Self {
        Self {
            id: RecordId::generate(),
            category_id,
            title: self.title.clone(),
        }
    }
}

/// One timer run. Timing is derived, never stored: see the methods in
/// [`crate::timing`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: RecordId,
    pub task_id: RecordId,
    /// When the timer was started. `None` until the user starts it.
    pub start_date: Option<DateTime<Utc>>,
    /// Set while paused, cleared on resume.
    pub pause_date: Option<DateTime<Utc>>,
    /// Total seconds spent paused across all completed pause intervals.
    pub pause_seconds: i64,
    /// Manual correction applied by the user. May be negative.
    pub adjustment_seconds: i64,
    /// Set when the user skips to the end of the session.
    pub fast_forward_date: Option<DateTime<Utc>>,
    /// Configured duration of the timer.
    pub time_seconds: i64,
    /// Position within the pomodoro cycle (work/break progression).
    pub stage: i32,
    pub timer_type: TimerType,
    pub lane: Lane,
}

impl Session {
    /// Fresh unstarted session under `task_id`.
    pub fn new(task_id: RecordId, time_seconds: i64, timer_type: TimerType) -> Self {
        Self {
            id: RecordId::generate(),
            task_id,
            start_date: None,
            pause_date: None,
            pause_seconds: 0,
            adjustment_seconds: 0,
            fast_forward_date: None,
            time_seconds,
            stage: 0,
            timer_type,
            lane: Lane::Private,
        }
    }

    /// Copy with a fresh id, reparented under `task_id`.
    pub fn clone_as_new(&self, task_id: RecordId) -> Self {
        Self {
            id: RecordId::generate(),
            task_id,
            ..self.clone()
        }
    }

    /// Two sessions are the same logical timer run when they started at the
    /// same instant with the same timer type. This is the dedup key used
    /// when duplicate histories are merged.
    pub fn same_event(&self, other: &Session) -> bool {
        self.start_date == other.start_date && self.timer_type == other.timer_type
    }

    /// Whether this session counts toward roster totals: only pomodoros
    /// that were actually started.
    pub fn counts_for_roster(&self) -> bool {
        self.start_date.is_some() && self.timer_type == TimerType::Pomodoro
    }
}

/// Marker a share participant writes into the shared history to answer a
/// reciprocation offer. Keyed by the salted hash of the participant's own
/// lookup address in that share, so repeat answers overwrite.
///
/// `url = Some(..)` carries the participant's own share URL back to the
/// history's owner; `None` records an explicit decline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reciprocate {
    pub id: RecordId,
    pub history_id: RecordId,
    pub lookup_hash: String,
    pub url: Option<String>,
}

impl Reciprocate {
    pub fn new(history_id: RecordId, lookup_hash: String, url: Option<String>) -> Self {
        Self {
            id: RecordId::generate(),
            history_id,
            lookup_hash,
            url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_email_normalization() {
        let a = LookupInfo::Email("  Ada@Example.COM ".into());
        let b = LookupInfo::Email("ada@example.com".into());
        assert!(a.matches(&b));
        assert_ne!(a, b); // raw forms differ
        assert_eq!(a.normalized(), b.normalized());
    }

    #[test]
    fn test_lookup_phone_normalization() {
        let a = LookupInfo::Phone("+1 (555) 010-2030".into());
        let b = LookupInfo::Phone("15550102030".into());
        assert!(a.matches(&b));
    }

    #[test]
    fn test_lookup_kinds_never_match() {
        let email = LookupInfo::Email("5550102030".into());
        let phone = LookupInfo::Phone("5550102030".into());
        assert!(!email.matches(&phone));
    }

    #[test]
    fn test_history_clone_as_new_lands_private() {
        let mut original = History::new("");
        original.lane = Lane::Shared;
        original.allow_comments = false;

        let copy = original.clone_as_new();
        assert_ne!(copy.id, original.id);
        assert_eq!(copy.lane, Lane::Private);
        assert_eq!(copy.created_at, original.created_at);
        assert!(!copy.allow_comments);
    }

    #[test]
    fn test_subtree_clone_reparents() {
        let history = History::new("");
        let category = Category::new(history.id, Some("Work".into()));
        let task = Task::new(category.id, None);
        let session = Session::new(task.id, 1500, TimerType::Pomodoro);

        let new_history = history.clone_as_new();
        let new_category = category.clone_as_new(new_history.id);
        let new_task = task.clone_as_new(new_category.id);
        let new_session = session.clone_as_new(new_task.id);

        assert_eq!(new_category.history_id, new_history.id);
        assert_eq!(new_task.category_id, new_category.id);
        assert_eq!(new_session.task_id, new_task.id);
        assert_ne!(new_session.id, session.id);
        assert_eq!(new_session.time_seconds, 1500);
    }

    #[test]
    fn test_same_event_key() {
        let task = RecordId::generate();
        let mut a = Session::new(task, 1500, TimerType::Pomodoro);
        let mut b = Session::new(task, 300, TimerType::Pomodoro);

        // Unstarted sessions of the same type collide on the (None, type) key
        assert!(a.same_event(&b));

        let start = Utc::now();
        a.start_date = Some(start);
        b.start_date = Some(start);
        assert!(a.same_event(&b));

        b.timer_type = TimerType::ShortBreak;
        assert!(!a.same_event(&b));
    }

    #[test]
    fn test_counts_for_roster() {
        let task = RecordId::generate();
        let mut session = Session::new(task, 1500, TimerType::Pomodoro);
        assert!(!session.counts_for_roster()); // never started

        session.start_date = Some(Utc::now());
        assert!(session.counts_for_roster());

        session.timer_type = TimerType::LongBreak;
        assert!(!session.counts_for_roster());
    }
}
