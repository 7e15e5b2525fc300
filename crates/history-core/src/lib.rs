//! history-core: Typed record store for pomodoro history trees.
//!
//! This crate provides the core functionality for:
//! - The History → Category → Task → Session record model
//! - Transactional batch commits with per-record conflict policies
//! - Coalesced change events for interested components
//! - Session timing math and calendar-day bucketing

pub mod day;
pub mod defaults;
pub mod events;
pub mod model;
pub mod record_id;
pub mod store;
pub mod timing;

pub use day::ADay;
pub use defaults::{ensure_session_home, SessionHome};
pub use events::{ChangeKind, EventBus, RecordKind, StoreEvent, Subscription};
pub use model::{Category, History, Lane, LookupInfo, Reciprocate, Session, Task, TimerType};
pub use record_id::{RecordId, RecordIdError};
pub use store::{HistoryStore, SavePolicy, StoreAudit, StoreError, StoreTxn};
