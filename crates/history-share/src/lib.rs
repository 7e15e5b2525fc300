//! history-share: peer sharing and reconciliation for pomodoro histories.
//!
//! This crate provides the sharing side of the system:
//! - A `CloudSharing` capability trait with an in-memory double
//! - Duplicate-history merge
//! - Share lifecycle and the reciprocation handshake
//! - A throttled, cancellable roster of visible people
//! - The `Engine` event loop tying it all together

pub mod cloud;
pub mod engine;
pub mod identity;
pub mod merge;
pub mod reciprocation;
pub mod roster;
pub mod share;

pub use cloud::{
    CloudBackend, CloudError, CloudShare, CloudSharing, InMemoryCloud, LookupOutcome, Participant,
    ParticipantRole, ShareMetadata, SharePermission, ShareUrl,
};
pub use engine::{Engine, EngineConfig, EngineError};
pub use identity::{lookup_hash, IdentityError, Ownership, OwnershipResolver};
pub use merge::{MergeEngine, MergeError, MergeReport};
pub use reciprocation::{ReciprocationError, ReciprocationService};
pub use roster::{
    compute_roster, Person, RefreshThrottle, RosterError, RosterRefresher, RosterSource,
    ROSTER_THROTTLE,
};
pub use share::{
    with_share_overlay, OverlayOutcome, ShareError, ShareManager, ShareOutcome,
    SHARE_OVERLAY_CEILING,
};
