//! Cloud sharing abstraction.
//!
//! `CloudSharing` is the seam between the share workflows and the
//! platform's record-zone sharing service. `InMemoryCloud` backs tests and
//! local development: one `CloudBackend` plays the server, and one
//! `InMemoryCloud` per simulated user plays that user's view of it.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use history_core::{LookupInfo, RecordId};
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("Sharing service unavailable: {0}")]
    Unavailable(String),
    #[error("No share exists for history {0}")]
    NoSuchShare(RecordId),
    #[error("Could not fetch share metadata for {0}: {1}")]
    MetadataFetch(String, String),
    #[error("Could not purge share zone: {0}")]
    ZonePurge(String),
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Opaque locator for a cloud share. Invitees join through it, and
/// reciprocation markers carry it back to the inviter's side.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShareUrl(String);

impl ShareUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShareUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ParticipantRole {
    Owner,
    Member,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SharePermission {
    ReadOnly,
    ReadWrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub lookup: LookupInfo,
    pub display_name: String,
    pub role: ParticipantRole,
    pub permission: SharePermission,
    /// True on the side whose account this is. Stamped by the service on
    /// fetch, never stored.
    pub is_current_user: bool,
}

/// A share covering one history's record zone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudShare {
    pub share_id: RecordId,
    pub history_id: RecordId,
    pub url: ShareUrl,
    /// Per-share salt mixed into participant lookup hashes.
    pub salt: String,
    pub participants: Vec<Participant>,
}

impl CloudShare {
    pub fn owner(&self) -> Option<&Participant> {
        self.participants
            .iter()
            .find(|p| p.role == ParticipantRole::Owner)
    }

    pub fn current_user(&self) -> Option<&Participant> {
        self.participants.iter().find(|p| p.is_current_user)
    }

    pub fn is_owned_by_current_user(&self) -> bool {
        self.owner().is_some_and(|o| o.is_current_user)
    }

    pub fn has_participant(&self, lookup: &LookupInfo) -> bool {
        self.participants.iter().any(|p| p.lookup.matches(lookup))
    }
}

/// Owner details for a share we were invited to, fetched by URL.
#[derive(Debug, Clone, PartialEq)]
pub struct ShareMetadata {
    pub owner_display_name: String,
    pub owner_lookup: Option<LookupInfo>,
}

/// Per-address result of a participant lookup. One bad address never
/// fails the batch.
#[derive(Debug, Clone)]
pub enum LookupOutcome {
    Found(Participant),
    Failed { lookup: LookupInfo, reason: String },
}

/// Capability trait for the platform sharing service.
#[async_trait]
pub trait CloudSharing: Send + Sync {
    /// Create a share for a history, or return the existing one.
    async fn create_share(&self, history_id: RecordId) -> Result<CloudShare>;

    /// The share covering a history, if one exists and we participate in it.
    async fn share_for_history(&self, history_id: RecordId) -> Result<Option<CloudShare>>;

    /// Persist participant changes back to the service.
    async fn save_share(&self, share: &CloudShare) -> Result<()>;

    /// Resolve addresses to user identities. Failures are reported per
    /// address in the returned outcomes.
    async fn lookup_participants(&self, lookups: &[LookupInfo]) -> Result<Vec<LookupOutcome>>;

    /// Owner details for a share we hold a URL to.
    async fn share_metadata(&self, url: &ShareUrl) -> Result<ShareMetadata>;

    /// Remove the server-side share zone. Idempotent.
    async fn purge_share_zone(&self, history_id: RecordId) -> Result<()>;
}

/// Server half of the in-memory cloud. Share one backend across several
/// [`InMemoryCloud`] handles to simulate multiple users.
#[derive(Default)]
pub struct CloudBackend {
    shares: RwLock<HashMap<RecordId, CloudShare>>,
    /// Known accounts: lookup address and display name.
    directory: RwLock<Vec<(LookupInfo, String)>>,
}

impl CloudBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_user(&self, lookup: LookupInfo, display_name: impl Into<String>) {
        let mut directory = self.directory.write().unwrap_or_else(|e| e.into_inner());
        let name = display_name.into();
        if let Some(entry) = directory.iter_mut().find(|(l, _)| l.matches(&lookup)) {
            entry.1 = name;
        } else {
            directory.push((lookup.normalized(), name));
        }
    }

    fn display_name_of(&self, lookup: &LookupInfo) -> Option<String> {
        let directory = self.directory.read().unwrap_or_else(|e| e.into_inner());
        directory
            .iter()
            .find(|(l, _)| l.matches(lookup))
            .map(|(_, name)| name.clone())
    }
}

/// One user's handle onto a [`CloudBackend`], with injectable failures
/// for exercising error paths.
pub struct InMemoryCloud {
    backend: Arc<CloudBackend>,
    me: LookupInfo,
    my_name: String,
    fail_create: AtomicBool,
    fail_fetch: AtomicBool,
    fail_metadata: AtomicBool,
    failing_lookups: RwLock<Vec<LookupInfo>>,
}

impl InMemoryCloud {
    pub fn new(me: LookupInfo, my_name: impl Into<String>) -> Self {
        Self::with_backend(CloudBackend::new(), me, my_name)
    }

    pub fn with_backend(
        backend: Arc<CloudBackend>,
        me: LookupInfo,
        my_name: impl Into<String>,
    ) -> Self {
        let my_name = my_name.into();
        backend.register_user(me.clone(), my_name.clone());
        Self {
            backend,
            me,
            my_name,
            fail_create: AtomicBool::new(false),
            fail_fetch: AtomicBool::new(false),
            fail_metadata: AtomicBool::new(false),
            failing_lookups: RwLock::new(Vec::new()),
        }
    }

    pub fn backend(&self) -> Arc<CloudBackend> {
        Arc::clone(&self.backend)
    }

    pub fn fail_share_creation(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_share_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    pub fn fail_share_metadata(&self, fail: bool) {
        self.fail_metadata.store(fail, Ordering::SeqCst);
    }

    pub fn fail_lookup_for(&self, lookup: LookupInfo) {
        self.failing_lookups
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(lookup);
    }

    /// Join a share we were invited to, as the platform share-acceptance
    /// UI would. Not part of [`CloudSharing`].
    pub fn accept_invite(&self, url: &ShareUrl) -> Result<CloudShare> {
        let mut shares = self.backend.shares.write().unwrap_or_else(|e| e.into_inner());
        let share = shares
            .values_mut()
            .find(|s| &s.url == url)
            .ok_or_else(|| CloudError::MetadataFetch(url.to_string(), "unknown share".into()))?;
        if !share.has_participant(&self.me) {
            share.participants.push(Participant {
                lookup: self.me.clone(),
                display_name: self.my_name.clone(),
                role: ParticipantRole::Member,
                permission: SharePermission::ReadWrite,
                is_current_user: false,
            });
        }
        Ok(self.localize(share))
    }

    /// Stamp `is_current_user` the way the platform does on every fetch.
    fn localize(&self, share: &CloudShare) -> CloudShare {
        let mut share = share.clone();
        for p in &mut share.participants {
            p.is_current_user = p.lookup.matches(&self.me);
        }
        share
    }
}

#[async_trait]
impl CloudSharing for InMemoryCloud {
    async fn create_share(&self, history_id: RecordId) -> Result<CloudShare> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable("share creation failed".into()));
        }
        let mut shares = self.backend.shares.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = shares.values().find(|s| s.history_id == history_id) {
            return Ok(self.localize(existing));
        }

        let share_id = RecordId::generate();
        let share = CloudShare {
            share_id,
            history_id,
            url: ShareUrl::new(format!("memory://shares/{}", share_id)),
            salt: format!("{:016x}", rand::rng().random::<u64>()),
            participants: vec![Participant {
                lookup: self.me.clone(),
                display_name: self.my_name.clone(),
                role: ParticipantRole::Owner,
                permission: SharePermission::ReadWrite,
                is_current_user: false,
            }],
        };
        shares.insert(share_id, share.clone());
        debug!("Created share {} for history {}", share.url, history_id);
        Ok(self.localize(&share))
    }

    async fn share_for_history(&self, history_id: RecordId) -> Result<Option<CloudShare>> {
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(CloudError::Unavailable("share fetch failed".into()));
        }
        let shares = self.backend.shares.read().unwrap_or_else(|e| e.into_inner());
        Ok(shares
            .values()
            .find(|s| s.history_id == history_id && s.has_participant(&self.me))
            .map(|s| self.localize(s)))
    }

    async fn save_share(&self, share: &CloudShare) -> Result<()> {
        let mut shares = self.backend.shares.write().unwrap_or_else(|e| e.into_inner());
        if !shares.contains_key(&share.share_id) {
            return Err(CloudError::NoSuchShare(share.history_id));
        }
        // The backend keeps participants neutral; sides localize on fetch
        let mut neutral = share.clone();
        for p in &mut neutral.participants {
            p.is_current_user = false;
        }
        shares.insert(neutral.share_id, neutral);
        Ok(())
    }

    async fn lookup_participants(&self, lookups: &[LookupInfo]) -> Result<Vec<LookupOutcome>> {
        let failing = self
            .failing_lookups
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let outcomes = lookups
            .iter()
            .map(|lookup| {
                if failing.iter().any(|f| f.matches(lookup)) {
                    return LookupOutcome::Failed {
                        lookup: lookup.clone(),
                        reason: "lookup failed".into(),
                    };
                }
                match self.backend.display_name_of(lookup) {
                    Some(display_name) => LookupOutcome::Found(Participant {
                        lookup: lookup.normalized(),
                        display_name,
                        role: ParticipantRole::Member,
                        permission: SharePermission::ReadWrite,
                        is_current_user: lookup.matches(&self.me),
                    }),
                    None => LookupOutcome::Failed {
                        lookup: lookup.clone(),
                        reason: "no account for this address".into(),
                    },
                }
            })
            .collect();
        Ok(outcomes)
    }

    async fn share_metadata(&self, url: &ShareUrl) -> Result<ShareMetadata> {
        if self.fail_metadata.load(Ordering::SeqCst) {
            return Err(CloudError::MetadataFetch(
                url.to_string(),
                "metadata fetch failed".into(),
            ));
        }
        let shares = self.backend.shares.read().unwrap_or_else(|e| e.into_inner());
        let share = shares
            .values()
            .find(|s| &s.url == url)
            .ok_or_else(|| CloudError::MetadataFetch(url.to_string(), "unknown share".into()))?;
        let owner = share
            .owner()
            .ok_or_else(|| CloudError::MetadataFetch(url.to_string(), "share has no owner".into()))?;
        Ok(ShareMetadata {
            owner_display_name: owner.display_name.clone(),
            owner_lookup: Some(owner.lookup.clone()),
        })
    }

    async fn purge_share_zone(&self, history_id: RecordId) -> Result<()> {
        let mut shares = self.backend.shares.write().unwrap_or_else(|e| e.into_inner());
        let before = shares.len();
        shares.retain(|_, s| s.history_id != history_id);
        if shares.len() < before {
            debug!("Purged share zone for history {}", history_id);
        }
        Ok(())
    }
}
