//! Share-back flow between the owner of a shared history and its invitees.
//!
//! An invitee answers an invitation by writing a `Reciprocate` marker into
//! the owner's history. The marker is addressed by a salted hash of the
//! invitee's own lookup, so other participants learn nothing about who
//! reciprocated with whom. Accepting carries the invitee's own share URL
//! in the marker; declining writes the marker with no URL. Replication
//! brings the marker back to the owner, who consumes the URL exactly once
//! as a deep link into the platform's share-acceptance UI.

use std::sync::Arc;

use history_core::{HistoryStore, Reciprocate, RecordId, SavePolicy};
use thiserror::Error;
use tracing::{debug, info};

use crate::cloud::{CloudError, CloudShare, CloudSharing, ShareUrl};
use crate::identity::lookup_hash;
use crate::share::{ShareError, ShareManager};

#[derive(Debug, Error)]
pub enum ReciprocationError {
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] history_core::StoreError),
    #[error(transparent)]
    Share(#[from] ShareError),
    #[error("History {0} has no share to reciprocate against")]
    NotShared(RecordId),
    #[error("We are not a participant of the share for history {0}")]
    NoSelfParticipant(RecordId),
    #[error("Could not resolve the owner of history {0}")]
    OwnerUnresolved(RecordId),
}

pub type Result<T> = std::result::Result<T, ReciprocationError>;

#[derive(Clone)]
pub struct ReciprocationService {
    store: Arc<HistoryStore>,
    cloud: Arc<dyn CloudSharing>,
    shares: ShareManager,
}

impl ReciprocationService {
    pub fn new(store: Arc<HistoryStore>, cloud: Arc<dyn CloudSharing>, shares: ShareManager) -> Self {
        Self {
            store,
            cloud,
            shares,
        }
    }

    /// Share our own history back with whoever shared `remote_history`
    /// with us, and leave a marker carrying our share URL for them.
    ///
    /// Nothing is written until our own share exists and the remote owner
    /// is on it, so a failed acceptance leaves no half-announced state.
    pub async fn accept(
        &self,
        remote_history: RecordId,
        own_history: RecordId,
    ) -> Result<CloudShare> {
        let (remote_share, my_hash) = self.remote_share_and_hash(remote_history).await?;
        let owner = remote_share
            .owner()
            .ok_or(ReciprocationError::OwnerUnresolved(remote_history))?
            .clone();

        let (mut own_share, _) = self.shares.prepare_own_share(own_history).await?;
        if !own_share.has_participant(&owner.lookup) {
            let outcome = self
                .shares
                .share_with(own_history, &[owner.lookup.clone()])
                .await?;
            if !outcome.share.has_participant(&owner.lookup) {
                return Err(ReciprocationError::OwnerUnresolved(remote_history));
            }
            own_share = outcome.share;
        }

        self.write_marker(remote_history, my_hash, Some(own_share.url.to_string()))?;
        info!(
            "Reciprocated history {} back to {}",
            remote_history, owner.display_name
        );
        Ok(own_share)
    }

    /// Record that we are not sharing back: the marker exists but carries
    /// no URL. The owner's side reads this as an explicit answer rather
    /// than one still pending.
    pub async fn decline(&self, remote_history: RecordId) -> Result<()> {
        let (_, my_hash) = self.remote_share_and_hash(remote_history).await?;
        self.write_marker(remote_history, my_hash, None)?;
        info!("Declined reciprocation for history {}", remote_history);
        Ok(())
    }

    /// Whether the person behind `remote_share` sees our sessions.
    ///
    /// Checked in order: our own share already lists them (the settled
    /// state once they joined), then our marker in their history (the
    /// answer we gave), then nothing. `None` means not answered yet.
    pub async fn derive_is_reciprocating(
        &self,
        remote_share: &CloudShare,
        own_history: Option<RecordId>,
    ) -> Result<Option<bool>> {
        let Some(owner) = remote_share.owner() else {
            return Ok(None);
        };

        if let Some(own_history) = own_history {
            if let Some(own_share) = self.cloud.share_for_history(own_history).await? {
                if own_share.has_participant(&owner.lookup) {
                    return Ok(Some(true));
                }
            }
        }

        let Some(me) = remote_share.current_user() else {
            return Ok(None);
        };
        let my_hash = lookup_hash(&remote_share.salt, &me.lookup);
        let answer = self
            .store
            .reciprocates_of(remote_share.history_id)
            .into_iter()
            .find(|m| m.lookup_hash == my_hash)
            .map(|m| m.url.is_some());
        Ok(answer)
    }

    /// Consume reciprocation URLs that invitees left in our own history.
    /// Each URL is returned exactly once: the marker survives with its
    /// URL cleared, so the answer stays recorded but the deep link never
    /// fires twice.
    pub fn take_incoming_links(&self, own_history: RecordId) -> Result<Vec<ShareUrl>> {
        let mut links = Vec::new();
        let mut txn = self.store.begin();
        for mut marker in self.store.reciprocates_of(own_history) {
            if let Some(url) = marker.url.take() {
                txn.upsert_reciprocate(marker);
                links.push(ShareUrl::new(url));
            }
        }
        if !links.is_empty() {
            txn.commit(SavePolicy::LocalWins)?;
            info!(
                "Received {} reciprocation links for history {}",
                links.len(),
                own_history
            );
        }
        Ok(links)
    }

    async fn remote_share_and_hash(
        &self,
        remote_history: RecordId,
    ) -> Result<(CloudShare, String)> {
        let share = self
            .cloud
            .share_for_history(remote_history)
            .await?
            .ok_or(ReciprocationError::NotShared(remote_history))?;
        let me = share
            .current_user()
            .ok_or(ReciprocationError::NoSelfParticipant(remote_history))?;
        let hash = lookup_hash(&share.salt, &me.lookup);
        Ok((share, hash))
    }

    fn write_marker(
        &self,
        history_id: RecordId,
        lookup_hash: String,
        url: Option<String>,
    ) -> Result<()> {
        let mut txn = self.store.begin();
        let marker = match self
            .store
            .reciprocates_of(history_id)
            .into_iter()
            .find(|m| m.lookup_hash == lookup_hash)
        {
            Some(mut existing) => {
                debug!("Updating reciprocation marker {} in {}", existing.id, history_id);
                existing.url = url;
                existing
            }
            None => Reciprocate::new(history_id, lookup_hash, url),
        };
        txn.upsert_reciprocate(marker);
        txn.commit(SavePolicy::LocalWins)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudBackend, InMemoryCloud};
    use history_core::{History, Lane, LookupInfo};

    fn email(addr: &str) -> LookupInfo {
        LookupInfo::Email(addr.into())
    }

    struct Side {
        store: Arc<HistoryStore>,
        cloud: Arc<InMemoryCloud>,
        service: ReciprocationService,
    }

    impl Side {
        fn new(backend: Arc<CloudBackend>, address: &str, name: &str) -> Self {
            let store = Arc::new(HistoryStore::new());
            let cloud = Arc::new(InMemoryCloud::with_backend(backend, email(address), name));
            let shares = ShareManager::new(
                Arc::clone(&store),
                Arc::clone(&cloud) as Arc<dyn CloudSharing>,
            );
            let service = ReciprocationService::new(
                Arc::clone(&store),
                Arc::clone(&cloud) as Arc<dyn CloudSharing>,
                shares,
            );
            Self {
                store,
                cloud,
                service,
            }
        }

        fn seed_own_history(&self) -> RecordId {
            let mut txn = self.store.begin();
            let history = txn.create_history("");
            txn.commit(SavePolicy::LocalWins).unwrap();
            history.id
        }

        /// Replicate someone else's history record into this store.
        fn ingest_history(&self, history: &History) {
            let mut replica = history.clone();
            replica.lane = Lane::Shared;
            let mut txn = self.store.begin();
            txn.upsert_history(replica);
            txn.commit(SavePolicy::LocalWins).unwrap();
        }
    }

    /// Alice shares a history, Bob joins it. Returns both sides and the
    /// id of Alice's shared history.
    async fn invited_pair() -> (Side, Side, RecordId) {
        let backend = CloudBackend::new();
        let alice = Side::new(Arc::clone(&backend), "alice@example.com", "Alice");
        let bob = Side::new(backend, "bob@example.com", "Bob");

        let mut txn = alice.store.begin();
        let history = txn.create_history("Alice");
        txn.commit(SavePolicy::LocalWins).unwrap();

        let share = alice.cloud.create_share(history.id).await.unwrap();
        bob.cloud.accept_invite(&share.url).unwrap();
        bob.ingest_history(&alice.store.history(history.id).unwrap());
        (alice, bob, history.id)
    }

    #[tokio::test]
    async fn test_decline_writes_marker_without_url() {
        let (_, bob, remote) = invited_pair().await;

        bob.service.decline(remote).await.unwrap();

        let markers = bob.store.reciprocates_of(remote);
        assert_eq!(markers.len(), 1);
        assert!(markers[0].url.is_none());

        let share = bob.cloud.share_for_history(remote).await.unwrap().unwrap();
        assert_eq!(
            markers[0].lookup_hash,
            lookup_hash(&share.salt, &email("bob@example.com"))
        );
    }

    #[tokio::test]
    async fn test_accept_announces_own_share() {
        let (_, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();

        let own_share = bob.service.accept(remote, own).await.unwrap();

        assert!(own_share.has_participant(&email("alice@example.com")));
        let markers = bob.store.reciprocates_of(remote);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].url.as_deref(), Some(own_share.url.as_str()));
    }

    #[tokio::test]
    async fn test_accept_after_decline_reuses_marker() {
        let (_, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();

        bob.service.decline(remote).await.unwrap();
        let first = bob.store.reciprocates_of(remote);
        bob.service.accept(remote, own).await.unwrap();
        let second = bob.store.reciprocates_of(remote);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert!(second[0].url.is_some());
    }

    #[tokio::test]
    async fn test_accept_aborts_cleanly_when_own_share_fails() {
        let (_, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();
        bob.cloud.fail_share_creation(true);

        let err = bob.service.accept(remote, own).await.unwrap_err();
        assert!(matches!(err, ReciprocationError::Share(_)));
        assert!(bob.store.reciprocates_of(remote).is_empty());
    }

    #[tokio::test]
    async fn test_accept_requires_remote_share() {
        let (_, bob, _) = invited_pair().await;
        let own = bob.seed_own_history();

        let err = bob
            .service
            .accept(RecordId::generate(), own)
            .await
            .unwrap_err();
        assert!(matches!(err, ReciprocationError::NotShared(_)));
    }

    #[tokio::test]
    async fn test_derive_from_marker() {
        let (_, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();
        let remote_share = bob.cloud.share_for_history(remote).await.unwrap().unwrap();

        // No answer yet
        let state = bob
            .service
            .derive_is_reciprocating(&remote_share, Some(own))
            .await
            .unwrap();
        assert_eq!(state, None);

        bob.service.decline(remote).await.unwrap();
        let state = bob
            .service
            .derive_is_reciprocating(&remote_share, Some(own))
            .await
            .unwrap();
        assert_eq!(state, Some(false));
    }

    #[tokio::test]
    async fn test_derive_prefers_settled_share_over_marker() {
        let (alice, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();

        let own_share = bob.service.accept(remote, own).await.unwrap();
        // Alice consumed the link and joined Bob's share; the marker URL
        // was cleared on her side and replicates back cleared
        alice.cloud.accept_invite(&own_share.url).unwrap();
        let mut marker = bob.store.reciprocates_of(remote).remove(0);
        marker.url = None;
        let mut txn = bob.store.begin();
        txn.upsert_reciprocate(marker);
        txn.commit(SavePolicy::LocalWins).unwrap();

        let remote_share = bob.cloud.share_for_history(remote).await.unwrap().unwrap();
        let state = bob
            .service
            .derive_is_reciprocating(&remote_share, Some(own))
            .await
            .unwrap();
        assert_eq!(state, Some(true));
    }

    #[tokio::test]
    async fn test_take_incoming_links_consumes_once() {
        let (alice, bob, remote) = invited_pair().await;
        let own = bob.seed_own_history();
        bob.service.accept(remote, own).await.unwrap();

        // The marker replicates into Alice's store
        let marker = bob.store.reciprocates_of(remote).remove(0);
        let mut txn = alice.store.begin();
        txn.upsert_reciprocate(marker);
        txn.commit(SavePolicy::LocalWins).unwrap();

        let links = alice.service.take_incoming_links(remote).unwrap();
        assert_eq!(links.len(), 1);
        assert!(links[0].as_str().starts_with("memory://shares/"));

        // Consumed: the answer survives, the link does not fire again
        assert!(alice.service.take_incoming_links(remote).unwrap().is_empty());
        let markers = alice.store.reciprocates_of(remote);
        assert_eq!(markers.len(), 1);
        assert!(markers[0].url.is_none());
    }
}
