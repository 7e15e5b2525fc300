//! Ownership classification and participant lookup hashing.

use std::sync::Arc;

use history_core::{LookupInfo, RecordId};
use thiserror::Error;

use crate::cloud::{CloudError, CloudShare, CloudSharing};

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Could not resolve the share for history {0}: {1}")]
    ShareLookup(RecordId, #[source] CloudError),
}

pub type Result<T> = std::result::Result<T, IdentityError>;

/// Whether a history is ours, and through which share if any.
#[derive(Debug, Clone)]
pub struct Ownership {
    pub owned: bool,
    pub share: Option<CloudShare>,
}

/// Classifies histories as ours or someone else's.
///
/// A history with no share is ours: it lives in this account's private
/// zone. A shared history is ours only when the current user owns the
/// share. A failed lookup is an error, never a guess; misclassifying a
/// foreign history as ours would feed it into the duplicate merge.
#[derive(Clone)]
pub struct OwnershipResolver {
    cloud: Arc<dyn CloudSharing>,
}

impl OwnershipResolver {
    pub fn new(cloud: Arc<dyn CloudSharing>) -> Self {
        Self { cloud }
    }

    pub async fn classify(&self, history_id: RecordId) -> Result<Ownership> {
        match self.cloud.share_for_history(history_id).await {
            Ok(None) => Ok(Ownership {
                owned: true,
                share: None,
            }),
            Ok(Some(share)) => Ok(Ownership {
                owned: share.is_owned_by_current_user(),
                share: Some(share),
            }),
            Err(e) => Err(IdentityError::ShareLookup(history_id, e)),
        }
    }

    pub async fn is_owner(&self, history_id: RecordId) -> Result<bool> {
        Ok(self.classify(history_id).await?.owned)
    }
}

const FNV_OFFSET: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

/// Content address for a participant within one share: FNV-1a over the
/// share salt and the canonical lookup address. Stable across devices
/// that know the same salt, meaningless outside the share.
pub fn lookup_hash(salt: &str, lookup: &LookupInfo) -> String {
    let canonical = canonical_lookup(lookup);
    let mut hash = FNV_OFFSET;
    for byte in salt.bytes().chain(canonical.bytes()) {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{:016x}", hash)
}

fn canonical_lookup(lookup: &LookupInfo) -> String {
    match lookup.normalized() {
        LookupInfo::Email(address) => format!("email:{}", address),
        LookupInfo::Phone(number) => format!("phone:{}", number),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::InMemoryCloud;

    fn email(addr: &str) -> LookupInfo {
        LookupInfo::Email(addr.into())
    }

    // ========== OwnershipResolver ==========

    #[tokio::test]
    async fn test_private_history_is_owned() {
        let cloud = Arc::new(InMemoryCloud::new(email("me@example.com"), "Me"));
        let resolver = OwnershipResolver::new(cloud);

        let ownership = resolver.classify(RecordId::generate()).await.unwrap();
        assert!(ownership.owned);
        assert!(ownership.share.is_none());
    }

    #[tokio::test]
    async fn test_shared_history_owned_by_share_owner() {
        let cloud = Arc::new(InMemoryCloud::new(email("me@example.com"), "Me"));
        let history = RecordId::generate();
        cloud.create_share(history).await.unwrap();

        let resolver = OwnershipResolver::new(cloud);
        let ownership = resolver.classify(history).await.unwrap();
        assert!(ownership.owned);
        assert!(ownership.share.is_some());
    }

    #[tokio::test]
    async fn test_foreign_share_is_not_owned() {
        let backend = crate::cloud::CloudBackend::new();
        let alice = InMemoryCloud::with_backend(Arc::clone(&backend), email("alice@example.com"), "Alice");
        let bob = Arc::new(InMemoryCloud::with_backend(
            backend,
            email("bob@example.com"),
            "Bob",
        ));

        let history = RecordId::generate();
        let share = alice.create_share(history).await.unwrap();
        bob.accept_invite(&share.url).unwrap();

        let resolver = OwnershipResolver::new(bob);
        let ownership = resolver.classify(history).await.unwrap();
        assert!(!ownership.owned);
        assert!(ownership.share.is_some());
    }

    #[tokio::test]
    async fn test_lookup_failure_is_an_error() {
        let cloud = Arc::new(InMemoryCloud::new(email("me@example.com"), "Me"));
        cloud.fail_share_fetch(true);

        let resolver = OwnershipResolver::new(cloud);
        let err = resolver.classify(RecordId::generate()).await.unwrap_err();
        assert!(matches!(err, IdentityError::ShareLookup(_, _)));
    }

    // ========== lookup_hash ==========

    #[test]
    fn test_hash_ignores_address_formatting() {
        let a = lookup_hash("salt", &email("  Alice@Example.COM "));
        let b = lookup_hash("salt", &email("alice@example.com"));
        assert_eq!(a, b);

        let p1 = lookup_hash("salt", &LookupInfo::Phone("+1 (555) 010-2000".into()));
        let p2 = lookup_hash("salt", &LookupInfo::Phone("15550102000".into()));
        assert_eq!(p1, p2);
    }

    #[test]
    fn test_hash_depends_on_salt() {
        let lookup = email("alice@example.com");
        assert_ne!(lookup_hash("a", &lookup), lookup_hash("b", &lookup));
    }

    #[test]
    fn test_hash_separates_email_from_phone() {
        let as_email = lookup_hash("salt", &email("5550102000"));
        let as_phone = lookup_hash("salt", &LookupInfo::Phone("5550102000".into()));
        assert_ne!(as_email, as_phone);
    }

    #[test]
    fn test_hash_is_sixteen_hex_chars() {
        let hash = lookup_hash("salt", &email("alice@example.com"));
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
