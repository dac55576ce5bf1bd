//! Small in-process cache of recently validated signed-token principals,
//! keyed by a hash of the token, TTL <= 30s per the concurrency model.
//! Invalidated by simply expiring; explicit revocation is checked against
//! the Session Store on every lookup regardless of cache hit (see
//! `TokenValidator::validate_signed`), so a cache hit never outlives a
//! revocation by more than the store round trip already being made.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};

use super::Principal;

#[derive(Clone)]
pub struct PrincipalCache {
    entries: std::sync::Arc<DashMap<String, (Principal, Instant)>>,
    ttl: Duration,
}

impl PrincipalCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: std::sync::Arc::new(DashMap::new()),
            ttl,
        }
    }

    pub fn get(&self, token: &str) -> Option<Principal> {
        let key = Self::key_for(token);
        let entry = self.entries.get(&key)?;
        if entry.1.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(&key);
            return None;
        }
        Some(entry.0.clone())
    }

    pub fn put(&self, token: &str, principal: Principal) {
        let key = Self::key_for(token);
        self.entries.insert(key, (principal, Instant::now()));
    }

    fn key_for(token: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(token.as_bytes());
        format!("{:x}", hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn principal() -> Principal {
        Principal {
            user_id: "user-1".to_string(),
            session_id: "sess-1".to_string(),
            roles: vec![],
            permissions: vec![],
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            bound_ip: None,
        }
    }

    #[test]
    fn caches_and_returns_principal() {
        let cache = PrincipalCache::new(Duration::from_secs(30));
        cache.put("token-a", principal());
        assert!(cache.get("token-a").is_some());
        assert!(cache.get("token-b").is_none());
    }

    #[test]
    fn entries_expire_after_ttl() {
        let cache = PrincipalCache::new(Duration::from_millis(10));
        cache.put("token-a", principal());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("token-a").is_none());
    }
}
