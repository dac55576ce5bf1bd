//! Session Store: key→session lookup, revoke, put; TTL-backed.
//!
//! An in-process implementation backs tests and single-node deployments; the
//! Redis implementation is the production-grade external option, mirroring
//! the split the teacher uses for token revocation storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::Result;

/// The server-side authoritative state for an opaque session.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub revoked: bool,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub bound_ip: Option<String>,
    /// Stamped by [`SessionStore::mark_user_rotated`] when a privilege
    /// change invalidates every session created before it, per the fixation
    /// defense: a session whose `created_at` predates its own `rotated_at`
    /// is refused even though it's otherwise unexpired and unrevoked.
    pub rotated_at: DateTime<Utc>,
}

/// Capabilities the core requires of any session-state backend.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>>;

    /// Idempotent: writing the same record twice has the same effect as once.
    async fn put(&self, record: SessionRecord, ttl: Duration) -> Result<()>;

    /// Atomic: a session marked revoked is never observed as valid again.
    async fn revoke(&self, session_id: &str) -> Result<()>;

    /// Best-effort; failures are logged, never surfaced to the caller.
    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()>;

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>>;

    /// Session fixation defense: stamp `rotated_at` on every session
    /// currently recorded for `user_id`. Called by whatever component
    /// performs a privilege change (role/permission update); the validator
    /// then refuses any of those sessions whose `created_at` predates it.
    async fn mark_user_rotated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()>;

    /// Used by the readiness probe: succeeds iff the backend answered.
    async fn ping(&self) -> Result<()>;
}

/// In-process session store backed by a sharded map with lazy TTL eviction.
/// Sufficient for tests and single-node deployments; state is lost on
/// restart.
#[derive(Clone, Default)]
pub struct InMemorySessionStore {
    sessions: Arc<DashMap<String, (SessionRecord, DateTime<Utc>)>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn evict_if_expired(&self, session_id: &str) {
        if let Some(entry) = self.sessions.get(session_id) {
            if Utc::now() >= entry.1 {
                drop(entry);
                self.sessions.remove(session_id);
            }
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        self.evict_if_expired(session_id);
        Ok(self.sessions.get(session_id).map(|e| e.0.clone()))
    }

    async fn put(&self, record: SessionRecord, ttl: Duration) -> Result<()> {
        let expires_at = Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default();
        self.sessions
            .insert(record.session_id.clone(), (record, expires_at));
        Ok(())
    }

    async fn revoke(&self, session_id: &str) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.0.revoked = true;
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(session_id) {
            entry.0.last_access_at = now;
        }
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>> {
        Ok(self
            .sessions
            .iter()
            .filter(|e| e.0.user_id == user_id)
            .map(|e| e.0.session_id.clone())
            .collect())
    }

    async fn mark_user_rotated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        for mut entry in self.sessions.iter_mut() {
            if entry.0.user_id == user_id {
                entry.0.rotated_at = at;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Redis-backed session store. Keys are namespaced `session:{id}` and
/// `session:by_user:{user_id}` (a set of session ids) so bulk revocation
/// doesn't require a scan.
#[cfg(feature = "cache")]
#[derive(Clone)]
pub struct RedisSessionStore {
    pool: deadpool_redis::Pool,
    key_prefix: String,
}

#[cfg(feature = "cache")]
impl RedisSessionStore {
    pub fn new(pool: deadpool_redis::Pool) -> Self {
        Self {
            pool,
            key_prefix: "session:".to_string(),
        }
    }

    fn key(&self, session_id: &str) -> String {
        format!("{}{}", self.key_prefix, session_id)
    }

    fn user_index_key(&self, user_id: &str) -> String {
        format!("{}by_user:{}", self.key_prefix, user_id)
    }
}

#[cfg(feature = "cache")]
#[derive(serde::Serialize, serde::Deserialize)]
struct StoredRecord {
    session_id: String,
    user_id: String,
    created_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    revoked: bool,
    roles: Vec<String>,
    permissions: Vec<String>,
    bound_ip: Option<String>,
    #[serde(default = "Utc::now")]
    rotated_at: DateTime<Utc>,
}

#[cfg(feature = "cache")]
impl From<&SessionRecord> for StoredRecord {
    fn from(r: &SessionRecord) -> Self {
        Self {
            session_id: r.session_id.clone(),
            user_id: r.user_id.clone(),
            created_at: r.created_at,
            last_access_at: r.last_access_at,
            expires_at: r.expires_at,
            revoked: r.revoked,
            roles: r.roles.clone(),
            permissions: r.permissions.clone(),
            bound_ip: r.bound_ip.clone(),
            rotated_at: r.rotated_at,
        }
    }
}

#[cfg(feature = "cache")]
impl From<StoredRecord> for SessionRecord {
    fn from(r: StoredRecord) -> Self {
        Self {
            session_id: r.session_id,
            user_id: r.user_id,
            created_at: r.created_at,
            last_access_at: r.last_access_at,
            expires_at: r.expires_at,
            revoked: r.revoked,
            roles: r.roles,
            permissions: r.permissions,
            bound_ip: r.bound_ip,
            rotated_at: r.rotated_at,
        }
    }
}

#[cfg(feature = "cache")]
#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.pool.get().await.map_err(|e| {
            crate::error::Error::Store(format!("redis pool: {}", e))
        })?;
        let raw: Option<String> = conn.get(self.key(session_id)).await?;
        match raw {
            Some(json) => {
                let stored: StoredRecord = serde_json::from_str(&json)
                    .map_err(|e| crate::error::Error::Store(format!("decode session: {}", e)))?;
                Ok(Some(stored.into()))
            }
            None => Ok(None),
        }
    }

    async fn put(&self, record: SessionRecord, ttl: Duration) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.pool.get().await.map_err(|e| {
            crate::error::Error::Store(format!("redis pool: {}", e))
        })?;
        let stored: StoredRecord = (&record).into();
        let json = serde_json::to_string(&stored)
            .map_err(|e| crate::error::Error::Store(format!("encode session: {}", e)))?;
        conn.set_ex::<_, _, ()>(self.key(&record.session_id), json, ttl.as_secs().max(1))
            .await?;
        conn.sadd::<_, _, ()>(self.user_index_key(&record.user_id), &record.session_id)
            .await?;
        Ok(())
    }

    async fn revoke(&self, session_id: &str) -> Result<()> {
        if let Some(mut record) = self.get(session_id).await? {
            record.revoked = true;
            let remaining = record
                .expires_at
                .signed_duration_since(Utc::now())
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            self.put(record, remaining).await?;
        }
        Ok(())
    }

    async fn touch(&self, session_id: &str, now: DateTime<Utc>) -> Result<()> {
        if let Some(mut record) = self.get(session_id).await? {
            record.last_access_at = now;
            let remaining = record
                .expires_at
                .signed_duration_since(now)
                .to_std()
                .unwrap_or(Duration::from_secs(1));
            self.put(record, remaining).await?;
        }
        Ok(())
    }

    async fn list_user_sessions(&self, user_id: &str) -> Result<Vec<String>> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.pool.get().await.map_err(|e| {
            crate::error::Error::Store(format!("redis pool: {}", e))
        })?;
        let ids: Vec<String> = conn.smembers(self.user_index_key(user_id)).await?;
        Ok(ids)
    }

    async fn mark_user_rotated(&self, user_id: &str, at: DateTime<Utc>) -> Result<()> {
        for session_id in self.list_user_sessions(user_id).await? {
            if let Some(mut record) = self.get(&session_id).await? {
                record.rotated_at = at;
                let remaining = record
                    .expires_at
                    .signed_duration_since(Utc::now())
                    .to_std()
                    .unwrap_or(Duration::from_secs(1));
                self.put(record, remaining).await?;
            }
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        use deadpool_redis::redis::AsyncCommands;

        let mut conn = self.pool.get().await.map_err(|e| {
            crate::error::Error::Store(format!("redis pool: {}", e))
        })?;
        let _: String = conn.get("session:__ping__").await.or_else(|e| {
            if e.kind() == deadpool_redis::redis::ErrorKind::TypeError {
                Ok(String::new())
            } else {
                Err(e)
            }
        })?;
        Ok(())
    }
}
