//! Token validation: extraction, opaque (Session Store) and signed
//! (HMAC-SHA256) verification, and the resulting [`Principal`].

pub mod cache;
pub mod session_store;
pub mod signed;

use std::time::Duration;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use rand::RngCore;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::router::CompiledRoute;

pub use cache::PrincipalCache;
pub use session_store::{InMemorySessionStore, SessionRecord, SessionStore};
pub use signed::{SignedClaims, SignedTokenCodec};

/// The validated caller identity attached to a request after authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct Principal {
    pub user_id: String,
    pub session_id: String,
    pub roles: Vec<String>,
    pub permissions: Vec<String>,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub bound_ip: Option<String>,
}

impl Principal {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

/// Where the token was found, needed so the proxy stage knows whether to
/// strip the session cookie before forwarding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSource {
    Cookie,
    BearerHeader,
}

/// Extract the raw token per the fixed precedence: cookie named per config,
/// else `Authorization: Bearer <token>`.
pub fn extract_token(headers: &HeaderMap, cookie_name: &str) -> Option<(String, TokenSource)> {
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            if let Some(value) = parse_cookie(cookie_str, cookie_name) {
                return Some((value, TokenSource::Cookie));
            }
        }
    }

    if let Some(auth_header) = headers.get(axum::http::header::AUTHORIZATION) {
        if let Ok(value) = auth_header.to_str() {
            if let Some(token) = value.strip_prefix("Bearer ") {
                return Some((token.to_string(), TokenSource::BearerHeader));
            }
        }
    }

    None
}

fn parse_cookie(cookie_header: &str, name: &str) -> Option<String> {
    cookie_header.split(';').find_map(|pair| {
        let pair = pair.trim();
        let (key, value) = pair.split_once('=')?;
        if key.trim() == name {
            Some(value.trim().to_string())
        } else {
            None
        }
    })
}

/// Orchestrates the full validation-check ordering from the token
/// validator's contract: parse, signature (signed only), nbf, exp, store
/// lookup + revocation (opaque only), IP binding, idle timeout.
pub struct TokenValidator {
    config: SessionConfig,
    codec: SignedTokenCodec,
    cache: PrincipalCache,
}

impl TokenValidator {
    pub fn new(config: SessionConfig) -> Self {
        let codec = SignedTokenCodec::new(config.signing_secret.as_deref().unwrap_or(""));
        Self {
            config,
            codec,
            cache: PrincipalCache::new(std::time::Duration::from_secs(30)),
        }
    }

    /// Validate a raw token string against the configured token kind,
    /// returning the resulting Principal plus a refreshed raw token when the
    /// session was near-expiry and rotated. `store` is consulted for opaque
    /// tokens; signed tokens never touch the store for the signature check
    /// itself but may still be looked up for revocation if the session id
    /// they carry has been explicitly revoked.
    pub async fn validate(
        &self,
        token: &str,
        source: TokenSource,
        client_ip: &str,
        route: &CompiledRoute,
        store: &dyn SessionStore,
    ) -> Result<(Principal, Option<String>)> {
        if self.config.token_kind == "signed" {
            self.validate_signed(token, source, client_ip, route, store).await
        } else {
            self.validate_opaque(token, source, client_ip, route, store).await
        }
    }

    async fn validate_opaque(
        &self,
        token: &str,
        source: TokenSource,
        client_ip: &str,
        route: &CompiledRoute,
        store: &dyn SessionStore,
    ) -> Result<(Principal, Option<String>)> {
        let record = store
            .get(token)
            .await?
            .ok_or_else(|| Error::InvalidToken("no such session".into()))?;

        let now = Utc::now();
        if now >= record.expires_at {
            return Err(Error::TokenExpired);
        }
        if record.revoked || record.created_at < record.rotated_at {
            return Err(Error::TokenRevoked);
        }
        if let Some(bound_ip) = &record.bound_ip {
            if bound_ip != client_ip {
                return Err(Error::InvalidToken("session bound to a different client".into()));
            }
        }
        if let Some(idle_ttl) = self.config.idle_ttl_secs {
            let idle_for = now.signed_duration_since(record.last_access_at);
            if idle_for.num_seconds() as u64 > idle_ttl {
                return Err(Error::InvalidToken("session idle timeout".into()));
            }
        }

        let _ = store.touch(token, now).await;

        let refreshed = self.maybe_refresh_opaque(&record, source, route, store).await;

        Ok((
            Principal {
                user_id: record.user_id,
                session_id: record.session_id,
                roles: record.roles,
                permissions: record.permissions,
                issued_at: record.created_at,
                expires_at: record.expires_at,
                bound_ip: record.bound_ip,
            },
            refreshed,
        ))
    }

    async fn validate_signed(
        &self,
        token: &str,
        source: TokenSource,
        client_ip: &str,
        route: &CompiledRoute,
        store: &dyn SessionStore,
    ) -> Result<(Principal, Option<String>)> {
        if let Some(cached) = self.cache.get(token) {
            // Explicit revocation and fixation rotation are checked against
            // the Session Store on every lookup regardless of cache hit, so
            // a cache hit never outlives either by more than this RTT.
            self.check_store_revocation(&cached.session_id, store).await?;
            let refreshed = self.maybe_refresh_signed(&claims_from_principal(&cached), source, route);
            return Ok((cached, refreshed));
        }

        let claims = self.codec.verify(token)?;

        let now = Utc::now().timestamp();
        if let Some(nbf) = claims.nbf {
            if nbf > now {
                return Err(Error::InvalidToken("token not yet valid".into()));
            }
        }
        if claims.exp <= now {
            return Err(Error::TokenExpired);
        }

        // A signed token still references a session id; if that session has
        // been explicitly revoked (privilege change, logout-everywhere) the
        // signature alone is not sufficient.
        self.check_store_revocation(&claims.sid, store).await?;

        if let Some(bound_ip) = &claims.bound_ip {
            if bound_ip != client_ip {
                return Err(Error::InvalidToken("session bound to a different client".into()));
            }
        }

        let refreshed = self.maybe_refresh_signed(&claims, source, route);

        let principal = Principal {
            user_id: claims.sub,
            session_id: claims.sid,
            roles: claims.roles,
            permissions: claims.permissions,
            issued_at: DateTime::from_timestamp(claims.iat, 0).unwrap_or_else(Utc::now),
            expires_at: DateTime::from_timestamp(claims.exp, 0).unwrap_or_else(Utc::now),
            bound_ip: claims.bound_ip,
        };

        self.cache.put(token, principal.clone());
        Ok((principal, refreshed))
    }

    async fn check_store_revocation(&self, session_id: &str, store: &dyn SessionStore) -> Result<()> {
        if let Some(record) = store.get(session_id).await? {
            if record.revoked || record.created_at < record.rotated_at {
                return Err(Error::TokenRevoked);
            }
        }
        Ok(())
    }

    /// Rotate a near-expiry opaque session: mint a new session id with the
    /// same lifetime, persist it, revoke the old id, and return the new raw
    /// token so the caller can emit `Set-Cookie`. Only runs for cookie-borne
    /// tokens on routes that permit it, and only once remaining TTL drops
    /// below the configured threshold.
    async fn maybe_refresh_opaque(
        &self,
        record: &SessionRecord,
        source: TokenSource,
        route: &CompiledRoute,
        store: &dyn SessionStore,
    ) -> Option<String> {
        if source != TokenSource::Cookie || !route.allow_refresh {
            return None;
        }
        let threshold = self.config.refresh_threshold_secs?;
        let now = Utc::now();
        let remaining = record.expires_at.signed_duration_since(now).num_seconds();
        if remaining < 0 || remaining as u64 >= threshold {
            return None;
        }

        let new_id = generate_session_id();
        let lifetime = record.expires_at.signed_duration_since(record.created_at);
        let new_record = SessionRecord {
            session_id: new_id.clone(),
            user_id: record.user_id.clone(),
            created_at: now,
            last_access_at: now,
            expires_at: now + lifetime,
            revoked: false,
            roles: record.roles.clone(),
            permissions: record.permissions.clone(),
            bound_ip: record.bound_ip.clone(),
            rotated_at: record.rotated_at,
        };
        let ttl = lifetime.to_std().unwrap_or(Duration::from_secs(1));
        if store.put(new_record, ttl).await.is_err() {
            return None;
        }
        // The old id is revoked only after the new one is durably stored, so
        // a crash between the two never leaves the caller without a session.
        let _ = store.revoke(&record.session_id).await;
        Some(new_id)
    }

    /// Rotate a near-expiry signed token by re-signing its claims with an
    /// extended `exp`; mirrors [`Self::maybe_refresh_opaque`]'s gating.
    fn maybe_refresh_signed(
        &self,
        claims: &SignedClaims,
        source: TokenSource,
        route: &CompiledRoute,
    ) -> Option<String> {
        if source != TokenSource::Cookie || !route.allow_refresh {
            return None;
        }
        let threshold = self.config.refresh_threshold_secs? as i64;
        let now = Utc::now().timestamp();
        let remaining = claims.exp - now;
        if remaining < 0 || remaining >= threshold {
            return None;
        }

        let lifetime = claims.exp - claims.iat;
        let mut renewed = claims.clone();
        renewed.iat = now;
        renewed.exp = now + lifetime;
        self.codec.sign(&renewed).ok()
    }
}

fn claims_from_principal(principal: &Principal) -> SignedClaims {
    SignedClaims {
        sub: principal.user_id.clone(),
        sid: principal.session_id.clone(),
        iat: principal.issued_at.timestamp(),
        nbf: None,
        exp: principal.expires_at.timestamp(),
        roles: principal.roles.clone(),
        permissions: principal.permissions.clone(),
        bound_ip: principal.bound_ip.clone(),
    }
}

fn generate_session_id() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
    let mut bytes = [0u8; 24];
    rand::rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue};

    #[test]
    fn extracts_token_from_cookie_before_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::COOKIE,
            HeaderValue::from_static("session_token=abc; other=1"),
        );
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer xyz"),
        );
        let (token, source) = extract_token(&headers, "session_token").unwrap();
        assert_eq!(token, "abc");
        assert_eq!(source, TokenSource::Cookie);
    }

    #[test]
    fn falls_back_to_bearer_header() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer xyz"),
        );
        let (token, source) = extract_token(&headers, "session_token").unwrap();
        assert_eq!(token, "xyz");
        assert_eq!(source, TokenSource::BearerHeader);
    }

    #[test]
    fn no_token_returns_none() {
        let headers = HeaderMap::new();
        assert!(extract_token(&headers, "session_token").is_none());
    }

    fn route(allow_refresh: bool) -> CompiledRoute {
        use std::collections::HashSet;
        crate::router::Router::new(vec![crate::router::Route {
            id: "r1".to_string(),
            pattern: "/v1/thing".to_string(),
            methods: HashSet::from([axum::http::Method::GET]),
            upstream_base: "http://upstream".to_string(),
            auth_required: true,
            permission_sets: vec![],
            rate_limit_rule: None,
            priority: 0,
            pass_session: false,
            allow_refresh,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            overall_timeout_ms: None,
        }])
        .unwrap()
        .resolve(&axum::http::Method::GET, "/v1/thing")
        .unwrap()
        .0
    }

    fn session_config(token_kind: &str) -> SessionConfig {
        SessionConfig {
            cookie_name: "session_token".to_string(),
            token_kind: token_kind.to_string(),
            idle_ttl_secs: None,
            bind_ip: false,
            signing_secret: Some("a-very-secret-signing-key-32bytes!!".to_string()),
            refresh_threshold_secs: None,
        }
    }

    fn session_record(id: &str, expires_in: chrono::Duration) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            session_id: id.to_string(),
            user_id: "user-1".to_string(),
            created_at: now,
            last_access_at: now,
            expires_at: now + expires_in,
            revoked: false,
            roles: vec!["user".to_string()],
            permissions: vec!["read".to_string()],
            bound_ip: None,
            rotated_at: now,
        }
    }

    #[tokio::test]
    async fn expired_and_revoked_session_reports_expired_first() {
        let store = InMemorySessionStore::new();
        let mut record = session_record("sess-1", chrono::Duration::seconds(-10));
        record.revoked = true;
        store.put(record, Duration::from_secs(60)).await.unwrap();

        let validator = TokenValidator::new(session_config("opaque"));
        let route = route(true);
        let err = validator
            .validate("sess-1", TokenSource::BearerHeader, "10.0.0.1", &route, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenExpired));
    }

    #[tokio::test]
    async fn revoked_but_unexpired_session_reports_revoked() {
        let store = InMemorySessionStore::new();
        let mut record = session_record("sess-1", chrono::Duration::hours(1));
        record.revoked = true;
        store.put(record, Duration::from_secs(60)).await.unwrap();

        let validator = TokenValidator::new(session_config("opaque"));
        let route = route(true);
        let err = validator
            .validate("sess-1", TokenSource::BearerHeader, "10.0.0.1", &route, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenRevoked));
    }

    #[tokio::test]
    async fn session_created_before_user_rotation_is_refused() {
        let store = InMemorySessionStore::new();
        let record = session_record("sess-1", chrono::Duration::hours(1));
        store.put(record, Duration::from_secs(60)).await.unwrap();
        store
            .mark_user_rotated("user-1", Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();

        let validator = TokenValidator::new(session_config("opaque"));
        let route = route(true);
        let err = validator
            .validate("sess-1", TokenSource::BearerHeader, "10.0.0.1", &route, &store)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TokenRevoked));
    }

    #[tokio::test]
    async fn validator_dispatches_on_configured_token_kind_not_shape() {
        let store = InMemorySessionStore::new();
        let record = session_record("aaa.bbb.ccc", chrono::Duration::hours(1));
        store.put(record, Duration::from_secs(60)).await.unwrap();

        // A dot-shaped token is still validated as opaque because config
        // says so, even though it would look "signed" by shape alone.
        let validator = TokenValidator::new(session_config("opaque"));
        let route = route(true);
        let (principal, _) = validator
            .validate("aaa.bbb.ccc", TokenSource::BearerHeader, "10.0.0.1", &route, &store)
            .await
            .unwrap();
        assert_eq!(principal.user_id, "user-1");
    }

    #[tokio::test]
    async fn near_expiry_opaque_session_is_rotated_and_old_id_revoked() {
        let store = InMemorySessionStore::new();
        let record = session_record("sess-1", chrono::Duration::seconds(5));
        store.put(record, Duration::from_secs(60)).await.unwrap();

        let mut config = session_config("opaque");
        config.refresh_threshold_secs = Some(30);
        let validator = TokenValidator::new(config);
        let route = route(true);
        let (_, refreshed) = validator
            .validate("sess-1", TokenSource::Cookie, "10.0.0.1", &route, &store)
            .await
            .unwrap();

        let new_id = refreshed.expect("near-expiry cookie session should rotate");
        assert_ne!(new_id, "sess-1");
        assert!(store.get("sess-1").await.unwrap().unwrap().revoked);
        assert!(!store.get(&new_id).await.unwrap().unwrap().revoked);
    }

    #[tokio::test]
    async fn bearer_tokens_are_never_refreshed() {
        let store = InMemorySessionStore::new();
        let record = session_record("sess-1", chrono::Duration::seconds(5));
        store.put(record, Duration::from_secs(60)).await.unwrap();

        let mut config = session_config("opaque");
        config.refresh_threshold_secs = Some(30);
        let validator = TokenValidator::new(config);
        let route = route(true);
        let (_, refreshed) = validator
            .validate("sess-1", TokenSource::BearerHeader, "10.0.0.1", &route, &store)
            .await
            .unwrap();
        assert!(refreshed.is_none());
    }

    #[tokio::test]
    async fn route_can_opt_out_of_refresh() {
        let store = InMemorySessionStore::new();
        let record = session_record("sess-1", chrono::Duration::seconds(5));
        store.put(record, Duration::from_secs(60)).await.unwrap();

        let mut config = session_config("opaque");
        config.refresh_threshold_secs = Some(30);
        let validator = TokenValidator::new(config);
        let route = route(false);
        let (_, refreshed) = validator
            .validate("sess-1", TokenSource::Cookie, "10.0.0.1", &route, &store)
            .await
            .unwrap();
        assert!(refreshed.is_none());
    }
}
