//! Rate Limiter: key derivation plus algorithm evaluation against a
//! [`RateLimitStore`].

pub mod store;

use chrono::Utc;

use crate::context::RateLimitDecision;
use crate::error::{Error, Result};
pub use store::{InMemoryRateLimitStore, RateLimitStore};

/// How a rule's key is derived and which algorithm governs it.
#[derive(Debug, Clone)]
pub struct RateLimitRule {
    /// Template composed of `{ip}`, `{user}`, `{route}`, and literal text.
    pub key_template: String,
    pub algorithm: RateLimitAlgorithm,
    /// Store-unavailable behavior: allow (true) or deny (false).
    pub fail_open: bool,
}

#[derive(Debug, Clone)]
pub enum RateLimitAlgorithm {
    TokenBucket { capacity: f64, refill_rate: f64 },
    FixedWindow { window_secs: u64, limit: u64 },
    SlidingWindow { window_secs: u64, limit: u64 },
}

impl Default for RateLimitRule {
    fn default() -> Self {
        Self {
            key_template: "{ip}".to_string(),
            algorithm: RateLimitAlgorithm::TokenBucket {
                capacity: 60.0,
                refill_rate: 1.0,
            },
            fail_open: true,
        }
    }
}

/// Evaluates a [`RateLimitRule`] against a [`RateLimitStore`].
pub struct RateLimiter<S: RateLimitStore + ?Sized> {
    store: std::sync::Arc<S>,
}

impl<S: RateLimitStore + ?Sized> RateLimiter<S> {
    pub fn new(store: std::sync::Arc<S>) -> Self {
        Self { store }
    }

    /// Used by the readiness probe to check the backing store directly.
    pub async fn store_ping(&self) -> Result<()> {
        self.store.ping().await
    }

    /// Evaluate `rule` for this request, returning the decision. On
    /// `allowed = false` the caller should reject with `RateLimitExceeded`;
    /// this function itself never returns an `Err` for a plain denial, only
    /// for a store failure under `fail_open = false`.
    pub async fn check(
        &self,
        rule: &RateLimitRule,
        client_ip: &str,
        user_id: Option<&str>,
        route_id: &str,
    ) -> Result<RateLimitDecision> {
        let key = derive_key(&rule.key_template, client_ip, user_id, route_id);
        let now = Utc::now();

        let outcome = match &rule.algorithm {
            RateLimitAlgorithm::TokenBucket {
                capacity,
                refill_rate,
            } => {
                self.store
                    .token_bucket_consume(&key, *capacity, *refill_rate, now)
                    .await
            }
            RateLimitAlgorithm::FixedWindow { window_secs, limit } => self
                .store
                .window_increment(&key, *window_secs, now)
                .await
                .map(|(count, reset)| (count <= *limit, limit.saturating_sub(count), reset)),
            RateLimitAlgorithm::SlidingWindow { window_secs, limit } => {
                self.sliding_window(&key, *window_secs, *limit, now).await
            }
        };

        match outcome {
            Ok((allowed, remaining, reset_seconds)) => Ok(RateLimitDecision {
                key,
                allowed,
                limit: rule_limit(&rule.algorithm),
                remaining,
                reset_seconds,
            }),
            Err(e) => {
                tracing::error!(error = %e, key, "rate limit store failure");
                if rule.fail_open {
                    Ok(RateLimitDecision {
                        key,
                        allowed: true,
                        limit: rule_limit(&rule.algorithm),
                        remaining: 0,
                        reset_seconds: 0,
                    })
                } else {
                    Err(Error::ServiceUnavailable("rate limit store unavailable".into()))
                }
            }
        }
    }

    /// `check`'s outcome tuple is `(allowed, remaining, reset_seconds)`;
    /// reused here even though the weighted count, not a raw counter value,
    /// decides `allowed`.
    async fn sliding_window(
        &self,
        key: &str,
        window_secs: u64,
        limit: u64,
        now: chrono::DateTime<Utc>,
    ) -> Result<store::TokenBucketOutcome> {
        let (current_count, reset_seconds) =
            self.store.window_increment(key, window_secs, now).await?;
        let previous_count = self
            .store
            .previous_window_count(key, window_secs, now)
            .await?;

        let elapsed_in_window = window_secs as i64 - reset_seconds as i64;
        let fraction_elapsed = (elapsed_in_window.max(0) as f64) / (window_secs.max(1) as f64);
        let weighted = previous_count as f64 * (1.0 - fraction_elapsed) + current_count as f64;

        let allowed = weighted <= limit as f64;
        let remaining = (limit as f64 - weighted).max(0.0) as u64;
        Ok((allowed, remaining, reset_seconds))
    }
}

/// Build a rate-limit key from a template of `{ip}`/`{user}`/`{route}`
/// placeholders and literal text. Falls back to `{ip}` if a referenced
/// component is unavailable (e.g. `{user}` with no Principal).
fn derive_key(template: &str, client_ip: &str, user_id: Option<&str>, route_id: &str) -> String {
    if template.contains("{user}") && user_id.is_none() {
        return format!("ip:{}", client_ip);
    }

    let mut key = template
        .replace("{ip}", client_ip)
        .replace("{route}", route_id);
    if let Some(user_id) = user_id {
        key = key.replace("{user}", user_id);
    }
    key
}

fn rule_limit(algorithm: &RateLimitAlgorithm) -> u64 {
    match algorithm {
        RateLimitAlgorithm::TokenBucket { capacity, .. } => *capacity as u64,
        RateLimitAlgorithm::FixedWindow { limit, .. } => *limit,
        RateLimitAlgorithm::SlidingWindow { limit, .. } => *limit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn key_falls_back_to_ip_when_user_unavailable() {
        assert_eq!(derive_key("{user}:{route}", "10.0.0.1", None, "r1"), "ip:10.0.0.1");
    }

    #[test]
    fn key_substitutes_all_placeholders() {
        assert_eq!(
            derive_key("{ip}:{user}:{route}", "10.0.0.1", Some("u1"), "r1"),
            "10.0.0.1:u1:r1"
        );
    }

    #[tokio::test]
    async fn four_requests_against_capacity_three_allows_three() {
        let store = Arc::new(InMemoryRateLimitStore::new());
        let limiter = RateLimiter::new(store);
        let rule = RateLimitRule {
            key_template: "{ip}".to_string(),
            algorithm: RateLimitAlgorithm::TokenBucket {
                capacity: 3.0,
                refill_rate: 0.0,
            },
            fail_open: false,
        };

        let mut allowed = 0;
        let mut last_denied: Option<RateLimitDecision> = None;
        for _ in 0..4 {
            let decision = limiter
                .check(&rule, "10.0.0.1", None, "r1")
                .await
                .unwrap();
            if decision.allowed {
                allowed += 1;
            } else {
                last_denied = Some(decision);
            }
        }
        assert_eq!(allowed, 3);
        assert_eq!(last_denied.unwrap().remaining, 0);
    }

    #[tokio::test]
    async fn fail_open_allows_when_store_errors() {
        struct FailingStore;

        #[async_trait::async_trait]
        impl RateLimitStore for FailingStore {
            async fn token_bucket_consume(
                &self,
                _key: &str,
                _capacity: f64,
                _refill_rate: f64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<store::TokenBucketOutcome> {
                Err(Error::Store("down".into()))
            }
            async fn window_increment(
                &self,
                _key: &str,
                _window_secs: u64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<store::WindowOutcome> {
                Err(Error::Store("down".into()))
            }
            async fn previous_window_count(
                &self,
                _key: &str,
                _window_secs: u64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<u64> {
                Err(Error::Store("down".into()))
            }
            async fn ping(&self) -> Result<()> {
                Err(Error::Store("down".into()))
            }
        }

        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let rule = RateLimitRule {
            fail_open: true,
            ..RateLimitRule::default()
        };
        let decision = limiter.check(&rule, "10.0.0.1", None, "r1").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn fail_closed_errors_when_store_errors() {
        struct FailingStore;

        #[async_trait::async_trait]
        impl RateLimitStore for FailingStore {
            async fn token_bucket_consume(
                &self,
                _key: &str,
                _capacity: f64,
                _refill_rate: f64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<store::TokenBucketOutcome> {
                Err(Error::Store("down".into()))
            }
            async fn window_increment(
                &self,
                _key: &str,
                _window_secs: u64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<store::WindowOutcome> {
                Err(Error::Store("down".into()))
            }
            async fn previous_window_count(
                &self,
                _key: &str,
                _window_secs: u64,
                _now: chrono::DateTime<Utc>,
            ) -> Result<u64> {
                Err(Error::Store("down".into()))
            }
            async fn ping(&self) -> Result<()> {
                Err(Error::Store("down".into()))
            }
        }

        let limiter = RateLimiter::new(Arc::new(FailingStore));
        let rule = RateLimitRule {
            fail_open: false,
            ..RateLimitRule::default()
        };
        assert!(limiter.check(&rule, "10.0.0.1", None, "r1").await.is_err());
    }
}
