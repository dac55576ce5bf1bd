//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: GATEWAY_)
//! 2. Current working directory: ./config.toml
//! 3. XDG config directory: ~/.config/acton-service/{service_name}/config.toml
//! 4. System directory: /etc/acton-service/{service_name}/config.toml
//! 5. Default values

use std::path::{Path, PathBuf};

use axum::http::Method;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::rate_limit::{RateLimitAlgorithm, RateLimitRule};
use crate::router::Route;

/// Top-level configuration for the gateway.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,

    #[serde(default)]
    pub routes: Vec<RouteDefinition>,

    pub session: SessionConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub metrics: AdminEndpointConfig,

    #[serde(default)]
    pub health: AdminEndpointConfig,

    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Backend for the Session Store and Rate-Limit Store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// `"memory"` (single-process, default) or `"redis"`.
    #[serde(default = "default_store_backend")]
    pub backend: String,

    #[serde(default)]
    pub redis_url: Option<String>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            redis_url: None,
        }
    }
}

fn default_store_backend() -> String {
    "memory".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Admission control cap; requests beyond this receive 503 immediately.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,

    /// Per-request body size limit in bytes.
    #[serde(default = "default_request_body_max")]
    pub request_body_max: u64,

    /// Fail startup (exit code 3) if the Session Store or Rate-Limit Store
    /// cannot be reached.
    #[serde(default = "default_false")]
    pub require_store_on_start: bool,

    #[serde(default)]
    pub security_headers: SecurityHeadersConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityHeadersConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_true")]
    pub hsts: bool,
    #[serde(default = "default_hsts_max_age")]
    pub hsts_max_age_secs: u64,
    #[serde(default = "default_true")]
    pub hsts_include_subdomains: bool,
    #[serde(default = "default_false")]
    pub hsts_preload: bool,

    #[serde(default = "default_true")]
    pub x_content_type_options: bool,

    #[serde(default = "default_x_frame_options")]
    pub x_frame_options: String,

    #[serde(default = "default_true")]
    pub x_xss_protection: bool,

    #[serde(default = "default_referrer_policy")]
    pub referrer_policy: String,

    #[serde(default)]
    pub permissions_policy: Option<String>,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hsts: true,
            hsts_max_age_secs: default_hsts_max_age(),
            hsts_include_subdomains: true,
            hsts_preload: false,
            x_content_type_options: true,
            x_frame_options: default_x_frame_options(),
            x_xss_protection: true,
            referrer_policy: default_referrer_policy(),
            permissions_policy: None,
        }
    }
}

fn default_hsts_max_age() -> u64 {
    31_536_000
}

fn default_x_frame_options() -> String {
    "DENY".to_string()
}

fn default_referrer_policy() -> String {
    "no-referrer".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default = "default_false")]
    pub enabled: bool,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    #[serde(default = "default_tls_min_version")]
    pub min_version: String,
    #[serde(default)]
    pub ciphers: Vec<String>,
}

/// One entry of `routes[]`; compiled into a [`crate::router::Route`] by
/// [`Config::build_routes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteDefinition {
    pub id: String,
    pub path: String,
    pub methods: Vec<String>,
    pub upstream: String,

    #[serde(default = "default_false")]
    pub auth_required: bool,

    /// Any-of permission sets; an empty outer list means no permission is
    /// required (distinct from an empty inner set, which is unsatisfiable
    /// only if `auth_required` is also false and no principal is present).
    #[serde(default)]
    pub permissions: Vec<Vec<String>>,

    #[serde(default)]
    pub rate_limit: Option<RateLimitRuleConfig>,

    #[serde(default)]
    pub timeouts: RouteTimeouts,

    #[serde(default = "default_false")]
    pub pass_session: bool,

    /// Whether the Token Validator may rotate a near-expiry session and emit
    /// a refreshed `Set-Cookie` for requests matching this route.
    #[serde(default = "default_true")]
    pub allow_refresh: bool,

    #[serde(default)]
    pub priority: i32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteTimeouts {
    pub connect_ms: Option<u64>,
    pub read_ms: Option<u64>,
    pub overall_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// `"opaque"` (Session Store lookup) or `"signed"` (HMAC token).
    #[serde(default = "default_token_kind")]
    pub token_kind: String,

    #[serde(default)]
    pub idle_ttl_secs: Option<u64>,

    /// Reject a token whose `bound_ip` claim doesn't match the caller.
    #[serde(default = "default_false")]
    pub bind_ip: bool,

    /// Required when `token_kind == "signed"`; must be at least 32 bytes.
    #[serde(default)]
    pub signing_secret: Option<String>,

    /// Rotate a session and emit a refreshed `Set-Cookie` once its remaining
    /// TTL drops below this many seconds. `None` disables refresh.
    #[serde(default)]
    pub refresh_threshold_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub default: RateLimitRuleConfig,

    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: RateLimitRuleConfig::default(),
            fail_open: default_true(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitRuleConfig {
    #[serde(default = "default_key_template")]
    pub key_template: String,

    #[serde(flatten)]
    pub algorithm: RateLimitAlgorithmConfig,
}

impl Default for RateLimitRuleConfig {
    fn default() -> Self {
        Self {
            key_template: default_key_template(),
            algorithm: RateLimitAlgorithmConfig::TokenBucket {
                capacity: 60.0,
                refill_rate: 1.0,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "algorithm", rename_all = "snake_case")]
pub enum RateLimitAlgorithmConfig {
    TokenBucket { capacity: f64, refill_rate: f64 },
    FixedWindow { window_secs: u64, limit: u64 },
    SlidingWindow { window_secs: u64, limit: u64 },
}

impl From<&RateLimitRuleConfig> for RateLimitAlgorithm {
    fn from(config: &RateLimitRuleConfig) -> Self {
        match config.algorithm {
            RateLimitAlgorithmConfig::TokenBucket { capacity, refill_rate } => {
                RateLimitAlgorithm::TokenBucket { capacity, refill_rate }
            }
            RateLimitAlgorithmConfig::FixedWindow { window_secs, limit } => {
                RateLimitAlgorithm::FixedWindow { window_secs, limit }
            }
            RateLimitAlgorithmConfig::SlidingWindow { window_secs, limit } => {
                RateLimitAlgorithm::SlidingWindow { window_secs, limit }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_pool_per_host")]
    pub pool_per_host: u32,

    #[serde(default = "default_pool_idle_seconds")]
    pub pool_idle_seconds: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    #[serde(default = "default_overall_timeout_ms")]
    pub overall_timeout_ms: u64,

    #[serde(default = "default_max_request_body_bytes")]
    pub max_request_body_bytes: u64,

    #[serde(default = "default_false")]
    pub retry_idempotent: bool,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            pool_per_host: default_pool_per_host(),
            pool_idle_seconds: default_pool_idle_seconds(),
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            overall_timeout_ms: default_overall_timeout_ms(),
            max_request_body_bytes: default_max_request_body_bytes(),
            retry_idempotent: false,
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_redact_headers")]
    pub redact_headers: Vec<String>,

    /// `"json"` or `"pretty"`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            redact_headers: default_redact_headers(),
            format: default_log_format(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminEndpointConfig {
    #[serde(default = "default_admin_bind_address")]
    pub bind_address: String,
}

impl Default for AdminEndpointConfig {
    fn default() -> Self {
        Self {
            bind_address: default_admin_bind_address(),
        }
    }
}

/// Roles that bypass a route's permission requirement entirely (e.g. `admin`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default)]
    pub sufficient_roles: Vec<String>,
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            sufficient_roles: Vec::new(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_in_flight() -> usize {
    1024
}

fn default_request_body_max() -> u64 {
    10 * 1024 * 1024
}

fn default_tls_min_version() -> String {
    "1.2".to_string()
}

fn default_cookie_name() -> String {
    "session_token".to_string()
}

fn default_token_kind() -> String {
    "opaque".to_string()
}

fn default_key_template() -> String {
    "{ip}".to_string()
}

fn default_pool_per_host() -> u32 {
    10
}

fn default_pool_idle_seconds() -> u64 {
    90
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_read_timeout_ms() -> u64 {
    10_000
}

fn default_overall_timeout_ms() -> u64 {
    30_000
}

fn default_max_request_body_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_retry_max_attempts() -> u32 {
    2
}

fn default_retry_base_delay_ms() -> u64 {
    50
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_redact_headers() -> Vec<String> {
    vec![
        "authorization".to_string(),
        "cookie".to_string(),
        "set-cookie".to_string(),
        "x-api-key".to_string(),
        "proxy-authorization".to_string(),
    ]
}

fn default_admin_bind_address() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_true() -> bool {
    true
}

fn default_false() -> bool {
    false
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// Searches for config files in this order (first found is used):
    /// 1. Current working directory: ./config.toml
    /// 2. XDG config directory: ~/.config/acton-service/{service_name}/config.toml
    /// 3. System directory: /etc/acton-service/{service_name}/config.toml
    ///
    /// Environment variables (`GATEWAY_` prefix) override all file-based configs.
    pub fn load() -> Result<Self> {
        let service_name = std::env::current_exe()
            .ok()
            .and_then(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "acton-service".to_string());

        Self::load_for_service(&service_name)
    }

    pub fn load_for_service(service_name: &str) -> Result<Self> {
        let config_paths = Self::find_config_paths(service_name);

        tracing::debug!("searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new();

        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed("GATEWAY_").split("__"));

        let config: Config = figment.extract().map_err(|e| Error::Config(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific file, bypassing XDG/system lookup. Useful for
    /// tests and non-standard deployments.
    pub fn load_from(path: &str) -> Result<Self> {
        let config: Config = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("GATEWAY_").split("__"))
            .extract()
            .map_err(|e| Error::Config(Box::new(e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Build from an already-constructed value, applying the same
    /// validation `load`/`load_from` perform. Mainly used by tests that
    /// want to avoid touching the filesystem or environment.
    pub fn from_value(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(config)
    }

    fn find_config_paths(service_name: &str) -> Vec<PathBuf> {
        let mut paths = Vec::new();

        paths.push(PathBuf::from("config.toml"));

        let xdg_dirs = xdg::BaseDirectories::with_prefix("acton-service");
        let config_file_path = Path::new(service_name).join("config.toml");
        if let Ok(path) = xdg_dirs.place_config_file(&config_file_path) {
            paths.push(path);
        }

        paths.push(PathBuf::from("/etc/acton-service").join(service_name).join("config.toml"));

        paths
    }

    /// Startup validation: signing secret length, route upstream sanity,
    /// TLS material presence. A clear diagnostic here maps to exit code 1.
    fn validate(&self) -> Result<()> {
        if self.session.token_kind == "signed" {
            let secret_len = self
                .session
                .signing_secret
                .as_ref()
                .map(|s| s.len())
                .unwrap_or(0);
            if secret_len < 32 {
                return Err(Error::Config(Box::new(figment::Error::from(
                    "session.signing_secret must be at least 32 bytes when session.token_kind is \"signed\""
                        .to_string(),
                ))));
            }
        }

        if let Some(tls) = &self.server.tls {
            if tls.enabled && (tls.cert.is_none() || tls.key.is_none()) {
                return Err(Error::Config(Box::new(figment::Error::from(
                    "server.tls.enabled requires both cert and key paths".to_string(),
                ))));
            }
        }

        if self.store.backend == "redis" && self.store.redis_url.is_none() {
            return Err(Error::Config(Box::new(figment::Error::from(
                "store.backend = \"redis\" requires store.redis_url".to_string(),
            ))));
        }

        for route in &self.routes {
            if route.methods.is_empty() {
                return Err(Error::Config(Box::new(figment::Error::from(format!(
                    "route {} declares no methods",
                    route.id
                )))));
            }
        }

        Ok(())
    }

    /// Compile `routes[]` into the plain descriptors [`crate::router::Router::new`]
    /// expects, resolving each route's rate-limit rule against the global default.
    pub fn build_routes(&self) -> Result<Vec<Route>> {
        self.routes
            .iter()
            .map(|def| self.build_route(def))
            .collect()
    }

    fn build_route(&self, def: &RouteDefinition) -> Result<Route> {
        let methods = def
            .methods
            .iter()
            .map(|m| {
                Method::from_bytes(m.to_uppercase().as_bytes())
                    .map_err(|_| Error::Config(Box::new(figment::Error::from(format!(
                        "route {} has invalid method {}",
                        def.id, m
                    )))))
            })
            .collect::<Result<std::collections::HashSet<_>>>()?;

        let rate_limit_rule = def.rate_limit.as_ref().map(|rule_config| RateLimitRule {
            key_template: rule_config.key_template.clone(),
            algorithm: RateLimitAlgorithm::from(rule_config),
            fail_open: self.rate_limit.fail_open,
        });

        Ok(Route {
            id: def.id.clone(),
            pattern: def.path.clone(),
            methods,
            upstream_base: def.upstream.clone(),
            auth_required: def.auth_required,
            permission_sets: def.permissions.clone(),
            rate_limit_rule,
            priority: def.priority,
            pass_session: def.pass_session,
            allow_refresh: def.allow_refresh,
            connect_timeout_ms: def.timeouts.connect_ms,
            read_timeout_ms: def.timeouts.read_ms,
            overall_timeout_ms: def.timeouts.overall_ms,
        })
    }

    /// The rate-limit rule applied when a route defines none of its own.
    pub fn default_rate_limit_rule(&self) -> RateLimitRule {
        RateLimitRule {
            key_template: self.rate_limit.default.key_template.clone(),
            algorithm: RateLimitAlgorithm::from(&self.rate_limit.default),
            fail_open: self.rate_limit.fail_open,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
        [server]
        bind_address = "127.0.0.1"
        port = 8080

        [session]
        cookie_name = "session_token"
        token_kind = "opaque"

        [[routes]]
        id = "ping"
        path = "/v1/ping"
        methods = ["GET"]
        upstream = "http://localhost:9001"
        "#
    }

    #[test]
    fn loads_minimal_config_from_toml_string() {
        let config: Config = Figment::new()
            .merge(figment::providers::Toml::string(minimal_toml()))
            .extract()
            .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].id, "ping");
    }

    #[test]
    fn signed_token_kind_requires_long_enough_secret() {
        let mut config: Config = Figment::new()
            .merge(figment::providers::Toml::string(minimal_toml()))
            .extract()
            .unwrap();
        config.session.token_kind = "signed".to_string();
        config.session.signing_secret = Some("too-short".to_string());
        assert!(config.validate().is_err());

        config.session.signing_secret = Some("a".repeat(32));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn tls_enabled_without_cert_and_key_is_rejected() {
        let mut config: Config = Figment::new()
            .merge(figment::providers::Toml::string(minimal_toml()))
            .extract()
            .unwrap();
        config.server.tls = Some(TlsConfig {
            enabled: true,
            cert: None,
            key: None,
            min_version: "1.2".to_string(),
            ciphers: vec![],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn build_routes_compiles_route_definitions() {
        let config: Config = Figment::new()
            .merge(figment::providers::Toml::string(minimal_toml()))
            .extract()
            .unwrap();
        let routes = config.build_routes().unwrap();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].id, "ping");
        assert!(routes[0].methods.contains(&Method::GET));
    }

    #[test]
    fn route_with_no_methods_fails_validation() {
        let mut config: Config = Figment::new()
            .merge(figment::providers::Toml::string(minimal_toml()))
            .extract()
            .unwrap();
        config.routes[0].methods.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_reads_and_validates_an_on_disk_file() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();
        let path = file.path().to_str().unwrap();

        let config = Config::load_from(path).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.routes[0].upstream, "http://localhost:9001");
    }
}
