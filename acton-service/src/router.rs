//! Route table: compiles route patterns once at startup and resolves
//! `(method, path)` to a route descriptor plus extracted path parameters.

use std::collections::HashSet;
use std::sync::Arc;

use axum::http::Method;
use regex::Regex;

use crate::error::{Error, Result};
use crate::rate_limit::RateLimitRule;

/// A declarative mapping from `(method, path pattern)` to an upstream and a
/// set of policies. Built once from config at startup; immutable after that.
#[derive(Debug, Clone)]
pub struct Route {
    pub id: String,
    pub pattern: String,
    pub methods: HashSet<Method>,
    pub upstream_base: String,
    pub auth_required: bool,
    /// Any-of permission sets: the principal must hold every permission in
    /// at least one of these sets.
    pub permission_sets: Vec<Vec<String>>,
    pub rate_limit_rule: Option<RateLimitRule>,
    pub priority: i32,
    pub pass_session: bool,
    pub allow_refresh: bool,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub overall_timeout_ms: Option<u64>,
}

/// A precompiled route: the regex matcher and the ordered parameter names
/// whose capture groups it declares, plus a specificity score used to order
/// routes deterministically.
#[derive(Debug, Clone)]
pub struct CompiledRoute {
    pub id: String,
    pub methods: HashSet<Method>,
    pub upstream_base: String,
    pub auth_required: bool,
    pub permission_sets: Vec<Vec<String>>,
    pub rate_limit_rule: Option<RateLimitRule>,
    pub pass_session: bool,
    pub allow_refresh: bool,
    pub connect_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub overall_timeout_ms: Option<u64>,
    priority: i32,
    specificity: usize,
    regex: Regex,
    param_names: Vec<String>,
}

/// The compiled route table. Routes are held pre-sorted by priority then
/// specificity so matching is a simple linear scan that returns on first hit.
#[derive(Debug, Clone)]
pub struct Router {
    routes: Arc<Vec<CompiledRoute>>,
}

impl Router {
    /// Compile the route table, rejecting configs with ambiguous routes:
    /// equal priority, identical pattern, and overlapping method sets.
    pub fn new(routes: Vec<Route>) -> Result<Self> {
        let mut compiled: Vec<CompiledRoute> = routes
            .into_iter()
            .map(|r| {
                let (regex, param_names) = compile_pattern(&r.pattern)?;
                let specificity = specificity_of(&r.pattern);
                Ok(CompiledRoute {
                    id: r.id,
                    methods: r.methods,
                    upstream_base: r.upstream_base,
                    auth_required: r.auth_required,
                    permission_sets: r.permission_sets,
                    rate_limit_rule: r.rate_limit_rule,
                    pass_session: r.pass_session,
                    allow_refresh: r.allow_refresh,
                    connect_timeout_ms: r.connect_timeout_ms,
                    read_timeout_ms: r.read_timeout_ms,
                    overall_timeout_ms: r.overall_timeout_ms,
                    priority: r.priority,
                    specificity,
                    regex,
                    param_names,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        // Higher priority first, then higher specificity; stable beyond that.
        compiled.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.specificity.cmp(&a.specificity))
        });

        for i in 0..compiled.len() {
            for j in (i + 1)..compiled.len() {
                let a = &compiled[i];
                let b = &compiled[j];
                if a.priority == b.priority
                    && a.regex.as_str() == b.regex.as_str()
                    && !a.methods.is_disjoint(&b.methods)
                {
                    return Err(Error::Internal(format!(
                        "ambiguous routes '{}' and '{}': equal priority, equal pattern, overlapping methods",
                        a.id, b.id
                    )));
                }
            }
        }

        Ok(Self {
            routes: Arc::new(compiled),
        })
    }

    /// Resolve a normalized path and method to a route and its captured
    /// parameters. Returns `RouteNotFound`, `MethodNotAllowed` (with the
    /// union of allowed methods across path-matching routes), or
    /// `BadRequest` if a captured parameter fails validation.
    pub fn resolve(
        &self,
        method: &Method,
        normalized_path: &str,
    ) -> Result<(CompiledRoute, Vec<(String, String)>)> {
        let mut path_matched_methods: HashSet<Method> = HashSet::new();
        let mut path_matched_at_all = false;

        for route in self.routes.iter() {
            let Some(captures) = route.regex.captures(normalized_path) else {
                continue;
            };
            path_matched_at_all = true;
            path_matched_methods.extend(route.methods.iter().cloned());

            if !route.methods.contains(method) {
                continue;
            }

            let mut params = Vec::with_capacity(route.param_names.len());
            for name in &route.param_names {
                let value = captures.name(name).map(|m| m.as_str()).unwrap_or("");
                validate_param(value)?;
                params.push((name.clone(), value.to_string()));
            }

            return Ok((route.clone(), params));
        }

        if path_matched_at_all {
            let mut allowed: Vec<Method> = path_matched_methods.into_iter().collect();
            allowed.sort_by_key(|m| m.to_string());
            Err(Error::MethodNotAllowed(allowed))
        } else {
            Err(Error::RouteNotFound)
        }
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Reject captured path parameters that could reach an upstream as a
/// traversal or header-injection attempt. Decodes any remaining percent
/// escapes in the captured value itself (including `%2f`) so a segment
/// smuggled past the route-level normalization as `..%2fadmin` is still
/// caught as a literal `..` segment.
fn validate_param(value: &str) -> Result<()> {
    let fully_decoded = percent_decode_all(value);
    if fully_decoded.chars().any(|c| (c as u32) < 0x20) {
        return Err(Error::BadRequest(
            "path parameter contains a control character".into(),
        ));
    }
    if fully_decoded.split('/').any(|seg| seg == "..") {
        return Err(Error::BadRequest("path parameter contains '..'".into()));
    }
    Ok(())
}

/// Compile a `/`-separated pattern where a segment is a literal, a named
/// capture `{name}`, or (only as the last segment) a trailing wildcard
/// `{rest*}` matching the remainder of the path including slashes. A
/// `{name*}` segment anywhere but last is rejected at startup rather than
/// silently becoming a mid-path greedy capture.
fn compile_pattern(pattern: &str) -> Result<(Regex, Vec<String>)> {
    let mut regex_str = String::from("^");
    let mut names = Vec::new();
    let segments: Vec<&str> = pattern.trim_end_matches('/').split('/').collect();
    let last = segments.len().saturating_sub(1);

    for (i, segment) in segments.iter().enumerate() {
        if i > 0 {
            regex_str.push('/');
        }
        if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if let Some(name) = inner.strip_suffix('*') {
                if i != last {
                    return Err(Error::Config(Box::new(figment::Error::from(format!(
                        "route pattern '{}': trailing wildcard '{{{}*}}' is only valid as the last segment",
                        pattern, name
                    )))));
                }
                names.push(name.to_string());
                regex_str.push_str(&format!("(?P<{}>.+)", name));
            } else {
                names.push(inner.to_string());
                regex_str.push_str(&format!("(?P<{}>[^/]+)", inner));
            }
        } else {
            for c in segment.chars() {
                if matches!(
                    c,
                    '.' | '+' | '?' | '(' | ')' | '[' | ']' | '^' | '$' | '|' | '\\' | '*'
                ) {
                    regex_str.push('\\');
                }
                regex_str.push(c);
            }
        }
    }
    regex_str.push('$');

    let regex = Regex::new(&regex_str).unwrap_or_else(|e| {
        panic!("generated route regex '{}' is invalid: {}", regex_str, e)
    });
    Ok((regex, names))
}

/// Higher score wins ties: literal segments beat captures beat wildcards,
/// and longer patterns beat shorter ones.
fn specificity_of(pattern: &str) -> usize {
    let mut score = 0;
    for segment in pattern.trim_end_matches('/').split('/') {
        if segment.is_empty() {
            continue;
        }
        if let Some(inner) = segment.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
            if inner.ends_with('*') {
                score += 1;
            } else {
                score += 7;
            }
        } else {
            score += 10;
        }
    }
    score += pattern.len();
    score
}

/// Normalize a path per the router's contract: percent-decode non-reserved
/// octets, collapse repeated `/`, strip a single trailing `/` except root.
/// Idempotent: `normalize(normalize(p)) == normalize(p)`.
pub fn normalize_path(path: &str) -> String {
    let decoded = percent_decode(path);

    let mut collapsed = String::with_capacity(decoded.len());
    let mut prev_slash = false;
    for c in decoded.chars() {
        if c == '/' {
            if prev_slash {
                continue;
            }
            prev_slash = true;
        } else {
            prev_slash = false;
        }
        collapsed.push(c);
    }

    if collapsed.len() > 1 && collapsed.ends_with('/') {
        collapsed.pop();
    }
    if collapsed.is_empty() {
        collapsed.push('/');
    }
    collapsed
}

/// Decode every percent escape, including reserved ones like `%2f`. Used
/// only for post-match parameter validation, never for the path the router
/// matches against.
fn percent_decode_all(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    out.push(value);
                    i += 3;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(hex) = std::str::from_utf8(&bytes[i + 1..i + 3]) {
                if let Ok(value) = u8::from_str_radix(hex, 16) {
                    // Never decode '/' or '%' themselves back into structural meaning.
                    if value != b'/' {
                        out.push(value);
                        i += 3;
                        continue;
                    }
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(id: &str, pattern: &str, methods: &[Method], priority: i32) -> Route {
        Route {
            id: id.to_string(),
            pattern: pattern.to_string(),
            methods: methods.iter().cloned().collect(),
            upstream_base: "http://upstream".to_string(),
            auth_required: false,
            permission_sets: vec![],
            rate_limit_rule: None,
            priority,
            pass_session: false,
            allow_refresh: true,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            overall_timeout_ms: None,
        }
    }

    #[test]
    fn matches_literal_route() {
        let router = Router::new(vec![route("ping", "/v1/ping", &[Method::GET], 0)]).unwrap();
        let (matched, params) = router.resolve(&Method::GET, "/v1/ping").unwrap();
        assert_eq!(matched.id, "ping");
        assert!(params.is_empty());
    }

    #[test]
    fn captures_named_parameter() {
        let router =
            Router::new(vec![route("user", "/v1/users/{id}", &[Method::GET], 0)]).unwrap();
        let (matched, params) = router.resolve(&Method::GET, "/v1/users/42").unwrap();
        assert_eq!(matched.id, "user");
        assert_eq!(params, vec![("id".to_string(), "42".to_string())]);
    }

    #[test]
    fn rejects_traversal_in_captured_parameter() {
        let router =
            Router::new(vec![route("user", "/v1/users/{id}", &[Method::GET], 0)]).unwrap();
        let err = router
            .resolve(&Method::GET, "/v1/users/..")
            .unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn rejects_percent_encoded_traversal_in_captured_parameter() {
        // GET /v1/users/%2e%2e%2fadmin against /v1/users/{id}: the path-level
        // normalization leaves %2f alone (it's structural), but the captured
        // parameter is decoded again and caught here.
        let router =
            Router::new(vec![route("user", "/v1/users/{id}", &[Method::GET], 0)]).unwrap();
        let normalized = normalize_path("/v1/users/%2e%2e%2fadmin");
        let err = router.resolve(&Method::GET, &normalized).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn method_not_allowed_returns_union_of_allowed_methods() {
        let router = Router::new(vec![
            route("get_user", "/v1/users/{id}", &[Method::GET], 0),
            route("put_user", "/v1/users/{id}", &[Method::PUT], 0),
        ])
        .unwrap();
        let err = router.resolve(&Method::DELETE, "/v1/users/1").unwrap_err();
        match err {
            Error::MethodNotAllowed(methods) => {
                assert!(methods.contains(&Method::GET));
                assert!(methods.contains(&Method::PUT));
            }
            other => panic!("expected MethodNotAllowed, got {other:?}"),
        }
    }

    #[test]
    fn route_not_found_for_unmatched_path() {
        let router = Router::new(vec![route("ping", "/v1/ping", &[Method::GET], 0)]).unwrap();
        let err = router.resolve(&Method::GET, "/v1/pong").unwrap_err();
        assert!(matches!(err, Error::RouteNotFound));
    }

    #[test]
    fn more_specific_route_wins_over_wildcard() {
        let router = Router::new(vec![
            route("catch_all", "/v1/{rest*}", &[Method::GET], 0),
            route("exact", "/v1/users", &[Method::GET], 0),
        ])
        .unwrap();
        let (matched, _) = router.resolve(&Method::GET, "/v1/users").unwrap();
        assert_eq!(matched.id, "exact");
    }

    #[test]
    fn rejects_wildcard_segment_that_is_not_last() {
        let err = Router::new(vec![route(
            "mid",
            "/v1/{mid*}/fixed",
            &[Method::GET],
            0,
        )])
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn trailing_wildcard_captures_remainder() {
        let router =
            Router::new(vec![route("catch_all", "/v1/{rest*}", &[Method::GET], 0)]).unwrap();
        let (_, params) = router.resolve(&Method::GET, "/v1/a/b/c").unwrap();
        assert_eq!(params, vec![("rest".to_string(), "a/b/c".to_string())]);
    }

    #[test]
    fn ambiguous_routes_rejected_at_startup() {
        let result = Router::new(vec![
            route("a", "/v1/users", &[Method::GET], 0),
            route("b", "/v1/users", &[Method::GET], 0),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn normalize_path_collapses_slashes_and_trailing_slash() {
        assert_eq!(normalize_path("/v1//users/"), "/v1/users");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path(""), "/");
    }

    #[test]
    fn normalize_path_percent_decodes() {
        assert_eq!(normalize_path("/v1/users%20name"), "/v1/users name");
    }

    #[test]
    fn normalize_path_is_idempotent() {
        let p = "/v1//users/%20/";
        assert_eq!(normalize_path(&normalize_path(p)), normalize_path(p));
    }

    #[test]
    fn normalize_path_does_not_let_encoded_slash_restructure_segments() {
        // %2f must not become a path separator -- this is exactly the
        // traversal vector the router's own normalization must not open up.
        let normalized = normalize_path("/v1/users/%2e%2e%2fadmin");
        assert!(!normalized.contains("../"));
    }
}
