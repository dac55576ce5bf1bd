//! Authorization: given a Principal and a matched Route, decide whether the
//! request may proceed.

use crate::auth::Principal;
use crate::config::AuthorizationConfig;
use crate::error::{Error, Result};
use crate::router::CompiledRoute;

/// Allow iff the route requires no permissions, or the principal's
/// permission set is a superset of one of the route's required sets
/// (any-of semantics), or the principal holds a role configured as
/// unconditionally sufficient (e.g. `admin`).
pub fn authorize(
    principal: Option<&Principal>,
    route: &CompiledRoute,
    config: &AuthorizationConfig,
) -> Result<()> {
    if route.permission_sets.is_empty() {
        return Ok(());
    }

    let Some(principal) = principal else {
        return Err(Error::PermissionDenied);
    };

    if config
        .sufficient_roles
        .iter()
        .any(|role| principal.has_role(role))
    {
        return Ok(());
    }

    let satisfied = route.permission_sets.iter().any(|required_set| {
        required_set
            .iter()
            .all(|perm| principal.has_permission(perm))
    });

    if satisfied {
        Ok(())
    } else {
        tracing::warn!(
            user_id = %principal.user_id,
            route_id = %route.id,
            "permission denied: principal lacks any required permission set"
        );
        Err(Error::PermissionDenied)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::collections::HashSet;

    fn route(permission_sets: Vec<Vec<String>>) -> CompiledRoute {
        crate::router::Router::new(vec![crate::router::Route {
            id: "r1".to_string(),
            pattern: "/v1/admin".to_string(),
            methods: HashSet::from([axum::http::Method::GET]),
            upstream_base: "http://upstream".to_string(),
            auth_required: true,
            permission_sets,
            rate_limit_rule: None,
            priority: 0,
            pass_session: false,
            allow_refresh: true,
            connect_timeout_ms: None,
            read_timeout_ms: None,
            overall_timeout_ms: None,
        }])
        .unwrap()
        .resolve(&axum::http::Method::GET, "/v1/admin")
        .unwrap()
        .0
    }

    fn principal(permissions: Vec<&str>, roles: Vec<&str>) -> Principal {
        Principal {
            user_id: "user-1".to_string(),
            session_id: "sess-1".to_string(),
            roles: roles.into_iter().map(String::from).collect(),
            permissions: permissions.into_iter().map(String::from).collect(),
            issued_at: Utc::now(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
            bound_ip: None,
        }
    }

    #[test]
    fn no_permissions_required_allows_anyone() {
        let r = route(vec![]);
        let config = AuthorizationConfig::default();
        assert!(authorize(None, &r, &config).is_ok());
    }

    #[test]
    fn missing_principal_denied_when_permissions_required() {
        let r = route(vec![vec!["read".to_string()]]);
        let config = AuthorizationConfig::default();
        assert!(authorize(None, &r, &config).is_err());
    }

    #[test]
    fn matching_permission_set_allows() {
        let r = route(vec![vec!["read".to_string(), "write".to_string()]]);
        let config = AuthorizationConfig::default();
        let p = principal(vec!["read", "write"], vec![]);
        assert!(authorize(Some(&p), &r, &config).is_ok());
    }

    #[test]
    fn any_of_multiple_sets_is_sufficient() {
        let r = route(vec![
            vec!["admin:all".to_string()],
            vec!["read".to_string(), "write".to_string()],
        ]);
        let config = AuthorizationConfig::default();
        let p = principal(vec!["read", "write"], vec![]);
        assert!(authorize(Some(&p), &r, &config).is_ok());
    }

    #[test]
    fn partial_permission_set_denied() {
        let r = route(vec![vec!["read".to_string(), "write".to_string()]]);
        let config = AuthorizationConfig::default();
        let p = principal(vec!["read"], vec![]);
        assert!(matches!(
            authorize(Some(&p), &r, &config),
            Err(Error::PermissionDenied)
        ));
    }

    #[test]
    fn sufficient_role_bypasses_permission_check() {
        let r = route(vec![vec!["anything".to_string()]]);
        let mut config = AuthorizationConfig::default();
        config.sufficient_roles = vec!["admin".to_string()];
        let p = principal(vec![], vec!["admin"]);
        assert!(authorize(Some(&p), &r, &config).is_ok());
    }
}
