//! Bearer-secret and peer-address checks on the submission API

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use secrecy::{ExposeSecret, SecretString};
use tracing::warn;

use crate::errors::RunnerError;
use crate::server::state::ServerState;
use crate::storage::settings::Settings;

/// Who may submit jobs
#[derive(Debug, Clone, Default)]
pub struct AuthPolicy {
    secret: Option<SecretString>,
    allow_ips: Vec<IpAddr>,
}

/// Why a request was turned away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denied {
    /// Missing or wrong bearer secret, or none configured
    Unauthorized,
    /// Peer address not in the allow list
    Forbidden,
}

impl IntoResponse for Denied {
    fn into_response(self) -> Response {
        match self {
            Denied::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized").into_response(),
            Denied::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
        }
    }
}

impl AuthPolicy {
    pub fn new(secret: Option<SecretString>, allow_ips: Vec<IpAddr>) -> Self {
        Self { secret, allow_ips }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, RunnerError> {
        let allow_ips = settings
            .allow_ips
            .iter()
            .map(|ip| {
                ip.trim()
                    .parse::<IpAddr>()
                    .map_err(|e| RunnerError::ConfigError(format!("allow_ips entry {ip}: {e}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        if settings.secret.is_none() {
            warn!("No secret configured, every job submission will be refused");
        }
        Ok(Self::new(settings.secret.clone(), allow_ips))
    }

    /// Check the request headers and, when an allow list is set, the peer
    pub fn check(&self, headers: &HeaderMap, peer: Option<IpAddr>) -> Result<(), Denied> {
        if !self.allow_ips.is_empty() {
            let allowed = peer
                .map(|ip| ip.to_canonical())
                .is_some_and(|ip| self.allow_ips.iter().any(|a| a.to_canonical() == ip));
            if !allowed {
                return Err(Denied::Forbidden);
            }
        }

        let Some(secret) = &self.secret else {
            return Err(Denied::Unauthorized);
        };
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(bearer_token)
            .ok_or(Denied::Unauthorized)?;
        if constant_time_eq(token.as_bytes(), secret.expose_secret().as_bytes()) {
            Ok(())
        } else {
            Err(Denied::Unauthorized)
        }
    }
}

fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Middleware guarding the submission routes
pub async fn require_auth(
    State(state): State<Arc<ServerState>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    match state.auth.check(request.headers(), peer) {
        Ok(()) => next.run(request).await,
        Err(denied) => {
            warn!("Rejected {} {} from {:?}: {:?}", request.method(), request.uri(), peer, denied);
            denied.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(auth: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_str(auth).unwrap());
        headers
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("bearer  abc "), Some("abc"));
        assert_eq!(bearer_token("Basic abc"), None);
        assert_eq!(bearer_token("Bearer "), None);
    }

    #[test]
    fn test_secret_required() {
        let policy = AuthPolicy::new(Some("s3cret".to_string().into()), vec![]);
        assert_eq!(policy.check(&headers("Bearer s3cret"), None), Ok(()));
        assert_eq!(policy.check(&headers("Bearer s3cre"), None), Err(Denied::Unauthorized));
        assert_eq!(policy.check(&HeaderMap::new(), None), Err(Denied::Unauthorized));

        let open = AuthPolicy::default();
        assert_eq!(open.check(&headers("Bearer anything"), None), Err(Denied::Unauthorized));
    }

    #[test]
    fn test_allow_list() {
        let policy = AuthPolicy::new(
            Some("s3cret".to_string().into()),
            vec!["10.0.0.7".parse().unwrap()],
        );
        let ok = headers("Bearer s3cret");
        assert_eq!(policy.check(&ok, Some("10.0.0.7".parse().unwrap())), Ok(()));
        assert_eq!(policy.check(&ok, Some("::ffff:10.0.0.7".parse().unwrap())), Ok(()));
        assert_eq!(policy.check(&ok, Some("10.0.0.8".parse().unwrap())), Err(Denied::Forbidden));
        assert_eq!(policy.check(&ok, None), Err(Denied::Forbidden));
    }

    #[test]
    fn test_from_settings_rejects_bad_ip() {
        let settings = Settings {
            allow_ips: vec!["10.0.0.300".into()],
            ..Default::default()
        };
        assert!(AuthPolicy::from_settings(&settings).is_err());
    }
}
