//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info};

use crate::jobs::JobRequest;
use crate::server::state::ServerState;
use crate::utils::version_info;

/// Header carrying the URL job logs are pushed to
pub const CALLBACK_HEADER: &str = "x-callback";

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "hostrunner".to_string(),
        version: version.version,
    })
}

/// Query string of a job submission
#[derive(Debug, Default, Deserialize)]
pub struct SubmitQuery {
    pub domain: Option<String>,
    pub sandbox: Option<String>,
}

fn parse_sandbox(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        Some("true") => true,
        Some(v) => v.parse::<i64>().is_ok_and(|n| n != 0),
        None => false,
    }
}

/// Accept a deployment and hand it to a detached job process
pub async fn submit_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<SubmitQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    state.activity_tracker.touch();

    let Some(domain) = query
        .domain
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
    else {
        return (StatusCode::BAD_REQUEST, "domain is required".to_string());
    };

    let body = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        match serde_json::from_slice::<Value>(&body) {
            Ok(body) => body,
            Err(e) => return (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")),
        }
    };

    let job = JobRequest {
        body,
        domain: domain.to_string(),
        sandbox: parse_sandbox(query.sandbox.as_deref()),
        callback: headers
            .get(CALLBACK_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };
    info!(
        "Accepted job for {} (sandbox: {}, callback: {})",
        job.domain,
        job.sandbox,
        job.callback.is_some()
    );

    match state.launcher.launch(&job).await {
        Ok(()) => (StatusCode::OK, "OK".to_string()),
        Err(e) => {
            error!("Failed to launch job for {}: {}", job.domain, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to launch job: {e}"),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sandbox() {
        assert!(!parse_sandbox(None));
        assert!(!parse_sandbox(Some("0")));
        assert!(!parse_sandbox(Some("")));
        assert!(!parse_sandbox(Some("no")));
        assert!(parse_sandbox(Some("1")));
        assert!(parse_sandbox(Some("true")));
    }
}
