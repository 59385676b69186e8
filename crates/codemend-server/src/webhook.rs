use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, http::StatusCode};
use codemend_core::types::RemediationEvent;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::AppState;

/// Repository topic that opts a repository into manual scans on
/// `repository.edited`.
pub const SCAN_TOPIC: &str = "codemend-scan";

// ── Entry point ───────────────────────────────────────────────────────────

/// Inbound GitHub webhook. Delivery guarantees belong to the sender; this
/// handler verifies the signature, routes by event name, and spawns the
/// actual work so the response returns promptly.
pub async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> StatusCode {
    let secret = &state.config.webhook_secret;
    if !secret.is_empty() && !verify_signature(&headers, &body, secret) {
        warn!("webhook signature verification failed");
        return StatusCode::UNAUTHORIZED;
    }

    let event = headers
        .get("x-github-event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    let payload: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!("webhook payload is not valid JSON: {e}");
            return StatusCode::BAD_REQUEST;
        }
    };
    let action = payload["action"].as_str().unwrap_or("");

    match (event.as_str(), action) {
        ("repository", "edited") => handle_repository_edited(&state, &payload),
        ("repository_dispatch", _) => handle_repository_dispatch(&state, &payload),
        ("workflow_job", "completed") => handle_workflow_job_completed(&state, &payload),
        ("installation", "created") => {
            let id = payload["installation"]["id"].as_i64().unwrap_or(0);
            info!("installation '{id}' created");
            StatusCode::OK
        }
        ("installation", "deleted") => handle_installation_deleted(&state, &payload),
        _ => {
            info!("ignoring webhook event '{event}' action '{action}'");
            StatusCode::OK
        }
    }
}

// ── Event handlers ────────────────────────────────────────────────────────

/// Manual scan trigger: only repositories whose topics carry the opt-in
/// scan topic are remediated, and no schedule bookkeeping happens.
fn handle_repository_edited(state: &Arc<AppState>, payload: &Value) -> StatusCode {
    if payload["installation"]["id"].as_i64().is_none() {
        warn!("installation id missing in 'repository.edited' event");
        return StatusCode::BAD_REQUEST;
    }
    let topics = payload["repository"]["topics"]
        .as_array()
        .cloned()
        .unwrap_or_default();
    if !topics.iter().any(|t| t.as_str() == Some(SCAN_TOPIC)) {
        info!("repository topics do not include the scan opt-in topic");
        return StatusCode::OK;
    }

    let Some(event) = event_from_repository(payload) else {
        return StatusCode::BAD_REQUEST;
    };
    info!(
        "manual scan triggered by {} over {}",
        event.owner, event.repo
    );

    let remediator = Arc::clone(&state.remediator);
    tokio::spawn(async move {
        match remediator.run_manual(&event).await {
            Ok(outcome) => info!("manual scan for {}/{}: {outcome:?}", event.owner, event.repo),
            Err(e) => error!("manual scan for {}/{} failed: {e}", event.owner, event.repo),
        }
    });
    StatusCode::ACCEPTED
}

/// Scheduled remediation trigger fired by the dispatch sweeper.
fn handle_repository_dispatch(state: &Arc<AppState>, payload: &Value) -> StatusCode {
    let Some(installation_id) = payload["installation"]["id"].as_i64() else {
        warn!("installation id missing in 'repository_dispatch' event");
        return StatusCode::BAD_REQUEST;
    };

    let default_branch = payload["repository"]["default_branch"]
        .as_str()
        .unwrap_or("main")
        .to_string();
    let dispatched_branch = payload["branch"].as_str().map(str::to_string);
    if let Some(branch) = &dispatched_branch {
        if branch != &default_branch {
            info!("dispatch for non-default branch {branch}, skipping");
            return StatusCode::OK;
        }
    }

    let owner = payload["client_payload"]["owner"].as_str().unwrap_or("");
    let repo = payload["client_payload"]["repo"].as_str().unwrap_or("");
    if owner.is_empty() || repo.is_empty() {
        warn!("owner/repo missing in dispatch client payload");
        return StatusCode::BAD_REQUEST;
    }

    let event = RemediationEvent {
        installation_id,
        owner: owner.to_string(),
        repo: repo.to_string(),
        default_branch,
        dispatched_branch,
    };

    let remediator = Arc::clone(&state.remediator);
    tokio::spawn(async move {
        match remediator.handle_event(&event).await {
            Ok(outcome) => info!(
                "remediation for {}/{}: {outcome:?}",
                event.owner, event.repo
            ),
            Err(e) => error!("remediation for {}/{} failed: {e}", event.owner, event.repo),
        }
    });
    StatusCode::ACCEPTED
}

/// A finished workflow job doubles as the sweep heartbeat.
fn handle_workflow_job_completed(state: &Arc<AppState>, payload: &Value) -> StatusCode {
    let repo = payload["repository"]["name"].as_str().unwrap_or("");
    info!("workflow event from repository {repo}, running dispatch sweep");

    let sweeper = Arc::clone(&state.sweeper);
    tokio::spawn(async move {
        if let Err(e) = sweeper.run_sweep().await {
            error!("dispatch sweep failed: {e}");
        }
    });
    StatusCode::ACCEPTED
}

/// Revoked installation: drop every schedule for the account.
fn handle_installation_deleted(state: &Arc<AppState>, payload: &Value) -> StatusCode {
    let id = payload["installation"]["id"].as_i64().unwrap_or(0);
    let owner = payload["installation"]["account"]["login"]
        .as_str()
        .unwrap_or("");
    if owner.is_empty() {
        warn!("account login missing in 'installation.deleted' event");
        return StatusCode::BAD_REQUEST;
    }

    match state.store.list_schedules_for_owner(owner) {
        Ok(records) => {
            for record in &records {
                if let Err(e) = state.store.remove_schedule(&record.owner, &record.repo) {
                    error!("removing schedule {}/{}: {e}", record.owner, record.repo);
                }
            }
            info!(
                "installation '{id}' deleted, removed {} schedule(s) for {owner}",
                records.len()
            );
            StatusCode::OK
        }
        Err(e) => {
            error!("listing schedules for {owner}: {e}");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

fn event_from_repository(payload: &Value) -> Option<RemediationEvent> {
    let owner = payload["repository"]["owner"]["login"].as_str()?;
    let repo = payload["repository"]["name"].as_str()?;
    Some(RemediationEvent {
        installation_id: payload["installation"]["id"].as_i64().unwrap_or(0),
        owner: owner.to_string(),
        repo: repo.to_string(),
        default_branch: payload["repository"]["default_branch"]
            .as_str()
            .unwrap_or("main")
            .to_string(),
        dispatched_branch: None,
    })
}

// ── Signature verification ────────────────────────────────────────────────

/// Verify the `X-Hub-Signature-256` header (HMAC-SHA256 over the raw body).
/// Fails closed when the header is missing or malformed.
fn verify_signature(headers: &HeaderMap, body: &str, secret: &str) -> bool {
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    type HmacSha256 = Hmac<Sha256>;

    let Some(sig) = headers
        .get("x-hub-signature-256")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("sha256="))
    else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body.as_bytes());
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(sig.as_bytes(), expected.as_bytes())
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use hmac::{Hmac, Mac};
    use sha2::Sha256;

    fn signed_headers(body: &str, secret: &str) -> HeaderMap {
        let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body.as_bytes());
        let sig = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", sig.parse().unwrap());
        headers
    }

    #[test]
    fn accepts_valid_signature() {
        let body = r#"{"action":"completed"}"#;
        let headers = signed_headers(body, "s3cret");
        assert!(verify_signature(&headers, body, "s3cret"));
    }

    #[test]
    fn rejects_wrong_secret() {
        let body = r#"{"action":"completed"}"#;
        let headers = signed_headers(body, "other");
        assert!(!verify_signature(&headers, body, "s3cret"));
    }

    #[test]
    fn rejects_missing_header() {
        assert!(!verify_signature(&HeaderMap::new(), "{}", "s3cret"));
    }

    #[test]
    fn rejects_tampered_body() {
        let body = r#"{"action":"completed"}"#;
        let headers = signed_headers(body, "s3cret");
        assert!(!verify_signature(&headers, r#"{"action":"deleted"}"#, "s3cret"));
    }
}
