//! Admin-only endpoints (spec §6.1). Every handler here additionally checks
//! `candidate.is_admin()` — enforced by the `require_admin` middleware
//! layered only on the `/api/admin/*` and admin filesystem routes in
//! `server.rs`.

use axum::extract::{Extension, Query, State};
use axum::Json;
use chrono::Utc;

use crate::config::AppState;
use crate::error::{Error, Result};
use crate::store::model::{Candidate, CandidateRole};

use super::dto::*;

pub async fn require_admin(
    Extension(candidate): Extension<Candidate>,
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> Result<axum::response::Response> {
    if !candidate.is_admin() {
        return Err(Error::Forbidden("admin only".to_string()));
    }
    Ok(next.run(req).await)
}

pub async fn delete_filesystem(
    State(state): State<AppState>,
    Query(query): Query<FilesystemIdQuery>,
) -> Result<axum::http::StatusCode> {
    state.provider.delete_filesystem(&query.id).await?;
    Ok(axum::http::StatusCode::OK)
}

pub async fn list_candidates(State(state): State<AppState>) -> Result<Json<Vec<CandidateResponse>>> {
    let candidates = state.store.list_candidates().await?;
    Ok(Json(candidates.iter().map(CandidateResponse::from).collect()))
}

pub async fn add_candidate(
    State(state): State<AppState>,
    Extension(admin): Extension<Candidate>,
    Json(body): Json<AddCandidateRequest>,
) -> Result<(axum::http::StatusCode, Json<CandidateResponse>)> {
    let email = body.email.to_lowercase();
    let existing = state.store.get_candidate(&email).await?;

    // Re-adding a previously-removed candidate reactivates them and resets
    // their spend window (spec §3 Candidate lifecycle, scenario 6).
    let candidate = Candidate {
        email: email.clone(),
        name: body.name,
        role: existing.as_ref().map(|c| c.role).unwrap_or(CandidateRole::Candidate),
        quota_dollars: body.quota_dollars,
        spent_cents: 0,
        added_at: existing.as_ref().map(|c| c.added_at).unwrap_or_else(Utc::now),
        added_by: admin.email.clone(),
        spent_reset_at: Some(Utc::now()),
        deactivated_at: None,
    };
    state.store.put_candidate(&candidate).await?;
    Ok((axum::http::StatusCode::CREATED, Json(CandidateResponse::from(&candidate))))
}

pub async fn delete_candidate(
    State(state): State<AppState>,
    Query(query): Query<CandidateEmailQuery>,
) -> Result<axum::http::StatusCode> {
    let email = query.email.to_lowercase();
    let mut candidate = state
        .store
        .get_candidate(&email)
        .await?
        .ok_or_else(|| Error::NotFound(format!("candidate {email}")))?;
    // Deactivate, never delete (spec §3 Candidate lifecycle): the Reconciler
    // will terminate their active VMs on the next tick (Pass A,
    // `account_removed`).
    candidate.deactivated_at = Some(Utc::now());
    state.store.put_candidate(&candidate).await?;
    Ok(axum::http::StatusCode::OK)
}

pub async fn set_quota(
    State(state): State<AppState>,
    Json(body): Json<SetQuotaRequest>,
) -> Result<Json<CandidateResponse>> {
    let email = body.email.to_lowercase();
    let mut candidate = state
        .store
        .get_candidate(&email)
        .await?
        .ok_or_else(|| Error::NotFound(format!("candidate {email}")))?;
    candidate.quota_dollars = body.quota_dollars;
    state.store.put_candidate(&candidate).await?;
    Ok(Json(CandidateResponse::from(&candidate)))
}

pub async fn get_settings(State(state): State<AppState>) -> Result<Json<serde_json::Value>> {
    let settings = state
        .store
        .get_settings()
        .await?
        .ok_or_else(|| Error::NotFound("settings not configured".to_string()))?;
    Ok(Json(settings_response(&settings)))
}

pub async fn put_settings(
    State(state): State<AppState>,
    Json(body): Json<crate::store::model::Settings>,
) -> Result<Json<serde_json::Value>> {
    let existing = state.store.get_settings().await?;
    // A normal GET -> edit -> PUT round-trip carries the masked placeholders
    // (`****1234`, `***`) right back for any secret field the admin didn't
    // touch; reconcile against the stored record so that doesn't clobber the
    // real API key / seed secret / filesystem credentials.
    let mut settings = match &existing {
        Some(existing) => crate::store::model::Settings::reconcile_masked_secrets(body, existing),
        None => body,
    };
    if settings.seed_complete_secret.is_empty() {
        settings.seed_complete_secret = generate_secret();
    }
    state.store.put_settings(&settings).await?;
    Ok(Json(settings_response(&settings)))
}

fn generate_secret() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
