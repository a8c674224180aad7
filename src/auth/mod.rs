//! Bearer-JWT authentication (spec §6.1: "`Authorization: Bearer <jwt>`
//! header verified against a remote JWKS; the verified email resolves to a
//! Candidate").
//!
//! The teacher has no auth layer to generalize (its API is unauthenticated,
//! cluster-internal), so this is grounded on the broader retrieval pack's
//! convention of `jsonwebtoken` + a JWKS cache behind a TTL-checked
//! `tokio::sync::RwLock`, composed in the teacher's own `tower`/axum-middleware
//! idiom (`from_fn_with_state`, matching how `rest_api/server.rs` layers
//! `TraceLayer::new_for_http()` onto the router).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::http::HeaderMap;
use axum::middleware::Next;
use axum::response::Response;
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::config::AppState;
use crate::error::Error;
use crate::store::model::{Candidate, CandidateRole};

#[derive(Debug, Deserialize)]
struct Claims {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

#[derive(Deserialize)]
struct JwksResponse {
    keys: Vec<Jwk>,
}

#[derive(Deserialize, Clone)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

struct CachedJwks {
    keys: HashMap<String, Jwk>,
    fetched_at: Instant,
}

/// Caches the JWKS document for up to five minutes rather than fetching it
/// on every request.
pub struct JwksCache {
    jwks_url: String,
    http: reqwest::Client,
    cache: RwLock<Option<CachedJwks>>,
}

impl JwksCache {
    pub fn new(jwks_url: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            jwks_url: jwks_url.into(),
            http: reqwest::Client::new(),
            cache: RwLock::new(None),
        })
    }

    async fn keys(&self) -> Result<HashMap<String, Jwk>, Error> {
        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.fetched_at.elapsed() < Duration::from_secs(300) {
                    return Ok(cached.keys.clone());
                }
            }
        }
        let resp: JwksResponse = self
            .http
            .get(&self.jwks_url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(format!("jwks fetch: {e}")))?
            .json()
            .await
            .map_err(|e| Error::UpstreamPermanent(format!("jwks parse: {e}")))?;
        let keys: HashMap<String, Jwk> = resp.keys.into_iter().map(|k| (k.kid.clone(), k)).collect();
        let mut guard = self.cache.write().await;
        *guard = Some(CachedJwks {
            keys: keys.clone(),
            fetched_at: Instant::now(),
        });
        Ok(keys)
    }
}

async fn verify(cache: &JwksCache, token: &str) -> Result<Claims, Error> {
    let header = decode_header(token).map_err(|_| Error::Unauthenticated)?;
    let kid = header.kid.ok_or(Error::Unauthenticated)?;
    let keys = cache.keys().await?;
    let jwk = keys.get(&kid).ok_or(Error::Unauthenticated)?;
    let decoding_key =
        DecodingKey::from_rsa_components(&jwk.n, &jwk.e).map_err(|_| Error::Unauthenticated)?;
    let mut validation = Validation::new(Algorithm::RS256);
    validation.validate_exp = true;
    let data = decode::<Claims>(token, &decoding_key, &validation).map_err(|_| Error::Unauthenticated)?;
    Ok(data.claims)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Resolves a verified email into a `Candidate`, auto-bootstrapping the
/// first sign-in of a configured admin email per Design Note O4: "the first
/// successful sign-in of a listed email creates an admin Candidate with
/// quotaDollars=9999; this is an intentional bootstrap path."
async fn resolve_candidate(state: &AppState, email: &str, name: Option<&str>) -> Result<Candidate, Error> {
    if let Some(existing) = state.store.get_candidate(email).await? {
        return Ok(existing);
    }
    if state.config.admin_emails.iter().any(|e| e.eq_ignore_ascii_case(email)) {
        let candidate = Candidate {
            email: email.to_lowercase(),
            name: name.unwrap_or(email).to_string(),
            role: CandidateRole::Admin,
            quota_dollars: 9999,
            spent_cents: 0,
            added_at: chrono::Utc::now(),
            added_by: "auto-bootstrap".to_string(),
            spent_reset_at: None,
            deactivated_at: None,
        };
        state.store.put_candidate(&candidate).await?;
        return Ok(candidate);
    }
    Err(Error::Forbidden("not on the allow-list".to_string()))
}

/// Axum middleware: verifies the bearer JWT, resolves/bootstraps the
/// Candidate, rejects deactivated candidates, and inserts the Candidate as
/// a request extension for downstream extractors.
pub async fn require_candidate(
    State(state): State<AppState>,
    headers: HeaderMap,
    mut req: axum::extract::Request,
    next: Next,
) -> Result<Response, Error> {
    let token = bearer_token(&headers).ok_or(Error::Unauthenticated)?;
    let claims = verify(&state.jwks, token).await?;
    let candidate = resolve_candidate(&state, &claims.email, claims.name.as_deref()).await?;
    if !candidate.is_active() {
        return Err(Error::Forbidden("deactivated".to_string()));
    }
    req.extensions_mut().insert(candidate);
    Ok(next.run(req).await)
}
