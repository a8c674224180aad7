//! Request Handlers (spec §6.1). Every handler is synchronous from the
//! caller's perspective and finishes well under the ~10s budget spec §5
//! mandates — no polling loops live here; long-running provisioning/seeding
//! is only ever observed later via the Reconciler.

use axum::extract::{Extension, State};
use axum::Json;
use chrono::Utc;

use crate::config::AppState;
use crate::error::{Error, Result};
use crate::scheduler::{self, SubmitParams};
use crate::store::model::Candidate;

use super::dto::*;

pub async fn me(State(state): State<AppState>, Extension(candidate): Extension<Candidate>) -> Result<Json<MeResponse>> {
    let vms = state.store.list_vms_for(&candidate.email).await?;
    let spent_cents = scheduler::compute_spent(&vms, candidate.spent_reset_at, Utc::now());
    Ok(Json(MeResponse {
        email: candidate.email,
        name: candidate.name,
        role: format!("{:?}", candidate.role).to_lowercase(),
        quota_dollars: candidate.quota_dollars,
        spent_cents,
    }))
}

pub async fn gpu_types(State(state): State<AppState>) -> Result<Json<GpuTypesResponse>> {
    let capacities = state.provider.list_instance_types().await?;
    let mut all_regions: Vec<String> = Vec::new();
    let types = capacities
        .into_iter()
        .map(|c| {
            for r in &c.regions {
                if !all_regions.contains(r) {
                    all_regions.push(r.clone());
                }
            }
            GpuTypeEntry {
                name: c.name,
                description: c.description,
                price_cents_per_hour: c.price_cents_per_hour,
                regions: c.regions,
            }
        })
        .collect();
    Ok(Json(GpuTypesResponse {
        types,
        all_regions,
    }))
}

/// GET /api/vms — "performs opportunistic refresh": best-effort single
/// upstream lookup per active VM so the caller doesn't have to wait for the
/// next Reconciler tick to see a freshly-launched instance's IP address.
pub async fn list_vms(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
) -> Result<Json<Vec<VmResponse>>> {
    let mut vms = if candidate.is_admin() {
        state.store.list_vms().await?
    } else {
        state.store.list_vms_for(&candidate.email).await?
    };
    vms.retain(|vm| !vm.is_loader);

    for vm in vms.iter_mut().filter(|vm| vm.is_active()) {
        if let Ok(upstream) = state.provider.get_instance(&vm.instance_id).await {
            vm.ip_address = upstream.ip;
        }
    }

    Ok(Json(vms.iter().map(VmResponse::from).collect()))
}

pub async fn launch_vm(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
    Json(body): Json<LaunchVmRequest>,
) -> Result<(axum::http::StatusCode, Json<LaunchRequestResponse>)> {
    if body.ssh_public_key.trim().is_empty() {
        return Err(Error::Validation("sshPublicKey is required".into()));
    }
    let gpu_types = state.provider.list_instance_types().await?;
    if !gpu_types.iter().any(|t| t.name == body.instance_type) {
        return Err(Error::Validation(format!("unknown instance type {}", body.instance_type)));
    }

    // "Immediate single-shot launch" (spec §6.1): attempts dispatch right now
    // and only right now -- no capacity surfaces as `CapacityUnavailable`
    // rather than silently falling back to the queue-able path.
    let request = scheduler::launch_immediate(
        &state,
        &candidate,
        SubmitParams {
            instance_types: vec![body.instance_type],
            regions: vec![body.region],
            ssh_public_key: body.ssh_public_key,
            attach_filesystem: body.attach_filesystem,
        },
    )
    .await?;

    Ok((axum::http::StatusCode::CREATED, Json(LaunchRequestResponse::from(&request))))
}

pub async fn terminate_vm(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
    Json(body): Json<InstanceIdRequest>,
) -> Result<Json<VmResponse>> {
    let mut vm = state
        .store
        .get_vm(&body.instance_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("vm {}", body.instance_id)))?;

    if !candidate.is_admin() && vm.candidate_email.to_lowercase() != candidate.email.to_lowercase() {
        return Err(Error::Forbidden("not your VM".into()));
    }
    if !vm.is_active() {
        // Idempotent (P7): terminating an already-terminated VM is a
        // well-formed error, the record is left untouched.
        return Err(Error::Conflict("VM is already terminated".into()));
    }

    state.provider.terminate(&[vm.instance_id.clone()]).await?;

    let now = Utc::now();
    vm.accrued_cents = scheduler::accrued_cents(&vm, now);
    vm.terminated_at = Some(now);
    vm.termination_reason = Some(crate::store::model::TerminationReason::UserRequested);
    vm.status = crate::store::model::VmStatus::Terminated;
    state.store.put_vm(&vm).await?;

    let still_active = state
        .store
        .list_vms_for(&vm.candidate_email)
        .await?
        .iter()
        .any(|v| v.is_active() && !v.is_loader);
    if !still_active {
        if let Some(key) = state.store.get_ssh_key(&vm.candidate_email, &vm.ssh_key_name).await? {
            if state.provider.delete_ssh_key(&key.upstream_id).await.is_ok() {
                state.store.delete_ssh_key(&vm.candidate_email, &vm.ssh_key_name).await?;
            }
        }
    }

    Ok(Json(VmResponse::from(&vm)))
}

pub async fn restart_vm(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
    Json(body): Json<InstanceIdRequest>,
) -> Result<Json<VmResponse>> {
    let mut vm = state
        .store
        .get_vm(&body.instance_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("vm {}", body.instance_id)))?;

    if !candidate.is_admin() && vm.candidate_email.to_lowercase() != candidate.email.to_lowercase() {
        return Err(Error::Forbidden("not your VM".into()));
    }
    if !vm.is_active() {
        return Err(Error::Conflict("VM is terminated".into()));
    }

    state.provider.restart(&vm.instance_id).await?;
    vm.status = crate::store::model::VmStatus::Restarting;
    vm.last_checked_at = Utc::now();
    state.store.put_vm(&vm).await?;
    Ok(Json(VmResponse::from(&vm)))
}

pub async fn list_filesystems(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
) -> Result<Json<Vec<FilesystemEntryResponse>>> {
    let all = state.provider.list_filesystems().await?;
    let filtered: Vec<_> = if candidate.is_admin() {
        all
    } else {
        let prefix = format!("fs-{}", crate::fs_resolver::ssh_key_name(&candidate.email).trim_start_matches("web-"));
        all.into_iter().filter(|f| f.name.starts_with(&prefix)).collect()
    };
    Ok(Json(
        filtered
            .into_iter()
            .map(|f| FilesystemEntryResponse {
                id: f.id,
                name: f.name,
                region: f.region.name,
            })
            .collect(),
    ))
}

pub async fn list_launch_requests(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
) -> Result<Json<Vec<LaunchRequestResponse>>> {
    let requests = if candidate.is_admin() {
        state.store.list_launch_requests().await?
    } else {
        state.store.list_launch_requests_for(&candidate.email).await?
    };
    Ok(Json(requests.iter().map(LaunchRequestResponse::from).collect()))
}

pub async fn submit_launch_request(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
    Json(body): Json<SubmitLaunchRequestBody>,
) -> Result<(axum::http::StatusCode, Json<LaunchRequestResponse>)> {
    if body.instance_types.is_empty() || body.regions.is_empty() {
        return Err(Error::Validation("instanceTypes and regions must be non-empty".into()));
    }
    if body.ssh_public_key.trim().is_empty() {
        return Err(Error::Validation("sshPublicKey is required".into()));
    }
    let gpu_types = state.provider.list_instance_types().await?;
    for t in &body.instance_types {
        if !gpu_types.iter().any(|g| &g.name == t) {
            return Err(Error::Validation(format!("unknown instance type {t}")));
        }
    }

    let request = scheduler::submit_launch_request(
        &state,
        &candidate,
        SubmitParams {
            instance_types: body.instance_types,
            regions: body.regions,
            ssh_public_key: body.ssh_public_key,
            attach_filesystem: body.attach_filesystem,
        },
    )
    .await?;

    let status = match request.status {
        crate::store::model::LaunchRequestStatus::Fulfilled => axum::http::StatusCode::CREATED,
        _ => axum::http::StatusCode::ACCEPTED,
    };
    Ok((status, Json(LaunchRequestResponse::from(&request))))
}

pub async fn cancel_launch_request(
    State(state): State<AppState>,
    Extension(candidate): Extension<Candidate>,
    Json(body): Json<CancelLaunchRequestBody>,
) -> Result<Json<LaunchRequestResponse>> {
    let request = scheduler::cancel_launch_request(&state, &candidate, &body.id).await?;
    Ok(Json(LaunchRequestResponse::from(&request)))
}

/// POST /api/seed-complete — loader VM -> control plane callback (spec §4.3
/// "Seed completion endpoint", §6.3). Authenticated by the bearer
/// `seedCompleteSecret`, not by JWT — this endpoint is intentionally
/// excluded from the `require_candidate` middleware stack in `server.rs`.
pub async fn seed_complete(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    Json(body): Json<SeedCompleteRequest>,
) -> Result<axum::http::StatusCode> {
    let settings = state
        .store
        .get_settings()
        .await?
        .ok_or_else(|| Error::ConfigError("settings not configured".into()))?;

    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::Unauthenticated)?;
    if token != settings.seed_complete_secret {
        return Err(Error::Unauthenticated);
    }

    let Some(mut status) = state
        .store
        .get_seed_status(&body.filesystem_name, &body.region)
        .await?
    else {
        return Err(Error::NotFound("seed status".into()));
    };

    // Idempotent: a second report still returns 200.
    status.status = crate::store::model::SeedState::Ready;
    status.completed_at = Some(Utc::now());
    state.store.put_seed_status(&status).await?;

    Ok(axum::http::StatusCode::OK)
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[cfg(feature = "metrics")]
pub async fn metrics(State(state): State<AppState>) -> String {
    state.metrics.encode().await
}
