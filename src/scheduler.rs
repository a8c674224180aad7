//! Launch-request scheduler (spec §4.2): admission, cancel, and dispatch.
//!
//! Shared between the synchronous HTTP path (`rest_api::handlers::submit_launch_request`,
//! which performs admission + one greedy immediate-dispatch attempt) and the
//! Reconciler's per-tick FIFO walk (`reconciler::pass_b_dispatch`), exactly as
//! spec §4.2 specifies: the matching/launch mechanics are identical, only
//! the surrounding state-machine bookkeeping differs.

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AppState;
use crate::error::{Error, Result};
use crate::fs_resolver;
use crate::provider::LaunchParams;
use crate::store::model::{
    Candidate, LaunchRequest, LaunchRequestStatus, SshKey, Vm, VmStatus,
};

/// `spentCents(email)` (spec §4.5): the sole source of truth for spend,
/// `candidate.spentCents` is only ever a cache the Reconciler refreshes.
pub fn compute_spent(vms: &[Vm], spent_reset_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> i64 {
    vms.iter()
        .filter(|vm| spent_reset_at.map(|reset| vm.launched_at >= reset).unwrap_or(true))
        .map(|vm| accrued_cents(vm, now))
        .sum()
}

pub fn accrued_cents(vm: &Vm, now: DateTime<Utc>) -> i64 {
    let end = vm.terminated_at.unwrap_or(now);
    let seconds = (end - vm.launched_at).num_seconds().max(0);
    let minutes = (seconds + 59) / 60; // ceil(seconds / 60)
    ((minutes * vm.price_cents_per_hour) + 59) / 60 // ceil(minutes * price / 60)
}

async fn current_spent_cents(state: &AppState, candidate: &Candidate) -> Result<i64> {
    let vms = state.store.list_vms_for(&candidate.email).await?;
    Ok(compute_spent(&vms, candidate.spent_reset_at, Utc::now()))
}

struct CapacityMatch {
    instance_type: String,
    region: String,
    price_cents_per_hour: i64,
}

/// Deterministic by caller-supplied ordering (spec §4.2 admission step 6b,
/// dispatch step 3): first `(type, region)` pair in `instanceTypes x regions`
/// order whose type has live capacity in that region.
async fn find_capacity(
    state: &AppState,
    instance_types: &[String],
    regions: &[String],
) -> Result<Option<CapacityMatch>> {
    let capacities = state.provider.list_instance_types().await?;
    for type_name in instance_types {
        let Some(cap) = capacities.iter().find(|c| &c.name == type_name) else {
            continue;
        };
        for region in regions {
            if cap.regions.iter().any(|r| r == region) {
                return Ok(Some(CapacityMatch {
                    instance_type: type_name.clone(),
                    region: region.clone(),
                    price_cents_per_hour: cap.price_cents_per_hour,
                }));
            }
        }
    }
    Ok(None)
}

pub struct SubmitParams {
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub ssh_public_key: String,
    pub attach_filesystem: bool,
}

/// Admission (spec §4.2 "Admission (submit)"), steps 1-7. Steps 1 (authenticate)
/// and 2 (validate instance types known / non-empty / ssh key present) are the
/// caller's responsibility (the HTTP handler); this function implements 3-7.
pub async fn submit_launch_request(
    state: &AppState,
    candidate: &Candidate,
    params: SubmitParams,
) -> Result<LaunchRequest> {
    if !candidate.is_admin() {
        let active_vms = state.store.list_vms_for(&candidate.email).await?;
        if active_vms.iter().any(|vm| vm.is_active() && !vm.is_loader) {
            return Err(Error::Conflict("candidate already has an active VM".into()));
        }
        let in_flight = state
            .store
            .list_launch_requests_for(&candidate.email)
            .await?;
        if in_flight.iter().any(|r| r.is_in_flight()) {
            return Err(Error::Conflict(
                "candidate already has a launch request in flight".into(),
            ));
        }
    }

    let capacities = state.provider.list_instance_types().await?;
    let cheapest = params
        .instance_types
        .iter()
        .filter_map(|t| capacities.iter().find(|c| &c.name == t))
        .map(|c| c.price_cents_per_hour)
        .min()
        .ok_or_else(|| Error::Validation("no known instance type in request".into()))?;

    if !candidate.is_admin() {
        let spent = current_spent_cents(state, candidate).await?;
        if candidate.quota_cents() - spent < cheapest {
            return Err(Error::QuotaExhausted);
        }
    }

    let ssh_key_name = fs_resolver::ssh_key_name(&candidate.email);
    ensure_ssh_key(state, candidate, &ssh_key_name, &params.ssh_public_key).await?;

    let now = Utc::now();
    let mut request = LaunchRequest {
        id: Uuid::new_v4().to_string(),
        candidate_email: candidate.email.clone(),
        instance_types: params.instance_types.clone(),
        regions: params.regions.clone(),
        ssh_public_key: params.ssh_public_key.clone(),
        attach_filesystem: params.attach_filesystem,
        status: LaunchRequestStatus::Queued,
        created_at: now,
        attempts: 0,
        last_attempt_at: None,
        fulfilled_at: None,
        fulfilled_instance_id: None,
        failure_reason: None,
        cancelled_at: None,
    };

    match try_launch_now(state, candidate, &request, &ssh_key_name).await {
        Ok(Some(vm)) => {
            request.status = LaunchRequestStatus::Fulfilled;
            request.fulfilled_at = Some(now);
            request.fulfilled_instance_id = Some(vm.instance_id.clone());
            #[cfg(feature = "metrics")]
            state.metrics.launch_requests_fulfilled_total.inc();
        }
        Ok(None) => {
            // No capacity right now: fall through to queued.
        }
        Err(e) => {
            warn!(error = %e, "immediate dispatch failed, falling back to queue");
        }
    }

    if request.status == LaunchRequestStatus::Queued {
        #[cfg(feature = "metrics")]
        state.metrics.launch_requests_queued_total.inc();
    }

    state.store.put_launch_request(&request).await?;
    Ok(request)
}

/// `POST /api/vms/launch` (spec §6.1: "immediate single-shot launch"), distinct
/// from `submit_launch_request`'s queue-able path above. Attempts dispatch
/// right now and only right now: no capacity means a `CapacityUnavailable`
/// error straight back to the caller, never a persisted `queued`
/// LaunchRequest that would then trip the one-in-flight-request guard (P2)
/// on the candidate's next call.
pub async fn launch_immediate(
    state: &AppState,
    candidate: &Candidate,
    params: SubmitParams,
) -> Result<LaunchRequest> {
    if !candidate.is_admin() {
        let active_vms = state.store.list_vms_for(&candidate.email).await?;
        if active_vms.iter().any(|vm| vm.is_active() && !vm.is_loader) {
            return Err(Error::Conflict("candidate already has an active VM".into()));
        }
        let in_flight = state
            .store
            .list_launch_requests_for(&candidate.email)
            .await?;
        if in_flight.iter().any(|r| r.is_in_flight()) {
            return Err(Error::Conflict(
                "candidate already has a launch request in flight".into(),
            ));
        }
    }

    let capacities = state.provider.list_instance_types().await?;
    let cheapest = params
        .instance_types
        .iter()
        .filter_map(|t| capacities.iter().find(|c| &c.name == t))
        .map(|c| c.price_cents_per_hour)
        .min()
        .ok_or_else(|| Error::Validation("no known instance type in request".into()))?;

    if !candidate.is_admin() {
        let spent = current_spent_cents(state, candidate).await?;
        if candidate.quota_cents() - spent < cheapest {
            return Err(Error::QuotaExhausted);
        }
    }

    let ssh_key_name = fs_resolver::ssh_key_name(&candidate.email);
    ensure_ssh_key(state, candidate, &ssh_key_name, &params.ssh_public_key).await?;

    let now = Utc::now();
    let mut request = LaunchRequest {
        id: Uuid::new_v4().to_string(),
        candidate_email: candidate.email.clone(),
        instance_types: params.instance_types.clone(),
        regions: params.regions.clone(),
        ssh_public_key: params.ssh_public_key.clone(),
        attach_filesystem: params.attach_filesystem,
        status: LaunchRequestStatus::Queued,
        created_at: now,
        attempts: 0,
        last_attempt_at: None,
        fulfilled_at: None,
        fulfilled_instance_id: None,
        failure_reason: None,
        cancelled_at: None,
    };

    // Unlike `submit_launch_request`, a capacity miss or dispatch error is
    // surfaced directly rather than falling through to `queued` -- nothing
    // is persisted unless the launch actually succeeds.
    let vm = try_launch_now(state, candidate, &request, &ssh_key_name)
        .await?
        .ok_or(Error::CapacityUnavailable)?;

    request.status = LaunchRequestStatus::Fulfilled;
    request.fulfilled_at = Some(now);
    request.fulfilled_instance_id = Some(vm.instance_id.clone());
    #[cfg(feature = "metrics")]
    state.metrics.launch_requests_fulfilled_total.inc();

    state.store.put_launch_request(&request).await?;
    Ok(request)
}

pub async fn cancel_launch_request(
    state: &AppState,
    candidate: &Candidate,
    request_id: &str,
) -> Result<LaunchRequest> {
    let mut request = state
        .store
        .get_launch_request(request_id)
        .await?
        .ok_or_else(|| Error::NotFound(format!("launch request {request_id}")))?;

    if !candidate.is_admin() && request.candidate_email.to_lowercase() != candidate.email.to_lowercase() {
        return Err(Error::Forbidden("not your launch request".into()));
    }
    if request.status != LaunchRequestStatus::Queued {
        return Err(Error::Validation(format!(
            "cannot cancel a request in state {:?}",
            request.status
        )));
    }

    request.status = LaunchRequestStatus::Cancelled;
    request.cancelled_at = Some(Utc::now());
    state.store.put_launch_request(&request).await?;
    Ok(request)
}

async fn ensure_ssh_key(
    state: &AppState,
    candidate: &Candidate,
    key_name: &str,
    public_key: &str,
) -> Result<()> {
    if state.store.get_ssh_key(&candidate.email, key_name).await?.is_some() {
        return Ok(());
    }
    // "Already in use" is tolerated as success by the Provider Client itself
    // (Design Note, §5 policy (d)).
    let upstream_id = state.provider.add_ssh_key(key_name, public_key).await?;
    state
        .store
        .put_ssh_key(&SshKey {
            email: candidate.email.clone(),
            key_name: key_name.to_string(),
            upstream_id,
            public_key: public_key.to_string(),
            registered_at: Utc::now(),
        })
        .await
}

/// Attempts to launch right now. Returns `Ok(None)` when there's simply no
/// capacity (caller should queue), `Err` for everything else.
async fn try_launch_now(
    state: &AppState,
    candidate: &Candidate,
    request: &LaunchRequest,
    ssh_key_name: &str,
) -> Result<Option<Vm>> {
    let Some(matched) = find_capacity(state, &request.instance_types, &request.regions).await? else {
        return Ok(None);
    };

    if !candidate.is_admin() {
        let spent = current_spent_cents(state, candidate).await?;
        if candidate.quota_cents() - spent < matched.price_cents_per_hour {
            return Err(Error::QuotaExhausted);
        }
    }

    let settings = state
        .store
        .get_settings()
        .await?
        .ok_or_else(|| Error::ConfigError("settings not configured".into()))?;

    let resolution = fs_resolver::resolve(
        &matched.region,
        &candidate.email,
        request.attach_filesystem,
        &settings,
        &state.config.app_base_url,
        &state.config.mount_root,
        &state.store,
        state.provider.as_ref(),
    )
    .await?;

    let user_data = fs_resolver::compose_user_data(&settings.setup_script, &resolution.readonly_remount_script);

    let instance_id = state
        .provider
        .launch(LaunchParams {
            instance_type: matched.instance_type.clone(),
            region: matched.region.clone(),
            ssh_key_names: vec![ssh_key_name.to_string()],
            filesystem_names: resolution.filesystem_names,
            user_data,
        })
        .await?;

    let now = Utc::now();
    let vm = Vm {
        instance_id: instance_id.clone(),
        candidate_email: candidate.email.clone(),
        instance_type: matched.instance_type,
        region: matched.region.clone(),
        price_cents_per_hour: matched.price_cents_per_hour,
        launched_at: now,
        status: VmStatus::Launching,
        ip_address: None,
        ssh_key_name: ssh_key_name.to_string(),
        terminated_at: None,
        termination_reason: None,
        last_checked_at: now,
        accrued_cents: 0,
        is_loader: false,
    };
    state.store.put_vm(&vm).await?;

    launch_loaders(state, &resolution.loader_vms, &matched.region).await;

    Ok(Some(vm))
}

/// Best-effort: loader VM launch failures are logged and swallowed — the
/// next SeedStatus claim attempt (from a later user VM) will retry (spec §4.3:
/// "both write to the same read-write-then-read-only filesystem" is
/// explicitly harmless).
async fn launch_loaders(state: &AppState, loaders: &[fs_resolver::LoaderVmSpec], fallback_region: &str) {
    if loaders.is_empty() {
        return;
    }
    let capacities = match state.provider.list_instance_types().await {
        Ok(c) => c,
        Err(e) => {
            warn!(error = %e, "could not fetch capacity for loader VM launch");
            return;
        }
    };
    let Some(cheapest) = capacities.iter().min_by_key(|c| c.price_cents_per_hour) else {
        warn!("no instance types available to launch loader VM");
        return;
    };

    for loader in loaders {
        let region = if cheapest.regions.iter().any(|r| r == &loader.region) {
            loader.region.clone()
        } else {
            fallback_region.to_string()
        };
        match state
            .provider
            .launch(LaunchParams {
                instance_type: cheapest.name.clone(),
                region,
                ssh_key_names: vec![],
                filesystem_names: vec![loader.filesystem_name.clone()],
                user_data: loader.user_data.clone(),
            })
            .await
        {
            Ok(instance_id) => {
                info!(filesystem = %loader.filesystem_name, region = %loader.region, %instance_id, "launched loader VM");
                let now = Utc::now();
                let _ = state
                    .store
                    .put_vm(&Vm {
                        instance_id,
                        candidate_email: "system:loader".to_string(),
                        instance_type: cheapest.name.clone(),
                        region: loader.region.clone(),
                        price_cents_per_hour: cheapest.price_cents_per_hour,
                        launched_at: now,
                        status: VmStatus::Launching,
                        ip_address: None,
                        ssh_key_name: String::new(),
                        terminated_at: None,
                        termination_reason: None,
                        last_checked_at: now,
                        accrued_cents: 0,
                        is_loader: true,
                    })
                    .await;
            }
            Err(e) => warn!(filesystem = %loader.filesystem_name, error = %e, "failed to launch loader VM"),
        }
    }
}

/// Dispatch (spec §4.2 "Dispatch (scheduler tick)"), steps 1-7. Called by the
/// Reconciler for each `queued` request, oldest `createdAt` first.
pub async fn dispatch_one(state: &AppState, request_id: &str) -> Result<()> {
    let Some(mut request) = state.store.get_launch_request(request_id).await? else {
        return Ok(());
    };
    if request.status != LaunchRequestStatus::Queued {
        return Ok(());
    }

    let candidate = state.store.get_candidate(&request.candidate_email).await?;
    let Some(candidate) = candidate else {
        request.status = LaunchRequestStatus::Cancelled;
        request.cancelled_at = Some(Utc::now());
        request.failure_reason = Some("candidate_deactivated".to_string());
        return state.store.put_launch_request(&request).await;
    };
    if !candidate.is_active() {
        request.status = LaunchRequestStatus::Cancelled;
        request.cancelled_at = Some(Utc::now());
        request.failure_reason = Some("candidate_deactivated".to_string());
        return state.store.put_launch_request(&request).await;
    }

    if !candidate.is_admin() {
        let active_vms = state.store.list_vms_for(&candidate.email).await?;
        if active_vms.iter().any(|vm| vm.is_active() && !vm.is_loader) {
            // Skip this tick, retry next cycle.
            return Ok(());
        }
    }

    let Some(matched) = find_capacity(state, &request.instance_types, &request.regions).await? else {
        request.attempts += 1;
        request.last_attempt_at = Some(Utc::now());
        return state.store.put_launch_request(&request).await;
    };

    if !candidate.is_admin() {
        let spent = current_spent_cents(state, &candidate).await?;
        if candidate.quota_cents() - spent < matched.price_cents_per_hour {
            request.status = LaunchRequestStatus::Failed;
            request.failure_reason = Some("insufficient_quota".to_string());
            return state.store.put_launch_request(&request).await;
        }
    }

    // Persist `provisioning` before launching so an overlapping tick doesn't
    // dispatch this request twice (spec §4.2 dispatch step 6).
    request.status = LaunchRequestStatus::Provisioning;
    request.attempts += 1;
    request.last_attempt_at = Some(Utc::now());
    state.store.put_launch_request(&request).await?;

    let ssh_key_name = fs_resolver::ssh_key_name(&candidate.email);
    match ensure_ssh_key(state, &candidate, &ssh_key_name, &request.ssh_public_key).await {
        Ok(()) => {}
        Err(e) => {
            warn!(error = %e, request_id = %request.id, "ssh key registration failed, returning to queue");
            request.status = LaunchRequestStatus::Queued;
            return state.store.put_launch_request(&request).await;
        }
    }

    match try_launch_now(state, &candidate, &request, &ssh_key_name).await {
        Ok(Some(vm)) => {
            request.status = LaunchRequestStatus::Fulfilled;
            request.fulfilled_at = Some(Utc::now());
            request.fulfilled_instance_id = Some(vm.instance_id);
            #[cfg(feature = "metrics")]
            state.metrics.launch_requests_fulfilled_total.inc();
        }
        Ok(None) => {
            // Capacity vanished between the check above and now: retry later.
            request.status = LaunchRequestStatus::Queued;
        }
        Err(Error::UpstreamPermanent(reason)) => {
            request.status = LaunchRequestStatus::Failed;
            request.failure_reason = Some(reason);
        }
        Err(e) => {
            warn!(error = %e, request_id = %request.id, "launch failed, returning to queue for retry");
            request.status = LaunchRequestStatus::Queued;
        }
    }

    state.store.put_launch_request(&request).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn vm_at(launched_minutes_ago: i64, price: i64, terminated_minutes_ago: Option<i64>) -> Vm {
        let now = Utc::now();
        Vm {
            instance_id: "i-1".into(),
            candidate_email: "a@b.com".into(),
            instance_type: "gpu_1x_a100".into(),
            region: "us-west-1".into(),
            price_cents_per_hour: price,
            launched_at: now - ChronoDuration::minutes(launched_minutes_ago),
            status: VmStatus::Running,
            ip_address: None,
            ssh_key_name: "web-a-b-com".into(),
            terminated_at: terminated_minutes_ago.map(|m| now - ChronoDuration::minutes(m)),
            termination_reason: None,
            last_checked_at: now,
            accrued_cents: 0,
            is_loader: false,
        }
    }

    #[test]
    fn accrual_matches_literal_scenario_4() {
        // 31 minutes at 200 cents/hr => ceil(31*200/60) = 104
        let vm = vm_at(31, 200, None);
        assert_eq!(accrued_cents(&vm, Utc::now()), 104);
    }

    #[test]
    fn spent_reset_excludes_old_vms() {
        let now = Utc::now();
        let reset_at = now - ChronoDuration::minutes(10);
        let old_vm = vm_at(60, 100, Some(30)); // launched before reset
        let vms = vec![old_vm];
        assert_eq!(compute_spent(&vms, Some(reset_at), now), 0);
    }

    #[test]
    fn spent_includes_vms_after_reset() {
        let now = Utc::now();
        let reset_at = now - ChronoDuration::minutes(120);
        let vm = vm_at(60, 100, None);
        let vms = vec![vm];
        assert!(compute_spent(&vms, Some(reset_at), now) > 0);
    }
}
