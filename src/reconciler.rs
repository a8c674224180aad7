//! Reconciler (spec §4.4): the scheduled tick that syncs local VM records
//! with upstream truth, accrues cost, enforces quotas, drains the launch
//! queue, and cleans up stale seed claims.
//!
//! The teacher anchors its control loop on a `kube::runtime::Controller`
//! watch stream — reconcile-per-object, triggered by the Kubernetes
//! apiserver. There is no equivalent event source here (the upstream GPU
//! provider offers no watch/webhook), so this generalizes to a plain
//! `tokio::time::interval` sweep over every record, which is the control
//! loop spec §4.4 actually asks for ("Runs every minute ... three passes").
//! The per-item try/log/continue idiom is carried forward unchanged from
//! `cleanup_stellar_node`'s `if let Err(e) = ... { warn!(...) }` chain.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::AppState;
use crate::scheduler;
use crate::store::model::{
    Candidate, LaunchRequestStatus, TerminationReason, Vm, VmStatus,
};

pub async fn run(state: AppState) {
    let mut ticker = tokio::time::interval(Duration::from_secs(state.config.reconcile_interval_secs));
    loop {
        ticker.tick().await;
        run_once(&state).await;
    }
}

/// Runs the three passes once. Factored out of `run`'s infinite loop so
/// tests can drive a single tick deterministically.
pub async fn run_once(state: &AppState) {
    info!("reconciler tick starting");
    let started = std::time::Instant::now();
    if let Err(e) = pass_a_sync_and_accrue(state).await {
        error!(error = %e, "pass A failed");
    }
    if let Err(e) = pass_b_dispatch_queue(state).await {
        error!(error = %e, "pass B failed");
    }
    if let Err(e) = pass_c_stale_seed_cleanup(state).await {
        error!(error = %e, "pass C failed");
    }
    #[cfg(feature = "metrics")]
    state.metrics.reconciler_tick_seconds.observe(started.elapsed().as_secs_f64());
    info!("reconciler tick complete");
}

/// Pass A — VM sync & cost accrual (spec §4.4 "Pass A").
async fn pass_a_sync_and_accrue(state: &AppState) -> crate::error::Result<()> {
    let upstream = state.provider.list_instances().await?;
    let upstream_by_id: HashMap<&str, _> = upstream.iter().map(|i| (i.id.as_str(), i)).collect();

    let local_vms = state.store.list_vms().await?;
    let now = Utc::now();
    let mut delta_by_candidate: HashMap<String, i64> = HashMap::new();
    let mut touched_candidates: HashMap<String, ()> = HashMap::new();

    for mut vm in local_vms.into_iter().filter(|v| v.is_active()) {
        let previous_accrued = vm.accrued_cents;
        match upstream_by_id.get(vm.instance_id.as_str()) {
            None => {
                vm.status = VmStatus::Terminated;
                vm.terminated_at = Some(now);
                vm.termination_reason = Some(TerminationReason::TerminatedExternally);
                vm.accrued_cents = scheduler::accrued_cents(&vm, now);
            }
            Some(upstream_vm) if upstream_vm.status.eq_ignore_ascii_case("terminated") => {
                vm.status = VmStatus::Terminated;
                vm.terminated_at = Some(now);
                vm.termination_reason = Some(TerminationReason::TerminatedExternally);
                vm.accrued_cents = scheduler::accrued_cents(&vm, now);
            }
            Some(upstream_vm) => {
                vm.ip_address = upstream_vm.ip.clone();
                vm.status = map_status(&upstream_vm.status);
                vm.accrued_cents = scheduler::accrued_cents(&vm, now);
            }
        }
        vm.last_checked_at = now;

        if !vm.is_loader {
            let delta = vm.accrued_cents - previous_accrued;
            *delta_by_candidate.entry(vm.candidate_email.clone()).or_insert(0) += delta;
            touched_candidates.insert(vm.candidate_email.clone(), ());
        }

        #[cfg(feature = "metrics")]
        if vm.termination_reason == Some(TerminationReason::TerminatedExternally) {
            state
                .metrics
                .vms_terminated_total
                .get_or_create(&crate::metrics::TerminationLabels {
                    reason: termination_reason_label(TerminationReason::TerminatedExternally),
                })
                .inc();
        }

        if let Err(e) = state.store.put_vm(&vm).await {
            warn!(instance_id = %vm.instance_id, error = %e, "failed to persist VM during sync");
        }
    }

    let mut to_terminate: Vec<String> = Vec::new();

    for email in touched_candidates.keys() {
        let candidate = state.store.get_candidate(email).await?;
        let delta = delta_by_candidate.get(email).copied().unwrap_or(0);

        let Some(mut candidate) = candidate else {
            to_terminate.extend(terminate_all_active(state, email, TerminationReason::AccountRemoved).await?);
            continue;
        };

        candidate.spent_cents += delta;
        if let Err(e) = state.store.put_candidate(&candidate).await {
            warn!(email, error = %e, "failed to persist candidate spend");
        }

        if !candidate.is_active() {
            to_terminate.extend(terminate_all_active(state, email, TerminationReason::AccountRemoved).await?);
            continue;
        }

        if !candidate.is_admin() && candidate.spent_cents >= candidate.quota_cents() {
            to_terminate.extend(terminate_all_active(state, email, TerminationReason::QuotaExceeded).await?);
            continue;
        }

        if let Some(max_hours) = settings_max_vm_hours(state).await? {
            to_terminate.extend(
                terminate_over_max_hours(state, &candidate, max_hours, now).await?,
            );
        }
    }

    if !to_terminate.is_empty() {
        if let Err(e) = state.provider.terminate(&to_terminate).await {
            warn!(error = %e, count = to_terminate.len(), "batched terminate failed, will retry next tick");
        }
    }

    cleanup_ssh_keys_for_idle_candidates(state).await?;

    Ok(())
}

async fn settings_max_vm_hours(state: &AppState) -> crate::error::Result<Option<f64>> {
    Ok(state.store.get_settings().await?.and_then(|s| s.max_vm_hours))
}

/// Optional administrative policy (Design Note O2): off by default, distinct
/// from the dollar-quota rule.
async fn terminate_over_max_hours(
    state: &AppState,
    candidate: &Candidate,
    max_hours: f64,
    now: chrono::DateTime<Utc>,
) -> crate::error::Result<Vec<String>> {
    let mut ids = Vec::new();
    for vm in state.store.list_vms_for(&candidate.email).await? {
        if !vm.is_active() {
            continue;
        }
        let hours = (now - vm.launched_at).num_minutes() as f64 / 60.0;
        if hours >= max_hours {
            ids.push(vm.instance_id.clone());
            mark_terminated(state, &vm.instance_id, TerminationReason::MaxHoursExceeded, now).await?;
        }
    }
    Ok(ids)
}

async fn terminate_all_active(
    state: &AppState,
    email: &str,
    reason: TerminationReason,
) -> crate::error::Result<Vec<String>> {
    let now = Utc::now();
    let mut ids = Vec::new();
    for vm in state.store.list_vms_for(email).await? {
        if vm.is_active() {
            ids.push(vm.instance_id.clone());
            mark_terminated(state, &vm.instance_id, reason, now).await?;
        }
    }
    Ok(ids)
}

async fn mark_terminated(
    state: &AppState,
    instance_id: &str,
    reason: TerminationReason,
    now: chrono::DateTime<Utc>,
) -> crate::error::Result<()> {
    if let Some(mut vm) = state.store.get_vm(instance_id).await? {
        if vm.is_active() {
            vm.accrued_cents = scheduler::accrued_cents(&vm, now);
            vm.terminated_at = Some(now);
            vm.termination_reason = Some(reason);
            vm.status = VmStatus::Terminated;
            state.store.put_vm(&vm).await?;
            #[cfg(feature = "metrics")]
            state
                .metrics
                .vms_terminated_total
                .get_or_create(&crate::metrics::TerminationLabels {
                    reason: termination_reason_label(reason),
                })
                .inc();
        }
    }
    Ok(())
}

#[cfg(feature = "metrics")]
fn termination_reason_label(reason: TerminationReason) -> crate::metrics::TerminationReasonLabel {
    use crate::metrics::TerminationReasonLabel as Label;
    match reason {
        TerminationReason::UserRequested => Label::UserRequested,
        TerminationReason::TerminatedExternally => Label::TerminatedExternally,
        TerminationReason::AccountRemoved => Label::AccountRemoved,
        TerminationReason::QuotaExceeded => Label::QuotaExceeded,
        TerminationReason::MaxHoursExceeded => Label::MaxHoursExceeded,
    }
}

fn map_status(upstream_status: &str) -> VmStatus {
    match upstream_status.to_ascii_lowercase().as_str() {
        "active" | "running" => VmStatus::Running,
        "booting" | "launching" => VmStatus::Launching,
        "restarting" => VmStatus::Restarting,
        _ => VmStatus::Running,
    }
}

async fn cleanup_ssh_keys_for_idle_candidates(state: &AppState) -> crate::error::Result<()> {
    let candidates = state.store.list_candidates().await?;
    for candidate in candidates {
        let has_active = state
            .store
            .list_vms_for(&candidate.email)
            .await?
            .iter()
            .any(|vm| vm.is_active() && !vm.is_loader);
        if has_active {
            continue;
        }
        let key_name = crate::fs_resolver::ssh_key_name(&candidate.email);
        if let Some(key) = state.store.get_ssh_key(&candidate.email, &key_name).await? {
            if let Err(e) = state.provider.delete_ssh_key(&key.upstream_id).await {
                warn!(email = %candidate.email, error = %e, "failed to delete upstream ssh key");
                continue;
            }
            state.store.delete_ssh_key(&candidate.email, &key_name).await?;
        }
    }
    Ok(())
}

/// Pass B — Launch queue processing (spec §4.2 "Dispatch").
async fn pass_b_dispatch_queue(state: &AppState) -> crate::error::Result<()> {
    let mut queued: Vec<_> = state
        .store
        .list_launch_requests()
        .await?
        .into_iter()
        .filter(|r| r.status == LaunchRequestStatus::Queued)
        .collect();
    queued.sort_by_key(|r| r.created_at);

    for request in queued {
        if let Err(e) = scheduler::dispatch_one(state, &request.id).await {
            warn!(request_id = %request.id, error = %e, "dispatch failed for launch request, will retry next tick");
        }
    }
    Ok(())
}

/// Pass C — stale seed-claim cleanup (spec §4.4 "Pass C").
async fn pass_c_stale_seed_cleanup(state: &AppState) -> crate::error::Result<()> {
    let now = Utc::now();
    for status in state.store.list_seed_statuses().await? {
        if status.status == crate::store::model::SeedState::Seeding {
            let age_minutes = status
                .claimed_at
                .map(|t| (now - t).num_minutes())
                .unwrap_or(0);
            if age_minutes >= 60 {
                state
                    .store
                    .delete_seed_status(&status.filesystem_name, &status.region)
                    .await?;
            }
        }
    }
    Ok(())
}
