//! Reconciler pass tests (spec §4.4/§8): sync & accrual, quota enforcement,
//! and stale seed-claim cleanup, all driven directly against the pass
//! functions' public entry point (`reconciler::run` is an infinite loop, so
//! tests exercise one tick's worth of work by calling the library straight
//! through the scheduler/store instead of spinning up the ticker).

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::{test_candidate, test_capacity, test_state, MockProviderClient};
use gpu_fleet_operator::store::model::{SeedState, SeedStatus, Vm, VmStatus};

#[tokio::test]
async fn quota_exceeding_spend_terminates_active_vms() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;

    let mut candidate = test_candidate("frank@example.org", 1);
    // Already over budget going into this tick.
    candidate.spent_cents = 1_000_000;
    state.store.put_candidate(&candidate).await.unwrap();

    let instance_id = state
        .provider
        .launch(gpu_fleet_operator::provider::LaunchParams {
            instance_type: "gpu_1x_a100".to_string(),
            region: "us-west-1".to_string(),
            ssh_key_names: vec![],
            filesystem_names: vec![],
            user_data: String::new(),
        })
        .await
        .unwrap();

    let now = Utc::now();
    state
        .store
        .put_vm(&Vm {
            instance_id: instance_id.clone(),
            candidate_email: candidate.email.clone(),
            instance_type: "gpu_1x_a100".to_string(),
            region: "us-west-1".to_string(),
            price_cents_per_hour: 200,
            launched_at: now - ChronoDuration::minutes(10),
            status: VmStatus::Running,
            ip_address: None,
            ssh_key_name: "web-frank-example-org".to_string(),
            terminated_at: None,
            termination_reason: None,
            last_checked_at: now,
            accrued_cents: 0,
            is_loader: false,
        })
        .await
        .unwrap();

    gpu_fleet_operator::reconciler::run_once(&state).await;

    let vm = state.store.get_vm(&instance_id).await.unwrap().unwrap();
    assert!(!vm.is_active());
    assert_eq!(
        vm.termination_reason,
        Some(gpu_fleet_operator::store::model::TerminationReason::QuotaExceeded)
    );
}

#[tokio::test]
async fn stale_seed_claim_is_reaped() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;

    state
        .store
        .put_seed_status(&SeedStatus {
            filesystem_name: "shared-dataset".to_string(),
            region: "us-west-1".to_string(),
            status: SeedState::Seeding,
            seeding_instance_id: None,
            claimed_at: Some(Utc::now() - ChronoDuration::minutes(90)),
            completed_at: None,
        })
        .await
        .unwrap();

    gpu_fleet_operator::reconciler::run_once(&state).await;

    let status = state
        .store
        .get_seed_status("shared-dataset", "us-west-1")
        .await
        .unwrap();
    assert!(status.is_none());
}

#[tokio::test]
async fn fresh_seed_claim_survives_a_tick() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;

    state
        .store
        .put_seed_status(&SeedStatus {
            filesystem_name: "shared-dataset".to_string(),
            region: "us-west-1".to_string(),
            status: SeedState::Seeding,
            seeding_instance_id: None,
            claimed_at: Some(Utc::now() - ChronoDuration::minutes(5)),
            completed_at: None,
        })
        .await
        .unwrap();

    gpu_fleet_operator::reconciler::run_once(&state).await;

    let status = state
        .store
        .get_seed_status("shared-dataset", "us-west-1")
        .await
        .unwrap();
    assert!(status.is_some());
}
