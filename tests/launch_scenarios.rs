//! End-to-end scenario tests (spec §8): scheduler admission/dispatch driven
//! against a `MemoryStore` + `MockProviderClient`, no real network calls.

mod common;

use common::{test_candidate, test_capacity, test_state, MockProviderClient};
use gpu_fleet_operator::scheduler::{self, SubmitParams};
use gpu_fleet_operator::store::model::LaunchRequestStatus;

fn submit_params(instance_type: &str, region: &str) -> SubmitParams {
    SubmitParams {
        instance_types: vec![instance_type.to_string()],
        regions: vec![region.to_string()],
        ssh_public_key: "ssh-ed25519 AAAA...".to_string(),
        attach_filesystem: false,
    }
}

#[tokio::test]
async fn immediate_launch_when_capacity_is_available() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("alice@example.org", 100);
    state.store.put_candidate(&candidate).await.unwrap();

    let request = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_1x_a100", "us-west-1"))
        .await
        .unwrap();

    assert_eq!(request.status, LaunchRequestStatus::Fulfilled);
    assert!(request.fulfilled_instance_id.is_some());

    let vms = state.store.list_vms_for(&candidate.email).await.unwrap();
    assert_eq!(vms.len(), 1);
    assert_eq!(vms[0].instance_type, "gpu_1x_a100");
}

#[tokio::test]
async fn queues_then_fulfills_on_next_dispatch() {
    // No capacity at submit time.
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("bob@example.org", 100);
    state.store.put_candidate(&candidate).await.unwrap();

    let request = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_8x_h100", "us-east-1"))
        .await
        .unwrap();
    assert_eq!(request.status, LaunchRequestStatus::Queued);

    // Capacity for the requested type/region shows up; the next dispatch
    // pass should pick the queued request up.
    let provider2 = MockProviderClient::new(vec![
        test_capacity("gpu_1x_a100", 200, &["us-west-1"]),
        test_capacity("gpu_8x_h100", 1800, &["us-east-1"]),
    ]);
    let state2 = gpu_fleet_operator::config::AppState {
        config: state.config.clone(),
        store: state.store.clone(),
        provider: provider2,
        jwks: state.jwks.clone(),
        #[cfg(feature = "metrics")]
        metrics: state.metrics.clone(),
    };

    scheduler::dispatch_one(&state2, &request.id).await.unwrap();

    let updated = state2.store.get_launch_request(&request.id).await.unwrap().unwrap();
    assert_eq!(updated.status, LaunchRequestStatus::Fulfilled);
    assert_eq!(updated.attempts, 1);
}

#[tokio::test]
async fn cancel_removes_a_queued_request() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("carol@example.org", 100);
    state.store.put_candidate(&candidate).await.unwrap();

    let request = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_8x_h100", "us-east-1"))
        .await
        .unwrap();
    assert_eq!(request.status, LaunchRequestStatus::Queued);

    let cancelled = scheduler::cancel_launch_request(&state, &candidate, &request.id)
        .await
        .unwrap();
    assert_eq!(cancelled.status, LaunchRequestStatus::Cancelled);

    // Cancelling twice is rejected, not silently accepted.
    let err = scheduler::cancel_launch_request(&state, &candidate, &request.id)
        .await
        .unwrap_err();
    assert!(matches!(err, gpu_fleet_operator::Error::Validation(_)));
}

#[tokio::test]
async fn quota_exhaustion_blocks_admission() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 10_000, &["us-west-1"])]);
    let state = test_state(provider).await;
    // $1 quota, cheapest instance is $100/hr -- can't possibly afford it.
    let candidate = test_candidate("dave@example.org", 1);
    state.store.put_candidate(&candidate).await.unwrap();

    let err = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_1x_a100", "us-west-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, gpu_fleet_operator::Error::QuotaExhausted));
}

#[tokio::test]
async fn candidate_may_not_hold_two_active_vms() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("erin@example.org", 1000);
    state.store.put_candidate(&candidate).await.unwrap();

    let first = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_1x_a100", "us-west-1"))
        .await
        .unwrap();
    assert_eq!(first.status, LaunchRequestStatus::Fulfilled);

    let err = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_1x_a100", "us-west-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, gpu_fleet_operator::Error::Conflict(_)));
}

#[tokio::test]
async fn immediate_launch_fails_fast_without_enqueuing() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("grace@example.org", 100);
    state.store.put_candidate(&candidate).await.unwrap();

    // No capacity for this type/region pair -- "immediate single-shot
    // launch" must fail fast, not fall back to a persisted `queued` request.
    let err = scheduler::launch_immediate(&state, &candidate, submit_params("gpu_8x_h100", "us-east-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, gpu_fleet_operator::Error::CapacityUnavailable));

    let requests = state
        .store
        .list_launch_requests_for(&candidate.email)
        .await
        .unwrap();
    assert!(requests.is_empty(), "a failed immediate launch must not persist anything");

    // With nothing persisted, a subsequent queue-able submission is not
    // blocked by the one-in-flight-request guard (P2).
    let queued = scheduler::submit_launch_request(&state, &candidate, submit_params("gpu_8x_h100", "us-east-1"))
        .await
        .unwrap();
    assert_eq!(queued.status, LaunchRequestStatus::Queued);
}

#[tokio::test]
async fn immediate_launch_succeeds_when_capacity_is_available() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let candidate = test_candidate("heidi@example.org", 100);
    state.store.put_candidate(&candidate).await.unwrap();

    let request = scheduler::launch_immediate(&state, &candidate, submit_params("gpu_1x_a100", "us-west-1"))
        .await
        .unwrap();
    assert_eq!(request.status, LaunchRequestStatus::Fulfilled);
    assert!(request.fulfilled_instance_id.is_some());
}
