//! Shared filesystem resolution + seed lock scenarios (spec §4.3, §8): a
//! first launch into a region with no existing shared filesystem should
//! create it and claim the seed lock (launching a loader VM); a second,
//! concurrent launch into the same region should see the live claim and
//! not launch a second loader.

mod common;

use common::{test_capacity, test_state, MockProviderClient};
use gpu_fleet_operator::fs_resolver;
use gpu_fleet_operator::store::model::{DefaultFilesystem, SeedSourceVariant, Settings};

fn settings_with_shared_fs() -> Settings {
    Settings {
        lambda_api_key: "test-key".to_string(),
        setup_script: "#!/bin/bash\necho hi\n".to_string(),
        default_filesystems: vec![DefaultFilesystem {
            name: "shared-dataset".to_string(),
            source_variant: SeedSourceVariant::ObjectStoreB,
            source_url: "s3://bucket/dataset".to_string(),
            credentials: serde_json::json!({"accessKey": "AKIA...", "secretKey": "shh"}),
            download_script: None,
        }],
        seed_complete_secret: "seed-secret".to_string(),
        max_vm_hours: None,
    }
}

#[tokio::test]
async fn first_resolve_claims_the_seed_and_returns_a_loader() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let settings = settings_with_shared_fs();
    state.store.put_settings(&settings).await.unwrap();

    let resolution = fs_resolver::resolve(
        "us-west-1",
        "alice@example.org",
        false,
        &settings,
        &state.config.app_base_url,
        &state.config.mount_root,
        &state.store,
        state.provider.as_ref(),
    )
    .await
    .unwrap();

    assert_eq!(resolution.filesystem_names, vec!["shared-dataset".to_string()]);
    assert_eq!(resolution.loader_vms.len(), 1);
    assert!(resolution.loader_vms[0].user_data.contains("aws s3 sync"));
    assert!(resolution.loader_vms[0].user_data.contains("shutdown -h now"));

    let status = state
        .store
        .get_seed_status("shared-dataset", "us-west-1")
        .await
        .unwrap()
        .expect("seed claim recorded");
    assert_eq!(status.status, gpu_fleet_operator::store::model::SeedState::Seeding);
}

#[tokio::test]
async fn concurrent_resolve_does_not_double_claim() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let settings = settings_with_shared_fs();
    state.store.put_settings(&settings).await.unwrap();

    let first = fs_resolver::resolve(
        "us-west-1",
        "alice@example.org",
        false,
        &settings,
        &state.config.app_base_url,
        &state.config.mount_root,
        &state.store,
        state.provider.as_ref(),
    )
    .await
    .unwrap();
    assert_eq!(first.loader_vms.len(), 1);

    // A second candidate launching moments later into the same region sees
    // the live claim and is not handed a loader to launch.
    let second = fs_resolver::resolve(
        "us-west-1",
        "bob@example.org",
        false,
        &settings,
        &state.config.app_base_url,
        &state.config.mount_root,
        &state.store,
        state.provider.as_ref(),
    )
    .await
    .unwrap();
    assert!(second.loader_vms.is_empty());
    assert_eq!(second.filesystem_names, vec!["shared-dataset".to_string()]);
}

#[tokio::test]
async fn ready_filesystem_needs_no_loader() {
    let provider = MockProviderClient::new(vec![test_capacity("gpu_1x_a100", 200, &["us-west-1"])]);
    let state = test_state(provider).await;
    let settings = settings_with_shared_fs();
    state.store.put_settings(&settings).await.unwrap();

    // Seed a filesystem that's already marked ready.
    state.provider.create_filesystem("shared-dataset", "us-west-1").await.unwrap();
    state
        .store
        .put_seed_status(&gpu_fleet_operator::store::model::SeedStatus {
            filesystem_name: "shared-dataset".to_string(),
            region: "us-west-1".to_string(),
            status: gpu_fleet_operator::store::model::SeedState::Ready,
            seeding_instance_id: None,
            claimed_at: None,
            completed_at: Some(chrono::Utc::now()),
        })
        .await
        .unwrap();

    let resolution = fs_resolver::resolve(
        "us-west-1",
        "carol@example.org",
        false,
        &settings,
        &state.config.app_base_url,
        &state.config.mount_root,
        &state.store,
        state.provider.as_ref(),
    )
    .await
    .unwrap();

    assert!(resolution.loader_vms.is_empty());
    assert!(resolution.readonly_remount_script.contains("shared-dataset"));
}
