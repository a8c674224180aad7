//! Shared test scaffolding: a scripted `MockProviderClient` standing in for
//! the upstream GPU cloud, and a builder for a fully-wired `AppState` backed
//! by `MemoryStore`, mirroring how spec.md §8's scenarios are phrased as
//! "given state X, calling operation Y yields Z".

use std::sync::Arc;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use gpu_fleet_operator::auth::JwksCache;
use gpu_fleet_operator::config::{AppState, Config};
use gpu_fleet_operator::error::{Error, Result};
use gpu_fleet_operator::provider::types::{FilesystemEntry, RegionInfo, SshKeyEntry, UpstreamInstance};
use gpu_fleet_operator::provider::{InstanceTypeCapacity, LaunchParams, ProviderClient};
use gpu_fleet_operator::store::memory::MemoryStore;
use gpu_fleet_operator::store::model::Settings;
use gpu_fleet_operator::store::StateStore;

pub struct MockProviderClient {
    pub capacities: Mutex<Vec<InstanceTypeCapacity>>,
    pub instances: Mutex<Vec<UpstreamInstance>>,
    pub filesystems: Mutex<Vec<FilesystemEntry>>,
    pub ssh_keys: Mutex<Vec<SshKeyEntry>>,
    pub next_id: Mutex<u64>,
}

impl MockProviderClient {
    pub fn new(capacities: Vec<InstanceTypeCapacity>) -> Arc<Self> {
        Arc::new(Self {
            capacities: Mutex::new(capacities),
            instances: Mutex::new(Vec::new()),
            filesystems: Mutex::new(Vec::new()),
            ssh_keys: Mutex::new(Vec::new()),
            next_id: Mutex::new(1),
        })
    }

    fn next(&self) -> u64 {
        let mut n = self.next_id.lock().unwrap();
        let id = *n;
        *n += 1;
        id
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn list_instance_types(&self) -> Result<Vec<InstanceTypeCapacity>> {
        Ok(self.capacities.lock().unwrap().clone())
    }

    async fn list_instances(&self) -> Result<Vec<UpstreamInstance>> {
        Ok(self.instances.lock().unwrap().clone())
    }

    async fn get_instance(&self, id: &str) -> Result<UpstreamInstance> {
        self.instances
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("instance {id}")))
    }

    async fn launch(&self, params: LaunchParams) -> Result<String> {
        let id = format!("i-{}", self.next());
        self.instances.lock().unwrap().push(UpstreamInstance {
            id: id.clone(),
            name: None,
            ip: Some("10.0.0.1".to_string()),
            status: "active".to_string(),
            instance_type: gpu_fleet_operator::provider::types::InstanceTypeSpec {
                name: params.instance_type,
                description: String::new(),
                price_cents_per_hour: 0,
            },
            region: RegionInfo { name: params.region },
        });
        Ok(id)
    }

    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        self.instances
            .lock()
            .unwrap()
            .retain(|i| !instance_ids.contains(&i.id));
        Ok(())
    }

    async fn restart(&self, _instance_id: &str) -> Result<()> {
        Ok(())
    }

    async fn list_ssh_keys(&self) -> Result<Vec<SshKeyEntry>> {
        Ok(self.ssh_keys.lock().unwrap().clone())
    }

    async fn add_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let id = format!("key-{}", self.next());
        self.ssh_keys.lock().unwrap().push(SshKeyEntry {
            id: id.clone(),
            name: name.to_string(),
            public_key: Some(public_key.to_string()),
        });
        Ok(id)
    }

    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        self.ssh_keys.lock().unwrap().retain(|k| k.id != id);
        Ok(())
    }

    async fn list_filesystems(&self) -> Result<Vec<FilesystemEntry>> {
        Ok(self.filesystems.lock().unwrap().clone())
    }

    async fn create_filesystem(&self, name: &str, region: &str) -> Result<FilesystemEntry> {
        if let Some(existing) = self
            .filesystems
            .lock()
            .unwrap()
            .iter()
            .find(|f| f.name == name && f.region.name == region)
        {
            return Ok(existing.clone());
        }
        let entry = FilesystemEntry {
            id: format!("fs-{}", self.next()),
            name: name.to_string(),
            region: RegionInfo { name: region.to_string() },
            mount_point: None,
        };
        self.filesystems.lock().unwrap().push(entry.clone());
        Ok(entry)
    }

    async fn delete_filesystem(&self, id: &str) -> Result<()> {
        self.filesystems.lock().unwrap().retain(|f| f.id != id);
        Ok(())
    }
}

pub fn test_capacity(name: &str, price_cents_per_hour: i64, regions: &[&str]) -> InstanceTypeCapacity {
    InstanceTypeCapacity {
        name: name.to_string(),
        description: format!("{name} GPU"),
        price_cents_per_hour,
        regions: regions.iter().map(|r| r.to_string()).collect(),
    }
}

pub async fn test_state(provider: Arc<MockProviderClient>) -> AppState {
    let store = StateStore::new(MemoryStore::new());
    store
        .put_settings(&Settings {
            lambda_api_key: "test-key".to_string(),
            setup_script: "#!/bin/bash\necho provisioned\n".to_string(),
            default_filesystems: Vec::new(),
            seed_complete_secret: "seed-secret".to_string(),
            max_vm_hours: None,
        })
        .await
        .unwrap();

    let config = Config {
        provider_base_url: "http://upstream.test".to_string(),
        bind_addr: "127.0.0.1:0".to_string(),
        jwks_url: "http://jwks.test".to_string(),
        admin_emails: vec!["admin@example.org".to_string()],
        reconcile_interval_secs: 60,
        app_base_url: "http://app.test".to_string(),
        mount_root: "/home/fs".to_string(),
    };

    AppState {
        config: Arc::new(config),
        store,
        provider,
        jwks: JwksCache::new("http://jwks.test"),
        #[cfg(feature = "metrics")]
        metrics: gpu_fleet_operator::metrics::Metrics::new(),
    }
}

pub fn test_candidate(email: &str, quota_dollars: u32) -> gpu_fleet_operator::store::model::Candidate {
    gpu_fleet_operator::store::model::Candidate {
        email: email.to_string(),
        name: "Test Candidate".to_string(),
        role: gpu_fleet_operator::store::model::CandidateRole::Candidate,
        quota_dollars,
        spent_cents: 0,
        added_at: Utc::now(),
        added_by: "admin@example.org".to_string(),
        spent_reset_at: None,
        deactivated_at: None,
    }
}
