//! State Store contract (spec §4.1).
//!
//! `KvStore` is the bare strongly-consistent get/put/delete/list-prefix
//! primitive spec.md describes: single-key operations only, no multi-key
//! transactions. `StateStore` is a typed convenience wrapper around any
//! `KvStore` implementation that knows about the six collections
//! (`candidates`, `vms`, `launch-requests`, `ssh-keys`, `seed-status`,
//! `settings`) and does the read-modify-write dance callers need.
//!
//! Grounded on the trait-object database abstraction style used across the
//! retrieval pack's VM-management services (`LNVpsDbBase`-style traits:
//! one `#[async_trait]` trait, typed methods, callers take `Arc<dyn Trait>`)
//! rather than the teacher's `kube::Client`, which has no local-store
//! analogue to generalize from.

pub mod memory;
pub mod model;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Error, Result};
use model::*;

pub const COLLECTION_CANDIDATES: &str = "candidates";
pub const COLLECTION_VMS: &str = "vms";
pub const COLLECTION_LAUNCH_REQUESTS: &str = "launch-requests";
pub const COLLECTION_SSH_KEYS: &str = "ssh-keys";
pub const COLLECTION_SEED_STATUS: &str = "seed-status";
pub const COLLECTION_SETTINGS: &str = "settings";
const SETTINGS_KEY: &str = "singleton";

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
    async fn put(&self, collection: &str, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, collection: &str, key: &str) -> Result<()>;
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>>;
}

/// Typed facade over a `KvStore`. Cheap to clone (holds an `Arc` internally
/// via whatever the concrete `KvStore` impl uses).
#[derive(Clone)]
pub struct StateStore {
    kv: std::sync::Arc<dyn KvStore>,
}

impl StateStore {
    pub fn new(kv: std::sync::Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    async fn get_typed<T: DeserializeOwned>(&self, collection: &str, key: &str) -> Result<Option<T>> {
        match self.kv.get(collection, key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn put_typed<T: Serialize + Sync>(&self, collection: &str, key: &str, value: &T) -> Result<()> {
        let v = serde_json::to_value(value)?;
        self.kv.put(collection, key, v).await
    }

    async fn list_typed<T: DeserializeOwned>(&self, collection: &str) -> Result<Vec<T>> {
        let rows = self.kv.list(collection).await?;
        rows.into_iter()
            .map(|(_, v)| serde_json::from_value(v).map_err(Error::from))
            .collect()
    }

    // ---- candidates -------------------------------------------------

    pub async fn get_candidate(&self, email: &str) -> Result<Option<Candidate>> {
        self.get_typed(COLLECTION_CANDIDATES, &email.to_lowercase()).await
    }

    pub async fn put_candidate(&self, candidate: &Candidate) -> Result<()> {
        self.put_typed(COLLECTION_CANDIDATES, &candidate.email.to_lowercase(), candidate)
            .await
    }

    pub async fn list_candidates(&self) -> Result<Vec<Candidate>> {
        self.list_typed(COLLECTION_CANDIDATES).await
    }

    // ---- vms ----------------------------------------------------------

    pub async fn get_vm(&self, instance_id: &str) -> Result<Option<Vm>> {
        self.get_typed(COLLECTION_VMS, instance_id).await
    }

    pub async fn put_vm(&self, vm: &Vm) -> Result<()> {
        self.put_typed(COLLECTION_VMS, &vm.instance_id, vm).await
    }

    pub async fn list_vms(&self) -> Result<Vec<Vm>> {
        self.list_typed(COLLECTION_VMS).await
    }

    pub async fn list_vms_for(&self, email: &str) -> Result<Vec<Vm>> {
        let email = email.to_lowercase();
        Ok(self
            .list_vms()
            .await?
            .into_iter()
            .filter(|vm| vm.candidate_email.to_lowercase() == email)
            .collect())
    }

    // ---- launch requests ----------------------------------------------

    pub async fn get_launch_request(&self, id: &str) -> Result<Option<LaunchRequest>> {
        self.get_typed(COLLECTION_LAUNCH_REQUESTS, id).await
    }

    pub async fn put_launch_request(&self, request: &LaunchRequest) -> Result<()> {
        self.put_typed(COLLECTION_LAUNCH_REQUESTS, &request.id, request)
            .await
    }

    pub async fn list_launch_requests(&self) -> Result<Vec<LaunchRequest>> {
        self.list_typed(COLLECTION_LAUNCH_REQUESTS).await
    }

    pub async fn list_launch_requests_for(&self, email: &str) -> Result<Vec<LaunchRequest>> {
        let email = email.to_lowercase();
        Ok(self
            .list_launch_requests()
            .await?
            .into_iter()
            .filter(|r| r.candidate_email.to_lowercase() == email)
            .collect())
    }

    // ---- ssh keys -------------------------------------------------------

    pub async fn get_ssh_key(&self, email: &str, key_name: &str) -> Result<Option<SshKey>> {
        self.get_typed(COLLECTION_SSH_KEYS, &SshKey::store_key(email, key_name))
            .await
    }

    pub async fn put_ssh_key(&self, key: &SshKey) -> Result<()> {
        self.put_typed(
            COLLECTION_SSH_KEYS,
            &SshKey::store_key(&key.email, &key.key_name),
            key,
        )
        .await
    }

    pub async fn delete_ssh_key(&self, email: &str, key_name: &str) -> Result<()> {
        self.kv
            .delete(COLLECTION_SSH_KEYS, &SshKey::store_key(email, key_name))
            .await
    }

    // ---- seed status -----------------------------------------------------

    pub async fn get_seed_status(&self, filesystem_name: &str, region: &str) -> Result<Option<SeedStatus>> {
        self.get_typed(
            COLLECTION_SEED_STATUS,
            &SeedStatus::store_key(filesystem_name, region),
        )
        .await
    }

    pub async fn put_seed_status(&self, status: &SeedStatus) -> Result<()> {
        self.put_typed(
            COLLECTION_SEED_STATUS,
            &SeedStatus::store_key(&status.filesystem_name, &status.region),
            status,
        )
        .await
    }

    pub async fn delete_seed_status(&self, filesystem_name: &str, region: &str) -> Result<()> {
        self.kv
            .delete(
                COLLECTION_SEED_STATUS,
                &SeedStatus::store_key(filesystem_name, region),
            )
            .await
    }

    pub async fn list_seed_statuses(&self) -> Result<Vec<SeedStatus>> {
        self.list_typed(COLLECTION_SEED_STATUS).await
    }

    // ---- settings ----------------------------------------------------------

    pub async fn get_settings(&self) -> Result<Option<Settings>> {
        self.get_typed(COLLECTION_SETTINGS, SETTINGS_KEY).await
    }

    pub async fn put_settings(&self, settings: &Settings) -> Result<()> {
        self.put_typed(COLLECTION_SETTINGS, SETTINGS_KEY, settings).await
    }
}
