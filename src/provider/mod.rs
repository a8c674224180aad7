//! Provider Client (spec §2.1, §6.2): a typed wrapper over the upstream
//! cloud API. Surfaces upstream errors as `Error::UpstreamTransient` /
//! `Error::UpstreamPermanent`, and treats "already exists" / "already in
//! use" responses from `add_ssh_key` and `create_filesystem` as success —
//! the Design Note contract requirement that concurrent launches trying to
//! create the same SSH key or filesystem must not see that as an error.
//!
//! Centralizes the filesystem path in one constant rather than replicating
//! the source's `/file-systems` (GET/POST) vs `/filesystems` (DELETE)
//! discrepancy (Open Question O1) — every verb uses the same path here.

pub mod types;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use tracing::{instrument, warn};

use crate::error::{Error, Result};
use crate::store::StateStore;
use types::*;

const FILESYSTEMS_PATH: &str = "/file-systems";

#[derive(Debug, Clone)]
pub struct InstanceTypeCapacity {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: i64,
    pub regions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct LaunchParams {
    pub instance_type: String,
    pub region: String,
    pub ssh_key_names: Vec<String>,
    pub filesystem_names: Vec<String>,
    pub user_data: String,
}

/// Everything the control plane needs from upstream, exactly the operation
/// set enumerated in spec §6.2 — no more, no less.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    async fn list_instance_types(&self) -> Result<Vec<InstanceTypeCapacity>>;
    async fn list_instances(&self) -> Result<Vec<UpstreamInstance>>;
    async fn get_instance(&self, id: &str) -> Result<UpstreamInstance>;
    async fn launch(&self, params: LaunchParams) -> Result<String>;
    async fn terminate(&self, instance_ids: &[String]) -> Result<()>;
    async fn restart(&self, instance_id: &str) -> Result<()>;

    async fn list_ssh_keys(&self) -> Result<Vec<SshKeyEntry>>;
    /// Returns the upstream key id. Idempotent: if a key with this name
    /// already exists, returns its id rather than erroring.
    async fn add_ssh_key(&self, name: &str, public_key: &str) -> Result<String>;
    /// Idempotent: deleting an already-gone key is not an error.
    async fn delete_ssh_key(&self, id: &str) -> Result<()>;

    async fn list_filesystems(&self) -> Result<Vec<FilesystemEntry>>;
    /// Idempotent: if a filesystem with this (name, region) already exists,
    /// returns it rather than erroring.
    async fn create_filesystem(&self, name: &str, region: &str) -> Result<FilesystemEntry>;
    async fn delete_filesystem(&self, id: &str) -> Result<()>;
}

pub struct HttpProviderClient {
    http: reqwest::Client,
    base_url: String,
    store: StateStore,
}

impl HttpProviderClient {
    pub fn new(base_url: impl Into<String>, store: StateStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            store,
        }
    }

    async fn api_key(&self) -> Result<String> {
        let settings = self
            .store
            .get_settings()
            .await?
            .ok_or_else(|| Error::ConfigError("settings not configured".into()))?;
        Ok(settings.lambda_api_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn classify(resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT || status == StatusCode::TOO_MANY_REQUESTS {
            Err(Error::UpstreamTransient(format!("{status}")))
        } else {
            warn!(%status, %body, "upstream returned a permanent error");
            Err(Error::UpstreamPermanent(format!("{status}")))
        }
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    #[instrument(skip(self))]
    async fn list_instance_types(&self) -> Result<Vec<InstanceTypeCapacity>> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .get(self.url("/instance-types"))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        let resp = Self::classify(resp).await?;
        let entries: Vec<InstanceTypeEntry> = resp
            .json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))?;
        Ok(entries
            .into_iter()
            .map(|e| InstanceTypeCapacity {
                name: e.instance_type.name,
                description: e.instance_type.description,
                price_cents_per_hour: e.instance_type.price_cents_per_hour,
                regions: e
                    .regions_with_capacity_available
                    .into_iter()
                    .map(|r| r.name)
                    .collect(),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn list_instances(&self) -> Result<Vec<UpstreamInstance>> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .get(self.url("/instances"))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        let resp = Self::classify(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn get_instance(&self, id: &str) -> Result<UpstreamInstance> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .get(self.url(&format!("/instances/{id}")))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Err(Error::NotFound(format!("instance {id}")));
        }
        let resp = Self::classify(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))
    }

    #[instrument(skip(self, params), fields(region = %params.region, instance_type = %params.instance_type))]
    async fn launch(&self, params: LaunchParams) -> Result<String> {
        let key = self.api_key().await?;
        let body = LaunchInstanceRequest {
            region_name: params.region,
            instance_type_name: params.instance_type,
            ssh_key_names: params.ssh_key_names,
            file_system_names: params.filesystem_names,
            user_data: params.user_data,
            quantity: 1,
        };
        let resp = self
            .http
            .post(self.url("/instance-operations/launch"))
            .basic_auth(&key, Option::<&str>::None)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        let resp = Self::classify(resp).await?;
        let parsed: LaunchInstanceResponse = resp
            .json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))?;
        parsed
            .instance_ids
            .into_iter()
            .next()
            .ok_or_else(|| Error::UpstreamPermanent("launch returned no instance id".into()))
    }

    #[instrument(skip(self))]
    async fn terminate(&self, instance_ids: &[String]) -> Result<()> {
        if instance_ids.is_empty() {
            return Ok(());
        }
        let key = self.api_key().await?;
        let resp = self
            .http
            .post(self.url("/instance-operations/terminate"))
            .basic_auth(&key, Option::<&str>::None)
            .json(&TerminateInstanceRequest {
                instance_ids: instance_ids.to_vec(),
            })
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        // Terminating an already-gone instance is a no-op (P7): treat 404 as success.
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::classify(resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn restart(&self, instance_id: &str) -> Result<()> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .post(self.url("/instance-operations/restart"))
            .basic_auth(&key, Option::<&str>::None)
            .json(&RestartInstanceRequest {
                instance_ids: vec![instance_id.to_string()],
            })
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        Self::classify(resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_ssh_keys(&self) -> Result<Vec<SshKeyEntry>> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .get(self.url("/ssh-keys"))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        let resp = Self::classify(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))
    }

    #[instrument(skip(self, public_key))]
    async fn add_ssh_key(&self, name: &str, public_key: &str) -> Result<String> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .post(self.url("/ssh-keys"))
            .basic_auth(&key, Option::<&str>::None)
            .json(&AddSshKeyRequest {
                name: name.to_string(),
                public_key: public_key.to_string(),
            })
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        if resp.status() == StatusCode::CONFLICT || resp.status() == StatusCode::BAD_REQUEST {
            // Name collision: a concurrent launch beat us to it. Treat as
            // success and look the key up by name instead of erroring.
            warn!(name, "ssh key name already in use upstream, treating as success");
            let existing = self.list_ssh_keys().await?;
            return existing
                .into_iter()
                .find(|k| k.name == name)
                .map(|k| k.id)
                .ok_or_else(|| Error::UpstreamPermanent("ssh key name in use but not found on list".into()));
        }
        let resp = Self::classify(resp).await?;
        let entry: SshKeyEntry = resp
            .json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))?;
        Ok(entry.id)
    }

    #[instrument(skip(self))]
    async fn delete_ssh_key(&self, id: &str) -> Result<()> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .delete(self.url(&format!("/ssh-keys/{id}")))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::classify(resp).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list_filesystems(&self) -> Result<Vec<FilesystemEntry>> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .get(self.url(FILESYSTEMS_PATH))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        let resp = Self::classify(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn create_filesystem(&self, name: &str, region: &str) -> Result<FilesystemEntry> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .post(self.url(FILESYSTEMS_PATH))
            .basic_auth(&key, Option::<&str>::None)
            .json(&CreateFilesystemRequest {
                name: name.to_string(),
                region: region.to_string(),
            })
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        if resp.status() == StatusCode::CONFLICT || resp.status() == StatusCode::BAD_REQUEST {
            warn!(name, region, "filesystem already exists upstream, treating as success");
            let existing = self.list_filesystems().await?;
            return existing
                .into_iter()
                .find(|f| f.name == name && f.region.name == region)
                .ok_or_else(|| Error::UpstreamPermanent("filesystem in use but not found on list".into()));
        }
        let resp = Self::classify(resp).await?;
        resp.json()
            .await
            .map_err(|e| Error::UpstreamPermanent(e.to_string()))
    }

    #[instrument(skip(self))]
    async fn delete_filesystem(&self, id: &str) -> Result<()> {
        let key = self.api_key().await?;
        let resp = self
            .http
            .delete(self.url(&format!("{FILESYSTEMS_PATH}/{id}")))
            .basic_auth(&key, Option::<&str>::None)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| Error::UpstreamTransient(e.to_string()))?;
        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::classify(resp).await?;
        Ok(())
    }
}

pub fn shared_http_client(base_url: impl Into<String>, store: StateStore) -> Arc<dyn ProviderClient> {
    Arc::new(HttpProviderClient::new(base_url, store))
}
