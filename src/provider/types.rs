//! Wire DTOs for the upstream provider API (spec §6.2).
//!
//! Field names follow the upstream's own snake_case convention; these are
//! deliberately separate from `store::model` so a wire-format change upstream
//! never leaks into how records are persisted locally.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceTypeSpec {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InstanceTypeEntry {
    pub instance_type: InstanceTypeSpec,
    pub regions_with_capacity_available: Vec<RegionInfo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegionInfo {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamInstance {
    pub id: String,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub status: String,
    pub instance_type: InstanceTypeSpec,
    pub region: RegionInfo,
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchInstanceRequest {
    pub region_name: String,
    pub instance_type_name: String,
    pub ssh_key_names: Vec<String>,
    pub file_system_names: Vec<String>,
    pub user_data: String,
    pub quantity: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LaunchInstanceResponse {
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TerminateInstanceRequest {
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RestartInstanceRequest {
    pub instance_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshKeyEntry {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AddSshKeyRequest {
    pub name: String,
    pub public_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FilesystemEntry {
    pub id: String,
    pub name: String,
    pub region: RegionInfo,
    #[serde(default)]
    pub mount_point: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateFilesystemRequest {
    pub name: String,
    pub region: String,
}
