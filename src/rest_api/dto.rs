//! Data Transfer Objects for the REST API (spec §6.1).
//!
//! Wire format is always camelCase, matching the teacher's
//! `#[serde(rename_all = "camelCase")]` convention in its own `dto.rs`, even
//! though the Rust-side domain types in `store::model` stay snake_case.

use serde::{Deserialize, Serialize};

use crate::store::model::{Candidate, LaunchRequest, Settings, Vm};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeResponse {
    pub email: String,
    pub name: String,
    pub role: String,
    pub quota_dollars: u32,
    pub spent_cents: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuTypeEntry {
    pub name: String,
    pub description: String,
    pub price_cents_per_hour: i64,
    pub regions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GpuTypesResponse {
    pub types: Vec<GpuTypeEntry>,
    pub all_regions: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmResponse {
    pub instance_id: String,
    pub candidate_email: String,
    pub instance_type: String,
    pub region: String,
    pub price_cents_per_hour: i64,
    pub launched_at: String,
    pub status: String,
    pub ip_address: Option<String>,
    pub ssh_key_name: String,
    pub terminated_at: Option<String>,
    pub termination_reason: Option<String>,
    pub accrued_cents: i64,
}

impl From<&Vm> for VmResponse {
    fn from(vm: &Vm) -> Self {
        Self {
            instance_id: vm.instance_id.clone(),
            candidate_email: vm.candidate_email.clone(),
            instance_type: vm.instance_type.clone(),
            region: vm.region.clone(),
            price_cents_per_hour: vm.price_cents_per_hour,
            launched_at: vm.launched_at.to_rfc3339(),
            status: format!("{:?}", vm.status).to_lowercase(),
            ip_address: vm.ip_address.clone(),
            ssh_key_name: vm.ssh_key_name.clone(),
            terminated_at: vm.terminated_at.map(|t| t.to_rfc3339()),
            termination_reason: vm.termination_reason.map(|r| format!("{r:?}").to_lowercase()),
            accrued_cents: vm.accrued_cents,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchVmRequest {
    pub instance_type: String,
    pub region: String,
    pub ssh_public_key: String,
    #[serde(default)]
    pub attach_filesystem: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceIdRequest {
    pub instance_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitLaunchRequestBody {
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub ssh_public_key: String,
    #[serde(default)]
    pub attach_filesystem: bool,
}

#[derive(Debug, Deserialize)]
pub struct CancelLaunchRequestBody {
    pub id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequestResponse {
    pub id: String,
    pub candidate_email: String,
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub status: String,
    pub created_at: String,
    pub attempts: u32,
    pub fulfilled_instance_id: Option<String>,
    pub failure_reason: Option<String>,
}

impl From<&LaunchRequest> for LaunchRequestResponse {
    fn from(r: &LaunchRequest) -> Self {
        Self {
            id: r.id.clone(),
            candidate_email: r.candidate_email.clone(),
            instance_types: r.instance_types.clone(),
            regions: r.regions.clone(),
            status: format!("{:?}", r.status).to_lowercase(),
            created_at: r.created_at.to_rfc3339(),
            attempts: r.attempts,
            fulfilled_instance_id: r.fulfilled_instance_id.clone(),
            failure_reason: r.failure_reason.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilesystemEntryResponse {
    pub id: String,
    pub name: String,
    pub region: String,
}

#[derive(Debug, Deserialize)]
pub struct FilesystemIdQuery {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddCandidateRequest {
    pub email: String,
    pub name: String,
    pub quota_dollars: u32,
}

#[derive(Debug, Deserialize)]
pub struct CandidateEmailQuery {
    pub email: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateResponse {
    pub email: String,
    pub name: String,
    pub role: String,
    pub quota_dollars: u32,
    pub spent_cents: i64,
    pub deactivated: bool,
}

impl From<&Candidate> for CandidateResponse {
    fn from(c: &Candidate) -> Self {
        Self {
            email: c.email.clone(),
            name: c.name.clone(),
            role: format!("{:?}", c.role).to_lowercase(),
            quota_dollars: c.quota_dollars,
            spent_cents: c.spent_cents,
            deactivated: c.deactivated_at.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetQuotaRequest {
    pub email: String,
    pub quota_dollars: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SeedCompleteRequest {
    pub filesystem_name: String,
    pub region: String,
}

pub fn settings_response(settings: &Settings) -> serde_json::Value {
    serde_json::to_value(settings.masked()).unwrap_or(serde_json::Value::Null)
}

/// Health check response (carried from the teacher's `HealthResponse`).
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}
