//! Record types for the six State Store collections (spec §3).
//!
//! Enums are tagged Rust types serialized as plain lowercase/snake_case
//! strings on the wire, per the Design Note that runtime string-typed status
//! fields become tagged variants while keeping the wire JSON stringy — the
//! same move the teacher's `NodeType`/`StellarNetwork` enums make.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateRole {
    Candidate,
    Admin,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Candidate {
    pub email: String,
    pub name: String,
    pub role: CandidateRole,
    pub quota_dollars: u32,
    pub spent_cents: i64,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spent_reset_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deactivated_at: Option<DateTime<Utc>>,
}

impl Candidate {
    pub fn quota_cents(&self) -> i64 {
        self.quota_dollars as i64 * 100
    }

    pub fn is_admin(&self) -> bool {
        self.role == CandidateRole::Admin
    }

    pub fn is_active(&self) -> bool {
        self.deactivated_at.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Launching,
    Running,
    Restarting,
    Terminated,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    UserRequested,
    TerminatedExternally,
    AccountRemoved,
    QuotaExceeded,
    MaxHoursExceeded,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Vm {
    pub instance_id: String,
    pub candidate_email: String,
    pub instance_type: String,
    pub region: String,
    pub price_cents_per_hour: i64,
    pub launched_at: DateTime<Utc>,
    pub status: VmStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub ssh_key_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminated_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub termination_reason: Option<TerminationReason>,
    pub last_checked_at: DateTime<Utc>,
    pub accrued_cents: i64,
    /// Marks this VM as a short-lived loader used only to seed a shared
    /// filesystem; excluded from a candidate's "one active VM" count.
    #[serde(default)]
    pub is_loader: bool,
}

impl Vm {
    pub fn is_active(&self) -> bool {
        self.terminated_at.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchRequestStatus {
    Queued,
    Provisioning,
    Fulfilled,
    Cancelled,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub id: String,
    pub candidate_email: String,
    pub instance_types: Vec<String>,
    pub regions: Vec<String>,
    pub ssh_public_key: String,
    pub attach_filesystem: bool,
    pub status: LaunchRequestStatus,
    pub created_at: DateTime<Utc>,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fulfilled_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl LaunchRequest {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            LaunchRequestStatus::Fulfilled
                | LaunchRequestStatus::Cancelled
                | LaunchRequestStatus::Failed
        )
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(
            self.status,
            LaunchRequestStatus::Queued | LaunchRequestStatus::Provisioning
        )
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SshKey {
    pub email: String,
    pub key_name: String,
    /// Upstream key id returned by `add_ssh_key`, needed for `delete_ssh_key`
    /// since the provider deletes by id, not by the deterministic name.
    pub upstream_id: String,
    pub public_key: String,
    pub registered_at: DateTime<Utc>,
}

impl SshKey {
    pub fn store_key(email: &str, key_name: &str) -> String {
        format!("{email}|{key_name}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedState {
    Seeding,
    Ready,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SeedStatus {
    pub filesystem_name: String,
    pub region: String,
    pub status: SeedState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seeding_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl SeedStatus {
    pub fn store_key(filesystem_name: &str, region: &str) -> String {
        format!("{filesystem_name}|{region}")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeedSourceVariant {
    ObjectStoreA,
    ObjectStoreB,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultFilesystem {
    pub name: String,
    pub source_variant: SeedSourceVariant,
    pub source_url: String,
    /// Credentials for the source fetcher; shape depends on `source_variant`.
    pub credentials: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_script: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    pub lambda_api_key: String,
    pub setup_script: String,
    pub default_filesystems: Vec<DefaultFilesystem>,
    pub seed_complete_secret: String,
    /// Design Note O2: off by default, administrative policy distinct from
    /// the dollar quota rule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_vm_hours: Option<f64>,
}

const CREDENTIALS_MASK: &str = "***";

impl Settings {
    /// Mask secrets for the admin-facing GET response (spec §6.1).
    pub fn masked(&self) -> Settings {
        Settings {
            lambda_api_key: mask(&self.lambda_api_key),
            setup_script: self.setup_script.clone(),
            default_filesystems: self
                .default_filesystems
                .iter()
                .map(|fs| DefaultFilesystem {
                    credentials: serde_json::Value::String(CREDENTIALS_MASK.to_string()),
                    ..fs.clone()
                })
                .collect(),
            seed_complete_secret: mask(&self.seed_complete_secret),
            max_vm_hours: self.max_vm_hours,
        }
    }

    fn is_masked_secret(candidate: &str, real: &str) -> bool {
        candidate.is_empty() || candidate == mask(real)
    }

    /// Reconciles an incoming PUT body against the currently-stored
    /// settings: any secret (API key, seed-complete secret, per-filesystem
    /// credentials) that still carries its masked placeholder from a prior
    /// GET is replaced with the real stored value, so a GET -> edit -> PUT
    /// round-trip that never touched a secret field doesn't clobber it with
    /// `****1234` / `***`.
    pub fn reconcile_masked_secrets(mut incoming: Settings, existing: &Settings) -> Settings {
        if Self::is_masked_secret(&incoming.lambda_api_key, &existing.lambda_api_key) {
            incoming.lambda_api_key = existing.lambda_api_key.clone();
        }
        if Self::is_masked_secret(&incoming.seed_complete_secret, &existing.seed_complete_secret) {
            incoming.seed_complete_secret = existing.seed_complete_secret.clone();
        }
        for fs in &mut incoming.default_filesystems {
            if fs.credentials == serde_json::Value::String(CREDENTIALS_MASK.to_string()) {
                if let Some(prior) = existing.default_filesystems.iter().find(|e| e.name == fs.name) {
                    fs.credentials = prior.credentials.clone();
                }
            }
        }
        incoming
    }
}

fn mask(secret: &str) -> String {
    if secret.chars().count() <= 4 {
        "****".to_string()
    } else {
        let tail: String = secret.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
        format!("****{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings_with(lambda_api_key: &str, seed_complete_secret: &str, credentials: serde_json::Value) -> Settings {
        Settings {
            lambda_api_key: lambda_api_key.to_string(),
            setup_script: "#!/bin/sh\necho hi\n".to_string(),
            default_filesystems: vec![DefaultFilesystem {
                name: "fs-shared".to_string(),
                source_variant: SeedSourceVariant::ObjectStoreA,
                source_url: "s3://bucket/key".to_string(),
                credentials,
                download_script: None,
            }],
            seed_complete_secret: seed_complete_secret.to_string(),
            max_vm_hours: None,
        }
    }

    #[test]
    fn round_trip_of_masked_settings_preserves_the_real_secrets() {
        let existing = settings_with(
            "secret-lambda-key-1234",
            "secret-seed-complete-5678",
            serde_json::json!({"accessKey": "AKIA...", "secretKey": "abcd"}),
        );
        let body = existing.masked();

        let reconciled = Settings::reconcile_masked_secrets(body, &existing);

        assert_eq!(reconciled.lambda_api_key, existing.lambda_api_key);
        assert_eq!(reconciled.seed_complete_secret, existing.seed_complete_secret);
        assert_eq!(
            reconciled.default_filesystems[0].credentials,
            existing.default_filesystems[0].credentials
        );
    }

    #[test]
    fn a_genuine_secret_edit_is_not_overwritten() {
        let existing = settings_with(
            "secret-lambda-key-1234",
            "secret-seed-complete-5678",
            serde_json::json!({"accessKey": "AKIA...", "secretKey": "abcd"}),
        );
        let mut body = existing.masked();
        body.lambda_api_key = "a-brand-new-real-key".to_string();

        let reconciled = Settings::reconcile_masked_secrets(body, &existing);

        assert_eq!(reconciled.lambda_api_key, "a-brand-new-real-key");
        // Untouched fields still fall back to the stored value.
        assert_eq!(reconciled.seed_complete_secret, existing.seed_complete_secret);
    }

    #[test]
    fn empty_secret_fields_also_fall_back_to_the_stored_value() {
        let existing = settings_with(
            "secret-lambda-key-1234",
            "secret-seed-complete-5678",
            serde_json::json!({"accessKey": "AKIA...", "secretKey": "abcd"}),
        );
        let body = settings_with("", "", serde_json::json!({"accessKey": "AKIA...", "secretKey": "abcd"}));

        let reconciled = Settings::reconcile_masked_secrets(body, &existing);

        assert_eq!(reconciled.lambda_api_key, existing.lambda_api_key);
        assert_eq!(reconciled.seed_complete_secret, existing.seed_complete_secret);
    }

    #[test]
    fn mask_does_not_panic_on_multibyte_secrets() {
        let masked = mask("pässwörd-mit-ümlaut");
        assert!(masked.starts_with("****"));
    }
}
