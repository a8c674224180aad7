//! Filesystem Resolver (spec §4.3).
//!
//! A (mostly) pure function over `(region, candidate, request, settings)`
//! that consults the State Store and Provider Client explicitly passed in —
//! Design Note: "keep the resolver pure and pass clients in explicitly" is a
//! direct generalization of the teacher's `resources::ensure_pvc(client,
//! node)` style, where every builder takes its `Client` as a parameter
//! rather than reaching into a global.

use chrono::Utc;
use tracing::{info, warn};

use crate::error::Result;
use crate::provider::ProviderClient;
use crate::store::model::{DefaultFilesystem, SeedSourceVariant, SeedState, SeedStatus, Settings};
use crate::store::StateStore;

const STALE_SEED_MINUTES: i64 = 60;

pub struct Resolution {
    pub filesystem_names: Vec<String>,
    pub loader_vms: Vec<LoaderVmSpec>,
    pub readonly_remount_script: String,
}

#[derive(Debug, Clone)]
pub struct LoaderVmSpec {
    pub filesystem_name: String,
    pub region: String,
    pub user_data: String,
}

/// Stable, length-bounded personal filesystem name: `fs-<sanitized-email>-<region>`.
///
/// Blindly truncating a long sanitized email risks two different users
/// colliding on the same upstream name once both are cut to the same
/// prefix. Past the length bound, the truncated prefix is disambiguated
/// with an 8-hex-char suffix derived from the full email so distinct users
/// never collapse onto the same filesystem name.
pub fn personal_filesystem_name(email: &str, region: &str) -> String {
    let sanitized = sanitize(email);
    let name = format!("fs-{sanitized}-{region}");
    if name.len() <= 63 {
        return name;
    }
    let suffix = short_hash(email);
    let budget = 63 - region.len() - suffix.len() - "fs--".len() - 1; // "fs-" + "-" + region + "-" + suffix
    let truncated = sanitized.chars().take(budget.max(1)).collect::<String>();
    format!("fs-{truncated}-{suffix}-{region}")
        .trim_end_matches('-')
        .to_string()
}

fn short_hash(input: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(input.as_bytes());
    hex::encode(&digest[..4])
}

/// Deterministic upstream SSH key name (spec §4.2 step 5): `web-<sanitized-email>`.
pub fn ssh_key_name(email: &str) -> String {
    format!("web-{}", sanitize(email))
}

fn sanitize(email: &str) -> String {
    let mut out = String::with_capacity(email.len());
    let mut last_was_sep = false;
    for c in email.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('-');
            last_was_sep = true;
        }
    }
    out.trim_matches('-').to_string()
}

pub async fn resolve(
    region: &str,
    candidate_email: &str,
    attach_personal_filesystem: bool,
    settings: &Settings,
    app_base_url: &str,
    mount_root: &str,
    store: &StateStore,
    provider: &dyn ProviderClient,
) -> Result<Resolution> {
    let mut filesystem_names = Vec::new();
    let mut loader_vms = Vec::new();
    let mut readonly_remount_script = String::new();

    if attach_personal_filesystem {
        let name = personal_filesystem_name(candidate_email, region);
        ensure_filesystem_exists(provider, &name, region).await?;
        filesystem_names.push(name);
    }

    for shared in &settings.default_filesystems {
        let existed = provider
            .list_filesystems()
            .await?
            .into_iter()
            .any(|f| f.name == shared.name && f.region.name == region);

        if existed {
            filesystem_names.push(shared.name.clone());
            append_remount(&mut readonly_remount_script, &shared.name, mount_root);
            continue;
        }

        provider.create_filesystem(&shared.name, region).await?;
        filesystem_names.push(shared.name.clone());
        append_remount(&mut readonly_remount_script, &shared.name, mount_root);

        if let Some(loader) = try_claim_seed(store, shared, region, app_base_url, settings, mount_root).await? {
            loader_vms.push(loader);
        }
    }

    Ok(Resolution {
        filesystem_names,
        loader_vms,
        readonly_remount_script,
    })
}

async fn ensure_filesystem_exists(provider: &dyn ProviderClient, name: &str, region: &str) -> Result<()> {
    let existed = provider
        .list_filesystems()
        .await?
        .into_iter()
        .any(|f| f.name == name && f.region.name == region);
    if !existed {
        provider.create_filesystem(name, region).await?;
    }
    Ok(())
}

fn append_remount(script: &mut String, filesystem_name: &str, mount_root: &str) {
    script.push_str(&format!(
        "mount -o remount,ro {mount_root}/{filesystem_name}\n",
    ));
}

/// Seed lock protocol (spec §4.3 "Seed lock protocol"). Returns `Some(loader)`
/// if this caller won the claim and must launch a loader VM, `None` if the
/// filesystem is already `ready` or another caller holds a live claim.
async fn try_claim_seed(
    store: &StateStore,
    fs: &DefaultFilesystem,
    region: &str,
    app_base_url: &str,
    settings: &Settings,
    mount_root: &str,
) -> Result<Option<LoaderVmSpec>> {
    let current = store.get_seed_status(&fs.name, region).await?;

    if let Some(existing) = &current {
        match existing.status {
            SeedState::Ready => return Ok(None),
            SeedState::Seeding => {
                let age_minutes = existing
                    .claimed_at
                    .map(|t| (Utc::now() - t).num_minutes())
                    .unwrap_or(0);
                if age_minutes < STALE_SEED_MINUTES {
                    info!(filesystem = %fs.name, region, "seed already claimed, skipping loader launch");
                    return Ok(None);
                }
                warn!(filesystem = %fs.name, region, age_minutes, "stale seed claim, reclaiming");
            }
        }
    }

    // Last-writer-wins claim: a lost race at worst launches a second
    // harmless loader VM (spec §4.3, §5 shared-resource policy (c)).
    let claim = SeedStatus {
        filesystem_name: fs.name.clone(),
        region: region.to_string(),
        status: SeedState::Seeding,
        seeding_instance_id: None,
        claimed_at: Some(Utc::now()),
        completed_at: None,
    };
    store.put_seed_status(&claim).await?;

    let user_data = build_loader_script(fs, region, app_base_url, settings, mount_root);
    Ok(Some(LoaderVmSpec {
        filesystem_name: fs.name.clone(),
        region: region.to_string(),
        user_data,
    }))
}

/// Builds the loader VM's `userData` (spec §4.3 "Loader VM spec", §6.3).
fn build_loader_script(
    fs: &DefaultFilesystem,
    region: &str,
    app_base_url: &str,
    settings: &Settings,
    mount_root: &str,
) -> String {
    let mount_path = format!("{mount_root}/{}", fs.name);
    let callback_url = format!("{app_base_url}/api/seed-complete");
    // Base64-encode the credentials blob rather than splice raw JSON into the
    // heredoc: arbitrary admin-supplied credential JSON could itself contain
    // a line matching the `CREDS_EOF` delimiter and truncate the script.
    let credentials_b64 = base64::Engine::encode(
        &base64::engine::general_purpose::STANDARD,
        fs.credentials.to_string(),
    );

    let download_commands = if let Some(custom) = &fs.download_script {
        custom.clone()
    } else {
        match fs.source_variant {
            SeedSourceVariant::ObjectStoreA => format!(
                "rclone sync \"objstore-a:$(jq -r .bucket \"$CREDS_FILE\")/{src}\" \"$NFS_PATH\" --config \"$CREDS_FILE\"",
                src = fs.source_url,
            ),
            SeedSourceVariant::ObjectStoreB => format!(
                "aws s3 sync \"{src}\" \"$NFS_PATH\" --no-progress",
                src = fs.source_url,
            ),
        }
    };

    format!(
        r#"#!/bin/bash
set -euo pipefail

NFS_PATH="{mount_path}"
CREDS_FILE="$(mktemp)"
echo '{credentials_b64}' | base64 -d > "$CREDS_FILE"

{download_commands}

curl -fsS -X POST "{callback_url}" \
  -H "Authorization: Bearer {secret}" \
  -H "Content-Type: application/json" \
  -d '{{"filesystemName":"{name}","region":"{region}"}}'

mount -o remount,ro "$NFS_PATH"
shutdown -h now
"#,
        mount_path = mount_path,
        credentials_b64 = credentials_b64,
        download_commands = download_commands,
        callback_url = callback_url,
        secret = settings.seed_complete_secret,
        name = fs.name,
        region = region,
    )
}

/// Splices the admin-configured setup script with the resolver's readonly
/// remount fragment into one `#!/bin/bash` script (spec §4.3 "userData
/// composition for the user VM"). Strips any shebang the setup script
/// carries of its own before splicing.
pub fn compose_user_data(setup_script: &str, readonly_remount_script: &str) -> String {
    let body = setup_script
        .lines()
        .enumerate()
        .filter(|(i, line)| !(*i == 0 && line.trim_start().starts_with("#!")))
        .map(|(_, line)| line)
        .collect::<Vec<_>>()
        .join("\n");

    format!("#!/bin/bash\nset -euo pipefail\n{body}\n{readonly_remount_script}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_and_bounds_personal_filesystem_name() {
        let name = personal_filesystem_name("Alice.Smith+gpu@Example.org", "us-west-1");
        assert_eq!(name, "fs-alice-smith-gpu-example-org-us-west-1");
    }

    #[test]
    fn long_email_gets_disambiguated_not_blindly_truncated() {
        let long_email = format!("{}@example.org", "a".repeat(80));
        let other_long_email = format!("{}@example.org", "b".repeat(80));
        let name_a = personal_filesystem_name(&long_email, "us-west-1");
        let name_b = personal_filesystem_name(&other_long_email, "us-west-1");
        assert!(name_a.len() <= 63);
        assert!(name_b.len() <= 63);
        assert_ne!(name_a, name_b, "distinct long emails must not collapse to the same name");
        assert!(name_a.ends_with("-us-west-1"));
    }

    #[test]
    fn ssh_key_name_is_deterministic() {
        assert_eq!(ssh_key_name("alice@example.org"), "web-alice-example-org");
        assert_eq!(ssh_key_name("ALICE@EXAMPLE.ORG"), "web-alice-example-org");
    }

    #[test]
    fn compose_strips_existing_shebang() {
        let composed = compose_user_data("#!/bin/sh\necho hi", "mount -o remount,ro /x\n");
        assert!(composed.starts_with("#!/bin/bash\nset -euo pipefail\n"));
        assert!(composed.contains("echo hi"));
        assert!(composed.contains("mount -o remount,ro /x"));
        assert_eq!(composed.matches("#!").count(), 1);
    }

    #[test]
    fn compose_handles_script_without_shebang() {
        let composed = compose_user_data("echo hi", "mount -o remount,ro /x\n");
        assert!(composed.contains("echo hi"));
    }
}
