//! Static startup configuration and the shared application state handed to
//! every Axum handler and the reconciler.
//!
//! Grounded on the teacher's `ControllerState { client: Client }` pattern —
//! one small `Arc`-wrapped bag of shared handles built once in `main.rs` and
//! cloned into each task/handler — generalized from "just a Kubernetes
//! client" to the full set of collaborators this control plane needs.
//! `clap` (`derive`, `env`) mirrors the teacher's existing dependency,
//! previously only exercised by the `kubectl-stellar` plugin binary.

use std::sync::Arc;

use clap::Parser;

use crate::auth::JwksCache;
#[cfg(feature = "metrics")]
use crate::metrics::Metrics;
use crate::provider::ProviderClient;
use crate::store::StateStore;

#[derive(Parser, Debug, Clone)]
#[command(name = "gpu-fleet-operator", about = "Self-service GPU instance control plane")]
pub struct Config {
    /// Base URL of the upstream GPU cloud provider API.
    #[arg(long, env = "PROVIDER_BASE_URL")]
    pub provider_base_url: String,

    /// Address the REST API listens on.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8080")]
    pub bind_addr: String,

    /// JWKS endpoint used to verify bearer JWTs.
    #[arg(long, env = "JWKS_URL")]
    pub jwks_url: String,

    /// Emails that bootstrap into an admin Candidate on first sign-in
    /// (Design Note O4), comma-separated.
    #[arg(long, env = "ADMIN_EMAILS", value_delimiter = ',')]
    pub admin_emails: Vec<String>,

    /// Reconciler tick interval in seconds (spec §4.4: "every minute").
    #[arg(long, env = "RECONCILE_INTERVAL_SECS", default_value_t = 60)]
    pub reconcile_interval_secs: u64,

    /// Base URL this service is reachable at, used to compose the
    /// seed-complete callback URL embedded in loader-VM user data.
    #[arg(long, env = "APP_BASE_URL")]
    pub app_base_url: String,

    /// Root path shared filesystems are mounted under on provisioned VMs.
    #[arg(long, env = "MOUNT_ROOT", default_value = "/home/fs")]
    pub mount_root: String,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: StateStore,
    pub provider: Arc<dyn ProviderClient>,
    pub jwks: Arc<JwksCache>,
    #[cfg(feature = "metrics")]
    pub metrics: Arc<Metrics>,
}
