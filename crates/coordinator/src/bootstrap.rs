//! AppState construction and background-task spawning, kept out of
//! `main.rs`: `build_app_state` wires every subsystem with one log line
//! per step, `spawn_background_tasks` starts the periodic janitors once
//! the HTTP listener is about to come up.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sha2::{Digest, Sha256};

use bn_domain::config::{Config, ConfigSeverity};

use crate::attestation::AttestationRegistry;
use crate::fanout::FanoutRegistry;
use crate::hierarchy::NodeHierarchy;
use crate::identity::IdentityBridge;
use crate::logout::LogoutAckRegistry;
use crate::nodes::registry::ConnectionRegistry;
use crate::pairing::PairingCodeService;
use crate::state::AppState;
use crate::store::InMemoryCredentialStore;

/// Validate config, initialize every subsystem and return a fully-wired
/// [`AppState`]. Shared by `serve` and `doctor`.
pub async fn build_app_state(config: Arc<Config>, state_dir: PathBuf) -> anyhow::Result<AppState> {
    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues.iter().filter(|i| i.severity == ConfigSeverity::Error).count()
        );
    }

    std::fs::create_dir_all(&state_dir).context("creating state directory")?;

    // ── Credential store ─────────────────────────────────────────────
    let credentials = Arc::new(InMemoryCredentialStore::new(&state_dir));
    tracing::info!(path = %state_dir.display(), "credential store ready");

    // ── Identity bridge ───────────────────────────────────────────────
    let idp_endpoint = config.idp.active();
    let identity = Arc::new(IdentityBridge::new(
        idp_endpoint.nsn_url.clone(),
        Duration::from_secs(config.timeouts.idp_signup_secs),
        Duration::from_secs(config.timeouts.idp_login_secs),
    ));
    tracing::info!(base_url = %idp_endpoint.nsn_url, "identity bridge ready");

    // ── Connection registry + node hierarchy ─────────────────────────
    let registry = Arc::new(ConnectionRegistry::new());
    let hierarchy = Arc::new(NodeHierarchy::new(config.hierarchy.child_capacity));
    tracing::info!(child_capacity = config.hierarchy.child_capacity, "connection registry + node hierarchy ready");

    // ── Attestation / logout-ack / fan-out / pairing registries ──────
    let attestation = Arc::new(AttestationRegistry::new());
    let logout_acks = Arc::new(LogoutAckRegistry::new());
    let fanout = Arc::new(FanoutRegistry::new());
    let pairing = Arc::new(PairingCodeService::new(Duration::from_secs(
        (config.pairing.ttl_minutes * 60).max(0) as u64,
    )));
    tracing::info!("protocol coordination registries ready");

    // ── API / admin bearer tokens (read once, hashed) ────────────────
    let api_token_hash = {
        let env_var = &config.server.api_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %env_var, "API bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("API bearer-token auth DISABLED, set {env_var} to enable");
                None
            }
        }
    };
    let admin_token_hash = {
        let env_var = &config.server.admin_token_env;
        match std::env::var(env_var).ok().filter(|t| !t.is_empty()) {
            Some(t) => {
                tracing::info!(source = %env_var, "admin bearer-token auth enabled");
                Some(Sha256::digest(t.as_bytes()).to_vec())
            }
            None => {
                tracing::warn!("admin bearer-token auth DISABLED, set {env_var} to enable");
                None
            }
        }
    };

    Ok(AppState {
        config,
        identity,
        credentials,
        registry,
        hierarchy,
        attestation,
        logout_acks,
        fanout,
        pairing,
        state_dir,
        api_token_hash,
        admin_token_hash,
    })
}

/// Spawn the long-running background tokio tasks: pairing-code sweep and
/// activity-batch GC. Call after [`build_app_state`], before accepting
/// connections.
pub fn spawn_background_tasks(state: &AppState) {
    {
        let pairing = state.pairing.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                let removed = pairing.sweep_expired();
                if removed > 0 {
                    tracing::info!(removed, "swept expired pairing codes");
                }
            }
        });
    }

    {
        let fanout = state.fanout.clone();
        let ttl = Duration::from_secs((state.config.batches.ttl_hours.max(0) as u64) * 3_600);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1_800));
            loop {
                interval.tick().await;
                let removed = fanout.gc_expired(ttl);
                if removed > 0 {
                    tracing::info!(removed, "evicted stale activity batches");
                }
            }
        });
    }

    tracing::info!("background tasks spawned");
}
