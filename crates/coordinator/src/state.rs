use std::path::PathBuf;
use std::sync::Arc;

use bn_domain::config::Config;

use crate::attestation::AttestationRegistry;
use crate::fanout::FanoutRegistry;
use crate::hierarchy::NodeHierarchy;
use crate::identity::IdentityBridge;
use crate::logout::LogoutAckRegistry;
use crate::nodes::registry::ConnectionRegistry;
use crate::pairing::PairingCodeService;
use crate::store::CredentialStore;

/// Shared application state passed to all API/WS handlers.
///
/// Fields are grouped by concern:
/// - **Core services**: config, identity bridge, credential store
/// - **Overlay**: connection registry, node hierarchy
/// - **Protocol coordination**: attestation, logout acks, activity batches
/// - **Security**: bearer-token hashes for `/bind` and the admin snapshot
#[derive(Clone)]
pub struct AppState {
    // ── Core services ────────────────────────────────────────────────
    pub config: Arc<Config>,
    pub identity: Arc<IdentityBridge>,
    pub credentials: Arc<dyn CredentialStore>,

    // ── Overlay ──────────────────────────────────────────────────────
    pub registry: Arc<ConnectionRegistry>,
    pub hierarchy: Arc<NodeHierarchy>,

    // ── Protocol coordination ────────────────────────────────────────
    pub attestation: Arc<AttestationRegistry>,
    pub logout_acks: Arc<LogoutAckRegistry>,
    pub fanout: Arc<FanoutRegistry>,
    pub pairing: Arc<PairingCodeService>,

    // ── Admin & state directory ──────────────────────────────────────
    pub state_dir: PathBuf,

    // ── Security (startup-computed) ──────────────────────────────────
    /// SHA-256 hash of the `/bind` bearer token. `None` = dev mode.
    pub api_token_hash: Option<Vec<u8>>,
    /// SHA-256 hash of the admin-snapshot bearer token. `None` = dev mode.
    pub admin_token_hash: Option<Vec<u8>>,
}
