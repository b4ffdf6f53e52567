/// Shared error type used across all B-Node crates.
///
/// Variants map onto the error taxonomy the coordinator reports through:
/// transport/timeout conditions are transient and per-session, the
/// `*Failed`/`*Exceeded` variants are protocol-level outcomes that a caller
/// (the bind endpoint, an RPC dispatcher) turns into a typed response
/// rather than tearing anything down.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP: {0}")]
    Http(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("config: {0}")]
    Config(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("rpc rejected: {0}")]
    RpcRejected(String),

    #[error("attestation failed: {0}")]
    AttestationFailed(String),

    #[error("placement failed: {0}")]
    PlacementFailed(String),

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("upstream IdP error: {0}")]
    UpstreamIdp(String),

    #[error("session closed: {0}")]
    SessionClosed(String),

    #[error("internal state invariant violated: {0}")]
    StateInvariant(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
