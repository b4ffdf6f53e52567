use serde::{Deserialize, Serialize};

/// Activity-batch GC policy (C6). Batches older than `ttl_hours` are
/// evicted by the fan-out janitor regardless of ack state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchesConfig {
    #[serde(default = "d_ttl")]
    pub ttl_hours: i64,
    /// Minimum records a stored batch must have to count as "valid" for
    /// attestation purposes (§4.5b `MIN_BATCH_SIZE`).
    #[serde(default = "d_min_batch_size")]
    pub min_batch_size: usize,
}

impl Default for BatchesConfig {
    fn default() -> Self {
        Self {
            ttl_hours: d_ttl(),
            min_batch_size: d_min_batch_size(),
        }
    }
}

fn d_ttl() -> i64 {
    24
}
fn d_min_batch_size() -> usize {
    3
}
