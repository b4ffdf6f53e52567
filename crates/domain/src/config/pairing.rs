use serde::{Deserialize, Serialize};

/// Pairing-code lifetime (C8). Codes older than `ttl_minutes` are swept by
/// a background task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairingConfig {
    #[serde(default = "d_ttl")]
    pub ttl_minutes: i64,
}

impl Default for PairingConfig {
    fn default() -> Self {
        Self { ttl_minutes: d_ttl() }
    }
}

fn d_ttl() -> i64 {
    15
}
