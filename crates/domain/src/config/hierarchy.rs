use serde::{Deserialize, Serialize};

/// Capacity and placement knobs for the Domain → Cluster → Channel overlay
/// (C3). `child_capacity` is the fixed "1000 children per tier node"
/// invariant, made configurable for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HierarchyConfig {
    #[serde(default = "d_child_capacity")]
    pub child_capacity: usize,
}

impl Default for HierarchyConfig {
    fn default() -> Self {
        Self {
            child_capacity: d_child_capacity(),
        }
    }
}

fn d_child_capacity() -> usize {
    1000
}
