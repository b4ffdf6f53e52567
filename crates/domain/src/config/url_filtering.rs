use serde::{Deserialize, Serialize};

/// Per-batch content filter configuration (§6). The predicate itself
/// (exact-host or glob match) lives in `bn_coordinator::fanout::url_allowed`;
/// this struct is just the declared policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UrlFilteringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allowed_patterns: Vec<String>,
}
