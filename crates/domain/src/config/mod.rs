mod batches;
mod hierarchy;
mod idp;
mod pairing;
mod server;
mod timeouts;
mod url_filtering;

pub use batches::*;
pub use hierarchy::*;
pub use idp::*;
pub use pairing::*;
pub use server::*;
pub use timeouts::*;
pub use url_filtering::*;

use serde::{Deserialize, Serialize};
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub idp: IdpConfig,
    #[serde(default)]
    pub url_filtering: UrlFilteringConfig,
    #[serde(default)]
    pub hierarchy: HierarchyConfig,
    #[serde(default)]
    pub timeouts: TimeoutsConfig,
    #[serde(default)]
    pub pairing: PairingConfig,
    #[serde(default)]
    pub batches: BatchesConfig,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl Config {
    /// Validate the configuration and return a list of issues. An empty
    /// vec means everything looks good; the caller refuses to start only
    /// when at least one issue has `Error` severity.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();

        if self.server.port == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.port".into(),
                message: "port must be greater than 0".into(),
            });
        }
        if self.server.host.is_empty() {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "server.host".into(),
                message: "host must not be empty".into(),
            });
        }

        for (name, endpoint) in [
            ("idp.local", &self.idp.local),
            ("idp.production", &self.idp.production),
        ] {
            if !endpoint.nsn_url.starts_with("http://") && !endpoint.nsn_url.starts_with("https://")
            {
                issues.push(ConfigIssue {
                    severity: ConfigSeverity::Error,
                    field: format!("{name}.nsn_url"),
                    message: format!(
                        "nsn_url must start with http:// or https:// (got \"{}\")",
                        endpoint.nsn_url
                    ),
                });
            }
        }

        if self.url_filtering.enabled
            && self.url_filtering.allowed_domains.is_empty()
            && self.url_filtering.allowed_patterns.is_empty()
        {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                field: "url_filtering".into(),
                message: "filtering is enabled but no domains or patterns are configured, every batch item will be dropped".into(),
            });
        }

        if self.hierarchy.child_capacity == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "hierarchy.child_capacity".into(),
                message: "child_capacity must be greater than 0".into(),
            });
        }

        if self.batches.min_batch_size == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                field: "batches.min_batch_size".into(),
                message: "min_batch_size must be greater than 0".into(),
            });
        }

        issues
    }

    /// Load from a TOML file at `path`, falling back to defaults if the
    /// file does not exist.
    pub fn load_from(path: &std::path::Path) -> crate::error::Result<Self> {
        if path.exists() {
            let raw = std::fs::read_to_string(path)?;
            toml::from_str(&raw).map_err(|e| crate::error::Error::Config(e.to_string()))
        } else {
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate_clean() {
        let issues = Config::default().validate();
        assert!(issues.iter().all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn zero_port_is_an_error() {
        let mut cfg = Config::default();
        cfg.server.port = 0;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "server.port" && i.severity == ConfigSeverity::Error));
    }

    #[test]
    fn bad_idp_url_is_an_error() {
        let mut cfg = Config::default();
        cfg.idp.local.nsn_url = "not-a-url".into();
        let issues = cfg.validate();
        assert!(issues.iter().any(|i| i.field == "idp.local.nsn_url"));
    }

    #[test]
    fn filtering_enabled_without_rules_warns() {
        let mut cfg = Config::default();
        cfg.url_filtering.enabled = true;
        let issues = cfg.validate();
        assert!(issues
            .iter()
            .any(|i| i.field == "url_filtering" && i.severity == ConfigSeverity::Warning));
    }
}
