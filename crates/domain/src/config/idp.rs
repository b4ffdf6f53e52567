use serde::{Deserialize, Serialize};

/// Environment selector, per §6: `current_environment` with
/// per-environment API settings. Overridable by `BN_ENVIRONMENT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Local,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Local
    }
}

/// Upstream identity-provider endpoint (the Identity Bridge's only
/// collaborator). `nsn_url` is the full base URL used for requests;
/// `nsn_host`/`nsn_port` are kept for parity with the two-environment
/// config shape in §6 and are informational once `nsn_url` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpEndpoint {
    pub nsn_url: String,
    #[serde(default)]
    pub nsn_host: String,
    #[serde(default)]
    pub nsn_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpConfig {
    #[serde(default = "d_env")]
    pub current_environment: Environment,
    pub local: IdpEndpoint,
    pub production: IdpEndpoint,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            current_environment: d_env(),
            local: IdpEndpoint {
                nsn_url: "http://127.0.0.1:9000".into(),
                nsn_host: "127.0.0.1".into(),
                nsn_port: 9000,
            },
            production: IdpEndpoint {
                nsn_url: "https://idp.example.com".into(),
                nsn_host: "idp.example.com".into(),
                nsn_port: 443,
            },
        }
    }
}

impl IdpConfig {
    /// Resolve the environment-specific endpoint, honoring `BN_ENVIRONMENT`
    /// as an override over `current_environment`.
    pub fn active(&self) -> &IdpEndpoint {
        let env = std::env::var("BN_ENVIRONMENT")
            .ok()
            .and_then(|v| match v.to_lowercase().as_str() {
                "local" => Some(Environment::Local),
                "production" => Some(Environment::Production),
                _ => None,
            })
            .unwrap_or(self.current_environment);
        match env {
            Environment::Local => &self.local,
            Environment::Production => &self.production,
        }
    }
}

fn d_env() -> Environment {
    Environment::Local
}
