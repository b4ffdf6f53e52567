use serde::{Deserialize, Serialize};

/// Every await that can block indefinitely carries a bounded timeout
/// (§5). All values are seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutsConfig {
    #[serde(default = "d_rpc")]
    pub rpc_secs: u64,
    #[serde(default = "d_attestation")]
    pub attestation_secs: u64,
    #[serde(default = "d_logout_ack")]
    pub logout_ack_secs: u64,
    #[serde(default = "d_cookie_delivery")]
    pub cookie_delivery_secs: u64,
    #[serde(default = "d_idp_signup")]
    pub idp_signup_secs: u64,
    #[serde(default = "d_idp_login")]
    pub idp_login_secs: u64,
    /// Window a session's validity result may be memoized for (§4.1).
    #[serde(default = "d_validity_cache")]
    pub validity_cache_secs: u64,
    /// WS ping interval / pong grace (§5 resource limits).
    #[serde(default = "d_ping")]
    pub ping_interval_secs: u64,
    #[serde(default = "d_pong_grace")]
    pub pong_grace_secs: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            rpc_secs: d_rpc(),
            attestation_secs: d_attestation(),
            logout_ack_secs: d_logout_ack(),
            cookie_delivery_secs: d_cookie_delivery(),
            idp_signup_secs: d_idp_signup(),
            idp_login_secs: d_idp_login(),
            validity_cache_secs: d_validity_cache(),
            ping_interval_secs: d_ping(),
            pong_grace_secs: d_pong_grace(),
        }
    }
}

fn d_rpc() -> u64 {
    30
}
fn d_attestation() -> u64 {
    15
}
fn d_logout_ack() -> u64 {
    10
}
fn d_cookie_delivery() -> u64 {
    5
}
fn d_idp_signup() -> u64 {
    5
}
fn d_idp_login() -> u64 {
    30
}
fn d_validity_cache() -> u64 {
    5
}
fn d_ping() -> u64 {
    20
}
fn d_pong_grace() -> u64 {
    10
}
