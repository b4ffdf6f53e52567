//! Wire protocol between the coordinator and connected C-Nodes.
//!
//! Every frame is a JSON object tagged by `type`. The protocol is
//! bidirectional over a single WebSocket per C-Node: some variants are only
//! ever sent one way, others (`user_activities_batch`, the attestation
//! frames) are reused for both the original event and its fan-out.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum number of children (clusters per domain, channels per cluster,
/// nodes per channel) a single hierarchy tier node may hold.
pub const TIER_CHILD_CAPACITY: usize = 1000;

/// Minimum number of records a sync batch must carry to count as a "valid
/// batch" during cluster attestation.
pub const MIN_ATTESTATION_BATCH_SIZE: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    // ── Registration ────────────────────────────────────────────────
    /// C-Node → coordinator: first frame on a new socket.
    #[serde(rename = "c_client_register")]
    ClientRegister {
        node_id: String,
        client_install_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
        /// May be a real username or an outstanding pairing code (§4.8).
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        domain_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        cluster_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_id: Option<String>,
    },

    #[serde(rename = "registration_success")]
    RegistrationSuccess {
        node_id: String,
        client_install_id: String,
        user_id: String,
        username: String,
        domain_id: String,
        cluster_id: String,
        channel_id: String,
        is_domain_head: bool,
        is_cluster_head: bool,
        is_channel_head: bool,
    },

    #[serde(rename = "registration_rejected")]
    RegistrationRejected { message: String },

    // ── Cookie / session delivery (§4.5, §4.5a) ─────────────────────
    /// Coordinator → agent: the credential push described in §4.5a.
    #[serde(rename = "cookie_update")]
    CookieUpdate {
        user_id: String,
        username: String,
        cookie_blob: String,
        site_url: String,
        site_name: String,
        partition_key: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        advisory: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        attestation_passed: Option<bool>,
    },

    #[serde(rename = "cookie_update_response")]
    CookieUpdateResponse {
        user_id: String,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Coordinator → agent: push a previously-seen session onto a
    /// newly-registered device (the "auto_login" session push of §4.5).
    #[serde(rename = "auto_login")]
    AutoLogin {
        user_id: String,
        username: String,
        complete_session_data: Value,
    },

    /// Coordinator → agent: forces a resync of a device's session state.
    #[serde(rename = "session_sync")]
    SessionSync {
        user_id: String,
        complete_session_data: Value,
    },

    #[serde(rename = "session_feedback")]
    SessionFeedback {
        user_id: String,
        success: bool,
    },

    /// C-Node → coordinator: a peer device observed the user logging in
    /// locally (outside the bind endpoint, e.g. IdP redirect completed).
    #[serde(rename = "user_login_notification")]
    UserLoginNotification {
        user_id: String,
        username: String,
    },

    /// Coordinator → every other live session of the user: advisory that
    /// a second live session just appeared (§4.2 notification rule).
    #[serde(rename = "peer_login")]
    PeerLogin {
        user_id: String,
        username: String,
        node_id: String,
    },

    // ── Logout barrier (§4.7) ───────────────────────────────────────
    #[serde(rename = "user_logout_notification")]
    UserLogoutNotification { user_id: String },

    /// Coordinator → agent: carries the upstream logout URL the agent
    /// should visit to actually tear down the IdP session.
    #[serde(rename = "user_logout")]
    UserLogout {
        user_id: String,
        logout_url: String,
    },

    /// Agent → coordinator: ack for `user_logout`, matched by
    /// `client_install_id`, never by socket identity (§4.7).
    #[serde(rename = "logout_feedback")]
    LogoutFeedback {
        client_install_id: String,
        success: bool,
    },

    // ── Activity fan-out (§4.6) ─────────────────────────────────────
    /// Reused for both the original ingress frame and the coordinator's
    /// forward of the (filtered) batch to each peer.
    #[serde(rename = "user_activities_batch")]
    UserActivitiesBatch {
        user_id: String,
        batch_id: String,
        sync_data: Vec<Value>,
    },

    #[serde(rename = "user_activities_batch_feedback")]
    UserActivitiesBatchFeedback {
        batch_id: String,
        success: bool,
    },

    // ── Cluster attestation protocol (§4.5b) ────────────────────────
    /// Coordinator → witness: "do you hold a valid batch for this channel?"
    /// `min_record_count` carries the coordinator's configured
    /// `MIN_ATTESTATION_BATCH_SIZE` threshold (§4.5b step 1) so the witness
    /// applies the same definition of "valid batch" the coordinator does.
    #[serde(rename = "cluster_verification_query")]
    ClusterVerificationQuery {
        verification_id: String,
        min_record_count: usize,
    },

    /// Coordinator → joiner: "send your first record of `batch_id`."
    #[serde(rename = "cluster_verification_request")]
    ClusterVerificationRequest {
        verification_id: String,
        batch_id: String,
    },

    /// Either side → coordinator, in response to a query or a request.
    #[serde(rename = "cluster_verification_response")]
    ClusterVerificationResponse {
        verification_id: String,
        has_valid_batch: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        batch_id: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        record: Option<Value>,
    },

    // ── Pairing codes (§4.8) ─────────────────────────────────────────
    #[serde(rename = "request_security_code")]
    RequestSecurityCode { user_id: String, username: String },

    #[serde(rename = "security_code_response")]
    SecurityCodeResponse { code: String },

    // ── Generic hierarchy RPC (§4.4) ────────────────────────────────
    /// Coordinator → agent: one of the hierarchy-placement commands. The
    /// dispatcher correlates the reply by `request_id` alone; ordering
    /// beyond that is whatever the agent wrote frames in.
    #[serde(rename = "rpc_request")]
    RpcRequest {
        request_id: String,
        command_type: CommandType,
        #[serde(default)]
        payload: Value,
    },

    /// Agent → coordinator: reply to any `rpc_request`.
    #[serde(rename = "rpc_response")]
    RpcResponse {
        request_id: String,
        command_type: CommandType,
        success: bool,
        #[serde(default)]
        data: Value,
    },

    // ── Heartbeat ────────────────────────────────────────────────────
    #[serde(rename = "ping")]
    Ping { timestamp: i64 },
    #[serde(rename = "pong")]
    Pong { timestamp: i64 },
}

/// The hierarchy/placement commands the coordinator may dispatch to a
/// member agent over `rpc_request` (§4.3, §4.4). The agent mints the
/// UUID for every `new_*` command, the coordinator never does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    NewDomainNode,
    NewClusterNode,
    NewChannelNode,
    AssignToDomain,
    AssignToCluster,
    AssignToChannel,
    CountPeersAmount,
    AddNewDomainToPeers,
    AddNewClusterToPeers,
    AddNewChannelToPeers,
    AddNewNodeToPeers,
}

impl CommandType {
    /// True for the commands that mint a fresh hierarchy ID in their reply.
    pub fn mints_id(self) -> bool {
        matches!(
            self,
            CommandType::NewDomainNode | CommandType::NewClusterNode | CommandType::NewChannelNode
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_register_round_trips() {
        let frame = Frame::ClientRegister {
            node_id: "node-1".into(),
            client_install_id: "client-1".into(),
            user_id: None,
            username: Some("alice".into()),
            domain_id: None,
            cluster_id: None,
            channel_id: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "c_client_register");
        assert!(json.get("user_id").is_none());
        let back: Frame = serde_json::from_value(json).unwrap();
        match back {
            Frame::ClientRegister { username, .. } => assert_eq!(username.as_deref(), Some("alice")),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn rpc_request_tags_command_type_snake_case() {
        let frame = Frame::RpcRequest {
            request_id: "r1".into(),
            command_type: CommandType::AddNewClusterToPeers,
            payload: serde_json::json!({"cluster_id": "c1"}),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["command_type"], "add_new_cluster_to_peers");
    }

    #[test]
    fn mints_id_only_for_new_tier_commands() {
        assert!(CommandType::NewClusterNode.mints_id());
        assert!(!CommandType::AssignToCluster.mints_id());
        assert!(!CommandType::CountPeersAmount.mints_id());
    }

    #[test]
    fn logout_feedback_matches_by_client_install_id() {
        let json = serde_json::json!({
            "type": "logout_feedback",
            "client_install_id": "client-9",
            "success": true,
        });
        let frame: Frame = serde_json::from_value(json).unwrap();
        match frame {
            Frame::LogoutFeedback { client_install_id, success } => {
                assert_eq!(client_install_id, "client-9");
                assert!(success);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
