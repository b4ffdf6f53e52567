//! `POST /bind` (§6): the only HTTP entry-point considered core-facing.
//! Maps the wire request onto [`SessionBroker::bind`] for signup/login, or
//! onto the Logout Barrier for `request_type = 2`, as laid out in §4.5/§4.7.

use std::time::Duration;

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::broker::{BindOutcome, BindRequest, SessionBroker};
use crate::logout::{run_logout_barrier, LogoutScope};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct BindPayload {
    pub user_id: String,
    pub user_name: String,
    pub request_type: u8,
    #[serde(default)]
    pub domain_id: Option<String>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub channel_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub session_cookie: Option<String>,
    #[serde(default)]
    pub nsn_user_id: Option<String>,
    #[serde(default)]
    pub nsn_username: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BindResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub complete_session_data: Option<serde_json::Value>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<BindOutcome> for BindResponse {
    fn from(outcome: BindOutcome) -> Self {
        BindResponse {
            success: outcome.success,
            complete_session_data: Some(serde_json::json!({
                "delivered_to": outcome.delivered_to,
                "targeted": outcome.targeted,
            })),
            message: outcome.message,
            error: None,
        }
    }
}

/// `POST /bind`, signup (0), login (1), logout (2). See §4.5 / §4.7.
pub async fn bind(State(state): State<AppState>, Json(payload): Json<BindPayload>) -> Json<BindResponse> {
    match payload.request_type {
        0 | 1 => {
            let broker = SessionBroker {
                registry: &state.registry,
                store: state.credentials.as_ref(),
                identity: &state.identity,
                attestation: &state.attestation,
                attestation_timeout: Duration::from_secs(state.config.timeouts.attestation_secs),
                delivery_timeout: Duration::from_secs(state.config.timeouts.cookie_delivery_secs),
                min_batch_size: state.config.batches.min_batch_size,
            };
            let idp_endpoint = state.config.idp.active();
            let req = BindRequest {
                user_id: payload.user_id.clone(),
                username: payload.user_name.clone(),
                account: payload.account,
                password: payload.password,
                site_url: idp_endpoint.nsn_url.clone(),
                site_name: idp_endpoint.nsn_host.clone(),
                partition_key: payload.user_id.clone(),
            };
            let joining_session = payload.node_id.as_deref().and_then(|n| state.registry.lookup_by_node(n));
            match broker.bind(req, joining_session.as_ref()).await {
                Ok(outcome) => Json(outcome.into()),
                Err(e) => Json(BindResponse {
                    success: false,
                    complete_session_data: None,
                    message: e.to_string(),
                    error: Some(e.to_string()),
                }),
            }
        }
        2 => {
            let scope = match &payload.client_id {
                Some(client_id) => LogoutScope::SingleClient(client_id.clone()),
                None => LogoutScope::AllSessionsOfUser(payload.user_id.clone()),
            };
            let idp_endpoint = state.config.idp.active();
            let logout_url = format!("{}/logout", idp_endpoint.nsn_url);
            let outcome = run_logout_barrier(
                &state.registry,
                &state.hierarchy,
                &state.logout_acks,
                state.credentials.as_ref(),
                scope,
                &logout_url,
                Duration::from_secs(state.config.timeouts.logout_ack_secs),
            )
            .await;
            Json(BindResponse {
                success: true,
                complete_session_data: Some(serde_json::json!({
                    "targeted": outcome.targeted,
                    "acknowledged": outcome.acknowledged,
                    "timed_out": outcome.timed_out,
                })),
                message: if outcome.timed_out {
                    format!("logout timed out: {}/{} acknowledged", outcome.acknowledged, outcome.targeted)
                } else {
                    "logout complete".into()
                },
                error: None,
            })
        }
        other => Json(BindResponse {
            success: false,
            complete_session_data: None,
            message: format!("unknown request_type {other}"),
            error: Some("invalid_request_type".into()),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_response_from_outcome_carries_counts() {
        let outcome = BindOutcome {
            success: true,
            message: "ok".into(),
            delivered_to: 2,
            targeted: 2,
        };
        let resp: BindResponse = outcome.into();
        assert!(resp.success);
        assert_eq!(resp.message, "ok");
        assert!(resp.complete_session_data.is_some());
    }
}
