//! Agent Session (C1) WebSocket handshake and read-loop: the entry point
//! that turns a raw socket into a registered [`AgentSession`], places it in
//! the hierarchy, and dispatches every inbound frame to the module that
//! owns it. A split-sink writer task drains an `mpsc` channel, a
//! hello-with-timeout handshake gates registration, and cleanup runs on
//! disconnect. Dispatch is generalized from a single request/response RPC
//! shape to the hierarchy/broker/attestation/logout/fanout/pairing modules this
//! coordinator actually runs.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};

use bn_protocol::Frame;

use crate::broker::{BindRequest, SessionBroker};
use crate::fanout;
use crate::hierarchy::PlacementRequest;
use crate::nodes::registry::Collision;
use crate::session::AgentSession;
use crate::state::AppState;

const HELLO_TIMEOUT: Duration = Duration::from_secs(10);
const OUTBOUND_BUFFER: usize = 64;

/// `GET /v1/nodes/ws`, upgrade handler. No auth at the HTTP layer: a
/// C-Node authenticates implicitly by presenting a known `user_id` or a
/// valid pairing code in its first frame (§4.2, §4.8).
pub async fn node_ws(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, state))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let hello = match wait_for_hello(&mut stream).await {
        Some(frame) => frame,
        None => {
            tracing::debug!(%addr, "socket closed before a c_client_register frame arrived");
            let _ = sink.close().await;
            return;
        }
    };

    let Frame::ClientRegister {
        node_id,
        client_install_id,
        user_id,
        username,
        domain_id,
        cluster_id,
        channel_id,
    } = hello
    else {
        tracing::warn!(%addr, "first frame was not c_client_register, closing");
        let _ = sink.close().await;
        return;
    };

    // Pairing-code resolution (§4.8): a `username` that matches an
    // outstanding code overrides whatever identity the caller advertised.
    let (user_id, username, pairing_hint) = match username
        .as_deref()
        .and_then(|candidate| state.pairing.consume_if_matches(candidate))
    {
        Some(record) => (
            Some(record.user_id),
            Some(record.username),
            Some((record.domain_id, record.cluster_id, record.channel_id)),
        ),
        None => (user_id, username, None),
    };

    // Pairing-code collision policy (§4.2 rule 4, §4.8c): a device bootstrapping
    // through a code is allowed to displace whatever stale session already
    // occupies its client_install_id, rather than being rejected for a
    // node-id mismatch the way an ordinary re-registration would be.
    if pairing_hint.is_some() {
        for stale in state.registry.evict_client(&client_install_id) {
            stale.close(false);
            state.hierarchy.remove_session(&stale);
            tracing::info!(
                client_install_id = %client_install_id,
                node_id = %stale.node_id,
                "pairing-code registration evicted a stale device session"
            );
        }
    }

    let (outbound_tx, mut outbound_rx) = tokio::sync::mpsc::channel::<Frame>(OUTBOUND_BUFFER);
    let session = Arc::new(AgentSession::new(node_id.clone(), client_install_id.clone(), outbound_tx));
    if let (Some(uid), Some(uname)) = (&user_id, &username) {
        session.set_identity(uid.clone(), uname.clone());
    }

    let writer = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    match state.registry.register(session.clone()) {
        Collision::RejectedDifferentNode => {
            let _ = session
                .send(Frame::RegistrationRejected {
                    message: "client_install_id is already bound to a different node".into(),
                })
                .await;
            session.close(false);
            writer.abort();
            return;
        }
        Collision::ExactDuplicate { existing } => {
            let _ = existing
                .send(Frame::RegistrationRejected {
                    message: "duplicate registration ignored".into(),
                })
                .await;
            session.close(false);
            writer.abort();
            return;
        }
        Collision::Rebound { .. } | Collision::Fresh => {}
    }

    let placement_req = pairing_hint
        .map(|(d, c, ch)| PlacementRequest {
            domain_id: d,
            cluster_id: c,
            channel_id: ch,
        })
        .unwrap_or(PlacementRequest {
            domain_id,
            cluster_id,
            channel_id,
        });

    let placement = match state.hierarchy.place(&session, placement_req, &state.registry).await {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(node_id = %node_id, error = %e, "placement failed");
            let _ = session
                .send(Frame::RegistrationRejected {
                    message: format!("placement failed: {e}"),
                })
                .await;
            state.registry.unregister(&session);
            session.close(false);
            writer.abort();
            return;
        }
    };

    if let (Some(uid), Some(uname)) = (session.user_id(), session.username()) {
        let _ = session
            .send(Frame::RegistrationSuccess {
                node_id: node_id.clone(),
                client_install_id: client_install_id.clone(),
                user_id: uid.clone(),
                username: uname,
                domain_id: placement.domain_id.clone().unwrap_or_default(),
                cluster_id: placement.cluster_id.clone().unwrap_or_default(),
                channel_id: placement.channel_id.clone().unwrap_or_default(),
                is_domain_head: placement.is_domain_head,
                is_cluster_head: placement.is_cluster_head,
                is_channel_head: placement.is_channel_head,
            })
            .await;

        state.registry.notify_peer_login(&session).await;

        // New registration also runs the broker's bind procedure so a
        // second device picks up the user's session automatically.
        let broker = SessionBroker {
            registry: &state.registry,
            store: state.credentials.as_ref(),
            identity: &state.identity,
            attestation: &state.attestation,
            attestation_timeout: Duration::from_secs(state.config.timeouts.attestation_secs),
            delivery_timeout: Duration::from_secs(state.config.timeouts.cookie_delivery_secs),
            min_batch_size: state.config.batches.min_batch_size,
        };
        let req = BindRequest {
            user_id: uid,
            username: session.username().unwrap_or_default(),
            account: None,
            password: None,
            site_url: String::new(),
            site_name: String::new(),
            partition_key: session.user_id().unwrap_or_default(),
        };
        match broker.bind(req, Some(&session)).await {
            Ok(outcome) if !outcome.success => {
                tracing::debug!(node_id = %node_id, message = %outcome.message, "bind-on-registration did not deliver a session");
            }
            Err(e) => tracing::warn!(node_id = %node_id, error = %e, "bind-on-registration failed"),
            _ => {}
        }
    } else {
        let _ = session
            .send(Frame::RegistrationRejected {
                message: "no identity resolved from registration or pairing code".into(),
            })
            .await;
    }

    let pinger = {
        let session = session.clone();
        let ping_interval = Duration::from_secs(state.config.timeouts.ping_interval_secs);
        let pong_grace = Duration::from_secs(state.config.timeouts.pong_grace_secs);
        tokio::spawn(async move { heartbeat(session, ping_interval, pong_grace).await })
    };

    read_loop(&state, &session, &mut stream).await;

    pinger.abort();
    session.close(false);
    state.registry.unregister(&session);
    state.hierarchy.remove_session(&session);
    writer.abort();
    tracing::info!(node_id = %node_id, %addr, "c-node disconnected");
}

/// Server-initiated liveness check (§5): a ping every `ping_interval`,
/// closing the transport if no pong lands within `pong_grace`. Runs
/// alongside the read-loop rather than inside it, since a stalled agent
/// won't produce any inbound frame to hang this off of.
async fn heartbeat(session: Arc<AgentSession>, ping_interval: Duration, pong_grace: Duration) {
    let mut ticker = tokio::time::interval(ping_interval);
    ticker.tick().await; // first tick fires immediately, skip it
    loop {
        ticker.tick().await;
        let now = chrono::Utc::now().timestamp_millis();
        if session.send(Frame::Ping { timestamp: now }).await.is_err() {
            return;
        }
        if tokio::time::timeout(pong_grace, session.await_pong(now)).await.is_err() {
            tracing::warn!(node_id = %session.node_id, "no pong within grace period, closing transport");
            session.mark_transport_closed();
            return;
        }
    }
}

async fn wait_for_hello(stream: &mut SplitStream<WebSocket>) -> Option<Frame> {
    tokio::time::timeout(HELLO_TIMEOUT, async {
        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Ok(frame) = serde_json::from_str::<Frame>(&text) {
                        return Some(frame);
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
        None
    })
    .await
    .unwrap_or(None)
}

async fn read_loop(state: &AppState, session: &Arc<AgentSession>, stream: &mut SplitStream<WebSocket>) {
    while let Some(msg) = stream.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Binary(_)) => continue,
            Err(e) => {
                tracing::debug!(node_id = %session.node_id, error = %e, "ws read error");
                break;
            }
        };
        let frame: Frame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                tracing::debug!(node_id = %session.node_id, error = %e, "dropping unparseable frame");
                continue;
            }
        };
        handle_inbound(state, session, frame).await;
    }
}

async fn handle_inbound(state: &AppState, session: &Arc<AgentSession>, frame: Frame) {
    match frame {
        Frame::RpcResponse { ref request_id, .. } => {
            session.complete_rpc(request_id, frame);
        }

        Frame::ClusterVerificationResponse { .. } => {
            let Some(user_id) = session.user_id() else { return };
            // The arriving socket's node_id deterministically identifies a
            // witness; try that key first so a late witness reply can
            // never be mistaken for the joiner's own response once both
            // keys are registered (they share the same user_id).
            if !state.attestation.resolve(&format!("witness:{}", session.node_id), frame.clone()) {
                state.attestation.resolve(&format!("client_{user_id}"), frame);
            }
        }

        Frame::LogoutFeedback { client_install_id, success } => {
            if success {
                state.logout_acks.record_ack(&client_install_id);
            }
        }

        Frame::UserActivitiesBatchFeedback { batch_id, .. } => {
            state.fanout.record_ack(&batch_id);
        }

        Frame::UserActivitiesBatch { user_id, batch_id, sync_data } => {
            let channel_id = session.placement().channel_id;
            let peers: Vec<Arc<AgentSession>> = match channel_id {
                Some(ref ch) => state
                    .registry
                    .lookup_by_user(&user_id)
                    .into_iter()
                    .filter(|s| s.node_id != session.node_id && s.placement().channel_id.as_deref() == Some(ch.as_str()))
                    .collect(),
                None => Vec::new(),
            };
            let ack = fanout::fan_out(
                &state.fanout,
                &session.node_id,
                &user_id,
                &batch_id,
                sync_data,
                &peers,
                &state.config.url_filtering,
            )
            .await;
            let _ = session.send(ack).await;
        }

        Frame::RequestSecurityCode { user_id, username } => {
            let placement = session.placement();
            let code = state.pairing.issue_or_reuse(
                &user_id,
                &username,
                placement.domain_id,
                placement.cluster_id,
                placement.channel_id,
            );
            let _ = session.send(Frame::SecurityCodeResponse { code }).await;
        }

        Frame::UserLoginNotification { user_id, username } => {
            tracing::debug!(node_id = %session.node_id, user_id, username, "peer-observed login notification");
            state.registry.notify_peer_login(session).await;
        }

        Frame::UserLogoutNotification { user_id } => {
            tracing::debug!(node_id = %session.node_id, user_id, "peer-observed logout notification");
        }

        Frame::Ping { timestamp } => {
            let _ = session.send(Frame::Pong { timestamp }).await;
        }

        Frame::Pong { timestamp } => {
            session.record_pong(timestamp);
        }

        other => {
            tracing::debug!(node_id = %session.node_id, frame = ?other, "frame not handled on the inbound path");
        }
    }
}
