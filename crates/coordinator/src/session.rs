//! Agent Session (C1): the per-connection state machine for one C-Node
//! socket. The outbound sink, the pending-RPC map and the
//! placement/identity fields live together on one struct because a
//! session's RPCs are always addressed to the C-Node that owns it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bn_domain::error::{Error, Result};
use bn_protocol::{CommandType, Frame};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot, Notify};

/// Default RPC deadline (§4.4). Individual calls may override it (e.g. the
/// attestation protocol's 15s window).
pub const DEFAULT_RPC_TIMEOUT: Duration = Duration::from_secs(30);

/// Validity-predicate memoization window (§4.1).
const VALIDITY_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct Placement {
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
    pub is_domain_head: bool,
    pub is_cluster_head: bool,
    pub is_channel_head: bool,
}

#[derive(Debug, Clone, Default)]
struct Identity {
    user_id: Option<String>,
    username: Option<String>,
}

struct PendingRpc {
    command_kind: CommandType,
    created_at: Instant,
    deadline: Instant,
    tx: Option<oneshot::Sender<Frame>>,
}

/// One live WebSocket connection to a C-Node.
pub struct AgentSession {
    pub node_id: String,
    pub client_install_id: String,

    identity: RwLock<Identity>,
    placement: RwLock<Placement>,

    outbound: mpsc::Sender<Frame>,
    pending: Mutex<HashMap<String, PendingRpc>>,

    logout_in_progress: AtomicBool,
    closed_by_logout: AtomicBool,
    logout_ack_tracker: AtomicBool,
    transport_closed: AtomicBool,

    validity_cache: Mutex<Option<(Instant, bool)>>,

    last_pong: Mutex<Option<i64>>,
    pong_notify: Notify,
}

impl AgentSession {
    pub fn new(node_id: String, client_install_id: String, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            node_id,
            client_install_id,
            identity: RwLock::new(Identity::default()),
            placement: RwLock::new(Placement::default()),
            outbound,
            pending: Mutex::new(HashMap::new()),
            logout_in_progress: AtomicBool::new(false),
            closed_by_logout: AtomicBool::new(false),
            logout_ack_tracker: AtomicBool::new(false),
            transport_closed: AtomicBool::new(false),
            validity_cache: Mutex::new(None),
            last_pong: Mutex::new(None),
            pong_notify: Notify::new(),
        }
    }

    // ── Identity / placement accessors ──────────────────────────────

    pub fn user_id(&self) -> Option<String> {
        self.identity.read().user_id.clone()
    }

    pub fn username(&self) -> Option<String> {
        self.identity.read().username.clone()
    }

    pub fn set_identity(&self, user_id: String, username: String) {
        let mut id = self.identity.write();
        id.user_id = Some(user_id);
        id.username = Some(username);
    }

    pub fn placement(&self) -> Placement {
        self.placement.read().clone()
    }

    pub fn set_placement(&self, placement: Placement) {
        *self.placement.write() = placement;
    }

    // ── Validity predicate (§4.1) ───────────────────────────────────

    /// Order is load-bearing: feedback-tracking > logout-closed > transport
    /// state. This prevents premature eviction during the logout barrier.
    fn compute_validity(&self) -> bool {
        if self.logout_in_progress.load(Ordering::SeqCst)
            || self.logout_ack_tracker.load(Ordering::SeqCst)
        {
            return true;
        }
        if self.closed_by_logout.load(Ordering::SeqCst) {
            return false;
        }
        !self.transport_closed.load(Ordering::SeqCst)
    }

    /// Memoized for up to 5s. Use [`Self::is_valid_uncached`] on the
    /// logout-barrier path.
    pub fn is_valid(&self) -> bool {
        let mut cache = self.validity_cache.lock();
        if let Some((at, value)) = *cache {
            if at.elapsed() < VALIDITY_CACHE_TTL {
                return value;
            }
        }
        let value = self.compute_validity();
        *cache = Some((Instant::now(), value));
        value
    }

    /// Bypasses the memoized cache. The logout barrier and delivery paths
    /// MUST use this, see §4.1 and §4.5 step 5.
    pub fn is_valid_uncached(&self) -> bool {
        let value = self.compute_validity();
        *self.validity_cache.lock() = Some((Instant::now(), value));
        value
    }

    // ── Logout-barrier flags (§4.7) ─────────────────────────────────

    pub fn set_logout_in_progress(&self, v: bool) {
        self.logout_in_progress.store(v, Ordering::SeqCst);
    }

    pub fn set_logout_ack_tracker(&self, v: bool) {
        self.logout_ack_tracker.store(v, Ordering::SeqCst);
    }

    pub fn set_closed_by_logout(&self) {
        self.closed_by_logout.store(true, Ordering::SeqCst);
    }

    pub fn mark_transport_closed(&self) {
        self.transport_closed.store(true, Ordering::SeqCst);
    }

    // ── Public contract (§4.1) ──────────────────────────────────────

    /// Enqueues a frame. Fails with `SessionClosed` if the session is
    /// `closed_by_logout` or the transport is down.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        if self.closed_by_logout.load(Ordering::SeqCst) || self.transport_closed.load(Ordering::SeqCst) {
            return Err(Error::SessionClosed(self.node_id.clone()));
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| Error::SessionClosed(self.node_id.clone()))
    }

    /// RPC call: mints a req_id, registers a promise, sends, awaits the
    /// matching response. On timeout the promise is NOT removed, a late
    /// `RpcResponse` is still consumable via [`Self::complete_rpc`].
    pub async fn call(
        &self,
        command_type: CommandType,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Result<Frame> {
        let request_id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        self.pending.lock().insert(
            request_id.clone(),
            PendingRpc {
                command_kind: command_type,
                created_at: now,
                deadline: now + timeout,
                tx: Some(tx),
            },
        );

        let frame = Frame::RpcRequest {
            request_id: request_id.clone(),
            command_type,
            payload,
        };
        if let Err(e) = self.send(frame).await {
            self.pending.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                Err(Error::SessionClosed(self.node_id.clone()))
            }
            Err(_) => Err(Error::Timeout(format!(
                "rpc {request_id} ({command_type:?}) to node {}",
                self.node_id
            ))),
        }
    }

    /// Called by the read-loop when an `RpcResponse` frame arrives for this
    /// session. A reply whose deadline already passed is logged as late and
    /// otherwise discarded, it does not resume the placement chain its
    /// `call()` already failed out of, a deliberate departure: letting a
    /// stale reply keep mutating hierarchy state after the caller moved on
    /// is the exact risk this choice avoids. The returned pair exists for
    /// callers that only want to know which command it answered.
    pub fn complete_rpc(&self, request_id: &str, frame: Frame) -> Option<(CommandType, Frame)> {
        let pending = self.pending.lock().remove(request_id);
        let pending = pending?;
        if pending.deadline < Instant::now() {
            tracing::info!(
                node_id = %self.node_id,
                request_id,
                command_kind = ?pending.command_kind,
                age_ms = pending.created_at.elapsed().as_millis(),
                "late RPC reply processed"
            );
        }
        if let Some(tx) = pending.tx {
            let _ = tx.send(frame.clone());
        }
        Some((pending.command_kind, frame))
    }

    /// Idempotent close: marks the session unusable and drops any pending
    /// RPCs. `logout` distinguishes a logout-barrier close (keeps the
    /// validity predicate escape hatch) from a transport-level close.
    pub fn close(&self, logout: bool) {
        if logout {
            self.set_closed_by_logout();
        } else {
            self.mark_transport_closed();
        }
        self.pending.lock().clear();
    }

    pub fn pending_rpc_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ── Heartbeat (§5) ──────────────────────────────────────────────

    /// Called by the read-loop when a `Pong` frame arrives.
    pub fn record_pong(&self, timestamp: i64) {
        *self.last_pong.lock() = Some(timestamp);
        self.pong_notify.notify_waiters();
    }

    /// Waits for a pong whose timestamp is at least `sent_at`. The caller
    /// wraps this in a `tokio::time::timeout` for the grace-period bound.
    pub async fn await_pong(&self, sent_at: i64) {
        loop {
            let notified = self.pong_notify.notified();
            if let Some(seen) = *self.last_pong.lock() {
                if seen >= sent_at {
                    return;
                }
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> (AgentSession, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        (
            AgentSession::new("node-1".into(), "client-1".into(), tx),
            rx,
        )
    }

    #[test]
    fn fresh_session_is_valid() {
        let (session, _rx) = new_session();
        assert!(session.is_valid());
    }

    #[test]
    fn closed_by_logout_without_ack_tracker_is_invalid() {
        let (session, _rx) = new_session();
        session.set_closed_by_logout();
        assert!(!session.is_valid_uncached());
    }

    #[test]
    fn logout_ack_tracker_keeps_session_visible() {
        let (session, _rx) = new_session();
        session.set_closed_by_logout();
        session.set_logout_ack_tracker(true);
        assert!(
            session.is_valid_uncached(),
            "feedback-tracking must dominate logout-closed per the load-bearing ordering"
        );
    }

    #[test]
    fn transport_closed_without_logout_flags_is_invalid() {
        let (session, _rx) = new_session();
        session.mark_transport_closed();
        assert!(!session.is_valid_uncached());
    }

    #[tokio::test]
    async fn send_fails_after_closed_by_logout() {
        let (session, _rx) = new_session();
        session.set_closed_by_logout();
        let err = session
            .send(Frame::Ping { timestamp: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SessionClosed(_)));
    }

    #[tokio::test]
    async fn late_rpc_reply_is_still_consumed() {
        let (session, mut rx) = new_session();
        let call = tokio::spawn(async move {
            // give it effectively zero time so it always hits the Timeout arm
        });
        call.await.unwrap();

        let fut = session.call(
            CommandType::CountPeersAmount,
            serde_json::json!({}),
            Duration::from_millis(10),
        );
        // Drain the RpcRequest frame so the channel doesn't back up.
        let recv_task = tokio::spawn(async move { rx.recv().await });
        let result = fut.await;
        assert!(matches!(result, Err(Error::Timeout(_))));
        let sent = recv_task.await.unwrap();
        let request_id = match sent {
            Some(Frame::RpcRequest { request_id, .. }) => request_id,
            other => panic!("expected RpcRequest, got {other:?}"),
        };

        // The entry must still be present for a late reply to be processed.
        assert_eq!(session.pending_rpc_count(), 1);
        let resolved = session.complete_rpc(
            &request_id,
            Frame::RpcResponse {
                request_id: request_id.clone(),
                command_type: CommandType::CountPeersAmount,
                success: true,
                data: serde_json::json!({"count": 2}),
            },
        );
        assert!(resolved.is_some());
        assert_eq!(session.pending_rpc_count(), 0);
    }
}
