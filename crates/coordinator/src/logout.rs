//! Logout Barrier (C7): tears down either all of a user's sessions or one
//! `client_install_id`, waiting for best-effort acks before eviction.
//! Uses the same poll-on-an-interval-with-a-deadline shape as the
//! background janitors in `bootstrap.rs`, adapted from a periodic sweep to
//! a one-shot bounded wait. The ack map lives in a registry shared with the
//! WS read-loop (same correlate-by-external-key shape as
//! [`crate::attestation::AttestationRegistry`]) because `logout_feedback`
//! frames are matched by `client_install_id`, never by socket identity.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bn_protocol::Frame;

use crate::hierarchy::NodeHierarchy;
use crate::nodes::registry::ConnectionRegistry;
use crate::session::AgentSession;
use crate::store::CredentialStore;

pub enum LogoutScope {
    AllSessionsOfUser(String),
    SingleClient(String),
}

#[derive(Debug, Default)]
pub struct LogoutOutcome {
    pub targeted: usize,
    pub acknowledged: usize,
    pub timed_out: bool,
}

/// Shared ack-tracking map for in-flight logout barriers, keyed by
/// `client_install_id`. The WS read-loop calls [`Self::record_ack`] when a
/// `logout_feedback` frame arrives; the barrier itself polls
/// [`Self::all_acked`] every 100ms.
#[derive(Default)]
pub struct LogoutAckRegistry {
    inflight: parking_lot::Mutex<HashMap<String, bool>>,
}

impl LogoutAckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn start_tracking(&self, client_install_ids: &[String]) {
        let mut inflight = self.inflight.lock();
        for id in client_install_ids {
            inflight.insert(id.clone(), false);
        }
    }

    /// Matched by `client_install_id` on the ack frame, not socket identity
    /// (§4.7), tolerates a socket that disconnects between send and ack.
    pub fn record_ack(&self, client_install_id: &str) {
        if let Some(acked) = self.inflight.lock().get_mut(client_install_id) {
            *acked = true;
        }
    }

    fn all_acked(&self, client_install_ids: &[String]) -> (bool, usize) {
        let inflight = self.inflight.lock();
        let acked = client_install_ids
            .iter()
            .filter(|id| inflight.get(*id).copied().unwrap_or(false))
            .count();
        (acked == client_install_ids.len(), acked)
    }

    fn stop_tracking(&self, client_install_ids: &[String]) {
        let mut inflight = self.inflight.lock();
        for id in client_install_ids {
            inflight.remove(id);
        }
    }
}

/// Runs the full barrier against `registry`/`hierarchy`, marking the
/// credential store `logged_out = true` on completion regardless of
/// whether every ack arrived in time.
pub async fn run_logout_barrier(
    registry: &ConnectionRegistry,
    hierarchy: &NodeHierarchy,
    acks: &LogoutAckRegistry,
    store: &dyn CredentialStore,
    scope: LogoutScope,
    logout_url: &str,
    ack_wait: Duration,
) -> LogoutOutcome {
    let (user_id, targets) = match &scope {
        LogoutScope::AllSessionsOfUser(user_id) => {
            let targets: Vec<Arc<AgentSession>> = registry
                .lookup_by_user(user_id)
                .into_iter()
                .filter(|s| s.is_valid_uncached())
                .collect();
            (user_id.clone(), targets)
        }
        LogoutScope::SingleClient(client_install_id) => {
            let targets: Vec<Arc<AgentSession>> = registry
                .lookup_by_client(client_install_id)
                .into_iter()
                .filter(|s| s.is_valid_uncached())
                .collect();
            let user_id = targets.first().and_then(|s| s.user_id()).unwrap_or_default();
            (user_id, targets)
        }
    };

    let mut outcome = LogoutOutcome {
        targeted: targets.len(),
        ..Default::default()
    };
    if targets.is_empty() {
        store.set_logged_out(&user_id, true).await;
        return outcome;
    }

    let client_ids: Vec<String> = targets.iter().map(|s| s.client_install_id.clone()).collect();
    for target in &targets {
        target.set_logout_in_progress(true);
    }
    acks.start_tracking(&client_ids);

    for target in &targets {
        target.set_logout_ack_tracker(true);
        let frame = Frame::UserLogout {
            user_id: user_id.clone(),
            logout_url: logout_url.to_string(),
        };
        if target.send(frame).await.is_err() {
            tracing::debug!(node_id = %target.node_id, "logout frame not delivered, transport already gone");
        }
        target.set_closed_by_logout();
    }

    let deadline = tokio::time::Instant::now() + ack_wait;
    loop {
        let (done, acked) = acks.all_acked(&client_ids);
        outcome.acknowledged = acked;
        if done {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            outcome.timed_out = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    acks.stop_tracking(&client_ids);
    for target in &targets {
        target.set_logout_in_progress(false);
        target.set_logout_ack_tracker(false);
        registry.unregister(target);
        hierarchy.remove_session(target);
    }

    store.set_logged_out(&user_id, true).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryCredentialStore;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn barrier_completes_by_timeout_when_no_ack_arrives() {
        let registry = ConnectionRegistry::new();
        let hierarchy = NodeHierarchy::new(1000);
        let acks = LogoutAckRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryCredentialStore::new(dir.path());

        let (tx, _rx) = mpsc::channel(8);
        let session = Arc::new(AgentSession::new("n1".into(), "c1".into(), tx));
        session.set_identity("u1".into(), "alice".into());
        registry.register(session.clone());

        let outcome = run_logout_barrier(
            &registry,
            &hierarchy,
            &acks,
            &store,
            LogoutScope::AllSessionsOfUser("u1".into()),
            "https://idp.example.com/logout",
            Duration::from_millis(150),
        )
        .await;

        assert_eq!(outcome.targeted, 1);
        assert!(outcome.timed_out);
        assert!(store.is_logged_out("u1").await);
        assert!(registry.lookup_by_node("n1").is_none());
    }

    #[tokio::test]
    async fn ack_arriving_mid_wait_completes_barrier_early() {
        let registry = ConnectionRegistry::new();
        let hierarchy = NodeHierarchy::new(1000);
        let acks = Arc::new(LogoutAckRegistry::new());
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryCredentialStore::new(dir.path());

        let (tx, mut rx) = mpsc::channel(8);
        let session = Arc::new(AgentSession::new("n1".into(), "c1".into(), tx));
        session.set_identity("u1".into(), "alice".into());
        registry.register(session.clone());

        let acks_clone = acks.clone();
        let responder = tokio::spawn(async move {
            if let Some(Frame::UserLogout { .. }) = rx.recv().await {
                acks_clone.record_ack("c1");
            }
        });

        let outcome = run_logout_barrier(
            &registry,
            &hierarchy,
            &acks,
            &store,
            LogoutScope::AllSessionsOfUser("u1".into()),
            "https://idp.example.com/logout",
            Duration::from_secs(10),
        )
        .await;
        responder.await.unwrap();

        assert!(!outcome.timed_out);
        assert_eq!(outcome.acknowledged, 1);
    }

    #[tokio::test]
    async fn empty_target_set_still_marks_logged_out() {
        let registry = ConnectionRegistry::new();
        let hierarchy = NodeHierarchy::new(1000);
        let acks = LogoutAckRegistry::new();
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryCredentialStore::new(dir.path());

        let outcome = run_logout_barrier(
            &registry,
            &hierarchy,
            &acks,
            &store,
            LogoutScope::AllSessionsOfUser("ghost".into()),
            "https://idp.example.com/logout",
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(outcome.targeted, 0);
        assert!(store.is_logged_out("ghost").await);
    }
}
