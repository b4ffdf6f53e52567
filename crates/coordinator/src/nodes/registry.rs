//! Connection Registry (C2): three parallel indices over live
//! [`AgentSession`]s, an `RwLock<HashMap<..>>` + O(1)-removal shape
//! generalized to three keys instead of one and to collision-aware
//! registration instead of blind replace-on-duplicate.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::session::AgentSession;
use bn_protocol::Frame;

/// Outcome of [`ConnectionRegistry::register`], the caller (the WS read
/// loop) uses this to decide what to do with the *new* socket.
pub enum Collision {
    /// No existing session for this `client_install_id`; the new session
    /// was inserted into all three indices.
    Fresh,
    /// Same `node_id` + `client_install_id` + `user_id`, and the existing
    /// connection is still valid: do not add. Caller acks success to the
    /// new socket and closes it with a normal code.
    ExactDuplicate { existing: Arc<AgentSession> },
    /// Same client, same node, different user: the existing session was
    /// rebound in place. Caller replies success on the existing socket and
    /// closes the new one.
    Rebound {
        existing: Arc<AgentSession>,
        old_user_id: Option<String>,
    },
    /// Same client, different node: a client is bound to one node.
    RejectedDifferentNode,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub node_id: String,
    pub client_install_id: String,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
    pub is_domain_head: bool,
    pub is_cluster_head: bool,
    pub is_channel_head: bool,
    pub valid: bool,
}

#[derive(Default)]
struct Indices {
    by_node: HashMap<String, Arc<AgentSession>>,
    by_user: HashMap<String, Vec<Arc<AgentSession>>>,
    by_client: HashMap<String, Vec<Arc<AgentSession>>>,
}

pub struct ConnectionRegistry {
    inner: parking_lot::RwLock<Indices>,
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: parking_lot::RwLock::new(Indices::default()),
        }
    }

    /// Attempt to register `session`. Applies the collision policy of
    /// §4.2 against sessions sharing its `client_install_id`.
    pub fn register(&self, session: Arc<AgentSession>) -> Collision {
        let mut idx = self.inner.write();

        let existing_for_client = idx
            .by_client
            .get(&session.client_install_id)
            .and_then(|v| v.iter().find(|s| s.is_valid()).cloned());

        if let Some(existing) = existing_for_client {
            if existing.node_id != session.node_id {
                tracing::info!(
                    client_install_id = %session.client_install_id,
                    existing_node = %existing.node_id,
                    new_node = %session.node_id,
                    "rejecting registration: client already bound to a different node"
                );
                return Collision::RejectedDifferentNode;
            }

            if existing.user_id() == session.user_id() {
                tracing::debug!(
                    node_id = %session.node_id,
                    client_install_id = %session.client_install_id,
                    "exact duplicate registration ignored"
                );
                return Collision::ExactDuplicate { existing };
            }

            // Same client, same node, different user: rebind in place.
            let old_user_id = existing.user_id();
            if let Some(uid) = &old_user_id {
                if let Some(bucket) = idx.by_user.get_mut(uid) {
                    bucket.retain(|s| !Arc::ptr_eq(s, &existing));
                    if bucket.is_empty() {
                        idx.by_user.remove(uid);
                    }
                }
            }
            if let (Some(new_uid), Some(new_uname)) = (session.user_id(), session.username()) {
                existing.set_identity(new_uid.clone(), new_uname);
                idx.by_user.entry(new_uid).or_default().push(existing.clone());
            }
            tracing::info!(
                node_id = %session.node_id,
                client_install_id = %session.client_install_id,
                old_user_id = ?old_user_id,
                "rebound existing session to new identity"
            );
            return Collision::Rebound {
                existing,
                old_user_id,
            };
        }

        self.insert_fresh(&mut idx, session);
        Collision::Fresh
    }

    /// Pairing-code collision policy (§4.2 rule 4, §4.8c): removes every
    /// session currently bound to `client_install_id` from all three
    /// indices and returns them so the caller can close their transports
    /// and run hierarchy cleanup. Used only on the pairing-code path, where
    /// a stale device on the same physical host must not block the new
    /// registration the way [`Collision::RejectedDifferentNode`] normally
    /// would.
    pub fn evict_client(&self, client_install_id: &str) -> Vec<Arc<AgentSession>> {
        let mut idx = self.inner.write();
        let Some(stale) = idx.by_client.remove(client_install_id) else {
            return Vec::new();
        };
        for session in &stale {
            idx.by_node.remove(&session.node_id);
            if let Some(uid) = session.user_id() {
                if let Some(bucket) = idx.by_user.get_mut(&uid) {
                    bucket.retain(|s| !Arc::ptr_eq(s, session));
                    if bucket.is_empty() {
                        idx.by_user.remove(&uid);
                    }
                }
            }
        }
        stale
    }

    fn insert_fresh(&self, idx: &mut Indices, session: Arc<AgentSession>) {
        idx.by_node.insert(session.node_id.clone(), session.clone());
        idx.by_client
            .entry(session.client_install_id.clone())
            .or_default()
            .push(session.clone());
        if let Some(uid) = session.user_id() {
            idx.by_user.entry(uid).or_default().push(session.clone());
        }
    }

    /// Remove `session` from all three indices. Symmetric with `register`;
    /// empty buckets are dropped.
    pub fn unregister(&self, session: &Arc<AgentSession>) {
        let mut idx = self.inner.write();
        idx.by_node.remove(&session.node_id);

        if let Some(bucket) = idx.by_client.get_mut(&session.client_install_id) {
            bucket.retain(|s| !Arc::ptr_eq(s, session));
            if bucket.is_empty() {
                idx.by_client.remove(&session.client_install_id);
            }
        }
        if let Some(uid) = session.user_id() {
            if let Some(bucket) = idx.by_user.get_mut(&uid) {
                bucket.retain(|s| !Arc::ptr_eq(s, session));
                if bucket.is_empty() {
                    idx.by_user.remove(&uid);
                }
            }
        }
    }

    pub fn lookup_by_node(&self, node_id: &str) -> Option<Arc<AgentSession>> {
        self.inner
            .read()
            .by_node
            .get(node_id)
            .filter(|s| s.is_valid())
            .cloned()
    }

    pub fn lookup_by_user(&self, user_id: &str) -> Vec<Arc<AgentSession>> {
        self.inner
            .read()
            .by_user
            .get(user_id)
            .map(|v| v.iter().filter(|s| s.is_valid()).cloned().collect())
            .unwrap_or_default()
    }

    pub fn lookup_by_client(&self, client_install_id: &str) -> Vec<Arc<AgentSession>> {
        self.inner
            .read()
            .by_client
            .get(client_install_id)
            .map(|v| v.iter().filter(|s| s.is_valid()).cloned().collect())
            .unwrap_or_default()
    }

    /// Number of distinct users with at least one live session, used by
    /// §4.5a's "more than one user is present in the Registry" advisory
    /// gate (keyed on users, not on one user's device count).
    pub fn distinct_user_count(&self) -> usize {
        self.inner
            .read()
            .by_user
            .values()
            .filter(|sessions| sessions.iter().any(|s| s.is_valid()))
            .count()
    }

    /// Advisory fan-out for §4.2's second-live-session notification. The
    /// caller is responsible for checking the credential store's
    /// `logged_out` flag before invoking this.
    pub async fn notify_peer_login(&self, new_session: &Arc<AgentSession>) {
        let Some(user_id) = new_session.user_id() else {
            return;
        };
        let peers: Vec<Arc<AgentSession>> = self
            .lookup_by_user(&user_id)
            .into_iter()
            .filter(|s| !Arc::ptr_eq(s, new_session))
            .collect();
        for peer in peers {
            let frame = Frame::PeerLogin {
                user_id: user_id.clone(),
                username: new_session.username().unwrap_or_default(),
                node_id: new_session.node_id.clone(),
            };
            if let Err(e) = peer.send(frame).await {
                tracing::debug!(node_id = %peer.node_id, error = %e, "peer_login advisory not delivered");
            }
        }
    }

    /// Point-in-time report used by the operator-facing admin endpoint.
    pub fn snapshot(&self) -> Vec<SessionSnapshot> {
        self.inner
            .read()
            .by_node
            .values()
            .map(|s| {
                let placement = s.placement();
                SessionSnapshot {
                    node_id: s.node_id.clone(),
                    client_install_id: s.client_install_id.clone(),
                    user_id: s.user_id(),
                    username: s.username(),
                    domain_id: placement.domain_id,
                    cluster_id: placement.cluster_id,
                    channel_id: placement.channel_id,
                    is_domain_head: placement.is_domain_head,
                    is_cluster_head: placement.is_cluster_head,
                    is_channel_head: placement.is_channel_head,
                    valid: s.is_valid(),
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_node.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().by_node.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(node_id: &str, client_id: &str, user_id: Option<&str>) -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::channel(8);
        let s = AgentSession::new(node_id.into(), client_id.into(), tx);
        if let Some(uid) = user_id {
            s.set_identity(uid.into(), format!("{uid}-name"));
        }
        Arc::new(s)
    }

    #[test]
    fn fresh_registration_populates_all_three_indices() {
        let reg = ConnectionRegistry::new();
        let s = session("n1", "c1", Some("u1"));
        assert!(matches!(reg.register(s.clone()), Collision::Fresh));
        assert!(reg.lookup_by_node("n1").is_some());
        assert_eq!(reg.lookup_by_user("u1").len(), 1);
        assert_eq!(reg.lookup_by_client("c1").len(), 1);
    }

    #[test]
    fn exact_duplicate_is_not_added() {
        let reg = ConnectionRegistry::new();
        let s1 = session("n1", "c1", Some("u1"));
        reg.register(s1);
        let s2 = session("n1", "c1", Some("u1"));
        assert!(matches!(reg.register(s2), Collision::ExactDuplicate { .. }));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn same_client_same_node_different_user_rebinds() {
        let reg = ConnectionRegistry::new();
        let s1 = session("n1", "c1", Some("alice"));
        reg.register(s1.clone());
        let s2 = session("n1", "c1", Some("bob"));
        match reg.register(s2) {
            Collision::Rebound { existing, old_user_id } => {
                assert!(Arc::ptr_eq(&existing, &s1));
                assert_eq!(old_user_id.as_deref(), Some("alice"));
            }
            _ => panic!("expected Rebound"),
        }
        assert_eq!(s1.user_id().as_deref(), Some("bob"));
        assert!(reg.lookup_by_user("alice").is_empty());
        assert_eq!(reg.lookup_by_user("bob").len(), 1);
    }

    #[test]
    fn same_client_different_node_is_rejected() {
        let reg = ConnectionRegistry::new();
        reg.register(session("n1", "c1", Some("alice")));
        assert!(matches!(
            reg.register(session("n2", "c1", Some("alice"))),
            Collision::RejectedDifferentNode
        ));
    }

    #[test]
    fn unregister_drops_empty_buckets() {
        let reg = ConnectionRegistry::new();
        let s = session("n1", "c1", Some("u1"));
        reg.register(s.clone());
        reg.unregister(&s);
        assert!(reg.is_empty());
        assert!(reg.lookup_by_user("u1").is_empty());
        assert!(reg.lookup_by_client("c1").is_empty());
    }

    #[test]
    fn evict_client_clears_all_three_indices() {
        let reg = ConnectionRegistry::new();
        let stale = session("old-node", "c1", Some("stale-user"));
        reg.register(stale.clone());
        assert_eq!(reg.len(), 1);

        let evicted = reg.evict_client("c1");
        assert_eq!(evicted.len(), 1);
        assert!(Arc::ptr_eq(&evicted[0], &stale));
        assert!(reg.lookup_by_node("old-node").is_none());
        assert!(reg.lookup_by_user("stale-user").is_empty());
        assert!(reg.lookup_by_client("c1").is_empty());
    }

    #[test]
    fn evict_client_on_unknown_client_is_a_no_op() {
        let reg = ConnectionRegistry::new();
        assert!(reg.evict_client("nope").is_empty());
    }

    #[test]
    fn distinct_user_count_counts_users_not_sessions() {
        let reg = ConnectionRegistry::new();
        reg.register(session("n1", "c1", Some("u1")));
        reg.register(session("n2", "c2", Some("u1")));
        assert_eq!(reg.distinct_user_count(), 1, "two devices of one user is still one user");

        reg.register(session("n3", "c3", Some("u2")));
        assert_eq!(reg.distinct_user_count(), 2);
    }

    #[tokio::test]
    async fn peer_login_notifies_other_sessions_of_same_user() {
        let reg = ConnectionRegistry::new();
        let (tx1, mut rx1) = mpsc::channel(8);
        let s1 = Arc::new(AgentSession::new("n1".into(), "c1".into(), tx1));
        s1.set_identity("u1".into(), "alice".into());
        reg.register(s1.clone());

        let (tx2, _rx2) = mpsc::channel(8);
        let s2 = Arc::new(AgentSession::new("n2".into(), "c2".into(), tx2));
        s2.set_identity("u1".into(), "alice".into());
        reg.register(s2.clone());

        reg.notify_peer_login(&s2).await;
        let frame = rx1.recv().await.unwrap();
        assert!(matches!(frame, Frame::PeerLogin { .. }));
    }
}
