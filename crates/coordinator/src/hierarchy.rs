//! Node Hierarchy (C3): the three-level Domain → Cluster → Channel overlay.
//!
//! There is no dispatcher type distinct from [`crate::session::AgentSession`];
//! every RPC named here (`new_domain_node`, `assign_to_cluster`, …) is
//! just an `AgentSession::call` against whichever session is currently
//! driving the assignment; "the dispatcher" is a thin wrapper over
//! per-node channels rather than a component with its own identity.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bn_domain::error::{Error, Result};
use bn_protocol::{CommandType, Frame};

use crate::nodes::registry::ConnectionRegistry;
use crate::session::{AgentSession, Placement};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Domain,
    Cluster,
    Channel,
}

#[derive(Default, Debug)]
pub struct DomainNode {
    pub head_node_id: Option<String>,
    pub cluster_ids: HashSet<String>,
}

#[derive(Default, Debug)]
pub struct ClusterNode {
    pub domain_id: String,
    pub head_node_id: Option<String>,
    pub channel_ids: HashSet<String>,
}

#[derive(Default, Debug)]
pub struct ChannelNode {
    pub cluster_id: String,
    pub head_node_id: Option<String>,
    /// node_id → member, the O(1)-removal index the data model calls for.
    pub members: HashMap<String, Arc<AgentSession>>,
}

#[derive(Debug, Clone, Default)]
pub struct PlacementRequest {
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
}

pub struct NodeHierarchy {
    domains: parking_lot::RwLock<HashMap<String, DomainNode>>,
    clusters: parking_lot::RwLock<HashMap<String, ClusterNode>>,
    channels: parking_lot::RwLock<HashMap<String, ChannelNode>>,
    child_capacity: usize,
}

impl NodeHierarchy {
    pub fn new(child_capacity: usize) -> Self {
        Self {
            domains: parking_lot::RwLock::new(HashMap::new()),
            clusters: parking_lot::RwLock::new(HashMap::new()),
            channels: parking_lot::RwLock::new(HashMap::new()),
            child_capacity,
        }
    }

    // ── Placement (§4.3) ─────────────────────────────────────────────

    pub async fn place(
        &self,
        session: &Arc<AgentSession>,
        req: PlacementRequest,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        match (req.domain_id, req.cluster_id, req.channel_id) {
            (Some(d), Some(c), Some(ch)) => self.verify_or_join_channel(session, &d, &c, &ch),
            (Some(d), Some(c), None) => self.place_at_channel_level(session, &d, &c, registry).await,
            (Some(d), None, None) => self.place_at_cluster_level(session, &d, registry).await,
            (None, None, None) => self.place_at_domain_level(session, registry).await,
            _ => Err(Error::StateInvariant(
                "advertised IDs must be a contiguous prefix of domain/cluster/channel".into(),
            )),
        }
    }

    async fn place_at_domain_level(
        &self,
        session: &Arc<AgentSession>,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        let candidate_domains: Vec<String> = self.domains.read().keys().cloned().collect();
        for domain_id in candidate_domains {
            if let Some(count) = self.probe_child_count(Tier::Domain, &domain_id, registry).await {
                if count < self.child_capacity {
                    return self.place_at_cluster_level(session, &domain_id, registry).await;
                }
            }
        }
        self.become_new_domain_head(session, registry).await
    }

    async fn place_at_cluster_level(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        if !self.domains.read().contains_key(domain_id) {
            return Err(Error::PlacementFailed(format!("unknown domain {domain_id}")));
        }
        let candidate_clusters: Vec<String> = self
            .clusters
            .read()
            .iter()
            .filter(|(_, c)| c.domain_id == domain_id)
            .map(|(id, _)| id.clone())
            .collect();
        for cluster_id in candidate_clusters {
            if let Some(count) = self.probe_child_count(Tier::Cluster, &cluster_id, registry).await {
                if count < self.child_capacity {
                    return self.place_at_channel_level(session, domain_id, &cluster_id, registry).await;
                }
            }
        }
        self.become_new_cluster_head(session, domain_id, registry).await
    }

    async fn place_at_channel_level(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        cluster_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        if !self.clusters.read().contains_key(cluster_id) {
            return Err(Error::PlacementFailed(format!("unknown cluster {cluster_id}")));
        }
        let candidate_channels: Vec<String> = self
            .channels
            .read()
            .iter()
            .filter(|(_, c)| c.cluster_id == cluster_id)
            .map(|(id, _)| id.clone())
            .collect();
        for channel_id in &candidate_channels {
            let members = self.channels.read().get(channel_id).map(|c| c.members.len()).unwrap_or(0);
            if members < self.child_capacity {
                return self.join_channel(session, domain_id, cluster_id, channel_id, registry).await;
            }
        }
        self.become_new_channel_head(session, domain_id, cluster_id, registry).await
    }

    fn verify_or_join_channel(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        cluster_id: &str,
        channel_id: &str,
    ) -> Result<Placement> {
        let mut channels = self.channels.write();
        let channel = channels
            .entry(channel_id.to_string())
            .or_insert_with(|| ChannelNode {
                cluster_id: cluster_id.to_string(),
                head_node_id: None,
                members: HashMap::new(),
            });
        channel.members.insert(session.node_id.clone(), session.clone());
        let is_channel_head = channel.head_node_id.as_deref() == Some(session.node_id.as_str());

        let placement = Placement {
            domain_id: Some(domain_id.to_string()),
            cluster_id: Some(cluster_id.to_string()),
            channel_id: Some(channel_id.to_string()),
            is_domain_head: self.domains.read().get(domain_id).map(|d| d.head_node_id.as_deref() == Some(session.node_id.as_str())).unwrap_or(false),
            is_cluster_head: self.clusters.read().get(cluster_id).map(|c| c.head_node_id.as_deref() == Some(session.node_id.as_str())).unwrap_or(false),
            is_channel_head,
        };
        session.set_placement(placement.clone());
        Ok(placement)
    }

    async fn join_channel(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        cluster_id: &str,
        channel_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        let payload = serde_json::json!({ "domain_id": domain_id, "cluster_id": cluster_id, "channel_id": channel_id });
        session
            .call(CommandType::AssignToChannel, payload, crate::session::DEFAULT_RPC_TIMEOUT)
            .await?;
        let placement = self.verify_or_join_channel(session, domain_id, cluster_id, channel_id)?;
        self.fan_out_peer_join(Tier::Channel, channel_id, &session.node_id, session, registry).await;
        Ok(placement)
    }

    async fn become_new_domain_head(
        &self,
        session: &Arc<AgentSession>,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        let reply = session
            .call(CommandType::NewDomainNode, serde_json::json!({}), crate::session::DEFAULT_RPC_TIMEOUT)
            .await?;
        let domain_id = extract_minted_id(&reply)?;
        self.domains.write().insert(
            domain_id.clone(),
            DomainNode {
                head_node_id: Some(session.node_id.clone()),
                cluster_ids: HashSet::new(),
            },
        );
        self.become_new_cluster_head(session, &domain_id, registry).await
    }

    async fn become_new_cluster_head(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        if self.clusters.read().values().filter(|c| c.domain_id == domain_id).count() >= self.child_capacity {
            return Err(Error::CapacityExceeded(format!("domain {domain_id} is at capacity")));
        }
        let reply = session
            .call(
                CommandType::NewClusterNode,
                serde_json::json!({ "domain_id": domain_id }),
                crate::session::DEFAULT_RPC_TIMEOUT,
            )
            .await?;
        let cluster_id = extract_minted_id(&reply)?;
        self.clusters.write().insert(
            cluster_id.clone(),
            ClusterNode {
                domain_id: domain_id.to_string(),
                head_node_id: Some(session.node_id.clone()),
                channel_ids: HashSet::new(),
            },
        );
        self.domains
            .write()
            .get_mut(domain_id)
            .map(|d| d.cluster_ids.insert(cluster_id.clone()));
        self.fan_out_peer_join(Tier::Domain, domain_id, &cluster_id, session, registry).await;
        self.become_new_channel_head(session, domain_id, &cluster_id, registry).await
    }

    async fn become_new_channel_head(
        &self,
        session: &Arc<AgentSession>,
        domain_id: &str,
        cluster_id: &str,
        registry: &ConnectionRegistry,
    ) -> Result<Placement> {
        if self.channels.read().values().filter(|c| c.cluster_id == cluster_id).count() >= self.child_capacity {
            return Err(Error::CapacityExceeded(format!("cluster {cluster_id} is at capacity")));
        }
        let reply = session
            .call(
                CommandType::NewChannelNode,
                serde_json::json!({ "cluster_id": cluster_id }),
                crate::session::DEFAULT_RPC_TIMEOUT,
            )
            .await?;
        let channel_id = extract_minted_id(&reply)?;
        self.channels.write().insert(
            channel_id.clone(),
            ChannelNode {
                cluster_id: cluster_id.to_string(),
                head_node_id: Some(session.node_id.clone()),
                members: HashMap::from([(session.node_id.clone(), session.clone())]),
            },
        );
        self.clusters
            .write()
            .get_mut(cluster_id)
            .map(|c| c.channel_ids.insert(channel_id.clone()));
        self.fan_out_peer_join(Tier::Cluster, cluster_id, &channel_id, session, registry).await;

        let placement = Placement {
            domain_id: Some(domain_id.to_string()),
            cluster_id: Some(cluster_id.to_string()),
            channel_id: Some(channel_id),
            is_domain_head: self.domains.read().get(domain_id).map(|d| d.head_node_id.as_deref() == Some(session.node_id.as_str())).unwrap_or(false),
            is_cluster_head: true,
            is_channel_head: true,
        };
        session.set_placement(placement.clone());
        Ok(placement)
    }

    /// Ask a live member of `tier_id` (head preferred, any peer accepted) to
    /// count its children. Returns `None` when no reachable member exists
    /// or the RPC fails, callers treat that as "try the next candidate".
    async fn probe_child_count(
        &self,
        tier: Tier,
        tier_id: &str,
        registry: &ConnectionRegistry,
    ) -> Option<usize> {
        let representative_node_id = self.representative_for(tier, tier_id)?;
        let representative = registry.lookup_by_node(&representative_node_id)?;
        let reply = representative
            .call(
                CommandType::CountPeersAmount,
                serde_json::json!({ "tier": tier_label(tier), "tier_id": tier_id }),
                crate::session::DEFAULT_RPC_TIMEOUT,
            )
            .await
            .ok()?;
        match reply {
            bn_protocol::Frame::RpcResponse { success: true, data, .. } => {
                data.get("count").and_then(|v| v.as_u64()).map(|c| c as usize)
            }
            _ => None,
        }
    }

    fn representative_for(&self, tier: Tier, tier_id: &str) -> Option<String> {
        match tier {
            Tier::Domain => self.domains.read().get(tier_id)?.head_node_id.clone(),
            Tier::Cluster => self.clusters.read().get(tier_id)?.head_node_id.clone(),
            Tier::Channel => self
                .channels
                .read()
                .get(tier_id)?
                .members
                .keys()
                .next()
                .cloned(),
        }
    }

    /// Fan out a peer-join advisory to every existing member of the parent
    /// tier after a successful placement (§4.3). `announced_id` is the
    /// newly minted child (a cluster/channel id) for Domain/Cluster tiers,
    /// or the joiner's own node id for the Channel tier. Best-effort:
    /// delivery failures to an individual peer are logged and otherwise
    /// ignored, this is an advisory, not an RPC any caller waits on.
    async fn fan_out_peer_join(
        &self,
        tier: Tier,
        parent_id: &str,
        announced_id: &str,
        joiner: &Arc<AgentSession>,
        registry: &ConnectionRegistry,
    ) {
        let command_type = match tier {
            Tier::Domain => CommandType::AddNewClusterToPeers,
            Tier::Cluster => CommandType::AddNewChannelToPeers,
            Tier::Channel => CommandType::AddNewNodeToPeers,
        };
        let payload = match tier {
            Tier::Domain => serde_json::json!({ "domain_id": parent_id, "cluster_id": announced_id }),
            Tier::Cluster => serde_json::json!({ "cluster_id": parent_id, "channel_id": announced_id }),
            Tier::Channel => serde_json::json!({ "channel_id": parent_id, "node_id": announced_id }),
        };

        let peers: Vec<Arc<AgentSession>> = match tier {
            Tier::Channel => self
                .channels
                .read()
                .get(parent_id)
                .map(|c| c.members.values().cloned().collect())
                .unwrap_or_default(),
            _ => self
                .representative_for(tier, parent_id)
                .and_then(|node_id| registry.lookup_by_node(&node_id))
                .into_iter()
                .collect(),
        };

        for peer in peers {
            if peer.node_id == joiner.node_id {
                continue;
            }
            let frame = Frame::RpcRequest {
                request_id: uuid::Uuid::new_v4().to_string(),
                command_type,
                payload: payload.clone(),
            };
            if let Err(err) = peer.send(frame).await {
                tracing::debug!(
                    tier = ?tier,
                    parent_id,
                    peer = %peer.node_id,
                    error = %err,
                    "peer-join advisory delivery failed"
                );
            }
        }
    }

    /// Remove `session` from whichever channel it belongs to, then run
    /// empty-tier GC up the chain. A pool is dropped only if it is empty,
    /// or holds only an invalid-transport head with no live child tiers.
    pub fn remove_session(&self, session: &Arc<AgentSession>) {
        let placement = session.placement();
        let Some(channel_id) = placement.channel_id else {
            return;
        };
        let mut channels = self.channels.write();
        let Some(channel) = channels.get_mut(&channel_id) else {
            return;
        };
        channel.members.remove(&session.node_id);
        let channel_empty = channel.members.is_empty();
        let cluster_id = channel.cluster_id.clone();
        if channel_empty {
            channels.remove(&channel_id);
        }
        drop(channels);

        let mut clusters = self.clusters.write();
        if let Some(cluster) = clusters.get_mut(&cluster_id) {
            if channel_empty {
                cluster.channel_ids.remove(&channel_id);
            }
            let cluster_empty = cluster.channel_ids.is_empty();
            let domain_id = cluster.domain_id.clone();
            if cluster_empty {
                clusters.remove(&cluster_id);
                drop(clusters);
                let mut domains = self.domains.write();
                if let Some(domain) = domains.get_mut(&domain_id) {
                    domain.cluster_ids.remove(&cluster_id);
                    if domain.cluster_ids.is_empty() {
                        domains.remove(&domain_id);
                    }
                }
            }
        }
    }

    pub fn domain_count(&self) -> usize {
        self.domains.read().len()
    }
    pub fn cluster_count(&self) -> usize {
        self.clusters.read().len()
    }
    pub fn channel_count(&self) -> usize {
        self.channels.read().len()
    }
}

fn tier_label(tier: Tier) -> &'static str {
    match tier {
        Tier::Domain => "domain",
        Tier::Cluster => "cluster",
        Tier::Channel => "channel",
    }
}

fn extract_minted_id(frame: &bn_protocol::Frame) -> Result<String> {
    match frame {
        bn_protocol::Frame::RpcResponse { success: true, data, .. } => data
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .ok_or_else(|| Error::PlacementFailed("agent reply missing minted id".into())),
        bn_protocol::Frame::RpcResponse { success: false, .. } => {
            Err(Error::PlacementFailed("agent rejected tier-creation RPC".into()))
        }
        _ => Err(Error::StateInvariant("unexpected frame for tier-creation RPC".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(node_id: &str) -> Arc<AgentSession> {
        let (tx, _rx) = mpsc::channel(8);
        Arc::new(AgentSession::new(node_id.into(), format!("{node_id}-client"), tx))
    }

    #[test]
    fn empty_hierarchy_has_zero_counts() {
        let h = NodeHierarchy::new(1000);
        assert_eq!(h.domain_count(), 0);
        assert_eq!(h.cluster_count(), 0);
        assert_eq!(h.channel_count(), 0);
    }

    #[test]
    fn verify_or_join_channel_sets_placement_and_head_flags() {
        let h = NodeHierarchy::new(1000);
        h.domains.write().insert(
            "d1".into(),
            DomainNode {
                head_node_id: Some("n1".into()),
                cluster_ids: HashSet::from(["c1".into()]),
            },
        );
        h.clusters.write().insert(
            "c1".into(),
            ClusterNode {
                domain_id: "d1".into(),
                head_node_id: Some("n1".into()),
                channel_ids: HashSet::from(["ch1".into()]),
            },
        );
        let s = session("n1");
        let placement = h.verify_or_join_channel(&s, "d1", "c1", "ch1").unwrap();
        assert!(placement.is_domain_head);
        assert!(placement.is_cluster_head);
        assert_eq!(h.channel_count(), 1);
    }

    #[test]
    fn remove_session_garbage_collects_empty_tiers() {
        let h = NodeHierarchy::new(1000);
        h.domains.write().insert(
            "d1".into(),
            DomainNode { head_node_id: Some("n1".into()), cluster_ids: HashSet::from(["c1".into()]) },
        );
        h.clusters.write().insert(
            "c1".into(),
            ClusterNode { domain_id: "d1".into(), head_node_id: Some("n1".into()), channel_ids: HashSet::from(["ch1".into()]) },
        );
        let s = session("n1");
        h.verify_or_join_channel(&s, "d1", "c1", "ch1").unwrap();
        assert_eq!(h.channel_count(), 1);

        h.remove_session(&s);
        assert_eq!(h.channel_count(), 0);
        assert_eq!(h.cluster_count(), 0);
        assert_eq!(h.domain_count(), 0);
    }

    #[tokio::test]
    async fn new_domain_head_flow_mints_three_ids() {
        let h = NodeHierarchy::new(1000);
        let (tx, mut rx) = mpsc::channel(8);
        let s = Arc::new(AgentSession::new("n1".into(), "c1".into(), tx));
        let s_for_responder = s.clone();

        // Stand in for the agent: for every RpcRequest, mint the next id and
        // feed it back through `complete_rpc`, exactly as the read-loop does
        // when an `rpc_response` frame arrives on the real socket.
        let responder = tokio::spawn(async move {
            let mut ids = vec!["domain-1", "cluster-1", "channel-1"].into_iter();
            while let Some(frame) = rx.recv().await {
                if let bn_protocol::Frame::RpcRequest { request_id, command_type, .. } = frame {
                    let id = ids.next().expect("exactly 3 minting RPCs expected");
                    s_for_responder.complete_rpc(
                        &request_id,
                        bn_protocol::Frame::RpcResponse {
                            request_id,
                            command_type,
                            success: true,
                            data: serde_json::json!({ "id": id }),
                        },
                    );
                }
            }
        });

        let placement = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            h.place_at_domain_level(&s, &ConnectionRegistry::new()),
        )
        .await
        .expect("placement should complete once the responder answers each RPC")
        .expect("placement should succeed");

        responder.abort();

        assert_eq!(placement.domain_id.as_deref(), Some("domain-1"));
        assert_eq!(placement.cluster_id.as_deref(), Some("cluster-1"));
        assert_eq!(placement.channel_id.as_deref(), Some("channel-1"));
        assert!(placement.is_domain_head);
        assert!(placement.is_cluster_head);
        assert!(placement.is_channel_head);
        assert_eq!(h.domain_count(), 1);
        assert_eq!(h.cluster_count(), 1);
        assert_eq!(h.channel_count(), 1);
    }

    #[tokio::test]
    async fn joining_a_channel_advises_existing_members_only() {
        let h = NodeHierarchy::new(1000);
        h.domains.write().insert(
            "d1".into(),
            DomainNode { head_node_id: Some("n1".into()), cluster_ids: HashSet::from(["c1".into()]) },
        );
        h.clusters.write().insert(
            "c1".into(),
            ClusterNode { domain_id: "d1".into(), head_node_id: Some("n1".into()), channel_ids: HashSet::from(["ch1".into()]) },
        );
        let (tx, mut incumbent_rx) = mpsc::channel(8);
        let incumbent = Arc::new(AgentSession::new("n1".into(), "n1-client".into(), tx));
        h.channels.write().insert(
            "ch1".into(),
            ChannelNode {
                cluster_id: "c1".into(),
                head_node_id: Some("n1".into()),
                members: HashMap::from([("n1".into(), incumbent.clone())]),
            },
        );

        let (joiner_tx, mut joiner_rx) = mpsc::channel(8);
        let joiner = Arc::new(AgentSession::new("n2".into(), "n2-client".into(), joiner_tx));

        let joiner2 = joiner.clone();
        let assign_responder = tokio::spawn(async move {
            if let Some(bn_protocol::Frame::RpcRequest { request_id, command_type, .. }) = joiner_rx.recv().await {
                joiner2.complete_rpc(
                    &request_id,
                    bn_protocol::Frame::RpcResponse {
                        request_id,
                        command_type,
                        success: true,
                        data: serde_json::json!({}),
                    },
                );
            }
            joiner_rx
        });

        h.join_channel(&joiner, "d1", "c1", "ch1", &ConnectionRegistry::new())
            .await
            .unwrap();
        let joiner_rx = assign_responder.await.unwrap();
        drop(joiner_rx);

        match incumbent_rx.recv().await {
            Some(bn_protocol::Frame::RpcRequest { command_type, payload, .. }) => {
                assert_eq!(command_type, bn_protocol::CommandType::AddNewNodeToPeers);
                assert_eq!(payload["node_id"], "n2");
            }
            other => panic!("expected an advisory RpcRequest, got {other:?}"),
        }
    }
}
