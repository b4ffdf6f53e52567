//! Activity Fan-out (C6): forwards one C-Node's activity batch to every
//! other live session in the same Channel, independent of downstream ack
//! latency. The allowlist predicate is a capability-filter over the
//! registry's live sessions; batch bookkeeping is a bounded/TTL'd
//! in-memory map, the same shape used for cookie delivery tracking.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bn_domain::config::UrlFilteringConfig;
use bn_protocol::Frame;
use serde_json::Value;

use crate::session::AgentSession;
use std::sync::Arc;

#[derive(Debug, Clone)]
pub struct ActivityBatch {
    pub batch_id: String,
    pub user_id: String,
    pub source_node_id: String,
    pub forwarded_to: usize,
    pub acks_received: usize,
    created_at: Instant,
}

#[derive(Default)]
pub struct FanoutRegistry {
    batches: parking_lot::RwLock<HashMap<String, ActivityBatch>>,
}

impl FanoutRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_batch(&self, batch_id: String, user_id: String, source_node_id: String, forwarded_to: usize) {
        self.batches.write().insert(
            batch_id.clone(),
            ActivityBatch {
                batch_id,
                user_id,
                source_node_id,
                forwarded_to,
                acks_received: 0,
                created_at: Instant::now(),
            },
        );
    }

    /// Called on an inbound `user_activities_batch_feedback`. Returns
    /// `true` if this ack brought `acks_received` to `forwarded_to`,
    /// evicting the batch.
    pub fn record_ack(&self, batch_id: &str) -> bool {
        let mut batches = self.batches.write();
        let Some(batch) = batches.get_mut(batch_id) else {
            return false;
        };
        batch.acks_received += 1;
        if batch.acks_received >= batch.forwarded_to {
            batches.remove(batch_id);
            true
        } else {
            false
        }
    }

    /// Janitor sweep: evict batches older than `ttl` regardless of ack
    /// state (§4.6 step 5, §5 resource limits).
    pub fn gc_expired(&self, ttl: Duration) -> usize {
        let mut batches = self.batches.write();
        let before = batches.len();
        batches.retain(|_, b| b.created_at.elapsed() <= ttl);
        before - batches.len()
    }

    pub fn len(&self) -> usize {
        self.batches.read().len()
    }
}

/// Exact-host or glob (`*`-wildcard) match against the configured
/// allowlist. Disabled filtering means pass-through; an empty allowlist
/// with filtering enabled drops everything.
pub fn url_allowed(url: &str, cfg: &UrlFilteringConfig) -> bool {
    if !cfg.enabled {
        return true;
    }
    let host = extract_host(url);
    if cfg.allowed_domains.iter().any(|d| d == &host) {
        return true;
    }
    cfg.allowed_patterns.iter().any(|pattern| glob_match(pattern, &host))
}

fn extract_host(url: &str) -> String {
    let without_scheme = url.split("://").nth(1).unwrap_or(url);
    without_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or(without_scheme)
        .split('@')
        .last()
        .unwrap_or("")
        .split(':')
        .next()
        .unwrap_or("")
        .to_string()
}

fn glob_match(pattern: &str, text: &str) -> bool {
    let escaped: String = pattern
        .split('*')
        .map(regex::escape)
        .collect::<Vec<_>>()
        .join(".*");
    match regex::Regex::new(&format!("^{escaped}$")) {
        Ok(re) => re.is_match(text),
        Err(_) => false,
    }
}

/// Filters `items` through the allowlist, then (if any survive) enqueues
/// the filtered batch onto every peer and registers the batch for ack
/// accounting. Always returns the frame to ack the *source* with, this
/// never waits on a peer, matching §4.6's "prompt synchronous ack"
/// requirement.
pub async fn fan_out(
    registry: &FanoutRegistry,
    source_node_id: &str,
    user_id: &str,
    batch_id: &str,
    items: Vec<Value>,
    channel_peers: &[Arc<AgentSession>],
    cfg: &UrlFilteringConfig,
) -> Frame {
    let filtered: Vec<Value> = items.into_iter().filter(|item| {
        item.get("url")
            .and_then(|v| v.as_str())
            .map(|u| url_allowed(u, cfg))
            .unwrap_or(false)
    }).collect();

    if filtered.is_empty() {
        tracing::debug!(batch_id, user_id, "activity batch fully filtered, acking source");
        return Frame::UserActivitiesBatchFeedback {
            batch_id: batch_id.to_string(),
            success: true,
        };
    }

    let mut forwarded = 0usize;
    for peer in channel_peers {
        if peer.node_id == source_node_id {
            continue;
        }
        let frame = Frame::UserActivitiesBatch {
            user_id: user_id.to_string(),
            batch_id: batch_id.to_string(),
            sync_data: filtered.clone(),
        };
        if peer.send(frame).await.is_ok() {
            forwarded += 1;
        }
    }

    if forwarded > 0 {
        registry.register_batch(batch_id.to_string(), user_id.to_string(), source_node_id.to_string(), forwarded);
    }

    Frame::UserActivitiesBatchFeedback {
        batch_id: batch_id.to_string(),
        success: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn cfg_enabled(domains: &[&str], patterns: &[&str]) -> UrlFilteringConfig {
        UrlFilteringConfig {
            enabled: true,
            allowed_domains: domains.iter().map(|s| s.to_string()).collect(),
            allowed_patterns: patterns.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn disabled_filter_passes_everything() {
        let cfg = UrlFilteringConfig::default();
        assert!(url_allowed("https://anything.example/x", &cfg));
    }

    #[test]
    fn exact_host_match() {
        let cfg = cfg_enabled(&["docs.example.com"], &[]);
        assert!(url_allowed("https://docs.example.com/page", &cfg));
        assert!(!url_allowed("https://evil.example.com/page", &cfg));
    }

    #[test]
    fn glob_pattern_match() {
        let cfg = cfg_enabled(&[], &["*.example.com"]);
        assert!(url_allowed("https://a.example.com/x", &cfg));
        assert!(!url_allowed("https://example.org/x", &cfg));
    }

    #[tokio::test]
    async fn fully_filtered_batch_acks_without_registering() {
        let registry = FanoutRegistry::new();
        let cfg = cfg_enabled(&["allowed.example"], &[]);
        let items = vec![serde_json::json!({"url": "https://blocked.example/x"})];
        let frame = fan_out(&registry, "src", "u1", "b1", items, &[], &cfg).await;
        assert!(matches!(frame, Frame::UserActivitiesBatchFeedback { success: true, .. }));
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn surviving_batch_forwards_and_tracks_acks() {
        let registry = FanoutRegistry::new();
        let cfg = UrlFilteringConfig::default();
        let (tx, mut rx) = mpsc::channel(8);
        let peer = Arc::new(AgentSession::new("peer".into(), "peer-c".into(), tx));
        let items = vec![serde_json::json!({"url": "https://anything.example/x"})];

        let ack = fan_out(&registry, "src", "u1", "b1", items, &[peer], &cfg).await;
        assert!(matches!(ack, Frame::UserActivitiesBatchFeedback { success: true, .. }));
        assert_eq!(registry.len(), 1);
        assert!(matches!(rx.recv().await, Some(Frame::UserActivitiesBatch { .. })));

        assert!(registry.record_ack("b1"));
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn gc_evicts_only_expired_batches() {
        let registry = FanoutRegistry::new();
        registry.register_batch("old".into(), "u1".into(), "src".into(), 1);
        std::thread::sleep(Duration::from_millis(20));
        let evicted = registry.gc_expired(Duration::from_millis(5));
        assert_eq!(evicted, 1);
        assert_eq!(registry.len(), 0);
    }
}
