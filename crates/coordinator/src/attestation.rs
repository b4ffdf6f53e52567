//! Cluster Attestation Protocol (C5b): proves a rejoining C-Node already
//! holds data consistent with its channel, with no central ground truth.
//! Response routing is keyed on strings (`node_id` for witness queries,
//! `client_<user_id>` for the joiner) rather than on the `AgentSession`'s
//! own pending-RPC table, because these frames are not `rpc_request`s,
//! the same correlate-by-external-key shape as the pending-RPC table,
//! generalized to an externally supplied key instead of req_id.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bn_domain::error::{Error, Result};
use bn_protocol::Frame;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::session::AgentSession;

/// Routes inbound `cluster_verification_response` frames to the attestation
/// instance awaiting them. One registry is shared across all concurrently
/// running attestations.
#[derive(Default)]
pub struct AttestationRegistry {
    pending: parking_lot::Mutex<HashMap<String, oneshot::Sender<Frame>>>,
}

impl AttestationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register_wait(&self, key: String) -> oneshot::Receiver<Frame> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(key, tx);
        rx
    }

    /// Called by the WS read-loop when a `cluster_verification_response`
    /// frame arrives. Returns `true` if some attestation was waiting on it.
    pub fn resolve(&self, key: &str, frame: Frame) -> bool {
        if let Some(tx) = self.pending.lock().remove(key) {
            let _ = tx.send(frame);
            true
        } else {
            false
        }
    }

    fn cancel(&self, key: &str) {
        self.pending.lock().remove(key);
    }
}

fn witness_key(node_id: &str) -> String {
    format!("witness:{node_id}")
}

fn joiner_key(user_id: &str) -> String {
    format!("client_{user_id}")
}

/// Runs the full protocol for `joiner` against `witnesses` (the joiner's
/// other live channel peers). Returns `Ok(true)` on pass (including the
/// vacuous case where no witness holds a valid batch), `Ok(false)` on a
/// record mismatch, and `Err` on timeout/transport failure, per §7 both
/// outcomes other than `Ok(true)` block the session push.
pub async fn attest(
    registry: &AttestationRegistry,
    joiner: &Arc<AgentSession>,
    witnesses: &[Arc<AgentSession>],
    timeout: Duration,
    min_batch_size: usize,
) -> Result<bool> {
    let Some(user_id) = joiner.user_id() else {
        return Err(Error::StateInvariant(
            "attestation requires the joiner to have an identity".into(),
        ));
    };

    let mut witness_batch: Option<(String, serde_json::Value)> = None;
    for witness in witnesses {
        let verification_id = Uuid::new_v4().to_string();
        let key = witness_key(&witness.node_id);
        let rx = registry.register_wait(key.clone());
        if witness
            .send(Frame::ClusterVerificationQuery {
                verification_id: verification_id.clone(),
                min_record_count: min_batch_size,
            })
            .await
            .is_err()
        {
            registry.cancel(&key);
            continue;
        }
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Frame::ClusterVerificationResponse {
                has_valid_batch: true,
                batch_id: Some(batch_id),
                record: Some(record),
                ..
            })) => {
                witness_batch = Some((batch_id, record));
                break;
            }
            _ => continue,
        }
    }

    let Some((batch_id, witness_record)) = witness_batch else {
        tracing::debug!(user_id, "attestation passed vacuously: no witness holds a valid batch");
        return Ok(true);
    };

    let verification_id = Uuid::new_v4().to_string();
    let key = joiner_key(&user_id);
    let rx = registry.register_wait(key.clone());
    joiner
        .send(Frame::ClusterVerificationRequest {
            verification_id,
            batch_id: batch_id.clone(),
        })
        .await
        .map_err(|_| Error::AttestationFailed("joiner transport closed mid-attestation".into()))?;

    let joiner_reply = tokio::time::timeout(timeout, rx).await.map_err(|_| {
        registry.cancel(&key);
        Error::Timeout(format!("attestation: no reply from joiner for batch {batch_id}"))
    })?;

    match joiner_reply {
        Ok(Frame::ClusterVerificationResponse {
            has_valid_batch: true,
            record: Some(joiner_record),
            ..
        }) => Ok(joiner_record == witness_record),
        _ => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn session(node_id: &str) -> (Arc<AgentSession>, mpsc::Receiver<Frame>) {
        let (tx, rx) = mpsc::channel(8);
        let s = Arc::new(AgentSession::new(node_id.into(), format!("{node_id}-c"), tx));
        (s, rx)
    }

    #[tokio::test]
    async fn vacuous_pass_when_no_witness_has_a_batch() {
        let registry = AttestationRegistry::new();
        let (joiner, _jrx) = session("joiner");
        joiner.set_identity("u1".into(), "alice".into());
        let (witness, mut wrx) = session("witness");

        let attest_fut = attest(&registry, &joiner, &[witness.clone()], Duration::from_millis(200), 3);
        tokio::pin!(attest_fut);

        // Drain the query and respond with has_valid_batch=false.
        let respond = tokio::spawn(async move {
            if let Some(Frame::ClusterVerificationQuery { verification_id, .. }) = wrx.recv().await {
                verification_id
            } else {
                panic!("expected query")
            }
        });
        let verification_id = respond.await.unwrap();
        registry.resolve(
            &witness_key("witness"),
            Frame::ClusterVerificationResponse {
                verification_id,
                has_valid_batch: false,
                batch_id: None,
                record: None,
            },
        );

        let result = attest_fut.await.unwrap();
        assert!(result);
    }

    #[tokio::test]
    async fn matching_records_pass_attestation() {
        let registry = AttestationRegistry::new();
        let (joiner, mut jrx) = session("joiner");
        joiner.set_identity("u1".into(), "alice".into());
        let (witness, mut wrx) = session("witness");

        let attest_fut = attest(&registry, &joiner, &[witness.clone()], Duration::from_millis(500), 3);
        tokio::pin!(attest_fut);

        let wquery = wrx.recv().await.unwrap();
        let verification_id = match wquery {
            Frame::ClusterVerificationQuery { verification_id, .. } => verification_id,
            _ => panic!(),
        };
        let record = serde_json::json!({"a": 1, "b": "two"});
        registry.resolve(
            &witness_key("witness"),
            Frame::ClusterVerificationResponse {
                verification_id,
                has_valid_batch: true,
                batch_id: Some("batch-1".into()),
                record: Some(record.clone()),
            },
        );

        let jquery = jrx.recv().await.unwrap();
        let jverification_id = match jquery {
            Frame::ClusterVerificationRequest { verification_id, batch_id } => {
                assert_eq!(batch_id, "batch-1");
                verification_id
            }
            _ => panic!(),
        };
        registry.resolve(
            &joiner_key("u1"),
            Frame::ClusterVerificationResponse {
                verification_id: jverification_id,
                has_valid_batch: true,
                batch_id: Some("batch-1".into()),
                record: Some(record),
            },
        );

        assert!(attest_fut.await.unwrap());
    }
}
