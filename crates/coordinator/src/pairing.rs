//! Pairing-Code Service (C8): short-lived codes that let a second device
//! join a user's hierarchy placement by typing a code instead of going
//! through the IdP again. An in-memory registry (`parking_lot::RwLock<HashMap<..>>`)
//! is enough, codes are cheap, short-lived state with no need for the
//! JSONL durability `CredentialStore` gets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;

/// Glyphs excluded from the pairing alphabet because they are easily
/// confused with each other when read off a screen: `I`/`l`/`1`, `2`/`z`/`Z`,
/// `5`/`s`/`S`, `0`/`o`/`O`.
const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRTUVWXYabcdefghijkmnpqrtuvwxy346789";
const CODE_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct PairingCode {
    pub code: String,
    pub user_id: String,
    pub username: String,
    pub domain_id: Option<String>,
    pub cluster_id: Option<String>,
    pub channel_id: Option<String>,
    issued_at: Instant,
}

pub struct PairingCodeService {
    /// code → record, and the reverse index so a repeated request for the
    /// same user returns the outstanding code verbatim instead of minting
    /// a new one.
    by_code: parking_lot::RwLock<HashMap<String, PairingCode>>,
    by_user: parking_lot::RwLock<HashMap<String, String>>,
    ttl: Duration,
}

impl PairingCodeService {
    pub fn new(ttl: Duration) -> Self {
        Self {
            by_code: parking_lot::RwLock::new(HashMap::new()),
            by_user: parking_lot::RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// `request_security_code` RPC handler: returns the outstanding code
    /// for `user_id` if one exists, otherwise mints and stores a new one.
    pub fn issue_or_reuse(
        &self,
        user_id: &str,
        username: &str,
        domain_id: Option<String>,
        cluster_id: Option<String>,
        channel_id: Option<String>,
    ) -> String {
        if let Some(existing) = self.by_user.read().get(user_id).cloned() {
            if self.by_code.read().contains_key(&existing) {
                return existing;
            }
        }
        let code = Self::generate();
        self.by_code.write().insert(
            code.clone(),
            PairingCode {
                code: code.clone(),
                user_id: user_id.to_string(),
                username: username.to_string(),
                domain_id,
                cluster_id,
                channel_id,
                issued_at: Instant::now(),
            },
        );
        self.by_user.write().insert(user_id.to_string(), code.clone());
        code
    }

    fn generate() -> String {
        let mut rng = rand::thread_rng();
        (0..CODE_LEN)
            .map(|_| *ALPHABET.choose(&mut rng).expect("alphabet is non-empty") as char)
            .collect()
    }

    /// Registration-time lookup: does `candidate` (the `username` field of
    /// an inbound `c_client_register`) match an outstanding code? One-time
    /// use, a successful match atomically removes the record.
    pub fn consume_if_matches(&self, candidate: &str) -> Option<PairingCode> {
        let mut by_code = self.by_code.write();
        let record = by_code.remove(candidate)?;
        self.by_user.write().remove(&record.user_id);
        Some(record)
    }

    /// Background sweep: drop codes older than the configured TTL.
    pub fn sweep_expired(&self) -> usize {
        let mut by_code = self.by_code.write();
        let mut by_user = self.by_user.write();
        let ttl = self.ttl;
        let expired: Vec<String> = by_code
            .iter()
            .filter(|(_, rec)| rec.issued_at.elapsed() > ttl)
            .map(|(code, _)| code.clone())
            .collect();
        for code in &expired {
            if let Some(rec) = by_code.remove(code) {
                by_user.remove(&rec.user_id);
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.by_code.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_code.read().is_empty()
    }
}
