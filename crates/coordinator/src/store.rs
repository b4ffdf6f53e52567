//! Credential store (§6 schema): the durable side of the Session Broker and
//! Logout Barrier. The schema itself is out of scope for this crate, what
//! ships here is a narrow async trait plus an in-memory/JSONL-backed default
//! implementation: bounded in-memory state, append-only JSONL persistence,
//! load-on-start. A real deployment can swap in a SQL-backed implementation
//! behind the same trait without touching the broker or barrier.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct CookieKey {
    pub user_id: String,
    pub username: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserCookie {
    pub user_id: String,
    pub username: String,
    pub node_id: String,
    pub cookie_blob: String,
    pub auto_refresh: bool,
    pub refresh_time: DateTime<Utc>,
    pub create_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct AccountKey {
    pub user_id: String,
    pub username: String,
    pub website: String,
    pub account: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: String,
    pub username: String,
    pub website: String,
    pub account: String,
    pub password: String,
    pub email: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub location: Option<String>,
    pub registration_method: String,
    pub auto_generated: bool,
    pub logged_out: bool,
    pub create_time: DateTime<Utc>,
}

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get_cookie(&self, key: &CookieKey) -> Option<UserCookie>;
    async fn put_cookie(&self, cookie: UserCookie);

    /// Any account row for this user, regardless of website, used by the
    /// broker's "has credential?" check (§4.5 step 2).
    async fn find_any_account(&self, user_id: &str) -> Option<UserAccount>;
    async fn put_account(&self, account: UserAccount);

    /// True if any account row for `user_id` carries `logged_out = true`
    /// (§4.5 step 1, §4.7 step 4).
    async fn is_logged_out(&self, user_id: &str) -> bool;
    async fn set_logged_out(&self, user_id: &str, logged_out: bool);
}

/// Default `CredentialStore`: two in-memory maps, each append-only
/// persisted to its own JSONL file and reloaded (last write per key wins)
/// on startup.
pub struct InMemoryCredentialStore {
    cookies: RwLock<HashMap<CookieKey, UserCookie>>,
    accounts: RwLock<HashMap<AccountKey, UserAccount>>,
    cookies_path: PathBuf,
    accounts_path: PathBuf,
}

impl InMemoryCredentialStore {
    pub fn new(state_dir: &std::path::Path) -> Self {
        let cookies_path = state_dir.join("cookies.jsonl");
        let accounts_path = state_dir.join("accounts.jsonl");
        let mut cookies = HashMap::new();
        if let Ok(data) = std::fs::read_to_string(&cookies_path) {
            for line in data.lines() {
                if let Ok(c) = serde_json::from_str::<UserCookie>(line) {
                    cookies.insert(
                        CookieKey {
                            user_id: c.user_id.clone(),
                            username: c.username.clone(),
                        },
                        c,
                    );
                }
            }
        }
        let mut accounts = HashMap::new();
        if let Ok(data) = std::fs::read_to_string(&accounts_path) {
            for line in data.lines() {
                if let Ok(a) = serde_json::from_str::<UserAccount>(line) {
                    accounts.insert(
                        AccountKey {
                            user_id: a.user_id.clone(),
                            username: a.username.clone(),
                            website: a.website.clone(),
                            account: a.account.clone(),
                        },
                        a,
                    );
                }
            }
        }
        tracing::info!(
            cookies = cookies.len(),
            accounts = accounts.len(),
            "loaded credential store from disk"
        );
        Self {
            cookies: RwLock::new(cookies),
            accounts: RwLock::new(accounts),
            cookies_path,
            accounts_path,
        }
    }

    fn append_line<T: Serialize>(path: &std::path::Path, record: &T) {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Ok(json) = serde_json::to_string(record) {
            use std::io::Write;
            if let Ok(mut f) = std::fs::OpenOptions::new().create(true).append(true).open(path) {
                let _ = writeln!(f, "{json}");
            }
        }
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn get_cookie(&self, key: &CookieKey) -> Option<UserCookie> {
        self.cookies.read().await.get(key).cloned()
    }

    async fn put_cookie(&self, cookie: UserCookie) {
        Self::append_line(&self.cookies_path, &cookie);
        let key = CookieKey {
            user_id: cookie.user_id.clone(),
            username: cookie.username.clone(),
        };
        self.cookies.write().await.insert(key, cookie);
    }

    async fn find_any_account(&self, user_id: &str) -> Option<UserAccount> {
        self.accounts
            .read()
            .await
            .values()
            .find(|a| a.user_id == user_id)
            .cloned()
    }

    async fn put_account(&self, account: UserAccount) {
        Self::append_line(&self.accounts_path, &account);
        let key = AccountKey {
            user_id: account.user_id.clone(),
            username: account.username.clone(),
            website: account.website.clone(),
            account: account.account.clone(),
        };
        self.accounts.write().await.insert(key, account);
    }

    async fn is_logged_out(&self, user_id: &str) -> bool {
        self.accounts
            .read()
            .await
            .values()
            .any(|a| a.user_id == user_id && a.logged_out)
    }

    async fn set_logged_out(&self, user_id: &str, logged_out: bool) {
        let mut accounts = self.accounts.write().await;
        let touched: Vec<AccountKey> = accounts
            .values()
            .filter(|a| a.user_id == user_id)
            .map(|a| AccountKey {
                user_id: a.user_id.clone(),
                username: a.username.clone(),
                website: a.website.clone(),
                account: a.account.clone(),
            })
            .collect();
        for key in touched {
            if let Some(a) = accounts.get_mut(&key) {
                a.logged_out = logged_out;
                Self::append_line(&self.accounts_path, a);
            }
        }
    }
}
