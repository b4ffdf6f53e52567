//! Identity Bridge (C9): a stateless façade around the upstream IdP's three
//! endpoints. A `reqwest::Client` is built once and reused across calls;
//! non-2xx responses are mapped to typed errors rather than surfaced raw.

use std::time::Duration;

use bn_domain::error::{Error, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

const PASSWORD_LEN: usize = 8;
const PASSWORD_SYMBOLS: &[u8] = b"@#$%^&+=!";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdpUser {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub cookie: String,
    pub user: IdpUser,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginFailureKind {
    InvalidCredentials,
    AccountAlreadyExists,
    Unreachable,
    Other,
}

pub struct IdentityBridge {
    client: reqwest::Client,
    base_url: String,
    signup_timeout: Duration,
    login_timeout: Duration,
}

impl IdentityBridge {
    pub fn new(base_url: String, signup_timeout: Duration, login_timeout: Duration) -> Self {
        Self {
            // Redirects must not be followed: a 302 is itself the login
            // success signal (§4.9), and following it would drop the
            // Set-Cookie header this bridge needs to capture.
            client: reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("reqwest client with a no-op redirect policy always builds"),
            base_url,
            signup_timeout,
            login_timeout,
        }
    }

    pub async fn current_user(&self, cookie: &str) -> Result<IdpUser> {
        let resp = self
            .client
            .get(format!("{}/api/current-user", self.base_url))
            .header(reqwest::header::COOKIE, cookie)
            .timeout(self.login_timeout)
            .send()
            .await
            .map_err(|e| Error::UpstreamIdp(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(Error::UpstreamIdp(format!(
                "current-user returned {}",
                resp.status()
            )));
        }
        resp.json::<IdpUser>()
            .await
            .map_err(|e| Error::UpstreamIdp(e.to_string()))
    }

    /// `POST /login`. Success is HTTP 302, or HTTP 200 with a `session=`
    /// cookie in `Set-Cookie`.
    pub async fn login(&self, account: &str, password: &str) -> std::result::Result<LoginOutcome, LoginFailureKind> {
        let resp = self
            .client
            .post(format!("{}/login", self.base_url))
            .form(&[("account", account), ("password", password)])
            .timeout(self.login_timeout)
            .send()
            .await
            .map_err(|_| LoginFailureKind::Unreachable)?;

        let status = resp.status();
        let cookie = resp
            .headers()
            .get_all(reqwest::header::SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| v.starts_with("session="))
            .map(|v| v.to_string());

        let success = status.as_u16() == 302 || (status.is_success() && cookie.is_some());
        if !success {
            return Err(if status.as_u16() == 401 || status.as_u16() == 403 {
                LoginFailureKind::InvalidCredentials
            } else {
                LoginFailureKind::Other
            });
        }
        let cookie = cookie.ok_or(LoginFailureKind::Other)?;
        let user = resp
            .json::<IdpUser>()
            .await
            .unwrap_or(IdpUser {
                user_id: account.to_string(),
                username: account.to_string(),
                email: None,
            });
        Ok(LoginOutcome { cookie, user })
    }

    /// `POST /signup`. Fire-and-forget: a non-success response (including
    /// timeout) is logged and otherwise swallowed, the broker proceeds to
    /// attempt login regardless (§4.9).
    pub async fn signup(&self, account: &str, password: &str) {
        let result = tokio::time::timeout(
            self.signup_timeout,
            self.client
                .post(format!("{}/signup", self.base_url))
                .form(&[("account", account), ("password", password)])
                .send(),
        )
        .await;
        match result {
            Ok(Ok(resp)) if resp.status().as_u16() == 409 => {
                tracing::info!(account, "signup: account already exists");
            }
            Ok(Ok(resp)) if !resp.status().is_success() => {
                tracing::warn!(account, status = %resp.status(), "signup returned non-success");
            }
            Ok(Err(e)) => tracing::warn!(account, error = %e, "signup request failed"),
            Err(_) => tracing::warn!(account, "signup timed out, proceeding to login anyway"),
            Ok(Ok(_)) => {}
        }
    }

    /// Generates an 8-char password satisfying the IdP's strength rule:
    /// one uppercase, one lowercase, one digit, one symbol from
    /// `@#$%^&+=!`, total length 8.
    pub fn generate_strong_password() -> String {
        let mut rng = rand::thread_rng();
        let mut chars: Vec<char> = vec![
            (b'A' + rng.gen_range(0..26)) as char,
            (b'a' + rng.gen_range(0..26)) as char,
            (b'0' + rng.gen_range(0..10)) as char,
            *PASSWORD_SYMBOLS.choose(&mut rng).expect("symbols non-empty") as char,
        ];
        const FILLER: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
        while chars.len() < PASSWORD_LEN {
            chars.push(*FILLER.choose(&mut rng).expect("filler alphabet non-empty") as char);
        }
        chars.shuffle(&mut rng);
        chars.into_iter().collect()
    }

    pub fn generate_unique_username(user_id: &str) -> String {
        format!("bn_{}_{}", user_id, uuid::Uuid::new_v4().simple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_password_satisfies_strength_rule() {
        for _ in 0..50 {
            let pw = IdentityBridge::generate_strong_password();
            assert_eq!(pw.len(), PASSWORD_LEN);
            assert!(pw.chars().any(|c| c.is_ascii_uppercase()));
            assert!(pw.chars().any(|c| c.is_ascii_lowercase()));
            assert!(pw.chars().any(|c| c.is_ascii_digit()));
            assert!(pw.chars().any(|c| PASSWORD_SYMBOLS.contains(&(c as u8))));
        }
    }

    #[test]
    fn generated_username_is_unique_across_calls() {
        let a = IdentityBridge::generate_unique_username("u1");
        let b = IdentityBridge::generate_unique_username("u1");
        assert_ne!(a, b);
        assert!(a.starts_with("bn_u1_"));
    }
}
