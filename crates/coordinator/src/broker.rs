//! Session Broker (C5): the decision procedure that owns the `/bind`
//! contract, pre-condition check, IdP login/signup, the peer-attestation
//! gate, and best-effort multi-session cookie delivery. Follows the same
//! sequential, heavily-logged orchestration style as `bootstrap.rs`'s
//! `build_app_state`.

use std::sync::Arc;
use std::time::Duration;

use bn_domain::error::{Error, Result};
use bn_protocol::Frame;

use crate::attestation::{self, AttestationRegistry};
use crate::identity::{IdentityBridge, LoginFailureKind};
use crate::nodes::registry::ConnectionRegistry;
use crate::session::AgentSession;
use crate::store::{CookieKey, CredentialStore, UserAccount, UserCookie};

#[derive(Debug, Clone)]
pub struct BindRequest {
    pub user_id: String,
    pub username: String,
    pub account: Option<String>,
    pub password: Option<String>,
    pub site_url: String,
    pub site_name: String,
    pub partition_key: String,
}

#[derive(Debug, Clone)]
pub struct BindOutcome {
    pub success: bool,
    pub message: String,
    pub delivered_to: usize,
    pub targeted: usize,
}

pub struct SessionBroker<'a> {
    pub registry: &'a ConnectionRegistry,
    pub store: &'a dyn CredentialStore,
    pub identity: &'a IdentityBridge,
    pub attestation: &'a AttestationRegistry,
    pub attestation_timeout: Duration,
    pub delivery_timeout: Duration,
    pub min_batch_size: usize,
}

impl<'a> SessionBroker<'a> {
    /// Runs the full decision procedure for `req`, as invoked by a new
    /// registration, an explicit `/bind` call, or pairing-code completion.
    pub async fn bind(&self, req: BindRequest, joining_session: Option<&Arc<AgentSession>>) -> Result<BindOutcome> {
        // Step 1: pre-condition check.
        if self.store.is_logged_out(&req.user_id).await {
            return Ok(BindOutcome {
                success: false,
                message: "user is logged out; re-login must be explicit".into(),
                delivered_to: 0,
                targeted: 0,
            });
        }

        // Step 2: has credential?
        let existing_account = self.store.find_any_account(&req.user_id).await;
        let cookie = if let Some(_account) = existing_account {
            self.store
                .get_cookie(&CookieKey { user_id: req.user_id.clone(), username: req.username.clone() })
                .await
                .map(|c| c.cookie_blob)
                .ok_or_else(|| Error::UpstreamIdp("credential present but no cached cookie".into()))?
        } else {
            self.acquire_credential(&req).await?
        };

        // Step 3: peer-attestation gate.
        let passed_attestation = if let Some(session) = joining_session {
            let placement = session.placement();
            let peers: Vec<Arc<AgentSession>> = match &placement.channel_id {
                Some(channel_id) => self
                    .registry
                    .lookup_by_user(&req.user_id)
                    .into_iter()
                    .filter(|s| s.node_id != session.node_id && s.placement().channel_id.as_deref() == Some(channel_id.as_str()))
                    .collect(),
                None => Vec::new(),
            };
            if peers.is_empty() || placement.channel_id.is_none() {
                None
            } else {
                // Step 4: attestation.
                match attestation::attest(self.attestation, session, &peers, self.attestation_timeout, self.min_batch_size).await {
                    Ok(true) => Some(true),
                    Ok(false) => {
                        return Ok(BindOutcome {
                            success: false,
                            message: "attestation failed: channel record mismatch".into(),
                            delivered_to: 0,
                            targeted: 0,
                        });
                    }
                    Err(e) => {
                        return Ok(BindOutcome {
                            success: false,
                            message: format!("attestation error: {e}"),
                            delivered_to: 0,
                            targeted: 0,
                        });
                    }
                }
            }
        } else {
            None
        };

        // Step 5: delivery.
        self.deliver(&req, &cookie, passed_attestation).await
    }

    async fn acquire_credential(&self, req: &BindRequest) -> Result<String> {
        if let (Some(account), Some(password)) = (&req.account, &req.password) {
            match self.identity.login(account, password).await {
                Ok(outcome) => {
                    self.persist_account(req, account, password, "form_login", false).await;
                    self.store
                        .put_cookie(UserCookie {
                            user_id: req.user_id.clone(),
                            username: req.username.clone(),
                            node_id: String::new(),
                            cookie_blob: outcome.cookie.clone(),
                            auto_refresh: true,
                            refresh_time: chrono::Utc::now(),
                            create_time: chrono::Utc::now(),
                        })
                        .await;
                    return Ok(outcome.cookie);
                }
                Err(LoginFailureKind::InvalidCredentials) => {
                    return Err(Error::UpstreamIdp(
                        "Wrong account or password, please try again or sign up".into(),
                    ));
                }
                Err(_) => {}
            }
        }

        let account = req
            .account
            .clone()
            .unwrap_or_else(|| IdentityBridge::generate_unique_username(&req.user_id));
        let password = IdentityBridge::generate_strong_password();
        self.identity.signup(&account, &password).await;

        match self.identity.login(&account, &password).await {
            Ok(outcome) => {
                self.persist_account(req, &account, &password, "auto_signup", true).await;
                self.store
                    .put_cookie(UserCookie {
                        user_id: req.user_id.clone(),
                        username: req.username.clone(),
                        node_id: String::new(),
                        cookie_blob: outcome.cookie.clone(),
                        auto_refresh: true,
                        refresh_time: chrono::Utc::now(),
                        create_time: chrono::Utc::now(),
                    })
                    .await;
                Ok(outcome.cookie)
            }
            Err(LoginFailureKind::AccountAlreadyExists) => Err(Error::UpstreamIdp(
                "Account already exists! Please use 'Login' instead".into(),
            )),
            Err(_) => Err(Error::UpstreamIdp("IdP signup-then-login failed".into())),
        }
    }

    async fn persist_account(&self, req: &BindRequest, account: &str, password: &str, method: &str, auto_generated: bool) {
        self.store
            .put_account(UserAccount {
                user_id: req.user_id.clone(),
                username: req.username.clone(),
                website: req.site_url.clone(),
                account: account.to_string(),
                password: password.to_string(),
                email: None,
                first_name: None,
                last_name: None,
                location: None,
                registration_method: method.to_string(),
                auto_generated,
                logged_out: false,
                create_time: chrono::Utc::now(),
            })
            .await;
    }

    async fn deliver(&self, req: &BindRequest, cookie: &str, attestation_passed: Option<bool>) -> Result<BindOutcome> {
        let targets: Vec<Arc<AgentSession>> = self
            .registry
            .lookup_by_user(&req.user_id)
            .into_iter()
            .filter(|s| s.is_valid_uncached())
            .collect();
        // §4.5a: the advisory is keyed on the Registry holding more than
        // one distinct *user*, not on how many devices this user has live.
        let advisory = if self.registry.distinct_user_count() > 1 {
            Some("login success with validation".to_string())
        } else {
            None
        };

        let mut delivered = 0usize;
        for attempt in 0..3 {
            if delivered == targets.len() || targets.is_empty() {
                break;
            }
            for target in &targets {
                let frame = Frame::CookieUpdate {
                    user_id: req.user_id.clone(),
                    username: req.username.clone(),
                    cookie_blob: cookie.to_string(),
                    site_url: req.site_url.clone(),
                    site_name: req.site_name.clone(),
                    partition_key: req.partition_key.clone(),
                    advisory: advisory.clone(),
                    attestation_passed,
                };
                if target.send(frame).await.is_ok() {
                    delivered += 1;
                }
            }
            if attempt < 2 && delivered < targets.len() {
                tokio::time::sleep(self.delivery_timeout).await;
            }
        }

        Ok(BindOutcome {
            success: delivered > 0 || targets.is_empty(),
            message: if targets.is_empty() {
                "credential stored, no live session to deliver to yet".into()
            } else {
                format!("delivered to {delivered}/{} sessions", targets.len())
            },
            delivered_to: delivered,
            targeted: targets.len(),
        })
    }
}
