//! Channel membership checks for auto-verified tasks

use crate::config::TelegramConfig;
use crate::error::{Error, Result, VerificationFailure};
use crate::types::AccountId;
use async_trait::async_trait;
use dashmap::DashMap;
use reqwest::Client;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// Chat member statuses that count as joined
const MEMBER_STATUSES: [&str; 3] = ["member", "administrator", "creator"];

/// Whether a `getChatMember` status counts as membership
pub fn is_member_status(status: &str) -> bool {
    MEMBER_STATUSES.contains(&status)
}

/// Confirms a user joined a channel
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    /// `Ok(())` if `user` is a member of `channel`
    async fn check(&self, channel: &str, user: &AccountId) -> std::result::Result<(), VerificationFailure>;
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    result: Option<ChatMember>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

/// Telegram Bot API `getChatMember` client
#[derive(Debug, Clone)]
pub struct BotApiMembership {
    api_base: String,
    bot_token: String,
    client: Client,
}

impl BotApiMembership {
    /// Client for the configured bot
    pub fn new(config: &TelegramConfig) -> Result<Self> {
        let bot_token = config
            .bot_token
            .clone()
            .ok_or_else(|| Error::Config("telegram.bot_token is required for membership checks".into()))?;
        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_base: config.api_base.trim_end_matches('/').to_string(),
            bot_token,
            client,
        })
    }
}

#[async_trait]
impl MembershipChecker for BotApiMembership {
    async fn check(&self, channel: &str, user: &AccountId) -> std::result::Result<(), VerificationFailure> {
        let url = format!("{}/bot{}/getChatMember", self.api_base, self.bot_token);
        let chat_id = format!("@{}", channel);

        let response = self
            .client
            .get(&url)
            .query(&[("chat_id", chat_id.as_str()), ("user_id", user.as_str())])
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(channel, user = %user, error = %e, "getChatMember request failed");
                VerificationFailure::Unavailable(e.without_url().to_string())
            })?;

        // Telegram answers refusals with a 4xx and an `ok: false` body
        let body: BotApiResponse = response.json().await.map_err(|e| {
            VerificationFailure::Unavailable(format!("Failed to parse response: {}", e))
        })?;

        match (body.ok, body.result) {
            (true, Some(member)) if is_member_status(&member.status) => Ok(()),
            (true, Some(member)) => Err(VerificationFailure::NotMember(member.status)),
            (true, None) => Err(VerificationFailure::Unavailable("empty result".into())),
            (false, _) => Err(VerificationFailure::NotMember(
                body.description.unwrap_or_else(|| "unknown".into()),
            )),
        }
    }
}

/// Membership checker answering from a fixed table
#[derive(Debug, Default)]
pub struct StaticMembership {
    statuses: DashMap<(String, AccountId), String>,
    unreachable: AtomicBool,
    calls: AtomicUsize,
}

impl StaticMembership {
    /// Checker where nobody is a member
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `user`'s status in `channel`
    pub fn set_status(&self, channel: &str, user: &AccountId, status: &str) {
        self.statuses
            .insert((channel.to_string(), user.clone()), status.to_string());
    }

    /// Simulate the API being down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Checks performed so far
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MembershipChecker for StaticMembership {
    async fn check(&self, channel: &str, user: &AccountId) -> std::result::Result<(), VerificationFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(VerificationFailure::Unavailable("connection refused".into()));
        }
        let status = self
            .statuses
            .get(&(channel.to_string(), user.clone()))
            .map(|s| s.clone())
            .unwrap_or_else(|| "left".to_string());
        if is_member_status(&status) {
            Ok(())
        } else {
            Err(VerificationFailure::NotMember(status))
        }
    }
}
