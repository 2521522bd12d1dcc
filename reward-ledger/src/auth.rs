//! Caller identity and admin capability
//!
//! The Mini-App hands the backend Telegram's signed `initData` query
//! string. [`TelegramInitDataVerifier`] checks its HMAC and extracts the
//! user id; [`AdminDirectory`] then decides whether that user may run
//! admin operations. Ledger operations only ever see the resulting
//! [`Caller`].

use crate::error::{Error, Result};
use crate::store::Collection;
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Identity extracted from a verified credential
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedIdentity {
    /// Telegram user id
    pub account_id: AccountId,
    /// Telegram username, if the user has one
    pub username: Option<String>,
    /// Deep-link parameter the Mini-App was opened with (referrer id)
    pub start_param: Option<String>,
}

/// Turns an opaque credential into an account id
pub trait IdentityVerifier: Send + Sync {
    /// Verify `credential`; failure is `Error::Unauthorized`
    fn verify(&self, credential: &str) -> Result<VerifiedIdentity>;
}

/// Verifies Telegram Mini-App `initData`
pub struct TelegramInitDataVerifier {
    secret_key: [u8; 32],
}

impl std::fmt::Debug for TelegramInitDataVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramInitDataVerifier").finish_non_exhaustive()
    }
}

impl TelegramInitDataVerifier {
    /// Verifier for init data signed for `bot_token`
    pub fn new(bot_token: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(b"WebAppData");
        hasher.update(bot_token.as_bytes());
        Self {
            secret_key: hasher.finalize().into(),
        }
    }

    /// Hex HMAC over the data-check string
    fn sign(&self, data_check: &str) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret_key)
            .map_err(|e| Error::Unauthorized(format!("bad key: {}", e)))?;
        mac.update(data_check.as_bytes());
        Ok(mac)
    }

    /// Split init data into (hash, data-check string, fields)
    fn parse(init_data: &str) -> Result<(String, String, Vec<(String, String)>)> {
        let mut hash = None;
        let mut fields = Vec::new();
        for (key, value) in url::form_urlencoded::parse(init_data.as_bytes()) {
            if key == "hash" {
                hash = Some(value.into_owned());
            } else {
                fields.push((key.into_owned(), value.into_owned()));
            }
        }
        let hash = hash.ok_or_else(|| Error::Unauthorized("missing hash".into()))?;

        let mut lines: Vec<String> = fields.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        lines.sort();
        Ok((hash, lines.join("\n"), fields))
    }
}

#[derive(Deserialize)]
struct TelegramUser {
    id: serde_json::Value,
    username: Option<String>,
}

impl IdentityVerifier for TelegramInitDataVerifier {
    fn verify(&self, init_data: &str) -> Result<VerifiedIdentity> {
        let (hash, data_check, fields) = Self::parse(init_data)?;
        let expected =
            hex::decode(&hash).map_err(|_| Error::Unauthorized("hash is not hex".into()))?;
        self.sign(&data_check)?
            .verify_slice(&expected)
            .map_err(|_| Error::Unauthorized("init data signature mismatch".into()))?;

        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let user_json = field("user").ok_or_else(|| Error::Unauthorized("missing user".into()))?;
        let user: TelegramUser = serde_json::from_str(&user_json)
            .map_err(|e| Error::Unauthorized(format!("malformed user: {}", e)))?;
        let raw_id = match user.id {
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::String(s) => s,
            _ => return Err(Error::Unauthorized("user.id is not an id".into())),
        };
        let account_id = AccountId::parse(&raw_id)
            .ok_or_else(|| Error::Unauthorized(format!("invalid user id {:?}", raw_id)))?;

        Ok(VerifiedIdentity {
            account_id,
            username: user.username,
            start_param: field("start_param").filter(|p| !p.is_empty()),
        })
    }
}

/// Persisted admin grant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminGrant {
    /// When the grant was made
    pub granted_at: DateTime<Utc>,
}

/// Who may run admin operations
#[derive(Debug, Clone)]
pub struct AdminDirectory {
    grants: Collection<AdminGrant>,
}

impl AdminDirectory {
    /// Directory over the admins collection
    pub fn new(grants: Collection<AdminGrant>) -> Self {
        Self { grants }
    }

    /// Grant admin to every id in `ids` that does not have it yet
    pub fn seed<'a>(&self, ids: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for raw in ids {
            match AccountId::parse(raw) {
                Some(id) => {
                    self.grant(&id)?;
                }
                None => tracing::warn!(id = raw, "Ignoring invalid bootstrap admin id"),
            }
        }
        Ok(())
    }

    /// Grant admin; returns whether the grant is new
    pub fn grant(&self, id: &AccountId) -> Result<bool> {
        let created = self.grants.insert_if_absent(
            id.as_str(),
            &AdminGrant {
                granted_at: Utc::now(),
            },
        )?;
        if created {
            tracing::info!(account_id = %id, "Admin granted");
        }
        Ok(created)
    }

    /// Revoke admin
    pub fn revoke(&self, id: &AccountId) -> Result<()> {
        tracing::info!(account_id = %id, "Admin revoked");
        self.grants.remove(id.as_str())
    }

    /// Whether `id` is an admin
    pub fn is_admin(&self, id: &AccountId) -> Result<bool> {
        Ok(self.grants.get(id.as_str())?.is_some())
    }
}

/// Verified caller of a ledger operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Caller's account
    pub account_id: AccountId,
    /// Admin capability
    pub is_admin: bool,
}

impl Caller {
    /// Regular user
    pub fn user(account_id: AccountId) -> Self {
        Self {
            account_id,
            is_admin: false,
        }
    }

    /// Admin
    pub fn admin(account_id: AccountId) -> Self {
        Self {
            account_id,
            is_admin: true,
        }
    }

    /// Look up the admin capability of a verified account
    pub fn resolve(directory: &AdminDirectory, account_id: AccountId) -> Result<Self> {
        let is_admin = directory.is_admin(&account_id)?;
        Ok(Self {
            account_id,
            is_admin,
        })
    }

    /// Refuse unless the caller is an admin
    pub fn require_admin(&self) -> Result<()> {
        if self.is_admin {
            Ok(())
        } else {
            Err(Error::Forbidden(format!("{} is not an admin", self.account_id)))
        }
    }
}
