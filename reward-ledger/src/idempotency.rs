//! Claim-once markers for one-shot rewards
//!
//! A claim is recorded with a single create-if-absent write, so two
//! concurrent requests for the same key cannot both observe "unclaimed".

use crate::error::Result;
use crate::store::Collection;
use crate::types::AccountId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Reward that may be granted at most once per subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RewardKind {
    /// Auto-verified task completion, per (task, user)
    TaskCompletion,
    /// Signup bonus, per (referrer, referee)
    ReferralSignup,
}

impl RewardKind {
    fn prefix(&self) -> &'static str {
        match self {
            RewardKind::TaskCompletion => "task",
            RewardKind::ReferralSignup => "signup",
        }
    }
}

/// Composite claim key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimKey {
    kind: RewardKind,
    subject: String,
}

impl ClaimKey {
    /// Key for `user` completing `task_id`
    pub fn task(task_id: Uuid, user: &AccountId) -> Self {
        Self {
            kind: RewardKind::TaskCompletion,
            subject: format!("{}/{}", task_id, user),
        }
    }

    /// Key for `referrer` earning the signup bonus for `referee`
    pub fn referral_signup(referrer: &AccountId, referee: &AccountId) -> Self {
        Self {
            kind: RewardKind::ReferralSignup,
            subject: format!("{}/{}", referrer, referee),
        }
    }

    /// Reward kind
    pub fn kind(&self) -> RewardKind {
        self.kind
    }

    fn storage_key(&self) -> String {
        format!("{}/{}", self.kind.prefix(), self.subject)
    }
}

impl fmt::Display for ClaimKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}

/// Persisted claim marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    /// When the claim was made
    pub claimed_at: DateTime<Utc>,
}

/// Result of [`IdempotencyGuard::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// This caller holds the claim and must grant the reward
    Acquired,
    /// A previous caller already holds it
    AlreadyClaimed,
}

/// Claim-once guard
#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    claims: Collection<ClaimRecord>,
}

impl IdempotencyGuard {
    /// Guard over the claims collection
    pub fn new(claims: Collection<ClaimRecord>) -> Self {
        Self { claims }
    }

    /// Atomically record `key` if nobody has.
    pub fn claim(&self, key: &ClaimKey) -> Result<Claim> {
        let record = ClaimRecord { claimed_at: Utc::now() };
        if self.claims.insert_if_absent(&key.storage_key(), &record)? {
            tracing::debug!(claim = %key, "Claim acquired");
            Ok(Claim::Acquired)
        } else {
            tracing::debug!(claim = %key, "Claim already held");
            Ok(Claim::AlreadyClaimed)
        }
    }

    /// Whether `key` has been claimed
    pub fn is_claimed(&self, key: &ClaimKey) -> Result<bool> {
        Ok(self.claims.get(&key.storage_key())?.is_some())
    }

    /// Give back a claim whose reward was definitely not granted.
    pub fn release(&self, key: &ClaimKey) -> Result<()> {
        tracing::debug!(claim = %key, "Claim released");
        self.claims.remove(&key.storage_key())
    }
}
