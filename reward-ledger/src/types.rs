//! Core types for the reward ledger
//!
//! All types are designed for:
//! - Deterministic serialization (bincode)
//! - Exact arithmetic (Decimal for TRX amounts)

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Scale commission amounts are rounded to (TRX has 6 decimals).
pub const AMOUNT_SCALE: u32 = 6;

/// Opaque user identifier (Telegram user id)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(String);

impl AccountId {
    /// Create new account ID without validation. Accounts are only
    /// opened for ids that [`AccountId::parse`] accepts unchanged.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse an externally supplied id.
    ///
    /// Ids become storage key prefixes, so they must be non-empty and free
    /// of the `/` separator.
    pub fn parse(id: &str) -> Option<Self> {
        let id = id.trim();
        if id.is_empty() || id.contains('/') {
            None
        } else {
            Some(Self(id.to_string()))
        }
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Balance category a credit is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// Ad views
    Ads,
    /// Signup bonuses and commissions
    Referrals,
    /// Task payouts
    Tasks,
}

/// Per-account balances
///
/// Categories only ever grow; `total` additionally shrinks on withdrawal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Spendable balance
    pub total: Decimal,
    /// Lifetime ad earnings
    pub ads: Decimal,
    /// Lifetime referral earnings
    pub referrals: Decimal,
    /// Lifetime task earnings
    pub tasks: Decimal,
}

impl Balances {
    /// Credit `amount` to `total` and the given category.
    pub fn credit(&mut self, category: Category, amount: Decimal) {
        self.total += amount;
        match category {
            Category::Ads => self.ads += amount,
            Category::Referrals => self.referrals += amount,
            Category::Tasks => self.tasks += amount,
        }
    }
}

/// Referral bookkeeping
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralInfo {
    /// Who referred this account; fixed at creation
    pub referrer_id: Option<AccountId>,
    /// Number of credited signups
    pub total_refs: u64,
    /// Cumulative signup rewards
    pub earned: Decimal,
    /// Cumulative commission rewards
    pub commission: Decimal,
}

/// One balance record per user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// User id
    pub id: AccountId,
    /// Telegram username, when known
    pub username: Option<String>,
    /// Balances
    pub balances: Balances,
    /// Referral data
    pub referral: ReferralInfo,
    /// Ad rewards are refused before this instant
    pub cooldown_until: DateTime<Utc>,
    /// Soft-disable flag
    pub banned: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Account {
    /// Fresh account with zero balances.
    ///
    /// A referrer equal to the account itself is discarded.
    pub fn new(id: AccountId, referrer_id: Option<AccountId>, now: DateTime<Utc>) -> Self {
        let referrer_id = referrer_id.filter(|r| *r != id);
        Self {
            id,
            username: None,
            balances: Balances::default(),
            referral: ReferralInfo {
                referrer_id,
                ..ReferralInfo::default()
            },
            cooldown_until: now,
            banned: false,
            created_at: now,
        }
    }

    /// Referrer eligible for commission (never the account itself)
    pub fn referrer(&self) -> Option<&AccountId> {
        self.referral.referrer_id.as_ref().filter(|r| **r != self.id)
    }

    /// Whether the ad cooldown has elapsed at `now`
    pub fn cooldown_elapsed(&self, now: DateTime<Utc>) -> bool {
        now >= self.cooldown_until
    }
}

/// Transaction log entry type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    /// Ad reward
    EarnAd,
    /// Referral signup bonus
    Referral,
    /// Referral commission
    Commission,
    /// Task reward
    Task,
    /// Withdrawal debit (or its approval record)
    Withdraw,
    /// Refund of a rejected withdrawal
    WithdrawRefund,
}

impl TransactionType {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::EarnAd => "earn_ad",
            TransactionType::Referral => "referral",
            TransactionType::Commission => "commission",
            TransactionType::Task => "task",
            TransactionType::Withdraw => "withdraw",
            TransactionType::WithdrawRefund => "withdraw_refund",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transaction log entry status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    /// Awaiting admin action
    Pending,
    /// Settled credit
    Completed,
    /// Admin approved
    Approved,
    /// Admin rejected
    Rejected,
}

/// Append-only audit record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionLogEntry {
    /// Entry id (UUIDv7, time-ordered)
    pub entry_id: Uuid,
    /// Account the entry belongs to
    pub account_id: AccountId,
    /// Entry type
    pub tx_type: TransactionType,
    /// Signed amount (negative for debits)
    pub amount: Decimal,
    /// Status
    pub status: TransactionStatus,
    /// Creation time, non-decreasing per account
    pub created_at: DateTime<Utc>,
    /// Task that produced the entry
    pub task_id: Option<Uuid>,
    /// Referee that produced a referral or commission entry
    pub from_user_id: Option<AccountId>,
    /// Withdrawal the entry refers to
    pub withdrawal_id: Option<Uuid>,
}

impl TransactionLogEntry {
    /// Whether the entry moved the balance.
    ///
    /// An approved withdrawal re-states a debit already taken when the
    /// request was filed.
    pub fn affects_balance(&self) -> bool {
        !(self.tx_type == TransactionType::Withdraw && self.status == TransactionStatus::Approved)
    }
}

/// Lifecycle of admin-reviewed records (withdrawals, task submissions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewStatus {
    /// Awaiting review
    Pending,
    /// Approved (terminal)
    Approved,
    /// Rejected (terminal)
    Rejected,
}

impl ReviewStatus {
    /// Check if the record reached a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReviewStatus::Pending)
    }
}

/// Admin decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewAction {
    /// Approve
    Approve,
    /// Reject
    Reject,
}

impl ReviewAction {
    /// Status the action transitions to
    pub fn target_status(&self) -> ReviewStatus {
        match self {
            ReviewAction::Approve => ReviewStatus::Approved,
            ReviewAction::Reject => ReviewStatus::Rejected,
        }
    }
}

impl FromStr for ReviewAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "approve" => Ok(ReviewAction::Approve),
            "reject" => Ok(ReviewAction::Reject),
            other => Err(format!("Invalid action: {}", other)),
        }
    }
}

/// Withdrawal parameters supplied by the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalDraft {
    /// Amount to withdraw
    pub amount: Decimal,
    /// External account identifier (e.g. Binance UID)
    pub destination_ref: String,
    /// Asset
    pub asset: String,
    /// Payout method
    pub method: String,
}

impl WithdrawalDraft {
    /// TRX withdrawal over Binance, the Mini-App's only payout path
    pub fn new(amount: Decimal, destination_ref: impl Into<String>) -> Self {
        Self {
            amount,
            destination_ref: destination_ref.into(),
            asset: "TRX".to_string(),
            method: "binance".to_string(),
        }
    }
}

/// Queued withdrawal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    /// Request id
    pub id: Uuid,
    /// Requesting account
    pub user_id: AccountId,
    /// Debited amount (positive)
    pub amount: Decimal,
    /// External account identifier
    pub destination_ref: String,
    /// Asset
    pub asset: String,
    /// Payout method
    pub method: String,
    /// Review status
    pub status: ReviewStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// When an admin resolved it
    pub resolved_at: Option<DateTime<Utc>>,
    /// Admin who resolved it
    pub resolved_by: Option<AccountId>,
}

/// How task completion is verified
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verification {
    /// Channel membership checked against the Bot API
    Auto,
    /// Submission reviewed by an admin
    Manual,
}

/// Admin-defined task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    /// Task id
    pub id: Uuid,
    /// Title
    pub title: String,
    /// Target link (`https://t.me/<channel>` for auto tasks)
    pub link: String,
    /// Reward in TRX
    pub reward: Decimal,
    /// Display category
    pub category: String,
    /// Verification mode
    pub verification: Verification,
    /// Whether the task can be completed
    pub active: bool,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Channel username from a `t.me/<channel>` link
    pub fn telegram_channel(&self) -> Option<&str> {
        let idx = self.link.find("t.me/")?;
        let channel = self.link[idx + "t.me/".len()..].trim_end_matches('/');
        if channel.is_empty() {
            None
        } else {
            Some(channel)
        }
    }
}

/// Task parameters supplied by an admin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDraft {
    /// Title
    pub title: String,
    /// Target link
    pub link: String,
    /// Reward in TRX
    pub reward: Decimal,
    /// Display category
    pub category: String,
    /// Verification mode
    pub verification: Verification,
}

/// One user's claim that a manually verified task is done
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSubmission {
    /// Submission id
    pub id: Uuid,
    /// Task
    pub task_id: Uuid,
    /// Submitting account
    pub user_id: AccountId,
    /// Review status
    pub status: ReviewStatus,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
    /// Review timestamp
    pub reviewed_at: Option<DateTime<Utc>>,
    /// Reviewing admin
    pub reviewer: Option<AccountId>,
}
