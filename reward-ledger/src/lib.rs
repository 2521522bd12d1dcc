//! TRX Rewards Ledger
//!
//! Balance ledger behind a Telegram Mini-App that pays users for ad views,
//! task completions and referrals, and lets them withdraw.
//!
//! # Architecture
//!
//! - **Optimistic concurrency**: Every balance change is a CAS update on
//!   one account record; no global lock, different accounts never contend
//! - **Claim-once rewards**: One-shot rewards are guarded by an atomic
//!   create-if-absent marker taken before the balance changes
//! - **Append-only log**: Each applied mutation gets a per-account log
//!   entry; the log is the audit trail reconciliation runs against
//! - **Best-effort commission**: A referrer's cut is a second, independent
//!   write that never undoes the primary credit
//!
//! # Invariants
//!
//! - Reconciliation: `balances.total` equals the sum of the account's
//!   balance-affecting log entries (modulo flagged repair candidates)
//! - At most one credit per claim key
//! - A refused operation mutates nothing and logs nothing
//! - `created_at` never decreases within one account's log

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod auth;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod ledger;
pub mod log;
pub mod membership;
pub mod metrics;
pub mod settings;
pub mod storage;
pub mod store;
pub mod types;

// Re-exports
pub use auth::{AdminDirectory, Caller, IdentityVerifier, TelegramInitDataVerifier, VerifiedIdentity};
pub use config::Config;
pub use error::{Error, Precondition, Result, VerificationFailure};
pub use ledger::{Ledger, Reconciliation, RewardCredit, SignupReward, SubmissionReview, TaskReward};
pub use membership::{BotApiMembership, MembershipChecker};
pub use settings::{Settings, SettingsPatch};
pub use types::{
    Account, AccountId, Balances, ReviewAction, ReviewStatus, Task, TaskDraft, TaskSubmission,
    TransactionLogEntry, TransactionStatus, TransactionType, Verification, WithdrawalDraft,
    WithdrawalRequest,
};
