//! Main ledger orchestration layer
//!
//! Every balance-changing operation follows the same shape:
//!
//! 1. Read a settings snapshot
//! 2. Validate inputs
//! 3. Claim the idempotency key, for one-shot rewards
//! 4. Apply the mutation through a CAS update on the account record
//! 5. Append log entries for what actually applied
//! 6. Credit the referrer's commission (best effort)
//!
//! A refused CAS body leaves no trace: no balance change, no log entry.
//! A claim is released again whenever the CAS did not commit.
//!
//! # Example
//!
//! ```no_run
//! use reward_ledger::{AccountId, Config, Ledger};
//!
//! #[tokio::main]
//! async fn main() -> reward_ledger::Result<()> {
//!     let ledger = Ledger::open(Config::default())?;
//!
//!     let uid = AccountId::new("6434588999");
//!     ledger.open_account(&uid, None)?;
//!     let credit = ledger.credit_ad_reward(&uid).await?;
//!     println!("credited {}", credit.amount);
//!
//!     Ok(())
//! }
//! ```

use crate::auth::{AdminDirectory, Caller, VerifiedIdentity};
use crate::config::{BackendKind, Config};
use crate::error::{Error, Precondition, Result};
use crate::idempotency::{Claim, ClaimKey, IdempotencyGuard};
use crate::log::{EarningsSummary, NewEntry, RepairCandidate, TransactionLog};
use crate::membership::MembershipChecker;
use crate::metrics::Metrics;
use crate::settings::{Settings, SettingsPatch, SettingsProvider};
use crate::storage::{Backend, Keyspace, MemoryBackend};
use crate::store::{Collection, RetryPolicy};
use crate::types::{
    Account, AccountId, Category, ReviewAction, ReviewStatus, Task, TaskDraft, TaskSubmission,
    TransactionLogEntry, TransactionStatus, TransactionType, Verification, WithdrawalDraft,
    WithdrawalRequest,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Referrer's share of a reward
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionCredit {
    /// Credited referrer
    pub referrer_id: AccountId,
    /// Commission amount
    pub amount: Decimal,
}

/// Reward that was applied to an account
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardCredit {
    /// Account after the credit
    pub account: Account,
    /// Credited amount
    pub amount: Decimal,
    /// Commission paid to the referrer, if any
    pub commission: Option<CommissionCredit>,
}

/// Outcome of a task reward attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskReward {
    /// Reward granted by this call
    Credited(RewardCredit),
    /// Reward was granted before
    AlreadyClaimed,
}

/// Outcome of a referral signup bonus attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignupReward {
    /// Referrer credited by this call
    Credited {
        /// Referrer after the credit
        referrer: Account,
        /// Bonus amount
        amount: Decimal,
    },
    /// Bonus for this pair was granted before
    AlreadyClaimed,
    /// Account has no referrer
    NoReferrer,
}

/// Entry on a referrer's dashboard
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferralLink {
    /// Referred account
    pub referee_id: AccountId,
    /// When the signup bonus was credited
    pub created_at: DateTime<Utc>,
}

/// Admin decision on a task submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionReview {
    /// Submission after the decision
    pub submission: TaskSubmission,
    /// Reward outcome for approvals
    pub reward: Option<TaskReward>,
}

/// Stored balance against the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconciliation {
    /// Account
    pub account_id: AccountId,
    /// `balances.total` as stored
    pub stored_total: Decimal,
    /// Sum of balance-affecting log entries
    pub logged_total: Decimal,
}

impl Reconciliation {
    /// Whether stored and logged totals agree
    pub fn is_balanced(&self) -> bool {
        self.stored_total == self.logged_total
    }
}

/// Why a CAS body declined
#[derive(Debug, Clone, Copy)]
enum Refusal {
    Missing,
    Banned,
    Cooldown(DateTime<Utc>),
    Insufficient { available: Decimal, requested: Decimal },
    Resolved,
}

impl Refusal {
    fn into_error(self, kind: &str, id: impl fmt::Display) -> Error {
        match self {
            Refusal::Missing => Error::not_found(kind, id),
            Refusal::Banned => Error::Forbidden(format!("{} {} is banned", kind, id)),
            Refusal::Cooldown(until) => Error::PreconditionFailed(Precondition::CooldownActive { until }),
            Refusal::Insufficient { available, requested } => {
                Error::PreconditionFailed(Precondition::InsufficientBalance { available, requested })
            }
            Refusal::Resolved => Error::PreconditionFailed(Precondition::AlreadyResolved),
        }
    }
}

/// First `[A-Za-z0-9_-]+` run of a Mini-App start parameter
fn referrer_from_start_param(param: &str) -> Option<AccountId> {
    let is_id_char = |c: &char| c.is_ascii_alphanumeric() || *c == '_' || *c == '-';
    let run: String = param
        .chars()
        .skip_while(|c| !is_id_char(c))
        .take_while(is_id_char)
        .collect();
    AccountId::parse(&run)
}

/// Main ledger interface
pub struct Ledger {
    accounts: Collection<Account>,
    withdrawals: Collection<WithdrawalRequest>,
    tasks: Collection<Task>,
    submissions: Collection<TaskSubmission>,
    referrals: Collection<ReferralLink>,
    claims: IdempotencyGuard,
    settings: SettingsProvider,
    admins: AdminDirectory,
    log: TransactionLog,
    metrics: Metrics,
    config: Config,
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("service", &self.config.service_name)
            .field("backend", &self.config.storage.backend)
            .finish()
    }
}

fn collection<T>(backend: &Arc<dyn Backend>, space: Keyspace, retry: &RetryPolicy, metrics: &Metrics) -> Collection<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    Collection::new(backend.clone(), space, retry.clone()).with_conflict_counter(metrics.cas_conflicts.clone())
}

impl Ledger {
    /// Open ledger with the configured backend
    pub fn open(config: Config) -> Result<Self> {
        let backend: Arc<dyn Backend> = match config.storage.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::new()),
            #[cfg(feature = "rocksdb")]
            BackendKind::RocksDb => Arc::new(crate::storage::RocksBackend::open(
                &config.data_dir,
                &config.storage,
            )?),
            #[cfg(not(feature = "rocksdb"))]
            BackendKind::RocksDb => {
                return Err(Error::Config(
                    "storage.backend = \"rocksdb\" requires the rocksdb feature".into(),
                ))
            }
        };
        Self::with_backend(config, backend)
    }

    /// Ledger over a fresh in-memory backend
    pub fn in_memory(config: Config) -> Result<Self> {
        Self::with_backend(config, Arc::new(MemoryBackend::new()))
    }

    /// Ledger over `backend`. Seeds the configured bootstrap admins.
    pub fn with_backend(config: Config, backend: Arc<dyn Backend>) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let retry = RetryPolicy::from_config(&config.storage);

        let settings = SettingsProvider::new(
            collection(&backend, Keyspace::Settings, &retry, &metrics),
            Duration::from_millis(config.settings_cache_ttl_ms),
        );
        let admins = AdminDirectory::new(collection(&backend, Keyspace::Admins, &retry, &metrics));
        admins.seed(config.telegram.admin_ids.iter().map(String::as_str))?;

        let ledger = Self {
            accounts: collection(&backend, Keyspace::Accounts, &retry, &metrics),
            withdrawals: collection(&backend, Keyspace::Withdrawals, &retry, &metrics),
            tasks: collection(&backend, Keyspace::Tasks, &retry, &metrics),
            submissions: collection(&backend, Keyspace::Submissions, &retry, &metrics),
            referrals: collection(&backend, Keyspace::Referrals, &retry, &metrics),
            claims: IdempotencyGuard::new(collection(&backend, Keyspace::Claims, &retry, &metrics)),
            log: TransactionLog::new(collection(&backend, Keyspace::Transactions, &retry, &metrics)),
            settings,
            admins,
            metrics,
            config,
        };

        tracing::info!(
            service = %ledger.config.service_name,
            backend = ?ledger.config.storage.backend,
            "Ledger opened"
        );
        Ok(ledger)
    }

    // ---- internal helpers -------------------------------------------------

    fn refuse(&self, refusal: Refusal, kind: &str, id: impl fmt::Display) -> Error {
        let reason = match refusal {
            Refusal::Missing => "not_found",
            Refusal::Banned => "banned",
            Refusal::Cooldown(_) => "cooldown",
            Refusal::Insufficient { .. } => "insufficient_balance",
            Refusal::Resolved => "already_resolved",
        };
        self.metrics.record_refusal(reason);
        tracing::debug!(kind, id = %id, reason, "Operation refused");
        refusal.into_error(kind, id)
    }

    fn precondition(&self, precondition: Precondition) -> Error {
        self.metrics.record_refusal(precondition.reason());
        tracing::debug!(reason = precondition.reason(), "Precondition failed");
        Error::PreconditionFailed(precondition)
    }

    fn record(&self, entry: NewEntry) {
        if self.log.record(entry).is_none() {
            self.metrics.set_repair_candidates(self.log.repair_candidates().len());
        }
    }

    fn flag(&self, candidate: RepairCandidate) {
        self.log.flag(candidate);
        self.metrics.set_repair_candidates(self.log.repair_candidates().len());
    }

    fn release_claim(&self, key: &ClaimKey) {
        if let Err(e) = self.claims.release(key) {
            tracing::error!(claim = %key, error = %e, "Failed to release claim");
        }
    }

    // ---- accounts ---------------------------------------------------------

    /// Create the account if it does not exist yet.
    ///
    /// The referrer is taken from the Mini-App start parameter and is fixed
    /// at creation; reopening an existing account changes nothing. Ids must
    /// pass [`AccountId::parse`] unchanged.
    pub fn open_account(&self, uid: &AccountId, start_param: Option<&str>) -> Result<Account> {
        self.create_account(uid, None, start_param)
    }

    /// [`Ledger::open_account`] for a verified Mini-App identity
    pub fn open_verified(&self, identity: &VerifiedIdentity) -> Result<Account> {
        self.create_account(
            &identity.account_id,
            identity.username.clone(),
            identity.start_param.as_deref(),
        )
    }

    fn create_account(&self, uid: &AccountId, username: Option<String>, start_param: Option<&str>) -> Result<Account> {
        // Ids prefix the account's log, claim and referral keys
        if AccountId::parse(uid.as_str()).as_ref() != Some(uid) {
            return Err(self.precondition(Precondition::InvalidAccountId(uid.to_string())));
        }
        let referrer = start_param.and_then(referrer_from_start_param);
        let mut account = Account::new(uid.clone(), referrer, Utc::now());
        account.username = username;

        if self.accounts.insert_if_absent(uid.as_str(), &account)? {
            tracing::info!(
                account_id = %uid,
                referrer = ?account.referral.referrer_id.as_ref().map(AccountId::as_str),
                "Account opened"
            );
            Ok(account)
        } else {
            self.account(uid)
        }
    }

    /// Read an account
    pub fn account(&self, uid: &AccountId) -> Result<Account> {
        self.accounts
            .get(uid.as_str())?
            .ok_or_else(|| Error::not_found("account", uid))
    }

    /// Caller with the admin capability looked up
    pub fn caller(&self, uid: &AccountId) -> Result<Caller> {
        Caller::resolve(&self.admins, uid.clone())
    }

    /// Admin directory
    pub fn admins(&self) -> &AdminDirectory {
        &self.admins
    }

    // ---- rewards ----------------------------------------------------------

    /// Credit one ad view.
    ///
    /// The cooldown check and the new cooldown are part of the same CAS
    /// body as the credit, so two concurrent calls cannot both pass.
    pub async fn credit_ad_reward(&self, uid: &AccountId) -> Result<RewardCredit> {
        let settings = self.settings.current_settings()?;
        let reward = settings.ad_reward_trx;
        let cooldown = settings.ad_cooldown();

        let mut refusal = Refusal::Missing;
        let updated = self
            .accounts
            .atomic_update(uid.as_str(), |mut account| {
                // Per attempt: a retry must not reuse a time older than the winner's
                let now = Utc::now();
                if account.banned {
                    refusal = Refusal::Banned;
                    return None;
                }
                if !account.cooldown_elapsed(now) {
                    refusal = Refusal::Cooldown(account.cooldown_until);
                    return None;
                }
                account.balances.credit(Category::Ads, reward);
                account.cooldown_until = now + cooldown;
                Some(account)
            })
            .await?;

        let account = match updated {
            Some(account) => account,
            None => return Err(self.refuse(refusal, "account", uid)),
        };

        self.record(NewEntry::new(
            uid.clone(),
            TransactionType::EarnAd,
            reward,
            TransactionStatus::Completed,
        ));
        self.metrics.record_credit(TransactionType::EarnAd, reward);
        tracing::info!(account_id = %uid, amount = %reward, "Ad reward credited");

        let commission = self.credit_commission(&account, reward, None, &settings).await;
        Ok(RewardCredit {
            account,
            amount: reward,
            commission,
        })
    }

    /// Pay the referrer's cut of `reward`. Failures are logged, never returned.
    async fn credit_commission(
        &self,
        referee: &Account,
        reward: Decimal,
        task_id: Option<Uuid>,
        settings: &Settings,
    ) -> Option<CommissionCredit> {
        let referrer = referee.referrer()?.clone();
        let amount = settings.commission_on(reward);
        if amount <= Decimal::ZERO {
            return None;
        }

        let mut refusal = Refusal::Missing;
        let result = self
            .accounts
            .atomic_update(referrer.as_str(), |mut account| {
                if account.banned {
                    refusal = Refusal::Banned;
                    return None;
                }
                account.balances.credit(Category::Referrals, amount);
                account.referral.commission += amount;
                Some(account)
            })
            .await;

        match result {
            Ok(Some(_)) => {
                let mut entry = NewEntry::new(
                    referrer.clone(),
                    TransactionType::Commission,
                    amount,
                    TransactionStatus::Completed,
                )
                .from_user(referee.id.clone());
                if let Some(task_id) = task_id {
                    entry = entry.task(task_id);
                }
                self.record(entry);
                self.metrics.record_credit(TransactionType::Commission, amount);
                tracing::info!(
                    referrer_id = %referrer,
                    referee_id = %referee.id,
                    amount = %amount,
                    "Commission credited"
                );
                Some(CommissionCredit {
                    referrer_id: referrer,
                    amount,
                })
            }
            Ok(None) => {
                tracing::debug!(referrer_id = %referrer, reason = ?refusal, "Commission skipped");
                None
            }
            Err(e) => {
                tracing::warn!(
                    referrer_id = %referrer,
                    referee_id = %referee.id,
                    amount = %amount,
                    error = %e,
                    "Commission not credited"
                );
                None
            }
        }
    }

    /// Pay the referrer's signup bonus for `uid`, once per pair
    pub async fn credit_referral_signup(&self, uid: &AccountId) -> Result<SignupReward> {
        let referee = self.account(uid)?;
        let referrer_id = match referee.referrer() {
            Some(referrer) => referrer.clone(),
            None => return Ok(SignupReward::NoReferrer),
        };
        let settings = self.settings.current_settings()?;
        let reward = settings.referral_reward_trx;

        let key = ClaimKey::referral_signup(&referrer_id, uid);
        if self.claims.claim(&key)? == Claim::AlreadyClaimed {
            return Ok(SignupReward::AlreadyClaimed);
        }

        let mut refusal = Refusal::Missing;
        let result = self
            .accounts
            .atomic_update(referrer_id.as_str(), |mut account| {
                if account.banned {
                    refusal = Refusal::Banned;
                    return None;
                }
                account.balances.credit(Category::Referrals, reward);
                account.referral.total_refs += 1;
                account.referral.earned += reward;
                Some(account)
            })
            .await;

        let referrer = match result {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.release_claim(&key);
                return Err(self.refuse(refusal, "account", &referrer_id));
            }
            Err(e) => {
                self.release_claim(&key);
                return Err(e);
            }
        };

        self.record(
            NewEntry::new(
                referrer_id.clone(),
                TransactionType::Referral,
                reward,
                TransactionStatus::Completed,
            )
            .from_user(uid.clone()),
        );
        let link = ReferralLink {
            referee_id: uid.clone(),
            created_at: Utc::now(),
        };
        if let Err(e) = self.referrals.put(&format!("{}/{}", referrer_id, uid), &link) {
            tracing::warn!(referrer_id = %referrer_id, referee_id = %uid, error = %e, "Referral link not stored");
        }
        self.metrics.record_credit(TransactionType::Referral, reward);
        tracing::info!(referrer_id = %referrer_id, referee_id = %uid, amount = %reward, "Signup bonus credited");

        Ok(SignupReward::Credited {
            referrer,
            amount: reward,
        })
    }

    /// Accounts `uid` referred, with the time each bonus was credited
    pub fn referrals_of(&self, uid: &AccountId) -> Result<Vec<ReferralLink>> {
        self.referrals.scan(&format!("{}/", uid))
    }

    /// Grant an active task's reward, once per (task, user)
    pub async fn credit_task_reward(&self, uid: &AccountId, task_id: Uuid) -> Result<TaskReward> {
        let task = self.task(task_id)?;
        if !task.active {
            return Err(self.precondition(Precondition::TaskInactive));
        }
        self.grant_task_reward(uid, &task).await
    }

    async fn grant_task_reward(&self, uid: &AccountId, task: &Task) -> Result<TaskReward> {
        let settings = self.settings.current_settings()?;
        let reward = task.reward;

        let key = ClaimKey::task(task.id, uid);
        if self.claims.claim(&key)? == Claim::AlreadyClaimed {
            tracing::debug!(account_id = %uid, task_id = %task.id, "Task reward already claimed");
            return Ok(TaskReward::AlreadyClaimed);
        }

        let mut refusal = Refusal::Missing;
        let result = self
            .accounts
            .atomic_update(uid.as_str(), |mut account| {
                if account.banned {
                    refusal = Refusal::Banned;
                    return None;
                }
                account.balances.credit(Category::Tasks, reward);
                Some(account)
            })
            .await;

        let account = match result {
            Ok(Some(account)) => account,
            Ok(None) => {
                self.release_claim(&key);
                return Err(self.refuse(refusal, "account", uid));
            }
            Err(e) => {
                self.release_claim(&key);
                return Err(e);
            }
        };

        if reward.is_zero() {
            return Ok(TaskReward::Credited(RewardCredit {
                account,
                amount: reward,
                commission: None,
            }));
        }

        self.record(
            NewEntry::new(uid.clone(), TransactionType::Task, reward, TransactionStatus::Completed)
                .task(task.id),
        );
        self.metrics.record_credit(TransactionType::Task, reward);
        tracing::info!(account_id = %uid, task_id = %task.id, amount = %reward, "Task reward credited");

        let commission = self
            .credit_commission(&account, reward, Some(task.id), &settings)
            .await;
        Ok(TaskReward::Credited(RewardCredit {
            account,
            amount: reward,
            commission,
        }))
    }

    /// Verify channel membership for an auto task, then grant its reward
    pub async fn verify_telegram_task(
        &self,
        uid: &AccountId,
        task_id: Uuid,
        checker: &dyn MembershipChecker,
    ) -> Result<TaskReward> {
        let task = self.task(task_id)?;
        if !task.active {
            return Err(self.precondition(Precondition::TaskInactive));
        }
        if task.verification != Verification::Auto {
            return Err(self.precondition(Precondition::ManualVerificationOnly));
        }
        let channel = match task.telegram_channel() {
            Some(channel) => channel.to_string(),
            None => return Err(self.precondition(Precondition::InvalidChannelLink(task.link.clone()))),
        };

        // Skip the external call when the claim is already taken; the
        // authoritative check is the claim itself.
        if self.claims.is_claimed(&ClaimKey::task(task.id, uid))? {
            return Ok(TaskReward::AlreadyClaimed);
        }

        if let Err(failure) = checker.check(&channel, uid).await {
            self.metrics.record_refusal("membership");
            tracing::info!(account_id = %uid, channel = %channel, %failure, "Membership not confirmed");
            return Err(Error::ExternalVerification(failure));
        }

        self.grant_task_reward(uid, &task).await
    }

    /// File a task for admin review
    pub fn submit_task(&self, uid: &AccountId, task_id: Uuid) -> Result<TaskSubmission> {
        let task = self.task(task_id)?;
        if !task.active {
            return Err(self.precondition(Precondition::TaskInactive));
        }
        let account = self.account(uid)?;
        if account.banned {
            return Err(self.refuse(Refusal::Banned, "account", uid));
        }

        let submission = TaskSubmission {
            id: Uuid::now_v7(),
            task_id,
            user_id: uid.clone(),
            status: ReviewStatus::Pending,
            created_at: Utc::now(),
            reviewed_at: None,
            reviewer: None,
        };
        self.submissions
            .put(&format!("{}/{}", task_id, submission.id), &submission)?;

        tracing::info!(account_id = %uid, task_id = %task_id, submission_id = %submission.id, "Task submitted");
        Ok(submission)
    }

    /// Approve or reject a task submission.
    ///
    /// The submission leaves Pending before any reward is paid, so a racing
    /// review of the same submission is refused instead of paying a
    /// rejected one. Approval grants the reward through the same claim as
    /// auto verification, so a task is never paid twice to one user.
    pub async fn resolve_task_submission(
        &self,
        caller: &Caller,
        task_id: Uuid,
        submission_id: Uuid,
        action: ReviewAction,
    ) -> Result<SubmissionReview> {
        caller.require_admin()?;
        let key = format!("{}/{}", task_id, submission_id);
        if self.submissions.get(&key)?.is_none() {
            return Err(Error::not_found("submission", submission_id));
        }
        let task = match action {
            ReviewAction::Approve => Some(self.task(task_id)?),
            ReviewAction::Reject => None,
        };

        let now = Utc::now();
        let status = action.target_status();
        let reviewer = caller.account_id.clone();
        let mut refusal = Refusal::Missing;
        let submission = self
            .submissions
            .atomic_update(&key, |mut submission| {
                if submission.status.is_terminal() {
                    refusal = Refusal::Resolved;
                    return None;
                }
                submission.status = status;
                submission.reviewed_at = Some(now);
                submission.reviewer = Some(reviewer.clone());
                Some(submission)
            })
            .await?;
        let submission = match submission {
            Some(submission) => submission,
            None => return Err(self.refuse(refusal, "submission", submission_id)),
        };

        let reward = match task {
            Some(task) => match self.grant_task_reward(&submission.user_id, &task).await {
                Ok(reward) => Some(reward),
                Err(e) => {
                    self.reopen_submission(&key, submission_id).await;
                    return Err(e);
                }
            },
            None => None,
        };

        tracing::info!(
            task_id = %task_id,
            submission_id = %submission_id,
            reviewer = %caller.account_id,
            status = ?submission.status,
            "Submission resolved"
        );
        Ok(SubmissionReview { submission, reward })
    }

    /// Put an approved submission back to Pending after its reward failed
    async fn reopen_submission(&self, key: &str, submission_id: Uuid) {
        let result = self
            .submissions
            .atomic_update(key, |mut submission| {
                if submission.status != ReviewStatus::Approved {
                    return None;
                }
                submission.status = ReviewStatus::Pending;
                submission.reviewed_at = None;
                submission.reviewer = None;
                Some(submission)
            })
            .await;
        match result {
            Ok(Some(_)) => {
                tracing::warn!(submission_id = %submission_id, "Reward not granted, submission reopened");
            }
            Ok(None) => {}
            Err(e) => {
                tracing::error!(
                    submission_id = %submission_id,
                    error = %e,
                    "Reward not granted and submission left approved"
                );
            }
        }
    }

    // ---- withdrawals ------------------------------------------------------

    /// Debit `draft.amount` and queue a withdrawal for admin review
    pub async fn request_withdrawal(&self, uid: &AccountId, draft: WithdrawalDraft) -> Result<WithdrawalRequest> {
        let settings = self.settings.current_settings()?;
        let amount = draft.amount;

        if amount <= Decimal::ZERO {
            return Err(self.precondition(Precondition::InvalidAmount(amount)));
        }
        if amount < settings.min_withdrawal_trx {
            return Err(self.precondition(Precondition::BelowMinimum {
                minimum: settings.min_withdrawal_trx,
                requested: amount,
            }));
        }
        if draft.destination_ref.trim().is_empty() {
            return Err(self.precondition(Precondition::MissingDestination));
        }

        let mut refusal = Refusal::Missing;
        let debited = self
            .accounts
            .atomic_update(uid.as_str(), |mut account| {
                if account.banned {
                    refusal = Refusal::Banned;
                    return None;
                }
                if account.balances.total < amount {
                    refusal = Refusal::Insufficient {
                        available: account.balances.total,
                        requested: amount,
                    };
                    return None;
                }
                account.balances.total -= amount;
                Some(account)
            })
            .await?;
        if debited.is_none() {
            return Err(self.refuse(refusal, "account", uid));
        }

        let request = WithdrawalRequest {
            id: Uuid::now_v7(),
            user_id: uid.clone(),
            amount,
            destination_ref: draft.destination_ref.trim().to_string(),
            asset: draft.asset,
            method: draft.method,
            status: ReviewStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };

        if let Err(e) = self.withdrawals.insert_if_absent(&request.id.to_string(), &request) {
            tracing::warn!(account_id = %uid, amount = %amount, error = %e, "Withdrawal not stored, reversing debit");
            self.restore_total(uid, amount, request.id, TransactionType::Withdraw, -amount)
                .await;
            return Err(e);
        }

        self.record(
            NewEntry::new(uid.clone(), TransactionType::Withdraw, -amount, TransactionStatus::Pending)
                .withdrawal(request.id),
        );
        self.metrics.record_withdrawal("requested");
        tracing::info!(account_id = %uid, withdrawal_id = %request.id, amount = %amount, "Withdrawal requested");
        Ok(request)
    }

    /// Add `amount` back to `total`. A failure is flagged as a repair
    /// candidate describing `missing`/`missing_amount`.
    async fn restore_total(
        &self,
        uid: &AccountId,
        amount: Decimal,
        withdrawal_id: Uuid,
        missing: TransactionType,
        missing_amount: Decimal,
    ) -> bool {
        let result = self
            .accounts
            .atomic_update(uid.as_str(), |mut account| {
                account.balances.total += amount;
                Some(account)
            })
            .await;

        let error = match result {
            Ok(Some(_)) => return true,
            Ok(None) => Error::not_found("account", uid).to_string(),
            Err(e) => e.to_string(),
        };
        self.flag(RepairCandidate {
            account_id: uid.clone(),
            tx_type: missing,
            amount: missing_amount,
            withdrawal_id: Some(withdrawal_id),
            error,
            detected_at: Utc::now(),
        });
        false
    }

    /// Approve or reject a pending withdrawal.
    ///
    /// Approval only records the decision; the amount left the balance at
    /// request time. Rejection refunds it.
    pub async fn resolve_withdrawal(
        &self,
        caller: &Caller,
        withdrawal_id: Uuid,
        action: ReviewAction,
    ) -> Result<WithdrawalRequest> {
        caller.require_admin()?;

        let now = Utc::now();
        let status = action.target_status();
        let admin = caller.account_id.clone();
        let mut refusal = Refusal::Missing;
        let updated = self
            .withdrawals
            .atomic_update(&withdrawal_id.to_string(), |mut request| {
                if request.status.is_terminal() {
                    refusal = Refusal::Resolved;
                    return None;
                }
                request.status = status;
                request.resolved_at = Some(now);
                request.resolved_by = Some(admin.clone());
                Some(request)
            })
            .await?;

        let request = match updated {
            Some(request) => request,
            None => return Err(self.refuse(refusal, "withdrawal", withdrawal_id)),
        };

        match action {
            ReviewAction::Approve => {
                self.record(
                    NewEntry::new(
                        request.user_id.clone(),
                        TransactionType::Withdraw,
                        -request.amount,
                        TransactionStatus::Approved,
                    )
                    .withdrawal(request.id),
                );
                self.metrics.record_withdrawal("approved");
            }
            ReviewAction::Reject => {
                let refunded = self
                    .restore_total(
                        &request.user_id,
                        request.amount,
                        request.id,
                        TransactionType::WithdrawRefund,
                        request.amount,
                    )
                    .await;
                if !refunded {
                    return Err(Error::TransientStorage(format!(
                        "withdrawal {} rejected but refund is pending repair",
                        request.id
                    )));
                }
                self.record(
                    NewEntry::new(
                        request.user_id.clone(),
                        TransactionType::WithdrawRefund,
                        request.amount,
                        TransactionStatus::Completed,
                    )
                    .withdrawal(request.id),
                );
                self.metrics.record_withdrawal("rejected");
            }
        }

        tracing::info!(
            withdrawal_id = %request.id,
            account_id = %request.user_id,
            amount = %request.amount,
            admin = %caller.account_id,
            status = ?request.status,
            "Withdrawal resolved"
        );
        Ok(request)
    }

    /// Read a withdrawal
    pub fn withdrawal(&self, withdrawal_id: Uuid) -> Result<WithdrawalRequest> {
        self.withdrawals
            .get(&withdrawal_id.to_string())?
            .ok_or_else(|| Error::not_found("withdrawal", withdrawal_id))
    }

    /// Withdrawals oldest first, optionally filtered by status
    pub fn list_withdrawals(&self, caller: &Caller, status: Option<ReviewStatus>) -> Result<Vec<WithdrawalRequest>> {
        caller.require_admin()?;
        Ok(self
            .withdrawals
            .scan("")?
            .into_iter()
            .filter(|request| status.map_or(true, |s| request.status == s))
            .collect())
    }

    // ---- admin ------------------------------------------------------------

    /// Ban or unban an account. Banned accounts earn nothing and cannot
    /// withdraw; pending refunds still go through.
    pub async fn set_banned(&self, caller: &Caller, uid: &AccountId, banned: bool) -> Result<Account> {
        caller.require_admin()?;
        let account = self
            .accounts
            .atomic_update(uid.as_str(), |mut account| {
                account.banned = banned;
                Some(account)
            })
            .await?
            .ok_or_else(|| Error::not_found("account", uid))?;

        tracing::info!(account_id = %uid, banned, admin = %caller.account_id, "Ban flag updated");
        Ok(account)
    }

    /// Current settings snapshot
    pub fn settings(&self) -> Result<Settings> {
        self.settings.current_settings()
    }

    /// Merge `patch` into the settings
    pub async fn update_settings(&self, caller: &Caller, patch: &SettingsPatch) -> Result<Settings> {
        caller.require_admin()?;
        self.settings.update(patch).await
    }

    /// Define a new, active task
    pub fn create_task(&self, caller: &Caller, draft: TaskDraft) -> Result<Task> {
        caller.require_admin()?;
        if draft.reward.is_sign_negative() {
            return Err(self.precondition(Precondition::InvalidAmount(draft.reward)));
        }

        let task = Task {
            id: Uuid::now_v7(),
            title: draft.title,
            link: draft.link,
            reward: draft.reward,
            category: draft.category,
            verification: draft.verification,
            active: true,
            created_at: Utc::now(),
        };
        if task.verification == Verification::Auto && task.telegram_channel().is_none() {
            return Err(self.precondition(Precondition::InvalidChannelLink(task.link)));
        }

        self.tasks.put(&task.id.to_string(), &task)?;
        tracing::info!(task_id = %task.id, reward = %task.reward, verification = ?task.verification, "Task created");
        Ok(task)
    }

    /// Enable or disable a task
    pub async fn set_task_active(&self, caller: &Caller, task_id: Uuid, active: bool) -> Result<Task> {
        caller.require_admin()?;
        let task = self
            .tasks
            .atomic_update(&task_id.to_string(), |mut task| {
                task.active = active;
                Some(task)
            })
            .await?
            .ok_or_else(|| Error::not_found("task", task_id))?;

        tracing::info!(task_id = %task_id, active, "Task updated");
        Ok(task)
    }

    /// Read a task
    pub fn task(&self, task_id: Uuid) -> Result<Task> {
        self.tasks
            .get(&task_id.to_string())?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    /// All tasks, oldest first
    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.tasks.scan("")
    }

    /// Submissions for `task_id`, oldest first
    pub fn list_submissions(&self, caller: &Caller, task_id: Uuid) -> Result<Vec<TaskSubmission>> {
        caller.require_admin()?;
        self.submissions.scan(&format!("{}/", task_id))
    }

    /// Earnings by category across all accounts
    pub fn earnings_summary(&self, caller: &Caller) -> Result<EarningsSummary> {
        caller.require_admin()?;
        self.log.earnings_summary()
    }

    // ---- audit ------------------------------------------------------------

    /// An account's log, oldest first
    pub fn transactions(&self, uid: &AccountId) -> Result<Vec<TransactionLogEntry>> {
        self.log.entries(uid)
    }

    /// Compare the stored balance with the log
    pub fn reconcile(&self, uid: &AccountId) -> Result<Reconciliation> {
        let account = self.account(uid)?;
        let logged_total = self.log.balance_from_log(uid)?;
        let reconciliation = Reconciliation {
            account_id: uid.clone(),
            stored_total: account.balances.total,
            logged_total,
        };
        if !reconciliation.is_balanced() {
            tracing::warn!(
                account_id = %uid,
                stored = %reconciliation.stored_total,
                logged = %reconciliation.logged_total,
                "Balance does not match log"
            );
        }
        Ok(reconciliation)
    }

    /// Committed mutations whose log entry is missing
    pub fn repair_candidates(&self) -> Vec<RepairCandidate> {
        self.log.repair_candidates()
    }

    /// Get metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration the ledger was opened with
    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerificationFailure;
    use crate::membership::StaticMembership;
    use crate::storage::{CasAttempt, UpdateFn};

    fn test_config() -> Config {
        let mut config = Config::default();
        config.settings_cache_ttl_ms = 0;
        config.telegram.admin_ids = vec!["admin".to_string()];
        config
    }

    fn ledger() -> Ledger {
        Ledger::in_memory(test_config()).unwrap()
    }

    fn admin(ledger: &Ledger) -> Caller {
        ledger.caller(&AccountId::new("admin")).unwrap()
    }

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn draft(reward: &str, verification: Verification) -> TaskDraft {
        TaskDraft {
            title: "Join channel".into(),
            link: "https://t.me/trx_news".into(),
            reward: dec(reward),
            category: "General".into(),
            verification,
        }
    }

    /// Account holding `amount` via a task reward
    async fn funded(ledger: &Ledger, uid: &str, amount: &str) -> AccountId {
        let uid = AccountId::new(uid);
        ledger.open_account(&uid, None).unwrap();
        let task = ledger
            .create_task(&admin(ledger), draft(amount, Verification::Manual))
            .unwrap();
        ledger.credit_task_reward(&uid, task.id).await.unwrap();
        uid
    }

    #[tokio::test]
    async fn test_ad_reward_scenario() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        let account = ledger.open_account(&uid, None).unwrap();
        assert_eq!(account.balances, crate::types::Balances::default());

        let credit = ledger.credit_ad_reward(&uid).await.unwrap();
        assert_eq!(credit.amount, dec("0.005"));
        assert!(credit.commission.is_none());

        let balances = ledger.account(&uid).unwrap().balances;
        assert_eq!(balances.total, dec("0.005"));
        assert_eq!(balances.ads, dec("0.005"));
        assert_eq!(balances.referrals, Decimal::ZERO);
        assert_eq!(balances.tasks, Decimal::ZERO);

        let log = ledger.transactions(&uid).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tx_type, TransactionType::EarnAd);
        assert_eq!(log[0].status, TransactionStatus::Completed);
        assert_eq!(ledger.metrics().credits_total.with_label_values(&["earn_ad"]).get(), 1);
    }

    #[tokio::test]
    async fn test_ad_cooldown_refuses_without_trace() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();

        ledger.credit_ad_reward(&uid).await.unwrap();
        let err = ledger.credit_ad_reward(&uid).await.unwrap_err();
        match err {
            Error::PreconditionFailed(Precondition::CooldownActive { until }) => assert!(until > Utc::now()),
            other => panic!("unexpected error: {}", other),
        }

        assert_eq!(ledger.account(&uid).unwrap().balances.total, dec("0.005"));
        assert_eq!(ledger.transactions(&uid).unwrap().len(), 1);
        assert_eq!(ledger.metrics().refusals_total.with_label_values(&["cooldown"]).get(), 1);
    }

    #[tokio::test]
    async fn test_ad_reward_pays_commission() {
        let ledger = ledger();
        let referrer = AccountId::new("1");
        let referee = AccountId::new("2");
        ledger.open_account(&referrer, None).unwrap();
        ledger.open_account(&referee, Some("1")).unwrap();

        let credit = ledger.credit_ad_reward(&referee).await.unwrap();
        let commission = credit.commission.unwrap();
        assert_eq!(commission.referrer_id, referrer);
        assert_eq!(commission.amount, dec("0.00025"));

        let account = ledger.account(&referrer).unwrap();
        assert_eq!(account.balances.total, dec("0.00025"));
        assert_eq!(account.balances.referrals, dec("0.00025"));
        assert_eq!(account.referral.commission, dec("0.00025"));

        let log = ledger.transactions(&referrer).unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].tx_type, TransactionType::Commission);
        assert_eq!(log[0].from_user_id.as_ref(), Some(&referee));
    }

    #[tokio::test]
    async fn test_banned_and_missing_accounts_refused() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        ledger.set_banned(&admin(&ledger), &uid, true).await.unwrap();

        assert!(matches!(ledger.credit_ad_reward(&uid).await, Err(Error::Forbidden(_))));
        assert!(matches!(
            ledger.credit_ad_reward(&AccountId::new("ghost")).await,
            Err(Error::NotFound(_))
        ));
        assert!(ledger.transactions(&uid).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commission_skipped_for_banned_referrer() {
        let ledger = ledger();
        let referrer = AccountId::new("1");
        let referee = AccountId::new("2");
        ledger.open_account(&referrer, None).unwrap();
        ledger.open_account(&referee, Some("1")).unwrap();
        ledger.set_banned(&admin(&ledger), &referrer, true).await.unwrap();

        let credit = ledger.credit_ad_reward(&referee).await.unwrap();
        assert!(credit.commission.is_none());
        assert_eq!(ledger.account(&referrer).unwrap().balances.total, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_task_reward_with_referrer_scenario() {
        let ledger = ledger();
        let referrer = AccountId::new("R");
        let uid = AccountId::new("U");
        ledger.open_account(&referrer, None).unwrap();
        ledger.open_account(&uid, Some("R")).unwrap();
        let task = ledger
            .create_task(&admin(&ledger), draft("1", Verification::Manual))
            .unwrap();

        let outcome = ledger.credit_task_reward(&uid, task.id).await.unwrap();
        assert!(matches!(outcome, TaskReward::Credited(ref c) if c.amount == Decimal::ONE));

        let account = ledger.account(&uid).unwrap();
        assert_eq!(account.balances.tasks, Decimal::ONE);
        assert_eq!(account.balances.total, Decimal::ONE);

        let referrer = ledger.account(&referrer).unwrap();
        assert_eq!(referrer.balances.referrals, dec("0.05"));
        assert_eq!(referrer.balances.total, dec("0.05"));
        assert_eq!(referrer.referral.commission, dec("0.05"));

        assert_eq!(
            ledger.credit_task_reward(&uid, task.id).await.unwrap(),
            TaskReward::AlreadyClaimed
        );
        assert_eq!(ledger.account(&uid).unwrap().balances.total, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_task_claim_released_when_refused() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        let task = ledger
            .create_task(&admin(&ledger), draft("1", Verification::Manual))
            .unwrap();

        // No account yet: refused, claim handed back
        assert!(matches!(
            ledger.credit_task_reward(&uid, task.id).await,
            Err(Error::NotFound(_))
        ));
        ledger.open_account(&uid, None).unwrap();
        assert!(matches!(
            ledger.credit_task_reward(&uid, task.id).await.unwrap(),
            TaskReward::Credited(_)
        ));
    }

    #[tokio::test]
    async fn test_inactive_task_refused() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        let task = ledger
            .create_task(&admin(&ledger), draft("1", Verification::Manual))
            .unwrap();
        ledger.set_task_active(&admin(&ledger), task.id, false).await.unwrap();

        assert!(matches!(
            ledger.credit_task_reward(&uid, task.id).await,
            Err(Error::PreconditionFailed(Precondition::TaskInactive))
        ));
        assert!(matches!(
            ledger.credit_task_reward(&uid, Uuid::now_v7()).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_referral_signup_once_per_pair() {
        let ledger = ledger();
        let referrer = AccountId::new("1");
        let referee = AccountId::new("2");
        let loner = AccountId::new("3");
        ledger.open_account(&referrer, None).unwrap();
        ledger.open_account(&referee, Some("1")).unwrap();
        ledger.open_account(&loner, None).unwrap();

        match ledger.credit_referral_signup(&referee).await.unwrap() {
            SignupReward::Credited { referrer, amount } => {
                assert_eq!(amount, dec("0.05"));
                assert_eq!(referrer.referral.total_refs, 1);
                assert_eq!(referrer.referral.earned, dec("0.05"));
                assert_eq!(referrer.balances.referrals, dec("0.05"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(
            ledger.credit_referral_signup(&referee).await.unwrap(),
            SignupReward::AlreadyClaimed
        );
        assert_eq!(
            ledger.credit_referral_signup(&loner).await.unwrap(),
            SignupReward::NoReferrer
        );

        let links = ledger.referrals_of(&referrer).unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].referee_id, referee);
        assert_eq!(ledger.account(&referrer).unwrap().balances.total, dec("0.05"));
    }

    #[test]
    fn test_open_account_referrer_parsing() {
        let ledger = ledger();
        let uid = AccountId::new("42");

        let account = ledger.open_account(&uid, Some(" ref 777?x")).unwrap();
        assert_eq!(account.referral.referrer_id, Some(AccountId::new("ref")));

        // Referrer is fixed at creation
        let again = ledger.open_account(&uid, Some("999")).unwrap();
        assert_eq!(again.referral.referrer_id, Some(AccountId::new("ref")));

        let own = ledger.open_account(&AccountId::new("7"), Some("7")).unwrap();
        assert!(own.referral.referrer_id.is_none());

        assert_eq!(referrer_from_start_param("%%%"), None);
        assert_eq!(referrer_from_start_param("6434588999"), Some(AccountId::new("6434588999")));
    }

    #[tokio::test]
    async fn test_open_account_rejects_key_unsafe_ids() {
        let ledger = ledger();
        let uid = AccountId::new("1");
        ledger.open_account(&uid, None).unwrap();

        for bad in ["1/x", "", " 1", "1/"] {
            let err = ledger.open_account(&AccountId::new(bad), None).unwrap_err();
            assert!(
                matches!(err, Error::PreconditionFailed(Precondition::InvalidAccountId(_))),
                "{:?} accepted",
                bad
            );
        }
        assert!(matches!(
            ledger.credit_ad_reward(&AccountId::new("1/x")).await,
            Err(Error::NotFound(_))
        ));

        // Neighbouring ids never share log entries
        let neighbour = AccountId::new("1-x");
        ledger.open_account(&neighbour, None).unwrap();
        ledger.credit_ad_reward(&neighbour).await.unwrap();
        assert!(ledger.transactions(&uid).unwrap().is_empty());
        let reconciliation = ledger.reconcile(&uid).unwrap();
        assert_eq!(reconciliation.logged_total, Decimal::ZERO);
        assert!(reconciliation.is_balanced());
    }

    #[tokio::test]
    async fn test_withdrawal_below_minimum_leaves_no_trace() {
        let ledger = ledger();
        let uid = funded(&ledger, "100", "1").await;

        let err = ledger
            .request_withdrawal(&uid, WithdrawalDraft::new(dec("0.1"), "binance-uid"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PreconditionFailed(Precondition::BelowMinimum { .. })));
        assert!(matches!(
            ledger
                .request_withdrawal(&uid, WithdrawalDraft::new(dec("-1"), "binance-uid"))
                .await,
            Err(Error::PreconditionFailed(Precondition::InvalidAmount(_)))
        ));
        assert!(matches!(
            ledger
                .request_withdrawal(&uid, WithdrawalDraft::new(dec("2"), "binance-uid"))
                .await,
            Err(Error::PreconditionFailed(Precondition::InsufficientBalance { .. }))
        ));

        assert_eq!(ledger.account(&uid).unwrap().balances.total, Decimal::ONE);
        assert!(ledger.list_withdrawals(&admin(&ledger), None).unwrap().is_empty());
        assert_eq!(ledger.transactions(&uid).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_withdraw_reject_restores_balance() {
        let ledger = ledger();
        let uid = funded(&ledger, "100", "1.5").await;

        let request = ledger
            .request_withdrawal(&uid, WithdrawalDraft::new(dec("0.5"), "binance-uid"))
            .await
            .unwrap();
        assert_eq!(request.status, ReviewStatus::Pending);
        assert_eq!(ledger.account(&uid).unwrap().balances.total, Decimal::ONE);

        let resolved = ledger
            .resolve_withdrawal(&admin(&ledger), request.id, ReviewAction::Reject)
            .await
            .unwrap();
        assert_eq!(resolved.status, ReviewStatus::Rejected);
        assert_eq!(resolved.resolved_by, Some(AccountId::new("admin")));

        let balances = ledger.account(&uid).unwrap().balances;
        assert_eq!(balances.total, dec("1.5"));
        assert_eq!(balances.tasks, dec("1.5"));
        assert!(ledger.reconcile(&uid).unwrap().is_balanced());

        let types: Vec<_> = ledger.transactions(&uid).unwrap().iter().map(|e| e.tx_type).collect();
        assert_eq!(
            types,
            vec![TransactionType::Task, TransactionType::Withdraw, TransactionType::WithdrawRefund]
        );
    }

    #[tokio::test]
    async fn test_withdraw_approve_keeps_debit() {
        let ledger = ledger();
        let uid = funded(&ledger, "100", "1").await;

        let request = ledger
            .request_withdrawal(&uid, WithdrawalDraft::new(dec("0.6"), "binance-uid"))
            .await
            .unwrap();
        ledger
            .resolve_withdrawal(&admin(&ledger), request.id, ReviewAction::Approve)
            .await
            .unwrap();

        assert_eq!(ledger.account(&uid).unwrap().balances.total, dec("0.4"));
        let reconciliation = ledger.reconcile(&uid).unwrap();
        assert!(reconciliation.is_balanced());
        assert_eq!(reconciliation.logged_total, dec("0.4"));

        let log = ledger.transactions(&uid).unwrap();
        assert_eq!(log.last().unwrap().status, TransactionStatus::Approved);
        assert_eq!(
            ledger.metrics().withdrawals_total.with_label_values(&["approved"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_resolve_withdrawal_guards() {
        let ledger = ledger();
        let uid = funded(&ledger, "100", "1").await;
        let request = ledger
            .request_withdrawal(&uid, WithdrawalDraft::new(dec("0.5"), "binance-uid"))
            .await
            .unwrap();

        let user = Caller::user(uid.clone());
        assert!(matches!(
            ledger.resolve_withdrawal(&user, request.id, ReviewAction::Approve).await,
            Err(Error::Forbidden(_))
        ));
        assert!(matches!(
            ledger
                .resolve_withdrawal(&admin(&ledger), Uuid::now_v7(), ReviewAction::Approve)
                .await,
            Err(Error::NotFound(_))
        ));

        ledger
            .resolve_withdrawal(&admin(&ledger), request.id, ReviewAction::Reject)
            .await
            .unwrap();
        assert!(matches!(
            ledger
                .resolve_withdrawal(&admin(&ledger), request.id, ReviewAction::Reject)
                .await,
            Err(Error::PreconditionFailed(Precondition::AlreadyResolved))
        ));
        // Refunded once only
        assert_eq!(ledger.account(&uid).unwrap().balances.total, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_verify_telegram_task() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        let task = ledger
            .create_task(&admin(&ledger), draft("0.2", Verification::Auto))
            .unwrap();
        let checker = StaticMembership::new();

        let err = ledger.verify_telegram_task(&uid, task.id, &checker).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalVerification(VerificationFailure::NotMember(_))
        ));

        checker.set_unreachable(true);
        let err = ledger.verify_telegram_task(&uid, task.id, &checker).await.unwrap_err();
        assert!(matches!(
            err,
            Error::ExternalVerification(VerificationFailure::Unavailable(_))
        ));
        assert_eq!(ledger.account(&uid).unwrap().balances.total, Decimal::ZERO);

        checker.set_unreachable(false);
        checker.set_status("trx_news", &uid, "member");
        assert!(matches!(
            ledger.verify_telegram_task(&uid, task.id, &checker).await.unwrap(),
            TaskReward::Credited(_)
        ));
        let calls = checker.calls();
        assert_eq!(
            ledger.verify_telegram_task(&uid, task.id, &checker).await.unwrap(),
            TaskReward::AlreadyClaimed
        );
        assert_eq!(checker.calls(), calls);
        assert_eq!(ledger.account(&uid).unwrap().balances.tasks, dec("0.2"));
    }

    #[tokio::test]
    async fn test_verify_telegram_task_rejects_manual_tasks() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        let task = ledger
            .create_task(&admin(&ledger), draft("0.2", Verification::Manual))
            .unwrap();

        assert!(matches!(
            ledger
                .verify_telegram_task(&uid, task.id, &StaticMembership::new())
                .await,
            Err(Error::PreconditionFailed(Precondition::ManualVerificationOnly))
        ));
    }

    #[test]
    fn test_create_task_validation() {
        let ledger = ledger();
        let mut bad_link = draft("1", Verification::Auto);
        bad_link.link = "https://example.com".into();
        assert!(matches!(
            ledger.create_task(&admin(&ledger), bad_link),
            Err(Error::PreconditionFailed(Precondition::InvalidChannelLink(_)))
        ));
        assert!(matches!(
            ledger.create_task(&admin(&ledger), draft("-1", Verification::Manual)),
            Err(Error::PreconditionFailed(Precondition::InvalidAmount(_)))
        ));
        assert!(matches!(
            ledger.create_task(&Caller::user(AccountId::new("1")), draft("1", Verification::Manual)),
            Err(Error::Forbidden(_))
        ));
        assert!(ledger.tasks().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_manual_submission_flow() {
        let ledger = ledger();
        let admin = admin(&ledger);
        let uid = AccountId::new("100");
        let other = AccountId::new("200");
        ledger.open_account(&uid, None).unwrap();
        ledger.open_account(&other, None).unwrap();
        let task = ledger.create_task(&admin, draft("0.3", Verification::Manual)).unwrap();

        let approved = ledger.submit_task(&uid, task.id).unwrap();
        let rejected = ledger.submit_task(&other, task.id).unwrap();
        assert_eq!(ledger.list_submissions(&admin, task.id).unwrap().len(), 2);

        let review = ledger
            .resolve_task_submission(&admin, task.id, approved.id, ReviewAction::Approve)
            .await
            .unwrap();
        assert_eq!(review.submission.status, ReviewStatus::Approved);
        assert_eq!(review.submission.reviewer, Some(AccountId::new("admin")));
        assert!(matches!(review.reward, Some(TaskReward::Credited(_))));
        assert_eq!(ledger.account(&uid).unwrap().balances.tasks, dec("0.3"));

        let review = ledger
            .resolve_task_submission(&admin, task.id, rejected.id, ReviewAction::Reject)
            .await
            .unwrap();
        assert_eq!(review.submission.status, ReviewStatus::Rejected);
        assert!(review.reward.is_none());
        assert_eq!(ledger.account(&other).unwrap().balances.total, Decimal::ZERO);

        assert!(matches!(
            ledger
                .resolve_task_submission(&admin, task.id, approved.id, ReviewAction::Approve)
                .await,
            Err(Error::PreconditionFailed(Precondition::AlreadyResolved))
        ));
        assert!(matches!(
            ledger
                .resolve_task_submission(&admin, task.id, Uuid::now_v7(), ReviewAction::Approve)
                .await,
            Err(Error::NotFound(_))
        ));
        // Reward paid once despite the second approval attempt
        assert_eq!(ledger.account(&uid).unwrap().balances.total, dec("0.3"));
    }

    /// Rejects every pending submission the first time an account is
    /// written, the way a concurrent admin reject would land mid-approval.
    struct RejectDuringCredit {
        inner: MemoryBackend,
        fired: std::sync::atomic::AtomicBool,
    }

    impl RejectDuringCredit {
        fn reject_pending(&self) -> Result<()> {
            for (key, bytes) in self.inner.scan_prefix(Keyspace::Submissions, b"")? {
                let mut submission: TaskSubmission = bincode::deserialize(&bytes)?;
                if submission.status == ReviewStatus::Pending {
                    submission.status = ReviewStatus::Rejected;
                    self.inner
                        .put(Keyspace::Submissions, &key, &bincode::serialize(&submission)?)?;
                }
            }
            Ok(())
        }
    }

    impl Backend for RejectDuringCredit {
        fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.inner.get(space, key)
        }
        fn try_update(&self, space: Keyspace, key: &[u8], update: &mut UpdateFn<'_>) -> Result<CasAttempt> {
            if space == Keyspace::Accounts && !self.fired.swap(true, std::sync::atomic::Ordering::SeqCst) {
                self.reject_pending()?;
            }
            self.inner.try_update(space, key, update)
        }
        fn insert_if_absent(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<bool> {
            self.inner.insert_if_absent(space, key, value)
        }
        fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
            self.inner.put(space, key, value)
        }
        fn remove(&self, space: Keyspace, key: &[u8]) -> Result<()> {
            self.inner.remove(space, key)
        }
        fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.inner.scan_prefix(space, prefix)
        }
    }

    #[tokio::test]
    async fn test_reject_during_approval_cannot_pay_rejected_submission() {
        let backend = Arc::new(RejectDuringCredit {
            inner: MemoryBackend::new(),
            fired: std::sync::atomic::AtomicBool::new(false),
        });
        let ledger = Ledger::with_backend(test_config(), backend).unwrap();
        let admin = admin(&ledger);
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        let task = ledger.create_task(&admin, draft("1", Verification::Manual)).unwrap();
        let submission = ledger.submit_task(&uid, task.id).unwrap();

        let review = ledger
            .resolve_task_submission(&admin, task.id, submission.id, ReviewAction::Approve)
            .await
            .unwrap();

        assert_eq!(review.submission.status, ReviewStatus::Approved);
        assert!(matches!(review.reward, Some(TaskReward::Credited(_))));
        let stored = ledger.list_submissions(&admin, task.id).unwrap();
        assert_eq!(stored[0].status, ReviewStatus::Approved);
        assert_eq!(ledger.account(&uid).unwrap().balances.tasks, Decimal::ONE);
    }

    #[tokio::test]
    async fn test_failed_approval_reopens_submission() {
        let ledger = ledger();
        let admin = admin(&ledger);
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();
        let task = ledger.create_task(&admin, draft("0.3", Verification::Manual)).unwrap();
        let submission = ledger.submit_task(&uid, task.id).unwrap();
        ledger.set_banned(&admin, &uid, true).await.unwrap();

        assert!(matches!(
            ledger
                .resolve_task_submission(&admin, task.id, submission.id, ReviewAction::Approve)
                .await,
            Err(Error::Forbidden(_))
        ));
        let stored = ledger.list_submissions(&admin, task.id).unwrap();
        assert_eq!(stored[0].status, ReviewStatus::Pending);
        assert_eq!(stored[0].reviewer, None);

        ledger.set_banned(&admin, &uid, false).await.unwrap();
        let review = ledger
            .resolve_task_submission(&admin, task.id, submission.id, ReviewAction::Approve)
            .await
            .unwrap();
        assert_eq!(review.submission.status, ReviewStatus::Approved);
        assert_eq!(ledger.account(&uid).unwrap().balances.tasks, dec("0.3"));
    }

    #[tokio::test]
    async fn test_settings_update_applies_to_next_operation() {
        let ledger = ledger();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();

        let patch = SettingsPatch {
            ad_reward_trx: Some(dec("0.01")),
            ..SettingsPatch::default()
        };
        assert!(matches!(
            ledger.update_settings(&Caller::user(uid.clone()), &patch).await,
            Err(Error::Forbidden(_))
        ));
        ledger.update_settings(&admin(&ledger), &patch).await.unwrap();

        let credit = ledger.credit_ad_reward(&uid).await.unwrap();
        assert_eq!(credit.amount, dec("0.01"));
        assert_eq!(ledger.settings().unwrap().ad_cooldown_sec, 30);
    }

    #[tokio::test]
    async fn test_earnings_summary() {
        let ledger = ledger();
        let referrer = AccountId::new("1");
        let referee = AccountId::new("2");
        ledger.open_account(&referrer, None).unwrap();
        ledger.open_account(&referee, Some("1")).unwrap();

        ledger.credit_ad_reward(&referee).await.unwrap();
        ledger.credit_referral_signup(&referee).await.unwrap();
        let task = ledger
            .create_task(&admin(&ledger), draft("1", Verification::Manual))
            .unwrap();
        ledger.credit_task_reward(&referee, task.id).await.unwrap();

        let summary = ledger.earnings_summary(&admin(&ledger)).unwrap();
        assert_eq!(summary.ads, dec("0.005"));
        assert_eq!(summary.referrals, dec("0.05") + dec("0.00025") + dec("0.05"));
        assert_eq!(summary.tasks, Decimal::ONE);

        for uid in [&referrer, &referee] {
            assert!(ledger.reconcile(uid).unwrap().is_balanced());
        }
    }

    /// Memory backend whose transaction log rejects writes
    struct BrokenLog(MemoryBackend);

    impl Backend for BrokenLog {
        fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
            self.0.get(space, key)
        }
        fn try_update(&self, space: Keyspace, key: &[u8], update: &mut UpdateFn<'_>) -> Result<CasAttempt> {
            self.0.try_update(space, key, update)
        }
        fn insert_if_absent(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<bool> {
            self.0.insert_if_absent(space, key, value)
        }
        fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
            if space == Keyspace::Transactions {
                return Err(Error::Storage("log volume offline".into()));
            }
            self.0.put(space, key, value)
        }
        fn remove(&self, space: Keyspace, key: &[u8]) -> Result<()> {
            self.0.remove(space, key)
        }
        fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            self.0.scan_prefix(space, prefix)
        }
    }

    #[tokio::test]
    async fn test_failed_log_append_keeps_credit_and_flags_repair() {
        let ledger = Ledger::with_backend(test_config(), Arc::new(BrokenLog(MemoryBackend::new()))).unwrap();
        let uid = AccountId::new("100");
        ledger.open_account(&uid, None).unwrap();

        ledger.credit_ad_reward(&uid).await.unwrap();

        assert_eq!(ledger.account(&uid).unwrap().balances.total, dec("0.005"));
        let repairs = ledger.repair_candidates();
        assert_eq!(repairs.len(), 1);
        assert_eq!(repairs[0].tx_type, TransactionType::EarnAd);
        assert_eq!(ledger.metrics().repair_candidates.get(), 1);
        assert!(!ledger.reconcile(&uid).unwrap().is_balanced());
    }

    #[test]
    fn test_rocksdb_backend_needs_feature() {
        let mut config = test_config();
        config.storage.backend = BackendKind::RocksDb;
        config.data_dir = std::env::temp_dir().join(format!("reward-ledger-{}", Uuid::now_v7()));
        let result = Ledger::open(config.clone());
        if cfg!(feature = "rocksdb") {
            assert!(result.is_ok());
            let _ = std::fs::remove_dir_all(&config.data_dir);
        } else {
            assert!(matches!(result, Err(Error::Config(_))));
        }
    }
}
