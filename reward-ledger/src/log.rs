//! Append-only transaction log
//!
//! Entries are keyed `account_id/stamp/entry_id`, where `stamp` is a
//! zero-padded nanosecond timestamp that strictly increases per account,
//! also across restarts. A prefix scan therefore returns one account's
//! history in causal order.
//!
//! Log appends are not atomic with the balance mutation they describe.
//! When an append fails after its mutation committed, the entry is kept as
//! a repair candidate instead of being retried as a fresh credit.

use crate::error::Result;
use crate::store::Collection;
use crate::types::{AccountId, TransactionLogEntry, TransactionStatus, TransactionType};
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

/// Entry about to be appended
#[derive(Debug, Clone)]
pub struct NewEntry {
    account_id: AccountId,
    tx_type: TransactionType,
    amount: Decimal,
    status: TransactionStatus,
    task_id: Option<Uuid>,
    from_user_id: Option<AccountId>,
    withdrawal_id: Option<Uuid>,
}

impl NewEntry {
    /// Entry with no provenance
    pub fn new(
        account_id: AccountId,
        tx_type: TransactionType,
        amount: Decimal,
        status: TransactionStatus,
    ) -> Self {
        Self {
            account_id,
            tx_type,
            amount,
            status,
            task_id: None,
            from_user_id: None,
            withdrawal_id: None,
        }
    }

    /// Attach the task that produced the entry
    pub fn task(mut self, task_id: Uuid) -> Self {
        self.task_id = Some(task_id);
        self
    }

    /// Attach the referee that produced the entry
    pub fn from_user(mut self, user: AccountId) -> Self {
        self.from_user_id = Some(user);
        self
    }

    /// Attach the withdrawal the entry refers to
    pub fn withdrawal(mut self, withdrawal_id: Uuid) -> Self {
        self.withdrawal_id = Some(withdrawal_id);
        self
    }
}

/// Committed mutation whose log entry could not be written
#[derive(Debug, Clone)]
pub struct RepairCandidate {
    /// Account whose balance moved
    pub account_id: AccountId,
    /// Entry type that is missing
    pub tx_type: TransactionType,
    /// Amount that is missing
    pub amount: Decimal,
    /// Withdrawal involved, if any
    pub withdrawal_id: Option<Uuid>,
    /// Append error
    pub error: String,
    /// When the append failed
    pub detected_at: DateTime<Utc>,
}

/// Totals across every account's log
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EarningsSummary {
    /// Sum of ad rewards
    pub ads: Decimal,
    /// Sum of signup bonuses and commissions
    pub referrals: Decimal,
    /// Sum of task rewards
    pub tasks: Decimal,
}

/// Accounts whose last stamp is kept in memory before the map is reset
const TRACKED_ACCOUNTS: usize = 65_536;

/// Per-account append-only history
pub struct TransactionLog {
    entries: Collection<TransactionLogEntry>,
    last_stamp: DashMap<AccountId, DateTime<Utc>>,
    tracked_limit: usize,
    repairs: Mutex<Vec<RepairCandidate>>,
}

impl std::fmt::Debug for TransactionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionLog")
            .field("entries", &self.entries)
            .field("tracked", &self.last_stamp.len())
            .field("repairs", &self.repairs.lock().len())
            .finish()
    }
}

impl TransactionLog {
    /// Log over the transactions collection
    pub fn new(entries: Collection<TransactionLogEntry>) -> Self {
        Self::with_tracking_limit(entries, TRACKED_ACCOUNTS)
    }

    /// Log keeping at most `limit` accounts' last stamps in memory
    pub fn with_tracking_limit(entries: Collection<TransactionLogEntry>, limit: usize) -> Self {
        Self {
            entries,
            last_stamp: DashMap::new(),
            tracked_limit: limit.max(1),
            repairs: Mutex::new(Vec::new()),
        }
    }

    /// Next timestamp for `account`, strictly after the previous one.
    ///
    /// Accounts missing from the map are seeded from their last stored
    /// entry, so resetting the map never reorders a log.
    fn stamp(&self, account: &AccountId) -> Result<DateTime<Utc>> {
        if !self.last_stamp.contains_key(account) && self.last_stamp.len() >= self.tracked_limit {
            self.last_stamp.clear();
        }

        let now = Utc::now();
        let mut last = match self.last_stamp.entry(account.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                let stored = self
                    .entries
                    .scan(&Self::prefix(account))?
                    .last()
                    .map(|stored| stored.created_at);
                entry.insert(stored.unwrap_or(now - Duration::nanoseconds(1)))
            }
        };
        let next = if now > *last {
            now
        } else {
            *last + Duration::nanoseconds(1)
        };
        *last = next;
        Ok(next)
    }

    fn prefix(account: &AccountId) -> String {
        format!("{}/", account)
    }

    /// Append an entry
    pub fn append(&self, new: NewEntry) -> Result<TransactionLogEntry> {
        let created_at = self.stamp(&new.account_id)?;
        let entry = TransactionLogEntry {
            entry_id: Uuid::now_v7(),
            account_id: new.account_id,
            tx_type: new.tx_type,
            amount: new.amount,
            status: new.status,
            created_at,
            task_id: new.task_id,
            from_user_id: new.from_user_id,
            withdrawal_id: new.withdrawal_id,
        };

        let key = format!(
            "{}{:020}/{}",
            Self::prefix(&entry.account_id),
            created_at.timestamp_nanos_opt().unwrap_or(0).max(0),
            entry.entry_id
        );
        self.entries.put(&key, &entry)?;

        tracing::debug!(
            account_id = %entry.account_id,
            tx_type = %entry.tx_type,
            amount = %entry.amount,
            "Transaction logged"
        );
        Ok(entry)
    }

    /// Append an entry describing a mutation that already committed.
    ///
    /// A failed append is recorded as a repair candidate and does not fail
    /// the operation.
    pub fn record(&self, new: NewEntry) -> Option<TransactionLogEntry> {
        let (account_id, tx_type, amount, withdrawal_id) =
            (new.account_id.clone(), new.tx_type, new.amount, new.withdrawal_id);
        match self.append(new) {
            Ok(entry) => Some(entry),
            Err(e) => {
                self.flag(RepairCandidate {
                    account_id,
                    tx_type,
                    amount,
                    withdrawal_id,
                    error: e.to_string(),
                    detected_at: Utc::now(),
                });
                None
            }
        }
    }

    /// Remember a committed change whose follow-up write failed
    pub fn flag(&self, candidate: RepairCandidate) {
        tracing::error!(
            account_id = %candidate.account_id,
            tx_type = %candidate.tx_type,
            amount = %candidate.amount,
            error = %candidate.error,
            "Ledger and log diverged; flagged for repair"
        );
        self.repairs.lock().push(candidate);
    }

    /// One account's history, oldest first
    pub fn entries(&self, account: &AccountId) -> Result<Vec<TransactionLogEntry>> {
        self.entries.scan(&Self::prefix(account))
    }

    /// Balance implied by the log
    pub fn balance_from_log(&self, account: &AccountId) -> Result<Decimal> {
        Ok(self
            .entries(account)?
            .iter()
            .filter(|entry| entry.affects_balance())
            .map(|entry| entry.amount)
            .sum())
    }

    /// Earnings by category over every account
    pub fn earnings_summary(&self) -> Result<EarningsSummary> {
        let mut by_type: HashMap<TransactionType, Decimal> = HashMap::new();
        for entry in self.entries.scan("")? {
            *by_type.entry(entry.tx_type).or_default() += entry.amount;
        }
        let get = |t: TransactionType| by_type.get(&t).copied().unwrap_or_default();

        Ok(EarningsSummary {
            ads: get(TransactionType::EarnAd),
            referrals: get(TransactionType::Referral) + get(TransactionType::Commission),
            tasks: get(TransactionType::Task),
        })
    }

    /// Mutations whose entries are missing
    pub fn repair_candidates(&self) -> Vec<RepairCandidate> {
        self.repairs.lock().clone()
    }
}
