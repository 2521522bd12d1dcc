//! Error types for the reward ledger

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::fmt;
use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Account, task, withdrawal or submission absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller lacks admin capability, or the account is banned
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Credential could not be verified
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// A business rule refused the operation; nothing was mutated
    #[error("Precondition failed: {0}")]
    PreconditionFailed(Precondition),

    /// Storage stayed contended or unavailable after the retry budget
    #[error("Transient storage failure: {0}")]
    TransientStorage(String),

    /// Third-party membership check errored or reported a non-member
    #[error("External verification failed: {0}")]
    ExternalVerification(VerificationFailure),

    /// Storage backend error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether a blind retry of the same request is safe and may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::TransientStorage(_))
    }

    /// Shorthand for a `NotFound` naming the missing entity.
    pub fn not_found(kind: &str, id: impl fmt::Display) -> Self {
        Error::NotFound(format!("{} {}", kind, id))
    }
}

/// Business-rule refusals
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Ad reward requested before the cooldown elapsed
    CooldownActive {
        /// Earliest instant the next ad reward is accepted
        until: DateTime<Utc>,
    },
    /// Withdrawal larger than the available balance
    InsufficientBalance {
        /// Current total balance
        available: Decimal,
        /// Requested amount
        requested: Decimal,
    },
    /// Withdrawal below the configured minimum
    BelowMinimum {
        /// Configured minimum
        minimum: Decimal,
        /// Requested amount
        requested: Decimal,
    },
    /// Amount is zero or negative
    InvalidAmount(Decimal),
    /// Withdrawal or submission already reached a terminal state
    AlreadyResolved,
    /// Task is disabled
    TaskInactive,
    /// Task link does not name a Telegram channel
    InvalidChannelLink(String),
    /// Task is verified by an admin, not automatically
    ManualVerificationOnly,
    /// Withdrawal has no destination account
    MissingDestination,
    /// Account id is empty, padded or contains the `/` key separator
    InvalidAccountId(String),
}

impl Precondition {
    /// Short label for metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Precondition::CooldownActive { .. } => "cooldown",
            Precondition::InsufficientBalance { .. } => "insufficient_balance",
            Precondition::BelowMinimum { .. } => "below_minimum",
            Precondition::InvalidAmount(_) => "invalid_amount",
            Precondition::AlreadyResolved => "already_resolved",
            Precondition::TaskInactive => "task_inactive",
            Precondition::InvalidChannelLink(_) => "invalid_channel_link",
            Precondition::ManualVerificationOnly => "manual_verification_only",
            Precondition::MissingDestination => "missing_destination",
            Precondition::InvalidAccountId(_) => "invalid_account_id",
        }
    }
}

impl fmt::Display for Precondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Precondition::CooldownActive { until } => {
                write!(f, "cooldown active until {}", until.to_rfc3339())
            }
            Precondition::InsufficientBalance { available, requested } => {
                write!(f, "insufficient balance: {} < {}", available, requested)
            }
            Precondition::BelowMinimum { minimum, requested } => {
                write!(f, "below minimum: {} < {}", requested, minimum)
            }
            Precondition::InvalidAmount(amount) => write!(f, "invalid amount {}", amount),
            Precondition::AlreadyResolved => write!(f, "already resolved"),
            Precondition::TaskInactive => write!(f, "task is inactive"),
            Precondition::InvalidChannelLink(link) => write!(f, "invalid channel link {:?}", link),
            Precondition::ManualVerificationOnly => write!(f, "task requires manual review"),
            Precondition::MissingDestination => write!(f, "missing withdrawal destination"),
            Precondition::InvalidAccountId(id) => write!(f, "invalid account id {:?}", id),
        }
    }
}

/// Why an external membership check did not confirm membership
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationFailure {
    /// The messaging API reported a status other than member
    NotMember(String),
    /// The messaging API could not be reached or answered garbage
    Unavailable(String),
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerificationFailure::NotMember(status) => write!(f, "not a member (status {})", status),
            VerificationFailure::Unavailable(msg) => write!(f, "verification unavailable: {}", msg),
        }
    }
}

#[cfg(feature = "rocksdb")]
impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        match err.kind() {
            rocksdb::ErrorKind::Busy
            | rocksdb::ErrorKind::TimedOut
            | rocksdb::ErrorKind::TryAgain => Error::TransientStorage(err.to_string()),
            _ => Error::Storage(err.to_string()),
        }
    }
}
