//! Storage backends
//!
//! # Keyspaces
//!
//! - `accounts` - One balance record per user (key: account_id)
//! - `transactions` - Append-only log (key: account_id/stamp/entry_id)
//! - `withdrawals` - Withdrawal requests (key: withdrawal_id)
//! - `tasks` - Admin-defined tasks (key: task_id)
//! - `submissions` - Manual task submissions (key: task_id/submission_id)
//! - `claims` - Idempotency markers (key: kind/subject)
//! - `referrals` - Referrer dashboard mapping (key: referrer_id/referee_id)
//! - `settings` - Tunables snapshot (single key)
//! - `admins` - Admin flags (key: account_id)
//!
//! Backends only move bytes. Serialization and the CAS retry loop live in
//! [`crate::store::Collection`].

use crate::error::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Logical keyspace (column family on disk)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyspace {
    /// Account balance records
    Accounts,
    /// Transaction log entries
    Transactions,
    /// Withdrawal requests
    Withdrawals,
    /// Tasks
    Tasks,
    /// Task submissions
    Submissions,
    /// Idempotency claims
    Claims,
    /// Referrer -> referee mapping
    Referrals,
    /// Settings snapshot
    Settings,
    /// Admin flags
    Admins,
}

impl Keyspace {
    /// Every keyspace, in column family creation order
    pub const ALL: [Keyspace; 9] = [
        Keyspace::Accounts,
        Keyspace::Transactions,
        Keyspace::Withdrawals,
        Keyspace::Tasks,
        Keyspace::Submissions,
        Keyspace::Claims,
        Keyspace::Referrals,
        Keyspace::Settings,
        Keyspace::Admins,
    ];

    /// Column family name
    pub fn name(&self) -> &'static str {
        match self {
            Keyspace::Accounts => "accounts",
            Keyspace::Transactions => "transactions",
            Keyspace::Withdrawals => "withdrawals",
            Keyspace::Tasks => "tasks",
            Keyspace::Submissions => "submissions",
            Keyspace::Claims => "claims",
            Keyspace::Referrals => "referrals",
            Keyspace::Settings => "settings",
            Keyspace::Admins => "admins",
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of a single optimistic write attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasAttempt {
    /// The new value was committed
    Applied(Vec<u8>),
    /// The update function refused; nothing was written
    Declined,
    /// Another writer changed the key between read and write
    Conflict,
}

/// Update function handed to [`Backend::try_update`].
///
/// Receives the current value (if any) and returns the replacement, or
/// `None` to decline.
pub type UpdateFn<'a> = dyn FnMut(Option<&[u8]>) -> Result<Option<Vec<u8>>> + Send + 'a;

/// Keyspaced byte store with optimistic concurrency
pub trait Backend: Send + Sync + 'static {
    /// Read a value
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// One read-modify-write attempt.
    ///
    /// Must return [`CasAttempt::Conflict`] instead of writing when the key
    /// changed after it was read. Retrying is the caller's job.
    fn try_update(&self, space: Keyspace, key: &[u8], update: &mut UpdateFn<'_>) -> Result<CasAttempt>;

    /// Atomically write `value` only if `key` is absent. Returns whether
    /// the write happened.
    fn insert_if_absent(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<bool>;

    /// Unconditional write
    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()>;

    /// Delete a key (absent keys are fine)
    fn remove(&self, space: Keyspace, key: &[u8]) -> Result<()>;

    /// All entries whose key starts with `prefix`, in key order
    fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>>;
}

#[derive(Debug, Clone)]
struct Versioned {
    version: u64,
    bytes: Vec<u8>,
}

/// In-process backend.
///
/// Each record carries a version stamp; a write commits only if the stamp
/// still matches the one observed when the update function ran. Stamps come
/// from one counter, so a key that is removed and re-created never repeats
/// a stamp. Keys live in `dashmap` shards, so writers to different accounts
/// do not contend.
#[derive(Debug)]
pub struct MemoryBackend {
    spaces: HashMap<Keyspace, DashMap<Vec<u8>, Versioned>>,
    clock: AtomicU64,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        let spaces = Keyspace::ALL
            .iter()
            .map(|space| (*space, DashMap::new()))
            .collect();
        Self {
            spaces,
            clock: AtomicU64::new(0),
        }
    }

    fn next_version(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn space(&self, space: Keyspace) -> &DashMap<Vec<u8>, Versioned> {
        // every keyspace is created in new()
        &self.spaces[&space]
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for MemoryBackend {
    fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.space(space).get(key).map(|v| v.bytes.clone()))
    }

    fn try_update(&self, space: Keyspace, key: &[u8], update: &mut UpdateFn<'_>) -> Result<CasAttempt> {
        let map = self.space(space);

        // Snapshot without holding the shard lock while `update` runs
        let observed = map.get(key).map(|v| v.value().clone());
        let next = match update(observed.as_ref().map(|v| v.bytes.as_slice()))? {
            Some(next) => next,
            None => return Ok(CasAttempt::Declined),
        };

        match map.entry(key.to_vec()) {
            Entry::Occupied(mut slot) => match &observed {
                Some(seen) if seen.version == slot.get().version => {
                    let version = self.next_version();
                    slot.insert(Versioned { version, bytes: next.clone() });
                    Ok(CasAttempt::Applied(next))
                }
                _ => Ok(CasAttempt::Conflict),
            },
            Entry::Vacant(slot) => {
                if observed.is_some() {
                    // removed underneath us
                    return Ok(CasAttempt::Conflict);
                }
                let version = self.next_version();
                slot.insert(Versioned { version, bytes: next.clone() });
                Ok(CasAttempt::Applied(next))
            }
        }
    }

    fn insert_if_absent(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<bool> {
        match self.space(space).entry(key.to_vec()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                let version = self.next_version();
                slot.insert(Versioned { version, bytes: value.to_vec() });
                Ok(true)
            }
        }
    }

    fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
        let version = self.next_version();
        self.space(space).insert(key.to_vec(), Versioned { version, bytes: value.to_vec() });
        Ok(())
    }

    fn remove(&self, space: Keyspace, key: &[u8]) -> Result<()> {
        self.space(space).remove(key);
        Ok(())
    }

    fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut out: Vec<(Vec<u8>, Vec<u8>)> = self
            .space(space)
            .iter()
            .filter(|item| item.key().starts_with(prefix))
            .map(|item| (item.key().clone(), item.value().bytes.clone()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;

#[cfg(feature = "rocksdb")]
mod rocks {
    use super::{Backend, CasAttempt, Keyspace, UpdateFn};
    use crate::config::StorageConfig;
    use crate::error::{Error, Result};
    use rocksdb::{
        ColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode,
        OptimisticTransactionDB, Options,
    };
    use std::path::Path;

    /// Attempts for `insert_if_absent` when its own commit conflicts
    const INSERT_ATTEMPTS: usize = 8;

    /// On-disk backend using RocksDB optimistic transactions.
    ///
    /// `get_for_update` registers the key with the transaction; the commit
    /// fails with `Busy` if another transaction wrote it in between.
    pub struct RocksBackend {
        db: OptimisticTransactionDB,
    }

    impl std::fmt::Debug for RocksBackend {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("RocksBackend").finish_non_exhaustive()
        }
    }

    impl RocksBackend {
        /// Open or create database
        pub fn open(path: impl AsRef<Path>, config: &StorageConfig) -> Result<Self> {
            let path = path.as_ref();
            std::fs::create_dir_all(path)?;

            let mut db_opts = Options::default();
            db_opts.create_if_missing(true);
            db_opts.create_missing_column_families(true);
            db_opts.set_write_buffer_size(config.write_buffer_size_mb * 1024 * 1024);
            db_opts.set_max_background_jobs(config.max_background_jobs);

            let cf_descriptors = Keyspace::ALL.iter().map(|space| {
                let mut opts = Options::default();
                opts.set_compression_type(match space {
                    // write-heavy, rarely re-read
                    Keyspace::Transactions => rocksdb::DBCompressionType::Zstd,
                    _ => rocksdb::DBCompressionType::Lz4,
                });
                ColumnFamilyDescriptor::new(space.name(), opts)
            });

            let db = OptimisticTransactionDB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;

            tracing::info!(
                path = ?path,
                column_families = Keyspace::ALL.len(),
                "Opened RocksDB account store"
            );

            Ok(Self { db })
        }

        fn cf(&self, space: Keyspace) -> Result<&ColumnFamily> {
            self.db
                .cf_handle(space.name())
                .ok_or_else(|| Error::Storage(format!("Column family {} not found", space)))
        }
    }

    fn is_conflict(err: &rocksdb::Error) -> bool {
        matches!(err.kind(), ErrorKind::Busy | ErrorKind::TryAgain)
    }

    impl Backend for RocksBackend {
        fn get(&self, space: Keyspace, key: &[u8]) -> Result<Option<Vec<u8>>> {
            Ok(self.db.get_cf(self.cf(space)?, key)?)
        }

        fn try_update(&self, space: Keyspace, key: &[u8], update: &mut UpdateFn<'_>) -> Result<CasAttempt> {
            let cf = self.cf(space)?;
            let txn = self.db.transaction();
            let current = txn.get_for_update_cf(cf, key, true)?;

            // Dropping an uncommitted transaction rolls it back
            let next = match update(current.as_deref())? {
                Some(next) => next,
                None => return Ok(CasAttempt::Declined),
            };

            txn.put_cf(cf, key, &next)?;
            match txn.commit() {
                Ok(()) => Ok(CasAttempt::Applied(next)),
                Err(e) if is_conflict(&e) => Ok(CasAttempt::Conflict),
                Err(e) => Err(e.into()),
            }
        }

        fn insert_if_absent(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<bool> {
            let cf = self.cf(space)?;
            for _ in 0..INSERT_ATTEMPTS {
                let txn = self.db.transaction();
                if txn.get_for_update_cf(cf, key, true)?.is_some() {
                    return Ok(false);
                }
                txn.put_cf(cf, key, value)?;
                match txn.commit() {
                    Ok(()) => return Ok(true),
                    // a concurrent writer touched the key; re-read decides
                    Err(e) if is_conflict(&e) => continue,
                    Err(e) => return Err(e.into()),
                }
            }
            Err(Error::TransientStorage(format!(
                "insert into {} kept conflicting",
                space
            )))
        }

        fn put(&self, space: Keyspace, key: &[u8], value: &[u8]) -> Result<()> {
            Ok(self.db.put_cf(self.cf(space)?, key, value)?)
        }

        fn remove(&self, space: Keyspace, key: &[u8]) -> Result<()> {
            Ok(self.db.delete_cf(self.cf(space)?, key)?)
        }

        fn scan_prefix(&self, space: Keyspace, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
            let iter = self
                .db
                .iterator_cf(self.cf(space)?, IteratorMode::From(prefix, Direction::Forward));

            let mut out = Vec::new();
            for item in iter {
                let (key, value) = item?;
                if !key.starts_with(prefix) {
                    break;
                }
                out.push((key.to_vec(), value.to_vec()));
            }
            Ok(out)
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_update_applies_and_declines() {
        let backend = MemoryBackend::new();

        let applied = backend
            .try_update(Keyspace::Accounts, b"u1", &mut |cur| {
                assert!(cur.is_none());
                Ok(Some(b"v1".to_vec()))
            })
            .unwrap();
        assert_eq!(applied, CasAttempt::Applied(b"v1".to_vec()));

        let declined = backend
            .try_update(Keyspace::Accounts, b"u1", &mut |_| Ok(None))
            .unwrap();
        assert_eq!(declined, CasAttempt::Declined);
        assert_eq!(backend.get(Keyspace::Accounts, b"u1").unwrap(), Some(b"v1".to_vec()));
    }

    #[test]
    fn test_try_update_detects_interleaved_write() {
        let backend = MemoryBackend::new();
        backend.put(Keyspace::Accounts, b"u1", b"v1").unwrap();

        let attempt = backend
            .try_update(Keyspace::Accounts, b"u1", &mut |_| {
                // a competing writer commits while this update is computing
                backend.put(Keyspace::Accounts, b"u1", b"v2").unwrap();
                Ok(Some(b"v3".to_vec()))
            })
            .unwrap();

        assert_eq!(attempt, CasAttempt::Conflict);
        assert_eq!(backend.get(Keyspace::Accounts, b"u1").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_insert_if_absent_once() {
        let backend = MemoryBackend::new();
        assert!(backend.insert_if_absent(Keyspace::Claims, b"k", b"1").unwrap());
        assert!(!backend.insert_if_absent(Keyspace::Claims, b"k", b"2").unwrap());
        assert_eq!(backend.get(Keyspace::Claims, b"k").unwrap(), Some(b"1".to_vec()));
    }

    #[test]
    fn test_scan_prefix_is_ordered_and_bounded() {
        let backend = MemoryBackend::new();
        backend.put(Keyspace::Transactions, b"7/b", b"2").unwrap();
        backend.put(Keyspace::Transactions, b"7/a", b"1").unwrap();
        backend.put(Keyspace::Transactions, b"77/a", b"x").unwrap();

        let scanned = backend.scan_prefix(Keyspace::Transactions, b"7/").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"7/a".as_slice(), b"7/b".as_slice()]);
    }
}
