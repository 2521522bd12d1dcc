//! Typed collections over a [`Backend`]
//!
//! [`Collection::atomic_update`] is the single read-modify-write primitive
//! every balance mutation goes through:
//!
//! ```text
//! loop:
//!   read current value ──► f(value) ──► None      → no-op, return None
//!                                 └──► Some(new) → commit if unchanged
//!                                                   ├─ applied  → return new
//!                                                   └─ conflict → retry
//! ```
//!
//! Conflicts retry immediately; transient storage errors back off with
//! jitter. Both share one attempt budget, after which the caller gets
//! `Error::TransientStorage`.

use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::storage::{Backend, CasAttempt, Keyspace};
use prometheus::IntCounter;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

/// Bounded retry with exponential backoff and jitter
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Delay ceiling
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub backoff_multiplier: f64,
    /// Fraction of the delay randomized (±)
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&StorageConfig::default())
    }
}

impl RetryPolicy {
    /// Policy from storage configuration
    pub fn from_config(config: &StorageConfig) -> Self {
        Self {
            max_attempts: config.max_cas_retries.max(1),
            initial_delay: Duration::from_millis(config.initial_backoff_ms),
            max_delay: Duration::from_millis(config.max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Delay before retry number `attempt` (0-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;

        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Typed, bincode-encoded records in one keyspace
pub struct Collection<T> {
    backend: Arc<dyn Backend>,
    space: Keyspace,
    retry: RetryPolicy,
    conflicts: Option<IntCounter>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            space: self.space,
            retry: self.retry.clone(),
            conflicts: self.conflicts.clone(),
            _record: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("space", &self.space)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned + Send,
{
    /// Collection over `space`
    pub fn new(backend: Arc<dyn Backend>, space: Keyspace, retry: RetryPolicy) -> Self {
        Self {
            backend,
            space,
            retry,
            conflicts: None,
            _record: PhantomData,
        }
    }

    /// Count CAS conflicts on `counter`
    pub fn with_conflict_counter(mut self, counter: IntCounter) -> Self {
        self.conflicts = Some(counter);
        self
    }

    /// Read a record
    pub fn get(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(self.space, key.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `value` unless `key` already exists. Returns whether it was written.
    pub fn insert_if_absent(&self, key: &str, value: &T) -> Result<bool> {
        let bytes = bincode::serialize(value)?;
        self.backend.insert_if_absent(self.space, key.as_bytes(), &bytes)
    }

    /// Unconditional write
    pub fn put(&self, key: &str, value: &T) -> Result<()> {
        let bytes = bincode::serialize(value)?;
        self.backend.put(self.space, key.as_bytes(), &bytes)
    }

    /// Delete a record
    pub fn remove(&self, key: &str) -> Result<()> {
        self.backend.remove(self.space, key.as_bytes())
    }

    /// Records whose key starts with `prefix`, in key order
    pub fn scan(&self, prefix: &str) -> Result<Vec<T>> {
        self.backend
            .scan_prefix(self.space, prefix.as_bytes())?
            .into_iter()
            .map(|(_, bytes)| bincode::deserialize(&bytes).map_err(Error::from))
            .collect()
    }

    /// Apply `f` to the current record and persist the result if nobody
    /// wrote the record in between.
    ///
    /// `f` may run several times; it must be a pure function of its input
    /// apart from recording why it declined. A missing record or a `None`
    /// from `f` leaves storage untouched and returns `Ok(None)`.
    pub async fn atomic_update<F>(&self, key: &str, mut f: F) -> Result<Option<T>>
    where
        F: FnMut(T) -> Option<T> + Send,
    {
        let mut attempt = 0u32;

        loop {
            let outcome = {
                let mut update = |current: Option<&[u8]>| -> Result<Option<Vec<u8>>> {
                    let bytes = match current {
                        Some(bytes) => bytes,
                        None => return Ok(None),
                    };
                    let value: T = bincode::deserialize(bytes)?;
                    match f(value) {
                        Some(next) => Ok(Some(bincode::serialize(&next)?)),
                        None => Ok(None),
                    }
                };
                self.backend.try_update(self.space, key.as_bytes(), &mut update)
            };

            let backoff = match outcome {
                Ok(CasAttempt::Applied(bytes)) => return Ok(Some(bincode::deserialize(&bytes)?)),
                Ok(CasAttempt::Declined) => return Ok(None),
                Ok(CasAttempt::Conflict) => {
                    if let Some(counter) = &self.conflicts {
                        counter.inc();
                    }
                    tracing::debug!(space = %self.space, key, attempt, "CAS conflict, retrying");
                    None
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(space = %self.space, key, attempt, error = %e, "Transient storage error");
                    Some(self.retry.delay(attempt))
                }
                Err(e) => return Err(e),
            };

            attempt += 1;
            if attempt >= self.retry.max_attempts {
                tracing::warn!(
                    space = %self.space,
                    key,
                    attempts = attempt,
                    "Giving up on contended update"
                );
                return Err(Error::TransientStorage(format!(
                    "{} {} still contended after {} attempts",
                    self.space, key, attempt
                )));
            }

            match backoff {
                Some(delay) => tokio::time::sleep(delay).await,
                None => tokio::task::yield_now().await,
            }
        }
    }
}
