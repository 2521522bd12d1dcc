//! Reward tunables
//!
//! Settings are persisted as a sparse patch; readers always get a full
//! snapshot with defaults filled in. Snapshots are cached for a short TTL.
//! An admin update replaces the cached snapshot immediately, so staleness
//! only applies across processes sharing one store.

use crate::error::Result;
use crate::store::Collection;
use parking_lot::RwLock;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const SETTINGS_KEY: &str = "current";

/// Full settings snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reward per ad view
    pub ad_reward_trx: Decimal,
    /// Signup bonus paid to the referrer
    pub referral_reward_trx: Decimal,
    /// Referrer's cut of ad and task rewards, in percent
    pub referral_commission_pct: Decimal,
    /// Minimum interval between ad rewards
    pub ad_cooldown_sec: u64,
    /// Smallest accepted withdrawal
    pub min_withdrawal_trx: Decimal,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ad_reward_trx: Decimal::new(5, 3),
            referral_reward_trx: Decimal::new(5, 2),
            referral_commission_pct: Decimal::from(5),
            ad_cooldown_sec: 30,
            min_withdrawal_trx: Decimal::new(5, 1),
        }
    }
}

impl Settings {
    /// Commission owed on `reward`, rounded to 6 decimals
    pub fn commission_on(&self, reward: Decimal) -> Decimal {
        (reward * self.referral_commission_pct / Decimal::ONE_HUNDRED).round_dp_with_strategy(
            crate::types::AMOUNT_SCALE,
            RoundingStrategy::MidpointAwayFromZero,
        )
    }

    /// Ad cooldown as a chrono duration
    pub fn ad_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.ad_cooldown_sec.min(i64::MAX as u64) as i64)
    }
}

/// Sparse admin update; unset fields keep their stored value
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettingsPatch {
    /// Reward per ad view
    pub ad_reward_trx: Option<Decimal>,
    /// Signup bonus
    pub referral_reward_trx: Option<Decimal>,
    /// Commission percent
    pub referral_commission_pct: Option<Decimal>,
    /// Ad cooldown seconds
    pub ad_cooldown_sec: Option<u64>,
    /// Minimum withdrawal
    pub min_withdrawal_trx: Option<Decimal>,
}

impl SettingsPatch {
    /// Overlay `other` on top of `self`
    pub fn merge(&mut self, other: &SettingsPatch) {
        if other.ad_reward_trx.is_some() {
            self.ad_reward_trx = other.ad_reward_trx;
        }
        if other.referral_reward_trx.is_some() {
            self.referral_reward_trx = other.referral_reward_trx;
        }
        if other.referral_commission_pct.is_some() {
            self.referral_commission_pct = other.referral_commission_pct;
        }
        if other.ad_cooldown_sec.is_some() {
            self.ad_cooldown_sec = other.ad_cooldown_sec;
        }
        if other.min_withdrawal_trx.is_some() {
            self.min_withdrawal_trx = other.min_withdrawal_trx;
        }
    }

    /// Snapshot with defaults for unset fields
    pub fn resolve(&self) -> Settings {
        let defaults = Settings::default();
        Settings {
            ad_reward_trx: self.ad_reward_trx.unwrap_or(defaults.ad_reward_trx),
            referral_reward_trx: self.referral_reward_trx.unwrap_or(defaults.referral_reward_trx),
            referral_commission_pct: self
                .referral_commission_pct
                .unwrap_or(defaults.referral_commission_pct),
            ad_cooldown_sec: self.ad_cooldown_sec.unwrap_or(defaults.ad_cooldown_sec),
            min_withdrawal_trx: self.min_withdrawal_trx.unwrap_or(defaults.min_withdrawal_trx),
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let amounts = [
            ("ad_reward_trx", self.ad_reward_trx),
            ("referral_reward_trx", self.referral_reward_trx),
            ("referral_commission_pct", self.referral_commission_pct),
            ("min_withdrawal_trx", self.min_withdrawal_trx),
        ];
        for (name, value) in amounts {
            if matches!(value, Some(v) if v.is_sign_negative()) {
                return Err(format!("{} must not be negative", name));
            }
        }
        if matches!(self.referral_commission_pct, Some(pct) if pct > Decimal::ONE_HUNDRED) {
            return Err("referral_commission_pct must not exceed 100".to_string());
        }
        Ok(())
    }
}

struct Cached {
    settings: Settings,
    loaded_at: Instant,
}

/// Read-through settings cache
pub struct SettingsProvider {
    store: Collection<SettingsPatch>,
    ttl: Duration,
    cache: RwLock<Option<Cached>>,
}

impl std::fmt::Debug for SettingsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettingsProvider").field("ttl", &self.ttl).finish()
    }
}

impl SettingsProvider {
    /// Provider caching snapshots for `ttl` (zero disables caching)
    pub fn new(store: Collection<SettingsPatch>, ttl: Duration) -> Self {
        Self {
            store,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current snapshot with defaults applied
    pub fn current_settings(&self) -> Result<Settings> {
        if let Some(cached) = self.cache.read().as_ref() {
            if cached.loaded_at.elapsed() < self.ttl {
                return Ok(cached.settings.clone());
            }
        }

        self.refresh()
    }

    /// Reload the snapshot into the cache.
    ///
    /// The store is read while the cache lock is held, so the last refresh
    /// to finish always caches the latest stored settings.
    fn refresh(&self) -> Result<Settings> {
        let mut cache = self.cache.write();
        let settings = self.store.get(SETTINGS_KEY)?.unwrap_or_default().resolve();
        *cache = Some(Cached {
            settings: settings.clone(),
            loaded_at: Instant::now(),
        });
        Ok(settings)
    }

    /// Merge `patch` into the stored settings. Takes effect for every
    /// operation that starts afterwards.
    pub async fn update(&self, patch: &SettingsPatch) -> Result<Settings> {
        patch.validate().map_err(crate::Error::Config)?;

        // Seed so the CAS below has a record to update
        self.store.insert_if_absent(SETTINGS_KEY, &SettingsPatch::default())?;
        let stored = self
            .store
            .atomic_update(SETTINGS_KEY, |mut current| {
                current.merge(patch);
                Some(current)
            })
            .await?
            .unwrap_or_default();

        let settings = stored.resolve();
        if let Err(e) = self.refresh() {
            tracing::warn!(error = %e, "Settings cache not refreshed");
            self.invalidate();
        }

        tracing::info!(?settings, "Settings updated");
        Ok(settings)
    }

    /// Drop the cached snapshot
    pub fn invalidate(&self) {
        *self.cache.write() = None;
    }
}
