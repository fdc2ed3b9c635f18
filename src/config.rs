use std::path::{Path, PathBuf};
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Money;

pub const POLICY_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read policy file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse policy file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("unsupported policy version {found} (expected {POLICY_VERSION})")]
    Version { found: u32 },
    #[error("invalid policy: {0}")]
    Invalid(&'static str),
}

/// When invoices are requested from the invoicing collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BillingMode {
    /// Invoice the quoted total on confirm, overtime on check-out.
    Prepaid,
    /// Invoice the final total on check-out.
    Postpaid,
}

/// Business rules that vary per operator. Every field has a default, so a
/// policy file only needs the fields it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Policy {
    pub version: u32,
    /// Minutes after planned end before a confirmed reservation is a no-show.
    pub no_show_grace_minutes: i64,
    /// Drafts older than this are expired by the sweep. `None` keeps drafts
    /// until their planned start passes.
    pub draft_ttl_minutes: Option<i64>,
    #[serde(with = "rust_decimal::serde::float")]
    pub overtime_multiplier: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub tax_percent: Decimal,
    /// Hourly requests at least this long are priced daily when cheaper.
    /// `None` disables the switch.
    #[serde(with = "rust_decimal::serde::float_option")]
    pub auto_daily_threshold_hours: Option<Decimal>,
    /// Charged per package visit; usage itself is metered by the ledger.
    #[serde(with = "rust_decimal::serde::float")]
    pub package_visit_price: Money,
    pub billing: BillingMode,
    /// Days before an entitlement ends that a reminder goes out.
    pub reminder_days: Vec<u32>,
    /// Auto-renewing entitlements ending within this many days are renewed.
    pub auto_renew_window_days: i64,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            version: POLICY_VERSION,
            no_show_grace_minutes: 30,
            draft_ttl_minutes: Some(30),
            overtime_multiplier: dec!(1.5),
            tax_percent: Decimal::ZERO,
            auto_daily_threshold_hours: Some(dec!(8)),
            package_visit_price: Decimal::ZERO,
            billing: BillingMode::Prepaid,
            reminder_days: vec![30, 15, 7, 1],
            auto_renew_window_days: 7,
        }
    }
}

impl Policy {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let policy: Policy = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != POLICY_VERSION {
            return Err(ConfigError::Version { found: self.version });
        }
        if self.no_show_grace_minutes < 0 {
            return Err(ConfigError::Invalid("no_show_grace_minutes must not be negative"));
        }
        if self.draft_ttl_minutes.is_some_and(|m| m <= 0) {
            return Err(ConfigError::Invalid("draft_ttl_minutes must be positive"));
        }
        if self.overtime_multiplier < Decimal::ZERO || self.tax_percent < Decimal::ZERO {
            return Err(ConfigError::Invalid("multipliers and percentages must not be negative"));
        }
        if self.package_visit_price < Decimal::ZERO {
            return Err(ConfigError::Invalid("package_visit_price must not be negative"));
        }
        Ok(())
    }

    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.no_show_grace_minutes)
    }
}

/// Process-level settings, read from `DESKBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
    pub policy: Policy,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        let data_dir = std::env::var("DESKBOOK_DATA_DIR").unwrap_or_else(|_| "./data".into());
        let metrics_port: Option<u16> = std::env::var("DESKBOOK_METRICS_PORT")
            .ok()
            .and_then(|s| s.parse().ok());
        let sweep_secs: u64 = std::env::var("DESKBOOK_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(60);
        let compact_threshold: u64 = std::env::var("DESKBOOK_COMPACT_THRESHOLD")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(1000);

        let mut policy = match std::env::var("DESKBOOK_POLICY_FILE") {
            Ok(path) => Policy::load(Path::new(&path))?,
            Err(_) => Policy::default(),
        };
        if let Some(grace) = std::env::var("DESKBOOK_NO_SHOW_GRACE_MINUTES")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            policy.no_show_grace_minutes = grace;
        }
        policy.validate()?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            metrics_port,
            sweep_interval: Duration::from_secs(sweep_secs.max(1)),
            compact_threshold,
            policy,
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("deskbook.wal")
    }
}
