//! Expiry stamping for checkpoint partitions and checkpoint records.
//!
//! The policy only computes `expire_at`; physical deletion belongs to the
//! database's own TTL mechanism or to [`crate::sweeper::TtlSweeper`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::StoreError;

pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// How a partition's expiry reacts to new checkpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpiryMode {
    /// Every put restamps the partition, so active sessions stay alive.
    #[default]
    Sliding,
    /// The partition keeps the stamp it received at creation.
    Fixed,
}

impl fmt::Display for ExpiryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExpiryMode::Sliding => f.write_str("sliding"),
            ExpiryMode::Fixed => f.write_str("fixed"),
        }
    }
}

impl FromStr for ExpiryMode {
    type Err = StoreError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sliding" => Ok(ExpiryMode::Sliding),
            "fixed" => Ok(ExpiryMode::Fixed),
            other => Err(StoreError::InvalidConfig(format!(
                "unknown expiry mode '{other}', expected 'sliding' or 'fixed'"
            ))),
        }
    }
}

/// `created_at`/`expire_at` pair carried by partitions and checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    pub created_at: DateTime<Utc>,
    pub expire_at: DateTime<Utc>,
}

impl Stamp {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expire_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlPolicy {
    ttl: TimeDelta,
    mode: ExpiryMode,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            ttl: TimeDelta::days(7),
            mode: ExpiryMode::Sliding,
        }
    }
}

impl TtlPolicy {
    pub fn new(ttl: Duration, mode: ExpiryMode) -> Result<Self, StoreError> {
        if ttl.is_zero() {
            return Err(StoreError::InvalidConfig(
                "ttl must be greater than zero".to_string(),
            ));
        }
        let ttl = TimeDelta::from_std(ttl).map_err(|_| {
            StoreError::InvalidConfig(format!("ttl {ttl:?} is out of range"))
        })?;
        Ok(Self { ttl, mode })
    }

    pub fn days(days: u32, mode: ExpiryMode) -> Result<Self, StoreError> {
        Self::new(Duration::from_secs(u64::from(days) * 24 * 60 * 60), mode)
    }

    pub fn ttl(&self) -> Duration {
        self.ttl.to_std().unwrap_or(DEFAULT_TTL)
    }

    pub fn mode(&self) -> ExpiryMode {
        self.mode
    }

    pub fn expire_at(&self, created_at: DateTime<Utc>) -> DateTime<Utc> {
        created_at
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Stamp for a record created at `now`. Checkpoint records use this once
    /// and are never restamped.
    pub fn stamp(&self, now: DateTime<Utc>) -> Stamp {
        Stamp {
            created_at: now,
            expire_at: self.expire_at(now),
        }
    }

    /// Stamp a partition receives when a checkpoint is written under it.
    pub fn partition_stamp(&self, existing: Option<Stamp>, now: DateTime<Utc>) -> Stamp {
        match (existing, self.mode) {
            (Some(existing), ExpiryMode::Fixed) => existing,
            _ => self.stamp(now),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn default_policy_is_seven_day_sliding_window() {
        let policy = TtlPolicy::default();
        assert_eq!(policy.ttl(), DEFAULT_TTL);
        assert_eq!(policy.mode(), ExpiryMode::Sliding);
        assert_eq!(
            policy.expire_at(at(0)),
            Utc.with_ymd_and_hms(2026, 3, 8, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn sliding_partition_restamps_on_every_write() {
        let policy = TtlPolicy::default();
        let first = policy.partition_stamp(None, at(1));
        let second = policy.partition_stamp(Some(first), at(5));

        assert_eq!(second.created_at, at(5));
        assert_eq!(second.expire_at, policy.expire_at(at(5)));
    }

    #[test]
    fn fixed_partition_keeps_creation_stamp() {
        let policy = TtlPolicy::days(7, ExpiryMode::Fixed).unwrap();
        let first = policy.partition_stamp(None, at(1));
        let second = policy.partition_stamp(Some(first), at(5));

        assert_eq!(second, first);
    }

    #[test]
    fn zero_ttl_is_rejected() {
        let err = TtlPolicy::new(Duration::ZERO, ExpiryMode::Sliding).unwrap_err();
        assert!(matches!(err, StoreError::InvalidConfig(_)));
    }

    #[test]
    fn expiry_mode_parses_case_insensitively() {
        assert_eq!("Fixed".parse::<ExpiryMode>().unwrap(), ExpiryMode::Fixed);
        assert_eq!(" sliding ".parse::<ExpiryMode>().unwrap(), ExpiryMode::Sliding);
        assert!("forever".parse::<ExpiryMode>().is_err());
    }

    #[test]
    fn stamp_expires_at_boundary() {
        let stamp = TtlPolicy::default().stamp(at(0));
        assert!(!stamp.is_expired(at(23)));
        assert!(stamp.is_expired(stamp.expire_at));
    }
}
