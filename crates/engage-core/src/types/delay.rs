//! Delay units for workflow delay nodes and follow-up rules.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::error::EngageError;

const MINUTE_MS: u64 = 60 * 1000;

/// Longest delay a workflow node or follow-up rule may carry (10 years).
pub const MAX_DELAY_MS: u64 = 3650 * 24 * 60 * MINUTE_MS;

/// Unit of a delay amount. Unknown units are rejected on deserialization,
/// so a stored definition never carries an ambiguous unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
    /// Calendar-agnostic month of 30 days.
    Months,
}

impl DelayUnit {
    /// Milliseconds per unit.
    pub fn millis(&self) -> u64 {
        match self {
            DelayUnit::Minutes => MINUTE_MS,
            DelayUnit::Hours => 60 * MINUTE_MS,
            DelayUnit::Days => 24 * 60 * MINUTE_MS,
            DelayUnit::Weeks => 7 * 24 * 60 * MINUTE_MS,
            DelayUnit::Months => 30 * 24 * 60 * MINUTE_MS,
        }
    }

    /// `amount × unit` as a duration (saturating).
    pub fn duration(&self, amount: u64) -> Duration {
        Duration::from_millis(amount.saturating_mul(self.millis()))
    }

    /// `amount × unit`, or `None` when it exceeds [`MAX_DELAY_MS`].
    pub fn checked_duration(&self, amount: u64) -> Option<Duration> {
        amount
            .checked_mul(self.millis())
            .filter(|ms| *ms <= MAX_DELAY_MS)
            .map(Duration::from_millis)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DelayUnit::Minutes => "minutes",
            DelayUnit::Hours => "hours",
            DelayUnit::Days => "days",
            DelayUnit::Weeks => "weeks",
            DelayUnit::Months => "months",
        }
    }
}

impl FromStr for DelayUnit {
    type Err = EngageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "minutes" => Ok(DelayUnit::Minutes),
            "hours" => Ok(DelayUnit::Hours),
            "days" => Ok(DelayUnit::Days),
            "weeks" => Ok(DelayUnit::Weeks),
            "months" => Ok(DelayUnit::Months),
            other => Err(EngageError::InvalidDefinition(format!(
                "unknown delay unit '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for DelayUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_factors() {
        assert_eq!(DelayUnit::Minutes.duration(5), Duration::from_millis(300_000));
        assert_eq!(DelayUnit::Hours.duration(2), Duration::from_millis(7_200_000));
        assert_eq!(DelayUnit::Days.duration(1), Duration::from_millis(86_400_000));
        assert_eq!(DelayUnit::Weeks.duration(1), Duration::from_secs(7 * 86_400));
    }

    #[test]
    fn test_checked_duration_bounds() {
        assert_eq!(DelayUnit::Days.checked_duration(3650), Some(Duration::from_secs(3650 * 86_400)));
        assert_eq!(DelayUnit::Days.checked_duration(3651), None);
        assert_eq!(DelayUnit::Months.checked_duration(u64::MAX), None);
        assert_eq!(DelayUnit::Minutes.checked_duration(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_unknown_unit_rejected() {
        assert!("seconds".parse::<DelayUnit>().is_err());
        let parsed: Result<DelayUnit, _> = serde_json::from_str("\"fortnights\"");
        assert!(parsed.is_err());
        assert_eq!("hours".parse::<DelayUnit>().unwrap(), DelayUnit::Hours);
    }
}
