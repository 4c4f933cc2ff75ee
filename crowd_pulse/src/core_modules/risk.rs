// THEORY:
// The `risk` module is the single place where a normalized density becomes a
// discrete risk level. Zones and the global score go through the exact same
// thresholds.
//
// The thresholds are strict: a value sitting exactly on a boundary belongs to
// the lower level (0.8 is `High`, not `Critical`). Every finite input in [0,1]
// maps to exactly one level, and anything that is not a number maps to `Low`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const CRITICAL_THRESHOLD: f64 = 0.8;
pub const HIGH_THRESHOLD: f64 = 0.6;
pub const MEDIUM_THRESHOLD: f64 = 0.3;

/// Discrete crowd risk, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl RiskLevel {
    /// Classifies a normalized density in [0,1].
    pub fn classify(density: f64) -> Self {
        if density > CRITICAL_THRESHOLD {
            Self::Critical
        } else if density > HIGH_THRESHOLD {
            Self::High
        } else if density > MEDIUM_THRESHOLD {
            Self::Medium
        } else {
            Self::Low
        }
    }

    /// `High` and `Critical` are the levels that open an alerting episode.
    pub fn is_elevated(self) -> bool {
        matches!(self, Self::High | Self::Critical)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskLevel {
    type Err = String;

    /// Producers disagree on casing, so labels are matched case-insensitively.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(format!("unknown risk label '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_fall_to_the_lower_level() {
        assert_eq!(RiskLevel::classify(0.8), RiskLevel::High);
        assert_eq!(RiskLevel::classify(0.6), RiskLevel::Medium);
        assert_eq!(RiskLevel::classify(0.3), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(0.800_001), RiskLevel::Critical);
    }

    #[test]
    fn every_density_maps_to_one_level() {
        let mut previous = RiskLevel::Low;
        for step in 0..=1000 {
            let level = RiskLevel::classify(step as f64 / 1000.0);
            // Monotone in density, so the sweep never goes back down.
            assert!(level >= previous);
            previous = level;
        }
        assert_eq!(RiskLevel::classify(0.0), RiskLevel::Low);
        assert_eq!(RiskLevel::classify(1.0), RiskLevel::Critical);
        assert_eq!(RiskLevel::classify(f64::NAN), RiskLevel::Low);
    }

    #[test]
    fn labels_parse_case_insensitively() {
        assert_eq!("CRITICAL".parse::<RiskLevel>(), Ok(RiskLevel::Critical));
        assert_eq!(" high ".parse::<RiskLevel>(), Ok(RiskLevel::High));
        assert!("severe".parse::<RiskLevel>().is_err());
    }

    #[test]
    fn only_high_and_critical_are_elevated() {
        assert!(!RiskLevel::Low.is_elevated());
        assert!(!RiskLevel::Medium.is_elevated());
        assert!(RiskLevel::High.is_elevated());
        assert!(RiskLevel::Critical.is_elevated());
    }
}
