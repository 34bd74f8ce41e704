//! Blood group and urgency enums.
//!
//! Blood group strings arrive from hospitals and donor directories in
//! inconsistent casing and spacing, so parsing normalizes before matching.

use serde::{Deserialize, Serialize};

use crate::error::BloodlineError;

/// The eight blood groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BloodGroup {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

impl BloodGroup {
    pub fn as_str(&self) -> &'static str {
        match self {
            BloodGroup::APositive => "A+",
            BloodGroup::ANegative => "A-",
            BloodGroup::BPositive => "B+",
            BloodGroup::BNegative => "B-",
            BloodGroup::AbPositive => "AB+",
            BloodGroup::AbNegative => "AB-",
            BloodGroup::OPositive => "O+",
            BloodGroup::ONegative => "O-",
        }
    }
}

impl std::fmt::Display for BloodGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for BloodGroup {
    type Err = BloodlineError;

    /// Parse a blood group, normalizing case and stripping all whitespace
    /// ("  ab+ " parses as AB+).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_uppercase();

        match normalized.as_str() {
            "A+" => Ok(BloodGroup::APositive),
            "A-" => Ok(BloodGroup::ANegative),
            "B+" => Ok(BloodGroup::BPositive),
            "B-" => Ok(BloodGroup::BNegative),
            "AB+" => Ok(BloodGroup::AbPositive),
            "AB-" => Ok(BloodGroup::AbNegative),
            "O+" => Ok(BloodGroup::OPositive),
            "O-" => Ok(BloodGroup::ONegative),
            _ => Err(BloodlineError::Validation(format!(
                "Invalid blood group: {}",
                s
            ))),
        }
    }
}

/// Urgency tier of a blood request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Pregnancy,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Low => "low",
            Urgency::Medium => "medium",
            Urgency::High => "high",
            Urgency::Pregnancy => "pregnancy",
        }
    }

    /// Message-template tier: pregnancy and high urgency share the
    /// high-priority template, everything else gets the normal one.
    pub fn priority_tier(&self) -> PriorityTier {
        match self {
            Urgency::High | Urgency::Pregnancy => PriorityTier::High,
            Urgency::Low | Urgency::Medium => PriorityTier::Normal,
        }
    }
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Urgency {
    type Err = BloodlineError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Urgency::Low),
            "medium" => Ok(Urgency::Medium),
            "high" => Ok(Urgency::High),
            "pregnancy" => Ok(Urgency::Pregnancy),
            _ => Err(BloodlineError::Validation(format!("Invalid urgency: {}", s))),
        }
    }
}

/// Which message template a dispatch uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PriorityTier {
    Normal,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_normalizes_case_and_whitespace() {
        assert_eq!("  ab+ ".parse::<BloodGroup>().unwrap(), BloodGroup::AbPositive);
        assert_eq!("o -".parse::<BloodGroup>().unwrap(), BloodGroup::ONegative);
        assert_eq!("A+".parse::<BloodGroup>().unwrap(), BloodGroup::APositive);
    }

    #[test]
    fn test_parse_rejects_unknown_group() {
        assert!("C+".parse::<BloodGroup>().is_err());
        assert!("".parse::<BloodGroup>().is_err());
    }

    #[test]
    fn test_round_trip_all_groups() {
        for group in [
            BloodGroup::APositive,
            BloodGroup::ANegative,
            BloodGroup::BPositive,
            BloodGroup::BNegative,
            BloodGroup::AbPositive,
            BloodGroup::AbNegative,
            BloodGroup::OPositive,
            BloodGroup::ONegative,
        ] {
            assert_eq!(group.as_str().parse::<BloodGroup>().unwrap(), group);
        }
    }

    #[test]
    fn test_priority_tier() {
        assert_eq!(Urgency::Pregnancy.priority_tier(), PriorityTier::High);
        assert_eq!(Urgency::High.priority_tier(), PriorityTier::High);
        assert_eq!(Urgency::Medium.priority_tier(), PriorityTier::Normal);
        assert_eq!(Urgency::Low.priority_tier(), PriorityTier::Normal);
    }
}
