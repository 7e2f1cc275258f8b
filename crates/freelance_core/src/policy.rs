//! crates/freelance_core/src/policy.rs
//!
//! Operational knobs of the billing engine. The worker fills these from its
//! environment configuration; tests use `BillingPolicy::default()`.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

/// How tracked minutes become billable hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HourRounding {
    /// Nearest whole hour, half an hour rounds up.
    #[default]
    Nearest,
    Up,
    Down,
}

impl HourRounding {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "nearest" => Some(HourRounding::Nearest),
            "up" => Some(HourRounding::Up),
            "down" => Some(HourRounding::Down),
            _ => None,
        }
    }

    pub fn hours_from_minutes(&self, minutes: i64) -> Decimal {
        let hours = Decimal::from(minutes) / Decimal::from(60);
        let strategy = match self {
            HourRounding::Nearest => RoundingStrategy::MidpointAwayFromZero,
            HourRounding::Up => RoundingStrategy::AwayFromZero,
            HourRounding::Down => RoundingStrategy::ToZero,
        };
        hours.round_dp_with_strategy(0, strategy)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillingPolicy {
    pub hour_rounding: HourRounding,
    /// Reminders sent per invoice before the sweep stops reminding.
    pub max_reminders: u32,
    /// Consecutive auto-generation failures after which a project is skipped.
    pub max_auto_generation_failures: i32,
    pub evaluator_concurrency: usize,
    pub hour_unit: String,
}

impl Default for BillingPolicy {
    fn default() -> Self {
        Self {
            hour_rounding: HourRounding::Nearest,
            max_reminders: 3,
            max_auto_generation_failures: 5,
            evaluator_concurrency: 4,
            hour_unit: "h".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn nearest_rounds_half_hours_up() {
        let r = HourRounding::Nearest;
        assert_eq!(r.hours_from_minutes(30), dec!(1));
        assert_eq!(r.hours_from_minutes(60), dec!(1));
        assert_eq!(r.hours_from_minutes(90), dec!(2));
        assert_eq!(r.hours_from_minutes(20), dec!(0));
    }

    #[test]
    fn up_and_down_bracket_partial_hours() {
        assert_eq!(HourRounding::Up.hours_from_minutes(61), dec!(2));
        assert_eq!(HourRounding::Down.hours_from_minutes(119), dec!(1));
        assert_eq!(HourRounding::Up.hours_from_minutes(120), dec!(2));
    }

    #[test]
    fn parse_accepts_any_case() {
        assert_eq!(HourRounding::parse("UP"), Some(HourRounding::Up));
        assert_eq!(HourRounding::parse("ceil"), None);
    }
}
