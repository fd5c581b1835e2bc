use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{EngineError, EngineResult};

pub const ENV_PREFIX: &str = "ATTENDANCE_";
pub const DEFAULT_BUSINESS_TZ: &str = "Asia/Ho_Chi_Minh";

/// Engine settings. Every key is optional; anything missing takes the default below.
///
/// The three `*_overtime_rate` values are the deduction-side multipliers. Overtime pay
/// uses its own fixed multipliers (see `overtime::pay_multiplier`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub standard_working_hours: Decimal,
    pub overtime_threshold: Decimal,
    pub grace_period_minutes: Decimal,

    pub weekday_overtime_rate: Decimal,
    pub weekend_overtime_rate: Decimal,
    pub holiday_overtime_rate: Decimal,

    pub auto_confirm_deductions: bool,
    pub auto_process_deductions: bool,

    pub notify_late_arrivals: bool,
    pub notify_early_departures: bool,
    pub notify_missing_checkout: bool,

    pub business_timezone: String,
    /// How many days before today the scheduled job re-walks.
    pub reprocess_days_back: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            standard_working_hours: dec!(8.0),
            overtime_threshold: dec!(8.0),
            grace_period_minutes: dec!(15),
            weekday_overtime_rate: dec!(1.5),
            weekend_overtime_rate: dec!(2.0),
            holiday_overtime_rate: dec!(2.5),
            auto_confirm_deductions: false,
            auto_process_deductions: false,
            notify_late_arrivals: true,
            notify_early_departures: true,
            notify_missing_checkout: true,
            business_timezone: DEFAULT_BUSINESS_TZ.to_string(),
            reprocess_days_back: 1,
        }
    }
}

impl EngineConfig {
    /// Reads `ATTENDANCE_*` variables (after loading `.env` if present) and validates them.
    pub fn from_env() -> EngineResult<Self> {
        dotenv::dotenv().ok();
        let config = envy::prefixed(ENV_PREFIX).from_env::<EngineConfig>()?;
        config.validate()?;
        Ok(config)
    }

    /// Builds a config from an explicit flat key-value set, e.g. rows of a settings table.
    /// Keys are matched case-insensitively and carry no prefix.
    pub fn from_pairs<I, K, V>(pairs: I) -> EngineResult<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let config = envy::from_iter::<_, EngineConfig>(
            pairs.into_iter().map(|(k, v)| (k.into(), v.into())),
        )?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.standard_working_hours <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "Standard working hours must be greater than 0".into(),
            ));
        }
        if self.overtime_threshold <= Decimal::ZERO {
            return Err(EngineError::Validation(
                "Overtime threshold must be greater than 0".into(),
            ));
        }
        if self.grace_period_minutes < Decimal::ZERO {
            return Err(EngineError::Validation(
                "Grace period cannot be negative".into(),
            ));
        }
        for (name, rate) in [
            ("weekday", self.weekday_overtime_rate),
            ("weekend", self.weekend_overtime_rate),
            ("holiday", self.holiday_overtime_rate),
        ] {
            if rate < Decimal::ONE {
                return Err(EngineError::Validation(format!(
                    "The {} overtime rate must be at least 1.0 (got {})",
                    name, rate
                )));
            }
        }
        if self.business_timezone.parse::<Tz>().is_err() {
            return Err(EngineError::Validation(format!(
                "Unknown business time zone '{}'",
                self.business_timezone
            )));
        }
        Ok(())
    }

    pub fn business_tz(&self) -> Tz {
        self.business_timezone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                "Invalid business time zone '{}', falling back to UTC",
                self.business_timezone
            );
            Tz::UTC
        })
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    #[test]
    fn empty_key_set_yields_documented_defaults() {
        let config = EngineConfig::from_pairs(Vec::<(String, String)>::new()).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.standard_working_hours, dec!(8.0));
        assert_eq!(config.overtime_threshold, dec!(8.0));
        assert_eq!(config.grace_period_minutes, dec!(15));
        assert_eq!(config.weekday_overtime_rate, dec!(1.5));
        assert_eq!(config.weekend_overtime_rate, dec!(2.0));
        assert_eq!(config.holiday_overtime_rate, dec!(2.5));
        assert!(!config.auto_confirm_deductions);
        assert!(!config.auto_process_deductions);
        assert!(config.notify_late_arrivals);
        assert!(config.notify_early_departures);
        assert!(config.notify_missing_checkout);
    }

    #[test]
    fn partial_key_set_overrides_only_given_keys() {
        let config = EngineConfig::from_pairs(vec![
            ("GRACE_PERIOD_MINUTES", "5"),
            ("auto_confirm_deductions", "true"),
        ])
        .unwrap();
        assert_eq!(config.grace_period_minutes, dec!(5));
        assert!(config.auto_confirm_deductions);
        assert_eq!(config.weekend_overtime_rate, dec!(2.0));
    }

    #[test]
    fn negative_grace_is_rejected() {
        let err = EngineConfig::from_pairs(vec![("grace_period_minutes", "-1")]).unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn rate_below_one_is_rejected() {
        let mut config = EngineConfig::default();
        config.holiday_overtime_rate = dec!(0.9);
        assert!(matches!(config.validate(), Err(EngineError::Validation(_))));
    }

    #[test]
    fn unknown_zone_is_rejected_but_business_tz_falls_back() {
        let mut config = EngineConfig::default();
        config.business_timezone = "Mars/Olympus".into();
        assert!(config.validate().is_err());
        assert_eq!(config.business_tz(), Tz::UTC);
    }
}
