use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, info, warn};

use crate::error::{EngineError, EngineResult};
use crate::model::{Employee, EmployeeId};

// --- Weekly Calendar ---

/// One `[start, end)` working interval on a weekday, in the employee's local time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkInterval {
    pub weekday: Weekday,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl WorkInterval {
    pub fn minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

/// Weekday -> intervals. A weekday without intervals is a day off.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyCalendar {
    pub intervals: Vec<WorkInterval>,
}

impl WeeklyCalendar {
    /// Same hours Monday to Friday, split by a lunch break.
    pub fn office_hours(
        morning: (NaiveTime, NaiveTime),
        afternoon: (NaiveTime, NaiveTime),
    ) -> Self {
        let intervals = [
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
        ]
        .into_iter()
        .flat_map(|weekday| {
            [
                WorkInterval {
                    weekday,
                    start: morning.0,
                    end: morning.1,
                },
                WorkInterval {
                    weekday,
                    start: afternoon.0,
                    end: afternoon.1,
                },
            ]
        })
        .collect();
        Self { intervals }
    }

    pub fn for_weekday(&self, weekday: Weekday) -> impl Iterator<Item = &WorkInterval> {
        self.intervals.iter().filter(move |i| i.weekday == weekday)
    }

    pub fn scheduled_minutes(&self, weekday: Weekday) -> i64 {
        self.for_weekday(weekday).map(WorkInterval::minutes).sum()
    }

    pub fn validate(&self) -> EngineResult<()> {
        match self.intervals.iter().find(|i| i.end <= i.start) {
            Some(bad) => Err(EngineError::Validation(format!(
                "Work interval on {} ends ({}) before it starts ({})",
                bad.weekday, bad.end, bad.start
            ))),
            None => Ok(()),
        }
    }
}

// --- Time Zones ---

/// Picks the first zone name present in the chain employee -> acting user -> business default.
/// An unparsable name falls back to UTC.
pub fn resolve_tz(employee_tz: Option<&str>, acting_user_tz: Option<&str>, business_tz: &str) -> Tz {
    let name = [employee_tz, acting_user_tz]
        .into_iter()
        .flatten()
        .find(|name| !name.trim().is_empty())
        .unwrap_or(business_tz);
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!("Invalid time zone '{}', falling back to UTC", name);
            Tz::UTC
        }
    }
}

/// Local wall-clock time on `date` as an instant. A time that falls into a DST gap
/// is pushed forward by an hour.
pub fn local_instant(date: NaiveDate, time: NaiveTime, tz: Tz) -> Option<DateTime<Utc>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
}

// --- Schedule Resolution ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScheduleWindow {
    pub scheduled_in: DateTime<Utc>,
    pub scheduled_out: DateTime<Utc>,
    /// Sum of the interval lengths, not the envelope.
    pub scheduled_minutes: i64,
}

impl ScheduleWindow {
    pub fn scheduled_hours(&self) -> Decimal {
        Decimal::from(self.scheduled_minutes) / dec!(60)
    }
}

/// Expected window for `employee` on the local `date`, or `None` for a day off.
pub fn resolve_schedule(employee: &Employee, date: NaiveDate, tz: Tz) -> Option<ScheduleWindow> {
    let calendar = employee.calendar.as_ref()?;
    let weekday = date.weekday();
    let start = calendar.for_weekday(weekday).map(|i| i.start).min()?;
    let end = calendar.for_weekday(weekday).map(|i| i.end).max()?;
    Some(ScheduleWindow {
        scheduled_in: local_instant(date, start, tz)?,
        scheduled_out: local_instant(date, end, tz)?,
        scheduled_minutes: calendar.scheduled_minutes(weekday),
    })
}

/// Planned hours for the overtime record: calendar hours for the weekday, else
/// `fallback_hours` on weekdays and nothing on weekends.
pub fn standard_hours(employee: &Employee, date: NaiveDate, fallback_hours: Decimal) -> Decimal {
    let weekday = date.weekday();
    let fallback = if matches!(weekday, Weekday::Sat | Weekday::Sun) {
        Decimal::ZERO
    } else {
        fallback_hours
    };
    match &employee.calendar {
        Some(calendar) => {
            let minutes = calendar.scheduled_minutes(weekday);
            if minutes > 0 {
                Decimal::from(minutes) / dec!(60)
            } else {
                fallback
            }
        }
        None => fallback,
    }
}

// --- Schedule Cache ---

type CacheKey = (EmployeeId, NaiveDate);

/// Memoizes `resolve_schedule` per (employee, date). Must be invalidated when an
/// employee's calendar or zone changes.
#[derive(Clone, Default)]
pub struct ScheduleCache {
    cache: Arc<Mutex<HashMap<CacheKey, Option<ScheduleWindow>>>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_resolve(
        &self,
        employee: &Employee,
        date: NaiveDate,
        tz: Tz,
    ) -> Option<ScheduleWindow> {
        let key: CacheKey = (employee.id.clone(), date);
        {
            let cache_guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(cached) = cache_guard.get(&key) {
                debug!("Schedule cache HIT: Emp={}, Date={}", employee.id, date);
                return cached.clone();
            }
        }

        debug!("Schedule cache MISS: Emp={}, Date={}. Resolving...", employee.id, date);
        let resolved = resolve_schedule(employee, date, tz);

        let mut cache_guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        cache_guard.entry(key).or_insert(resolved).clone()
    }

    pub fn invalidate_employee(&self, employee_id: &str) {
        let mut cache_guard = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        let before = cache_guard.len();
        cache_guard.retain(|(emp, _), _| emp != employee_id);
        if cache_guard.len() != before {
            info!(
                "Schedule cache INVALIDATED: Emp={}, Entries={}",
                employee_id,
                before - cache_guard.len()
            );
        }
    }

    pub fn len(&self) -> usize {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod schedule_tests {
    use super::*;
    use chrono::Timelike;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d").unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn office_employee() -> Employee {
        let mut emp = Employee::new("E1", "Emp Office");
        emp.tz = Some("Asia/Ho_Chi_Minh".into());
        emp.calendar = Some(WeeklyCalendar::office_hours((t(8, 0), t(12, 0)), (t(13, 0), t(17, 0))));
        emp
    }

    #[test]
    fn window_spans_first_start_to_last_end_in_local_time() {
        let emp = office_employee();
        let tz = resolve_tz(emp.tz.as_deref(), None, "UTC");
        // 2024-03-04 is a Monday; 08:00 +07 is 01:00 UTC.
        let window = resolve_schedule(&emp, d("2024-03-04"), tz).unwrap();
        assert_eq!(window.scheduled_in.hour(), 1);
        assert_eq!(window.scheduled_out.hour(), 10);
        assert_eq!(window.scheduled_minutes, 480);
        assert_eq!(window.scheduled_hours(), dec!(8));
    }

    #[test]
    fn day_off_and_missing_calendar_have_no_window() {
        let emp = office_employee();
        assert!(resolve_schedule(&emp, d("2024-03-09"), Tz::UTC).is_none());
        let bare = Employee::new("E2", "No Calendar");
        assert!(resolve_schedule(&bare, d("2024-03-04"), Tz::UTC).is_none());
    }

    #[test]
    fn tz_chain_prefers_employee_then_user_then_business() {
        assert_eq!(resolve_tz(Some("Europe/Stockholm"), Some("UTC"), "Asia/Ho_Chi_Minh"), Tz::Europe__Stockholm);
        assert_eq!(resolve_tz(None, Some("UTC"), "Asia/Ho_Chi_Minh"), Tz::UTC);
        assert_eq!(resolve_tz(None, None, "Asia/Ho_Chi_Minh"), Tz::Asia__Ho_Chi_Minh);
        assert_eq!(resolve_tz(Some("Not/AZone"), None, "Asia/Ho_Chi_Minh"), Tz::UTC);
    }

    #[test]
    fn standard_hours_falls_back_by_weekday() {
        let emp = office_employee();
        assert_eq!(standard_hours(&emp, d("2024-03-04"), dec!(8)), dec!(8));
        let bare = Employee::new("E2", "No Calendar");
        assert_eq!(standard_hours(&bare, d("2024-03-04"), dec!(7.5)), dec!(7.5));
        assert_eq!(standard_hours(&bare, d("2024-03-09"), dec!(7.5)), Decimal::ZERO);
    }

    #[test]
    fn cache_is_filled_once_and_invalidated_per_employee() {
        let cache = ScheduleCache::new();
        let emp = office_employee();
        let first = cache.get_or_resolve(&emp, d("2024-03-04"), Tz::UTC);
        let second = cache.get_or_resolve(&emp, d("2024-03-04"), Tz::UTC);
        assert_eq!(first, second);
        cache.get_or_resolve(&emp, d("2024-03-09"), Tz::UTC);
        assert_eq!(cache.len(), 2);
        cache.invalidate_employee("E1");
        assert!(cache.is_empty());
    }

    #[test]
    fn inverted_interval_fails_validation() {
        let calendar = WeeklyCalendar {
            intervals: vec![WorkInterval {
                weekday: Weekday::Mon,
                start: t(17, 0),
                end: t(8, 0),
            }],
        };
        assert!(calendar.validate().is_err());
    }
}
