//! Attendance status classification.
//!
//! Statuses are evaluated in a fixed precedence order and the first match wins:
//! missing punches, then overtime, then late/early against the schedule.
//! Grace only ever applies to the check-in side.

use chrono::{DateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;

use crate::model::{AttendanceRecord, AttendanceStatus, OvertimeCategory};
use crate::schedule::{local_instant, ScheduleWindow};

/// Weekday overtime starts at this local time.
pub const OVERTIME_START: (u32, u32) = (18, 0);
/// Weekday overtime shorter than this is ignored.
pub const MIN_WEEKDAY_OT_SECONDS: i64 = 1800;
/// Rest-day overtime is capped at four hours a day.
pub const REST_DAY_OT_CAP_SECONDS: i64 = 14_400;
/// On weekdays a session longer than this counts as overtime even before 18:00.
pub const LONG_DAY_HOURS: Decimal = dec!(9.5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OvertimeContext {
    pub category: OvertimeCategory,
    pub daily_ot_seconds: i64,
    pub worked_seconds: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Classification {
    pub status: AttendanceStatus,
    /// Raw check-in delay in minutes, 0 when on time or early.
    pub late_minutes: Decimal,
    /// Raw check-out shortfall in minutes, 0 when on time or later.
    pub early_minutes: Decimal,
}

pub fn late_minutes(check_in: Option<DateTime<Utc>>, schedule: Option<&ScheduleWindow>) -> Decimal {
    match (check_in, schedule) {
        (Some(check_in), Some(window)) => {
            minutes_between(window.scheduled_in, check_in).max(Decimal::ZERO)
        }
        _ => Decimal::ZERO,
    }
}

pub fn early_minutes(check_out: Option<DateTime<Utc>>, schedule: Option<&ScheduleWindow>) -> Decimal {
    match (check_out, schedule) {
        (Some(check_out), Some(window)) => {
            minutes_between(check_out, window.scheduled_out).max(Decimal::ZERO)
        }
        _ => Decimal::ZERO,
    }
}

fn minutes_between(from: DateTime<Utc>, to: DateTime<Utc>) -> Decimal {
    (Decimal::from((to - from).num_seconds()) / dec!(60)).round_dp(2)
}

/// Late minutes that survive the grace period.
pub fn chargeable_late_minutes(late_minutes: Decimal, grace_period_minutes: Decimal) -> Decimal {
    (late_minutes - grace_period_minutes).max(Decimal::ZERO)
}

fn is_overtime(ctx: &OvertimeContext) -> bool {
    if ctx.category.is_rest_day() {
        ctx.worked_seconds > 0 || ctx.daily_ot_seconds > 0
    } else {
        ctx.daily_ot_seconds >= MIN_WEEKDAY_OT_SECONDS
            || Decimal::from(ctx.worked_seconds) / dec!(3600) > LONG_DAY_HOURS
    }
}

pub fn classify(
    record: &AttendanceRecord,
    schedule: Option<&ScheduleWindow>,
    ctx: &OvertimeContext,
    grace_period_minutes: Decimal,
) -> Classification {
    let late = late_minutes(record.check_in, schedule);
    let early = early_minutes(record.check_out, schedule);
    let is_late = schedule.is_some() && late > grace_period_minutes;
    let is_early = schedule.is_some() && early > Decimal::ZERO;

    let status = match (record.check_in, record.check_out) {
        (None, None) => AttendanceStatus::MissingIn,
        (None, Some(_)) if is_early => AttendanceStatus::EarlyMissingIn,
        (None, Some(_)) => AttendanceStatus::MissingIn,
        (Some(_), None) if is_late => AttendanceStatus::LateMissingOut,
        (Some(_), None) => AttendanceStatus::MissingOut,
        (Some(_), Some(_)) if is_overtime(ctx) => AttendanceStatus::Overtime,
        (Some(_), Some(_)) => match (is_late, is_early) {
            (true, true) => AttendanceStatus::BothIssues,
            (true, false) => AttendanceStatus::LateIn,
            (false, true) => AttendanceStatus::EarlyOut,
            (false, false) => AttendanceStatus::Normal,
        },
    };

    Classification {
        status,
        late_minutes: late,
        early_minutes: early,
    }
}

/// Overtime seconds attributable to a single record.
///
/// Weekdays count from 18:00 on the local check-in day, and only once at least 30
/// minutes have accrued. Rest days count the whole session, capped at four hours.
pub fn record_ot_seconds(record: &AttendanceRecord, category: OvertimeCategory, tz: Tz) -> i64 {
    let (Some(check_in), Some(check_out)) = (record.check_in, record.check_out) else {
        return 0;
    };
    if category.is_rest_day() {
        return record.worked_seconds().min(REST_DAY_OT_CAP_SECONDS);
    }
    let local_day = check_in.with_timezone(&tz).date_naive();
    let Some(boundary) = overtime_boundary(local_day, tz) else {
        return 0;
    };
    let delta = (check_out - boundary).num_seconds();
    if delta >= MIN_WEEKDAY_OT_SECONDS {
        delta
    } else {
        0
    }
}

pub fn overtime_boundary(date: chrono::NaiveDate, tz: Tz) -> Option<DateTime<Utc>> {
    let time = NaiveTime::from_hms_opt(OVERTIME_START.0, OVERTIME_START.1, 0)?;
    local_instant(date, time, tz)
}
