use chrono::{DateTime, Datelike, NaiveDate, Utc, Weekday};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashSet;
use tracing::{debug, info};

use crate::classify::{overtime_boundary, MIN_WEEKDAY_OT_SECONDS, REST_DAY_OT_CAP_SECONDS};
use crate::error::{EngineError, EngineResult};
use crate::model::*;
use crate::schedule::standard_hours;
use crate::store::LedgerState;

/// 22 working days of 8 hours.
pub const STANDARD_MONTHLY_HOURS: Decimal = dec!(176);
/// Hourly rate used when the employee has no active contract.
pub const FALLBACK_HOURLY_RATE: Decimal = dec!(50);

// --- Holidays ---

/// Injected holiday predicate.
pub trait HolidayCalendar: Send + Sync {
    fn is_holiday(&self, employee_id: &str, date: NaiveDate) -> bool;
}

impl<F> HolidayCalendar for F
where
    F: Fn(&str, NaiveDate) -> bool + Send + Sync,
{
    fn is_holiday(&self, employee_id: &str, date: NaiveDate) -> bool {
        self(employee_id, date)
    }
}

/// Company-wide holiday dates.
#[derive(Debug, Clone, Default)]
pub struct HolidaySet {
    dates: HashSet<NaiveDate>,
}

impl HolidaySet {
    pub fn insert(&mut self, date: NaiveDate) -> bool {
        self.dates.insert(date)
    }
}

impl HolidayCalendar for HolidaySet {
    fn is_holiday(&self, _employee_id: &str, date: NaiveDate) -> bool {
        self.dates.contains(&date)
    }
}

pub fn day_category(
    holidays: &dyn HolidayCalendar,
    employee_id: &str,
    date: NaiveDate,
) -> OvertimeCategory {
    if holidays.is_holiday(employee_id, date) {
        OvertimeCategory::Holiday
    } else if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        OvertimeCategory::Weekend
    } else {
        OvertimeCategory::Weekday
    }
}

// --- Day Computation ---

fn checked_in_on(record: &AttendanceRecord, date: NaiveDate, tz: Tz) -> bool {
    record.check_in_local_date(tz) == Some(date)
}

/// Raw overtime seconds for one employee-day.
pub fn day_ot_seconds(
    category: OvertimeCategory,
    date: NaiveDate,
    tz: Tz,
    records: &[&AttendanceRecord],
) -> i64 {
    if category.is_rest_day() {
        let total: i64 = records
            .iter()
            .filter(|r| checked_in_on(r, date, tz))
            .map(|r| r.worked_seconds())
            .sum();
        return total.min(REST_DAY_OT_CAP_SECONDS);
    }

    let latest_out: Option<DateTime<Utc>> = records
        .iter()
        .filter_map(|r| r.check_out)
        .filter(|out| out.with_timezone(&tz).date_naive() == date)
        .max();
    match (latest_out, overtime_boundary(date, tz)) {
        (Some(out), Some(boundary)) if out > boundary => {
            let delta = (out - boundary).num_seconds();
            if delta >= MIN_WEEKDAY_OT_SECONDS {
                delta
            } else {
                0
            }
        }
        _ => 0,
    }
}

pub fn day_worked_hours(date: NaiveDate, tz: Tz, records: &[&AttendanceRecord]) -> Decimal {
    let seconds: i64 = records
        .iter()
        .filter(|r| checked_in_on(r, date, tz))
        .map(|r| r.worked_seconds())
        .sum();
    seconds_to_hours(seconds)
}

pub fn hourly_rate(employee: &Employee, date: NaiveDate) -> Decimal {
    employee
        .active_contract(date)
        .map(|contract| contract.wage / STANDARD_MONTHLY_HOURS)
        .unwrap_or(FALLBACK_HOURLY_RATE)
}

/// Pay multipliers. These are fixed and are not the configurable deduction-side rates.
pub fn pay_multiplier(category: OvertimeCategory) -> Decimal {
    match category {
        OvertimeCategory::Weekday => dec!(1.5),
        OvertimeCategory::Weekend => dec!(2.0),
        OvertimeCategory::Holiday => dec!(3.0),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayOvertime {
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub category: OvertimeCategory,
    pub ot_seconds: i64,
    pub worked_hours: Decimal,
    pub standard_hours: Decimal,
    pub amount: Decimal,
}

impl DayOvertime {
    pub fn overtime_hours(&self) -> Decimal {
        seconds_to_hours(self.ot_seconds)
    }

    fn write_into(&self, record: &mut OvertimeRecord) {
        let hours = self.overtime_hours();
        record.category = self.category;
        record.ot_seconds = self.ot_seconds;
        record.worked_hours = self.worked_hours;
        record.standard_hours = self.standard_hours;
        record.weekday_overtime = bucket(self.category, OvertimeCategory::Weekday, hours);
        record.weekend_overtime = bucket(self.category, OvertimeCategory::Weekend, hours);
        record.holiday_overtime = bucket(self.category, OvertimeCategory::Holiday, hours);
        record.amount = self.amount;
    }
}

fn bucket(actual: OvertimeCategory, wanted: OvertimeCategory, hours: Decimal) -> Decimal {
    if actual == wanted {
        hours
    } else {
        Decimal::ZERO
    }
}

/// Overtime entitlement for one employee-day, or `None` when the day does not qualify.
pub fn compute_overtime(
    employee: &Employee,
    date: NaiveDate,
    tz: Tz,
    category: OvertimeCategory,
    records: &[&AttendanceRecord],
    fallback_standard_hours: Decimal,
) -> Option<DayOvertime> {
    let ot_seconds = day_ot_seconds(category, date, tz, records);
    let qualifies = if category.is_rest_day() {
        ot_seconds > 0
    } else {
        ot_seconds >= MIN_WEEKDAY_OT_SECONDS
    };
    if !qualifies {
        return None;
    }

    let hours = seconds_to_hours(ot_seconds);
    let amount = (hours * hourly_rate(employee, date) * pay_multiplier(category)).round_dp(2);
    Some(DayOvertime {
        employee_id: employee.id.clone(),
        date,
        category,
        ot_seconds,
        worked_hours: day_worked_hours(date, tz, records).round_dp(4),
        standard_hours: standard_hours(employee, date, fallback_standard_hours),
        amount,
    })
}

/// Recomputes the overtime record for `employee` on `date` and relinks that day's
/// attendance records.
///
/// Only draft records are created, updated or deleted here. Anything already submitted
/// keeps its figures; only the attendance links follow the recomputation.
pub fn recompute_day(
    state: &mut LedgerState,
    employee: &Employee,
    date: NaiveDate,
    tz: Tz,
    category: OvertimeCategory,
    fallback_standard_hours: Decimal,
) -> EngineResult<Option<OvertimeId>> {
    let day_ids: Vec<AttendanceId> = state
        .attendances_of(&employee.id)
        .filter(|r| checked_in_on(r, date, tz))
        .map(|r| r.id)
        .collect();
    let computed = {
        let records: Vec<&AttendanceRecord> = day_ids
            .iter()
            .filter_map(|id| state.attendance(*id).ok())
            .collect();
        compute_overtime(employee, date, tz, category, &records, fallback_standard_hours)
    };
    let existing = state
        .overtime_for_day(&employee.id, date)
        .map(|o| (o.id, o.state));

    let linked_id = match (computed, existing) {
        (None, existing) => {
            if let Some((id, OvertimeState::Draft)) = existing {
                state.remove_overtime(id);
                info!(
                    "Overtime removed below threshold: Emp={}, Date={}, Id={}",
                    employee.id, date, id
                );
            } else if let Some((id, ot_state)) = existing {
                debug!(
                    "Overtime below threshold left as {}: Emp={}, Date={}, Id={}",
                    ot_state, employee.id, date, id
                );
            }
            None
        }
        (Some(day), Some((id, OvertimeState::Draft))) => {
            let record = state.overtime_mut(id)?;
            day.write_into(record);
            record.attendance_ids = day_ids.clone();
            info!(
                "Overtime recalculated: Emp={}, Date={}, OT={}, Hours={}",
                employee.id,
                date,
                record.ot_str(),
                record.overtime_hours()
            );
            Some(id)
        }
        (Some(_), Some((id, ot_state))) => {
            debug!(
                "Overtime {} is {}, figures kept: Emp={}, Date={}",
                id, ot_state, employee.id, date
            );
            Some(id)
        }
        (Some(day), None) => {
            let mut record = OvertimeRecord {
                id: 0,
                employee_id: employee.id.clone(),
                date,
                attendance_ids: day_ids.clone(),
                worked_hours: Decimal::ZERO,
                standard_hours: Decimal::ZERO,
                ot_seconds: 0,
                category,
                weekday_overtime: Decimal::ZERO,
                weekend_overtime: Decimal::ZERO,
                holiday_overtime: Decimal::ZERO,
                amount: Decimal::ZERO,
                state: OvertimeState::Draft,
                approved_by: None,
                approved_at: None,
                rejection_reason: None,
            };
            day.write_into(&mut record);
            let id = state.insert_overtime(record)?;
            info!(
                "Overtime created: Emp={}, Date={}, Id={}, Hours={}",
                employee.id,
                date,
                id,
                day.overtime_hours()
            );
            Some(id)
        }
    };

    // Back-links: the day's records point at the result, nothing else points at a
    // record of this day any more.
    let stale_target = existing.map(|(id, _)| id);
    let relink: Vec<AttendanceId> = state
        .attendances_of(&employee.id)
        .filter(|r| day_ids.contains(&r.id) || (stale_target.is_some() && r.overtime_id == stale_target))
        .map(|r| r.id)
        .collect();
    for id in relink {
        let record = state.attendance_mut(id)?;
        record.overtime_id = if day_ids.contains(&id) { linked_id } else { None };
    }

    Ok(linked_id)
}

// --- State Transitions ---

impl OvertimeRecord {
    fn require(&self, action: &'static str, allowed: &[OvertimeState]) -> EngineResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            let required = allowed
                .iter()
                .map(OvertimeState::as_str)
                .collect::<Vec<_>>()
                .join(" or ");
            Err(EngineError::invalid_state(action, required, self.state))
        }
    }

    pub fn submit(&mut self) -> EngineResult<()> {
        self.require("submit overtime", &[OvertimeState::Draft])?;
        self.state = OvertimeState::Submitted;
        Ok(())
    }

    pub fn approve(&mut self, approver: &str, at: DateTime<Utc>) -> EngineResult<()> {
        self.require("approve overtime", &[OvertimeState::Submitted])?;
        self.state = OvertimeState::Approved;
        self.approved_by = Some(approver.to_string());
        self.approved_at = Some(at);
        Ok(())
    }

    pub fn reject(&mut self, reason: &str) -> EngineResult<()> {
        self.require("reject overtime", &[OvertimeState::Submitted])?;
        if reason.trim().is_empty() {
            return Err(EngineError::Validation(
                "A rejection reason is required".into(),
            ));
        }
        self.state = OvertimeState::Rejected;
        self.rejection_reason = Some(reason.to_string());
        Ok(())
    }

    pub fn mark_paid(&mut self) -> EngineResult<()> {
        self.require("mark overtime paid", &[OvertimeState::Approved])?;
        self.state = OvertimeState::Paid;
        Ok(())
    }

    pub fn reset_to_draft(&mut self) -> EngineResult<()> {
        self.require(
            "reset overtime",
            &[OvertimeState::Submitted, OvertimeState::Rejected],
        )?;
        self.state = OvertimeState::Draft;
        self.approved_by = None;
        self.approved_at = None;
        self.rejection_reason = None;
        Ok(())
    }
}
