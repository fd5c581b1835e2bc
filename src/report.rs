use chrono::{DateTime, Datelike, Days, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, HashSet},
    str::FromStr,
};

use crate::model::*;
use crate::store::LedgerState;

pub const NO_DEPARTMENT: &str = "No Department";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupBy {
    #[default]
    Employee,
    Department,
    Month,
    Week,
}

impl FromStr for GroupBy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "employee" => Ok(GroupBy::Employee),
            "department" => Ok(GroupBy::Department),
            "month" => Ok(GroupBy::Month),
            "week" => Ok(GroupBy::Week),
            other => Err(format!(
                "Unknown grouping '{}', expected employee, department, month or week",
                other
            )),
        }
    }
}

/// Inclusive local-date range plus optional filters.
#[derive(Debug, Clone, Default)]
pub struct ReportQuery {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub employee_id: Option<EmployeeId>,
    pub department: Option<String>,
    pub group_by: GroupBy,
}

impl ReportQuery {
    fn includes_date(&self, date: NaiveDate) -> bool {
        self.from.map_or(true, |from| date >= from) && self.to.map_or(true, |to| date <= to)
    }

    fn includes_employee(&self, employee: &Employee) -> bool {
        self.employee_id.as_ref().map_or(true, |id| *id == employee.id)
            && self
                .department
                .as_ref()
                .map_or(true, |dept| employee.department.as_ref() == Some(dept))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRow {
    pub attendance_id: AttendanceId,
    pub employee_id: EmployeeId,
    pub employee_name: String,
    pub department: Option<String>,
    pub date: NaiveDate,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub status: AttendanceStatus,
    pub late_minutes: Decimal,
    pub early_minutes: Decimal,
    pub worked_hours: Decimal,
    pub overtime_id: Option<OvertimeId>,
    /// Hours of the day's overtime record; shared by every row of that day.
    pub overtime_hours: Decimal,
    /// Days of a live (not cancelled) deduction on this record.
    pub deduction_days: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryLine {
    pub key: String,
    /// Display name of the group; the employee name when grouping by employee.
    pub label: String,
    pub attendances: usize,
    pub late_count: usize,
    pub early_count: usize,
    pub perfect_attendance: bool,
    pub worked_hours: Decimal,
    pub overtime_hours: Decimal,
    pub deduction_days: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Report {
    pub rows: Vec<AttendanceRow>,
    pub summary: Vec<SummaryLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaveSummary {
    pub employee_id: EmployeeId,
    pub year: i32,
    pub allocated: Decimal,
    pub deducted: Decimal,
    pub remaining: Decimal,
}

// --- Rows ---

pub fn attendance_rows<F>(
    state: &LedgerState,
    employees: &[Employee],
    tz_for: F,
    query: &ReportQuery,
) -> Vec<AttendanceRow>
where
    F: Fn(&Employee) -> Tz,
{
    let mut rows = Vec::new();
    for employee in employees.iter().filter(|e| query.includes_employee(e)) {
        let tz = tz_for(employee);
        for record in state.attendances_of(&employee.id) {
            let Some(date) = record.local_date(tz).filter(|d| query.includes_date(*d)) else {
                continue;
            };
            let overtime_hours = record
                .overtime_id
                .and_then(|id| state.overtime(id).ok())
                .map(|o| o.overtime_hours())
                .unwrap_or_default();
            let deduction_days = record
                .deduction_id
                .and_then(|id| state.deduction(id).ok())
                .filter(|d| d.state != DeductionState::Cancelled)
                .map(|d| d.deduction_days())
                .unwrap_or_default();
            rows.push(AttendanceRow {
                attendance_id: record.id,
                employee_id: employee.id.clone(),
                employee_name: employee.name.clone(),
                department: employee.department.clone(),
                date,
                check_in: record.check_in,
                check_out: record.check_out,
                status: record.status,
                late_minutes: record.late_minutes,
                early_minutes: record.early_minutes,
                worked_hours: record.worked_hours(),
                overtime_id: record.overtime_id,
                overtime_hours,
                deduction_days,
            });
        }
    }
    rows.sort_by(|a, b| {
        (a.date, &a.employee_id, a.attendance_id).cmp(&(b.date, &b.employee_id, b.attendance_id))
    });
    rows
}

// --- Summaries ---

fn week_start(date: NaiveDate) -> NaiveDate {
    date.checked_sub_days(Days::new(u64::from(date.weekday().num_days_from_monday())))
        .unwrap_or(date)
}

fn group_key(row: &AttendanceRow, group_by: GroupBy) -> String {
    match group_by {
        GroupBy::Employee => row.employee_id.clone(),
        GroupBy::Department => row
            .department
            .clone()
            .unwrap_or_else(|| NO_DEPARTMENT.to_string()),
        GroupBy::Month => row.date.format("%Y-%m").to_string(),
        GroupBy::Week => format!("Week {}", week_start(row.date).format("%Y-%m-%d")),
    }
}

fn group_label(row: &AttendanceRow, group_by: GroupBy) -> String {
    match group_by {
        GroupBy::Employee => row.employee_name.clone(),
        _ => group_key(row, group_by),
    }
}

#[derive(Default)]
struct Accumulator {
    label: String,
    attendances: usize,
    late_count: usize,
    early_count: usize,
    worked_hours: Decimal,
    overtime_hours: Decimal,
    deduction_days: Decimal,
    overtime_seen: HashSet<OvertimeId>,
}

/// Aggregates rows per group key, ordered by key.
pub fn summarize(rows: &[AttendanceRow], group_by: GroupBy) -> Vec<SummaryLine> {
    let mut groups: BTreeMap<String, Accumulator> = BTreeMap::new();
    for row in rows {
        let acc = groups
            .entry(group_key(row, group_by))
            .or_insert_with(|| Accumulator {
                label: group_label(row, group_by),
                ..Accumulator::default()
            });
        acc.attendances += 1;
        if matches!(row.status, AttendanceStatus::LateIn | AttendanceStatus::BothIssues) {
            acc.late_count += 1;
        }
        if matches!(row.status, AttendanceStatus::EarlyOut | AttendanceStatus::BothIssues) {
            acc.early_count += 1;
        }
        acc.worked_hours += row.worked_hours;
        acc.deduction_days += row.deduction_days;
        // One overtime record spans every row of its day.
        if let Some(id) = row.overtime_id {
            if acc.overtime_seen.insert(id) {
                acc.overtime_hours += row.overtime_hours;
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| SummaryLine {
            key,
            label: acc.label,
            attendances: acc.attendances,
            late_count: acc.late_count,
            early_count: acc.early_count,
            perfect_attendance: acc.late_count == 0
                && acc.early_count == 0
                && acc.deduction_days.is_zero(),
            worked_hours: acc.worked_hours,
            overtime_hours: acc.overtime_hours,
            deduction_days: acc.deduction_days,
        })
        .collect()
}

pub fn build_report<F>(state: &LedgerState, employees: &[Employee], tz_for: F, query: &ReportQuery) -> Report
where
    F: Fn(&Employee) -> Tz,
{
    let rows = attendance_rows(state, employees, tz_for, query);
    let summary = summarize(&rows, query.group_by);
    Report { rows, summary }
}

// --- Leave Balance ---

/// `remaining` is the current balance of allocations valid during `year`;
/// `deducted` counts deductions of that year still in `deducted`.
pub fn leave_summary(state: &LedgerState, employee_id: &str, year: i32) -> LeaveSummary {
    let remaining: Decimal = state
        .allocations_of(employee_id)
        .filter(|a| a.validated)
        .filter(|a| a.date_from.year() <= year && a.date_to.map_or(true, |end| end.year() >= year))
        .map(|a| a.number_of_days)
        .sum();
    let deducted: Decimal = state
        .deductions()
        .filter(|d| d.employee_id == employee_id && d.date.year() == year)
        .filter(|d| d.state == DeductionState::Deducted)
        .map(|d| d.deduction_days())
        .sum();
    LeaveSummary {
        employee_id: employee_id.to_string(),
        year,
        allocated: remaining + deducted,
        deducted,
        remaining,
    }
}

#[cfg(test)]
mod report_tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn d(date_str: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date_str, "%Y-%m-%d").unwrap()
    }

    fn row(name: &str, dept: Option<&str>, date: &str, status: AttendanceStatus, days: Decimal) -> AttendanceRow {
        AttendanceRow {
            attendance_id: 1,
            employee_id: name.to_lowercase(),
            employee_name: name.into(),
            department: dept.map(String::from),
            date: d(date),
            check_in: None,
            check_out: None,
            status,
            late_minutes: Decimal::ZERO,
            early_minutes: Decimal::ZERO,
            worked_hours: dec!(8),
            overtime_id: None,
            overtime_hours: Decimal::ZERO,
            deduction_days: days,
        }
    }

    #[test]
    fn group_keys_follow_the_grouping() {
        let r = row("Alice", None, "2024-03-06", AttendanceStatus::Normal, Decimal::ZERO);
        assert_eq!(group_key(&r, GroupBy::Employee), "alice");
        assert_eq!(group_label(&r, GroupBy::Employee), "Alice");
        assert_eq!(group_label(&r, GroupBy::Month), "2024-03");
        assert_eq!(group_key(&r, GroupBy::Department), "No Department");
        assert_eq!(group_key(&r, GroupBy::Month), "2024-03");
        assert_eq!(group_key(&r, GroupBy::Week), "Week 2024-03-04");
        assert_eq!("WEEK".parse::<GroupBy>(), Ok(GroupBy::Week));
        assert!("year".parse::<GroupBy>().is_err());
    }

    #[test]
    fn summary_counts_and_perfect_attendance() {
        let rows = vec![
            row("Alice", Some("Ops"), "2024-03-04", AttendanceStatus::Normal, Decimal::ZERO),
            row("Alice", Some("Ops"), "2024-03-05", AttendanceStatus::BothIssues, dec!(0.03125)),
            row("Bob", Some("Ops"), "2024-03-04", AttendanceStatus::Normal, Decimal::ZERO),
            row("Bob", Some("Ops"), "2024-03-05", AttendanceStatus::Overtime, Decimal::ZERO),
        ];
        let summary = summarize(&rows, GroupBy::Employee);
        assert_eq!(summary.len(), 2);

        let alice = &summary[0];
        assert_eq!((alice.key.as_str(), alice.label.as_str()), ("alice", "Alice"));
        assert_eq!((alice.late_count, alice.early_count), (1, 1));
        assert!(!alice.perfect_attendance);
        assert_eq!(alice.deduction_days, dec!(0.03125));

        let bob = &summary[1];
        assert!(bob.perfect_attendance);
        assert_eq!(bob.worked_hours, dec!(16));

        let by_dept = summarize(&rows, GroupBy::Department);
        assert_eq!(by_dept.len(), 1);
        assert_eq!(by_dept[0].attendances, 4);
    }

    #[test]
    fn employees_sharing_a_name_stay_separate() {
        let first = row("Alice", None, "2024-03-04", AttendanceStatus::Normal, Decimal::ZERO);
        let mut second = row("Alice", None, "2024-03-04", AttendanceStatus::LateIn, dec!(0.25));
        second.employee_id = "E7".into();

        let summary = summarize(&[first, second], GroupBy::Employee);
        assert_eq!(summary.len(), 2);
        assert_eq!(summary[0].key, "E7");
        assert_eq!(summary[0].deduction_days, dec!(0.25));
        assert_eq!(summary[1].key, "alice");
        assert!(summary[1].perfect_attendance);
        assert!(summary.iter().all(|line| line.label == "Alice"));
    }

    #[test]
    fn overtime_hours_count_once_per_record() {
        let mut first = row("Alice", None, "2024-03-09", AttendanceStatus::Overtime, Decimal::ZERO);
        first.overtime_id = Some(7);
        first.overtime_hours = dec!(4);
        let mut second = first.clone();
        second.attendance_id = 2;

        let summary = summarize(&[first, second], GroupBy::Month);
        assert_eq!(summary[0].overtime_hours, dec!(4));
        assert_eq!(summary[0].attendances, 2);
    }

    #[test]
    fn rows_are_filtered_by_local_date_and_department() {
        let mut state = LedgerState::default();
        let at = |day: u32, h: u32| Utc.with_ymd_and_hms(2024, 3, day, h, 0, 0).unwrap();
        state.insert_attendance(AttendanceRecord::new(0, "E1", Some(at(4, 1)), Some(at(4, 10)), ImportSource::Manual));
        state.insert_attendance(AttendanceRecord::new(0, "E1", Some(at(5, 1)), Some(at(5, 10)), ImportSource::Manual));
        state.insert_attendance(AttendanceRecord::new(0, "E2", Some(at(4, 1)), Some(at(4, 10)), ImportSource::Manual));

        let mut ops = Employee::new("E1", "Alice");
        ops.department = Some("Ops".into());
        let employees = vec![ops, Employee::new("E2", "Bob")];

        let query = ReportQuery {
            from: Some(d("2024-03-04")),
            to: Some(d("2024-03-04")),
            ..ReportQuery::default()
        };
        let rows = attendance_rows(&state, &employees, |_| Tz::UTC, &query);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].worked_hours, dec!(9));

        let query = ReportQuery {
            department: Some("Ops".into()),
            ..ReportQuery::default()
        };
        let rows = attendance_rows(&state, &employees, |_| Tz::UTC, &query);
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.employee_id == "E1"));
    }

    #[test]
    fn leave_summary_adds_back_deducted_days() {
        let mut state = LedgerState::default();
        state.insert_allocation(LeaveAllocation {
            id: 0,
            employee_id: "E1".into(),
            allocation_type: AllocationType::Fixed,
            date_from: d("2024-01-01"),
            date_to: Some(d("2024-12-31")),
            number_of_days: dec!(11.75),
            validated: true,
        });
        let attendance_id = state.insert_attendance(AttendanceRecord::new(
            0,
            "E1",
            Some(Utc.with_ymd_and_hms(2024, 3, 4, 1, 0, 0).unwrap()),
            None,
            ImportSource::Manual,
        ));
        state
            .insert_deduction(LeaveDeduction {
                id: 0,
                employee_id: "E1".into(),
                date: d("2024-03-04"),
                attendance_id,
                deduction_type: DeductionType::LateIn,
                late_minutes: dec!(120),
                early_minutes: Decimal::ZERO,
                grace_period_minutes: dec!(15),
                state: DeductionState::Deducted,
                allocation_id: Some(1),
            })
            .unwrap();

        let summary = leave_summary(&state, "E1", 2024);
        assert_eq!(summary.deducted, dec!(0.25));
        assert_eq!(summary.remaining, dec!(11.75));
        assert_eq!(summary.allocated, dec!(12));
        assert_eq!(leave_summary(&state, "E1", 2023).allocated, Decimal::ZERO);
    }
}
