use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::schedule::WeeklyCalendar;

// --- Identifiers ---

pub type EmployeeId = String;
pub type AttendanceId = u64;
pub type OvertimeId = u64;
pub type DeductionId = u64;
pub type AllocationId = u64;

/// 480 minutes of late/early time is one day of leave.
pub const MINUTES_PER_LEAVE_DAY: Decimal = dec!(480);

macro_rules! display_as_str {
    ($ty:ty) => {
        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// --- Employees ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub wage: Decimal,
    pub date_start: NaiveDate,
    #[serde(default)]
    pub date_end: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub active: bool,
}

impl Contract {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.active && self.date_start <= date && self.date_end.map_or(true, |end| date <= end)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Employee {
    pub id: EmployeeId,
    pub name: String,
    #[serde(default)]
    pub tz: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
    #[serde(default)]
    pub calendar: Option<WeeklyCalendar>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default = "default_true")]
    pub active: bool,

    // External identifiers a punch may carry.
    #[serde(default)]
    pub badge_id: Option<String>,
    #[serde(default)]
    pub employee_number: Option<String>,
    #[serde(default)]
    pub device_user_id: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
}

impl Employee {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            tz: None,
            department: None,
            calendar: None,
            contracts: Vec::new(),
            active: true,
            badge_id: None,
            employee_number: None,
            device_user_id: None,
            barcode: None,
        }
    }

    pub fn active_contract(&self, date: NaiveDate) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.covers(date))
    }
}

fn default_true() -> bool {
    true
}

// --- Attendance ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportSource {
    Manual,
    Device,
    Csv,
    Api,
}

impl ImportSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImportSource::Manual => "manual",
            ImportSource::Device => "device",
            ImportSource::Csv => "csv",
            ImportSource::Api => "api",
        }
    }
}
display_as_str!(ImportSource);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingRequestState {
    #[default]
    None,
    Pending,
    Approved,
    Rejected,
}

impl MissingRequestState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissingRequestState::None => "none",
            MissingRequestState::Pending => "pending",
            MissingRequestState::Approved => "approved",
            MissingRequestState::Rejected => "rejected",
        }
    }
}
display_as_str!(MissingRequestState);

/// Presentation tier of a status. Ordered from least to most attention-worthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Deviation,
    Missing,
    Overtime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Normal,
    LateIn,
    EarlyOut,
    MissingOut,
    MissingIn,
    LateMissingOut,
    EarlyMissingIn,
    BothIssues,
    Overtime,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Normal => "normal",
            AttendanceStatus::LateIn => "late_in",
            AttendanceStatus::EarlyOut => "early_out",
            AttendanceStatus::MissingOut => "missing_out",
            AttendanceStatus::MissingIn => "missing_in",
            AttendanceStatus::LateMissingOut => "late_missing_out",
            AttendanceStatus::EarlyMissingIn => "early_missing_in",
            AttendanceStatus::BothIssues => "both_issues",
            AttendanceStatus::Overtime => "overtime",
        }
    }

    /// Kanban/list color index.
    pub fn color(&self) -> u8 {
        match self {
            AttendanceStatus::Normal => 0,
            AttendanceStatus::LateIn => 3,
            AttendanceStatus::EarlyOut => 1,
            AttendanceStatus::MissingOut | AttendanceStatus::MissingIn => 9,
            AttendanceStatus::LateMissingOut
            | AttendanceStatus::EarlyMissingIn
            | AttendanceStatus::BothIssues => 2,
            AttendanceStatus::Overtime => 4,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            AttendanceStatus::Normal => Severity::Normal,
            AttendanceStatus::LateIn | AttendanceStatus::EarlyOut => Severity::Deviation,
            AttendanceStatus::MissingOut
            | AttendanceStatus::MissingIn
            | AttendanceStatus::LateMissingOut
            | AttendanceStatus::EarlyMissingIn
            | AttendanceStatus::BothIssues => Severity::Missing,
            AttendanceStatus::Overtime => Severity::Overtime,
        }
    }

    pub fn is_late(&self) -> bool {
        matches!(
            self,
            AttendanceStatus::LateIn | AttendanceStatus::BothIssues | AttendanceStatus::LateMissingOut
        )
    }

    pub fn is_early(&self) -> bool {
        matches!(
            self,
            AttendanceStatus::EarlyOut | AttendanceStatus::BothIssues | AttendanceStatus::EarlyMissingIn
        )
    }

    pub fn is_missing_out(&self) -> bool {
        matches!(
            self,
            AttendanceStatus::MissingOut | AttendanceStatus::LateMissingOut
        )
    }

    /// Statuses the daily deduction job looks at.
    pub fn has_issue(&self) -> bool {
        !matches!(self, AttendanceStatus::Normal | AttendanceStatus::Overtime)
    }
}
display_as_str!(AttendanceStatus);

/// One work session of one employee on one local day.
///
/// Everything below the `derived` marker is written by the engine's reconcile step only.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: AttendanceId,
    pub employee_id: EmployeeId,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub import_source: ImportSource,
    pub missing_check_in: bool,
    pub missing_request_state: MissingRequestState,
    pub missing_approved_by: Option<String>,
    pub missing_approved_at: Option<DateTime<Utc>>,

    // derived
    pub scheduled_check_in: Option<DateTime<Utc>>,
    pub scheduled_check_out: Option<DateTime<Utc>>,
    pub scheduled_hours: Decimal,
    pub late_minutes: Decimal,
    pub early_minutes: Decimal,
    pub status: AttendanceStatus,
    pub daily_ot_seconds: i64,
    pub overtime_id: Option<OvertimeId>,
    pub deduction_id: Option<DeductionId>,
}

impl AttendanceRecord {
    pub fn new(
        id: AttendanceId,
        employee_id: &str,
        check_in: Option<DateTime<Utc>>,
        check_out: Option<DateTime<Utc>>,
        import_source: ImportSource,
    ) -> Self {
        Self {
            id,
            employee_id: employee_id.to_string(),
            check_in,
            check_out,
            import_source,
            missing_check_in: check_in.is_none() && check_out.is_some(),
            missing_request_state: MissingRequestState::None,
            missing_approved_by: None,
            missing_approved_at: None,
            scheduled_check_in: None,
            scheduled_check_out: None,
            scheduled_hours: Decimal::ZERO,
            late_minutes: Decimal::ZERO,
            early_minutes: Decimal::ZERO,
            status: AttendanceStatus::Normal,
            daily_ot_seconds: 0,
            overtime_id: None,
            deduction_id: None,
        }
    }

    /// The instant that decides which local day the record belongs to.
    pub fn anchor(&self) -> Option<DateTime<Utc>> {
        self.check_in.or(self.check_out)
    }

    pub fn local_date(&self, tz: Tz) -> Option<NaiveDate> {
        self.anchor().map(|at| at.with_timezone(&tz).date_naive())
    }

    pub fn check_in_local_date(&self, tz: Tz) -> Option<NaiveDate> {
        self.check_in.map(|at| at.with_timezone(&tz).date_naive())
    }

    /// Whether either punch lands on `date` in `tz`.
    pub fn touches_local_date(&self, date: NaiveDate, tz: Tz) -> bool {
        [self.check_in, self.check_out]
            .iter()
            .flatten()
            .any(|at| at.with_timezone(&tz).date_naive() == date)
    }

    pub fn is_missing_punch(&self) -> bool {
        self.missing_check_in || self.check_in.is_none() || self.check_out.is_none()
    }

    pub fn worked_seconds(&self) -> i64 {
        match (self.check_in, self.check_out) {
            (Some(check_in), Some(check_out)) => (check_out - check_in).num_seconds().max(0),
            _ => 0,
        }
    }

    pub fn worked_hours(&self) -> Decimal {
        seconds_to_hours(self.worked_seconds())
    }

    pub fn daily_ot_str(&self) -> String {
        format_hms(self.daily_ot_seconds)
    }
}

pub fn seconds_to_hours(seconds: i64) -> Decimal {
    Decimal::from(seconds) / dec!(3600)
}

pub fn format_hms(seconds: i64) -> String {
    let seconds = seconds.max(0);
    format!(
        "{:02}:{:02}:{:02}",
        seconds / 3600,
        (seconds % 3600) / 60,
        seconds % 60
    )
}

// --- Overtime ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvertimeCategory {
    Weekday,
    Weekend,
    Holiday,
}

impl OvertimeCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OvertimeCategory::Weekday => "weekday",
            OvertimeCategory::Weekend => "weekend",
            OvertimeCategory::Holiday => "holiday",
        }
    }

    pub fn is_rest_day(&self) -> bool {
        !matches!(self, OvertimeCategory::Weekday)
    }
}
display_as_str!(OvertimeCategory);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OvertimeState {
    Draft,
    Submitted,
    Approved,
    Rejected,
    Paid,
}

impl OvertimeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OvertimeState::Draft => "draft",
            OvertimeState::Submitted => "submitted",
            OvertimeState::Approved => "approved",
            OvertimeState::Rejected => "rejected",
            OvertimeState::Paid => "paid",
        }
    }
}
display_as_str!(OvertimeState);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OvertimeRecord {
    pub id: OvertimeId,
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub attendance_ids: Vec<AttendanceId>,
    pub worked_hours: Decimal,
    pub standard_hours: Decimal,
    pub ot_seconds: i64,
    pub category: OvertimeCategory,
    pub weekday_overtime: Decimal,
    pub weekend_overtime: Decimal,
    pub holiday_overtime: Decimal,
    pub amount: Decimal,
    pub state: OvertimeState,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub rejection_reason: Option<String>,
}

impl OvertimeRecord {
    pub fn overtime_hours(&self) -> Decimal {
        seconds_to_hours(self.ot_seconds)
    }

    pub fn ot_str(&self) -> String {
        format_hms(self.ot_seconds)
    }
}

// --- Leave ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionType {
    LateIn,
    EarlyOut,
    Both,
    MissingIn,
    MissingOut,
}

impl DeductionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionType::LateIn => "late_in",
            DeductionType::EarlyOut => "early_out",
            DeductionType::Both => "both",
            DeductionType::MissingIn => "missing_in",
            DeductionType::MissingOut => "missing_out",
        }
    }

    /// Missing-punch records exist for the dashboard only and never touch a balance.
    pub fn is_debitable(&self) -> bool {
        matches!(
            self,
            DeductionType::LateIn | DeductionType::EarlyOut | DeductionType::Both
        )
    }
}
display_as_str!(DeductionType);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeductionState {
    Draft,
    Confirmed,
    Deducted,
    Cancelled,
}

impl DeductionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeductionState::Draft => "draft",
            DeductionState::Confirmed => "confirmed",
            DeductionState::Deducted => "deducted",
            DeductionState::Cancelled => "cancelled",
        }
    }
}
display_as_str!(DeductionState);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LeaveDeduction {
    pub id: DeductionId,
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub attendance_id: AttendanceId,
    pub deduction_type: DeductionType,
    pub late_minutes: Decimal,
    pub early_minutes: Decimal,
    pub grace_period_minutes: Decimal,
    pub state: DeductionState,
    pub allocation_id: Option<AllocationId>,
}

impl LeaveDeduction {
    pub fn total_minutes(&self) -> Decimal {
        self.late_minutes + self.early_minutes
    }

    pub fn deduction_days(&self) -> Decimal {
        let total = self.total_minutes();
        if total > Decimal::ZERO {
            (total / MINUTES_PER_LEAVE_DAY).normalize()
        } else {
            Decimal::ZERO
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationType {
    /// A fixed annual grant.
    #[default]
    Fixed,
    Accrual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaveAllocation {
    #[serde(default)]
    pub id: AllocationId,
    pub employee_id: EmployeeId,
    #[serde(default)]
    pub allocation_type: AllocationType,
    pub date_from: NaiveDate,
    #[serde(default)]
    pub date_to: Option<NaiveDate>,
    pub number_of_days: Decimal,
    #[serde(default = "default_true")]
    pub validated: bool,
}

impl LeaveAllocation {
    pub fn covers(&self, date: NaiveDate) -> bool {
        self.date_from <= date && self.date_to.map_or(true, |end| date <= end)
    }
}

#[cfg(test)]
mod model_tests {
    use super::*;

    #[test]
    fn color_map_matches_presentation_tiers() {
        assert_eq!(AttendanceStatus::Normal.color(), 0);
        assert_eq!(AttendanceStatus::LateIn.color(), 3);
        assert_eq!(AttendanceStatus::EarlyOut.color(), 1);
        assert_eq!(AttendanceStatus::MissingIn.color(), 9);
        assert_eq!(AttendanceStatus::BothIssues.color(), 2);
        assert_eq!(AttendanceStatus::Overtime.color(), 4);
        assert!(AttendanceStatus::Normal.severity() < AttendanceStatus::LateIn.severity());
        assert!(AttendanceStatus::EarlyOut.severity() < AttendanceStatus::MissingOut.severity());
        assert_eq!(
            AttendanceStatus::BothIssues.severity(),
            AttendanceStatus::MissingIn.severity()
        );
        assert!(AttendanceStatus::MissingIn.severity() < AttendanceStatus::Overtime.severity());
    }

    #[test]
    fn deduction_days_is_minutes_over_480() {
        let deduction = LeaveDeduction {
            id: 1,
            employee_id: "E1".into(),
            date: NaiveDate::from_ymd_opt(2024, 3, 4).unwrap(),
            attendance_id: 1,
            deduction_type: DeductionType::LateIn,
            late_minutes: dec!(120),
            early_minutes: Decimal::ZERO,
            grace_period_minutes: dec!(15),
            state: DeductionState::Draft,
            allocation_id: None,
        };
        assert_eq!(deduction.deduction_days(), dec!(0.25));
    }

    #[test]
    fn hms_formatting() {
        assert_eq!(format_hms(0), "00:00:00");
        assert_eq!(format_hms(2700), "00:45:00");
        assert_eq!(format_hms(14400), "04:00:00");
        assert_eq!(format_hms(3725), "01:02:05");
    }
}
