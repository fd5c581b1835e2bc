use chrono::{DateTime, NaiveDate, Timelike, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, str::FromStr};

use crate::model::{Employee, EmployeeId, ImportSource};

// --- Raw Punches ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PunchType {
    In,
    Out,
    BreakOut,
    BreakIn,
}

impl PunchType {
    fn is_inbound(&self) -> bool {
        matches!(self, PunchType::In | PunchType::BreakIn)
    }
}

impl FromStr for PunchType {
    type Err = String;

    /// Accepts names and the numeric status codes biometric terminals emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in" | "check_in" | "checkin" | "0" => Ok(PunchType::In),
            "out" | "check_out" | "checkout" | "1" => Ok(PunchType::Out),
            "break_out" | "breakout" | "2" => Ok(PunchType::BreakOut),
            "break_in" | "breakin" | "3" => Ok(PunchType::BreakIn),
            other => Err(format!("Unknown punch type '{}'", other)),
        }
    }
}

/// One punch as delivered by a punch source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawPunch {
    pub identifier: String,
    pub instant: DateTime<Utc>,
    #[serde(default)]
    pub punch_type: Option<PunchType>,
}

/// A punch whose identifier has been mapped to an employee.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPunch {
    pub employee_id: EmployeeId,
    pub instant: DateTime<Utc>,
    pub punch_type: Option<PunchType>,
}

// --- Identifier Resolution ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentifierKind {
    Badge,
    EmployeeNumber,
    DeviceUserId,
    Barcode,
}

/// Tried in this order; the first strategy with a match wins.
pub const RESOLUTION_ORDER: [IdentifierKind; 4] = [
    IdentifierKind::Badge,
    IdentifierKind::EmployeeNumber,
    IdentifierKind::DeviceUserId,
    IdentifierKind::Barcode,
];

impl IdentifierKind {
    fn value_of<'a>(&self, employee: &'a Employee) -> Option<&'a str> {
        match self {
            IdentifierKind::Badge => employee.badge_id.as_deref(),
            IdentifierKind::EmployeeNumber => employee.employee_number.as_deref(),
            IdentifierKind::DeviceUserId => employee.device_user_id.as_deref(),
            IdentifierKind::Barcode => employee.barcode.as_deref(),
        }
    }
}

pub fn resolve_employee<'a, I>(identifier: &str, employees: I) -> Option<&'a Employee>
where
    I: IntoIterator<Item = &'a Employee>,
    I::IntoIter: Clone,
{
    let identifier = identifier.trim();
    if identifier.is_empty() {
        return None;
    }
    let employees = employees.into_iter();
    RESOLUTION_ORDER.iter().find_map(|kind| {
        employees
            .clone()
            .find(|emp| kind.value_of(emp) == Some(identifier))
    })
}

// --- Normalization ---

/// One employee-day worth of punches, reduced to at most one check-in and one check-out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceUpsert {
    pub employee_id: EmployeeId,
    pub local_date: NaiveDate,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    /// Number of punches folded into this upsert.
    pub punch_count: usize,
}

/// Groups punches per (employee, local day) and reduces each group:
/// a single punch keeps its own direction, otherwise the first punch is the
/// check-in and the last the check-out. Untyped punches before local noon are check-ins.
pub fn normalize<F>(punches: &[ResolvedPunch], tz_for: F) -> Vec<AttendanceUpsert>
where
    F: Fn(&str) -> Tz,
{
    let mut groups: BTreeMap<(EmployeeId, NaiveDate), Vec<&ResolvedPunch>> = BTreeMap::new();
    for punch in punches {
        let tz = tz_for(&punch.employee_id);
        let local_date = punch.instant.with_timezone(&tz).date_naive();
        groups
            .entry((punch.employee_id.clone(), local_date))
            .or_default()
            .push(punch);
    }

    groups
        .into_iter()
        .map(|((employee_id, local_date), mut day)| {
            day.sort_by_key(|p| p.instant);
            let (check_in, check_out) = match day.as_slice() {
                [only] => {
                    let tz = tz_for(&employee_id);
                    if is_check_in(only, tz) {
                        (Some(only.instant), None)
                    } else {
                        (None, Some(only.instant))
                    }
                }
                [first, .., last] => (Some(first.instant), Some(last.instant)),
                [] => (None, None),
            };
            AttendanceUpsert {
                employee_id,
                local_date,
                check_in,
                check_out,
                punch_count: day.len(),
            }
        })
        .collect()
}

fn is_check_in(punch: &ResolvedPunch, tz: Tz) -> bool {
    match punch.punch_type {
        Some(kind) => kind.is_inbound(),
        None => punch.instant.with_timezone(&tz).hour() < 12,
    }
}

// --- Import Requests ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum ImportMode {
    /// Only punches newer than the source's watermark.
    Incremental,
    /// Re-pull: every punch in the optional inclusive local-date range replaces what
    /// was imported before for that employee-day.
    ForcedReload {
        from: Option<NaiveDate>,
        to: Option<NaiveDate>,
    },
}

impl ImportMode {
    pub fn is_forced(&self) -> bool {
        matches!(self, ImportMode::ForcedReload { .. })
    }

    pub fn in_range(&self, local_date: NaiveDate) -> bool {
        match self {
            ImportMode::Incremental => true,
            ImportMode::ForcedReload { from, to } => {
                from.map_or(true, |from| local_date >= from) && to.map_or(true, |to| local_date <= to)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ImportRequest {
    /// Watermarks are kept per key, e.g. one per terminal.
    pub source_key: String,
    pub source: ImportSource,
    pub punches: Vec<RawPunch>,
    /// Zone the punch source reports local days in. Defaults to each employee's zone.
    pub device_tz: Option<Tz>,
    pub mode: ImportMode,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ImportReport {
    pub total_punches: usize,
    /// Punches skipped as already imported or outside the requested range.
    pub stale: usize,
    /// Punches whose identifier matched no employee.
    pub skipped: usize,
    /// Employee-days applied successfully.
    pub processed: usize,
    /// Employee-days that failed and were left unchanged.
    pub failed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub watermark: Option<DateTime<Utc>>,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod punch_tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, h, m, 0).unwrap()
    }

    fn punch(emp: &str, instant: DateTime<Utc>, punch_type: Option<PunchType>) -> ResolvedPunch {
        ResolvedPunch {
            employee_id: emp.into(),
            instant,
            punch_type,
        }
    }

    #[test]
    fn first_and_last_punch_become_in_and_out() {
        let punches = vec![
            punch("E1", utc(17, 30), None),
            punch("E1", utc(12, 0), None),
            punch("E1", utc(8, 2), None),
        ];
        let upserts = normalize(&punches, |_| Tz::UTC);
        assert_eq!(upserts.len(), 1);
        assert_eq!(upserts[0].check_in, Some(utc(8, 2)));
        assert_eq!(upserts[0].check_out, Some(utc(17, 30)));
        assert_eq!(upserts[0].punch_count, 3);
    }

    #[test]
    fn single_punch_direction_comes_from_type_or_local_noon() {
        let upserts = normalize(&[punch("E1", utc(9, 0), None)], |_| Tz::UTC);
        assert_eq!((upserts[0].check_in, upserts[0].check_out), (Some(utc(9, 0)), None));

        let upserts = normalize(&[punch("E1", utc(17, 5), None)], |_| Tz::UTC);
        assert_eq!((upserts[0].check_in, upserts[0].check_out), (None, Some(utc(17, 5))));

        let upserts = normalize(&[punch("E1", utc(14, 0), Some(PunchType::In))], |_| Tz::UTC);
        assert_eq!(upserts[0].check_in, Some(utc(14, 0)));

        // 06:00 UTC is 13:00 in Ho Chi Minh City: a check-out there.
        let hcm: Tz = "Asia/Ho_Chi_Minh".parse().unwrap();
        let upserts = normalize(&[punch("E1", utc(6, 0), None)], |_| hcm);
        assert_eq!(upserts[0].check_out, Some(utc(6, 0)));
    }

    #[test]
    fn groups_by_local_day_not_utc_day() {
        let hcm: Tz = "Asia/Ho_Chi_Minh".parse().unwrap();
        // 2024-03-04 18:00 UTC is 2024-03-05 01:00 local.
        let punches = vec![
            punch("E1", utc(1, 0), None),
            punch("E1", utc(18, 0), None),
            punch("E2", utc(1, 0), None),
        ];
        let upserts = normalize(&punches, |_| hcm);
        assert_eq!(upserts.len(), 3);
        assert_eq!(upserts[0].local_date, NaiveDate::from_ymd_opt(2024, 3, 4).unwrap());
        assert_eq!(upserts[1].local_date, NaiveDate::from_ymd_opt(2024, 3, 5).unwrap());
        assert_eq!(upserts[2].employee_id, "E2");
    }

    #[test]
    fn identifier_strategies_are_tried_in_priority_order() {
        let mut by_badge = Employee::new("E1", "Badge Holder");
        by_badge.badge_id = Some("1001".into());
        let mut by_number = Employee::new("E2", "Numbered");
        by_number.employee_number = Some("1001".into());
        by_number.device_user_id = Some("77".into());
        let mut by_barcode = Employee::new("E3", "Barcoded");
        by_barcode.barcode = Some("77".into());

        let employees = vec![by_number.clone(), by_barcode.clone(), by_badge.clone()];
        assert_eq!(resolve_employee("1001", &employees).map(|e| e.id.as_str()), Some("E1"));
        assert_eq!(resolve_employee(" 77 ", &employees).map(|e| e.id.as_str()), Some("E2"));
        assert!(resolve_employee("nobody", &employees).is_none());
        assert!(resolve_employee("", &employees).is_none());
    }

    #[test]
    fn forced_range_is_inclusive() {
        let mode = ImportMode::ForcedReload {
            from: NaiveDate::from_ymd_opt(2024, 3, 4),
            to: NaiveDate::from_ymd_opt(2024, 3, 5),
        };
        assert!(mode.in_range(NaiveDate::from_ymd_opt(2024, 3, 4).unwrap()));
        assert!(mode.in_range(NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()));
        assert!(!mode.in_range(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap()));
        assert_eq!("1".parse::<PunchType>(), Ok(PunchType::Out));
        assert!("sideways".parse::<PunchType>().is_err());
    }
}
