use chrono::{DateTime, NaiveDate, Utc};
use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::model::*;

/// In-memory record store. Every mutation goes through one lock, so a reconcile pass
/// and an allocation debit are each applied as a unit.
#[derive(Clone, Default)]
pub struct Ledger {
    state: Arc<Mutex<LedgerState>>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Point-in-time copy for read-only consumers such as reports.
    pub fn snapshot(&self) -> LedgerState {
        self.lock().clone()
    }
}

#[derive(Debug, Clone, Default)]
pub struct LedgerState {
    attendances: BTreeMap<AttendanceId, AttendanceRecord>,
    overtimes: BTreeMap<OvertimeId, OvertimeRecord>,
    deductions: BTreeMap<DeductionId, LeaveDeduction>,
    allocations: BTreeMap<AllocationId, LeaveAllocation>,
    watermarks: HashMap<String, DateTime<Utc>>,
    last_id: u64,
}

impl LedgerState {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    // --- Attendance ---

    pub fn attendance(&self, id: AttendanceId) -> EngineResult<&AttendanceRecord> {
        self.attendances
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("attendance record {}", id)))
    }

    pub fn attendance_mut(&mut self, id: AttendanceId) -> EngineResult<&mut AttendanceRecord> {
        self.attendances
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("attendance record {}", id)))
    }

    /// Stores the record under a fresh id and returns it.
    pub fn insert_attendance(&mut self, mut record: AttendanceRecord) -> AttendanceId {
        let id = self.next_id();
        record.id = id;
        debug!("Stored attendance: Id={}, Emp={}", id, record.employee_id);
        self.attendances.insert(id, record);
        id
    }

    pub fn remove_attendance(&mut self, id: AttendanceId) -> EngineResult<AttendanceRecord> {
        self.attendances
            .remove(&id)
            .ok_or_else(|| EngineError::NotFound(format!("attendance record {}", id)))
    }

    pub fn attendances(&self) -> impl Iterator<Item = &AttendanceRecord> {
        self.attendances.values()
    }

    pub fn attendances_of<'a>(
        &'a self,
        employee_id: &'a str,
    ) -> impl Iterator<Item = &'a AttendanceRecord> + 'a {
        self.attendances
            .values()
            .filter(move |r| r.employee_id == employee_id)
    }

    // --- Overtime ---

    pub fn overtime(&self, id: OvertimeId) -> EngineResult<&OvertimeRecord> {
        self.overtimes
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("overtime record {}", id)))
    }

    pub fn overtime_mut(&mut self, id: OvertimeId) -> EngineResult<&mut OvertimeRecord> {
        self.overtimes
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("overtime record {}", id)))
    }

    pub fn overtime_for_day(&self, employee_id: &str, date: NaiveDate) -> Option<&OvertimeRecord> {
        self.overtimes
            .values()
            .find(|o| o.employee_id == employee_id && o.date == date)
    }

    /// Fails when the employee already has an overtime record for that date.
    pub fn insert_overtime(&mut self, mut record: OvertimeRecord) -> EngineResult<OvertimeId> {
        if let Some(existing) = self.overtime_for_day(&record.employee_id, record.date) {
            return Err(EngineError::conflict(
                &format!(
                    "Overtime record for {} on {}",
                    record.employee_id, record.date
                ),
                existing.id,
            ));
        }
        let id = self.next_id();
        record.id = id;
        self.overtimes.insert(id, record);
        Ok(id)
    }

    pub fn remove_overtime(&mut self, id: OvertimeId) -> Option<OvertimeRecord> {
        self.overtimes.remove(&id)
    }

    pub fn overtimes(&self) -> impl Iterator<Item = &OvertimeRecord> {
        self.overtimes.values()
    }

    // --- Deductions ---

    pub fn deduction(&self, id: DeductionId) -> EngineResult<&LeaveDeduction> {
        self.deductions
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("leave deduction {}", id)))
    }

    pub fn deduction_mut(&mut self, id: DeductionId) -> EngineResult<&mut LeaveDeduction> {
        self.deductions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("leave deduction {}", id)))
    }

    pub fn deduction_for_attendance(&self, attendance_id: AttendanceId) -> Option<&LeaveDeduction> {
        self.deductions
            .values()
            .find(|d| d.attendance_id == attendance_id)
    }

    /// Fails when the attendance record already has a deduction.
    pub fn insert_deduction(&mut self, mut deduction: LeaveDeduction) -> EngineResult<DeductionId> {
        if let Some(existing) = self.deduction_for_attendance(deduction.attendance_id) {
            return Err(EngineError::conflict(
                &format!(
                    "Leave deduction for attendance {}",
                    deduction.attendance_id
                ),
                existing.id,
            ));
        }
        let id = self.next_id();
        deduction.id = id;
        self.deductions.insert(id, deduction);
        Ok(id)
    }

    pub fn deductions(&self) -> impl Iterator<Item = &LeaveDeduction> {
        self.deductions.values()
    }

    // --- Allocations ---

    pub fn allocation(&self, id: AllocationId) -> EngineResult<&LeaveAllocation> {
        self.allocations
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("leave allocation {}", id)))
    }

    pub fn allocation_mut(&mut self, id: AllocationId) -> EngineResult<&mut LeaveAllocation> {
        self.allocations
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("leave allocation {}", id)))
    }

    pub fn insert_allocation(&mut self, mut allocation: LeaveAllocation) -> AllocationId {
        let id = self.next_id();
        allocation.id = id;
        self.allocations.insert(id, allocation);
        id
    }

    pub fn allocations_of<'a>(
        &'a self,
        employee_id: &'a str,
    ) -> impl Iterator<Item = &'a LeaveAllocation> + 'a {
        self.allocations
            .values()
            .filter(move |a| a.employee_id == employee_id)
    }

    // --- Import watermarks ---

    pub fn watermark(&self, source_key: &str) -> Option<DateTime<Utc>> {
        self.watermarks.get(source_key).copied()
    }

    /// Only ever moves a watermark forward.
    pub fn advance_watermark(&mut self, source_key: &str, at: DateTime<Utc>) {
        let entry = self.watermarks.entry(source_key.to_string()).or_insert(at);
        if at > *entry {
            *entry = at;
        }
    }
}

#[cfg(test)]
mod store_tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal::Decimal;

    fn overtime(employee_id: &str, date: NaiveDate) -> OvertimeRecord {
        OvertimeRecord {
            id: 0,
            employee_id: employee_id.into(),
            date,
            attendance_ids: Vec::new(),
            worked_hours: Decimal::ZERO,
            standard_hours: Decimal::ZERO,
            ot_seconds: 3600,
            category: OvertimeCategory::Weekday,
            weekday_overtime: Decimal::ONE,
            weekend_overtime: Decimal::ZERO,
            holiday_overtime: Decimal::ZERO,
            amount: Decimal::ZERO,
            state: OvertimeState::Draft,
            approved_by: None,
            approved_at: None,
            rejection_reason: None,
        }
    }

    #[test]
    fn second_overtime_for_same_day_conflicts() {
        let mut state = LedgerState::default();
        let date = NaiveDate::from_ymd_opt(2024, 3, 4).unwrap();
        let first = state.insert_overtime(overtime("E1", date)).unwrap();
        match state.insert_overtime(overtime("E1", date)) {
            Err(EngineError::Conflict { existing_id, .. }) => assert_eq!(existing_id, first),
            other => panic!("expected conflict, got {:?}", other),
        }
        assert!(state.insert_overtime(overtime("E2", date)).is_ok());
    }

    #[test]
    fn watermark_never_moves_back() {
        let mut state = LedgerState::default();
        let later = Utc.with_ymd_and_hms(2024, 3, 4, 10, 0, 0).unwrap();
        let earlier = Utc.with_ymd_and_hms(2024, 3, 4, 9, 0, 0).unwrap();
        state.advance_watermark("device-1", later);
        state.advance_watermark("device-1", earlier);
        assert_eq!(state.watermark("device-1"), Some(later));
        assert_eq!(state.watermark("device-2"), None);
    }
}
