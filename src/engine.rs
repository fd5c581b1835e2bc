use chrono::{DateTime, Days, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::Serialize;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, error, info, warn};

use crate::classify::{classify, record_ot_seconds, OvertimeContext};
use crate::config::EngineConfig;
use crate::deduction;
use crate::error::{EngineError, EngineResult};
use crate::model::*;
use crate::notify::{AttendanceEvent, EventKind, Notifier, TracingNotifier};
use crate::overtime::{self, day_category, HolidayCalendar, HolidaySet};
use crate::punch::{normalize, resolve_employee, AttendanceUpsert, ImportMode, ImportReport, ImportRequest, ResolvedPunch};
use crate::report::{self, LeaveSummary, Report, ReportQuery};
use crate::schedule::{resolve_tz, ScheduleCache};
use crate::store::{Ledger, LedgerState};

// --- Clock ---

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct FixedClock {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(at)),
        }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// --- Requests & Reports ---

#[derive(Debug, Clone)]
pub struct NewAttendance {
    pub employee_id: EmployeeId,
    pub check_in: Option<DateTime<Utc>>,
    pub check_out: Option<DateTime<Utc>>,
    pub source: ImportSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DailyRunReport {
    pub date: Option<NaiveDate>,
    pub reconciled: usize,
    pub overtime_days: usize,
    pub deductions_created: usize,
    pub debits_applied: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UpsertKind {
    Created,
    Updated,
    Unchanged,
}

struct UpsertOutcome {
    kind: UpsertKind,
    removed: usize,
    events: Vec<AttendanceEvent>,
}

fn validate_punches(check_in: Option<DateTime<Utc>>, check_out: Option<DateTime<Utc>>) -> EngineResult<()> {
    match (check_in, check_out) {
        (None, None) => Err(EngineError::Validation(
            "An attendance record needs a check-in or a check-out".into(),
        )),
        (Some(check_in), Some(check_out)) if check_out < check_in => Err(EngineError::Validation(format!(
            "Check-out {} is before check-in {}",
            check_out, check_in
        ))),
        _ => Ok(()),
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn latest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

fn same_minute(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.timestamp().div_euclid(60) == b.timestamp().div_euclid(60),
        _ => false,
    }
}

// --- Attendance Engine ---

/// Owns employees, holidays and the ledger, and runs the reconcile pipeline
/// (classification, then overtime, then deduction) for every write.
#[derive(Clone)]
pub struct AttendanceEngine {
    config: Arc<EngineConfig>,
    clock: Arc<dyn Clock>,
    notifier: Arc<dyn Notifier>,
    employees: Arc<Mutex<HashMap<EmployeeId, Employee>>>,
    holidays: Arc<Mutex<HolidaySet>>,
    holiday_calendar: Option<Arc<dyn HolidayCalendar>>,
    acting_user_tz: Option<String>,
    ledger: Ledger,
    schedules: ScheduleCache,
}

impl HolidayCalendar for AttendanceEngine {
    fn is_holiday(&self, employee_id: &str, date: NaiveDate) -> bool {
        self.holidays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_holiday(employee_id, date)
            || self
                .holiday_calendar
                .as_ref()
                .map_or(false, |calendar| calendar.is_holiday(employee_id, date))
    }
}

impl AttendanceEngine {
    pub fn new(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        notifier: Arc<dyn Notifier>,
    ) -> EngineResult<Self> {
        config.validate()?;
        info!(
            "Attendance engine configured: grace={}min, tz={}, auto_confirm={}, auto_process={}",
            config.grace_period_minutes,
            config.business_timezone,
            config.auto_confirm_deductions,
            config.auto_process_deductions
        );
        Ok(Self {
            config: Arc::new(config),
            clock,
            notifier,
            employees: Arc::new(Mutex::new(HashMap::new())),
            holidays: Arc::new(Mutex::new(HolidaySet::default())),
            holiday_calendar: None,
            acting_user_tz: None,
            ledger: Ledger::new(),
            schedules: ScheduleCache::new(),
        })
    }

    /// System clock and log-only notifications.
    pub fn with_defaults(config: EngineConfig) -> EngineResult<Self> {
        Self::new(config, Arc::new(SystemClock), Arc::new(TracingNotifier))
    }

    /// Zone of the user driving this engine; used for employees without their own zone.
    pub fn with_acting_user_tz(mut self, tz: &str) -> Self {
        self.acting_user_tz = Some(tz.to_string());
        self.schedules = ScheduleCache::new();
        self
    }

    pub fn with_holiday_calendar(mut self, calendar: Arc<dyn HolidayCalendar>) -> Self {
        self.holiday_calendar = Some(calendar);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    // --- Configuration Methods ---

    pub fn configure_employee(&self, employee: Employee) -> EngineResult<()> {
        if let Some(calendar) = &employee.calendar {
            calendar.validate()?;
        }
        info!(
            "Configuring employee: Emp={}, Name={}, Tz={:?}",
            employee.id, employee.name, employee.tz
        );
        self.schedules.invalidate_employee(&employee.id);
        self.employees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(employee.id.clone(), employee);
        Ok(())
    }

    pub fn configure_holiday(&self, date: NaiveDate) {
        info!("Configuring holiday: {}", date);
        self.holidays
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(date);
    }

    pub fn add_allocation(&self, allocation: LeaveAllocation) -> EngineResult<AllocationId> {
        self.employee(&allocation.employee_id)?;
        if allocation.number_of_days < rust_decimal::Decimal::ZERO {
            return Err(EngineError::Validation(
                "An allocation cannot start with a negative balance".into(),
            ));
        }
        let id = self.ledger.lock().insert_allocation(allocation);
        info!("Leave allocation added: Id={}", id);
        Ok(id)
    }

    pub fn employee(&self, employee_id: &str) -> EngineResult<Employee> {
        self.employees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(employee_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("employee {}", employee_id)))
    }

    /// All configured employees, ordered by id.
    pub fn employees(&self) -> Vec<Employee> {
        let mut employees: Vec<Employee> = self
            .employees
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        employees.sort_by(|a, b| a.id.cmp(&b.id));
        employees
    }

    pub fn tz_for(&self, employee: &Employee) -> Tz {
        resolve_tz(
            employee.tz.as_deref(),
            self.acting_user_tz.as_deref(),
            &self.config.business_timezone,
        )
    }

    // --- Manual Entry ---

    pub fn create_attendance(&self, new: NewAttendance) -> EngineResult<AttendanceId> {
        let employee = self.employee(&new.employee_id)?;
        validate_punches(new.check_in, new.check_out)?;

        let (id, events) = {
            let mut state = self.ledger.lock();
            let duplicate = state.attendances_of(&employee.id).find(|r| {
                if new.check_in.is_some() {
                    same_minute(r.check_in, new.check_in)
                } else {
                    r.check_in.is_none() && same_minute(r.check_out, new.check_out)
                }
            });
            if let Some(existing) = duplicate {
                return Err(EngineError::conflict("Attendance record", existing.id));
            }
            let id = state.insert_attendance(AttendanceRecord::new(
                0,
                &employee.id,
                new.check_in,
                new.check_out,
                new.source,
            ));
            let events = self.reconcile_locked(&mut state, id, &employee, None)?;
            (id, events)
        };
        info!("Attendance created: Id={}, Emp={}", id, employee.id);
        self.dispatch(&events);
        Ok(id)
    }

    /// Replaces both punches of a record and reconciles it.
    pub fn update_attendance(
        &self,
        id: AttendanceId,
        check_in: Option<DateTime<Utc>>,
        check_out: Option<DateTime<Utc>>,
    ) -> EngineResult<AttendanceRecord> {
        validate_punches(check_in, check_out)?;
        let (record, events) = {
            let mut state = self.ledger.lock();
            let employee = self.employee(&state.attendance(id)?.employee_id)?;
            let tz = self.tz_for(&employee);
            let previous_day = state.attendance(id)?.check_in_local_date(tz);

            let record = state.attendance_mut(id)?;
            record.check_in = check_in;
            record.check_out = check_out;
            record.missing_check_in = check_in.is_none() && check_out.is_some();

            let events = self.reconcile_locked(&mut state, id, &employee, previous_day)?;
            (state.attendance(id)?.clone(), events)
        };
        info!("Attendance updated: Id={}, Emp={}", id, record.employee_id);
        self.dispatch(&events);
        Ok(record)
    }

    /// Refused while a leave deduction references the record.
    pub fn delete_attendance(&self, id: AttendanceId) -> EngineResult<()> {
        let mut state = self.ledger.lock();
        if let Some(deduction) = state.deduction_for_attendance(id) {
            return Err(EngineError::conflict("Leave deduction", deduction.id));
        }
        let employee = self.employee(&state.attendance(id)?.employee_id)?;
        let tz = self.tz_for(&employee);
        let removed = state.remove_attendance(id)?;
        if let Some(date) = removed.check_in_local_date(tz) {
            let category = day_category(self, &employee.id, date);
            overtime::recompute_day(&mut state, &employee, date, tz, category, self.config.standard_working_hours)?;
        }
        info!("Attendance deleted: Id={}, Emp={}", id, employee.id);
        Ok(())
    }

    // --- Reconcile ---

    /// Recomputes schedule, status, overtime and deduction for one record, in that order.
    pub fn reconcile(&self, id: AttendanceId) -> EngineResult<AttendanceRecord> {
        let (record, events) = {
            let mut state = self.ledger.lock();
            let employee = self.employee(&state.attendance(id)?.employee_id)?;
            let events = self.reconcile_locked(&mut state, id, &employee, None)?;
            (state.attendance(id)?.clone(), events)
        };
        self.dispatch(&events);
        Ok(record)
    }

    /// Runs under the caller's ledger lock; readers never see a half-reconciled record.
    fn reconcile_locked(
        &self,
        state: &mut LedgerState,
        id: AttendanceId,
        employee: &Employee,
        previous_day: Option<NaiveDate>,
    ) -> EngineResult<Vec<AttendanceEvent>> {
        let tz = self.tz_for(employee);
        let record = state.attendance(id)?.clone();
        let previous_status = record.status;
        let local_date = record.local_date(tz);

        // 1. schedule + classification
        let schedule = local_date.and_then(|date| self.schedules.get_or_resolve(employee, date, tz));
        let category = local_date
            .map(|date| day_category(self, &employee.id, date))
            .unwrap_or(OvertimeCategory::Weekday);
        let ctx = OvertimeContext {
            category,
            daily_ot_seconds: record_ot_seconds(&record, category, tz),
            worked_seconds: record.worked_seconds(),
        };
        let classification = classify(&record, schedule.as_ref(), &ctx, self.config.grace_period_minutes);
        {
            let target = state.attendance_mut(id)?;
            target.scheduled_check_in = schedule.as_ref().map(|s| s.scheduled_in);
            target.scheduled_check_out = schedule.as_ref().map(|s| s.scheduled_out);
            target.scheduled_hours = schedule
                .as_ref()
                .map(|s| s.scheduled_hours())
                .unwrap_or_default();
            target.status = classification.status;
            target.late_minutes = classification.late_minutes;
            target.early_minutes = classification.early_minutes;
            target.daily_ot_seconds = ctx.daily_ot_seconds;
        }
        debug!(
            "Classified attendance: Id={}, Emp={}, Date={:?}, Status={}, Late={}, Early={}",
            id, employee.id, local_date, classification.status, classification.late_minutes, classification.early_minutes
        );

        // 2. overtime, for the record's day and the day it moved away from
        let mut days: Vec<NaiveDate> = record.check_in_local_date(tz).into_iter().collect();
        if let Some(previous) = previous_day {
            if !days.contains(&previous) {
                days.push(previous);
            }
        }
        for date in days {
            let category = day_category(self, &employee.id, date);
            overtime::recompute_day(state, employee, date, tz, category, self.config.standard_working_hours)?;
        }

        // 3. deduction
        if let Some(date) = local_date {
            deduction::process_deduction(state, id, date, &self.config)?;
        }

        // 4. events, only when the status changed
        let mut events = Vec::new();
        if let Some(date) = local_date.filter(|_| classification.status != previous_status) {
            let event = |kind, minutes| AttendanceEvent {
                kind,
                employee_id: employee.id.clone(),
                date,
                attendance_id: id,
                minutes,
            };
            let status = classification.status;
            if self.config.notify_late_arrivals && status.is_late() {
                events.push(event(EventKind::LateArrival, classification.late_minutes));
            }
            if self.config.notify_early_departures && status.is_early() {
                events.push(event(EventKind::EarlyDeparture, classification.early_minutes));
            }
            if self.config.notify_missing_checkout && status.is_missing_out() {
                events.push(event(EventKind::MissingCheckOut, rust_decimal::Decimal::ZERO));
            }
        }
        Ok(events)
    }

    fn dispatch(&self, events: &[AttendanceEvent]) {
        for event in events {
            self.notifier.notify(event);
        }
    }

    // --- Missing-Punch Exceptions ---

    pub fn request_missing_approval(&self, id: AttendanceId) -> EngineResult<AttendanceRecord> {
        let mut state = self.ledger.lock();
        let record = state.attendance_mut(id)?;
        if !record.is_missing_punch() {
            return Err(EngineError::Validation(format!(
                "Attendance {} has both punches; nothing to approve",
                id
            )));
        }
        if !matches!(
            record.missing_request_state,
            MissingRequestState::None | MissingRequestState::Rejected
        ) {
            return Err(EngineError::invalid_state(
                "request missing-punch approval",
                "none or rejected",
                record.missing_request_state,
            ));
        }
        record.missing_request_state = MissingRequestState::Pending;
        info!("Missing-punch approval requested: Attendance={}", id);
        Ok(record.clone())
    }

    /// pending -> approved. An unposted deduction on the record is cancelled since the
    /// absence is forgiven; a deduction already `deducted` stays for an explicit cancel.
    pub fn approve_missing(&self, id: AttendanceId, approver: &str) -> EngineResult<AttendanceRecord> {
        let now = self.clock.now();
        let mut state = self.ledger.lock();
        let record = state.attendance_mut(id)?;
        if record.missing_request_state != MissingRequestState::Pending {
            return Err(EngineError::invalid_state(
                "approve missing punch",
                MissingRequestState::Pending,
                record.missing_request_state,
            ));
        }
        record.missing_request_state = MissingRequestState::Approved;
        record.missing_approved_by = Some(approver.to_string());
        record.missing_approved_at = Some(now);
        let linked = record.deduction_id;

        if let Some(deduction_id) = linked {
            let open = matches!(
                state.deduction(deduction_id)?.state,
                DeductionState::Draft | DeductionState::Confirmed
            );
            if open {
                deduction::cancel(&mut state, deduction_id)?;
                info!(
                    "Deduction {} cancelled by missing-punch approval on attendance {}",
                    deduction_id, id
                );
            }
        }
        info!("Missing punch approved: Attendance={}, By={}", id, approver);
        Ok(state.attendance(id)?.clone())
    }

    pub fn reject_missing(&self, id: AttendanceId) -> EngineResult<AttendanceRecord> {
        let mut state = self.ledger.lock();
        let record = state.attendance_mut(id)?;
        if record.missing_request_state != MissingRequestState::Pending {
            return Err(EngineError::invalid_state(
                "reject missing punch",
                MissingRequestState::Pending,
                record.missing_request_state,
            ));
        }
        record.missing_request_state = MissingRequestState::Rejected;
        info!("Missing punch rejected: Attendance={}", id);
        Ok(record.clone())
    }

    // --- Overtime Actions ---

    pub fn recompute_overtime(&self, employee_id: &str, date: NaiveDate) -> EngineResult<Option<OvertimeRecord>> {
        let employee = self.employee(employee_id)?;
        let tz = self.tz_for(&employee);
        let category = day_category(self, employee_id, date);
        let mut state = self.ledger.lock();
        let id = overtime::recompute_day(&mut state, &employee, date, tz, category, self.config.standard_working_hours)?;
        id.map(|id| state.overtime(id).cloned()).transpose()
    }

    fn with_overtime<F>(&self, id: OvertimeId, action: F) -> EngineResult<OvertimeRecord>
    where
        F: FnOnce(&mut OvertimeRecord) -> EngineResult<()>,
    {
        let mut state = self.ledger.lock();
        let record = state.overtime_mut(id)?;
        action(record)?;
        info!("Overtime {} is now {}", id, record.state);
        Ok(record.clone())
    }

    pub fn submit_overtime(&self, id: OvertimeId) -> EngineResult<OvertimeRecord> {
        self.with_overtime(id, |record| record.submit())
    }

    pub fn approve_overtime(&self, id: OvertimeId, approver: &str) -> EngineResult<OvertimeRecord> {
        let now = self.clock.now();
        self.with_overtime(id, |record| record.approve(approver, now))
    }

    pub fn reject_overtime(&self, id: OvertimeId, reason: &str) -> EngineResult<OvertimeRecord> {
        self.with_overtime(id, |record| record.reject(reason))
    }

    pub fn mark_overtime_paid(&self, id: OvertimeId) -> EngineResult<OvertimeRecord> {
        self.with_overtime(id, |record| record.mark_paid())
    }

    /// Back to draft, then recomputed from the current attendance of that day.
    pub fn reset_overtime(&self, id: OvertimeId) -> EngineResult<Option<OvertimeRecord>> {
        let record = self.with_overtime(id, |record| record.reset_to_draft())?;
        self.recompute_overtime(&record.employee_id, record.date)
    }

    // --- Deduction Actions ---

    pub fn process_deduction(&self, attendance_id: AttendanceId) -> EngineResult<Option<LeaveDeduction>> {
        let mut state = self.ledger.lock();
        if let Some(existing) = state.deduction_for_attendance(attendance_id) {
            return Err(EngineError::conflict("Leave deduction", existing.id));
        }
        let record = state.attendance(attendance_id)?;
        let employee = self.employee(&record.employee_id)?;
        let Some(date) = record.local_date(self.tz_for(&employee)) else {
            return Ok(None);
        };
        let id = deduction::process_deduction(&mut state, attendance_id, date, &self.config)?;
        id.map(|id| state.deduction(id).cloned()).transpose()
    }

    fn with_deduction<F>(&self, id: DeductionId, action: F) -> EngineResult<LeaveDeduction>
    where
        F: FnOnce(&mut LedgerState, DeductionId) -> EngineResult<()>,
    {
        let mut state = self.ledger.lock();
        action(&mut *state, id)?;
        state.deduction(id).cloned()
    }

    pub fn confirm_deduction(&self, id: DeductionId) -> EngineResult<LeaveDeduction> {
        self.with_deduction(id, deduction::confirm)
    }

    pub fn deduct_leave(&self, id: DeductionId) -> EngineResult<LeaveDeduction> {
        self.with_deduction(id, deduction::deduct)
    }

    pub fn cancel_deduction(&self, id: DeductionId) -> EngineResult<LeaveDeduction> {
        self.with_deduction(id, deduction::cancel)
    }

    pub fn reset_deduction(&self, id: DeductionId) -> EngineResult<LeaveDeduction> {
        self.with_deduction(id, deduction::reset_to_draft)
    }

    // --- Queries ---

    pub fn attendance(&self, id: AttendanceId) -> EngineResult<AttendanceRecord> {
        self.ledger.lock().attendance(id).cloned()
    }

    pub fn overtime(&self, id: OvertimeId) -> EngineResult<OvertimeRecord> {
        self.ledger.lock().overtime(id).cloned()
    }

    pub fn overtime_for_day(&self, employee_id: &str, date: NaiveDate) -> Option<OvertimeRecord> {
        self.ledger.lock().overtime_for_day(employee_id, date).cloned()
    }

    pub fn deduction(&self, id: DeductionId) -> EngineResult<LeaveDeduction> {
        self.ledger.lock().deduction(id).cloned()
    }

    pub fn allocation(&self, id: AllocationId) -> EngineResult<LeaveAllocation> {
        self.ledger.lock().allocation(id).cloned()
    }

    /// Records of an employee touching the local `date`, ordered by id.
    pub fn attendances_on(&self, employee_id: &str, date: NaiveDate) -> EngineResult<Vec<AttendanceRecord>> {
        let tz = self.tz_for(&self.employee(employee_id)?);
        Ok(self
            .ledger
            .lock()
            .attendances_of(employee_id)
            .filter(|r| r.local_date(tz) == Some(date))
            .cloned()
            .collect())
    }

    pub fn report(&self, query: &ReportQuery) -> Report {
        let state = self.ledger.snapshot();
        let employees = self.employees();
        report::build_report(&state, &employees, |emp| self.tz_for(emp), query)
    }

    pub fn leave_summary(&self, employee_id: &str, year: i32) -> EngineResult<LeaveSummary> {
        self.employee(employee_id)?;
        Ok(report::leave_summary(&self.ledger.snapshot(), employee_id, year))
    }

    // --- Punch Import ---

    /// Applies a batch of punches. Per-day failures are counted and logged; the batch
    /// always runs to the end.
    pub fn import_punches(&self, request: ImportRequest) -> ImportReport {
        let mut report = ImportReport {
            total_punches: request.punches.len(),
            ..ImportReport::default()
        };
        let employees = self.employees();
        let watermark = match request.mode {
            ImportMode::Incremental => self.ledger.lock().watermark(&request.source_key),
            ImportMode::ForcedReload { .. } => None,
        };
        let tz_of = |employee_id: &str| -> Tz {
            request.device_tz.unwrap_or_else(|| {
                employees
                    .iter()
                    .find(|e| e.id == employee_id)
                    .map(|e| self.tz_for(e))
                    .unwrap_or_else(|| self.config.business_tz())
            })
        };

        let mut resolved = Vec::new();
        for punch in &request.punches {
            if watermark.map_or(false, |mark| punch.instant <= mark) {
                report.stale += 1;
                continue;
            }
            let Some(employee) = resolve_employee(&punch.identifier, &employees) else {
                warn!(
                    "Unmapped punch identifier '{}' at {}, skipping",
                    punch.identifier, punch.instant
                );
                report.skipped += 1;
                continue;
            };
            let local_date = punch.instant.with_timezone(&tz_of(&employee.id)).date_naive();
            if !request.mode.in_range(local_date) {
                report.stale += 1;
                continue;
            }
            resolved.push(ResolvedPunch {
                employee_id: employee.id.clone(),
                instant: punch.instant,
                punch_type: punch.punch_type,
            });
        }

        let mut failed_days: HashSet<(EmployeeId, NaiveDate)> = HashSet::new();
        for upsert in normalize(&resolved, &tz_of) {
            match self.apply_upsert(&request, &upsert, tz_of(&upsert.employee_id)) {
                Ok(outcome) => {
                    report.processed += 1;
                    report.removed += outcome.removed;
                    match outcome.kind {
                        UpsertKind::Created => report.created += 1,
                        UpsertKind::Updated => report.updated += 1,
                        UpsertKind::Unchanged => report.unchanged += 1,
                    }
                    self.dispatch(&outcome.events);
                }
                Err(e) => {
                    error!(
                        "Import failed: Emp={}, Date={}: {}",
                        upsert.employee_id, upsert.local_date, e
                    );
                    report.failed += 1;
                    report
                        .errors
                        .push(format!("{} on {}: {}", upsert.employee_id, upsert.local_date, e));
                    failed_days.insert((upsert.employee_id.clone(), upsert.local_date));
                }
            }
        }

        // The watermark stays below the oldest punch of any failed day so the next
        // incremental run picks that day up again.
        let day_of = |p: &ResolvedPunch| {
            let local_date = p.instant.with_timezone(&tz_of(&p.employee_id)).date_naive();
            (p.employee_id.clone(), local_date)
        };
        let retry_floor = resolved
            .iter()
            .filter(|p| failed_days.contains(&day_of(*p)))
            .map(|p| p.instant)
            .min();
        let newest = resolved
            .iter()
            .filter(|p| !failed_days.contains(&day_of(*p)))
            .map(|p| p.instant)
            .filter(|at| retry_floor.map_or(true, |floor| *at < floor))
            .max();

        let mut state = self.ledger.lock();
        if let Some(at) = newest {
            state.advance_watermark(&request.source_key, at);
        }
        report.watermark = state.watermark(&request.source_key);
        drop(state);

        info!(
            "Import finished: Source={}, Punches={}, Processed={}, Created={}, Updated={}, Removed={}, Failed={}, Skipped={}, Stale={}",
            request.source_key,
            report.total_punches,
            report.processed,
            report.created,
            report.updated,
            report.removed,
            report.failed,
            report.skipped,
            report.stale
        );
        report
    }

    /// Writes one employee-day under a single lock.
    ///
    /// Only records anchored on the upsert's local day are candidates, so an overnight
    /// session from the day before is never widened into this one.
    /// Incremental imports widen an existing record (earliest in, latest out). A forced
    /// reload overwrites the punches it carries, keeps the record holding a deduction if
    /// there is one, and drops other same-source records of that day.
    fn apply_upsert(&self, request: &ImportRequest, upsert: &AttendanceUpsert, tz: Tz) -> EngineResult<UpsertOutcome> {
        let employee = self.employee(&upsert.employee_id)?;
        let mut state = self.ledger.lock();

        let day: Vec<(AttendanceId, ImportSource, bool, Option<DateTime<Utc>>, Option<DateTime<Utc>>)> = state
            .attendances_of(&employee.id)
            .filter(|r| r.local_date(tz) == Some(upsert.local_date))
            .map(|r| {
                let has_deduction = r.deduction_id.is_some() || state.deduction_for_attendance(r.id).is_some();
                (r.id, r.import_source, has_deduction, r.check_in, r.check_out)
            })
            .collect();

        let forced = request.mode.is_forced();
        let target = day
            .iter()
            .find(|(_, _, has_deduction, _, _)| *has_deduction)
            .or_else(|| {
                if forced {
                    day.iter().find(|(_, source, _, _, _)| *source == request.source)
                } else {
                    day.first()
                }
            })
            .copied();

        let Some((target_id, _, _, old_in, old_out)) = target else {
            let id = state.insert_attendance(AttendanceRecord::new(
                0,
                &employee.id,
                upsert.check_in,
                upsert.check_out,
                request.source,
            ));
            let events = self.reconcile_locked(&mut state, id, &employee, None)?;
            debug!("Import created attendance: Id={}, Emp={}, Date={}", id, employee.id, upsert.local_date);
            return Ok(UpsertOutcome {
                kind: UpsertKind::Created,
                removed: 0,
                events,
            });
        };

        let (new_in, new_out) = if forced {
            (upsert.check_in.or(old_in), upsert.check_out.or(old_out))
        } else {
            (earliest(old_in, upsert.check_in), latest(old_out, upsert.check_out))
        };
        validate_punches(new_in, new_out)?;

        let duplicates: Vec<AttendanceId> = if forced {
            day.iter()
                .filter(|(id, source, has_deduction, _, _)| {
                    *id != target_id && *source == request.source && !*has_deduction
                })
                .map(|(id, ..)| *id)
                .collect()
        } else {
            Vec::new()
        };

        if new_in == old_in && new_out == old_out && duplicates.is_empty() {
            return Ok(UpsertOutcome {
                kind: UpsertKind::Unchanged,
                removed: 0,
                events: Vec::new(),
            });
        }

        let employee_tz = self.tz_for(&employee);
        let mut vacated_days = Vec::new();
        for id in &duplicates {
            let removed = state.remove_attendance(*id)?;
            vacated_days.extend(removed.check_in_local_date(employee_tz));
            info!(
                "Forced reload removed duplicate attendance: Id={}, Emp={}, Date={}",
                id, employee.id, upsert.local_date
            );
        }

        let previous_day = old_in.map(|at| at.with_timezone(&employee_tz).date_naive());
        let record = state.attendance_mut(target_id)?;
        record.check_in = new_in;
        record.check_out = new_out;
        record.missing_check_in = new_in.is_none() && new_out.is_some();
        let events = self.reconcile_locked(&mut state, target_id, &employee, previous_day)?;

        let current_day = state.attendance(target_id)?.check_in_local_date(employee_tz);
        for date in vacated_days {
            if Some(date) != current_day {
                let category = day_category(self, &employee.id, date);
                overtime::recompute_day(&mut state, &employee, date, employee_tz, category, self.config.standard_working_hours)?;
            }
        }

        Ok(UpsertOutcome {
            kind: UpsertKind::Updated,
            removed: duplicates.len(),
            events,
        })
    }

    // --- Scheduled Jobs ---

    /// Re-walks one local date: reconciles every record touching it, recomputes each
    /// employee's overtime and, with auto-process on, retries pending debits.
    pub fn run_daily(&self, date: NaiveDate) -> DailyRunReport {
        info!("Daily attendance run for {}", date);
        let mut report = DailyRunReport {
            date: Some(date),
            ..DailyRunReport::default()
        };
        let deductions_before = self.ledger.lock().deductions().count();

        for employee in self.employees().into_iter().filter(|e| e.active) {
            let tz = self.tz_for(&employee);
            let ids: Vec<AttendanceId> = self
                .ledger
                .lock()
                .attendances_of(&employee.id)
                .filter(|r| r.touches_local_date(date, tz))
                .map(|r| r.id)
                .collect();
            for id in ids {
                match self.reconcile(id) {
                    Ok(_) => report.reconciled += 1,
                    Err(e) => {
                        error!("Reconcile failed: Emp={}, Attendance={}: {}", employee.id, id, e);
                        report.failed += 1;
                        report.errors.push(format!("attendance {}: {}", id, e));
                    }
                }
            }
            match self.recompute_overtime(&employee.id, date) {
                Ok(Some(_)) => report.overtime_days += 1,
                Ok(None) => {}
                Err(e) => {
                    error!("Overtime failed: Emp={}, Date={}: {}", employee.id, date, e);
                    report.failed += 1;
                    report.errors.push(format!("overtime {} on {}: {}", employee.id, date, e));
                }
            }
        }
        report.deductions_created = self
            .ledger
            .lock()
            .deductions()
            .count()
            .saturating_sub(deductions_before);

        if self.config.auto_process_deductions {
            self.retry_pending_debits(&mut report);
        }
        info!(
            "Daily run for {} done: Reconciled={}, Overtime={}, NewDeductions={}, Debits={}, Failed={}",
            date, report.reconciled, report.overtime_days, report.deductions_created, report.debits_applied, report.failed
        );
        report
    }

    fn retry_pending_debits(&self, report: &mut DailyRunReport) {
        let pending: Vec<DeductionId> = self
            .ledger
            .lock()
            .deductions()
            .filter(|d| {
                d.state == DeductionState::Confirmed
                    && d.deduction_type.is_debitable()
                    && d.deduction_days() > rust_decimal::Decimal::ZERO
            })
            .map(|d| d.id)
            .collect();
        for id in pending {
            match self.deduct_leave(id) {
                Ok(_) => report.debits_applied += 1,
                Err(e) if e.is_recoverable() => {
                    warn!("Debit for deduction {} still pending: {}", id, e);
                }
                Err(e) => {
                    error!("Debit for deduction {} failed: {}", id, e);
                    report.failed += 1;
                    report.errors.push(format!("deduction {}: {}", id, e));
                }
            }
        }
    }

    /// Runs the daily job for each day of the back-window ending yesterday
    /// (business zone), oldest first.
    pub fn run_scheduled(&self) -> Vec<DailyRunReport> {
        let today = self
            .clock
            .now()
            .with_timezone(&self.config.business_tz())
            .date_naive();
        let days_back = u64::from(self.config.reprocess_days_back.max(1));
        (1..=days_back)
            .rev()
            .filter_map(|n| today.checked_sub_days(Days::new(n)))
            .map(|date| self.run_daily(date))
            .collect()
    }
}
