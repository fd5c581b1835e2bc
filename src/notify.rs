use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::model::{AttendanceId, EmployeeId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    LateArrival,
    EarlyDeparture,
    MissingCheckOut,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceEvent {
    pub kind: EventKind,
    pub employee_id: EmployeeId,
    pub date: NaiveDate,
    pub attendance_id: AttendanceId,
    pub minutes: Decimal,
}

/// Receives attendance events after a reconcile pass. Delivery must not fail the pass.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &AttendanceEvent);
}

/// Default notifier: writes events to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, event: &AttendanceEvent) {
        match event.kind {
            EventKind::LateArrival => info!(
                "Late arrival: Emp={}, Date={}, Minutes={}, Attendance={}",
                event.employee_id, event.date, event.minutes, event.attendance_id
            ),
            EventKind::EarlyDeparture => info!(
                "Early departure: Emp={}, Date={}, Minutes={}, Attendance={}",
                event.employee_id, event.date, event.minutes, event.attendance_id
            ),
            EventKind::MissingCheckOut => warn!(
                "Missing check-out: Emp={}, Date={}, Attendance={}",
                event.employee_id, event.date, event.attendance_id
            ),
        }
    }
}

/// Keeps every event in memory; used by tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    sent: Arc<Mutex<Vec<AttendanceEvent>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AttendanceEvent> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &AttendanceEvent) {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}
