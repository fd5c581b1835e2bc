//! Attendance classification, overtime and leave-deduction engine.
//!
//! Punches come in through [`source::PunchSource`] or manual entry, land in the
//! in-memory [`store::Ledger`], and every write runs the reconcile pipeline in
//! [`engine::AttendanceEngine`].

pub mod classify;
pub mod config;
pub mod deduction;
pub mod engine;
pub mod error;
pub mod model;
pub mod notify;
pub mod overtime;
pub mod punch;
pub mod report;
pub mod schedule;
pub mod source;
pub mod store;


pub use config::EngineConfig;
pub use engine::{AttendanceEngine, Clock, DailyRunReport, FixedClock, NewAttendance, SystemClock};
pub use error::{EngineError, EngineResult};
pub use model::*;
pub use notify::{AttendanceEvent, EventKind, Notifier, RecordingNotifier, TracingNotifier};
pub use punch::{ImportMode, ImportReport, ImportRequest, PunchType, RawPunch};
pub use report::{GroupBy, LeaveSummary, Report, ReportQuery};
pub use schedule::{ScheduleWindow, WeeklyCalendar, WorkInterval};
pub use source::{CsvPunchSource, PunchSource, StaticPunchSource};
