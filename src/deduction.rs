use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::cmp::Reverse;
use tracing::{info, warn};

use crate::classify::chargeable_late_minutes;
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::model::*;
use crate::store::LedgerState;

/// What `plan_deduction` decided a record is owed.
#[derive(Debug, Clone, PartialEq)]
pub struct DeductionPlan {
    pub deduction_type: DeductionType,
    pub late_minutes: Decimal,
    pub early_minutes: Decimal,
}

/// Decides whether a classified record should carry a leave deduction.
pub fn plan_deduction(record: &AttendanceRecord, grace_period_minutes: Decimal) -> Option<DeductionPlan> {
    if record.deduction_id.is_some() {
        return None;
    }
    let missing_punch = record.missing_check_in || record.check_out.is_none();
    if missing_punch && record.missing_request_state == MissingRequestState::Approved {
        return None;
    }

    let late = if record.scheduled_check_in.is_some() {
        chargeable_late_minutes(record.late_minutes, grace_period_minutes)
    } else {
        Decimal::ZERO
    };
    let early = if record.scheduled_check_out.is_some() && record.check_out.is_some() {
        record.early_minutes.max(Decimal::ZERO)
    } else {
        Decimal::ZERO
    };

    let plan = |deduction_type: DeductionType, late_minutes: Decimal, early_minutes: Decimal| DeductionPlan {
        deduction_type,
        late_minutes,
        early_minutes,
    };

    match record.status {
        AttendanceStatus::MissingOut | AttendanceStatus::LateMissingOut => Some(if late > Decimal::ZERO {
            plan(DeductionType::LateIn, late, Decimal::ZERO)
        } else {
            plan(DeductionType::MissingOut, Decimal::ZERO, Decimal::ZERO)
        }),
        AttendanceStatus::MissingIn | AttendanceStatus::EarlyMissingIn => Some(if early > Decimal::ZERO {
            plan(DeductionType::EarlyOut, Decimal::ZERO, early)
        } else {
            plan(DeductionType::MissingIn, Decimal::ZERO, Decimal::ZERO)
        }),
        AttendanceStatus::LateIn | AttendanceStatus::EarlyOut | AttendanceStatus::BothIssues => {
            match (late > Decimal::ZERO, early > Decimal::ZERO) {
                (true, true) => Some(plan(DeductionType::Both, late, early)),
                (true, false) => Some(plan(DeductionType::LateIn, late, Decimal::ZERO)),
                (false, true) => Some(plan(DeductionType::EarlyOut, Decimal::ZERO, early)),
                (false, false) => None,
            }
        }
        AttendanceStatus::Normal | AttendanceStatus::Overtime => None,
    }
}

/// Creates the deduction an attendance record is owed, if any, and links it.
///
/// With auto-confirm on the new deduction is confirmed straight away. A debit that
/// fails during auto-confirm leaves it `confirmed` and is only logged.
pub fn process_deduction(
    state: &mut LedgerState,
    attendance_id: AttendanceId,
    date: NaiveDate,
    config: &EngineConfig,
) -> EngineResult<Option<DeductionId>> {
    let record = state.attendance(attendance_id)?;
    let Some(plan) = plan_deduction(record, config.grace_period_minutes) else {
        return Ok(None);
    };
    let deduction = LeaveDeduction {
        id: 0,
        employee_id: record.employee_id.clone(),
        date,
        attendance_id,
        deduction_type: plan.deduction_type,
        late_minutes: plan.late_minutes,
        early_minutes: plan.early_minutes,
        grace_period_minutes: config.grace_period_minutes,
        state: DeductionState::Draft,
        allocation_id: None,
    };
    let days = deduction.deduction_days();
    let id = state.insert_deduction(deduction)?;
    state.attendance_mut(attendance_id)?.deduction_id = Some(id);
    info!(
        "Leave deduction created: Id={}, Attendance={}, Date={}, Type={}, Days={}",
        id, attendance_id, date, plan.deduction_type, days
    );

    if config.auto_confirm_deductions {
        if let Err(e) = confirm(state, id) {
            warn!("Auto-confirm of deduction {} did not complete: {}", id, e);
        }
    }
    Ok(Some(id))
}

/// draft -> confirmed. Late/early types are debited immediately; an error from the
/// debit is returned with the deduction left `confirmed`.
pub fn confirm(state: &mut LedgerState, id: DeductionId) -> EngineResult<()> {
    let deduction = state.deduction_mut(id)?;
    if deduction.state != DeductionState::Draft {
        return Err(EngineError::invalid_state(
            "confirm deduction",
            DeductionState::Draft,
            deduction.state,
        ));
    }
    deduction.state = DeductionState::Confirmed;
    let debitable = deduction.deduction_type.is_debitable();
    info!("Leave deduction confirmed: Id={}", id);
    if debitable {
        deduct(state, id)?;
    }
    Ok(())
}

/// Picks the allocation to charge: a validated fixed allocation covering the date,
/// else any validated allocation with balance left. Newest first in both passes.
pub fn find_allocation(state: &LedgerState, employee_id: &str, date: NaiveDate) -> Option<AllocationId> {
    let mut candidates: Vec<&LeaveAllocation> = state
        .allocations_of(employee_id)
        .filter(|a| a.validated && a.number_of_days > Decimal::ZERO)
        .collect();
    candidates.sort_by_key(|a| (Reverse(a.date_from), a.id));

    candidates
        .iter()
        .find(|a| a.allocation_type == AllocationType::Fixed && a.covers(date))
        .or_else(|| candidates.first())
        .map(|a| a.id)
}

/// confirmed -> deducted, debiting the allocation once.
pub fn deduct(state: &mut LedgerState, id: DeductionId) -> EngineResult<()> {
    let deduction = state.deduction(id)?;
    if deduction.state != DeductionState::Confirmed {
        return Err(EngineError::invalid_state(
            "deduct leave",
            DeductionState::Confirmed,
            deduction.state,
        ));
    }
    let days = deduction.deduction_days();
    if days <= Decimal::ZERO {
        return Err(EngineError::Validation("No days to deduct".into()));
    }
    let (employee_id, date) = (deduction.employee_id.clone(), deduction.date);

    let allocation_id = find_allocation(state, &employee_id, date).ok_or_else(|| {
        EngineError::NotFound(format!("suitable leave allocation for {}", employee_id))
    })?;
    let allocation = state.allocation_mut(allocation_id)?;
    if allocation.number_of_days < days {
        return Err(EngineError::InsufficientBalance {
            available: allocation.number_of_days,
            required: days,
        });
    }
    allocation.number_of_days -= days;
    let remaining = allocation.number_of_days;

    let deduction = state.deduction_mut(id)?;
    deduction.state = DeductionState::Deducted;
    deduction.allocation_id = Some(allocation_id);
    info!(
        "Deducted {} days for {} on {}: Deduction={}, Allocation={}, Remaining={}",
        days, employee_id, date, id, allocation_id, remaining
    );
    Ok(())
}

/// Any state -> cancelled. A deducted deduction gives its days back to the same allocation.
pub fn cancel(state: &mut LedgerState, id: DeductionId) -> EngineResult<()> {
    let deduction = state.deduction(id)?;
    let restore = match (deduction.state, deduction.allocation_id) {
        (DeductionState::Deducted, Some(allocation_id)) => {
            Some((allocation_id, deduction.deduction_days()))
        }
        _ => None,
    };
    if let Some((allocation_id, days)) = restore {
        state.allocation_mut(allocation_id)?.number_of_days += days;
        info!(
            "Restored {} days to allocation {}: cancelled deduction {}",
            days, allocation_id, id
        );
    }
    state.deduction_mut(id)?.state = DeductionState::Cancelled;
    Ok(())
}

/// cancelled -> draft.
pub fn reset_to_draft(state: &mut LedgerState, id: DeductionId) -> EngineResult<()> {
    let deduction = state.deduction_mut(id)?;
    if deduction.state != DeductionState::Cancelled {
        return Err(EngineError::invalid_state(
            "reset deduction",
            DeductionState::Cancelled,
            deduction.state,
        ));
    }
    deduction.state = DeductionState::Draft;
    deduction.allocation_id = None;
    Ok(())
}
