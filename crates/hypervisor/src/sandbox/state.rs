//! State machine bookkeeping for a single [`VMInstance`], isolated
//! from the manager's table locking and event emission.

use chrono::Utc;
use hv_types::error::{HvError, HvResult};
use hv_types::vm::{VMInstance, VMState};

/// Apply `next` to `instance` if legal per [`VMState::can_transition_to`],
/// stamping `started_at`/`stopped_at` where the state machine implies
/// them. Returns the previous state.
pub(crate) fn transition(instance: &mut VMInstance, next: VMState) -> HvResult<VMState> {
    let prev = instance.state;
    if !prev.can_transition_to(next) {
        return Err(HvError::invalid_state(format!(
            "vm {} cannot transition from {prev:?} to {next:?}",
            instance.vm_id
        )));
    }
    instance.state = next;
    match next {
        VMState::Running if prev == VMState::Creating => {
            instance.started_at = Some(Utc::now());
        }
        VMState::Stopped => {
            instance.stopped_at = Some(Utc::now());
        }
        _ => {}
    }
    Ok(prev)
}

/// Force a transition to `error`, recording `message`. Used on boot
/// timeout and other recoverable faults.
pub(crate) fn mark_error(instance: &mut VMInstance, message: String) -> HvResult<VMState> {
    let prev = transition(instance, VMState::Error)?;
    instance.error_message = Some(message);
    Ok(prev)
}
