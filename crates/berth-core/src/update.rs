//! Update flow.
//!
//! A restricted convergence pass for the already-provisioned case: sync the
//! code, sync the dependencies, make sure the unit is registered, then
//! restart. The restart is unconditional — there is no change-detection
//! gate deciding whether it is needed. That keeps the flow a single
//! predictable shape at the cost of one cheap restart when nothing changed.

use crate::channel::Channel;
use crate::config::DesiredState;
use crate::converge::{run_plan, Confirmation, ConvergenceReport, UPDATE_PLAN};
use crate::discovery::StateSnapshot;

pub fn update(
    channel: &dyn Channel,
    snapshot: &StateSnapshot,
    desired: &DesiredState,
    _confirmation: Confirmation,
) -> ConvergenceReport {
    run_plan(channel, snapshot, desired, UPDATE_PLAN)
}
