//! `conditional_branch`.

use grimoire_types::{Action, FlowStep};
use serde_json::Value;
use tracing::debug;

use super::{BranchConfig, ElseClause, missing_field};
use crate::actions::run_actions;
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::FlowFrame;
use crate::resolve::is_truthy;

/// Runs the matching branch, then the step's own top-level actions.
pub(super) fn execute(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &BranchConfig,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let context = evaluate(frame, step, config, context)?;
    if step.actions.is_empty() {
        return Ok(context);
    }
    debug!(step_id = %step.id, count = step.actions.len(), "running branch step actions");
    run_actions(frame, &step.actions, context)
}

fn evaluate(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &BranchConfig,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let condition = config
        .condition
        .as_ref()
        .filter(|condition| !condition.is_null())
        .ok_or_else(|| missing_field(step, "if"))?;
    let taken = match condition {
        Value::String(expression) if expression.trim().is_empty() => return Err(missing_field(step, "if")),
        Value::String(expression) => context.evaluate_condition(expression).map_err(|error| {
            FlowExecutionError::from(error).with_message_prefix(&format!("cannot evaluate condition '{expression}'"))
        })?,
        other => is_truthy(other),
    };
    debug!(step_id = %step.id, taken, "branch condition evaluated");

    if taken {
        return run_branch(frame, &config.then, context);
    }
    match &config.otherwise {
        None => Ok(context),
        Some(ElseClause::Actions(actions)) => run_branch(frame, actions, context),
        Some(ElseClause::Nested(nested)) => evaluate(frame, step, nested, context),
    }
}

fn run_branch(frame: &FlowFrame<'_, '_>, actions: &[Action], context: ExecutionContext) -> Result<ExecutionContext, FlowExecutionError> {
    if actions.is_empty() {
        return Ok(context);
    }
    run_actions(frame, actions, context)
}
