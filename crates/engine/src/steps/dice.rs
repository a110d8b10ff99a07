//! `dice_roll` and `dice_sequence`.

use grimoire_types::FlowStep;
use serde_json::Value;
use tracing::{debug, info};

use super::{DiceRollConfig, DiceSequenceConfig, collaborator_failure, missing_field};
use crate::actions::run_actions;
use crate::collaborators::DiceRoll;
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::FlowFrame;
use crate::resolve::render_text;

/// Resolves a roll expression and hands it to the dice roller.
pub(super) fn roll_expression(frame: &FlowFrame<'_, '_>, context: &ExecutionContext, expression: &Value) -> Result<DiceRoll, FlowExecutionError> {
    let expression = render_text(&context.resolve_value(expression)?);
    let expression = expression.trim();
    let roll = frame
        .engine
        .dice
        .roll(expression)
        .map_err(|error| collaborator_failure(format!("dice roll '{expression}' failed"), error))?;
    debug!(expression = %expression, total = roll.total, "rolled dice");
    Ok(roll)
}

fn present(value: &Option<Value>) -> Option<&Value> {
    value.as_ref().filter(|value| !value.is_null() && value.as_str().is_none_or(|text| !text.trim().is_empty()))
}

pub(super) fn roll(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &DiceRollConfig,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let expression = present(&config.roll).ok_or_else(|| missing_field(step, "roll"))?;
    let roll = roll_expression(frame, &context, expression)?;
    info!(step_id = %step.id, total = roll.total, detail = %roll.detail, "dice rolled");
    Ok(context.set(&format!("{namespace}.result"), roll.summary())?)
}

/// Rolls once per item, exposing `item` and `result` to the sequence actions.
pub(super) fn sequence(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &DiceSequenceConfig,
    namespace: &str,
    mut context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let sequence = config.sequence.as_ref().ok_or_else(|| missing_field(step, "sequence"))?;
    let items = match &sequence.items {
        Value::String(template) => context.resolve_template(template)?,
        other => other.clone(),
    };
    let items = match items {
        Value::Array(items) if !items.is_empty() => items,
        _ => return Err(missing_field(step, "sequence.items")),
    };
    let expression = present(&sequence.roll).ok_or_else(|| missing_field(step, "sequence.roll"))?;

    debug!(step_id = %step.id, count = items.len(), "rolling dice sequence");
    for item in items {
        context = context.set(&format!("{namespace}.item"), item.clone())?.set("item", item)?;
        let roll = roll_expression(frame, &context, expression)?;
        let summary = roll.summary();
        context = context
            .set(&format!("{namespace}.result"), summary.clone())?
            .set("result", summary)?;
        context = run_actions(frame, &sequence.actions, context)?;
    }
    Ok(context)
}
