//! Actions that read or write context values.

use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::Notice;
use crate::context::{ExecutionContext, SlotState};
use crate::error::FlowExecutionError;
use crate::field_paths::split_path;
use crate::orchestrator::FlowFrame;
use crate::resolve::render_text;

fn resolve_path(context: &ExecutionContext, path: &str) -> Result<String, FlowExecutionError> {
    Ok(render_text(&context.resolve_template(path)?).trim().to_string())
}

pub(super) fn set_value(
    frame: &FlowFrame<'_, '_>,
    context: &ExecutionContext,
    path: &str,
    value: &Value,
) -> Result<ExecutionContext, FlowExecutionError> {
    let path = resolve_path(context, path)?;
    let value = context.resolve_value(value)?;
    debug!(path = %path, "setting value");
    frame.store(context, &path, value)
}

/// Exchanges two stored values without coercion. Absent values swap as null.
pub(super) fn swap_values(context: &ExecutionContext, first: &str, second: &str) -> Result<ExecutionContext, FlowExecutionError> {
    let first = resolve_path(context, first)?;
    let second = resolve_path(context, second)?;
    let first_value = context.get(&first).unwrap_or(Value::Null);
    let second_value = context.get(&second).unwrap_or(Value::Null);
    let swapped = context.set(&first, second_value)?.set(&second, first_value)?;
    info!(first = %first, second = %second, "swapped values");
    Ok(swapped)
}

pub(super) fn display_value(context: &ExecutionContext, path: &str, notices: &mut Vec<Notice>) -> Result<(), FlowExecutionError> {
    let path = resolve_path(context, path)?;
    let message = match context.get(&path) {
        Some(value) => {
            let message = format!("{path}: {}", render_text(&value));
            info!(message = %message, "display value");
            message
        }
        None => {
            let message = format!("Cannot display: path not found: {path}");
            warn!(path = %path, "cannot display missing path");
            message
        }
    };
    notices.push(Notice::new("display_value", json!({"message": message})));
    Ok(())
}

/// Strictly instantiates the model mapping at `path` and marks it validated.
pub(super) fn validate_value(
    frame: &FlowFrame<'_, '_>,
    context: &ExecutionContext,
    path: &str,
) -> Result<ExecutionContext, FlowExecutionError> {
    let path = resolve_path(context, path)?;
    let value = context
        .get(&path)
        .ok_or_else(|| FlowExecutionError::validation(format!("cannot validate: path not found: {path}")))?;
    let Some(model) = value.get("model").and_then(Value::as_str).map(str::to_string) else {
        debug!(path = %path, "no model key; nothing to validate");
        return Ok(context.clone());
    };
    frame.instantiator().instantiate(&model, &value)?;
    debug!(path = %path, model = %model, "validation passed");
    if split_path(&path).len() == 2 {
        return Ok(context.retag(&path, SlotState::Validated { model })?);
    }
    Ok(context.clone())
}
