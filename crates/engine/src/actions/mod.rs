//! Action parsing and dispatch.
//!
//! Actions run in declaration order against the context produced by the
//! previous action. A parallel batch instead runs every action against the
//! same base context and merges the leaf-level writes afterwards.

mod messages;
mod values;

use grimoire_types::Action;
use serde_json::Value;
use tracing::{debug, warn};

use crate::context::ExecutionContext;
use crate::error::{ErrorKind, FlowExecutionError};
use crate::orchestrator::FlowFrame;

/// Parsed action payload.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ActionKind {
    SetValue { path: String, value: Value },
    SwapValues { first: String, second: String },
    LogMessage { message: Value },
    DisplayMessage { message: Value },
    LogEvent { event_type: Value, data: Value },
    DisplayValue { path: String },
    ValidateValue { path: String },
    Unknown,
}

impl ActionKind {
    pub(crate) fn parse(action: &Action) -> Result<Self, FlowExecutionError> {
        let action_type = action.action_type.as_str();
        let payload = &action.payload;
        let kind = match action_type {
            "set_value" => ActionKind::SetValue {
                path: required_text(action_type, payload, "path")?,
                value: payload
                    .get("value")
                    .cloned()
                    .ok_or_else(|| missing(action_type, "value"))?,
            },
            "swap_values" => ActionKind::SwapValues {
                first: required_text(action_type, payload, "path1")?,
                second: required_text(action_type, payload, "path2")?,
            },
            "log_message" => ActionKind::LogMessage {
                message: message_of(payload),
            },
            "display_message" => ActionKind::DisplayMessage {
                message: message_of(payload),
            },
            "log_event" => ActionKind::LogEvent {
                event_type: payload.get("type").cloned().unwrap_or_else(|| Value::String("unknown".to_string())),
                data: payload.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default())),
            },
            "display_value" => ActionKind::DisplayValue {
                path: path_of(action_type, payload)?,
            },
            "validate_value" => ActionKind::ValidateValue {
                path: path_of(action_type, payload)?,
            },
            _ => ActionKind::Unknown,
        };
        Ok(kind)
    }

    /// Display actions deliver their own UI callback.
    fn reports_itself(&self) -> bool {
        matches!(self, ActionKind::DisplayMessage { .. } | ActionKind::DisplayValue { .. })
    }
}

/// A deferred `on_action_execute` notification.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Notice {
    pub action_type: String,
    pub data: Value,
}

impl Notice {
    pub(crate) fn new(action_type: impl Into<String>, data: Value) -> Self {
        Self {
            action_type: action_type.into(),
            data,
        }
    }
}

/// Runs `actions` in order, firing callbacks after each one.
pub(crate) fn run_actions(
    frame: &FlowFrame<'_, '_>,
    actions: &[Action],
    mut context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    for action in actions {
        let mut notices = Vec::new();
        if let Some(next) = execute_action(frame, action, &context, &mut notices)? {
            context = next;
        }
        emit(frame, &notices);
    }
    Ok(context)
}

/// Runs `actions` as one batch against `base` and merges their writes in
/// declaration order. Callbacks fire after the merge.
pub(crate) fn run_actions_parallel(
    frame: &FlowFrame<'_, '_>,
    actions: &[Action],
    base: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    debug!(count = actions.len(), "executing actions as a batch");
    let mut changes = Vec::new();
    let mut notices = Vec::new();
    for action in actions {
        if let Some(next) = execute_action(frame, action, &base, &mut notices)? {
            changes.extend(next.changes_since(&base));
        }
    }
    let merged = base.apply_changes(&changes)?;
    emit(frame, &notices);
    Ok(merged)
}

fn execute_action(
    frame: &FlowFrame<'_, '_>,
    action: &Action,
    context: &ExecutionContext,
    notices: &mut Vec<Notice>,
) -> Result<Option<ExecutionContext>, FlowExecutionError> {
    let action_type = action.action_type.as_str();
    debug!(action_type = %action_type, "executing action");
    let kind = ActionKind::parse(action)?;
    let outcome = match &kind {
        ActionKind::SetValue { path, value } => values::set_value(frame, context, path, value).map(Some),
        ActionKind::SwapValues { first, second } => values::swap_values(context, first, second).map(Some),
        ActionKind::LogMessage { message } => messages::log_message(context, message).map(|_| None),
        ActionKind::DisplayMessage { message } => messages::display_message(context, message, notices).map(|_| None),
        ActionKind::LogEvent { event_type, data } => messages::log_event(context, event_type, data).map(|_| None),
        ActionKind::DisplayValue { path } => values::display_value(context, path, notices).map(|_| None),
        ActionKind::ValidateValue { path } => values::validate_value(frame, context, path).map(Some),
        ActionKind::Unknown => {
            warn!(action_type = %action_type, "unknown action type; skipping");
            return Ok(None);
        }
    };
    let next = outcome.map_err(|error| error.with_message_prefix(&format!("action '{action_type}' failed")))?;
    if !kind.reports_itself() {
        notices.push(Notice::new(action_type, action.payload.clone()));
    }
    Ok(next)
}

fn emit(frame: &FlowFrame<'_, '_>, notices: &[Notice]) {
    for notice in notices {
        frame.callbacks.action_executed(&notice.action_type, &notice.data);
    }
}

fn missing(action_type: &str, field: &str) -> FlowExecutionError {
    FlowExecutionError::new(ErrorKind::MissingRequiredField, format!("{action_type} requires '{field}'"))
}

fn required_text(action_type: &str, payload: &Value, field: &str) -> Result<String, FlowExecutionError> {
    match payload.get(field) {
        Some(Value::String(text)) if !text.trim().is_empty() => Ok(text.trim().to_string()),
        _ => Err(missing(action_type, field)),
    }
}

/// A bare string or `{path: ...}`.
fn path_of(action_type: &str, payload: &Value) -> Result<String, FlowExecutionError> {
    match payload {
        Value::String(path) if !path.trim().is_empty() => Ok(path.trim().to_string()),
        Value::Object(_) => required_text(action_type, payload, "path"),
        _ => Err(missing(action_type, "path")),
    }
}

/// A bare string or `{message: ...}`.
fn message_of(payload: &Value) -> Value {
    match payload {
        Value::Object(fields) => fields.get("message").cloned().unwrap_or_else(|| Value::String(String::new())),
        other => other.clone(),
    }
}
