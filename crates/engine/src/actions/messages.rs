//! `log_message`, `display_message`, and `log_event`.

use serde_json::{Value, json};
use tracing::info;

use super::Notice;
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::resolve::render_text;

fn render_message(context: &ExecutionContext, message: &Value) -> Result<String, FlowExecutionError> {
    let resolved = context.resolve_value(message)?;
    Ok(render_text(&resolved))
}

pub(super) fn log_message(context: &ExecutionContext, message: &Value) -> Result<(), FlowExecutionError> {
    let message = render_message(context, message)?;
    info!(message = %message, "flow log");
    Ok(())
}

pub(super) fn display_message(context: &ExecutionContext, message: &Value, notices: &mut Vec<Notice>) -> Result<(), FlowExecutionError> {
    let message = render_message(context, message)?;
    info!(message = %message, "display");
    notices.push(Notice::new("display_message", json!({"message": message})));
    Ok(())
}

pub(super) fn log_event(context: &ExecutionContext, event_type: &Value, data: &Value) -> Result<(), FlowExecutionError> {
    let event_type = render_text(&context.resolve_value(event_type)?);
    let data = context.resolve_value(data)?;
    info!(target: "grimoire::flow_event", event_type = %event_type, data = %data, "flow event");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_message_renders_templates_into_a_notice() {
        let context = ExecutionContext::new().set("variables.name", json!("Aria")).expect("set");
        let mut notices = Vec::new();
        display_message(&context, &json!("Welcome, {{ variables.name }}!"), &mut notices).expect("display");
        assert_eq!(notices, vec![Notice::new("display_message", json!({"message": "Welcome, Aria!"}))]);
    }

    #[test]
    fn malformed_templates_fail() {
        let context = ExecutionContext::new();
        assert!(log_message(&context, &json!("{{ 1 + }}")).is_err());
        assert!(log_event(&context, &json!("roll"), &json!({"total": "{{ ( }}"})).is_err());
    }
}
