//! Host callbacks invoked while a flow runs.

use std::fmt;

use grimoire_types::FlowStep;
use serde_json::Value;

type NotifyFn<'a> = Box<dyn Fn(&str, &Value) + 'a>;
type UserInputFn<'a> = Box<dyn Fn(&FlowStep, &Value) -> anyhow::Result<Value> + 'a>;

/// Optional hooks for UI integration. Every hook is optional; a flow that
/// needs player input fails when `on_user_input` is missing.
///
/// ```rust
/// use grimoire_engine::FlowCallbacks;
/// use serde_json::json;
///
/// let callbacks = FlowCallbacks::new()
///     .on_step_complete(|step_id, payload| println!("{step_id}: {payload}"))
///     .on_user_input(|_step, _snapshot| Ok(json!("wizard")));
/// assert!(callbacks.has_user_input());
/// ```
#[derive(Default)]
pub struct FlowCallbacks<'a> {
    step_complete: Option<NotifyFn<'a>>,
    action_execute: Option<NotifyFn<'a>>,
    user_input: Option<UserInputFn<'a>>,
}

impl fmt::Debug for FlowCallbacks<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowCallbacks")
            .field("on_step_complete", &self.step_complete.is_some())
            .field("on_action_execute", &self.action_execute.is_some())
            .field("on_user_input", &self.user_input.is_some())
            .finish()
    }
}

impl<'a> FlowCallbacks<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called once per step with `{step_id, step_type, result?, skipped?}`.
    pub fn on_step_complete(mut self, callback: impl Fn(&str, &Value) + 'a) -> Self {
        self.step_complete = Some(Box::new(callback));
        self
    }

    /// Called once per executed action with the action type and its data.
    pub fn on_action_execute(mut self, callback: impl Fn(&str, &Value) + 'a) -> Self {
        self.action_execute = Some(Box::new(callback));
        self
    }

    /// Asked for player input with the step (including generated choices)
    /// and a snapshot of the context.
    pub fn on_user_input(mut self, callback: impl Fn(&FlowStep, &Value) -> anyhow::Result<Value> + 'a) -> Self {
        self.user_input = Some(Box::new(callback));
        self
    }

    pub fn has_user_input(&self) -> bool {
        self.user_input.is_some()
    }

    pub(crate) fn step_completed(&self, step_id: &str, payload: &Value) {
        if let Some(callback) = &self.step_complete {
            callback(step_id, payload);
        }
    }

    pub(crate) fn action_executed(&self, action_type: &str, data: &Value) {
        if let Some(callback) = &self.action_execute {
            callback(action_type, data);
        }
    }

    /// `None` when no input callback is registered.
    pub(crate) fn request_user_input(&self, step: &FlowStep, snapshot: &Value) -> Option<anyhow::Result<Value>> {
        self.user_input.as_ref().map(|callback| callback(step, snapshot))
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use serde_json::json;

    #[test]
    fn registered_callbacks_receive_events() {
        let seen = RefCell::new(Vec::new());
        let callbacks = FlowCallbacks::new()
            .on_step_complete(|step_id, _| seen.borrow_mut().push(format!("step:{step_id}")))
            .on_action_execute(|action_type, _| seen.borrow_mut().push(format!("action:{action_type}")));

        callbacks.step_completed("roll", &json!({}));
        callbacks.action_executed("set_value", &json!({}));
        assert!(callbacks.request_user_input(&FlowStep::default(), &json!({})).is_none());
        drop(callbacks);
        assert_eq!(seen.into_inner(), vec!["step:roll", "action:set_value"]);
    }
}
