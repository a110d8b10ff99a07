//! Step executors.
//!
//! A step's free-form `step_config` is parsed into a typed [`StepKind`]
//! before it runs. Executors write their result under the step namespace
//! (`steps.<id>.result`, or `.results` for multi-selections) and return the
//! updated context.

mod branch;
mod choice;
mod dice;
mod flow_call;
mod generation;
mod tables;

use grimoire_types::{Action, FlowStep, LlmSettings};
use indexmap::IndexMap;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Map as JsonMap, Value, json};
use tracing::{info, warn};

use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::FlowFrame;
use crate::resolve::render_text;

/// Namespace path holding one step's data.
pub(crate) fn namespace(step: &FlowStep) -> String {
    format!("steps.{}", step.id)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DiceRollConfig {
    #[serde(default)]
    pub roll: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct DiceSequenceConfig {
    #[serde(default)]
    pub sequence: Option<SequenceConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SequenceConfig {
    /// A list, or a template resolving to one.
    #[serde(default)]
    pub items: Value,
    #[serde(default)]
    pub roll: Option<Value>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TableRollConfig {
    #[serde(default)]
    pub tables: Vec<TableRollTarget>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct TableRollTarget {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct PlayerChoiceConfig {
    #[serde(default)]
    pub choices: Vec<Value>,
    #[serde(default)]
    pub choice_source: Option<ChoiceSource>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ChoiceSource {
    #[serde(default)]
    pub table: Option<String>,
    #[serde(default)]
    pub table_from_values: Option<String>,
    #[serde(default)]
    pub display_format: Option<String>,
    #[serde(default = "default_selection_count")]
    pub selection_count: usize,
}

fn default_selection_count() -> usize {
    1
}

/// One authored choice of a static `player_choice`.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct ChoiceOption {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub label: Option<Value>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(default)]
    pub next_step: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct NameGenerationConfig {
    #[serde(default)]
    pub settings: NameSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct NameSettings {
    #[serde(default)]
    pub corpus: Option<Value>,
    #[serde(default)]
    pub segmenter: Option<Value>,
    #[serde(default)]
    pub algorithm: Option<Value>,
    #[serde(default)]
    pub max_length: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct LlmGenerationConfig {
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub prompt_data: JsonMap<String, Value>,
    #[serde(default)]
    pub llm_settings: Option<LlmSettings>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct FlowCallConfig {
    #[serde(default)]
    pub flow_id: Option<String>,
    #[serde(default)]
    pub inputs: JsonMap<String, Value>,
    /// Sub-flow output id to parent context path.
    #[serde(default)]
    pub outputs: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct BranchConfig {
    #[serde(default, rename = "if")]
    pub condition: Option<Value>,
    #[serde(default)]
    pub then: Vec<Action>,
    #[serde(default, rename = "else")]
    pub otherwise: Option<ElseClause>,
}

/// `else` is either an action list or a nested `{if, then, else}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum ElseClause {
    Actions(Vec<Action>),
    Nested(Box<BranchConfig>),
}

/// Step type with its parsed configuration.
#[derive(Debug, Clone)]
pub(crate) enum StepKind {
    Completion,
    DiceRoll(DiceRollConfig),
    DiceSequence(DiceSequenceConfig),
    TableRoll(TableRollConfig),
    PlayerInput,
    PlayerChoice(PlayerChoiceConfig),
    NameGeneration(NameGenerationConfig),
    LlmGeneration(LlmGenerationConfig),
    FlowCall(FlowCallConfig),
    ConditionalBranch(BranchConfig),
    Unknown,
}

impl StepKind {
    pub(crate) fn parse(step: &FlowStep) -> Result<Self, FlowExecutionError> {
        let kind = match step.r#type.as_str() {
            "completion" => StepKind::Completion,
            "dice_roll" => StepKind::DiceRoll(config(step)?),
            "dice_sequence" => StepKind::DiceSequence(config(step)?),
            "table_roll" => StepKind::TableRoll(config(step)?),
            "player_input" => StepKind::PlayerInput,
            "player_choice" => StepKind::PlayerChoice(config(step)?),
            "name_generation" => StepKind::NameGeneration(config(step)?),
            "llm_generation" => StepKind::LlmGeneration(config(step)?),
            "flow_call" => StepKind::FlowCall(config(step)?),
            "conditional_branch" => StepKind::ConditionalBranch(config(step)?),
            _ => StepKind::Unknown,
        };
        Ok(kind)
    }

    /// `conditional_branch` runs the step's top-level actions itself.
    pub(crate) fn runs_own_actions(&self) -> bool {
        matches!(self, StepKind::ConditionalBranch(_))
    }
}

fn config<T: DeserializeOwned>(step: &FlowStep) -> Result<T, FlowExecutionError> {
    serde_json::from_value(Value::Object(step.step_config.clone())).map_err(|error| {
        FlowExecutionError::execution(format!("invalid {} configuration: {error}", step.r#type))
            .with_source(error)
            .at_step(&step.id)
    })
}

/// Dispatches `step` to its executor.
pub(crate) fn execute(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    kind: &StepKind,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    match kind {
        StepKind::Completion => Ok(context.set(&format!("{namespace}.result"), json!({"completed": true}))?),
        StepKind::DiceRoll(config) => dice::roll(frame, step, config, namespace, context),
        StepKind::DiceSequence(config) => dice::sequence(frame, step, config, namespace, context),
        StepKind::TableRoll(config) => tables::roll(frame, step, config, namespace, context),
        StepKind::PlayerInput => player_input(frame, step, namespace, context),
        StepKind::PlayerChoice(config) => choice::execute(frame, step, config, namespace, context),
        StepKind::NameGeneration(config) => generation::name(frame, config, namespace, context),
        StepKind::LlmGeneration(config) => generation::llm(frame, step, config, namespace, context),
        StepKind::FlowCall(config) => flow_call::execute(frame, step, config, namespace, context),
        StepKind::ConditionalBranch(config) => branch::execute(frame, step, config, context),
        StepKind::Unknown => {
            warn!(step_id = %step.id, step_type = %step.r#type, "unknown step type; skipping");
            Ok(context)
        }
    }
}

fn player_input(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let presented = presented_step(step, &context)?;
    let value = request_input(frame, &presented, &context)?;
    info!(step_id = %step.id, "player input received");
    Ok(context.set(&format!("{namespace}.result"), value)?)
}

/// Copy of `step` as shown to the player, with its prompt rendered.
pub(crate) fn presented_step(step: &FlowStep, context: &ExecutionContext) -> Result<FlowStep, FlowExecutionError> {
    let mut presented = step.clone();
    if let Some(prompt) = &step.prompt {
        presented.prompt = Some(render_text(&context.resolve_template(prompt)?));
    }
    Ok(presented)
}

/// Asks the host for input, failing when no input callback is registered.
pub(crate) fn request_input(frame: &FlowFrame<'_, '_>, step: &FlowStep, context: &ExecutionContext) -> Result<Value, FlowExecutionError> {
    match frame.callbacks.request_user_input(step, &context.snapshot()) {
        Some(Ok(value)) => Ok(value),
        Some(Err(error)) => Err(FlowExecutionError::user_input(format!("input callback failed: {error}")).with_source(error)),
        None => Err(FlowExecutionError::user_input(format!("{} steps require an on_user_input callback", step.r#type))),
    }
}

/// Error for a step config field that is absent or empty.
pub(crate) fn missing_field(step: &FlowStep, field: &str) -> FlowExecutionError {
    FlowExecutionError::missing_field(&step.id, field).with_message_prefix(&step.r#type)
}

/// Attaches a collaborator failure to the step that triggered it.
pub(crate) fn collaborator_failure(what: String, error: anyhow::Error) -> FlowExecutionError {
    FlowExecutionError::collaborator(format!("{what}: {error}"), error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::indexmap;

    fn step(value: Value) -> FlowStep {
        serde_json::from_value(value).expect("step fixture")
    }

    #[test]
    fn step_configs_parse_into_typed_kinds() {
        let kind = StepKind::parse(&step(json!({
            "id": "branch",
            "type": "conditional_branch",
            "if": "{{ variables.counter == 0 }}",
            "then": [{"set_value": {"path": "variables.counter", "value": 1}}],
            "else": {"if": "{{ true }}", "then": [{"log_message": "nested"}]}
        })))
        .expect("parse");
        let StepKind::ConditionalBranch(config) = kind else {
            panic!("expected a branch");
        };
        assert_eq!(config.then.len(), 1);
        assert!(matches!(config.otherwise, Some(ElseClause::Nested(_))));

        let kind = StepKind::parse(&step(json!({"id": "odd", "type": "teleport"}))).expect("parse");
        assert!(matches!(kind, StepKind::Unknown));
    }

    #[test]
    fn malformed_configs_name_the_step() {
        let error = StepKind::parse(&step(json!({
            "id": "call",
            "type": "flow_call",
            "outputs": ["not", "a", "mapping"]
        })))
        .unwrap_err();
        assert_eq!(error.step_id.as_deref(), Some("call"));
        assert!(error.message.contains("flow_call"));
    }

    #[test]
    fn flow_call_outputs_keep_their_authored_order() {
        let kind = StepKind::parse(&step(json!({
            "id": "call",
            "type": "flow_call",
            "flow_id": "forge",
            "inputs": {"metal": "{{ inputs.metal }}"},
            "outputs": {"blade": "variables.weapon", "cost": "variables.gold"}
        })))
        .expect("parse");
        let StepKind::FlowCall(config) = kind else {
            panic!("expected a flow call");
        };
        assert_eq!(config.flow_id.as_deref(), Some("forge"));
        assert_eq!(
            config.outputs,
            indexmap! {
                "blade".to_string() => "variables.weapon".to_string(),
                "cost".to_string() => "variables.gold".to_string(),
            }
        );
    }

    #[test]
    fn choice_sources_default_to_a_single_selection() {
        let kind = StepKind::parse(&step(json!({
            "id": "pick",
            "type": "player_choice",
            "choice_source": {"table": "weapons"}
        })))
        .expect("parse");
        let StepKind::PlayerChoice(config) = kind else {
            panic!("expected a choice");
        };
        assert_eq!(config.choice_source.map(|source| source.selection_count), Some(1));
    }
}
