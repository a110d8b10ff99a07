//! Flow, step, and action records.

use std::fmt;

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value};

/// A named, ordered sequence of steps describing a content-generation workflow.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FlowDefinition {
    /// Canonical identifier used by the orchestrator and by `flow_call` steps.
    pub id: String,
    /// Optional human-readable title.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Declared inputs, validated and coerced before any step runs.
    #[serde(default)]
    pub inputs: Vec<FlowField>,
    /// Declared outputs; every id starts out as `null`.
    #[serde(default)]
    pub outputs: Vec<FlowField>,
    /// Flow-local variables; every id starts out as `null`.
    #[serde(default)]
    pub variables: Vec<FlowField>,
    /// Ordered steps. Execution starts at index zero.
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    /// Step ids where an interrupted run may be resumed by a host.
    #[serde(default)]
    pub resume_points: Vec<String>,
}

impl FlowDefinition {
    /// Finds the position of a step by id.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|step| step.id == step_id)
    }

    /// Finds a declared input, output, or variable by namespace and id.
    pub fn declared_field(&self, namespace: &str, field_id: &str) -> Option<&FlowField> {
        let fields = match namespace {
            "inputs" => &self.inputs,
            "outputs" => &self.outputs,
            "variables" => &self.variables,
            _ => return None,
        };
        fields.iter().find(|field| field.id == field_id)
    }

    /// Returns true when any input, output, or variable uses `field_id`.
    pub fn declares_id(&self, field_id: &str) -> bool {
        self.inputs
            .iter()
            .chain(self.outputs.iter())
            .chain(self.variables.iter())
            .any(|field| field.id == field_id)
    }
}

/// A declared flow input, output, or variable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FlowField {
    /// Identifier used within the flow namespaces.
    pub id: String,
    /// Declared type: a primitive (`str`, `int`, `float`, `bool`) or a model id.
    #[serde(rename = "type")]
    pub r#type: String,
    /// Inputs only: the caller must provide a value.
    #[serde(default)]
    pub required: bool,
    /// Outputs only: strictly instantiate model-typed values on extraction.
    #[serde(default)]
    pub validate: bool,
    #[serde(default)]
    pub description: Option<String>,
}

/// One unit of work in a flow, tagged by type.
///
/// Every key of the authored step that is not one of the standard fields lands
/// in `step_config`, which each executor interprets for its own type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct FlowStep {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Tag selecting the executor (`dice_roll`, `player_choice`, ...).
    #[serde(rename = "type")]
    pub r#type: String,
    /// Text shown to the player for interactive steps.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Optional guard; the step is skipped when it resolves falsy.
    #[serde(default)]
    pub condition: Option<String>,
    /// Hint that the step's actions may be evaluated as one batch.
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub pre_actions: Vec<Action>,
    #[serde(default)]
    pub actions: Vec<Action>,
    /// Explicit jump target; defaults to the next step in order.
    #[serde(default)]
    pub next_step: Option<String>,
    #[serde(flatten)]
    pub step_config: JsonMap<String, Value>,
}

impl FlowStep {
    /// Human-facing label: the name when present, the id otherwise.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|name| !name.trim().is_empty()).unwrap_or(&self.id)
    }
}

/// A single effect attached to a step, authored as a one-entry mapping.
///
/// ```yaml
/// - set_value:
///     path: outputs.total
///     value: "{{ result.total }}"
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Action {
    /// The single key of the mapping, naming the handler.
    pub action_type: String,
    /// The value under that key, interpreted by the handler.
    pub payload: Value,
}

impl Action {
    pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
        }
    }

    /// Converts the action back into its authored one-entry mapping.
    pub fn to_value(&self) -> Value {
        let mut map = JsonMap::new();
        map.insert(self.action_type.clone(), self.payload.clone());
        Value::Object(map)
    }

    /// Parses an action from its authored one-entry mapping.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let Value::Object(map) = value else {
            return Err(format!("action must be a mapping, found {value}"));
        };
        let mut entries = map.iter();
        match (entries.next(), entries.next()) {
            (Some((action_type, payload)), None) => Ok(Self::new(action_type.clone(), payload.clone())),
            (None, _) => Err("action mapping is empty".to_string()),
            (Some(_), Some(_)) => Err(format!(
                "action mapping must have exactly one key, found: {}",
                map.keys().cloned().collect::<Vec<_>>().join(", ")
            )),
        }
    }
}

impl Serialize for Action {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.action_type, &self.payload)?;
        map.end()
    }
}

impl<'de> Deserialize<'de> for Action {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ActionVisitor;

        impl<'de> Visitor<'de> for ActionVisitor {
            type Value = Action;

            fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
                formatter.write_str("a mapping with exactly one action type key")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Action, A::Error> {
                let Some((action_type, payload)) = access.next_entry::<String, Value>()? else {
                    return Err(de::Error::custom("action mapping is empty"));
                };
                if let Some(extra) = access.next_key::<String>()? {
                    return Err(de::Error::custom(format!(
                        "action '{action_type}' has an unexpected second key '{extra}'"
                    )));
                }
                Ok(Action::new(action_type, payload))
            }
        }

        deserializer.deserialize_map(ActionVisitor)
    }
}
