//! Declared-type lookup and value coercion for context paths.
//!
//! A path such as `variables.hero.stats.hp` resolves its first two segments
//! against the flow's declared inputs, outputs, and variables, then descends
//! through model attribute trees (inherited attributes included). Paths that
//! cannot be resolved are stored without coercion.

use grimoire_types::{AttributeNode, FlowDefinition, SystemCatalog, is_primitive_type};
use indexmap::IndexMap;
use serde_json::Value;
use tracing::debug;

use crate::context::SlotState;
use crate::error::FlowExecutionError;
use crate::field_paths::split_path;
use crate::instantiate::ObjectInstantiator;

/// Resolves the declared type of `path`, if any.
pub fn expected_type(flow: &FlowDefinition, catalog: &SystemCatalog, path: &str) -> Option<String> {
    let segments = split_path(path);
    let [namespace, field, rest @ ..] = segments.as_slice() else {
        return None;
    };
    let mut current = Cursor::Type(flow.declared_field(namespace, field)?.r#type.clone());

    for segment in rest {
        current = match current {
            Cursor::Type(type_name) => {
                let attributes = catalog.model_attributes(&type_name)?;
                descend(&attributes, segment)?
            }
            Cursor::Group(children) => descend(&children, segment)?,
            Cursor::List(element_type) => {
                segment.parse::<usize>().ok()?;
                Cursor::Type(element_type)
            }
        };
    }

    match current {
        Cursor::Type(type_name) => Some(type_name),
        Cursor::List(_) => Some("list".to_string()),
        Cursor::Group(_) => None,
    }
}

enum Cursor {
    Type(String),
    Group(IndexMap<String, AttributeNode>),
    List(String),
}

fn descend(attributes: &IndexMap<String, AttributeNode>, segment: &str) -> Option<Cursor> {
    match attributes.get(segment)? {
        AttributeNode::Group(children) => Some(Cursor::Group(children.clone())),
        AttributeNode::Attribute(definition) => match (definition.r#type.as_str(), definition.of.as_deref()) {
            ("list", Some(element_type)) => Some(Cursor::List(element_type.to_string())),
            (type_name, _) => Some(Cursor::Type(type_name.to_string())),
        },
    }
}

/// Coerces `value` for storage at `path`.
///
/// Primitive types are converted strictly and a failure is fatal. Model types
/// are instantiated; on failure the raw mapping is kept (with its `model` key)
/// and tagged [`SlotState::Raw`] so `validate_value` can report it later.
pub fn coerce_for_path(
    flow: &FlowDefinition,
    catalog: &SystemCatalog,
    instantiator: &dyn ObjectInstantiator,
    path: &str,
    value: Value,
) -> Result<(Value, SlotState), FlowExecutionError> {
    let Some(type_name) = expected_type(flow, catalog, path) else {
        return Ok((value, SlotState::Plain));
    };

    if is_primitive_type(&type_name) {
        let coerced = instantiator
            .coerce_primitive(&value, &type_name)
            .map_err(|error| FlowExecutionError::from(error).with_message_prefix(&format!("cannot store value at '{path}'")))?;
        return Ok((coerced, SlotState::Plain));
    }

    if !instantiator.has_model(&type_name) {
        return Ok((value, SlotState::Plain));
    }

    let Value::Object(mut raw) = value else {
        return Ok((value, SlotState::Plain));
    };
    match instantiator.instantiate(&type_name, &Value::Object(raw.clone())) {
        Ok(object) => Ok((object.into_value(), SlotState::Validated { model: type_name })),
        Err(error) => {
            debug!(path = %path, model = %type_name, error = %error, "storing raw model data for deferred validation");
            raw.entry("model").or_insert_with(|| Value::String(type_name.clone()));
            Ok((Value::Object(raw), SlotState::Raw { model: type_name }))
        }
    }
}
