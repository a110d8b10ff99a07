//! `player_choice`: static or generated choices, single or multi selection.

use grimoire_types::{FlowStep, TableDefinition};
use serde_json::{Map as JsonMap, Value, json};
use tracing::{debug, info};

use super::{ChoiceOption, ChoiceSource, PlayerChoiceConfig, presented_step, request_input};
use crate::actions::run_actions;
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::{FlowFrame, with_model_key};
use crate::resolve::{has_template_markers, render_text};

const TABLE_DISPLAY_FORMAT: &str = "{{ entry|title }}";
const VALUES_DISPLAY_FORMAT: &str = "{{ key|title }}";

pub(super) fn execute(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &PlayerChoiceConfig,
    namespace: &str,
    mut context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    if !frame.callbacks.has_user_input() {
        return Err(FlowExecutionError::user_input("player_choice steps require an on_user_input callback"));
    }

    let source = config.choice_source.as_ref();
    let choices = match source {
        Some(source) => generate_choices(frame, source, &context)?,
        None => config.choices.clone(),
    };
    let mut presented = presented_step(step, &context)?;
    presented.step_config.insert("choices".to_string(), Value::Array(choices.clone()));

    let selection = request_input(frame, &presented, &context)?;
    let selection_count = source.map_or(1, |source| source.selection_count);

    if selection_count > 1 {
        let selected = match selection {
            Value::Array(selected) => selected,
            other => {
                return Err(FlowExecutionError::user_input(format!(
                    "expected a list of {selection_count} selections, got {other}"
                )));
            }
        };
        if selected.len() != selection_count {
            return Err(FlowExecutionError::user_input(format!(
                "expected {selection_count} selections, got {}",
                selected.len()
            )));
        }
        let results = selected
            .iter()
            .map(|choice| process_selection(frame, source, choice))
            .collect::<Result<Vec<_>, _>>()?;
        let first = results.first().cloned().unwrap_or(Value::Null);
        info!(step_id = %step.id, count = results.len(), "player made selections");
        context = context
            .set(&format!("{namespace}.results"), Value::Array(results.clone()))?
            .set("results", Value::Array(results))?
            .set(&format!("{namespace}.result"), first)?;
        return Ok(context);
    }

    let result = process_selection(frame, source, &selection)?;
    info!(step_id = %step.id, selection = %render_text(&selection), "player made a choice");
    context = context
        .set(&format!("{namespace}.result"), result.clone())?
        .set("result", result)?;

    let Some(chosen) = find_choice(&choices, &selection)? else {
        return Ok(context);
    };
    context = run_actions(frame, &chosen.actions, context)?;
    if let Some(next_step) = chosen.next_step.as_deref().filter(|next_step| !next_step.trim().is_empty()) {
        context = context.set(&format!("{namespace}.next_step_override"), Value::String(next_step.to_string()))?;
    }
    Ok(context)
}

/// The authored choice whose id or label equals the selection.
fn find_choice(choices: &[Value], selection: &Value) -> Result<Option<ChoiceOption>, FlowExecutionError> {
    let wanted = render_text(selection);
    for choice in choices {
        let option = match choice {
            Value::Object(_) => serde_json::from_value::<ChoiceOption>(choice.clone())
                .map_err(|error| FlowExecutionError::execution(format!("invalid choice {choice}: {error}")).with_source(error))?,
            other => ChoiceOption {
                id: Some(other.clone()),
                ..ChoiceOption::default()
            },
        };
        let equals_selection = |field: &Option<Value>| field.as_ref().is_some_and(|value| render_text(value) == wanted);
        if equals_selection(&option.id) || equals_selection(&option.label) {
            return Ok(Some(option));
        }
    }
    Ok(None)
}

fn generate_choices(frame: &FlowFrame<'_, '_>, source: &ChoiceSource, context: &ExecutionContext) -> Result<Vec<Value>, FlowExecutionError> {
    if let Some(table_id) = source.table.as_deref() {
        let table = find_table(frame, table_id)?;
        let format = source.display_format.as_deref().unwrap_or(TABLE_DISPLAY_FORMAT);
        let mut choices = Vec::with_capacity(table.entries.len());
        for entry in table.entries.iter().filter(|entry| !entry.value.is_null()) {
            let id = render_text(&entry.value);
            let label = context
                .set("entry", entry.value.clone())
                .ok()
                .and_then(|scoped| scoped.resolve_template(format).ok())
                .map(|label| render_text(&label))
                .unwrap_or_else(|| id.clone());
            choices.push(json!({"id": id, "label": label}));
        }
        debug!(table = %table_id, count = choices.len(), "generated choices from table");
        return Ok(choices);
    }

    if let Some(path) = source.table_from_values.as_deref() {
        let data = if has_template_markers(path) {
            context.resolve_template(path)?
        } else {
            context.get(path.trim()).unwrap_or(Value::Null)
        };
        let Value::Object(entries) = data else {
            return Err(FlowExecutionError::execution(format!("data at '{path}' is not a mapping")));
        };
        let format = source.display_format.as_deref().unwrap_or(VALUES_DISPLAY_FORMAT);
        let mut choices = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            let scoped = context.set("key", Value::String(key.clone()))?.set("value", value)?;
            let label = render_text(&scoped.resolve_template(format)?);
            choices.push(json!({"id": key, "label": label}));
        }
        return Ok(choices);
    }

    Err(FlowExecutionError::execution(
        "choice_source requires either 'table' or 'table_from_values'",
    ))
}

fn find_table<'f>(frame: &'f FlowFrame<'_, '_>, table_id: &str) -> Result<&'f TableDefinition, FlowExecutionError> {
    frame
        .catalog()
        .table(table_id)
        .ok_or_else(|| FlowExecutionError::not_found(format!("table '{table_id}' not found")))
}

/// Turns a selected table entry into a model object when the table holds
/// model entries; every other selection is returned unchanged.
fn process_selection(frame: &FlowFrame<'_, '_>, source: Option<&ChoiceSource>, selection: &Value) -> Result<Value, FlowExecutionError> {
    let Some(table_id) = source.and_then(|source| source.table.as_deref()) else {
        return Ok(selection.clone());
    };
    let table = find_table(frame, table_id)?;
    if !table.has_model_entries() {
        return Ok(selection.clone());
    }

    let wanted = render_text(selection);
    let entry = table
        .entries
        .iter()
        .find(|entry| !entry.value.is_null() && render_text(&entry.value) == wanted)
        .ok_or_else(|| FlowExecutionError::user_input(format!("selected entry '{wanted}' not found in table '{table_id}'")))?;

    let data = match &entry.value {
        Value::Object(fields) => with_model_key(Value::Object(fields.clone()), &table.entry_type),
        other => {
            let mut fields = JsonMap::new();
            fields.insert("model".to_string(), Value::String(table.entry_type.clone()));
            fields.insert("id".to_string(), Value::String(render_text(other)));
            Value::Object(fields)
        }
    };
    let object = frame.instantiator().instantiate_lenient(&table.entry_type, &data).map_err(|error| {
        FlowExecutionError::from(error).with_message_prefix(&format!("cannot create {} from table selection", table.entry_type))
    })?;
    Ok(object.into_value())
}
