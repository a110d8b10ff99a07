//! `table_roll`.

use grimoire_types::{FlowStep, TableDefinition};
use serde_json::{Value, json};
use tracing::{info, warn};

use super::dice::roll_expression;
use super::{TableRollConfig, missing_field};
use crate::actions::run_actions;
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::FlowFrame;

/// First entry whose range contains `total`, or a placeholder naming it.
pub(crate) fn lookup_entry(table: &TableDefinition, total: i64) -> Value {
    match table.entries.iter().find(|entry| entry.matches(total)) {
        Some(entry) => entry.value.clone(),
        None => {
            warn!(table = %table.id, total, "no table entry matches the roll");
            Value::String(format!("<no match for {total}>"))
        }
    }
}

pub(super) fn roll(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &TableRollConfig,
    namespace: &str,
    mut context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    if config.tables.is_empty() {
        return Err(missing_field(step, "tables"));
    }

    for target in &config.tables {
        let table_id = target
            .table
            .as_deref()
            .map(str::trim)
            .filter(|table_id| !table_id.is_empty())
            .ok_or_else(|| missing_field(step, "tables[].table"))?;
        let table = frame
            .catalog()
            .table(table_id)
            .ok_or_else(|| FlowExecutionError::not_found(format!("table '{table_id}' not found")))?;
        if table.roll.trim().is_empty() {
            return Err(FlowExecutionError::execution(format!("table '{table_id}' has no roll expression")));
        }

        let roll = roll_expression(frame, &context, &Value::String(table.roll.clone()))?;
        let entry = lookup_entry(table, roll.total);
        info!(step_id = %step.id, table = %table_id, total = roll.total, "table rolled");

        let result = json!({"entry": entry, "roll_result": roll.summary()});
        context = context
            .set(&format!("{namespace}.result"), result.clone())?
            .set("result", result)?;
        context = run_actions(frame, &target.actions, context)?;
    }
    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_range_wins_and_misses_become_placeholders() {
        let table: TableDefinition = serde_json::from_value(json!({
            "id": "loot",
            "roll": "1d6",
            "entries": [
                {"range": "1-3", "value": "copper"},
                {"range": "3-5", "value": "silver"},
                {"range": 6, "value": "gold"}
            ]
        }))
        .expect("table");
        assert_eq!(lookup_entry(&table, 3), json!("copper"));
        assert_eq!(lookup_entry(&table, 6), json!("gold"));
        assert_eq!(lookup_entry(&table, 9), json!("<no match for 9>"));
    }
}
