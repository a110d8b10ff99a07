//! `flow_call`: runs another flow with an isolated context.

use grimoire_types::FlowStep;
use serde_json::{Map as JsonMap, Value, json};
use tracing::info;

use super::{FlowCallConfig, missing_field};
use crate::context::ExecutionContext;
use crate::error::FlowExecutionError;
use crate::orchestrator::FlowFrame;

pub(super) fn execute(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &FlowCallConfig,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let flow_id = config
        .flow_id
        .as_deref()
        .map(str::trim)
        .filter(|flow_id| !flow_id.is_empty())
        .ok_or_else(|| missing_field(step, "flow_id"))?;
    if frame.catalog().flow(flow_id).is_none() {
        return Err(FlowExecutionError::not_found(format!("flow '{flow_id}' not found")).at_step(&step.id));
    }

    let mut inputs = JsonMap::with_capacity(config.inputs.len());
    for (input_id, value) in &config.inputs {
        inputs.insert(input_id.clone(), context.resolve_value(value)?);
    }

    let key = format!("{flow_id}_{}", frame.run.next_sub_flow());
    let record_path = format!("sub_flows.{key}");
    let context = context.set(
        &record_path,
        json!({"flow_id": flow_id, "inputs": inputs, "variables": {}, "outputs": {}}),
    )?;

    info!(step_id = %step.id, flow_id = %flow_id, depth = frame.depth + 1, "calling sub-flow");
    let outputs = frame
        .engine
        .run_flow(flow_id, inputs, frame.callbacks, frame.depth + 1, frame.run)
        .map_err(|error| {
            FlowExecutionError::new(error.kind, format!("sub-flow '{flow_id}' failed: {error}"))
                .at_step(&step.id)
                .with_source(error)
        })?;

    let outputs = Value::Object(outputs);
    let mut context = context
        .set(&format!("{record_path}.outputs"), outputs.clone())?
        .set(&format!("{namespace}.result"), outputs.clone())?;
    for (output_id, target) in &config.outputs {
        let Some(value) = outputs.get(output_id) else {
            continue;
        };
        context = frame.store(&context, target.trim(), value.clone())?;
        info!(output = %output_id, target = %target, "mapped sub-flow output");
    }
    info!(step_id = %step.id, flow_id = %flow_id, "sub-flow completed");
    Ok(context)
}
