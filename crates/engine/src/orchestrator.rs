//! Flow orchestration: context setup, the step loop, and output extraction.
//!
//! [`FlowEngine::execute`] owns every piece of run state. Each call builds a
//! fresh [`ExecutionContext`], walks the step list with an index cursor, and
//! drops the context on return, so nothing survives a failed run. `flow_call`
//! steps re-enter the engine with an isolated context one level deeper.

use std::cell::Cell;
use std::sync::Arc;

use grimoire_types::{FlowDefinition, FlowStep, SystemCatalog, is_primitive_type};
use serde_json::{Map as JsonMap, Value, json};
use tracing::{debug, error, info, warn};

use crate::actions::{run_actions, run_actions_parallel};
use crate::callbacks::FlowCallbacks;
use crate::collaborators::{DiceRoller, LlmClient, NameGeneratorFactory, NullDiceRoller, NullLlmClient, NullNameGenerator};
use crate::config::EngineConfig;
use crate::context::{ExecutionContext, SlotState};
use crate::error::{ErrorKind, FlowExecutionError};
use crate::instantiate::{ModelInstantiator, ObjectInstantiator};
use crate::resolve::{ExpressionResolver, TemplateResolver};
use crate::scheduler::{InlineScheduler, RetryPolicy, TaskDescriptor, TaskScheduler};
use crate::steps::{self, StepKind};
use crate::typing::coerce_for_path;

/// Executes flows from a [`SystemCatalog`].
///
/// Collaborators default to the `Null*` implementations, which fail when a
/// flow needs them; hosts install real ones with the `with_*` methods.
///
/// ```rust
/// use grimoire_engine::{FlowCallbacks, FlowEngine};
/// use grimoire_types::{FlowDefinition, SystemCatalog};
/// use serde_json::{Map, json};
///
/// let flow: FlowDefinition = serde_json::from_value(json!({
///     "id": "double",
///     "inputs": [{"id": "n", "type": "int", "required": true}],
///     "outputs": [{"id": "doubled", "type": "int"}],
///     "steps": [{
///         "id": "finish",
///         "type": "completion",
///         "actions": [{"set_value": {"path": "outputs.doubled", "value": "{{ inputs.n * 2 }}"}}]
///     }]
/// }))?;
/// let engine = FlowEngine::new(SystemCatalog::new("demo").with_flow(flow));
///
/// let mut inputs = Map::new();
/// inputs.insert("n".into(), json!(21));
/// let outputs = engine.execute("double", inputs, &FlowCallbacks::new())?;
/// assert_eq!(outputs["doubled"], json!(42));
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
pub struct FlowEngine {
    pub(crate) catalog: Arc<SystemCatalog>,
    pub(crate) instantiator: Arc<dyn ObjectInstantiator>,
    pub(crate) dice: Arc<dyn DiceRoller>,
    pub(crate) names: Arc<dyn NameGeneratorFactory>,
    pub(crate) llm: Arc<dyn LlmClient>,
    pub(crate) scheduler: Arc<dyn TaskScheduler>,
    pub(crate) resolver: Arc<dyn TemplateResolver>,
    pub(crate) config: EngineConfig,
    custom_instantiator: bool,
}

impl FlowEngine {
    pub fn new(catalog: impl Into<Arc<SystemCatalog>>) -> Self {
        let catalog = catalog.into();
        Self {
            instantiator: Arc::new(ModelInstantiator::new(catalog.clone())),
            catalog,
            dice: Arc::new(NullDiceRoller),
            names: Arc::new(NullNameGenerator),
            llm: Arc::new(NullLlmClient),
            scheduler: Arc::new(InlineScheduler),
            resolver: Arc::new(ExpressionResolver),
            config: EngineConfig::default(),
            custom_instantiator: false,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dice_roller(mut self, dice: impl DiceRoller + 'static) -> Self {
        self.dice = Arc::new(dice);
        self
    }

    pub fn with_name_generator(mut self, names: impl NameGeneratorFactory + 'static) -> Self {
        self.names = Arc::new(names);
        self
    }

    pub fn with_llm_client(mut self, llm: impl LlmClient + 'static) -> Self {
        self.llm = Arc::new(llm);
        self
    }

    pub fn with_scheduler(mut self, scheduler: impl TaskScheduler + 'static) -> Self {
        self.scheduler = Arc::new(scheduler);
        self
    }

    pub fn with_instantiator(mut self, instantiator: impl ObjectInstantiator + 'static) -> Self {
        self.instantiator = Arc::new(instantiator);
        self.custom_instantiator = true;
        self
    }

    /// Replaces the template resolver. The default model instantiator is
    /// rebuilt so derived formulas use the same resolver.
    pub fn with_resolver(mut self, resolver: impl TemplateResolver + 'static) -> Self {
        self.resolver = Arc::new(resolver);
        if !self.custom_instantiator {
            self.instantiator = Arc::new(ModelInstantiator::new(self.catalog.clone()).with_resolver(self.resolver.clone()));
        }
        self
    }

    pub fn catalog(&self) -> &SystemCatalog {
        &self.catalog
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Runs `flow_id` with `inputs` and returns its declared outputs.
    ///
    /// Every declared output is present in the result, `null` when no step
    /// wrote it. No partial outputs are returned on failure.
    pub fn execute(
        &self,
        flow_id: &str,
        inputs: JsonMap<String, Value>,
        callbacks: &FlowCallbacks<'_>,
    ) -> Result<JsonMap<String, Value>, FlowExecutionError> {
        let run = RunState::default();
        let result = self.run_flow(flow_id, inputs, callbacks, 0, &run);
        if let Err(failure) = &result {
            error!(flow_id = %flow_id, kind = %failure.kind, error = %failure, "flow execution failed");
        }
        result
    }

    pub(crate) fn run_flow(
        &self,
        flow_id: &str,
        inputs: JsonMap<String, Value>,
        callbacks: &FlowCallbacks<'_>,
        depth: usize,
        run: &RunState,
    ) -> Result<JsonMap<String, Value>, FlowExecutionError> {
        if depth > self.config.max_flow_depth {
            return Err(FlowExecutionError::new(
                ErrorKind::RecursionLimit,
                format!("flow '{flow_id}' exceeds the maximum flow depth of {}", self.config.max_flow_depth),
            ));
        }
        let flow = self
            .catalog
            .flow(flow_id)
            .ok_or_else(|| FlowExecutionError::not_found(format!("flow '{flow_id}' not found")))?;

        info!(flow_id = %flow_id, depth, steps = flow.steps.len(), "starting flow");
        let frame = FlowFrame {
            engine: self,
            flow,
            callbacks,
            depth,
            run,
        };
        let context = frame.initialize_context(inputs)?;
        let context = frame.run_steps(context)?;
        let outputs = frame.extract_outputs(&context)?;
        info!(flow_id = %flow_id, depth, "flow completed");
        Ok(outputs)
    }
}

/// Counters shared by every frame of one `execute` call.
#[derive(Debug, Default)]
pub(crate) struct RunState {
    transitions: Cell<usize>,
    sub_flow_sequence: Cell<usize>,
}

impl RunState {
    /// Next unique `sub_flows` key suffix.
    pub(crate) fn next_sub_flow(&self) -> usize {
        let next = self.sub_flow_sequence.get() + 1;
        self.sub_flow_sequence.set(next);
        next
    }
}

/// One flow invocation: the flow being run plus everything handlers need.
pub(crate) struct FlowFrame<'a, 'cb> {
    pub engine: &'a FlowEngine,
    pub flow: &'a FlowDefinition,
    pub callbacks: &'a FlowCallbacks<'cb>,
    pub depth: usize,
    pub run: &'a RunState,
}

impl FlowFrame<'_, '_> {
    pub(crate) fn catalog(&self) -> &SystemCatalog {
        &self.engine.catalog
    }

    pub(crate) fn instantiator(&self) -> &dyn ObjectInstantiator {
        self.engine.instantiator.as_ref()
    }

    /// Coerces `value` against the declared type of `path` and writes it.
    pub(crate) fn store(&self, context: &ExecutionContext, path: &str, value: Value) -> Result<ExecutionContext, FlowExecutionError> {
        let (value, state) = coerce_for_path(self.flow, self.catalog(), self.instantiator(), path, value)?;
        Ok(context.set_tagged(path, value, state)?)
    }

    fn initialize_context(&self, mut provided: JsonMap<String, Value>) -> Result<ExecutionContext, FlowExecutionError> {
        let mut context = ExecutionContext::new().bind_resolver(self.engine.resolver.clone());

        for field in &self.flow.inputs {
            let Some(value) = provided.remove(&field.id) else {
                if field.required {
                    return Err(FlowExecutionError::validation(format!(
                        "required input '{}' not provided for flow '{}'",
                        field.id, self.flow.id
                    )));
                }
                debug!(input = %field.id, "optional input not provided");
                continue;
            };
            let path = format!("inputs.{}", field.id);
            let (value, state) = self.coerce_input(&field.id, &field.r#type, value)?;
            context = context.set_tagged(&path, value, state)?;
        }
        if !provided.is_empty() {
            debug!(ignored = ?provided.keys().collect::<Vec<_>>(), "ignoring undeclared inputs");
        }

        for field in self.flow.outputs.iter() {
            context = context.set(&format!("outputs.{}", field.id), Value::Null)?;
        }
        for field in self.flow.variables.iter() {
            context = context.set(&format!("variables.{}", field.id), Value::Null)?;
        }
        Ok(context)
    }

    fn coerce_input(&self, input_id: &str, type_name: &str, value: Value) -> Result<(Value, SlotState), FlowExecutionError> {
        let instantiator = self.instantiator();
        if is_primitive_type(type_name) {
            let coerced = instantiator
                .coerce_primitive(&value, type_name)
                .map_err(|error| FlowExecutionError::from(error).with_message_prefix(&format!("input '{input_id}'")))?;
            return Ok((coerced, SlotState::Plain));
        }
        if instantiator.has_model(type_name) {
            let data = with_model_key(value, type_name);
            let object = instantiator
                .instantiate_lenient(type_name, &data)
                .map_err(|error| FlowExecutionError::from(error).with_message_prefix(&format!("input '{input_id}'")))?;
            return Ok((object.into_value(), SlotState::Raw { model: type_name.to_string() }));
        }
        warn!(input = %input_id, input_type = %type_name, "unknown input type; using value as-is");
        Ok((value, SlotState::Plain))
    }

    fn run_steps(&self, mut context: ExecutionContext) -> Result<ExecutionContext, FlowExecutionError> {
        let steps = &self.flow.steps;
        let mut index = 0;
        while let Some(step) = steps.get(index) {
            self.count_transition(step)?;
            let (next_context, outcome) = self.run_step(step, context).map_err(|error| error.at_step(&step.id))?;
            context = next_context;

            if self.depth == 0 {
                self.callbacks.step_completed(&step.id, &outcome.payload);
            }

            index = match (&outcome.next_step_override, &step.next_step) {
                (Some(target), _) => self.flow.step_index(target).ok_or_else(|| {
                    FlowExecutionError::not_found(format!("selected choice targets unknown next_step '{target}'"))
                        .at_step(&step.id)
                })?,
                (None, Some(target)) => self.flow.step_index(target).ok_or_else(|| {
                    FlowExecutionError::not_found(format!("unknown next_step target '{target}'")).at_step(&step.id)
                })?,
                (None, None) => index + 1,
            };
        }
        debug!(flow_id = %self.flow.id, "all steps completed");
        Ok(context)
    }

    fn count_transition(&self, step: &FlowStep) -> Result<(), FlowExecutionError> {
        let count = self.run.transitions.get() + 1;
        self.run.transitions.set(count);
        match self.engine.config.max_step_transitions {
            Some(limit) if count > limit => Err(FlowExecutionError::new(
                ErrorKind::RecursionLimit,
                format!("run exceeded the maximum of {limit} step transitions"),
            )
            .at_step(&step.id)),
            _ => Ok(()),
        }
    }

    fn run_step(&self, step: &FlowStep, context: ExecutionContext) -> Result<(ExecutionContext, StepOutcome), FlowExecutionError> {
        let namespace = steps::namespace(step);
        let context = context.set(&namespace, Value::Object(JsonMap::new()))?;

        if let Some(condition) = &step.condition
            && !context.evaluate_condition(condition)?
        {
            info!(step_id = %step.id, condition = %condition, "step skipped by condition");
            let payload = json!({"step_id": step.id, "step_type": step.r#type, "skipped": true});
            return Ok((
                context.clear_aliases(),
                StepOutcome {
                    payload,
                    next_step_override: None,
                },
            ));
        }

        let kind = StepKind::parse(step)?;
        let context = run_actions(self, &step.pre_actions, context)?;
        let task = TaskDescriptor {
            flow_id: self.flow.id.clone(),
            step_id: step.id.clone(),
            step_type: step.r#type.clone(),
            depth: self.depth,
            retry: RetryPolicy::for_step_type(&step.r#type),
        };
        debug!(step_id = %step.id, step_type = %step.r#type, depth = self.depth, "executing step");
        let context = self
            .engine
            .scheduler
            .run_step(&task, &mut || self.run_step_body(step, &kind, &namespace, context.clone()))?;

        let mut payload = json!({"step_id": step.id, "step_type": step.r#type});
        if let Some(result) = context.get(&format!("{namespace}.result"))
            && let Some(fields) = payload.as_object_mut()
        {
            fields.insert("result".to_string(), result);
        }
        let next_step_override = context
            .get(&format!("{namespace}.next_step_override"))
            .and_then(|target| target.as_str().map(str::to_string));
        info!(step_id = %step.id, step_type = %step.r#type, "step completed");
        Ok((
            context.clear_aliases(),
            StepOutcome {
                payload,
                next_step_override,
            },
        ))
    }

    fn run_step_body(
        &self,
        step: &FlowStep,
        kind: &StepKind,
        namespace: &str,
        context: ExecutionContext,
    ) -> Result<ExecutionContext, FlowExecutionError> {
        let mut context = steps::execute(self, step, kind, namespace, context)?;

        for alias in ["result", "item"] {
            if let Some(value) = context.get(&format!("{namespace}.{alias}")) {
                context = context.set(alias, value)?;
            }
        }

        if kind.runs_own_actions() || step.actions.is_empty() {
            return Ok(context);
        }
        if step.parallel {
            run_actions_parallel(self, &step.actions, context)
        } else {
            run_actions(self, &step.actions, context)
        }
    }

    fn extract_outputs(&self, context: &ExecutionContext) -> Result<JsonMap<String, Value>, FlowExecutionError> {
        let instantiator = self.instantiator();
        let mut outputs = JsonMap::new();
        for (output_id, value) in context.entries("outputs") {
            let declared = self.flow.declared_field("outputs", output_id);
            let value = match declared {
                _ if value.is_null() => Value::Null,
                Some(field) if is_primitive_type(&field.r#type) => instantiator
                    .coerce_primitive(value, &field.r#type)
                    .map_err(|error| FlowExecutionError::from(error).with_message_prefix(&format!("output '{output_id}'")))?,
                Some(field) if field.validate && instantiator.has_model(&field.r#type) => instantiator
                    .instantiate(&field.r#type, &with_model_key(value.clone(), &field.r#type))
                    .map_err(|error| FlowExecutionError::from(error).with_message_prefix(&format!("output '{output_id}'")))?
                    .into_value(),
                _ => value.clone(),
            };
            outputs.insert(output_id.to_string(), value);
        }
        Ok(outputs)
    }
}

/// What the step loop needs after a step finished.
struct StepOutcome {
    payload: Value,
    next_step_override: Option<String>,
}

/// Adds a `model` key to mapping data that lacks one.
pub(crate) fn with_model_key(value: Value, model: &str) -> Value {
    match value {
        Value::Object(mut fields) => {
            fields.entry("model").or_insert_with(|| Value::String(model.to_string()));
            Value::Object(fields)
        }
        other => other,
    }
}
