//! # Grimoire Engine
//!
//! The Grimoire Engine executes the flows of a tabletop-RPG rule system: it
//! walks a flow's step list, keeps a namespaced execution context, rolls dice
//! and tables, asks the player for input, generates names and LLM text, calls
//! sub-flows, and coerces every write against the flow's declared types.
//!
//! ## Key Features
//!
//! - **Step Execution**: ten step types, from `dice_roll` to `flow_call`, with
//!   pre-actions, post-actions, and `next_step` jumps
//! - **Template Interpolation**: `{{ ... }}` expressions with filters, resolved
//!   against the live context
//! - **Typed Writes**: values written to declared inputs, outputs, and
//!   variables are coerced to their primitive or model type
//! - **Pluggable Collaborators**: dice, names, LLMs, model instantiation, and
//!   step scheduling are traits the host implements
//!
//! ## Usage
//!
//! ```rust
//! use grimoire_engine::{FlowCallbacks, FlowEngine};
//! use grimoire_types::{FlowDefinition, SystemCatalog};
//! use serde_json::{Map, json};
//!
//! let flow: FlowDefinition = serde_json::from_value(json!({
//!     "id": "greeting",
//!     "outputs": [{"id": "message", "type": "str"}],
//!     "steps": [{
//!         "id": "done",
//!         "type": "completion",
//!         "actions": [{"set_value": {"path": "outputs.message", "value": "Well met, {{ 'traveler'|title }}"}}]
//!     }]
//! }))?;
//! let engine = FlowEngine::new(SystemCatalog::new("demo").with_flow(flow));
//! let outputs = engine.execute("greeting", Map::new(), &FlowCallbacks::new())?;
//! assert_eq!(outputs["message"], json!("Well met, Traveler"));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! - **`context`**: copy-on-write namespaced value store
//! - **`resolve`**: template interpolation and condition evaluation
//! - **`typing`** and **`instantiate`**: declared-type lookup, coercion, and
//!   model instantiation
//! - **`orchestrator`**: the step loop, callbacks, and output extraction
//! - **`scheduler`**: the boundary every step body runs through
//! - **`collaborators`**: dice, name, and LLM contracts

mod actions;
pub mod callbacks;
pub mod collaborators;
pub mod config;
pub mod context;
pub mod error;
pub mod field_paths;
pub mod instantiate;
pub mod orchestrator;
pub mod resolve;
pub mod scheduler;
mod steps;
pub mod typing;

pub use callbacks::FlowCallbacks;
pub use collaborators::{
    DiceRoll, DiceRoller, LlmClient, LlmResponse, MockLlmClient, NameGenerator, NameGeneratorFactory, NameGeneratorSpec, NullDiceRoller,
    NullLlmClient, NullNameGenerator,
};
pub use config::{ConfigError, EngineConfig, MAX_FLOW_DEPTH_ENV, MAX_STEP_TRANSITIONS_ENV, NameDefaults};
pub use context::{ContextChange, ExecutionContext, RESERVED_NAMESPACES, Slot, SlotState};
pub use error::{BoxError, ContextError, ErrorKind, FlowExecutionError, InstantiationError, TemplateError};
pub use instantiate::{ModelInstantiator, ModelObject, ObjectInstantiator};
pub use orchestrator::FlowEngine;
pub use resolve::{ExpressionResolver, Scope, TemplateResolver};
pub use scheduler::{InlineScheduler, RetryPolicy, RetryingScheduler, StepBody, TaskDescriptor, TaskScheduler};
