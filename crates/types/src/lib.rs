//! Strongly typed schema records shared by Grimoire hosts and the flow engine.
//!
//! The records mirror the authoring format of a Grimoire system: flows with
//! their ordered steps and actions, models with attribute trees, roll tables,
//! and LLM prompts. They preserve authoring order (via `IndexMap`) so step
//! lists, attribute definitions, and table entries are evaluated in the order
//! they were written. Loading these records from files is the host's concern;
//! the serde derives accept any self-describing format.

pub mod catalog;
pub mod flow;
pub mod model;
pub mod table;

pub use catalog::SystemCatalog;
pub use flow::{Action, FlowDefinition, FlowField, FlowStep};
pub use model::{AttributeDefinition, AttributeNode, ModelDefinition, PRIMITIVE_TYPES, ValidationRule, is_primitive_type};
pub use table::{LlmSettings, PromptDefinition, TableDefinition, TableEntry};
