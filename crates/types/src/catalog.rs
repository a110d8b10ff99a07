//! The `SystemCatalog`: one authored game system bundled by id.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::flow::FlowDefinition;
use crate::model::{AttributeNode, ModelDefinition};
use crate::table::{PromptDefinition, TableDefinition};

/// All flows, models, tables, and prompts of one game system, keyed by id in
/// authoring order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemCatalog {
    pub id: String,
    #[serde(default)]
    pub flows: IndexMap<String, FlowDefinition>,
    #[serde(default)]
    pub models: IndexMap<String, ModelDefinition>,
    #[serde(default)]
    pub tables: IndexMap<String, TableDefinition>,
    #[serde(default)]
    pub prompts: IndexMap<String, PromptDefinition>,
}

impl SystemCatalog {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_flow(mut self, flow: FlowDefinition) -> Self {
        self.flows.insert(flow.id.clone(), flow);
        self
    }

    pub fn with_model(mut self, model: ModelDefinition) -> Self {
        self.models.insert(model.id.clone(), model);
        self
    }

    pub fn with_table(mut self, table: TableDefinition) -> Self {
        self.tables.insert(table.id.clone(), table);
        self
    }

    pub fn with_prompt(mut self, prompt: PromptDefinition) -> Self {
        self.prompts.insert(prompt.id.clone(), prompt);
        self
    }

    pub fn flow(&self, flow_id: &str) -> Option<&FlowDefinition> {
        self.flows.get(flow_id)
    }

    pub fn model(&self, model_id: &str) -> Option<&ModelDefinition> {
        self.models.get(model_id)
    }

    pub fn table(&self, table_id: &str) -> Option<&TableDefinition> {
        self.tables.get(table_id)
    }

    pub fn prompt(&self, prompt_id: &str) -> Option<&PromptDefinition> {
        self.prompts.get(prompt_id)
    }

    /// Attribute tree of a model with inherited attributes merged in.
    ///
    /// Parents are applied in `extends` order and the model's own attributes
    /// last, so the most specific definition wins. Cycles in `extends` and
    /// unknown parents are ignored. Returns `None` for an unknown model.
    pub fn model_attributes(&self, model_id: &str) -> Option<IndexMap<String, AttributeNode>> {
        let model = self.model(model_id)?;
        let mut visiting = vec![model_id.to_string()];
        let mut merged = IndexMap::new();
        self.collect_attributes(model, &mut visiting, &mut merged);
        Some(merged)
    }

    fn collect_attributes(&self, model: &ModelDefinition, visiting: &mut Vec<String>, merged: &mut IndexMap<String, AttributeNode>) {
        for parent_id in &model.extends {
            if visiting.contains(parent_id) {
                continue;
            }
            let Some(parent) = self.model(parent_id) else {
                continue;
            };
            visiting.push(parent_id.clone());
            self.collect_attributes(parent, visiting, merged);
            visiting.pop();
        }
        for (name, node) in &model.attributes {
            merged.insert(name.clone(), node.clone());
        }
    }
}
