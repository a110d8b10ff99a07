//! Roll tables and LLM prompt records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

fn default_entry_type() -> String {
    "str".to_string()
}

/// A random table: a roll expression and ordered range-keyed entries.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Dice expression rolled to pick an entry, e.g. `1d6`.
    #[serde(alias = "dice")]
    pub roll: String,
    /// `str` or a model id the entry values instantiate into.
    #[serde(default = "default_entry_type")]
    pub entry_type: String,
    #[serde(default)]
    pub entries: Vec<TableEntry>,
}

impl TableDefinition {
    /// True when entries carry model data rather than plain text.
    pub fn has_model_entries(&self) -> bool {
        !matches!(self.entry_type.as_str(), "str" | "string" | "")
    }
}

/// One table row. `range` is a number or a `low-high` string.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TableEntry {
    pub range: Value,
    pub value: Value,
}

impl TableEntry {
    /// The range rendered as authored text (`3`, `1-4`).
    pub fn range_text(&self) -> String {
        match &self.range {
            Value::String(text) => text.trim().to_string(),
            other => other.to_string(),
        }
    }

    /// Returns true when `total` falls into this entry's inclusive range.
    ///
    /// Malformed ranges never match.
    pub fn matches(&self, total: i64) -> bool {
        let text = self.range_text();
        // A leading '-' belongs to a negative low bound, not the separator.
        let split_at = text.char_indices().skip(1).find(|(_, character)| *character == '-').map(|(index, _)| index);
        match split_at {
            Some(index) => {
                let low = text[..index].trim().parse::<i64>();
                let high = text[index + 1..].trim().parse::<i64>();
                matches!((low, high), (Ok(low), Ok(high)) if low <= total && total <= high)
            }
            None => text.parse::<i64>().is_ok_and(|exact| exact == total),
        }
    }
}

/// A reusable LLM prompt with `{name}` placeholders.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct PromptDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "template")]
    pub prompt_template: String,
    /// Defaults applied beneath any step-level settings.
    #[serde(default, alias = "llm_settings")]
    pub llm: Option<LlmSettings>,
}

/// Provider settings for one LLM request. Every field is optional so layers
/// (engine defaults, prompt defaults, step overrides) can be overlaid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct LlmSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl LlmSettings {
    /// Returns a copy of `self` with every field set in `overrides` replaced.
    pub fn overlay(&self, overrides: &LlmSettings) -> LlmSettings {
        LlmSettings {
            provider: overrides.provider.clone().or_else(|| self.provider.clone()),
            model: overrides.model.clone().or_else(|| self.model.clone()),
            temperature: overrides.temperature.or(self.temperature),
            max_tokens: overrides.max_tokens.or(self.max_tokens),
            api_key: overrides.api_key.clone().or_else(|| self.api_key.clone()),
            base_url: overrides.base_url.clone().or_else(|| self.base_url.clone()),
        }
    }
}
