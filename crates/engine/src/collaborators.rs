//! Contracts for the services a flow delegates to: dice, names, and LLMs.
//!
//! The engine only defines the call shapes. Hosts plug in real
//! implementations; the `Null*` defaults fail with a clear message so a flow
//! that needs an unconfigured collaborator aborts instead of guessing.

use anyhow::{Result, bail};
use grimoire_types::LlmSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Outcome of one dice expression.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiceRoll {
    pub total: i64,
    /// Human-readable breakdown, e.g. `3d6: [2, 5, 6] = 13`.
    pub detail: String,
    #[serde(default)]
    pub rolls: Vec<i64>,
}

impl DiceRoll {
    /// The `{total, detail}` shape stored in step results.
    pub fn summary(&self) -> Value {
        json!({"total": self.total, "detail": self.detail})
    }
}

/// Evaluates dice notation.
pub trait DiceRoller: Send + Sync {
    /// Rolls `expression`, failing on malformed notation.
    fn roll(&self, expression: &str) -> Result<DiceRoll>;
}

/// Dice roller used when the host configured none.
pub struct NullDiceRoller;

impl DiceRoller for NullDiceRoller {
    fn roll(&self, expression: &str) -> Result<DiceRoll> {
        bail!("no dice roller configured; cannot roll '{expression}'")
    }
}

/// Corpus and segmentation settings a name generator is built from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameGeneratorSpec {
    pub corpus: String,
    pub segmenter: String,
}

/// Produces names from a configured corpus.
pub trait NameGenerator {
    fn generate(&self, max_length: usize, algorithm: &str) -> Result<String>;
}

/// Builds name generators for a corpus/segmenter pair.
pub trait NameGeneratorFactory: Send + Sync {
    fn create(&self, spec: &NameGeneratorSpec) -> Result<Box<dyn NameGenerator>>;
}

/// Name generator factory used when the host configured none.
pub struct NullNameGenerator;

impl NameGeneratorFactory for NullNameGenerator {
    fn create(&self, spec: &NameGeneratorSpec) -> Result<Box<dyn NameGenerator>> {
        bail!("no name generator configured; cannot load corpus '{}'", spec.corpus)
    }
}

/// Response of one LLM request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmResponse {
    pub prompt: String,
    pub response: String,
    pub provider: String,
    pub model: String,
    #[serde(default)]
    pub tokens_used: Option<u32>,
}

/// Sends rendered prompts to a language model.
pub trait LlmClient: Send + Sync {
    fn execute_prompt(&self, prompt: &str, settings: &LlmSettings) -> Result<LlmResponse>;
}

/// LLM client used when the host configured none.
pub struct NullLlmClient;

impl LlmClient for NullLlmClient {
    fn execute_prompt(&self, _prompt: &str, settings: &LlmSettings) -> Result<LlmResponse> {
        bail!(
            "no LLM client configured for provider '{}'",
            settings.provider.as_deref().unwrap_or("unspecified")
        )
    }
}

/// Deterministic client that describes the prompt instead of calling a model.
/// Useful for previews and tests.
pub struct MockLlmClient;

impl LlmClient for MockLlmClient {
    fn execute_prompt(&self, prompt: &str, settings: &LlmSettings) -> Result<LlmResponse> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            bail!("prompt cannot be empty");
        }
        let model = settings.model.clone().unwrap_or_else(|| "mock-model".to_string());
        let response = format!(
            "[MOCK RESPONSE] This is a mock LLM response. The prompt contained {} words. In a real implementation, this would be generated by {model}.",
            prompt.split_whitespace().count()
        );
        Ok(LlmResponse {
            prompt: prompt.to_string(),
            response,
            provider: settings.provider.clone().unwrap_or_else(|| "mock".to_string()),
            model,
            tokens_used: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_collaborators_fail_with_context() {
        let error = NullDiceRoller.roll("2d6").unwrap_err();
        assert!(error.to_string().contains("2d6"));

        let spec = NameGeneratorSpec {
            corpus: "generic-fantasy".into(),
            segmenter: "fantasy".into(),
        };
        assert!(NullNameGenerator.create(&spec).is_err());
        assert!(NullLlmClient.execute_prompt("hi", &LlmSettings::default()).is_err());
    }

    #[test]
    fn mock_llm_counts_prompt_words() {
        let settings = LlmSettings {
            model: Some("tiny".into()),
            ..Default::default()
        };
        let response = MockLlmClient.execute_prompt("  describe a dusty tavern ", &settings).unwrap();
        assert_eq!(response.provider, "mock");
        assert!(response.response.contains("contained 4 words"));
        assert!(response.response.ends_with("generated by tiny."));
        assert!(MockLlmClient.execute_prompt("   ", &settings).is_err());
    }

    #[test]
    fn dice_summary_keeps_total_and_detail() {
        let roll = DiceRoll {
            total: 9,
            detail: "2d6: [4, 5] = 9".into(),
            rolls: vec![4, 5],
        };
        assert_eq!(roll.summary(), json!({"total": 9, "detail": "2d6: [4, 5] = 9"}));
    }
}
