//! `name_generation` and `llm_generation`.

use grimoire_types::{FlowStep, LlmSettings};
use serde_json::{Map as JsonMap, Value, json};
use tracing::{debug, info};

use super::{LlmGenerationConfig, NameGenerationConfig, collaborator_failure, missing_field};
use crate::collaborators::NameGeneratorSpec;
use crate::context::ExecutionContext;
use crate::error::{ErrorKind, FlowExecutionError};
use crate::orchestrator::FlowFrame;
use crate::resolve::render_text;

fn setting_text(context: &ExecutionContext, value: Option<&Value>, default: &str) -> Result<String, FlowExecutionError> {
    let Some(value) = value.filter(|value| !value.is_null()) else {
        return Ok(default.to_string());
    };
    let text = render_text(&context.resolve_value(value)?).trim().to_string();
    Ok(if text.is_empty() { default.to_string() } else { text })
}

pub(super) fn name(
    frame: &FlowFrame<'_, '_>,
    config: &NameGenerationConfig,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let defaults = &frame.engine.config.name_defaults;
    let settings = &config.settings;
    let spec = NameGeneratorSpec {
        corpus: setting_text(&context, settings.corpus.as_ref(), &defaults.corpus)?,
        segmenter: setting_text(&context, settings.segmenter.as_ref(), &defaults.segmenter)?,
    };
    let algorithm = setting_text(&context, settings.algorithm.as_ref(), &defaults.algorithm)?;
    let max_length = match settings.max_length.as_ref().filter(|value| !value.is_null()) {
        Some(value) => {
            let resolved = context.resolve_value(value)?;
            let coerced = frame.instantiator().coerce_primitive(&resolved, "int")?;
            coerced
                .as_u64()
                .and_then(|length| usize::try_from(length).ok())
                .filter(|length| *length > 0)
                .ok_or_else(|| FlowExecutionError::validation(format!("max_length must be a positive integer, got {resolved}")))?
        }
        None => defaults.max_length,
    };

    let generator = frame
        .engine
        .names
        .create(&spec)
        .map_err(|error| collaborator_failure(format!("cannot load name corpus '{}'", spec.corpus), error))?;
    let generated = generator
        .generate(max_length, &algorithm)
        .map_err(|error| collaborator_failure("name generation failed".to_string(), error))?;
    info!(corpus = %spec.corpus, algorithm = %algorithm, name = %generated, "name generated");
    Ok(context.set(&format!("{namespace}.result"), json!({"name": generated}))?)
}

pub(super) fn llm(
    frame: &FlowFrame<'_, '_>,
    step: &FlowStep,
    config: &LlmGenerationConfig,
    namespace: &str,
    context: ExecutionContext,
) -> Result<ExecutionContext, FlowExecutionError> {
    let prompt_id = config
        .prompt_id
        .as_deref()
        .map(str::trim)
        .filter(|prompt_id| !prompt_id.is_empty())
        .ok_or_else(|| missing_field(step, "prompt_id"))?;
    let prompt = frame
        .catalog()
        .prompt(prompt_id)
        .ok_or_else(|| FlowExecutionError::not_found(format!("prompt '{prompt_id}' not found")))?;

    let data = match context.resolve_value(&Value::Object(config.prompt_data.clone()))? {
        Value::Object(data) => data,
        _ => JsonMap::new(),
    };
    let text = format_prompt(&prompt.prompt_template, &data)
        .map_err(|message| FlowExecutionError::new(ErrorKind::Template, format!("prompt '{prompt_id}': {message}")))?;

    let settings = frame
        .engine
        .config
        .default_llm
        .overlay(prompt.llm.as_ref().unwrap_or(&LlmSettings::default()))
        .overlay(config.llm_settings.as_ref().unwrap_or(&LlmSettings::default()));
    debug!(prompt_id = %prompt_id, provider = ?settings.provider, model = ?settings.model, "sending prompt");
    let response = frame
        .engine
        .llm
        .execute_prompt(&text, &settings)
        .map_err(|error| collaborator_failure(format!("LLM request for prompt '{prompt_id}' failed"), error))?;
    info!(prompt_id = %prompt_id, chars = response.response.chars().count(), "LLM generation completed");
    Ok(context.set(&format!("{namespace}.result"), Value::String(response.response))?)
}

/// Substitutes `{name}` placeholders from `data`; `{{` and `}}` are literal braces.
pub(crate) fn format_prompt(template: &str, data: &JsonMap<String, Value>) -> Result<String, String> {
    let mut output = String::with_capacity(template.len());
    let mut characters = template.chars().peekable();
    while let Some(character) = characters.next() {
        match character {
            '{' if characters.peek() == Some(&'{') => {
                characters.next();
                output.push('{');
            }
            '}' if characters.peek() == Some(&'}') => {
                characters.next();
                output.push('}');
            }
            '{' => {
                let mut name = String::new();
                loop {
                    match characters.next() {
                        Some('}') => break,
                        Some(next) => name.push(next),
                        None => return Err(format!("unterminated placeholder '{{{name}'")),
                    }
                }
                let key = name.trim();
                let value = data.get(key).ok_or_else(|| format!("missing placeholder value '{key}'"))?;
                output.push_str(&render_text(value));
            }
            '}' => return Err("single '}' encountered in prompt template".to_string()),
            other => output.push(other),
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(value: Value) -> JsonMap<String, Value> {
        value.as_object().cloned().expect("mapping")
    }

    #[test]
    fn placeholders_are_substituted() {
        let rendered = format_prompt("Describe {name}, a level {level} {class}.", &data(json!({"name": "Aria", "level": 3, "class": "bard"})));
        assert_eq!(rendered.unwrap(), "Describe Aria, a level 3 bard.");
    }

    #[test]
    fn doubled_braces_are_literal() {
        let rendered = format_prompt("Return JSON like {{\"name\": \"{name}\"}}", &data(json!({"name": "Aria"})));
        assert_eq!(rendered.unwrap(), "Return JSON like {\"name\": \"Aria\"}");
    }

    #[test]
    fn missing_placeholders_are_errors() {
        let error = format_prompt("Hello {who}", &JsonMap::new()).unwrap_err();
        assert!(error.contains("'who'"));
        assert!(format_prompt("Hello {who", &JsonMap::new()).is_err());
    }
}
