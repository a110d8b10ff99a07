//! Model instantiation and primitive coercion.
//!
//! [`ObjectInstantiator`] is the seam the engine uses to turn loose mappings
//! into model objects. [`ModelInstantiator`] is the default implementation
//! over a [`SystemCatalog`]: it merges inherited attributes, fills defaults,
//! coerces primitive attributes, recurses into nested models, computes derived
//! formulas, and (in strict mode) validates the result.

use std::sync::Arc;

use grimoire_types::{AttributeDefinition, AttributeNode, SystemCatalog, is_primitive_type};
use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Number, Value};
use tracing::debug;

use crate::error::InstantiationError;
use crate::field_paths::join_path;
use crate::resolve::{ExpressionResolver, TemplateResolver, evaluate_condition, render_text};

/// An instantiated model: its id plus the fully resolved field mapping.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelObject {
    pub model: String,
    /// Every field, including the injected `model` key.
    pub fields: JsonMap<String, Value>,
}

impl ModelObject {
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// Builds model objects and coerces primitive values.
pub trait ObjectInstantiator: Send + Sync {
    /// Instantiates `model_id` from `data`, failing on any validation error.
    fn instantiate(&self, model_id: &str, data: &Value) -> Result<ModelObject, InstantiationError>;

    /// Applies defaults and derived fields without validating.
    fn instantiate_lenient(&self, model_id: &str, data: &Value) -> Result<ModelObject, InstantiationError>;

    /// Converts `value` into the primitive `type_name` (`str`, `int`, `float`, `bool`).
    fn coerce_primitive(&self, value: &Value, type_name: &str) -> Result<Value, InstantiationError>;

    fn has_model(&self, model_id: &str) -> bool;
}

/// Default instantiator over the models of a catalog.
pub struct ModelInstantiator {
    catalog: Arc<SystemCatalog>,
    resolver: Arc<dyn TemplateResolver>,
}

impl ModelInstantiator {
    pub fn new(catalog: Arc<SystemCatalog>) -> Self {
        Self {
            catalog,
            resolver: Arc::new(ExpressionResolver),
        }
    }

    /// Uses `resolver` for derived formulas and validation rules.
    pub fn with_resolver(mut self, resolver: Arc<dyn TemplateResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    fn build(&self, model_id: &str, data: &Value, strict: bool) -> Result<ModelObject, InstantiationError> {
        let attributes = self
            .catalog
            .model_attributes(model_id)
            .ok_or_else(|| InstantiationError::UnknownModel(model_id.to_string()))?;
        let mut fields = match data {
            Value::Object(map) => map.clone(),
            Value::Null => JsonMap::new(),
            _ => {
                return Err(InstantiationError::NotAMapping {
                    model: model_id.to_string(),
                });
            }
        };
        fields.insert("model".to_string(), Value::String(model_id.to_string()));

        let mut errors = Vec::new();
        self.apply_attributes(&attributes, &mut fields, &[], strict, &mut errors);
        self.apply_derived(&attributes, &mut fields, strict, &mut errors);

        if strict {
            validate_attributes(&attributes, &fields, &[], &mut errors);
            if let Some(model) = self.catalog.model(model_id) {
                for rule in &model.validations {
                    match evaluate_condition(self.resolver.as_ref(), &rule.expression, &fields) {
                        Ok(true) => {}
                        Ok(false) => errors.push(rule.message.clone()),
                        Err(error) => errors.push(error.to_string()),
                    }
                }
            }
            if !errors.is_empty() {
                return Err(InstantiationError::Invalid {
                    model: model_id.to_string(),
                    errors,
                });
            }
        }

        Ok(ModelObject {
            model: model_id.to_string(),
            fields,
        })
    }

    /// Fills defaults and coerces typed attributes, depth first through groups.
    fn apply_attributes(
        &self,
        attributes: &IndexMap<String, AttributeNode>,
        fields: &mut JsonMap<String, Value>,
        parent: &[&str],
        strict: bool,
        errors: &mut Vec<String>,
    ) {
        for (name, node) in attributes {
            let path = attribute_path(parent, name);
            match node {
                AttributeNode::Group(children) => {
                    let group = fields.entry(name.clone()).or_insert_with(|| Value::Object(JsonMap::new()));
                    if group.is_null() {
                        *group = Value::Object(JsonMap::new());
                    }
                    if let Value::Object(group_fields) = group {
                        let mut nested_parent = parent.to_vec();
                        nested_parent.push(name);
                        self.apply_attributes(children, group_fields, &nested_parent, strict, errors);
                    } else if strict {
                        errors.push(format!("'{path}' must be a mapping"));
                    }
                }
                AttributeNode::Attribute(definition) => {
                    if definition.derived.is_some() {
                        continue;
                    }
                    let current = fields.get(name).filter(|value| !value.is_null()).cloned();
                    match current {
                        None => {
                            if let Some(default) = &definition.default {
                                fields.insert(name.clone(), default.clone());
                            }
                        }
                        Some(value) => match self.coerce_attribute(definition, &value, strict) {
                            Ok(coerced) => {
                                fields.insert(name.clone(), coerced);
                            }
                            Err(error) if strict => errors.push(format!("'{path}': {error}")),
                            Err(error) => debug!(attribute = %path, error = %error, "keeping uncoerced attribute value"),
                        },
                    }
                }
            }
        }
    }

    fn coerce_attribute(&self, definition: &AttributeDefinition, value: &Value, strict: bool) -> Result<Value, InstantiationError> {
        let type_name = definition.r#type.as_str();
        if is_primitive_type(type_name) {
            return self.coerce_primitive(value, type_name);
        }
        if self.catalog.model(type_name).is_some() {
            return self.build(type_name, value, strict).map(ModelObject::into_value);
        }
        match (type_name, value, definition.of.as_deref()) {
            ("list", Value::Array(items), Some(element_type)) => {
                let element = AttributeDefinition {
                    r#type: element_type.to_string(),
                    ..Default::default()
                };
                items
                    .iter()
                    .map(|item| self.coerce_attribute(&element, item, strict))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::Array)
            }
            _ => Ok(value.clone()),
        }
    }

    /// Computes derived attributes in declaration order; later formulas see
    /// earlier results.
    fn apply_derived(
        &self,
        attributes: &IndexMap<String, AttributeNode>,
        fields: &mut JsonMap<String, Value>,
        strict: bool,
        errors: &mut Vec<String>,
    ) {
        let mut derived = Vec::new();
        collect_derived(attributes, &mut Vec::new(), &mut derived);

        for (segments, definition) in derived {
            let Some(formula) = definition.derived.as_deref() else {
                continue;
            };
            let path = join_path(&segments);
            let computed = self
                .resolver
                .resolve(formula, &*fields)
                .map_err(InstantiationError::from)
                .and_then(|value| {
                    if is_primitive_type(&definition.r#type) {
                        self.coerce_primitive(&value, &definition.r#type)
                    } else {
                        Ok(value)
                    }
                });
            match computed {
                Ok(value) => insert_at(fields, &segments, value),
                Err(error) if strict => errors.push(format!("derived '{path}': {error}")),
                Err(error) => debug!(attribute = %path, error = %error, "skipping derived attribute"),
            }
        }
    }
}

impl ObjectInstantiator for ModelInstantiator {
    fn instantiate(&self, model_id: &str, data: &Value) -> Result<ModelObject, InstantiationError> {
        self.build(model_id, data, true)
    }

    fn instantiate_lenient(&self, model_id: &str, data: &Value) -> Result<ModelObject, InstantiationError> {
        self.build(model_id, data, false)
    }

    fn coerce_primitive(&self, value: &Value, type_name: &str) -> Result<Value, InstantiationError> {
        coerce_primitive(value, type_name)
    }

    fn has_model(&self, model_id: &str) -> bool {
        self.catalog.model(model_id).is_some()
    }
}

/// Converts a value into a primitive type. Null stays null for every type.
pub fn coerce_primitive(value: &Value, type_name: &str) -> Result<Value, InstantiationError> {
    if value.is_null() {
        return Ok(Value::Null);
    }
    let failure = || InstantiationError::Coercion {
        value: value.to_string(),
        target: type_name.to_string(),
    };
    match type_name {
        "str" | "roll" => Ok(Value::String(render_text(value))),
        "int" => match value {
            Value::Number(number) => match number.as_i64() {
                Some(integer) => Ok(Value::from(integer)),
                None => number
                    .as_f64()
                    .filter(|float| float.fract() == 0.0 && float.is_finite())
                    .map(|float| Value::from(float as i64))
                    .ok_or_else(failure),
            },
            Value::Bool(flag) => Ok(Value::from(i64::from(*flag))),
            Value::String(text) => {
                let trimmed = text.trim();
                trimmed
                    .parse::<i64>()
                    .ok()
                    .or_else(|| {
                        trimmed
                            .parse::<f64>()
                            .ok()
                            .filter(|float| float.fract() == 0.0 && float.is_finite())
                            .map(|float| float as i64)
                    })
                    .map(Value::from)
                    .ok_or_else(failure)
            }
            _ => Err(failure()),
        },
        "float" => {
            let float = match value {
                Value::Number(number) => number.as_f64(),
                Value::Bool(flag) => Some(if *flag { 1.0 } else { 0.0 }),
                Value::String(text) => text.trim().parse::<f64>().ok(),
                _ => None,
            };
            float.and_then(Number::from_f64).map(Value::Number).ok_or_else(failure)
        }
        "bool" => Ok(Value::Bool(match value {
            Value::Bool(flag) => *flag,
            Value::String(text) => matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1" | "on"),
            Value::Number(number) => number.as_f64().is_some_and(|float| float != 0.0),
            Value::Array(items) => !items.is_empty(),
            Value::Object(map) => !map.is_empty(),
            Value::Null => false,
        })),
        other => Err(InstantiationError::UnsupportedType(other.to_string())),
    }
}

fn attribute_path(parent: &[&str], name: &str) -> String {
    let mut segments = parent.to_vec();
    segments.push(name);
    join_path(&segments)
}

fn collect_derived<'a>(
    attributes: &'a IndexMap<String, AttributeNode>,
    parent: &mut Vec<String>,
    derived: &mut Vec<(Vec<String>, &'a AttributeDefinition)>,
) {
    for (name, node) in attributes {
        match node {
            AttributeNode::Group(children) => {
                parent.push(name.clone());
                collect_derived(children, parent, derived);
                parent.pop();
            }
            AttributeNode::Attribute(definition) if definition.derived.is_some() => {
                let mut segments = parent.clone();
                segments.push(name.clone());
                derived.push((segments, definition));
            }
            AttributeNode::Attribute(_) => {}
        }
    }
}

fn insert_at(fields: &mut JsonMap<String, Value>, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut current = fields;
    for segment in parents {
        let entry = current.entry(segment.clone()).or_insert_with(|| Value::Object(JsonMap::new()));
        if !entry.is_object() {
            *entry = Value::Object(JsonMap::new());
        }
        let Value::Object(next) = entry else {
            return;
        };
        current = next;
    }
    current.insert(last.clone(), value);
}

fn validate_attributes(attributes: &IndexMap<String, AttributeNode>, fields: &JsonMap<String, Value>, parent: &[&str], errors: &mut Vec<String>) {
    for (name, node) in attributes {
        let path = attribute_path(parent, name);
        let value = fields.get(name).filter(|value| !value.is_null());
        match node {
            AttributeNode::Group(children) => {
                if let Some(Value::Object(group_fields)) = value {
                    let mut nested_parent = parent.to_vec();
                    nested_parent.push(name);
                    validate_attributes(children, group_fields, &nested_parent, errors);
                }
            }
            AttributeNode::Attribute(definition) => {
                let Some(value) = value else {
                    if !definition.optional && definition.default.is_none() && definition.derived.is_none() {
                        errors.push(format!("missing required attribute '{path}'"));
                    }
                    continue;
                };
                if let Some(range) = definition.range.as_deref()
                    && let Some(message) = check_range(value, range)
                {
                    errors.push(format!("'{path}' {message}"));
                }
                if let Some(allowed) = &definition.enumeration
                    && !allowed.contains(value)
                {
                    let options: Vec<String> = allowed.iter().map(render_text).collect();
                    errors.push(format!("'{path}' must be one of [{}], found {}", options.join(", "), render_text(value)));
                }
            }
        }
    }
}

/// Checks an inclusive range written `low..high`, `low..`, or `..high`.
/// Returns a message when the value falls outside it.
fn check_range(value: &Value, range: &str) -> Option<String> {
    let (low, high) = range.split_once("..")?;
    let bound = |text: &str| -> Option<f64> { text.trim().parse::<f64>().ok() };
    let Some(number) = value.as_f64() else {
        return Some(format!("must be a number within {range}"));
    };
    let below = bound(low).is_some_and(|low| number < low);
    let above = bound(high).is_some_and(|high| number > high);
    (below || above).then(|| format!("must be within {range}, found {}", render_text(value)))
}
