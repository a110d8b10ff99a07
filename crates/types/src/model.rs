//! Model records: typed, defaulted, and derived attribute trees describing
//! structured game objects such as characters or items.

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Primitive type names understood by the coercer. `roll` is dice notation
/// carried as a string.
pub const PRIMITIVE_TYPES: [&str; 5] = ["str", "int", "float", "bool", "roll"];

/// Returns true for primitive (non-model) type names.
pub fn is_primitive_type(type_name: &str) -> bool {
    PRIMITIVE_TYPES.contains(&type_name)
}

/// Schema of a structured game object.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ModelDefinition {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Parent models whose attributes are inherited; later parents and the
    /// model itself override earlier definitions of the same attribute.
    #[serde(default)]
    pub extends: Vec<String>,
    /// Attribute tree in authoring order.
    #[serde(default)]
    pub attributes: IndexMap<String, AttributeNode>,
    /// Object-level rules evaluated after defaults and derived values.
    #[serde(default)]
    pub validations: Vec<ValidationRule>,
}

/// A node of a model's attribute tree: a typed attribute or a nested group of
/// attributes authored without a `type` key.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum AttributeNode {
    Attribute(AttributeDefinition),
    Group(IndexMap<String, AttributeNode>),
}

impl AttributeNode {
    /// Declared type of a leaf attribute; groups have none.
    pub fn type_name(&self) -> Option<&str> {
        match self {
            AttributeNode::Attribute(definition) => Some(definition.r#type.as_str()),
            AttributeNode::Group(_) => None,
        }
    }

    fn from_value(value: Value) -> Result<Self, String> {
        match value {
            Value::String(type_name) => Ok(AttributeNode::Attribute(AttributeDefinition {
                r#type: type_name,
                ..Default::default()
            })),
            Value::Object(map) if map.contains_key("type") => serde_json::from_value(Value::Object(map))
                .map(AttributeNode::Attribute)
                .map_err(|error| error.to_string()),
            Value::Object(map) => {
                let mut children = IndexMap::with_capacity(map.len());
                for (name, child) in map {
                    children.insert(name, AttributeNode::from_value(child)?);
                }
                Ok(AttributeNode::Group(children))
            }
            other => Err(format!("attribute must be a type name or a mapping, found {other}")),
        }
    }
}

impl<'de> Deserialize<'de> for AttributeNode {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        AttributeNode::from_value(value).map_err(serde::de::Error::custom)
    }
}

/// A typed model attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct AttributeDefinition {
    /// Primitive type name, `list`, `dict`, or another model id.
    #[serde(rename = "type")]
    pub r#type: String,
    /// Value applied when the attribute is absent.
    #[serde(default)]
    pub default: Option<Value>,
    /// Inclusive numeric range such as `1..20`, `0..`, or `..10`.
    #[serde(default)]
    pub range: Option<String>,
    /// Allowed values.
    #[serde(default, rename = "enum")]
    pub enumeration: Option<Vec<Value>>,
    /// Template formula computed from the object's other fields.
    #[serde(default)]
    pub derived: Option<String>,
    /// Element type for `list` attributes.
    #[serde(default)]
    pub of: Option<String>,
    /// When true the attribute may be absent or null.
    #[serde(default)]
    pub optional: bool,
}

/// Object-level validation rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationRule {
    /// Boolean expression evaluated against the object's fields.
    pub expression: String,
    /// Message reported when the expression is falsy.
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attributes_accept_shorthand_full_and_grouped_forms() {
        let yaml = r#"
id: character
attributes:
  name: str
  level:
    type: int
    default: 1
    range: "1..20"
  stats:
    strength:
      type: int
      default: 10
    modifier:
      type: int
      derived: "{{ (stats.strength - 10) // 2 }}"
"#;
        let model: ModelDefinition = serde_yaml::from_str(yaml).expect("parse model");
        assert_eq!(model.attributes["name"].type_name(), Some("str"));

        let AttributeNode::Attribute(level) = &model.attributes["level"] else {
            panic!("level should be a typed attribute");
        };
        assert_eq!(level.range.as_deref(), Some("1..20"));
        assert_eq!(level.default, Some(Value::from(1)));

        let AttributeNode::Group(stats) = &model.attributes["stats"] else {
            panic!("stats should be an attribute group");
        };
        assert_eq!(stats["strength"].type_name(), Some("int"));
        assert!(matches!(&stats["modifier"], AttributeNode::Attribute(definition) if definition.derived.is_some()));
    }

    #[test]
    fn primitive_type_names_are_recognized() {
        assert!(is_primitive_type("int"));
        assert!(is_primitive_type("roll"));
        assert!(!is_primitive_type("character"));
    }
}
