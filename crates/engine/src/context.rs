//! Immutable-update execution context.
//!
//! The context holds the namespaces a flow reads and writes (`inputs`,
//! `outputs`, `variables`, `steps`, `sub_flows`) plus a transient alias scope
//! (`result`, `item`, `entry`, ...). Every write returns a new context.
//! Namespaces and entries are reference counted, so a write copies only the
//! namespace map and the entry it touches; everything else stays shared with
//! the context it was derived from.

use std::fmt;
use std::sync::Arc;

use indexmap::IndexMap;
use serde_json::{Map as JsonMap, Value};
use tracing::warn;

use crate::error::{ContextError, TemplateError};
use crate::field_paths::{join_path, lookup_in_value, split_path};
use crate::resolve::{ExpressionResolver, Scope, TemplateResolver, evaluate_condition};

/// Namespace names that can never be written as a single-segment alias.
pub const RESERVED_NAMESPACES: [&str; 5] = ["inputs", "outputs", "variables", "steps", "sub_flows"];

/// Namespaces whose entries are declared by the flow definition.
const DECLARED_NAMESPACES: [&str; 3] = ["inputs", "outputs", "variables"];

/// Validation state of a namespace entry.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Untyped or primitive value.
    #[default]
    Plain,
    /// Model-typed mapping that has not passed strict instantiation.
    Raw { model: String },
    /// Model-typed mapping produced by a successful instantiation.
    Validated { model: String },
}

/// One `namespace.entry` value with its validation state.
#[derive(Debug, Clone)]
pub struct Slot {
    value: Arc<Value>,
    state: SlotState,
}

impl Slot {
    fn new(value: Value, state: SlotState) -> Self {
        Self {
            value: Arc::new(value),
            state,
        }
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    pub fn state(&self) -> &SlotState {
        &self.state
    }
}

type Namespace = IndexMap<String, Slot>;

/// Leaf-level difference between two contexts, replayable onto a third.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextChange {
    Write { path: Vec<String>, value: Value },
    Retag { namespace: String, entry: String, state: SlotState },
}

/// Namespaced value store for one flow run.
#[derive(Clone)]
pub struct ExecutionContext {
    namespaces: Arc<IndexMap<String, Arc<Namespace>>>,
    aliases: Arc<IndexMap<String, Value>>,
    resolver: Arc<dyn TemplateResolver>,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("namespaces", &self.namespaces.keys().collect::<Vec<_>>())
            .field("aliases", &self.aliases.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutionContext {
    /// Creates a context with empty `inputs`, `outputs`, and `variables`.
    pub fn new() -> Self {
        let namespaces = DECLARED_NAMESPACES
            .iter()
            .map(|name| (name.to_string(), Arc::new(Namespace::new())))
            .collect();
        Self {
            namespaces: Arc::new(namespaces),
            aliases: Arc::new(IndexMap::new()),
            resolver: Arc::new(ExpressionResolver),
        }
    }

    /// Returns a context that resolves templates with `resolver`.
    pub fn bind_resolver(&self, resolver: Arc<dyn TemplateResolver>) -> Self {
        let mut next = self.clone();
        next.resolver = resolver;
        next
    }

    pub fn resolver(&self) -> &dyn TemplateResolver {
        self.resolver.as_ref()
    }

    /// Reads the value at a dotted path. Namespace roots return a mapping of
    /// their entries.
    pub fn get(&self, path: &str) -> Option<Value> {
        self.lookup(&split_path(path))
    }

    pub fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    /// The slot behind `namespace.entry`.
    pub fn slot(&self, namespace: &str, entry: &str) -> Option<&Slot> {
        self.namespaces.get(namespace)?.get(entry)
    }

    /// Entries of one namespace in insertion order.
    pub fn entries(&self, namespace: &str) -> Vec<(&str, &Value)> {
        self.namespaces
            .get(namespace)
            .map(|entries| entries.iter().map(|(id, slot)| (id.as_str(), slot.value())).collect())
            .unwrap_or_default()
    }

    /// Writes `value` at `path`, creating intermediate mappings as needed.
    ///
    /// A single-segment path writes an alias. Writing below an entry tagged
    /// [`SlotState::Validated`] demotes it to [`SlotState::Raw`].
    pub fn set(&self, path: &str, value: Value) -> Result<Self, ContextError> {
        let mut next = self.clone();
        next.write(&split_path(path), value, None)?;
        Ok(next)
    }

    /// Like [`set`](Self::set), tagging the entry with `state` when `path`
    /// names a whole `namespace.entry`.
    pub fn set_tagged(&self, path: &str, value: Value, state: SlotState) -> Result<Self, ContextError> {
        let mut next = self.clone();
        next.write(&split_path(path), value, Some(state))?;
        Ok(next)
    }

    /// Re-tags an existing `namespace.entry` slot.
    pub fn retag(&self, path: &str, state: SlotState) -> Result<Self, ContextError> {
        let segments = split_path(path);
        let [namespace, entry] = segments.as_slice() else {
            return Ok(self.clone());
        };
        let mut next = self.clone();
        next.retag_slot(namespace, entry, state);
        Ok(next)
    }

    /// Drops every alias written by the current step.
    pub fn clear_aliases(&self) -> Self {
        if self.aliases.is_empty() {
            return self.clone();
        }
        let mut next = self.clone();
        next.aliases = Arc::new(IndexMap::new());
        next
    }

    /// Plain mapping view of every namespace and alias.
    pub fn snapshot(&self) -> Value {
        let mut root = JsonMap::new();
        for (name, entries) in self.namespaces.iter() {
            root.insert(name.clone(), namespace_value(entries));
        }
        for (name, value) in self.aliases.iter() {
            root.insert(name.clone(), value.clone());
        }
        Value::Object(root)
    }

    /// Resolves one template string; strings without markers pass through.
    pub fn resolve_template(&self, template: &str) -> Result<Value, TemplateError> {
        self.resolver.resolve(template, self)
    }

    /// Resolves every string nested inside `value`.
    pub fn resolve_value(&self, value: &Value) -> Result<Value, TemplateError> {
        match value {
            Value::String(template) => self.resolve_template(template),
            Value::Array(items) => items
                .iter()
                .map(|item| self.resolve_value(item))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(map) => {
                let mut resolved = JsonMap::with_capacity(map.len());
                for (key, nested) in map {
                    resolved.insert(key.clone(), self.resolve_value(nested)?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }

    /// Resolves a guard written as a template or a bare expression.
    pub fn evaluate_condition(&self, condition: &str) -> Result<bool, TemplateError> {
        evaluate_condition(self.resolver.as_ref(), condition, self)
    }

    /// Leaf-level writes that turn `base` into `self`.
    ///
    /// Unchanged namespaces and entries are skipped by pointer identity, so
    /// the cost is proportional to what changed.
    pub fn changes_since(&self, base: &ExecutionContext) -> Vec<ContextChange> {
        let mut changes = Vec::new();
        for (namespace, entries) in self.namespaces.iter() {
            let base_entries = base.namespaces.get(namespace);
            if base_entries.is_some_and(|base_entries| Arc::ptr_eq(base_entries, entries)) {
                continue;
            }
            for (entry, slot) in entries.iter() {
                let base_slot = base_entries.and_then(|base_entries| base_entries.get(entry));
                let path = vec![namespace.clone(), entry.clone()];
                match base_slot {
                    Some(base_slot) if Arc::ptr_eq(&base_slot.value, &slot.value) => {}
                    Some(base_slot) => diff_values(path, base_slot.value(), slot.value(), &mut changes),
                    None => changes.push(ContextChange::Write {
                        path,
                        value: slot.value().clone(),
                    }),
                }
                if base_slot.is_none_or(|base_slot| base_slot.state != slot.state) {
                    changes.push(ContextChange::Retag {
                        namespace: namespace.clone(),
                        entry: entry.clone(),
                        state: slot.state.clone(),
                    });
                }
            }
        }
        for (name, value) in self.aliases.iter() {
            if base.aliases.get(name) != Some(value) {
                changes.push(ContextChange::Write {
                    path: vec![name.clone()],
                    value: value.clone(),
                });
            }
        }
        changes
    }

    /// Replays changes collected by [`changes_since`](Self::changes_since).
    pub fn apply_changes(&self, changes: &[ContextChange]) -> Result<Self, ContextError> {
        let mut next = self.clone();
        for change in changes {
            match change {
                ContextChange::Write { path, value } => next.write(path, value.clone(), None)?,
                ContextChange::Retag { namespace, entry, state } => next.retag_slot(namespace, entry, state.clone()),
            }
        }
        Ok(next)
    }

    fn write(&mut self, segments: &[String], value: Value, state: Option<SlotState>) -> Result<(), ContextError> {
        let full_path = join_path(segments);
        match segments {
            [] => Err(ContextError::EmptyPath),
            [name] => {
                if RESERVED_NAMESPACES.contains(&name.as_str()) || self.namespaces.contains_key(name) {
                    return Err(ContextError::ReservedNamespace(name.clone()));
                }
                if self.shadows_declared_id(name) {
                    warn!(alias = %name, "alias shadows a declared flow field of the same name");
                }
                Arc::make_mut(&mut self.aliases).insert(name.clone(), value);
                Ok(())
            }
            [namespace, entry] => {
                let entries = self.namespace_mut(namespace);
                entries.insert(entry.clone(), Slot::new(value, state.unwrap_or_default()));
                Ok(())
            }
            [namespace, entry, rest @ ..] => {
                let entries = self.namespace_mut(namespace);
                let slot = entries
                    .entry(entry.clone())
                    .or_insert_with(|| Slot::new(Value::Object(JsonMap::new()), SlotState::Plain));
                let prefix = [namespace.as_str(), entry.as_str()];
                write_nested(Arc::make_mut(&mut slot.value), rest, value, &full_path, &prefix)?;
                if let SlotState::Validated { model } = &slot.state {
                    slot.state = SlotState::Raw { model: model.clone() };
                }
                Ok(())
            }
        }
    }

    fn retag_slot(&mut self, namespace: &str, entry: &str, state: SlotState) {
        let Some(entries) = Arc::make_mut(&mut self.namespaces).get_mut(namespace) else {
            return;
        };
        if let Some(slot) = Arc::make_mut(entries).get_mut(entry) {
            slot.state = state;
        }
    }

    fn namespace_mut(&mut self, namespace: &str) -> &mut Namespace {
        let namespaces = Arc::make_mut(&mut self.namespaces);
        let entries = namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| Arc::new(Namespace::new()));
        Arc::make_mut(entries)
    }

    fn shadows_declared_id(&self, name: &str) -> bool {
        DECLARED_NAMESPACES
            .iter()
            .any(|namespace| self.namespaces.get(*namespace).is_some_and(|entries| entries.contains_key(name)))
    }
}

impl Scope for ExecutionContext {
    fn lookup(&self, path: &[String]) -> Option<Value> {
        let (root, rest) = path.split_first()?;
        if let Some(alias) = self.aliases.get(root) {
            return lookup_in_value(alias, rest).cloned();
        }
        let entries = self.namespaces.get(root)?;
        let Some((entry, rest)) = rest.split_first() else {
            return Some(namespace_value(entries));
        };
        lookup_in_value(entries.get(entry)?.value(), rest).cloned()
    }
}

fn namespace_value(entries: &Namespace) -> Value {
    Value::Object(
        entries
            .iter()
            .map(|(id, slot)| (id.clone(), slot.value().clone()))
            .collect(),
    )
}

fn write_nested(target: &mut Value, rest: &[String], value: Value, full_path: &str, prefix: &[&str]) -> Result<(), ContextError> {
    let mut current = target;
    for (position, segment) in rest.iter().enumerate() {
        let is_last = position + 1 == rest.len();
        if current.is_null() {
            *current = Value::Object(JsonMap::new());
        }
        current = match current {
            Value::Object(map) => {
                if is_last {
                    map.insert(segment.clone(), value);
                    return Ok(());
                }
                map.entry(segment.clone()).or_insert_with(|| Value::Object(JsonMap::new()))
            }
            Value::Array(items) => {
                let parent = prefix_path(prefix, &rest[..position]);
                let index = segment.parse::<usize>().map_err(|_| ContextError::NotAMapping {
                    path: full_path.to_string(),
                    prefix: parent,
                })?;
                let element = items.get_mut(index).ok_or_else(|| ContextError::IndexOutOfBounds {
                    path: full_path.to_string(),
                    index,
                })?;
                if is_last {
                    *element = value;
                    return Ok(());
                }
                element
            }
            _ => {
                return Err(ContextError::NotAMapping {
                    path: full_path.to_string(),
                    prefix: prefix_path(prefix, &rest[..position]),
                });
            }
        };
    }
    Ok(())
}

fn prefix_path(prefix: &[&str], rest: &[String]) -> String {
    let segments: Vec<&str> = prefix.iter().copied().chain(rest.iter().map(String::as_str)).collect();
    join_path(&segments)
}

fn diff_values(path: Vec<String>, old: &Value, new: &Value, changes: &mut Vec<ContextChange>) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            for (key, new_value) in new_map {
                let mut child_path = path.clone();
                child_path.push(key.clone());
                match old_map.get(key) {
                    Some(old_value) if old_value == new_value => {}
                    Some(old_value) => diff_values(child_path, old_value, new_value, changes),
                    None => changes.push(ContextChange::Write {
                        path: child_path,
                        value: new_value.clone(),
                    }),
                }
            }
        }
        // Nested writes replace a null intermediate, so replay them leaf by leaf.
        (Value::Null, Value::Object(new_map)) if !new_map.is_empty() => {
            for (key, new_value) in new_map {
                let mut child_path = path.clone();
                child_path.push(key.clone());
                changes.push(ContextChange::Write {
                    path: child_path,
                    value: new_value.clone(),
                });
            }
        }
        _ if old != new => changes.push(ContextChange::Write { path, value: new.clone() }),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_returns_a_new_context_and_leaves_the_original_untouched() {
        let base = ExecutionContext::new().set("variables.hp", json!(10)).unwrap();
        let next = base.set("variables.hp", json!(4)).unwrap();
        assert_eq!(base.get("variables.hp"), Some(json!(10)));
        assert_eq!(next.get("variables.hp"), Some(json!(4)));
    }

    #[test]
    fn untouched_namespaces_stay_shared() {
        let base = ExecutionContext::new().set("inputs.name", json!("Ada")).unwrap();
        let next = base.set("variables.hp", json!(1)).unwrap();
        assert!(Arc::ptr_eq(&base.namespaces["inputs"], &next.namespaces["inputs"]));
        assert!(!Arc::ptr_eq(&base.namespaces["variables"], &next.namespaces["variables"]));
    }

    #[test]
    fn nested_writes_create_intermediate_mappings() {
        let context = ExecutionContext::new().set("variables.hero.stats.str", json!(14)).unwrap();
        assert_eq!(context.get("variables.hero"), Some(json!({"stats": {"str": 14}})));
        assert!(context.has("variables.hero.stats"));
        assert!(!context.has("variables.hero.stats.dex"));
    }

    #[test]
    fn writing_through_a_scalar_is_an_error() {
        let context = ExecutionContext::new().set("variables.hp", json!(3)).unwrap();
        let error = context.set("variables.hp.max", json!(9)).unwrap_err();
        assert_eq!(
            error,
            ContextError::NotAMapping {
                path: "variables.hp.max".into(),
                prefix: "variables.hp".into()
            }
        );
    }

    #[test]
    fn numeric_segments_index_lists() {
        let context = ExecutionContext::new()
            .set("variables.party", json!([{"name": "Ada"}, {"name": "Brom"}]))
            .unwrap();
        assert_eq!(context.get("variables.party.1.name"), Some(json!("Brom")));
        assert_eq!(context.get("variables.party[0].name"), Some(json!("Ada")));
        let renamed = context.set("variables.party.1.name", json!("Cora")).unwrap();
        assert_eq!(renamed.get("variables.party.1.name"), Some(json!("Cora")));
        assert!(matches!(
            context.set("variables.party.5.name", json!("x")),
            Err(ContextError::IndexOutOfBounds { index: 5, .. })
        ));
    }

    #[test]
    fn single_segment_paths_are_aliases_and_namespaces_are_reserved() {
        let context = ExecutionContext::new().set("result", json!({"total": 7})).unwrap();
        assert_eq!(context.get("result.total"), Some(json!(7)));
        assert_eq!(context.snapshot()["result"], json!({"total": 7}));
        assert_eq!(
            context.set("outputs", json!({})).unwrap_err(),
            ContextError::ReservedNamespace("outputs".into())
        );
        let cleared = context.clear_aliases();
        assert!(!cleared.has("result"));
    }

    #[test]
    fn nested_writes_demote_validated_slots() {
        let context = ExecutionContext::new()
            .set_tagged(
                "variables.hero",
                json!({"model": "hero", "hp": 3}),
                SlotState::Validated { model: "hero".into() },
            )
            .unwrap();
        let edited = context.set("variables.hero.hp", json!(-5)).unwrap();
        assert_eq!(edited.slot("variables", "hero").map(Slot::state), Some(&SlotState::Raw { model: "hero".into() }));
        assert_eq!(
            context.slot("variables", "hero").map(Slot::state),
            Some(&SlotState::Validated { model: "hero".into() })
        );
    }

    #[test]
    fn templates_resolve_against_namespaces_and_aliases() {
        let context = ExecutionContext::new()
            .set("inputs.n", json!(21))
            .unwrap()
            .set("item", json!("str"))
            .unwrap();
        assert_eq!(context.resolve_template("{{ inputs.n * 2 }}").unwrap(), json!(42));
        assert_eq!(context.resolve_template("roll for {{ item }}").unwrap(), json!("roll for str"));
        assert_eq!(context.resolve_template("plain").unwrap(), json!("plain"));
        assert_eq!(
            context.resolve_value(&json!({"a": ["{{ item|upper }}", 3]})).unwrap(),
            json!({"a": ["STR", 3]})
        );
        assert!(context.evaluate_condition("inputs.n > 20").unwrap());
    }

    #[test]
    fn changes_replay_disjoint_nested_writes() {
        let base = ExecutionContext::new().set("variables.hero", json!({"hp": 1, "mp": 1})).unwrap();
        let first = base.set("variables.hero.hp", json!(10)).unwrap();
        let second = base.set("variables.hero.mp", json!(20)).unwrap().set("entry", json!("x")).unwrap();

        let mut changes = first.changes_since(&base);
        changes.extend(second.changes_since(&base));
        let merged = base.apply_changes(&changes).unwrap();
        assert_eq!(merged.get("variables.hero"), Some(json!({"hp": 10, "mp": 20})));
        assert_eq!(merged.get("entry"), Some(json!("x")));
        assert!(base.changes_since(&base).is_empty());
    }
}
