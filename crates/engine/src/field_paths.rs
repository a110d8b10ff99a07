//! Dotted field path helpers shared by the context, the resolver, and the
//! type resolver.
//!
//! Paths are written `variables.hero.stats.hp`, with optional bracket
//! indexing (`items[0]`, `table["key"]`). Numeric segments index lists.

use serde_json::Value;

/// Splits a path into its segments.
///
/// Bracketed segments are unquoted, so `a["b"][0].c` yields `a`, `b`, `0`,
/// `c`. Empty segments are dropped.
pub fn split_path(path: &str) -> Vec<String> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut characters = path.trim().chars().peekable();

    while let Some(character) = characters.next() {
        match character {
            '.' => push_segment(&mut segments, &mut current),
            '[' => {
                push_segment(&mut segments, &mut current);
                let mut inner = String::new();
                for next in characters.by_ref() {
                    if next == ']' {
                        break;
                    }
                    inner.push(next);
                }
                let inner = inner.trim().trim_matches(|quote| quote == '"' || quote == '\'');
                if !inner.is_empty() {
                    segments.push(inner.to_string());
                }
            }
            other => current.push(other),
        }
    }
    push_segment(&mut segments, &mut current);
    segments
}

fn push_segment(segments: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        segments.push(trimmed.to_string());
    }
    current.clear();
}

/// Joins segments back into dotted form.
pub fn join_path<S: AsRef<str>>(segments: &[S]) -> String {
    segments.iter().map(AsRef::as_ref).collect::<Vec<_>>().join(".")
}

/// Walks `segments` through nested mappings and lists.
pub fn lookup_in_value<'a, S: AsRef<str>>(value: &'a Value, segments: &[S]) -> Option<&'a Value> {
    segments.iter().try_fold(value, |current, segment| child(current, segment.as_ref()))
}

/// One step of descent: a mapping key or a list index.
pub fn child<'a>(value: &'a Value, segment: &str) -> Option<&'a Value> {
    match value {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|index| items.get(index)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn split_path_handles_dots_and_brackets() {
        assert_eq!(split_path("variables.hero.hp"), vec!["variables", "hero", "hp"]);
        assert_eq!(split_path("items[0].name"), vec!["items", "0", "name"]);
        assert_eq!(split_path("table[\"gold coins\"]"), vec!["table", "gold coins"]);
        assert_eq!(split_path(" result "), vec!["result"]);
        assert!(split_path("").is_empty());
    }

    #[test]
    fn lookup_descends_through_maps_and_lists() {
        let value = json!({"party": [{"name": "Ada"}, {"name": "Brom"}]});
        assert_eq!(lookup_in_value(&value, &["party", "1", "name"]), Some(&json!("Brom")));
        assert_eq!(lookup_in_value(&value, &["party", "9"]), None);
        assert_eq!(lookup_in_value(&value, &["party", "x"]), None);
        assert_eq!(join_path(&["a", "b"]), "a.b");
    }
}
