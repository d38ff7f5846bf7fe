//! Read-modify-write helpers for user profiles.
//!
//! The store replaces whole values; accumulation happens here, before `put`.

use chatstate_core::{ProfileValue, Value};

/// Categories that collect distinct entries instead of being overwritten.
pub const LIST_CATEGORIES: [&str; 2] = ["facts", "preferences"];

/// Records `information` under `category`. Returns `false` when the profile
/// already held it.
pub fn remember(profile: &mut ProfileValue, category: &str, information: &str) -> bool {
    let entry = Value::String(information.to_string());
    if !LIST_CATEGORIES.contains(&category) {
        return profile.insert(category.to_string(), entry.clone()) != Some(entry);
    }

    let mut items = match profile.remove(category) {
        Some(Value::Array(items)) => items,
        // A scalar left by an older writer becomes the first entry.
        Some(previous) => vec![previous],
        None => Vec::new(),
    };
    let added = !items.contains(&entry);
    if added {
        items.push(entry);
    }
    profile.insert(category.to_string(), Value::Array(items));
    added
}

pub fn forget(profile: &mut ProfileValue, category: &str) -> bool {
    profile.remove(category).is_some()
}

/// One `category: value` line per field; list entries are comma separated.
pub fn render(profile: &ProfileValue) -> Vec<String> {
    profile
        .iter()
        .map(|(category, value)| format!("{category}: {}", render_value(value)))
        .collect()
}

pub fn render_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Array(items) => items
            .iter()
            .map(render_value)
            .collect::<Vec<_>>()
            .join(", "),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn profile(value: Value) -> ProfileValue {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[test]
    fn list_categories_accumulate_without_duplicates() {
        let mut value = ProfileValue::new();

        assert!(remember(&mut value, "facts", "works at a bakery"));
        assert!(remember(&mut value, "facts", "has a dog"));
        assert!(!remember(&mut value, "facts", "has a dog"));

        assert_eq!(value["facts"], json!(["works at a bakery", "has a dog"]));
    }

    #[test]
    fn scalar_preferences_are_promoted_to_a_list() {
        let mut value = profile(json!({"preferences": "tea"}));

        assert!(remember(&mut value, "preferences", "rust"));
        assert_eq!(value["preferences"], json!(["tea", "rust"]));
    }

    #[test]
    fn other_categories_overwrite() {
        let mut value = profile(json!({"name": "Tom"}));

        assert!(remember(&mut value, "name", "Thomas"));
        assert!(!remember(&mut value, "name", "Thomas"));
        assert_eq!(value["name"], json!("Thomas"));
    }

    #[test]
    fn forget_removes_only_the_category() {
        let mut value = profile(json!({"name": "Tom", "facts": ["a"]}));

        assert!(forget(&mut value, "facts"));
        assert!(!forget(&mut value, "facts"));
        assert_eq!(value, profile(json!({"name": "Tom"})));
    }

    #[test]
    fn render_joins_lists() {
        let value = profile(json!({"facts": ["a", "b"], "age": 42, "name": "Tom"}));

        assert_eq!(render(&value), vec!["age: 42", "facts: a, b", "name: Tom"]);
    }
}
