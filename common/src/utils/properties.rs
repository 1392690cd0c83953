use serde_json::{Map, Value};
use tracing::warn;

/// Normalizes a caller-supplied metadata bag into the flat shape the store
/// accepts: nested objects become JSON strings, list elements are normalized
/// the same way, and scalars pass through. Date-like values arrive as
/// ISO-8601 strings in JSON and are stored as-is.
pub fn normalize_property_bag(metadata: Map<String, Value>) -> Map<String, Value> {
    let mut normalized = Map::with_capacity(metadata.len());
    for (key, value) in metadata {
        normalized.insert(key.clone(), normalize_value(&key, value));
    }
    normalized
}

fn normalize_value(key: &str, value: Value) -> Value {
    match value {
        Value::Object(_) => Value::String(value.to_string()),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| match item {
                    Value::Object(_) => Value::String(item.to_string()),
                    Value::Array(_) => {
                        warn!(key, "nested list flattened to JSON string");
                        Value::String(item.to_string())
                    }
                    scalar => scalar,
                })
                .collect(),
        ),
        scalar => scalar,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_objects_become_json_strings() {
        let mut bag = Map::new();
        bag.insert("specs".into(), json!({"cpu": "m3", "ram": 16}));
        bag.insert("price".into(), json!(999.5));

        let normalized = normalize_property_bag(bag);
        let specs = normalized.get("specs").and_then(Value::as_str).expect("string");
        assert!(specs.contains("\"cpu\""));
        assert_eq!(normalized.get("price"), Some(&json!(999.5)));
    }

    #[test]
    fn lists_keep_scalars_and_stringify_nested_dicts() {
        let mut bag = Map::new();
        bag.insert(
            "tags".into(),
            json!(["laptop", 2024, {"kind": "promo"}]),
        );

        let normalized = normalize_property_bag(bag);
        let tags = normalized.get("tags").and_then(Value::as_array).expect("array");
        assert_eq!(tags[0], json!("laptop"));
        assert_eq!(tags[1], json!(2024));
        assert!(tags[2].as_str().expect("stringified dict").contains("promo"));
    }

    #[test]
    fn iso_dates_pass_through_untouched() {
        let mut bag = Map::new();
        bag.insert("published".into(), json!("1926-10-14T00:00:00Z"));

        let normalized = normalize_property_bag(bag);
        assert_eq!(normalized.get("published"), Some(&json!("1926-10-14T00:00:00Z")));
    }
}
