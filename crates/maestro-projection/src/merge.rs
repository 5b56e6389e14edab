//! The deep-merge rule for accumulated task data.
//!
//! Object values merge key-wise; scalars and arrays are replaced by the
//! later value; `null` is ignored and never erases prior data. Payload
//! cycles are impossible by construction (`serde_json::Value` is a tree).

use serde_json::Value;

/// Merge `incoming` into `base` in place.
pub fn deep_merge(base: &mut Value, incoming: &Value) {
    match incoming {
        // Nulls never erase accumulated data
        Value::Null => {}
        Value::Object(incoming_map) => {
            if !base.is_object() {
                *base = Value::Object(serde_json::Map::new());
            }
            let base_map = base.as_object_mut().expect("object ensured above");
            for (key, value) in incoming_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        other => {
            *base = other.clone();
        }
    }
}

/// Merge `incoming` under a dot-path inside `base` (e.g. `"business.name"`),
/// creating intermediate objects as needed.
pub fn deep_merge_at(base: &mut Value, path: &str, incoming: &Value) {
    if path.is_empty() {
        deep_merge(base, incoming);
        return;
    }
    let mut nested = incoming.clone();
    for segment in path.rsplit('.') {
        let mut map = serde_json::Map::new();
        map.insert(segment.to_string(), nested);
        nested = Value::Object(map);
    }
    deep_merge(base, &nested);
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_objects_merge_keywise() {
        let mut base = json!({"a": {"x": 1}, "b": 2});
        deep_merge(&mut base, &json!({"a": {"y": 3}, "c": 4}));
        assert_eq!(base, json!({"a": {"x": 1, "y": 3}, "b": 2, "c": 4}));
    }

    #[test]
    fn test_later_scalar_replaces_earlier() {
        let mut base = json!({"a": 1});
        deep_merge(&mut base, &json!({"a": 2}));
        assert_eq!(base, json!({"a": 2}));
    }

    #[test]
    fn test_arrays_replace_not_concatenate() {
        let mut base = json!({"items": [1, 2]});
        deep_merge(&mut base, &json!({"items": [3]}));
        assert_eq!(base, json!({"items": [3]}));
    }

    #[test]
    fn test_null_never_erases() {
        let mut base = json!({"a": 1, "b": {"x": 2}});
        deep_merge(&mut base, &json!({"a": null, "b": null}));
        assert_eq!(base, json!({"a": 1, "b": {"x": 2}}));
    }

    #[test]
    fn test_top_level_null_is_noop() {
        let mut base = json!({"a": 1});
        deep_merge(&mut base, &Value::Null);
        assert_eq!(base, json!({"a": 1}));
    }

    #[test]
    fn test_merge_at_nests_under_path() {
        let mut base = json!({});
        deep_merge_at(&mut base, "business.contact", &json!({"email": "a@b.io"}));
        assert_eq!(base, json!({"business": {"contact": {"email": "a@b.io"}}}));
    }

    #[test]
    fn test_merge_at_empty_path_merges_at_root() {
        let mut base = json!({"a": 1});
        deep_merge_at(&mut base, "", &json!({"b": 2}));
        assert_eq!(base, json!({"a": 1, "b": 2}));
    }
}
