//! Recursive JSON document merge
//!
//! Used to compose the JSON configuration variable handed to each container:
//! the service's declared document is the base and the infrastructure keys
//! are the overlay, so declared keys on non-conflicting paths survive while
//! infrastructure keys are always present.

use serde_json::Value;

/// Merge `overlay` into `base` and return the result.
///
/// - keys missing from `base` are inserted
/// - two objects merge key by key
/// - two arrays merge index by index; overlay elements past the end of
///   `base` are appended and base-only tail elements are kept
/// - anything else is replaced by the overlay value
///
/// Overlay wins on conflicts, and merging the same overlay twice is a no-op.
pub fn merge(mut base: Value, overlay: &Value) -> Value {
    merge_into(&mut base, overlay);
    base
}

/// In-place variant of [`merge`]
pub fn merge_into(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_into(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items)) => {
            for (index, value) in overlay_items.iter().enumerate() {
                match base_items.get_mut(index) {
                    Some(existing) => merge_into(existing, value),
                    None => base_items.push(value.clone()),
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Parse two JSON documents, merge them and serialize the result.
///
/// A blank base counts as `{}`.
pub fn merge_json_str(base: &str, overlay: &str) -> serde_json::Result<String> {
    let base: Value = if base.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(base)?
    };
    let overlay: Value = serde_json::from_str(overlay)?;
    serde_json::to_string(&merge(base, &overlay))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_inserts_missing_keys() {
        let merged = merge(json!({"a": 1}), &json!({"b": 2}));
        assert_eq!(merged, json!({"a": 1, "b": 2}));
    }

    #[test]
    fn test_scalar_conflict_resolves_to_overlay() {
        let merged = merge(json!({"server": {"port": 9090}}), &json!({"server": {"port": 8080}}));
        assert_eq!(merged, json!({"server": {"port": 8080}}));
    }

    #[test]
    fn test_nested_objects_keep_non_conflicting_keys() {
        let base = json!({
            "eureka": {"client": {"enabled": true}},
            "logging": {"level": "debug"}
        });
        let overlay = json!({
            "eureka": {"client": {"serviceUrl": {"defaultZone": "http://registry/eureka"}}}
        });

        let merged = merge(base, &overlay);
        assert_eq!(
            merged,
            json!({
                "eureka": {"client": {
                    "enabled": true,
                    "serviceUrl": {"defaultZone": "http://registry/eureka"}
                }},
                "logging": {"level": "debug"}
            })
        );
    }

    #[test]
    fn test_array_keeps_base_only_tail() {
        let merged = merge(json!({"xs": [1, 2, 3]}), &json!({"xs": [9]}));
        assert_eq!(merged, json!({"xs": [9, 2, 3]}));
    }

    #[test]
    fn test_array_appends_overlay_tail() {
        let merged = merge(json!({"xs": [{"a": 1}]}), &json!({"xs": [{"b": 2}, {"c": 3}]}));
        assert_eq!(merged, json!({"xs": [{"a": 1, "b": 2}, {"c": 3}]}));
    }

    #[test]
    fn test_type_mismatch_takes_overlay() {
        let merged = merge(json!({"a": [1, 2]}), &json!({"a": {"k": "v"}}));
        assert_eq!(merged, json!({"a": {"k": "v"}}));

        let merged = merge(json!("scalar"), &json!({"k": "v"}));
        assert_eq!(merged, json!({"k": "v"}));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let base = json!({
            "a": {"b": [1, {"c": 2}], "d": "keep"},
            "e": [1, 2, 3, 4]
        });
        let overlay = json!({
            "a": {"b": [5, {"x": 1}, 7], "f": null},
            "e": [0],
            "g": {"h": true}
        });

        let once = merge(base, &overlay);
        let twice = merge(once.clone(), &overlay);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_merge_is_not_commutative() {
        let a = json!({"k": 1});
        let b = json!({"k": 2});
        assert_ne!(merge(a.clone(), &b), merge(b, &a));
    }

    #[test]
    fn test_merge_json_str_blank_base() {
        let merged = merge_json_str("", r#"{"server":{"port":8080}}"#).unwrap();
        assert_eq!(merged, r#"{"server":{"port":8080}}"#);
    }

    #[test]
    fn test_merge_json_str_rejects_invalid_json() {
        assert!(merge_json_str("{not json", "{}").is_err());
        assert!(merge_json_str("{}", "[").is_err());
    }
}
