//! Field-by-field merging of configuration tiers.
//!
//! Objects merge key by key; anything else (lists included) is replaced by
//! the higher tier. A `null` in the higher tier means "not specified".

use serde_json::Value;

/// Merge `overlay` onto `base`, overlay winning.
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Object(mut merged), Value::Object(upper)) => {
            for (key, value) in upper {
                let next = match merged.remove(&key) {
                    Some(lower) => deep_merge(lower, value),
                    None => value,
                };
                merged.insert(key, next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base,
        (_, overlay) => overlay,
    }
}

/// Fold tiers lowest-first.
pub fn deep_merge_all(tiers: impl IntoIterator<Item = Value>) -> Value {
    tiers.into_iter().fold(Value::Null, deep_merge)
}
