use serde_json::Value;

/// Two worklist items are the same item when their `key` fields match.
/// Items without that field fall back to plain equality.
pub fn same_item(a: &Value, b: &Value, key: &str) -> bool {
    match (a.get(key), b.get(key)) {
        (Some(left), Some(right)) => left == right,
        _ => a == b,
    }
}

/// `total - completed`, by key, keeping the order of `total`.
pub fn remaining(total: &[Value], completed: &[Value], key: &str) -> Vec<Value> {
    total
        .iter()
        .filter(|item| !completed.iter().any(|done| same_item(item, done, key)))
        .cloned()
        .collect()
}
