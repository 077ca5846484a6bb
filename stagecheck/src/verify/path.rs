//! Dotted paths into JSON documents.
//!
//! `Vpcs.0.CidrBlock` walks object keys and array indices; `Vpcs.*.VpcId`
//! collects a field from every element of an array. The empty path selects
//! the whole document.

use serde_json::Value;

/// Selects the value at `path`, or `None` if the path does not match.
#[must_use]
pub fn select(value: &Value, path: &str) -> Option<Value> {
    let path = path.trim();
    if path.is_empty() {
        return Some(value.clone());
    }
    let segments: Vec<&str> = path.split('.').collect();
    select_segments(value, &segments)
}

fn select_segments(value: &Value, segments: &[&str]) -> Option<Value> {
    let Some((head, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match (*head, value) {
        ("*", Value::Array(items)) => Some(Value::Array(
            items.iter().filter_map(|item| select_segments(item, rest)).collect(),
        )),
        (key, Value::Object(map)) => map.get(key).and_then(|v| select_segments(v, rest)),
        (index, Value::Array(items)) => index
            .parse::<usize>()
            .ok()
            .and_then(|i| items.get(i))
            .and_then(|v| select_segments(v, rest)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vpcs() -> Value {
        json!({
            "Vpcs": [
                { "VpcId": "vpc-1", "CidrBlock": "10.0.0.0/16", "Tags": [{ "Key": "Name", "Value": "a" }] },
                { "VpcId": "vpc-2", "CidrBlock": "10.1.0.0/16" }
            ]
        })
    }

    #[test]
    fn test_keys_and_indices() {
        assert_eq!(select(&vpcs(), "Vpcs.1.VpcId"), Some(json!("vpc-2")));
        assert_eq!(select(&vpcs(), "Vpcs.0.Tags.0.Value"), Some(json!("a")));
        assert_eq!(select(&vpcs(), ""), Some(vpcs()));
    }

    #[test]
    fn test_wildcard_collects_from_every_element() {
        assert_eq!(select(&vpcs(), "Vpcs.*.VpcId"), Some(json!(["vpc-1", "vpc-2"])));
        // Elements lacking the field are skipped.
        assert_eq!(select(&vpcs(), "Vpcs.*.Tags"), Some(json!([[{ "Key": "Name", "Value": "a" }]])));
    }

    #[test]
    fn test_missing_paths() {
        assert_eq!(select(&vpcs(), "Subnets"), None);
        assert_eq!(select(&vpcs(), "Vpcs.5"), None);
        assert_eq!(select(&vpcs(), "Vpcs.first"), None);
        assert_eq!(select(&json!("text"), "length"), None);
    }
}
