//! Canonical JSON.
//!
//! Signatures over device keys and one-time keys are computed over the
//! canonical encoding of the object: no insignificant whitespace, object keys
//! in lexicographic order, and the `signatures` and `unsigned` members
//! removed.

use serde::Serialize;
use serde_json::Value;

use crate::errors::Result;

/// Encode `value` as canonical JSON, stripping `signatures` and `unsigned`.
///
/// `serde_json::Value` objects are backed by a sorted map, so re-encoding
/// through `Value` orders every nested object.
pub fn to_canonical_json<T: Serialize>(value: &T) -> Result<String> {
    let mut value = serde_json::to_value(value)?;

    if let Value::Object(map) = &mut value {
        map.remove("signatures");
        map.remove("unsigned");
    }

    Ok(serde_json::to_string(&value)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn sorts_keys_and_strips_signatures() {
        let value = json!({
            "keys": { "z": 1, "a": 2 },
            "device_id": "DEV",
            "signatures": { "@me:x": { "ed25519:DEV": "sig" } },
            "unsigned": { "age": 3 },
        });

        assert_eq!(to_canonical_json(&value).unwrap(), r#"{"device_id":"DEV","keys":{"a":2,"z":1}}"#);
    }

    #[test]
    fn nested_signatures_are_kept() {
        let value = json!({ "inner": { "signatures": 1 } });
        assert_eq!(to_canonical_json(&value).unwrap(), r#"{"inner":{"signatures":1}}"#);
    }
}
