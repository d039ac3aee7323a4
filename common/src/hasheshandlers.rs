use crate::Result;
use serde::Serialize;
use sha256::digest;

/// Length of the hashes stored in annotations and statuses
pub static SHORT_HASH_LEN: usize = 16;

pub fn short_hash(text: &str) -> String {
    let mut h = digest(text);
    h.truncate(SHORT_HASH_LEN);
    h
}

/// Stable hash of any serializable value.
///
/// serde_json keeps struct fields in declaration order and maps are `BTreeMap`s so
/// two equal values always hash the same.
pub fn config_hash<T: Serialize>(value: &T) -> Result<String> {
    Ok(short_hash(&serde_json::to_string(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_hash_is_stable_and_short() {
        let a = BTreeMap::from([("b", 1), ("a", 2)]);
        let b = BTreeMap::from([("a", 2), ("b", 1)]);
        assert_eq!(config_hash(&a).unwrap(), config_hash(&b).unwrap());
        assert_eq!(config_hash(&a).unwrap().len(), SHORT_HASH_LEN);
        assert_ne!(short_hash("x"), short_hash("y"));
    }
}
