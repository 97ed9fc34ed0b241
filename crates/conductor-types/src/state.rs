//! State threaded through graph execution.
//!
//! The engine is generic over any [`GraphState`]. Workflows normally define a
//! struct with named fields and write an explicit reducer in
//! [`GraphState::merge_branch`]; [`StateMap`] covers the cases where the data is
//! genuinely dynamic.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::StateError;

/// Contract for state objects the executor threads through a graph.
///
/// `Clone` must produce a fully independent copy: each parallel branch owns
/// its clone exclusively until the join barrier. Serialization is used for
/// checkpoints.
pub trait GraphState: Clone + Send + Sync + Serialize + DeserializeOwned + 'static {
    /// Fold the final state of a parallel branch back into `self`.
    ///
    /// `base` is the batch input the branch was cloned from, so the reducer can
    /// tell what the branch actually changed. The executor calls this once per
    /// branch in the batch's fixed order; later branches win on conflicting
    /// writes.
    fn merge_branch(&mut self, base: &Self, branch: Self) -> Result<(), StateError>;
}

// ---------------------------------------------------------------------------
// StateMap
// ---------------------------------------------------------------------------

/// Ordered key-value bag of JSON values.
///
/// Keys are kept sorted so two maps with the same contents always serialize
/// to the same bytes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateMap {
    values: BTreeMap<String, Value>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// Typed read. `Ok(None)` when the key is absent; `UnexpectedType` when the
    /// stored value does not deserialize into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StateError> {
        match self.values.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| StateError::UnexpectedType {
                    key: key.to_string(),
                    expected: std::any::type_name::<T>(),
                    message: e.to_string(),
                }),
        }
    }

    /// Typed read that treats a missing key as an error.
    pub fn require<T: DeserializeOwned>(&self, key: &str) -> Result<T, StateError> {
        self.get_as(key)?.ok_or_else(|| StateError::MissingKey {
            key: key.to_string(),
        })
    }

    /// Serialize `value` and store it under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Serialize) -> Result<(), StateError> {
        let value = serde_json::to_value(value)?;
        self.values.insert(key.into(), value);
        Ok(())
    }

    /// Store an already-encoded value, returning the previous one.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Copy every key of `other` onto `self`, last writer wins.
    pub fn merge(&mut self, other: StateMap) {
        self.values.extend(other.values);
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, StateError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StateError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

impl GraphState for StateMap {
    /// Applies only what the branch changed relative to `base`: added or
    /// rewritten keys are copied, keys the branch removed are removed. A branch
    /// that never touched a key cannot revert a sibling's write to it.
    fn merge_branch(&mut self, base: &Self, branch: Self) -> Result<(), StateError> {
        for key in base.values.keys() {
            if !branch.values.contains_key(key) {
                self.values.remove(key);
            }
        }
        for (key, value) in branch.values {
            if base.values.get(&key) != Some(&value) {
                self.values.insert(key, value);
            }
        }
        Ok(())
    }
}

impl FromIterator<(String, Value)> for StateMap {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn set_and_get_round_trip() {
        let mut state = StateMap::new();
        state.set("x", 1).unwrap();
        state.set("name", "spec").unwrap();

        assert_eq!(state.get("x"), Some(&json!(1)));
        assert_eq!(state.get_as::<i64>("x").unwrap(), Some(1));
        assert_eq!(state.require::<String>("name").unwrap(), "spec");
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn wrong_type_is_a_typed_error() {
        let mut state = StateMap::new();
        state.set("x", "one").unwrap();

        let err = state.get_as::<i64>("x").unwrap_err();
        match err {
            StateError::UnexpectedType { key, expected, .. } => {
                assert_eq!(key, "x");
                assert_eq!(expected, "i64");
            }
            other => panic!("expected UnexpectedType, got {other:?}"),
        }
    }

    #[test]
    fn require_missing_key() {
        let state = StateMap::new();
        assert!(state.get_as::<i64>("absent").unwrap().is_none());
        assert!(matches!(
            state.require::<i64>("absent"),
            Err(StateError::MissingKey { .. })
        ));
    }

    #[test]
    fn clone_is_independent() {
        let mut state = StateMap::new();
        state.set("a", 1).unwrap();

        let mut copy = state.clone();
        copy.set("a", 999).unwrap();
        copy.set("b", 2).unwrap();

        assert_eq!(state.get("a"), Some(&json!(1)));
        assert!(!state.contains("b"));
    }

    #[test]
    fn merge_is_last_writer_wins() {
        let mut state = StateMap::new();
        state.set("keep", "old").unwrap();
        state.set("overwrite", "old").unwrap();

        let mut other = StateMap::new();
        other.set("overwrite", "new").unwrap();
        other.set("added", "fresh").unwrap();
        state.merge(other);

        assert_eq!(state.get("keep"), Some(&json!("old")));
        assert_eq!(state.get("overwrite"), Some(&json!("new")));
        assert_eq!(state.get("added"), Some(&json!("fresh")));
    }

    #[test]
    fn merge_branch_applies_only_changes() {
        let mut base = StateMap::new();
        base.set("x", 1).unwrap();
        base.set("gone", true).unwrap();

        // branch b rewrites x, branch c only adds z
        let mut b = base.clone();
        b.set("x", 10).unwrap();
        let mut c = base.clone();
        c.set("z", 3).unwrap();
        c.remove("gone");

        let mut merged = base.clone();
        merged.merge_branch(&base, b).unwrap();
        merged.merge_branch(&base, c).unwrap();

        assert_eq!(merged.get("x"), Some(&json!(10)));
        assert_eq!(merged.get("z"), Some(&json!(3)));
        assert!(!merged.contains("gone"));
    }

    #[test]
    fn bytes_round_trip_with_mixed_values() {
        let mut state = StateMap::new();
        state.set("int", 42).unwrap();
        state.set("float", 2.5).unwrap();
        state.set("flag", true).unwrap();
        state.set("list", vec!["a", "b"]).unwrap();
        state.set("nested", json!({"k": {"v": [1, 2]}})).unwrap();
        state.insert("null", Value::Null);

        let bytes = state.to_bytes().unwrap();
        let restored = StateMap::from_bytes(&bytes).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn serialization_is_order_independent() {
        let mut a = StateMap::new();
        a.set("z", 1).unwrap();
        a.set("a", 2).unwrap();
        let mut b = StateMap::new();
        b.set("a", 2).unwrap();
        b.set("z", 1).unwrap();

        assert_eq!(a.to_bytes().unwrap(), b.to_bytes().unwrap());
    }
}
