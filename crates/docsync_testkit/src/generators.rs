//! Property-based test generators using proptest.
//!
//! Provides strategies for generating document bodies and edit sequences.

use docsync_protocol::Mode;
use proptest::prelude::*;
use serde_json::{Map, Value};

/// Strategy for generating property names.
pub fn property_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,11}").expect("Invalid regex")
}

/// Strategy for generating JSON scalars.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        prop::string::string_regex("[ -~]{0,24}")
            .expect("Invalid regex")
            .prop_map(Value::String),
    ]
}

/// Strategy for generating nested JSON values.
pub fn json_value_strategy() -> impl Strategy<Value = Value> {
    scalar_strategy().prop_recursive(3, 32, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
            prop::collection::btree_map(property_name_strategy(), inner, 0..5)
                .prop_map(|map| Value::Object(map.into_iter().collect())),
        ]
    })
}

/// Strategy for generating document bodies (always JSON objects).
pub fn body_strategy() -> impl Strategy<Value = Value> {
    prop::collection::btree_map(property_name_strategy(), json_value_strategy(), 0..8)
        .prop_map(|map| Value::Object(map.into_iter().collect::<Map<_, _>>()))
}

/// Strategy for generating a body and an edited version of it.
///
/// Edits change, add and remove top-level properties, so the pair exercises
/// every kind of delta entry.
pub fn body_edit_strategy() -> impl Strategy<Value = (Value, Value)> {
    (
        body_strategy(),
        prop::collection::btree_map(property_name_strategy(), json_value_strategy(), 0..4),
        prop::collection::vec(any::<prop::sample::Index>(), 0..3),
    )
        .prop_map(|(base, additions, removals)| {
            let mut edited = base.as_object().cloned().unwrap_or_default();
            let keys: Vec<String> = edited.keys().cloned().collect();
            if !keys.is_empty() {
                for index in removals {
                    edited.remove(&keys[index.index(keys.len())]);
                }
            }
            edited.extend(additions);
            (base, Value::Object(edited))
        })
}

/// Strategy for generating document IDs.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z]{1,8}(-[0-9]{1,4})?").expect("Invalid regex")
}

/// Strategy for generating an active direction mode.
pub fn active_mode_strategy() -> impl Strategy<Value = Mode> {
    prop_oneof![Just(Mode::OneShot), Just(Mode::Continuous)]
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
