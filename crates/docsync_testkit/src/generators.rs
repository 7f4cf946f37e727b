//! Property-based test generators using proptest.

use docsync_codec::Value;
use docsync_storage::DocumentId;
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Strategy for generating valid document ids.
pub fn document_id_strategy() -> impl Strategy<Value = DocumentId> {
    prop::string::string_regex("[a-z][a-z0-9_-]{0,15}")
        .expect("Invalid regex")
        .prop_map(|s| DocumentId::new(s).expect("Generated id must be valid"))
}

/// Strategy for generating scalar property values.
pub fn scalar_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,24}".prop_map(Value::String),
    ]
}

/// Strategy for generating document bodies: dictionaries of scalars,
/// optionally nested one level.
pub fn body_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop::collection::btree_map("[a-z]{1,8}", scalar_strategy(), 0..6);
    prop::collection::btree_map(
        "[a-z]{1,8}",
        prop_oneof![
            3 => scalar_strategy(),
            1 => leaf.prop_map(Value::Dict),
        ],
        0..8,
    )
    .prop_map(Value::Dict)
}

/// A local mutation in a generated workload.
#[derive(Debug, Clone)]
pub enum Mutation {
    /// Save `body` as the next revision of document `doc`.
    Save {
        /// Index into the workload's id pool.
        doc: usize,
        /// New body.
        body: BTreeMap<String, Value>,
    },
    /// Delete document `doc` if it exists.
    Delete {
        /// Index into the workload's id pool.
        doc: usize,
    },
}

/// Strategy for generating a sequence of mutations over `ids` documents.
pub fn mutation_strategy(ids: usize, len: usize) -> impl Strategy<Value = Vec<Mutation>> {
    let ids = ids.max(1);
    let mutation = prop_oneof![
        4 => (0..ids, prop::collection::btree_map("[a-z]{1,4}", scalar_strategy(), 1..4))
            .prop_map(|(doc, body)| Mutation::Save { doc, body }),
        1 => (0..ids).prop_map(|doc| Mutation::Delete { doc }),
    ];
    prop::collection::vec(mutation, 1..=len.max(1))
}
