//! Property-based tests for the state container.
//!
//! These tests verify the merge and copy invariants for arbitrary states:
//! - Every key of the right-hand side wins
//! - Keys only on the left-hand side survive
//! - Merging twice equals merging once
//! - Copies are independent
//! - Wire snapshots rebuild the same state

use proptest::prelude::*;
use tandem_core::State;
use tandem_proto::Value;

fn value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        any::<u64>().prop_map(Value::UInt),
        "[a-z0-9.]{0,12}".prop_map(Value::Str),
        prop::collection::vec(any::<u8>(), 0..16).prop_map(Value::from),
    ]
}

// Small key space so the two sides of a merge overlap often
fn state_strategy() -> impl Strategy<Value = State> {
    prop::collection::btree_map("[a-e]", value_strategy(), 0..6).prop_map(State::from)
}

#[test]
fn prop_update_is_right_biased() {
    proptest!(|(a in state_strategy(), b in state_strategy())| {
        let mut merged = a.clone();
        merged.update(&b);

        for (key, value) in &b {
            prop_assert_eq!(merged.get(key), Some(value));
        }
        for (key, value) in &a {
            if !b.has_key(key) {
                prop_assert_eq!(merged.get(key), Some(value));
            }
        }
        for key in merged.keys() {
            prop_assert!(a.has_key(key) || b.has_key(key));
        }
    });
}

#[test]
fn prop_update_is_idempotent() {
    proptest!(|(a in state_strategy(), b in state_strategy())| {
        let mut once = a.clone();
        once.update(&b);

        let mut twice = a;
        twice.update(&b).update(&b);

        prop_assert_eq!(once, twice);
    });
}

#[test]
fn prop_copy_is_independent() {
    proptest!(|(a in state_strategy(), key in "[a-e]", value in value_strategy())| {
        let snapshot = a.clone();
        let mut copy = a.clone();
        copy.set(key.clone(), value);
        copy.remove("a");

        prop_assert_eq!(&a, &snapshot);
    });
}

#[test]
fn prop_wire_snapshot_rebuilds_state() {
    proptest!(|(a in state_strategy())| {
        let bytes = a.to_wire().expect("small states fit a datagram");
        let rebuilt = State::from_wire(&bytes).expect("own encoding decodes");
        prop_assert_eq!(rebuilt, a);
    });
}
