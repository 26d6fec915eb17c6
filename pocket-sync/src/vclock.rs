use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    /// Identical histories.
    Equal,
    /// The left clock causally precedes the right clock.
    Before,
    /// The left clock causally follows the right clock.
    After,
    /// Neither precedes the other.
    Concurrent,
}

/// Per-node logical clock: node id mapped to a monotonically increasing
/// counter. Missing nodes read as zero, so clocks with different key sets
/// still compare totally.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.values().all(|v| *v == 0)
    }

    /// Counter for a node, zero when absent.
    pub fn get(&self, node: &str) -> u64 {
        self.0.get(node).copied().unwrap_or(0)
    }

    /// Bumps the counter for `node`, returning the new value.
    pub fn increment(&mut self, node: &str) -> u64 {
        let counter = self.0.entry(node.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
        *counter
    }

    /// Pointwise maximum of both clocks, in place.
    pub fn merge(&mut self, other: &VectorClock) {
        for (node, theirs) in other.0.iter() {
            let ours = self.0.entry(node.clone()).or_insert(0);
            if *theirs > *ours {
                *ours = *theirs;
            }
        }
    }

    /// Pointwise maximum of both clocks, producing a new clock.
    pub fn merged(&self, other: &VectorClock) -> VectorClock {
        let mut out = self.clone();
        out.merge(other);
        out
    }

    /// Partial-order comparison. Two passes over the key sets with an early
    /// exit as soon as both directions have a strictly greater component.
    pub fn compare(&self, other: &VectorClock) -> Causality {
        let mut self_greater = false;
        let mut other_greater = false;

        for (node, s) in self.0.iter() {
            let o = other.get(node);
            if *s > o {
                self_greater = true;
            } else if o > *s {
                other_greater = true;
            }
            if self_greater && other_greater {
                return Causality::Concurrent;
            }
        }

        for (node, o) in other.0.iter() {
            if self.0.contains_key(node) {
                continue;
            }
            if *o > 0 {
                other_greater = true;
            }
            if self_greater && other_greater {
                return Causality::Concurrent;
            }
        }

        match (self_greater, other_greater) {
            (false, false) => Causality::Equal,
            (true, false) => Causality::After,
            (false, true) => Causality::Before,
            (true, true) => Causality::Concurrent,
        }
    }

    /// True when `self` is equal to or causally after `other`.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        matches!(self.compare(other), Causality::Equal | Causality::After)
    }

    pub fn is_concurrent_with(&self, other: &VectorClock) -> bool {
        self.compare(other) == Causality::Concurrent
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &u64)> {
        self.0.iter()
    }
}

impl<const N: usize> From<[(&str, u64); N]> for VectorClock {
    fn from(entries: [(&str, u64); N]) -> Self {
        Self(
            entries
                .into_iter()
                .map(|(n, c)| (n.to_string(), c))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn empty_clocks_are_equal() {
        assert_eq!(VectorClock::new().compare(&VectorClock::new()), Causality::Equal);
    }

    #[test]
    fn zero_entries_do_not_break_equality() {
        let a = VectorClock::from([("a", 1), ("b", 0)]);
        let b = VectorClock::from([("a", 1)]);
        assert_eq!(a.compare(&b), Causality::Equal);
        assert_eq!(b.compare(&a), Causality::Equal);
    }

    #[test]
    fn increment_strictly_dominates() {
        let mut a = VectorClock::new();
        a.increment("n1");
        assert_eq!(VectorClock::new().compare(&a), Causality::Before);
        assert_eq!(a.compare(&VectorClock::new()), Causality::After);
    }

    #[test]
    fn concurrent_detection() {
        let a = VectorClock::from([("n1", 1)]);
        let b = VectorClock::from([("n2", 1)]);
        assert_eq!(a.compare(&b), Causality::Concurrent);
        assert!(a.is_concurrent_with(&b));
    }

    #[test]
    fn merge_produces_dominating_clock() {
        let a = VectorClock::from([("n1", 2), ("n2", 1)]);
        let b = VectorClock::from([("n2", 3)]);
        let merged = a.merged(&b);
        assert!(merged.dominates(&a));
        assert!(merged.dominates(&b));
        assert_eq!(merged.get("n1"), 2);
        assert_eq!(merged.get("n2"), 3);
    }

    #[test]
    fn missing_keys_read_zero() {
        let a = VectorClock::new();
        assert_eq!(a.get("nope"), 0);
    }

    fn arb_clock() -> impl Strategy<Value = VectorClock> {
        proptest::collection::btree_map("[a-d]", 0u64..20, 0..4)
            .prop_map(|m| VectorClock(m.into_iter().collect()))
    }

    proptest! {
        #[test]
        fn merge_is_commutative(a in arb_clock(), b in arb_clock()) {
            prop_assert_eq!(a.merged(&b).compare(&b.merged(&a)), Causality::Equal);
        }

        #[test]
        fn merge_is_associative(a in arb_clock(), b in arb_clock(), c in arb_clock()) {
            let left = a.merged(&b).merged(&c);
            let right = a.merged(&b.merged(&c));
            prop_assert_eq!(left.compare(&right), Causality::Equal);
        }

        #[test]
        fn merge_is_idempotent(a in arb_clock()) {
            prop_assert_eq!(a.merged(&a).compare(&a), Causality::Equal);
        }

        #[test]
        fn increment_is_strictly_after(a in arb_clock(), node in "[a-d]") {
            let mut bumped = a.clone();
            bumped.increment(&node);
            prop_assert_eq!(a.compare(&bumped), Causality::Before);
        }

        #[test]
        fn merge_dominates_both(a in arb_clock(), b in arb_clock()) {
            let m = a.merged(&b);
            prop_assert!(m.dominates(&a));
            prop_assert!(m.dominates(&b));
        }
    }
}
