//! Vector clock model

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Causal relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClockOrdering {
    /// Left happened strictly before right
    Before,
    /// Left happened strictly after right
    After,
    /// Neither dominates the other
    Concurrent,
    /// Identical counters
    Equal,
}

/// Per-device monotonic counters summarizing an entity's causal history.
///
/// Devices missing from the map read as 0, so `{A: 1}` and `{A: 1, B: 0}`
/// compare as equal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(BTreeMap<String, u64>);

impl VectorClock {
    /// Create an empty clock
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device (0 when absent)
    pub fn get(&self, device_id: &str) -> u64 {
        self.0.get(device_id).copied().unwrap_or(0)
    }

    /// Bump this device's counter by one
    pub fn increment(&mut self, device_id: &str) {
        let counter = self.0.entry(device_id.to_string()).or_insert(0);
        *counter = counter.saturating_add(1);
    }

    /// Element-wise maximum of two clocks
    #[must_use]
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.0.clone();
        for (device, &counter) in &other.0 {
            let slot = merged.entry(device.clone()).or_insert(0);
            *slot = (*slot).max(counter);
        }
        Self(merged)
    }

    /// Compare causality with another clock
    pub fn compare(&self, other: &Self) -> ClockOrdering {
        let mut greater = false;
        let mut less = false;

        for device in self.0.keys().chain(other.0.keys()) {
            match self.get(device).cmp(&other.get(device)) {
                Ordering::Greater => greater = true,
                Ordering::Less => less = true,
                Ordering::Equal => {}
            }
            if greater && less {
                return ClockOrdering::Concurrent;
            }
        }

        match (greater, less) {
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) => ClockOrdering::Equal,
            (true, true) => ClockOrdering::Concurrent,
        }
    }

    /// True when every counter is >= other's and at least one is strictly greater
    pub fn dominates(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::After
    }

    /// True when neither clock dominates the other
    pub fn is_concurrent(&self, other: &Self) -> bool {
        self.compare(other) == ClockOrdering::Concurrent
    }

    /// True when no device has a counter
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over `(device_id, counter)` pairs in device order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.0.iter().map(|(device, &counter)| (device.as_str(), counter))
    }
}

impl FromIterator<(String, u64)> for VectorClock {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        pairs
            .iter()
            .map(|(device, counter)| ((*device).to_string(), *counter))
            .collect()
    }

    #[test]
    fn test_increment_starts_at_one() {
        let mut vc = VectorClock::new();
        vc.increment("A");
        vc.increment("A");
        vc.increment("B");
        assert_eq!(vc.get("A"), 2);
        assert_eq!(vc.get("B"), 1);
        assert_eq!(vc.get("C"), 0);
    }

    #[test]
    fn test_merge_takes_elementwise_max() {
        let merged = clock(&[("A", 3), ("B", 1)]).merge(&clock(&[("B", 4), ("C", 2)]));
        assert_eq!(merged, clock(&[("A", 3), ("B", 4), ("C", 2)]));
    }

    #[test]
    fn test_compare() {
        let a1 = clock(&[("A", 1)]);
        let a2 = clock(&[("A", 2)]);
        let a1b1 = clock(&[("A", 1), ("B", 1)]);
        let b1 = clock(&[("B", 1)]);

        assert_eq!(a1.compare(&a2), ClockOrdering::Before);
        assert_eq!(a2.compare(&a1), ClockOrdering::After);
        assert_eq!(a1b1.compare(&a1), ClockOrdering::After);
        assert_eq!(a1.compare(&b1), ClockOrdering::Concurrent);
        assert_eq!(a2.compare(&a1b1), ClockOrdering::Concurrent);
        assert_eq!(a1.compare(&clock(&[("A", 1), ("B", 0)])), ClockOrdering::Equal);
    }

    #[test]
    fn test_merge_dominates_both_inputs() {
        let left = clock(&[("A", 2)]);
        let right = clock(&[("B", 5)]);
        let merged = left.merge(&right);
        assert!(merged.dominates(&left));
        assert!(merged.dominates(&right));
        assert!(left.is_concurrent(&right));
    }

    #[test]
    fn test_serializes_as_plain_object() {
        let json = serde_json::to_value(clock(&[("A", 1)])).unwrap();
        assert_eq!(json, serde_json::json!({ "A": 1 }));

        let parsed: VectorClock = serde_json::from_value(serde_json::json!({ "B": 7 })).unwrap();
        assert_eq!(parsed.get("B"), 7);
    }
}
