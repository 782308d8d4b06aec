//! Step functions over ordered keys.
//!
//! A step function holds values at recorded keys and answers point-in-time reads with the
//! value at the greatest recorded key at or before the probe (backward join). Balances,
//! share totals, block clocks and prices are all step functions.

use crate::domain::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::ops::Bound;
use thiserror::Error;

/// A delta whose running total no longer fits the decimal range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("running total overflows the decimal range")]
pub struct AmountOverflow;

/// Values recorded at ordered keys with predecessor lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepFunction<K: Ord, V> {
    points: BTreeMap<K, V>,
}

impl<K: Ord, V> Default for StepFunction<K, V> {
    fn default() -> Self {
        StepFunction {
            points: BTreeMap::new(),
        }
    }
}

impl<K: Ord, V> StepFunction<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `value` at `key`, returning the value it replaced.
    pub fn set(&mut self, key: K, value: V) -> Option<V> {
        self.points.insert(key, value)
    }

    /// Value at the greatest key `<= key`.
    pub fn value_at(&self, key: &K) -> Option<&V> {
        self.points.range(..=key).next_back().map(|(_, v)| v)
    }

    /// Value recorded exactly at `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.points.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.points.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.points.keys()
    }

    /// Points with keys in `(from, to]`.
    pub fn range_exclusive_inclusive<'a>(
        &'a self,
        from: &'a K,
        to: &'a K,
    ) -> impl Iterator<Item = (&'a K, &'a V)> + 'a {
        let range = if from < to {
            Some(
                self.points
                    .range((Bound::Excluded(from), Bound::Included(to))),
            )
        } else {
            None
        };
        range.into_iter().flatten()
    }
}

impl<K: Ord + Serialize, V: Serialize> Serialize for StepFunction<K, V> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        // Keys are structured; a sequence of pairs keeps the JSON form valid and ordered.
        serializer.collect_seq(self.points.iter())
    }
}

impl<'de, K, V> Deserialize<'de> for StepFunction<K, V>
where
    K: Ord + Deserialize<'de>,
    V: Deserialize<'de>,
{
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let pairs = Vec::<(K, V)>::deserialize(deserializer)?;
        Ok(StepFunction {
            points: pairs.into_iter().collect(),
        })
    }
}

/// Cumulative sum of deltas keyed by position.
///
/// Each recorded point holds the running total through that key. A delta landing before
/// existing points (a late event) shifts every later point by the same amount, so reads
/// are always the total of all deltas at or before the probe regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(bound(
    serialize = "K: Ord + Serialize",
    deserialize = "K: Ord + Deserialize<'de>"
))]
pub struct RunningTotal<K: Ord> {
    totals: StepFunction<K, Decimal>,
}

impl<K: Ord> Default for RunningTotal<K> {
    fn default() -> Self {
        RunningTotal {
            totals: StepFunction::new(),
        }
    }
}

impl<K: Ord + Clone> RunningTotal<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` at `key`.
    ///
    /// # Errors
    /// Returns `AmountOverflow` and leaves every total untouched when the new total at `key`
    /// or any later point would leave the decimal range.
    pub fn add_delta(&mut self, key: K, delta: Decimal) -> Result<(), AmountOverflow> {
        let at_key = self
            .value_at(&key)
            .checked_add(delta)
            .ok_or(AmountOverflow)?;
        let later = self
            .totals
            .points
            .range((Bound::Excluded(&key), Bound::Unbounded))
            .map(|(k, v)| v.checked_add(delta).map(|total| (k.clone(), total)))
            .collect::<Option<Vec<(K, Decimal)>>>()
            .ok_or(AmountOverflow)?;

        self.totals.points.insert(key, at_key);
        self.totals.points.extend(later);
        Ok(())
    }

    /// Running total through `key`; zero before the first delta.
    pub fn value_at(&self, key: &K) -> Decimal {
        self.totals.value_at(key).copied().unwrap_or_default()
    }

    /// First recorded point whose running total is negative.
    pub fn first_negative(&self) -> Option<(&K, Decimal)> {
        self.totals
            .iter()
            .find(|(_, v)| v.is_negative())
            .map(|(k, v)| (k, *v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(v: i64) -> Decimal {
        Decimal::from_i64(v)
    }

    #[test]
    fn test_value_at_backward_join() {
        let mut f: StepFunction<i64, &str> = StepFunction::new();
        f.set(10, "a");
        f.set(20, "b");

        assert_eq!(f.value_at(&5), None);
        assert_eq!(f.value_at(&10), Some(&"a"));
        assert_eq!(f.value_at(&19), Some(&"a"));
        assert_eq!(f.value_at(&25), Some(&"b"));
    }

    #[test]
    fn test_range_exclusive_inclusive() {
        let mut f: StepFunction<i64, i64> = StepFunction::new();
        for k in [1, 2, 3, 4] {
            f.set(k, k * 10);
        }
        let keys: Vec<i64> = f.range_exclusive_inclusive(&1, &3).map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![2, 3]);
        assert_eq!(f.range_exclusive_inclusive(&3, &3).count(), 0);
        assert_eq!(f.range_exclusive_inclusive(&4, &1).count(), 0);
    }

    #[test]
    fn test_running_total_appends() {
        let mut t: RunningTotal<i64> = RunningTotal::new();
        t.add_delta(1, d(100)).unwrap();
        t.add_delta(5, d(-30)).unwrap();
        assert_eq!(t.value_at(&0), d(0));
        assert_eq!(t.value_at(&3), d(100));
        assert_eq!(t.value_at(&5), d(70));
        assert_eq!(t.value_at(&99), d(70));
    }

    #[test]
    fn test_running_total_late_delta_shifts_later_points() {
        let mut t: RunningTotal<i64> = RunningTotal::new();
        t.add_delta(10, d(5)).unwrap();
        t.add_delta(20, d(5)).unwrap();
        // Late event between existing points
        t.add_delta(15, d(100)).unwrap();
        assert_eq!(t.value_at(&10), d(5));
        assert_eq!(t.value_at(&15), d(105));
        assert_eq!(t.value_at(&20), d(110));
        // Late event before every point
        t.add_delta(1, d(1)).unwrap();
        assert_eq!(t.value_at(&1), d(1));
        assert_eq!(t.value_at(&20), d(111));
    }

    #[test]
    fn test_running_total_order_independent() {
        let deltas = [(3, 7), (1, 2), (2, -1), (3, 4), (5, 10)];
        let mut forward: RunningTotal<i64> = RunningTotal::new();
        for (k, v) in deltas {
            forward.add_delta(k, d(v)).unwrap();
        }
        let mut reverse: RunningTotal<i64> = RunningTotal::new();
        for (k, v) in deltas.iter().rev() {
            reverse.add_delta(*k, d(*v)).unwrap();
        }
        assert_eq!(forward, reverse);
    }

    #[test]
    fn test_first_negative() {
        let mut t: RunningTotal<i64> = RunningTotal::new();
        t.add_delta(2, d(-10)).unwrap();
        assert_eq!(t.first_negative(), Some((&2, d(-10))));
        // A late deposit before the withdrawal corrects it
        t.add_delta(1, d(10)).unwrap();
        assert_eq!(t.first_negative(), None);
    }

    #[test]
    fn test_overflowing_delta_leaves_totals_untouched() {
        let max = Decimal::from(rust_decimal::Decimal::MAX);
        let mut t: RunningTotal<i64> = RunningTotal::new();
        t.add_delta(1, d(1)).unwrap();
        t.add_delta(3, max.checked_sub(d(1)).unwrap()).unwrap();
        let before = t.clone();

        // Fits at key 2 but pushes the later total at key 3 past the range
        assert_eq!(t.add_delta(2, d(1)), Err(AmountOverflow));
        assert_eq!(t, before);
        assert_eq!(t.add_delta(4, max), Err(AmountOverflow));
        assert_eq!(t, before);
    }

    #[test]
    fn test_serializes_as_pairs() {
        let mut t: RunningTotal<i64> = RunningTotal::new();
        t.add_delta(1, d(3)).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        assert_eq!(json, r#"{"totals":[[1,"3"]]}"#);
        let back: RunningTotal<i64> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, t);
    }
}
