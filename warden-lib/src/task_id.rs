use std::fmt;

use serde::{Deserialize, Serialize};

/// A monotonically increasing task identifier, minted by the sequence
/// generator (see `warden_store::Sequence`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn get(self) -> i64 {
        self.0
    }

    /// Fixed-width, lexicographically sortable string encoding of this id.
    ///
    /// Used to derive the entity-range key (`entityId@sortKey(taskId)`) and
    /// waiter-entry range keys (`sortKey(waitingTaskId)`) so that a plain
    /// string-ordered index scan visits tasks in id order.
    pub fn sort_key(self) -> String {
        sort_key(self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TaskId {
    fn from(value: i64) -> Self {
        TaskId(value)
    }
}

/// Encodes a signed 64-bit integer as a fixed-width, zero-padded decimal
/// string over the unsigned range, so that string ordering equals numeric
/// ordering for every representable `i64`.
pub fn sort_key(value: i64) -> String {
    let shifted = (value as i128 - i64::MIN as i128) as u128;
    format!("{shifted:020}")
}

/// Inverse of [`sort_key`]; panics on malformed input, which should never
/// occur for keys this crate produced.
pub fn sort_key_to_i64(key: &str) -> i64 {
    let shifted: u128 = key.parse().expect("malformed sort key");
    (shifted as i128 + i64::MIN as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips() {
        for v in [i64::MIN, i64::MIN + 1, -1, 0, 1, i64::MAX - 1, i64::MAX] {
            assert_eq!(sort_key_to_i64(&sort_key(v)), v);
        }
    }

    #[test]
    fn preserves_numeric_order() {
        let mut values = vec![5_i64, -5, 0, i64::MAX, i64::MIN, 42, -42];
        let mut by_key = values.clone();
        by_key.sort_by_key(|v| sort_key(*v));
        values.sort();
        assert_eq!(values, by_key);
    }

    #[test]
    fn same_width_for_all_inputs() {
        assert_eq!(sort_key(i64::MIN).len(), sort_key(i64::MAX).len());
        assert_eq!(sort_key(0).len(), sort_key(-1).len());
    }
}
