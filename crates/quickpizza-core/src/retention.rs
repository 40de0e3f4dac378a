//! Bounded-table retention.
//!
//! A [`RetentionPolicy`] keeps the `maximum` most recent rows of a table
//! (creation time descending, id descending on ties) plus every row whose id is
//! at most `fixed`. Everything else is evicted. A non-positive `maximum`
//! disables eviction.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BoundedTable {
    Users,
    Pizzas,
    Ratings,
}

impl BoundedTable {
    pub const ALL: [Self; 3] = [Self::Users, Self::Pizzas, Self::Ratings];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::Pizzas => "pizzas",
            Self::Ratings => "ratings",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "users" => Some(Self::Users),
            "pizzas" => Some(Self::Pizzas),
            "ratings" => Some(Self::Ratings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub struct RetentionPolicy {
    pub fixed: i64,
    pub maximum: i64,
}

/// Identity and creation time of one row, all the policy looks at.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct RowStamp {
    pub id: i64,
    pub created_at: OffsetDateTime,
}

impl RetentionPolicy {
    #[must_use]
    pub const fn new(fixed: i64, maximum: i64) -> Self {
        Self { fixed, maximum }
    }

    #[must_use]
    pub const fn unbounded() -> Self {
        Self { fixed: 0, maximum: 0 }
    }

    #[must_use]
    pub const fn is_enforced(self) -> bool {
        self.maximum > 0
    }

    #[must_use]
    pub const fn is_protected(self, id: i64) -> bool {
        id <= self.fixed
    }

    /// Ids that survive one application of the policy to `rows`.
    #[must_use]
    pub fn survivors(self, rows: &[RowStamp]) -> BTreeSet<i64> {
        if !self.is_enforced() {
            return rows.iter().map(|row| row.id).collect();
        }

        let mut by_recency = rows.to_vec();
        by_recency.sort_by_key(|row| Reverse((row.created_at, row.id)));
        let keep = usize::try_from(self.maximum).unwrap_or(usize::MAX);

        let mut survivors =
            by_recency.iter().take(keep).map(|row| row.id).collect::<BTreeSet<_>>();
        survivors.extend(rows.iter().filter(|row| self.is_protected(row.id)).map(|row| row.id));
        survivors
    }

    /// Ids one application of the policy would delete, ascending.
    #[must_use]
    pub fn evictions(self, rows: &[RowStamp]) -> Vec<i64> {
        let survivors = self.survivors(rows);
        let mut evicted = rows
            .iter()
            .map(|row| row.id)
            .filter(|id| !survivors.contains(id))
            .collect::<Vec<_>>();
        evicted.sort_unstable();
        evicted
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::Duration;

    use super::*;

    fn stamps(ids_and_offsets: &[(i64, i64)]) -> Vec<RowStamp> {
        ids_and_offsets
            .iter()
            .map(|&(id, seconds)| RowStamp {
                id,
                created_at: OffsetDateTime::UNIX_EPOCH + Duration::seconds(seconds),
            })
            .collect()
    }

    fn sequential(count: i64) -> Vec<RowStamp> {
        stamps(&(1..=count).map(|id| (id, id)).collect::<Vec<_>>())
    }

    #[test]
    fn non_positive_maximum_keeps_everything() {
        let rows = sequential(20);
        assert!(RetentionPolicy::new(5, 0).evictions(&rows).is_empty());
        assert!(RetentionPolicy::new(5, -3).evictions(&rows).is_empty());
    }

    #[test]
    fn keeps_most_recent_rows_when_nothing_is_protected() {
        let rows = sequential(10);
        let survivors = RetentionPolicy::new(0, 4).survivors(&rows);
        assert_eq!(survivors, BTreeSet::from([7, 8, 9, 10]));
    }

    #[test]
    fn protected_prefix_survives_alongside_recent_rows() {
        let rows = sequential(10);
        let policy = RetentionPolicy::new(2, 4);
        assert_eq!(policy.survivors(&rows), BTreeSet::from([1, 2, 7, 8, 9, 10]));
        assert_eq!(policy.evictions(&rows), vec![3, 4, 5, 6]);
    }

    #[test]
    fn maximum_below_fixed_leaves_protected_floor() {
        let rows = sequential(10);
        let survivors = RetentionPolicy::new(6, 2).survivors(&rows);
        assert_eq!(survivors, BTreeSet::from([1, 2, 3, 4, 5, 6, 9, 10]));
    }

    #[test]
    fn timestamp_ties_break_on_higher_id() {
        let rows = stamps(&[(1, 0), (2, 5), (3, 5), (4, 5)]);
        let survivors = RetentionPolicy::new(0, 2).survivors(&rows);
        assert_eq!(survivors, BTreeSet::from([3, 4]));
    }

    #[test]
    fn recency_follows_timestamps_not_ids() {
        let rows = stamps(&[(1, 30), (2, 10), (3, 20)]);
        let survivors = RetentionPolicy::new(0, 1).survivors(&rows);
        assert_eq!(survivors, BTreeSet::from([1]));
    }

    #[test]
    fn bounded_table_names_round_trip() {
        for table in BoundedTable::ALL {
            assert_eq!(BoundedTable::parse(table.as_str()), Some(table));
        }
        assert_eq!(BoundedTable::parse("doughs"), None);
    }

    proptest! {
        #[test]
        fn property_policy_is_idempotent(
            offsets in proptest::collection::vec(0_i64..50, 0..60),
            fixed in 0_i64..20,
            maximum in -2_i64..30,
        ) {
            let pairs = offsets
                .iter()
                .zip(1_i64..)
                .map(|(&offset, id)| (id, offset))
                .collect::<Vec<_>>();
            let rows = stamps(&pairs);
            let policy = RetentionPolicy::new(fixed, maximum);
            let survivors = policy.survivors(&rows);
            let remaining = rows
                .iter()
                .copied()
                .filter(|row| survivors.contains(&row.id))
                .collect::<Vec<_>>();
            prop_assert!(policy.evictions(&remaining).is_empty());
        }

        #[test]
        fn property_protected_rows_always_survive(
            count in 0_i64..80,
            fixed in 0_i64..20,
            maximum in 1_i64..30,
        ) {
            let rows = sequential(count);
            let survivors = RetentionPolicy::new(fixed, maximum).survivors(&rows);
            for row in rows.iter().filter(|row| row.id <= fixed) {
                prop_assert!(survivors.contains(&row.id));
            }
            let recent = usize::try_from(maximum).unwrap_or(usize::MAX).min(rows.len());
            let protected_outside_recent = rows
                .iter()
                .rev()
                .skip(recent)
                .filter(|row| row.id <= fixed)
                .count();
            prop_assert_eq!(survivors.len(), recent + protected_outside_recent);
        }
    }
}
