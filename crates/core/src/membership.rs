//! Bucket ownership derived from the live node list.
//!
//! There is no coordinator. Every instance reads the same ordered list of live
//! nodes from the registry and applies the same formula:
//!
//! ```text
//! owns(bucket) <=> bucket % live.len() == index_of(me)
//! ```
//!
//! When membership changes, ownership changes on the next registry read. A
//! row already claimed by a departing node stays protected by its lease.

use crate::bucket::{BucketId, BUCKET_COUNT};
use crate::id::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    index: usize,
    live: usize,
}

impl Membership {
    /// Compute this node's slot. Returns `None` when `me` is not live.
    ///
    /// `live` is sorted here, so callers may pass registry rows in any order.
    pub fn compute(live: &[NodeId], me: &NodeId) -> Option<Self> {
        let mut ordered: Vec<&NodeId> = live.iter().collect();
        ordered.sort();
        ordered.dedup();
        let index = ordered.iter().position(|n| *n == me)?;
        Some(Self {
            index,
            live: ordered.len(),
        })
    }

    /// Position of this node in the ordered live list.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn live_count(&self) -> usize {
        self.live
    }

    pub fn owns(&self, bucket: BucketId) -> bool {
        bucket.get() as usize % self.live == self.index
    }

    pub fn owned_buckets(&self) -> Vec<BucketId> {
        BucketId::all().filter(|b| self.owns(*b)).collect()
    }

    /// Number of buckets this node owns.
    pub fn owned_count(&self) -> usize {
        let total = BUCKET_COUNT as usize;
        total / self.live + usize::from(self.index < total % self.live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<NodeId> {
        ids.iter().map(|id| NodeId::new(*id).unwrap()).collect()
    }

    #[test]
    fn absent_node_owns_nothing() {
        let live = nodes(&["10.0.0.1:80", "10.0.0.2:80"]);
        assert!(Membership::compute(&live, &NodeId::new("10.0.0.3:80").unwrap()).is_none());
    }

    #[test]
    fn single_node_owns_every_bucket() {
        let live = nodes(&["a:1"]);
        let m = Membership::compute(&live, &live[0]).unwrap();
        assert_eq!(m.owned_buckets().len(), BUCKET_COUNT as usize);
        assert_eq!(m.owned_count(), BUCKET_COUNT as usize);
    }

    #[test]
    fn index_follows_sorted_order_not_input_order() {
        let live = nodes(&["c:1", "a:1", "b:1"]);
        let me = NodeId::new("c:1").unwrap();
        let m = Membership::compute(&live, &me).unwrap();
        assert_eq!(m.index(), 2);
        assert!(m.owns(BucketId::new(5).unwrap()));
        assert!(!m.owns(BucketId::new(6).unwrap()));
    }

    #[test]
    fn owned_count_matches_enumeration() {
        for n in 1..=7 {
            let ids: Vec<String> = (0..n).map(|i| format!("node-{i}:1")).collect();
            let live: Vec<NodeId> = ids.iter().map(|s| NodeId::new(s.as_str()).unwrap()).collect();
            for me in &live {
                let m = Membership::compute(&live, me).unwrap();
                assert_eq!(m.owned_count(), m.owned_buckets().len());
            }
        }
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 128,
                ..ProptestConfig::default()
            })]

            /// Every bucket has exactly one owner among the live nodes.
            #[test]
            fn every_bucket_has_exactly_one_owner(
                names in proptest::collection::btree_set("[a-z]{1,8}:[0-9]{2,4}", 1..12)
            ) {
                let live: Vec<NodeId> = names.iter().map(|s| NodeId::new(s.as_str()).unwrap()).collect();
                let slots: Vec<Membership> = live
                    .iter()
                    .map(|me| Membership::compute(&live, me).unwrap())
                    .collect();

                for bucket in BucketId::all() {
                    let owners = slots.iter().filter(|m| m.owns(bucket)).count();
                    prop_assert_eq!(owners, 1);
                }
            }
        }
    }
}
