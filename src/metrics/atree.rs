//! A count-augmented binary search tree.
//!
//! Each node stores a key, the number of times that key was inserted,
//! and the total number of samples in its subtree. The subtree totals
//! are recomputed along the insertion path, which is all a rank descent
//! needs to find the node holding the sample of a given rank. Duplicate
//! inserts bump the node's multiplicity instead of growing the tree.

use std::cmp::Ordering;

use crate::error::Error;

struct Node<T> {
    key: T,
    count: i64,
    total: i64,
    left: Option<Box<Node<T>>>,
    right: Option<Box<Node<T>>>,
}

impl<T> Node<T> {
    fn new(key: T) -> Self {
        Self {
            key,
            count: 1,
            total: 1,
            left: None,
            right: None,
        }
    }

    fn refresh_total(&mut self) {
        let left = self.left.as_ref().map_or(0, |n| n.total);
        let right = self.right.as_ref().map_or(0, |n| n.total);
        self.total = left + right + self.count;
    }
}

/// Multiset of samples ordered by key, queryable by rank.
pub(crate) struct Atree<T> {
    root: Option<Box<Node<T>>>,
}

impl<T: Copy + PartialOrd> Atree<T> {
    pub fn new() -> Self {
        Self { root: None }
    }

    /// Total number of inserted samples (duplicates included).
    pub fn size(&self) -> i64 {
        self.root.as_ref().map_or(0, |n| n.total)
    }

    pub fn clear(&mut self) {
        self.root = None;
    }

    pub fn insert(&mut self, key: T) {
        Self::insert_at(&mut self.root, key);
    }

    fn insert_at(slot: &mut Option<Box<Node<T>>>, key: T) {
        match slot {
            None => *slot = Some(Box::new(Node::new(key))),
            Some(node) => {
                match key.partial_cmp(&node.key).unwrap_or(Ordering::Equal) {
                    Ordering::Equal => node.count += 1,
                    Ordering::Less => Self::insert_at(&mut node.left, key),
                    Ordering::Greater => Self::insert_at(&mut node.right, key),
                }
                node.refresh_total();
            }
        }
    }

    /// The key whose rank matches `percentile` (0 is the minimum, 100
    /// the maximum). Fails on an empty tree or an out-of-range
    /// percentile.
    pub fn find_percentile(&self, percentile: f64) -> crate::Result<T> {
        if !(0.0..=100.0).contains(&percentile) {
            return Err(Error::FailedPrecondition(format!(
                "percentile out of range: {}",
                percentile
            )));
        }
        let size = self.size();
        let Some(mut curr) = self.root.as_deref() else {
            return Err(Error::FailedPrecondition(
                "no samples to take a percentile of".into(),
            ));
        };

        let mut rank = if percentile == 0.0 {
            1
        } else {
            ((percentile / 100.0) * size as f64) as i64
        }
        .clamp(1, size);

        loop {
            let left_total = curr.left.as_ref().map_or(0, |n| n.total);
            let below_right = left_total + curr.count;
            if left_total < rank && rank <= below_right {
                return Ok(curr.key);
            }
            if left_total >= rank {
                curr = curr.left.as_deref().expect("rank lies in the left subtree");
            } else {
                rank -= below_right;
                curr = curr
                    .right
                    .as_deref()
                    .expect("rank lies in the right subtree");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_tree_has_no_percentiles() {
        let tree = Atree::<i64>::new();
        assert_eq!(tree.size(), 0);
        assert!(tree.find_percentile(50.0).is_err());
    }

    #[test]
    fn rejects_out_of_range_percentiles() {
        let mut tree = Atree::new();
        tree.insert(1);
        assert!(tree.find_percentile(-1.0).is_err());
        assert!(tree.find_percentile(100.1).is_err());
    }

    #[test]
    fn duplicates_bump_multiplicity() {
        let mut tree = Atree::new();
        for _ in 0..5 {
            tree.insert(7);
        }
        assert_eq!(tree.size(), 5);
        assert_eq!(tree.find_percentile(0.0).unwrap(), 7);
        assert_eq!(tree.find_percentile(100.0).unwrap(), 7);
    }

    #[test]
    fn ranks_over_a_permutation() {
        let mut tree = Atree::new();
        // 1..=100 inserted in a scrambled order.
        for i in 0..100i64 {
            tree.insert((i * 37) % 100 + 1);
        }
        assert_eq!(tree.size(), 100);
        assert_eq!(tree.find_percentile(0.0).unwrap(), 1);
        assert_eq!(tree.find_percentile(50.0).unwrap(), 50);
        assert_eq!(tree.find_percentile(90.0).unwrap(), 90);
        assert_eq!(tree.find_percentile(99.0).unwrap(), 99);
        assert_eq!(tree.find_percentile(100.0).unwrap(), 100);
    }

    #[test]
    fn clear_resets_the_multiset() {
        let mut tree = Atree::new();
        tree.insert(1.0);
        tree.insert(2.0);
        tree.clear();
        assert_eq!(tree.size(), 0);
        tree.insert(3.0);
        assert_eq!(tree.find_percentile(100.0).unwrap(), 3.0);
    }
}
