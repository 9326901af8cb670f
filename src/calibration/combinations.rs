//! Breadth-first combination iterator.
//!
//! Yields K-subsets of a priority-sorted slice ordered by the sum of their
//! positions, so subsets built from the highest-priority spots come first and a
//! cap on the number of consumed subsets drops the least trusted ones.
//!
//! Implementation: min-heap keyed by position sum, with a HashSet for dedup.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

/// Iterator over `K`-combinations of `0..n` in order of increasing position sum.
///
/// Each yielded array is strictly increasing.
pub struct BreadthFirstCombinations<const K: usize> {
    n: usize,
    heap: BinaryHeap<Reverse<(usize, [usize; K])>>,
    seen: HashSet<[usize; K]>,
}

impl<const K: usize> BreadthFirstCombinations<K> {
    /// Combinations of `n` positions. Yields nothing when `n < K` or `K == 0`.
    pub fn new(n: usize) -> Self {
        let mut bfc = Self {
            n,
            heap: BinaryHeap::new(),
            seen: HashSet::new(),
        };
        if K > 0 && n >= K {
            let initial: [usize; K] = std::array::from_fn(|i| i);
            bfc.seen.insert(initial);
            bfc.heap.push(Reverse((initial.iter().sum(), initial)));
        }
        bfc
    }
}

impl<const K: usize> Iterator for BreadthFirstCombinations<K> {
    type Item = [usize; K];

    fn next(&mut self) -> Option<[usize; K]> {
        let Reverse((sum, combo)) = self.heap.pop()?;

        // Successors: bump one position while keeping the array strictly increasing.
        for i in 0..K {
            let next_val = combo[i] + 1;
            let upper = if i + 1 < K { combo[i + 1] } else { self.n };
            if next_val < upper {
                let mut succ = combo;
                succ[i] = next_val;
                if self.seen.insert(succ) {
                    self.heap.push(Reverse((sum + 1, succ)));
                }
            }
        }

        Some(combo)
    }
}
