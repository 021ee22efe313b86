/*
 * Copyright (c) Microsoft Corporation.
 * Licensed under the MIT license.
 */

use std::marker::PhantomData;

use super::{NodeId, ScoredResult};
use crate::{ANNError, ANNResult};

///////////
// Order //
///////////

/// Decides which of two distances wins a compare-exchange.
pub trait Order: std::fmt::Debug + Clone + Copy + Send + Sync + 'static {
    /// The distance stored in empty slots. It never wins against a real distance.
    const WORST: f32;

    /// Return `true` if `a` should be kept in preference to `b`.
    fn is_better(a: f32, b: f32) -> bool;
}

/// Keep the smallest distances. Used for both the candidate queue and the result queue.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectSmallest;

impl Order for CollectSmallest {
    const WORST: f32 = f32::INFINITY;

    #[inline(always)]
    fn is_better(a: f32, b: f32) -> bool {
        a < b
    }
}

/// Keep the largest values, for similarity scores where bigger is better.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectLargest;

impl Order for CollectLargest {
    const WORST: f32 = f32::NEG_INFINITY;

    #[inline(always)]
    fn is_better(a: f32, b: f32) -> bool {
        a > b
    }
}

//////////////////////////
// BoundedPriorityQueue //
//////////////////////////

/// A fixed-capacity array of [`ScoredResult`]s kept in order by compare-exchange passes.
///
/// Slots are arranged worst-first: slot `0` holds the worst element currently kept and
/// slot `capacity - 1` holds the best. Empty slots hold a sentinel whose distance is
/// [`Order::WORST`], so they always sit at the front.
///
/// ```text
///  slot:     0         1         2        ...     capacity - 1
///         +--------+--------+--------+---------+--------------+
///         | worst  |        |        |         |     best     |
///         +--------+--------+--------+---------+--------------+
///             ^                                        |
///             |                                        v
///    insert replaces this slot                 pop_best removes this slot
/// ```
///
/// An insert overwrites slot `0` and then runs one even phase and one odd phase of an
/// odd-even transposition network. That single round keeps the invariant that slot `0`
/// holds the worst kept element (so the queue always retains the true best `capacity`
/// elements), but does not fully sort the array. [`Self::sort`] runs the full network.
///
/// The capacity is runtime configurable up to the `max_capacity` chosen at construction,
/// which fixes the size of the backing allocation.
#[derive(Debug, Clone)]
pub struct BoundedPriorityQueue<O: Order = CollectSmallest> {
    /// Backing slots. `slots.len()` is the runtime capacity.
    slots: Vec<ScoredResult>,

    /// Number of slots holding real elements.
    len: usize,

    /// Upper bound for [`Self::reconfigure`].
    max_capacity: usize,

    /// Whether the slots are known to be fully ordered.
    sorted: bool,

    _order: PhantomData<O>,
}

impl<O: Order> BoundedPriorityQueue<O> {
    /// Create an empty queue whose runtime capacity equals `max_capacity`.
    pub fn new(max_capacity: usize) -> Self {
        Self {
            slots: vec![Self::sentinel(); max_capacity],
            len: 0,
            max_capacity,
            sorted: true,
            _order: PhantomData,
        }
    }

    const fn sentinel() -> ScoredResult {
        ScoredResult {
            node_id: NodeId::MAX,
            layer_id: 0,
            distance: O::WORST,
        }
    }

    /// Change the runtime capacity and empty the queue.
    ///
    /// Returns an error if `capacity` is zero or exceeds the maximum capacity.
    pub fn reconfigure(&mut self, capacity: usize) -> ANNResult<()> {
        if capacity == 0 || capacity > self.max_capacity {
            return Err(ANNError::log_index_config_error(
                "queue capacity",
                format!("{} is outside [1, {}]", capacity, self.max_capacity),
            ));
        }
        self.slots.truncate(capacity);
        self.slots.resize(capacity, Self::sentinel());
        self.reset();
        Ok(())
    }

    /// Empty the queue without changing its capacity.
    pub fn reset(&mut self) {
        self.slots.fill(Self::sentinel());
        self.len = 0;
        self.sorted = true;
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn max_capacity(&self) -> usize {
        self.max_capacity
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// The distance an element must beat to be inserted.
    ///
    /// This is [`Order::WORST`] until the queue is full.
    pub fn worst_distance(&self) -> f32 {
        self.slots.first().map_or(O::WORST, |slot| slot.distance)
    }

    /// Insert `item` if it is strictly better than the worst kept element.
    ///
    /// Returns `true` if the item was kept. When the queue is full, the previous worst
    /// element is evicted. Equal distances never displace an existing element, so among
    /// ties the first one seen wins.
    pub fn insert(&mut self, item: ScoredResult) -> bool {
        match self.slots.first_mut() {
            Some(worst) if O::is_better(item.distance, worst.distance) => *worst = item,
            _ => return false,
        }

        if self.len < self.capacity() {
            self.len += 1;
        }
        self.even_phase();
        self.odd_phase();
        self.sorted = false;
        true
    }

    /// Like [`Self::insert`], but rejects an item whose node is already kept.
    ///
    /// The kept elements are scanned only when `item` beats the worst one.
    pub fn insert_unique(&mut self, item: ScoredResult) -> bool {
        if !O::is_better(item.distance, self.worst_distance()) || self.contains(item.node_id) {
            return false;
        }
        self.insert(item)
    }

    /// Whether an element for `node_id` is kept.
    pub fn contains(&self, node_id: NodeId) -> bool {
        self.slots
            .iter()
            .any(|slot| slot.node_id == node_id && O::is_better(slot.distance, O::WORST))
    }

    /// Run the full compare-exchange network so every slot is in order.
    pub fn sort(&mut self) {
        if self.sorted {
            return;
        }
        for _ in 0..self.capacity().div_ceil(2) {
            self.even_phase();
            self.odd_phase();
        }
        self.sorted = true;
    }

    /// Return the best element without removing it.
    pub fn peek_best(&mut self) -> Option<ScoredResult> {
        if self.is_empty() {
            return None;
        }
        self.sort();
        self.slots.last().copied()
    }

    /// Remove and return the best element, shifting the remaining elements one slot
    /// towards the back.
    pub fn pop_best(&mut self) -> Option<ScoredResult> {
        let best = self.peek_best()?;
        let capacity = self.capacity();
        self.slots.copy_within(0..capacity - 1, 1);
        self.slots[0] = Self::sentinel();
        self.len -= 1;
        Some(best)
    }

    /// Return the kept elements from best to worst.
    pub fn best_first(&mut self) -> impl ExactSizeIterator<Item = &ScoredResult> + '_ {
        self.sort();
        let start = self.capacity() - self.len;
        self.slots[start..].iter().rev()
    }

    //-----------------------//
    // Compare-exchange core //
    //-----------------------//

    /// Order the pair `(a, b)` with `a < b` so the worse element lands in slot `a`.
    #[inline(always)]
    fn compare_swap(&mut self, a: usize, b: usize) {
        if O::is_better(self.slots[a].distance, self.slots[b].distance) {
            self.slots.swap(a, b);
        }
    }

    /// Compare pairs `(0, 1), (2, 3), ...`.
    fn even_phase(&mut self) {
        let capacity = self.capacity();
        for j in (0..capacity.saturating_sub(1)).step_by(2) {
            self.compare_swap(j, j + 1);
        }
    }

    /// Compare pairs `(1, 2), (3, 4), ...`.
    fn odd_phase(&mut self) {
        let capacity = self.capacity();
        for j in (1..capacity.saturating_sub(1)).step_by(2) {
            self.compare_swap(j, j + 1);
        }
    }

    #[cfg(test)]
    fn is_ordered(&self) -> bool {
        self.slots
            .windows(2)
            .all(|pair| !O::is_better(pair[0].distance, pair[1].distance))
    }
}

#[cfg(test)]
mod bounded_priority_queue_test {
    use rand::{Rng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::ANNErrorKind;

    fn scored(id: NodeId, distance: f32) -> ScoredResult {
        ScoredResult::new(id, 0, distance)
    }

    #[test]
    fn test_insert() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(3);
        assert!(queue.is_empty());
        assert!(queue.insert(scored(1, 1.0)));
        assert!(queue.insert(scored(2, 0.5)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.worst_distance(), f32::INFINITY);

        assert!(queue.insert(scored(3, 0.9)));
        assert!(queue.is_full());
        assert_eq!(queue.worst_distance(), 1.0);

        // Full and worse than the worst element.
        assert!(!queue.insert(scored(4, 2.0)));
        assert_eq!(queue.len(), 3);

        let ids: Vec<_> = queue.best_first().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![2, 3, 1]);
    }

    #[test]
    fn test_equal_distance_does_not_evict() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(2);
        queue.insert(scored(1, 0.3));
        queue.insert(scored(2, 0.7));
        assert!(!queue.insert(scored(3, 0.7)));

        let ids: Vec<_> = queue.best_first().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn test_insert_unique_rejects_kept_node() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(3);
        assert!(queue.insert_unique(scored(4, 0.5)));
        assert!(queue.insert_unique(scored(7, 0.2)));
        assert!(!queue.insert_unique(scored(4, 0.5)));
        assert!(!queue.insert_unique(scored(7, 0.1)));
        assert!(queue.contains(4));
        assert!(!queue.contains(NodeId::MAX), "empty slots hold no node");

        assert!(queue.insert_unique(scored(1, 0.9)));
        assert!(!queue.insert_unique(scored(9, 1.0)), "worse than every kept element");
        let ids: Vec<_> = queue.best_first().map(|r| r.node_id).collect();
        assert_eq!(ids, vec![7, 4, 1]);
    }

    #[test]
    fn test_worst_tracked_after_every_insert() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(17);
        let mut rng = rand::rngs::StdRng::seed_from_u64(42);
        let mut kept: Vec<f32> = Vec::new();

        for i in 0..500 {
            let distance: f32 = rng.random_range(0.0..100.0);
            if queue.insert(scored(i, distance)) {
                kept.push(distance);
                kept.sort_by(f32::total_cmp);
                kept.truncate(17);
            }
            assert!(queue.len() <= queue.capacity());

            let expected_worst = if kept.len() < 17 {
                f32::INFINITY
            } else {
                kept[16]
            };
            assert_eq!(queue.worst_distance(), expected_worst);
        }
    }

    #[rstest]
    fn test_sort_yields_best_elements(
        #[values(1, 2, 7, 16, 33)] capacity: usize,
        #[values(0, 5, 200)] count: u32,
    ) {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(capacity);
        let mut rng = rand::rngs::StdRng::seed_from_u64(7 + count as u64);
        let mut all: Vec<f32> = (0..count).map(|_| rng.random_range(-1.0..1.0)).collect();
        for (i, d) in all.iter().enumerate() {
            queue.insert(scored(i as NodeId, *d));
        }

        queue.sort();
        assert!(queue.is_ordered());

        all.sort_by(f32::total_cmp);
        all.truncate(capacity);
        let got: Vec<f32> = queue.best_first().map(|r| r.distance).collect();
        assert_eq!(got, all);
    }

    #[test]
    fn test_pop_best_is_ascending() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(8);
        for (id, d) in [(1, 0.8), (2, 0.1), (3, 0.5), (4, 0.3), (5, 0.9)] {
            queue.insert(scored(id, d));
        }

        let mut popped = Vec::new();
        while let Some(best) = queue.pop_best() {
            popped.push(best.node_id);
            assert!(queue.len() <= queue.capacity());
        }
        assert_eq!(popped, vec![2, 4, 3, 1, 5]);
        assert!(queue.is_empty());
        assert_eq!(queue.pop_best(), None);
    }

    #[test]
    fn test_pop_then_insert() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(2);
        queue.insert(scored(1, 1.0));
        queue.insert(scored(2, 2.0));
        assert_eq!(queue.pop_best().map(|r| r.node_id), Some(1));

        // The freed slot is available again.
        assert!(queue.insert(scored(3, 3.0)));
        assert!(queue.is_full());
        assert_eq!(queue.pop_best().map(|r| r.node_id), Some(2));
        assert_eq!(queue.pop_best().map(|r| r.node_id), Some(3));
    }

    #[test]
    fn test_collect_largest() {
        let mut queue = BoundedPriorityQueue::<CollectLargest>::new(2);
        queue.insert(scored(1, 0.2));
        queue.insert(scored(2, 0.9));
        queue.insert(scored(3, 0.5));
        assert_eq!(queue.worst_distance(), 0.5);
        assert_eq!(queue.pop_best().map(|r| r.node_id), Some(2));
    }

    #[test]
    fn test_nan_is_never_kept() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(2);
        assert!(!queue.insert(scored(1, f32::NAN)));
        assert!(queue.is_empty());
    }

    #[test]
    fn test_reconfigure() {
        let mut queue = BoundedPriorityQueue::<CollectSmallest>::new(10);
        queue.insert(scored(1, 1.0));

        queue.reconfigure(4).unwrap();
        assert_eq!(queue.capacity(), 4);
        assert!(queue.is_empty());

        queue.reconfigure(10).unwrap();
        assert_eq!(queue.capacity(), 10);
        assert_eq!(queue.max_capacity(), 10);

        let err = queue.reconfigure(11).unwrap_err();
        assert_eq!(err.kind(), ANNErrorKind::IndexConfigError);
        assert!(queue.reconfigure(0).is_err());
    }
}
