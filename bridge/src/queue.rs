// Copyright (c) Oppy Finance
// SPDX-License-Identifier: Apache-2.0

//! Priority queues for transfer requests.
//!
//! A queue is a map from the deterministic request index to the request,
//! plus a disjoint on-hold buffer for items parked during a backpressure
//! pause. Popping always removes the largest index, so ordering follows
//! the origin-height-then-hash rule encoded in the index itself.

use oppy_bridge_types::{ChainClass, InboundReq, OutBoundReq, ReqIndex};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

pub trait QueueItem: Clone {
    fn index(&self) -> ReqIndex;
    fn chain_class(&self) -> ChainClass;
}

impl QueueItem for InboundReq {
    fn index(&self) -> ReqIndex {
        InboundReq::index(self)
    }
    fn chain_class(&self) -> ChainClass {
        self.chain_class
    }
}

impl QueueItem for OutBoundReq {
    fn index(&self) -> ReqIndex {
        OutBoundReq::index(self)
    }
    fn chain_class(&self) -> ChainClass {
        self.chain_class
    }
}

pub struct RequestQueue<T> {
    name: &'static str,
    main: BTreeMap<ReqIndex, T>,
    on_hold: BTreeMap<ReqIndex, T>,
}

impl<T: QueueItem> RequestQueue<T> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            main: BTreeMap::new(),
            on_hold: BTreeMap::new(),
        }
    }

    /// Insert a request. Idempotent on the index; an item already queued
    /// or on hold is left untouched.
    pub fn add_item(&mut self, item: T) {
        let index = item.index();
        if self.on_hold.contains_key(&index) {
            return;
        }
        self.main.entry(index).or_insert(item);
    }

    /// Remove and return up to `n` items with the largest indices, keeping
    /// only those matching `filter`. Returns `None` when nothing matches.
    pub fn pop_items(&mut self, n: usize, filter: Option<ChainClass>) -> Option<Vec<T>> {
        let picked: Vec<ReqIndex> = self
            .main
            .iter()
            .rev()
            .filter(|(_, item)| filter.map_or(true, |class| item.chain_class() == class))
            .take(n)
            .map(|(index, _)| *index)
            .collect();
        if picked.is_empty() {
            return None;
        }
        let items = picked
            .iter()
            .filter_map(|index| self.main.remove(index))
            .collect();
        Some(items)
    }

    /// Park an item in the on-hold buffer until the current pause window
    /// ends.
    pub fn add_on_hold(&mut self, item: T) {
        let index = item.index();
        self.main.remove(&index);
        self.on_hold.insert(index, item);
    }

    /// Move every on-hold item back into the main queue.
    pub fn flush_on_hold(&mut self) {
        if self.on_hold.is_empty() {
            return;
        }
        debug!(
            "[{}] flushing {} on-hold items back to the queue",
            self.name,
            self.on_hold.len()
        );
        let held = std::mem::take(&mut self.on_hold);
        for (index, item) in held {
            self.main.insert(index, item);
        }
    }

    /// Atomically take every item out of the main queue, for the periodic
    /// requeue sweep.
    pub fn dump(&mut self) -> Vec<T> {
        std::mem::take(&mut self.main).into_values().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.main.is_empty()
    }

    pub fn size(&self) -> usize {
        self.main.len()
    }

    pub fn on_hold_size(&self) -> usize {
        self.on_hold.len()
    }

    /// Snapshot of everything the queue is responsible for, including the
    /// on-hold buffer. Ordering is reconstructed on import from the
    /// requests themselves.
    pub fn export_items(&self) -> Vec<T> {
        self.main
            .values()
            .chain(self.on_hold.values())
            .cloned()
            .collect()
    }
}

/// Outbound requests that were broadcast and await destination
/// verification.
#[derive(Default)]
pub struct PendingMap {
    inner: HashMap<ReqIndex, OutBoundReq>,
}

impl PendingMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, item: OutBoundReq) {
        self.inner.insert(item.index(), item);
    }

    pub fn remove(&mut self, index: &ReqIndex) -> Option<OutBoundReq> {
        self.inner.remove(index)
    }

    pub fn import(&mut self, items: Vec<OutBoundReq>) {
        for item in items {
            self.insert(item);
        }
    }

    pub fn export(&self) -> Vec<OutBoundReq> {
        self.inner.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::{Address as EthAddress, U256};
    use oppy_bridge_types::{AccAddress, Coin};

    fn inbound(height: i64, tag: u8) -> InboundReq {
        InboundReq::new(
            AccAddress::new("oppy", [tag; 20]),
            vec![tag; 32],
            EthAddress::repeat_byte(9),
            Coin::new("abnb", U256::from(1u8)),
            ChainClass::Native,
            height,
        )
    }

    fn outbound(height: i64, tag: u8, class: ChainClass) -> OutBoundReq {
        OutBoundReq::new(
            format!("{:02x}", tag),
            EthAddress::repeat_byte(tag),
            EthAddress::repeat_byte(1),
            Coin::new("abnb", U256::from(5u8)),
            class,
            String::new(),
            height,
        )
    }

    #[test]
    fn pop_removes_largest_index_first() {
        let mut queue = RequestQueue::new("inbound");
        let old = inbound(100, 1);
        let new = inbound(200, 2);
        queue.add_item(old.clone());
        queue.add_item(new.clone());

        let popped = queue.pop_items(1, None).unwrap();
        assert_eq!(popped[0].index(), new.index());
        let popped = queue.pop_items(1, None).unwrap();
        assert_eq!(popped[0].index(), old.index());
        assert!(queue.pop_items(1, None).is_none());
    }

    #[test]
    fn same_height_ties_break_on_larger_hash() {
        let mut queue = RequestQueue::new("inbound");
        let a = inbound(300, 3);
        let b = inbound(300, 4);
        let largest = if a.hash() > b.hash() {
            a.index()
        } else {
            b.index()
        };
        queue.add_item(a);
        queue.add_item(b);
        assert_eq!(queue.pop_items(1, None).unwrap()[0].index(), largest);
    }

    #[test]
    fn add_item_is_idempotent() {
        let mut queue = RequestQueue::new("inbound");
        let item = inbound(10, 5);
        queue.add_item(item.clone());
        queue.add_item(item);
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn filter_selects_only_matching_class() {
        let mut queue = RequestQueue::new("outbound");
        queue.add_item(outbound(1, 1, ChainClass::Native));
        queue.add_item(outbound(2, 2, ChainClass::Ibc));
        queue.add_item(outbound(3, 3, ChainClass::Native));

        let natives = queue.pop_items(10, Some(ChainClass::Native)).unwrap();
        assert_eq!(natives.len(), 2);
        assert!(natives.iter().all(|i| i.chain_class == ChainClass::Native));
        assert_eq!(queue.size(), 1);
        assert!(queue.pop_items(10, Some(ChainClass::Native)).is_none());
    }

    #[test]
    fn on_hold_is_disjoint_from_main() {
        let mut queue = RequestQueue::new("inbound");
        let item = inbound(42, 6);
        queue.add_item(item.clone());
        queue.add_on_hold(item.clone());
        assert_eq!(queue.size(), 0);
        assert_eq!(queue.on_hold_size(), 1);

        // re-adding while on hold must not resurrect it in main
        queue.add_item(item.clone());
        assert_eq!(queue.size(), 0);

        queue.flush_on_hold();
        assert_eq!(queue.size(), 1);
        assert_eq!(queue.on_hold_size(), 0);
    }

    #[test]
    fn dump_then_readd_loses_nothing() {
        let mut queue = RequestQueue::new("inbound");
        for i in 0..10u8 {
            queue.add_item(inbound(1000 + i as i64, i));
        }
        let dumped = queue.dump();
        assert_eq!(dumped.len(), 10);
        assert!(queue.is_empty());
        for item in dumped {
            queue.add_item(item);
        }
        assert_eq!(queue.size(), 10);
    }

    #[test]
    fn pop_order_is_independent_of_insertion_order() {
        use rand::seq::SliceRandom;

        let mut items: Vec<InboundReq> = (0..20u8).map(|i| inbound(500 + i as i64, i)).collect();
        let mut expected: Vec<_> = items.iter().map(|i| i.index()).collect();
        expected.sort();
        expected.reverse();

        let mut rng = rand::thread_rng();
        for _ in 0..5 {
            items.shuffle(&mut rng);
            let mut queue = RequestQueue::new("inbound");
            for item in &items {
                queue.add_item(item.clone());
            }
            let popped: Vec<_> = std::iter::from_fn(|| queue.pop_items(1, None))
                .flatten()
                .map(|i| i.index())
                .collect();
            assert_eq!(popped, expected);
        }
    }

    #[test]
    fn export_covers_main_and_on_hold() {
        let mut queue = RequestQueue::new("outbound");
        queue.add_item(outbound(1, 1, ChainClass::Native));
        let held = outbound(2, 2, ChainClass::Ibc);
        queue.add_on_hold(held);
        assert_eq!(queue.export_items().len(), 2);
    }

    #[test]
    fn pending_map_round_trip() {
        let mut pending = PendingMap::new();
        let item = outbound(9, 9, ChainClass::Native);
        pending.insert(item.clone());
        pending.insert(item.clone());
        assert_eq!(pending.len(), 1);

        let exported = pending.export();
        let mut restored = PendingMap::new();
        restored.import(exported);
        assert_eq!(restored.len(), 1);
        assert!(restored.remove(&item.index()).is_some());
        assert!(restored.is_empty());
    }
}
