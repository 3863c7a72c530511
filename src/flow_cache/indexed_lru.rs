//! Hash-indexed storage with N independent recency queues.
//!
//! Nodes live in an arena (`Vec`) and link to queue neighbours through u32
//! indices, one doubly-linked recency queue per class tag. A `HashMap` over
//! the key bytes gives O(1) lookup; the Jenkins 64-bit hasher keeps the hash
//! stable across platforms.
//!
//! Each queue carries two independent cursors: the sweep cursor
//! (`lru_first`/`lru_next`/`lru_current`) consumed by pruning and timeout,
//! and the walk cursor (`walk_first`/`walk_next`) consumed by the dump
//! engine. A walk sees each live node at most once, runs MRU to LRU, and is
//! stable across insertions into other queues; it may miss nodes inserted
//! behind it or revisit a node that migrates queues mid-walk. Cursors
//! pointing at a removed node are advanced, never left dangling.

use std::collections::HashMap;
use std::hash::Hash;

use crate::common::INVALID_INDEX;
use crate::utils::hasher::Jenkins64Hasher;

const NIL: u32 = INVALID_INDEX;

struct Node<K, V> {
    key: K,
    value: V,
    tag: u8,
    in_use: bool,
    prev: u32, // toward the LRU end
    next: u32, // toward the MRU end
}

struct LruQueue {
    head: u32, // LRU end
    tail: u32, // MRU end
    count: usize,
    cursor: u32,
    walk: u32,
}

impl LruQueue {
    fn new() -> Self {
        LruQueue {
            head: NIL,
            tail: NIL,
            count: 0,
            cursor: NIL,
            walk: NIL,
        }
    }
}

pub struct IndexedLruTable<K, V> {
    nodes: Vec<Node<K, V>>,
    free: Vec<u32>,
    map: HashMap<K, u32, Jenkins64Hasher>,
    queues: Vec<LruQueue>,
    max_nodes: usize,
    last_found: u32,
}

impl<K, V> IndexedLruTable<K, V>
where
    K: Hash + Eq + Clone,
    V: Default,
{
    pub fn new(max_nodes: usize, lru_count: usize) -> Self {
        IndexedLruTable {
            nodes: Vec::new(),
            free: Vec::new(),
            map: HashMap::with_hasher(Jenkins64Hasher::default()),
            queues: (0..lru_count).map(|_| LruQueue::new()).collect(),
            max_nodes,
            last_found: NIL,
        }
    }

    pub fn get_num_nodes(&self) -> usize {
        self.map.len()
    }

    pub fn get_node_count(&self, tag: u8) -> usize {
        self.queues[tag as usize].count
    }

    pub fn max_nodes(&self) -> usize {
        self.max_nodes
    }

    /// Lookup without any recency change. Remembers the node for a later
    /// `touch_last_found`, so the caller can pick the queue to promote in
    /// after inspecting the record.
    pub fn get(&mut self, key: &K) -> Option<u32> {
        let id = *self.map.get(key)?;
        self.last_found = id;
        Some(id)
    }

    /// Lookup; with `touch`, promote to MRU of the node's queue.
    pub fn get_user_data(&mut self, key: &K, touch: bool) -> Option<u32> {
        let id = self.get(key)?;
        if touch {
            let tag = self.nodes[id as usize].tag;
            self.promote(tag, id);
        }
        Some(id)
    }

    /// Promote the node returned by the last lookup to the MRU end of `tag`.
    pub fn touch_last_found(&mut self, tag: u8) {
        let id = self.last_found;
        if id == NIL {
            return;
        }
        debug_assert_eq!(self.nodes[id as usize].tag, tag);
        self.promote(tag, id);
    }

    /// Reserve a slot and link the new node at the MRU end of `tag`.
    /// Fails when the table is at capacity or the key is already present.
    pub fn insert(&mut self, key: K, tag: u8, value: V) -> Option<u32> {
        if self.map.len() >= self.max_nodes || self.map.contains_key(&key) {
            return None;
        }
        let id = match self.free.pop() {
            Some(id) => {
                let node = &mut self.nodes[id as usize];
                node.key = key.clone();
                node.value = value;
                node.tag = tag;
                node.in_use = true;
                node.prev = NIL;
                node.next = NIL;
                id
            }
            None => {
                let id = self.nodes.len() as u32;
                self.nodes.push(Node {
                    key: key.clone(),
                    value,
                    tag,
                    in_use: true,
                    prev: NIL,
                    next: NIL,
                });
                id
            }
        };
        self.map.insert(key, id);
        self.attach_mru(tag, id);
        Some(id)
    }

    /// Unlink from queue `tag` and free the slot. The key stays in the node
    /// until the slot is reused; the value is dropped immediately.
    pub fn release_node(&mut self, key: &K, tag: u8) -> bool {
        let Some(&id) = self.map.get(key) else {
            return false;
        };
        debug_assert_eq!(self.nodes[id as usize].tag, tag);
        self.remove_by_id(id);
        true
    }

    pub fn remove_by_id(&mut self, id: u32) {
        debug_assert!(self.nodes[id as usize].in_use);
        self.fixup_cursors(id);
        let tag = self.nodes[id as usize].tag;
        self.detach(tag, id);
        let node = &mut self.nodes[id as usize];
        node.in_use = false;
        node.value = V::default();
        let key = node.key.clone();
        self.map.remove(&key);
        if self.last_found == id {
            self.last_found = NIL;
        }
        self.free.push(id);
    }

    /// Move the node between queues, keeping its recency position as the MRU
    /// of the target. Fails when the node is missing or already in `to_tag`.
    /// Capacity is a shared global pool, so the target cannot be full.
    pub fn switch_lru_cache(&mut self, key: &K, from_tag: u8, to_tag: u8) -> bool {
        let Some(&id) = self.map.get(key) else {
            return false;
        };
        let node_tag = self.nodes[id as usize].tag;
        if node_tag != from_tag || from_tag == to_tag {
            return false;
        }
        self.fixup_cursors(id);
        self.detach(from_tag, id);
        self.nodes[id as usize].tag = to_tag;
        self.attach_mru(to_tag, id);
        true
    }

    /// Reset the sweep cursor to the LRU end and return it.
    pub fn lru_first(&mut self, tag: u8) -> Option<u32> {
        let head = self.queues[tag as usize].head;
        self.queues[tag as usize].cursor = head;
        opt(head)
    }

    /// Advance the sweep cursor toward the MRU end and return it.
    pub fn lru_next(&mut self, tag: u8) -> Option<u32> {
        let cursor = self.queues[tag as usize].cursor;
        if cursor == NIL {
            return None;
        }
        let next = self.nodes[cursor as usize].next;
        self.queues[tag as usize].cursor = next;
        opt(next)
    }

    /// The sweep cursor without moving it.
    pub fn lru_current(&self, tag: u8) -> Option<u32> {
        opt(self.queues[tag as usize].cursor)
    }

    /// Re-insert the current LRU front at the MRU end without reading it,
    /// so a sweep blocked on an undeletable front cannot livelock.
    pub fn lru_touch(&mut self, tag: u8) {
        let head = self.queues[tag as usize].head;
        if head == NIL || self.queues[tag as usize].count < 2 {
            return;
        }
        self.detach(tag, head);
        self.attach_mru(tag, head);
    }

    /// Reset the walk cursor to the MRU end and return it.
    pub fn get_walk_user_data(&mut self, tag: u8) -> Option<u32> {
        let tail = self.queues[tag as usize].tail;
        self.queues[tag as usize].walk = tail;
        opt(tail)
    }

    /// Advance the walk cursor toward the LRU end and return it.
    pub fn get_next_walk_user_data(&mut self, tag: u8) -> Option<u32> {
        let walk = self.queues[tag as usize].walk;
        if walk == NIL {
            return None;
        }
        let prev = self.nodes[walk as usize].prev;
        self.queues[tag as usize].walk = prev;
        opt(prev)
    }

    /// The walk cursor without moving it.
    pub fn walk_current(&self, tag: u8) -> Option<u32> {
        opt(self.queues[tag as usize].walk)
    }

    pub fn key(&self, id: u32) -> &K {
        debug_assert!(self.nodes[id as usize].in_use);
        &self.nodes[id as usize].key
    }

    pub fn value(&self, id: u32) -> &V {
        debug_assert!(self.nodes[id as usize].in_use);
        &self.nodes[id as usize].value
    }

    pub fn value_mut(&mut self, id: u32) -> &mut V {
        debug_assert!(self.nodes[id as usize].in_use);
        &mut self.nodes[id as usize].value
    }

    pub fn tag(&self, id: u32) -> u8 {
        self.nodes[id as usize].tag
    }

    fn promote(&mut self, tag: u8, id: u32) {
        if self.queues[tag as usize].tail == id {
            return;
        }
        self.detach(tag, id);
        self.attach_mru(tag, id);
    }

    // Chain surgery only; cursors follow the node wherever it moves.
    fn detach(&mut self, tag: u8, id: u32) {
        let (prev, next) = {
            let node = &self.nodes[id as usize];
            (node.prev, node.next)
        };
        if prev != NIL {
            self.nodes[prev as usize].next = next;
        } else {
            self.queues[tag as usize].head = next;
        }
        if next != NIL {
            self.nodes[next as usize].prev = prev;
        } else {
            self.queues[tag as usize].tail = prev;
        }
        let node = &mut self.nodes[id as usize];
        node.prev = NIL;
        node.next = NIL;
        self.queues[tag as usize].count -= 1;
    }

    fn attach_mru(&mut self, tag: u8, id: u32) {
        let tail = self.queues[tag as usize].tail;
        {
            let node = &mut self.nodes[id as usize];
            node.prev = tail;
            node.next = NIL;
        }
        if tail != NIL {
            self.nodes[tail as usize].next = id;
        } else {
            self.queues[tag as usize].head = id;
        }
        self.queues[tag as usize].tail = id;
        self.queues[tag as usize].count += 1;
    }

    // A removed node must not strand a cursor: the sweep cursor steps toward
    // the MRU end, the walk cursor toward the LRU end.
    fn fixup_cursors(&mut self, id: u32) {
        let tag = self.nodes[id as usize].tag as usize;
        if self.queues[tag].cursor == id {
            self.queues[tag].cursor = self.nodes[id as usize].next;
        }
        if self.queues[tag].walk == id {
            self.queues[tag].walk = self.nodes[id as usize].prev;
        }
    }
}

fn opt(id: u32) -> Option<u32> {
    if id == NIL {
        None
    } else {
        Some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Table = IndexedLruTable<u64, u64>;

    fn filled(max: usize, tags: &[(u64, u8)]) -> Table {
        let mut table = Table::new(max, 4);
        for &(key, tag) in tags {
            assert!(table.insert(key, tag, key * 10).is_some());
        }
        table
    }

    #[test]
    fn insert_caps_at_max_nodes() {
        let mut table = Table::new(2, 4);
        assert!(table.insert(1, 0, 0).is_some());
        assert!(table.insert(2, 1, 0).is_some());
        assert!(table.insert(3, 2, 0).is_none());
        assert_eq!(table.get_num_nodes(), 2);
    }

    #[test]
    fn duplicate_keys_rejected() {
        let mut table = Table::new(4, 4);
        assert!(table.insert(1, 0, 0).is_some());
        assert!(table.insert(1, 0, 0).is_none());
    }

    #[test]
    fn fresh_insert_is_mru() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        assert_eq!(table.get_walk_user_data(0), table.get(&3));
        assert_eq!(table.lru_first(0), table.get(&1));
    }

    #[test]
    fn touch_promotes_to_mru() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        let id = table.get_user_data(&1, true).unwrap();
        assert_eq!(table.get_walk_user_data(0), Some(id));
        assert_eq!(table.lru_first(0), table.get(&2));
    }

    #[test]
    fn touch_last_found_picks_the_queue_later() {
        let mut table = filled(8, &[(1, 0), (2, 0)]);
        let id = table.get(&1).unwrap();
        table.touch_last_found(0);
        assert_eq!(table.get_walk_user_data(0), Some(id));
    }

    #[test]
    fn queues_are_independent() {
        let mut table = filled(8, &[(1, 0), (2, 1), (3, 0), (4, 1)]);
        assert_eq!(table.get_node_count(0), 2);
        assert_eq!(table.get_node_count(1), 2);
        assert_eq!(table.lru_first(0), table.get(&1));
        assert_eq!(table.lru_first(1), table.get(&2));
    }

    #[test]
    fn sweep_cursor_walks_lru_to_mru() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        let first = table.lru_first(0).unwrap();
        let second = table.lru_next(0).unwrap();
        let third = table.lru_next(0).unwrap();
        assert_eq!(table.lru_next(0), None);
        assert_eq!(*table.value(first), 10);
        assert_eq!(*table.value(second), 20);
        assert_eq!(*table.value(third), 30);
    }

    #[test]
    fn sweep_cursor_survives_removal() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        let first = table.lru_first(0).unwrap();
        table.remove_by_id(first);
        // cursor advanced to the next-older entry instead of dangling
        assert_eq!(table.lru_current(0), table.get(&2));
    }

    #[test]
    fn walk_cursor_survives_removal() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        let mru = table.get_walk_user_data(0).unwrap();
        table.remove_by_id(mru);
        assert_eq!(table.get_next_walk_user_data(0), table.get(&1));
    }

    #[test]
    fn lru_touch_rotates_front_to_back() {
        let mut table = filled(8, &[(1, 0), (2, 0), (3, 0)]);
        table.lru_first(0);
        table.lru_touch(0);
        assert_eq!(table.lru_first(0), table.get(&2));
        assert_eq!(table.get_walk_user_data(0), table.get(&1));
    }

    #[test]
    fn switch_queue_moves_and_counts() {
        let mut table = filled(8, &[(1, 0), (2, 0)]);
        assert!(table.switch_lru_cache(&1, 0, 3));
        assert_eq!(table.get_node_count(0), 1);
        assert_eq!(table.get_node_count(3), 1);
        let id = table.get(&1).unwrap();
        assert_eq!(table.tag(id), 3);
        // already there
        assert!(!table.switch_lru_cache(&1, 0, 3));
        assert!(!table.switch_lru_cache(&99, 0, 3));
    }

    #[test]
    fn slots_recycle_after_release() {
        let mut table = Table::new(2, 4);
        table.insert(1, 0, 10).unwrap();
        table.insert(2, 0, 20).unwrap();
        assert!(table.release_node(&1, 0));
        assert!(!table.release_node(&1, 0));
        assert!(table.insert(3, 1, 30).is_some());
        assert_eq!(table.get_num_nodes(), 2);
        assert_eq!(table.get_node_count(0), 1);
        assert_eq!(table.get_node_count(1), 1);
    }
}
