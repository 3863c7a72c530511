//! FIFO of flows that have not yet seen bidirectional traffic.
//!
//! New flows are prepended, so the tail is the oldest half-open flow; a flow
//! is unlinked from any point once the responder sends data or the flow is
//! released. Links are intrusive (u32 indices on the record).

use crate::common::flow::Flow;
use crate::common::flow_key::FlowKey;
use crate::common::INVALID_INDEX;

use super::indexed_lru::IndexedLruTable;

pub type FlowTable = IndexedLruTable<FlowKey, Flow>;

const NIL: u32 = INVALID_INDEX;

pub struct FlowUniList {
    head: u32, // newest
    tail: u32, // oldest
    count: usize,
}

impl FlowUniList {
    pub fn new() -> Self {
        FlowUniList {
            head: NIL,
            tail: NIL,
            count: 0,
        }
    }

    pub fn get_count(&self) -> usize {
        self.count
    }

    // always prepend
    pub fn link_uni(&mut self, table: &mut FlowTable, id: u32) {
        let old_head = self.head;
        {
            let flow = table.value_mut(id);
            debug_assert!(!flow.in_uni);
            flow.in_uni = true;
            flow.uni_prev = NIL;
            flow.uni_next = old_head;
        }
        if old_head != NIL {
            table.value_mut(old_head).uni_prev = id;
        } else {
            self.tail = id;
        }
        self.head = id;
        self.count += 1;
    }

    // but remove from any point
    pub fn unlink_uni(&mut self, table: &mut FlowTable, id: u32) -> bool {
        let (prev, next) = {
            let flow = table.value_mut(id);
            if !flow.in_uni {
                return false;
            }
            flow.in_uni = false;
            let links = (flow.uni_prev, flow.uni_next);
            flow.uni_prev = NIL;
            flow.uni_next = NIL;
            links
        };
        if prev != NIL {
            table.value_mut(prev).uni_next = next;
        } else {
            self.head = next;
        }
        if next != NIL {
            table.value_mut(next).uni_prev = prev;
        } else {
            self.tail = prev;
        }
        self.count -= 1;
        true
    }

    pub fn get_oldest_uni(&self) -> Option<u32> {
        if self.tail == NIL {
            None
        } else {
            Some(self.tail)
        }
    }

    /// The next-newer half-open flow, for walking oldest to newest.
    pub fn get_prev(&self, table: &FlowTable, id: u32) -> Option<u32> {
        let prev = table.value(id).uni_prev;
        if prev == NIL {
            None
        } else {
            Some(prev)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::PktType;
    use crate::common::lookup_key::LookupKey;
    use crate::flow_cache::TOTAL_LRU_COUNT;

    fn add_flow(table: &mut FlowTable, port: u16) -> u32 {
        let lookup = LookupKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: port,
            dst_port: 80,
            pkt_type: PktType::Tcp,
            ..Default::default()
        };
        let (key, reversed) = FlowKey::from_lookup(&lookup);
        let flow = Flow::new(&lookup, reversed);
        table
            .insert(key, key.pkt_type.lru_index(), flow)
            .unwrap()
    }

    #[test]
    fn oldest_is_first_linked() {
        let mut table = FlowTable::new(8, TOTAL_LRU_COUNT as usize);
        let mut list = FlowUniList::new();
        let a = add_flow(&mut table, 1000);
        let b = add_flow(&mut table, 1001);
        let c = add_flow(&mut table, 1002);
        list.link_uni(&mut table, a);
        list.link_uni(&mut table, b);
        list.link_uni(&mut table, c);

        assert_eq!(list.get_count(), 3);
        assert_eq!(list.get_oldest_uni(), Some(a));
        assert_eq!(list.get_prev(&table, a), Some(b));
        assert_eq!(list.get_prev(&table, b), Some(c));
        assert_eq!(list.get_prev(&table, c), None);
    }

    #[test]
    fn unlink_from_any_point() {
        let mut table = FlowTable::new(8, TOTAL_LRU_COUNT as usize);
        let mut list = FlowUniList::new();
        let a = add_flow(&mut table, 1000);
        let b = add_flow(&mut table, 1001);
        let c = add_flow(&mut table, 1002);
        for id in [a, b, c] {
            list.link_uni(&mut table, id);
        }

        assert!(list.unlink_uni(&mut table, b));
        assert!(!list.unlink_uni(&mut table, b));
        assert_eq!(list.get_count(), 2);
        assert_eq!(list.get_oldest_uni(), Some(a));
        assert_eq!(list.get_prev(&table, a), Some(c));

        assert!(list.unlink_uni(&mut table, a));
        assert!(list.unlink_uni(&mut table, c));
        assert_eq!(list.get_count(), 0);
        assert_eq!(list.get_oldest_uni(), None);
    }
}
