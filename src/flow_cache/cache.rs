//! Admission, lookup, pruning, timeout, purge and allowlist migration.
//!
//! One instance per packet-processing worker; nothing here is shared across
//! threads except the peg counters, which are monotonic atomics reduced on
//! read. Within a worker a packet's find/allocate/inspect/release sequence
//! is totally ordered, and recency promotion happens before any inspector
//! runs so the queues reflect packet arrival time.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::warn;

use crate::common::enums::{
    FlowDeleteState, PktType, PruneReason, Verdict, FLOW_DELETE_STATE_MAX, PRUNE_REASON_MAX,
};
use crate::common::flow::{Flow, FlowFlags};
use crate::common::flow_key::FlowKey;
use crate::common::inspector::InspectorRegistry;
use crate::common::lookup_key::LookupKey;
use crate::utils::stats::{Counter, CounterType, CounterValue, RefCountable};
use crate::utils::tracer::{
    ActiveSuspendGuard, PacketTracer, PacketTracerSuspend, PacketTracerUnsuspend, SuspendReason,
};
use crate::utils::watchdog;

use super::flow_config::FlowAccess;
use super::uni_list::{FlowTable, FlowUniList};
use super::{
    ALLOWLIST_LRU_INDEX, FIRST_PROTO, MAX_PROTOCOLS, TOTAL_LRU_COUNT,
};

const ALLOWED_FLOWS_ONLY: u32 = 1;
const OFFLOADED_FLOWS_TOO: u32 = 2;
const ALL_FLOWS: u32 = 3;
// kick watchdog once for every 8 flows deleted
const WDT_MASK: u32 = 7;

fn get_lru_mask(lru_idx: u8) -> u64 {
    1u64 << lru_idx
}

fn is_lru_checked(checked: u64, mask: u64) -> bool {
    (checked & mask) != 0
}

fn all_lrus_checked(checked: u64, lru_count: u8) -> bool {
    let all = (1u64 << lru_count) - 1;
    (checked & all) == all
}

/// Eviction accounting, per reason and per class (the allowlist counts as
/// its own class). Lock-free monotonic; reduced on read.
#[derive(Default)]
pub struct PruneStats {
    counts: [[AtomicU64; TOTAL_LRU_COUNT as usize]; PRUNE_REASON_MAX],
}

impl PruneStats {
    pub fn update(&self, reason: PruneReason, tag: u8) {
        self.counts[reason as usize][tag as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, reason: PruneReason, tag: u8) -> u64 {
        self.counts[reason as usize][tag as usize].load(Ordering::Relaxed)
    }

    pub fn get_reason_total(&self, reason: PruneReason) -> u64 {
        self.counts[reason as usize]
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }

    pub fn get_total(&self) -> u64 {
        self.counts
            .iter()
            .flatten()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

impl RefCountable for PruneStats {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "flows_pruned_idle_max",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::IdleMaxFlows)),
            ),
            (
                "flows_pruned_idle_timeout",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::IdleProtocolTimeout)),
            ),
            (
                "flows_pruned_excess",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::Excess)),
            ),
            (
                "flows_pruned_uni",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::Uni)),
            ),
            (
                "flows_pruned_memcap",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::Memcap)),
            ),
            (
                "flows_retired",
                CounterType::Counted,
                CounterValue::Unsigned(self.get_reason_total(PruneReason::None)),
            ),
        ]
    }
}

/// Category accounting for the reload-driven delete sweep.
#[derive(Default)]
pub struct FlowDeleteStats {
    counts: [AtomicU64; FLOW_DELETE_STATE_MAX],
}

impl FlowDeleteStats {
    pub fn update(&self, state: FlowDeleteState) {
        self.counts[state as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, state: FlowDeleteState) -> u64 {
        self.counts[state as usize].load(Ordering::Relaxed)
    }
}

impl RefCountable for FlowDeleteStats {
    fn get_counters(&self) -> Vec<Counter> {
        vec![
            (
                "flows_deleted_allowed",
                CounterType::Counted,
                CounterValue::Unsigned(self.get(FlowDeleteState::Allowed)),
            ),
            (
                "flows_deleted_offloaded",
                CounterType::Counted,
                CounterValue::Unsigned(self.get(FlowDeleteState::Offloaded)),
            ),
            (
                "flows_deleted_blocked",
                CounterType::Counted,
                CounterValue::Unsigned(self.get(FlowDeleteState::Blocked)),
            ),
        ]
    }
}

// not thread-safe
pub struct FlowCache {
    id: u32,
    config: FlowAccess,
    registry: Arc<InspectorRegistry>,
    table: FlowTable,
    uni_flows: Option<FlowUniList>,
    uni_ip_flows: Option<FlowUniList>,
    /// Bit set per protocol queue known to be empty, so sweeps skip them.
    empty_lru_mask: u64,
    /// Persistent round-robin position of the timeout sweep.
    timeout_idx: u8,
    purging: bool,
    /// Last packet-clock reading, for eviction trace lines.
    packet_time: i64,
    prune_stats: Arc<PruneStats>,
    delete_stats: Arc<FlowDeleteStats>,
    excess_to_allowlist_count: u64,
}

impl FlowCache {
    pub fn new(id: u32, config: FlowAccess, registry: Arc<InspectorRegistry>) -> Self {
        let max_flows = config.load().max_flows;
        FlowCache {
            id,
            config,
            registry,
            table: FlowTable::new(max_flows, TOTAL_LRU_COUNT as usize),
            uni_flows: Some(FlowUniList::new()),
            uni_ip_flows: Some(FlowUniList::new()),
            empty_lru_mask: (1u64 << MAX_PROTOCOLS) - 1,
            timeout_idx: FIRST_PROTO,
            purging: false,
            packet_time: 0,
            prune_stats: Arc::new(PruneStats::default()),
            delete_stats: Arc::new(FlowDeleteStats::default()),
            excess_to_allowlist_count: 0,
        }
    }

    /// 1-based worker index, as reported in dump output.
    pub fn instance_number(&self) -> u32 {
        self.id + 1
    }

    pub fn get_count(&self) -> usize {
        self.table.get_num_nodes()
    }

    pub fn get_flows_allocated(&self) -> usize {
        self.table.get_num_nodes()
    }

    pub fn get_lru_flow_count(&self, lru_idx: u8) -> usize {
        self.table.get_node_count(lru_idx)
    }

    pub fn uni_flows_size(&self) -> usize {
        self.uni_flows.as_ref().map(|l| l.get_count()).unwrap_or(0)
    }

    pub fn uni_ip_flows_size(&self) -> usize {
        self.uni_ip_flows
            .as_ref()
            .map(|l| l.get_count())
            .unwrap_or(0)
    }

    pub fn prune_stats(&self) -> Arc<PruneStats> {
        self.prune_stats.clone()
    }

    pub fn delete_stats(&self) -> Arc<FlowDeleteStats> {
        self.delete_stats.clone()
    }

    pub fn excess_to_allowlist_count(&self) -> u64 {
        self.excess_to_allowlist_count
    }

    pub fn is_purging(&self) -> bool {
        self.purging
    }

    pub fn flow(&self, id: u32) -> &Flow {
        self.table.value(id)
    }

    pub fn flow_mut(&mut self, id: u32) -> &mut Flow {
        self.table.value_mut(id)
    }

    pub fn key(&self, id: u32) -> &FlowKey {
        self.table.key(id)
    }

    /// Dump-walk entry points, forwarded to the table's walk cursor.
    pub fn walk_first(&mut self, lru_idx: u8) -> Option<u32> {
        self.table.get_walk_user_data(lru_idx)
    }

    pub fn walk_next(&mut self, lru_idx: u8) -> Option<u32> {
        self.table.get_next_walk_user_data(lru_idx)
    }

    /// The walk position without moving it. Authoritative across yields: a
    /// release while the walk is parked moves the cursor itself, so resumed
    /// dumps never hold a stale node.
    pub fn walk_current(&self, lru_idx: u8) -> Option<u32> {
        self.table.walk_current(lru_idx)
    }

    pub fn count_flows_in_lru(&mut self, lru_idx: u8) -> usize {
        let mut count = 0;
        let mut cursor = self.table.get_walk_user_data(lru_idx);
        while cursor.is_some() {
            count += 1;
            cursor = self.table.get_next_walk_user_data(lru_idx);
        }
        count
    }

    /// Lookup; on hit, promote in the flow's current queue and pull
    /// `last_data_seen` forward. Promotion happens here, before inspectors
    /// run.
    pub fn find(&mut self, key: &FlowKey, now: i64) -> Option<u32> {
        self.packet_time = now;
        let id = self.table.get_user_data(key, false)?;
        if self.table.value(id).flags.contains(FlowFlags::IN_ALLOWLIST) {
            self.table.touch_last_found(ALLOWLIST_LRU_INDEX);
        } else {
            self.table.touch_last_found(key.pkt_type.lru_index());
        }
        let flow = self.table.value_mut(id);
        if flow.last_data_seen < now {
            flow.last_data_seen = now;
        }
        Some(id)
    }

    /// Admit a new flow after a failed `find`. Runs the prune cascade when
    /// at capacity; returns `None` when even that freed nothing (the caller
    /// drops the packet).
    pub fn allocate(&mut self, lookup: &LookupKey) -> Option<u32> {
        let timestamp = lookup.timestamp;
        self.packet_time = timestamp;
        let config = self.config.load_full();
        if self.table.get_num_nodes() >= config.max_flows {
            if PacketTracer::is_active() {
                PacketTracer::log(format_args!(
                    "Flow: at max_flows limit ({}/{}), attempting to prune for new allocation",
                    self.table.get_num_nodes(),
                    config.max_flows
                ));
            }

            let pruned_idle = self.prune_idle(timestamp, None);
            if pruned_idle == 0 {
                let pruned_uni = self.prune_unis(lookup.pkt_type);
                if pruned_uni == 0 {
                    let pruned_excess = self.prune_excess(None);
                    if PacketTracer::is_active() && pruned_excess == 0 {
                        PacketTracer::log(format_args!(
                            "Flow: CRITICAL - allocation at max capacity, no flows could be \
                             pruned (idle=0, uni=0, excess=0), current={}, max={}",
                            self.table.get_num_nodes(),
                            config.max_flows
                        ));
                    }
                }
            }
        }

        let (key, reversed) = FlowKey::from_lookup(lookup);
        let mut flow = Flow::new(lookup, reversed);
        flow.last_data_seen = timestamp;
        flow.set_idle_timeout(config.nominal_timeout_secs(key.pkt_type));
        let tag = key.pkt_type.lru_index();
        let id = match self.table.insert(key, tag, flow) {
            Some(id) => id,
            None => {
                if PacketTracer::is_active() {
                    PacketTracer::log(format_args!(
                        "Flow: dropping packet, no room for flow ({} flows allocated)",
                        self.table.get_num_nodes()
                    ));
                }
                return None;
            }
        };
        self.link_uni(id);
        self.empty_lru_mask &= !(1u64 << tag);

        let registry = self.registry.clone();
        for inspector in registry.inspectors() {
            inspector.on_flow_create(self.table.value_mut(id));
        }
        Some(id)
    }

    fn link_uni(&mut self, id: u32) {
        let is_ip = self.table.key(id).pkt_type == PktType::Ip;
        let list = if is_ip {
            self.uni_ip_flows.as_mut()
        } else {
            self.uni_flows.as_mut()
        };
        if let Some(list) = list {
            list.link_uni(&mut self.table, id);
        }
    }

    /// Public so the packet path can drop a flow from the half-open list
    /// once the responder has sent data.
    pub fn unlink_uni(&mut self, id: u32) {
        let is_ip = self.table.key(id).pkt_type == PktType::Ip;
        let list = if is_ip {
            self.uni_ip_flows.as_mut()
        } else {
            self.uni_flows.as_mut()
        };
        if let Some(list) = list {
            list.unlink_uni(&mut self.table, id);
        }
    }

    fn remove(&mut self, id: u32) {
        self.unlink_uni(id);
        // destruction order: lists, then record, then hash node; the key is
        // owned by the table and stays valid until the node is freed
        self.table.remove_by_id(id);
    }

    fn reset_flow(&mut self, id: u32, reason: PruneReason) {
        let registry = self.registry.clone();
        let flow = self.table.value_mut(id);
        for inspector in registry.inspectors() {
            inspector.on_flow_release(flow, reason);
        }
        flow.free_flow_data();
    }

    /// Release one flow. Honours the one-shot `KEEP_FLOW` sticky bit on
    /// unblocked flows; returns whether the flow was actually removed.
    pub fn release(&mut self, id: u32, reason: PruneReason, do_cleanup: bool) -> bool {
        {
            let flow = self.table.value_mut(id);
            if !flow.was_blocked() {
                flow.flush(do_cleanup);
                if flow.flags.contains(FlowFlags::KEEP_FLOW) {
                    flow.flags.remove(FlowFlags::KEEP_FLOW);
                    return false;
                }
            }
        }

        if PacketTracer::is_active() {
            self.log_flow_release(id, reason);
        }

        let in_allowlist = self.table.value(id).flags.contains(FlowFlags::IN_ALLOWLIST);
        let pkt_type = self.table.key(id).pkt_type;
        self.reset_flow(id, reason);
        let tag = if in_allowlist {
            ALLOWLIST_LRU_INDEX
        } else {
            pkt_type.lru_index()
        };
        self.prune_stats.update(reason, tag);
        self.remove(id);
        true
    }

    /// Unconditional removal used only during purge.
    pub fn retire(&mut self, id: u32) {
        self.reset_flow(id, PruneReason::None);
        let pkt_type = self.table.key(id).pkt_type;
        self.prune_stats
            .update(PruneReason::None, pkt_type.lru_index());
        self.remove(id);
    }

    /// Round-robin idle eviction under capacity pressure. Stops after the
    /// batch limit, when enough room was made, or when every queue is empty
    /// or was visited without finding a victim.
    pub fn prune_idle(&mut self, thetime: i64, save_me: Option<u32>) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Prune);
        let config = self.config.load_full();
        let cleanup_flows = config.cleanup_flows;
        let pruning_timeout = config.pruning_timeout_secs();

        let mut pruned: u32 = 0;
        let mut checked_lrus_mask = self.empty_lru_mask;

        {
            let _pt_susp = PacketTracerSuspend::new();
            'outer: while pruned <= cleanup_flows
                && !all_lrus_checked(checked_lrus_mask, MAX_PROTOCOLS)
            {
                // Round-robin through the LRU types
                for lru_idx in FIRST_PROTO..MAX_PROTOCOLS {
                    if pruned > cleanup_flows {
                        break 'outer;
                    }

                    let lru_mask = get_lru_mask(lru_idx);
                    if is_lru_checked(checked_lrus_mask, lru_mask) {
                        continue;
                    }

                    let Some(id) = self.table.lru_first(lru_idx) else {
                        checked_lrus_mask |= lru_mask;
                        self.empty_lru_mask |= lru_mask;
                        continue;
                    };

                    let (suspended, last_data_seen) = {
                        let flow = self.table.value(id);
                        (flow.is_suspended(), flow.last_data_seen)
                    };
                    if save_me == Some(id)
                        || suspended
                        || last_data_seen + pruning_timeout >= thetime
                    {
                        checked_lrus_mask |= lru_mask;
                        continue;
                    }

                    self.table
                        .value_mut(id)
                        .flags
                        .insert(FlowFlags::TIMED_OUT);
                    if self.release(id, PruneReason::IdleMaxFlows, true) {
                        pruned += 1;
                        // enough room freed for the pending allocation
                        if self.table.get_num_nodes() < config.max_flows {
                            break 'outer;
                        }
                    }
                }
            }
        }

        if PacketTracer::is_active() && pruned > 0 {
            PacketTracer::log(format_args!("Flow: Pruned idle {} flows", pruned));
        }

        pruned
    }

    /// Trim the half-open list matching the incoming packet's class, oldest
    /// first, skipping flows with a committed drop verdict.
    pub fn prune_unis(&mut self, pkt_type: PktType) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Prune);
        let config = self.config.load_full();
        // we may have many or few unis; need to find reasonable ratio
        let max_uni = (config.max_flows >> 2) + 1;
        let cleanup_flows = config.cleanup_flows;
        let use_ip_list = pkt_type == PktType::Ip;

        let mut pruned: u32 = 0;
        {
            let _pt_susp = PacketTracerSuspend::new();
            let mut cursor = match if use_ip_list {
                self.uni_ip_flows.as_ref()
            } else {
                self.uni_flows.as_ref()
            } {
                Some(list) => list.get_oldest_uni(),
                None => None,
            };

            loop {
                let count = if use_ip_list {
                    self.uni_ip_flows_size()
                } else {
                    self.uni_flows_size()
                };
                let Some(prune_me) = cursor else { break };
                if count <= max_uni || pruned >= cleanup_flows {
                    break;
                }

                cursor = if use_ip_list {
                    self.uni_ip_flows
                        .as_ref()
                        .and_then(|l| l.get_prev(&self.table, prune_me))
                } else {
                    self.uni_flows
                        .as_ref()
                        .and_then(|l| l.get_prev(&self.table, prune_me))
                };

                if self.table.value(prune_me).was_blocked() {
                    continue;
                }

                if self.release(prune_me, PruneReason::Uni, true) {
                    pruned += 1;
                }
            }
        }

        if PacketTracer::is_active() && pruned > 0 {
            PacketTracer::log(format_args!("Flow: Pruned uni {} flows", pruned));
        }

        pruned
    }

    /// Aggressive sweep once idle and uni pruning came up empty. With
    /// allowlist-on-excess configured, eligible flows are migrated to the
    /// allowlist instead of evicted; the migration counts as a prune and
    /// raises the target capacity, which is surprising but intentional.
    pub fn prune_excess(&mut self, save_me: Option<u32>) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Prune);
        let config = self.config.load_full();
        let mut max_cap = config
            .max_flows
            .saturating_sub(config.cleanup_flows as usize)
            .max(1);

        let mut pruned: u32 = 0;
        let mut allowed: u32 = 0;

        // Initially skip offloads but if that doesn't work, the table is
        // iterated from the beginning again. Prune offloads at that point.
        let mut ignore_offloads = self.table.get_num_nodes();
        let mut checked_lrus_mask: u64 = 0;

        let (mut lru_idx, last_lru_idx) = if self.is_allowlist_on_excess() {
            max_cap += self.table.get_node_count(ALLOWLIST_LRU_INDEX);
            (FIRST_PROTO, MAX_PROTOCOLS)
        } else {
            (ALLOWLIST_LRU_INDEX, TOTAL_LRU_COUNT)
        };

        {
            let _pt_susp = PacketTracerSuspend::new();
            let mut blocks: usize = 0;

            loop {
                let num_nodes = self.table.get_num_nodes();
                if num_nodes <= max_cap
                    || num_nodes <= blocks
                    || ignore_offloads == 0
                    || all_lrus_checked(checked_lrus_mask, last_lru_idx)
                {
                    break;
                }

                while lru_idx < last_lru_idx {
                    let num_nodes = self.table.get_num_nodes();
                    if num_nodes <= max_cap || num_nodes <= blocks {
                        break;
                    }

                    let lru_mask = get_lru_mask(lru_idx);
                    if is_lru_checked(checked_lrus_mask, lru_mask) {
                        lru_idx += 1;
                        continue;
                    }

                    let Some(id) = self.table.lru_first(lru_idx) else {
                        checked_lrus_mask |= lru_mask;
                        lru_idx += 1;
                        continue;
                    };

                    let (blocked, suspended) = {
                        let flow = self.table.value(id);
                        (flow.was_blocked(), flow.is_suspended())
                    };
                    if save_me == Some(id) || blocked || (suspended && ignore_offloads > 0) {
                        // Avoid pruning the current flow or blocked/suspended
                        // flows; keep the queue sorted by time on touch
                        if blocked {
                            blocks += 1;
                        }
                        self.table.lru_touch(lru_idx);
                    } else if self.allowlist_on_excess(id) {
                        pruned += 1;
                        max_cap += 1;
                        allowed += 1;
                    } else {
                        self.table.value_mut(id).flags.insert(FlowFlags::PRUNED);
                        if self.release(id, PruneReason::Excess, true) {
                            pruned += 1;
                        }
                    }
                    if ignore_offloads > 0 {
                        ignore_offloads -= 1;
                    }
                    lru_idx += 1;
                }

                if lru_idx >= last_lru_idx {
                    lru_idx = FIRST_PROTO;
                }
            }

            if pruned == 0 && self.table.get_num_nodes() > max_cap {
                pruned += self.prune_multiple(PruneReason::Excess, true);
            }
        }

        if PacketTracer::is_active() {
            if allowed > 0 {
                PacketTracer::log(format_args!("Flow: Moved {} flows to allowlist", allowed));
            } else if pruned > 0 {
                PacketTracer::log(format_args!("Flow: Pruned excess {} flows", pruned));
            }
        }
        pruned
    }

    /// Evict the LRU front of one queue, honouring the allowlist policy
    /// matrix. Assumes the current packet's flow is the MRU.
    pub fn prune_one(&mut self, reason: PruneReason, do_cleanup: bool, lru_type: u8) -> bool {
        // Avoid pruning the current flow (assume current == MRU)
        if self.table.get_num_nodes() <= 1 {
            return false;
        }

        let Some(id) = self.table.lru_first(lru_type) else {
            return false;
        };

        self.table.value_mut(id).flags.insert(FlowFlags::PRUNED);

        if let Some(flow_handled) = self.handle_allowlist_pruning(id, reason, lru_type) {
            return flow_handled;
        }

        self.release(id, reason, do_cleanup)
    }

    /// Strict round-robin eviction, allowlist queue first for EXCESS and
    /// MEMCAP, until the batch target or every queue is exhausted.
    pub fn prune_multiple(&mut self, reason: PruneReason, do_cleanup: bool) -> u32 {
        let mut pruned: u32 = 0;
        // so we don't prune the current flow (assume current == MRU)
        if self.table.get_num_nodes() <= 1 {
            return 0;
        }

        let prune_flows = self.config.load().prune_flows;

        if reason == PruneReason::Memcap || reason == PruneReason::Excess {
            // if MEMCAP or EXCESS, prune the allowlist first
            while pruned < prune_flows {
                if !self.prune_one(reason, do_cleanup, ALLOWLIST_LRU_INDEX) {
                    break;
                }
                pruned += 1;
            }
        }

        let mut lru_idx: u8 = 0;
        let mut checked_lrus_mask: u64 = 0;
        while pruned < prune_flows {
            let lru_mask = get_lru_mask(lru_idx);
            if is_lru_checked(checked_lrus_mask, lru_mask)
                || !self.prune_one(reason, do_cleanup, lru_idx)
            {
                checked_lrus_mask |= lru_mask;
                if all_lrus_checked(checked_lrus_mask, MAX_PROTOCOLS) {
                    break;
                }
            } else {
                pruned += 1;
            }

            lru_idx += 1;
            if lru_idx >= MAX_PROTOCOLS {
                lru_idx = 0;
            }
        }

        if PacketTracer::is_active() && pruned > 0 {
            PacketTracer::log(format_args!("Flow: Pruned memcap {} flows", pruned));
        }

        pruned
    }

    /// Timer-driven retirement of aged flows, round-robin across protocol
    /// queues. The allowlist queue is exempt: allowlisted flows age only
    /// under memcap pressure. The sweep position survives across calls.
    pub fn timeout(&mut self, num_flows: u32, thetime: i64) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Timeout);
        self.packet_time = thetime;

        let mut retired: u32 = 0;
        // start by skipping protocols that have no flows
        let mut checked_lrus_mask = self.empty_lru_mask;
        // one full pass per queue per call, so a queue holding only
        // suspended expired flows cannot spin the sweep
        let mut skipped = [0usize; MAX_PROTOCOLS as usize];

        {
            let _pt_susp = PacketTracerSuspend::new();

            'outer: while retired < num_flows
                && !all_lrus_checked(checked_lrus_mask, MAX_PROTOCOLS)
            {
                while self.timeout_idx < MAX_PROTOCOLS {
                    let lru_idx = self.timeout_idx;
                    let lru_mask = get_lru_mask(lru_idx);

                    if is_lru_checked(checked_lrus_mask, lru_mask) {
                        self.timeout_idx += 1;
                        continue;
                    }

                    let id = match self.table.lru_current(lru_idx) {
                        Some(id) => id,
                        None => match self.table.lru_first(lru_idx) {
                            Some(id) => id,
                            None => {
                                checked_lrus_mask |= lru_mask;
                                self.empty_lru_mask |= lru_mask;
                                self.timeout_idx += 1;
                                continue;
                            }
                        },
                    };

                    let (hard, expire_time, last_data_seen, idle_timeout, skip) = {
                        let flow = self.table.value(id);
                        (
                            flow.is_hard_expiration(),
                            flow.expire_time,
                            flow.last_data_seen,
                            flow.idle_timeout,
                            flow.flags.contains(FlowFlags::HA_STANDBY) || flow.is_suspended(),
                        )
                    };

                    if hard {
                        if expire_time > thetime {
                            checked_lrus_mask |= lru_mask;
                            self.timeout_idx += 1;
                            continue;
                        }
                    } else if last_data_seen + idle_timeout > thetime {
                        checked_lrus_mask |= lru_mask;
                        self.timeout_idx += 1;
                        continue;
                    }

                    if skip {
                        // eligible but untouchable; later entries may still
                        // qualify, so do not mark the queue checked
                        skipped[lru_idx as usize] += 1;
                        self.table.lru_next(lru_idx);
                        if skipped[lru_idx as usize] >= self.table.get_node_count(lru_idx) {
                            checked_lrus_mask |= lru_mask;
                        }
                        self.timeout_idx += 1;
                        continue;
                    }

                    {
                        let registry = self.registry.clone();
                        let flow = self.table.value_mut(id);
                        flow.flags.insert(FlowFlags::TIMED_OUT);
                        for inspector in registry.inspectors() {
                            inspector.on_timeout(flow);
                        }
                    }
                    if self.release(id, PruneReason::IdleProtocolTimeout, true) {
                        retired += 1;
                        if retired >= num_flows {
                            break 'outer;
                        }
                    }
                    self.timeout_idx += 1;
                }

                self.timeout_idx = FIRST_PROTO;
            }
        }

        if PacketTracer::is_active() && retired > 0 {
            PacketTracer::log(format_args!("Flow: Timed out {} flows", retired));
        }

        retired
    }

    fn delete_active_flows(&mut self, mode: u32, mut num_to_delete: u32, deleted: &mut u32) -> u32 {
        let mut checked_lrus_mask = self.empty_lru_mask;
        let mut undeletable: usize = 0;

        while num_to_delete > 0
            && !all_lrus_checked(checked_lrus_mask, MAX_PROTOCOLS)
            && undeletable < self.table.get_num_nodes()
        {
            for lru_idx in FIRST_PROTO..MAX_PROTOCOLS {
                if num_to_delete == 0 {
                    break;
                }

                let lru_mask = get_lru_mask(lru_idx);
                if is_lru_checked(checked_lrus_mask, lru_mask) {
                    continue;
                }

                let Some(id) = self.table.lru_first(lru_idx) else {
                    checked_lrus_mask |= lru_mask;
                    self.empty_lru_mask |= lru_mask;
                    continue;
                };

                let (blocked, suspended) = {
                    let flow = self.table.value(id);
                    (flow.was_blocked(), flow.is_suspended())
                };
                if (mode == ALLOWED_FLOWS_ONLY && (blocked || suspended))
                    || (mode == OFFLOADED_FLOWS_TOO && blocked)
                {
                    undeletable += 1;
                    self.table.lru_touch(lru_idx);
                    continue;
                }

                if (*deleted & WDT_MASK) == 0 {
                    watchdog::kick();
                }

                self.unlink_uni(id);

                if blocked {
                    self.delete_stats.update(FlowDeleteState::Blocked);
                } else if suspended {
                    self.delete_stats.update(FlowDeleteState::Offloaded);
                } else {
                    self.delete_stats.update(FlowDeleteState::Allowed);
                }

                // reset before the node goes away so inspector data is freed
                // while the key is still valid
                self.reset_flow(id, PruneReason::None);
                self.table.remove_by_id(id);
                *deleted += 1;
                num_to_delete -= 1;
            }
        }
        num_to_delete
    }

    /// Reload-driven removal of up to `num_to_delete` flows, least
    /// disruptive first. Unlike `release`, this bypasses `KEEP_FLOW`.
    pub fn delete_flows(&mut self, num_to_delete: u32) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Reload);

        let mut deleted: u32 = 0;
        {
            let _pt_susp = PacketTracerSuspend::new();
            let mut remaining = num_to_delete;
            let mut mode = ALLOWED_FLOWS_ONLY;
            while remaining > 0 && mode <= ALL_FLOWS {
                remaining = self.delete_active_flows(mode, remaining, &mut deleted);
                mode += 1;
            }
        }

        if PacketTracer::is_active() && deleted > 0 {
            PacketTracer::log(format_args!("Flow: Deleted {} flows", deleted));
        }

        deleted
    }

    /// Remove all flows. Shutdown and some reloads.
    pub fn purge(&mut self) -> u32 {
        let _act_susp = ActiveSuspendGuard::new(SuspendReason::Exit);
        self.purging = true;

        let mut retired: u32 = 0;
        for lru_idx in FIRST_PROTO..TOTAL_LRU_COUNT {
            while let Some(id) = self.table.lru_first(lru_idx) {
                self.retire(id);
                retired += 1;
            }
        }
        self.uni_flows = None;
        self.uni_ip_flows = None;

        self.purging = false;
        retired
    }

    pub fn is_allowlist_on_excess(&self) -> bool {
        self.config.load().move_to_allowlist_on_excess
    }

    /// Switch the flow from its protocol queue to the allowlist queue.
    pub fn move_to_allowlist(&mut self, id: u32) -> bool {
        let key = *self.table.key(id);
        if self
            .table
            .switch_lru_cache(&key, key.pkt_type.lru_index(), ALLOWLIST_LRU_INDEX)
        {
            self.table
                .value_mut(id)
                .flags
                .insert(FlowFlags::IN_ALLOWLIST);
            return true;
        }
        false
    }

    /// Excess-pressure migration: stop inspecting, trust the flow, record
    /// the whitelist verdict and move it to the allowlist queue.
    fn allowlist_on_excess(&mut self, id: u32) -> bool {
        if self.is_allowlist_on_excess() {
            {
                let flow = self.table.value_mut(id);
                flow.flush(false);
                flow.free_flow_data();
                flow.trust();
                flow.last_verdict = Verdict::Whitelist;
            }
            if self.move_to_allowlist(id) {
                self.excess_to_allowlist_count += 1;
                self.table
                    .value_mut(id)
                    .flags
                    .insert(FlowFlags::ALLOWED_ON_EXCESS);
                return true;
            }
        }
        false
    }

    // The allowlist pruning policy matrix. `Some(handled)` short-circuits
    // `prune_one`; `None` falls through to an ordinary release.
    fn handle_allowlist_pruning(
        &mut self,
        id: u32,
        reason: PruneReason,
        lru_type: u8,
    ) -> Option<bool> {
        if lru_type == ALLOWLIST_LRU_INDEX {
            return match reason {
                PruneReason::Excess => {
                    if self.is_allowlist_on_excess() {
                        Some(true)
                    } else {
                        None
                    }
                }
                PruneReason::Memcap => None,
                _ => Some(false),
            };
        }

        if reason == PruneReason::Excess {
            if self.allowlist_on_excess(id) {
                return Some(true);
            }
            return None;
        }

        None
    }

    fn log_flow_release(&mut self, id: u32, reason: PruneReason) {
        let _pt_unsusp = PacketTracerUnsuspend::new();

        let descriptor = crate::dump::descriptor::FlowDescriptor::from_flow(
            self.table.key(id),
            self.table.value(id),
            self.instance_number(),
            self.packet_time,
        );
        let mut line = String::new();
        if write!(line, "{}", descriptor).is_err() {
            warn!("failed to format flow for release trace");
            return;
        }
        PacketTracer::log(format_args!(
            "Flow: Releasing flow due to {}: {}",
            reason, line
        ));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::common::enums::FlowState;
    use crate::common::inspector::FlowData;
    use crate::flow_cache::flow_config::{flow_access, FlowCacheConfig, ProtoTimeouts};

    fn config(max_flows: usize, cleanup_flows: u32, pruning_timeout: u64) -> FlowCacheConfig {
        FlowCacheConfig {
            max_flows,
            cleanup_flows,
            prune_flows: 10,
            pruning_timeout: Duration::from_secs(pruning_timeout),
            move_to_allowlist_on_excess: false,
            proto: ProtoTimeouts {
                ip: Duration::from_secs(60),
                icmp: Duration::from_secs(60),
                tcp: Duration::from_secs(60),
                udp: Duration::from_secs(60),
                ..Default::default()
            },
        }
    }

    fn new_cache(config: FlowCacheConfig) -> FlowCache {
        FlowCache::new(
            0,
            flow_access(config),
            Arc::new(InspectorRegistry::new()),
        )
    }

    fn lookup(pkt_type: PktType, sport: u16, ts: i64) -> LookupKey {
        LookupKey {
            timestamp: ts,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            src_port: sport,
            dst_port: 80,
            pkt_type,
            ..Default::default()
        }
    }

    fn admit(cache: &mut FlowCache, lk: &LookupKey) -> u32 {
        let (key, _) = FlowKey::from_lookup(lk);
        if let Some(id) = cache.find(&key, lk.timestamp) {
            return id;
        }
        cache.allocate(lk).unwrap()
    }

    #[test]
    fn capacity_invariant_holds_under_churn() {
        let mut cache = new_cache(config(3, 10, 0));
        for sport in 0..10u16 {
            let lk = lookup(PktType::Tcp, 20000 + sport, 5);
            assert!(cache.allocate(&lk).is_some());
            assert!(cache.get_count() <= 3);
        }
        assert!(cache.get_count() >= 1);
    }

    #[test]
    fn admission_under_saturation_evicts_one_idle_flow() {
        // max_flows=3, cleanup_flows=10, pruning_timeout=0; three idle flows
        // at t=0, a TCP packet at t=10
        let mut cache = new_cache(config(3, 10, 0));
        let f1 = lookup(PktType::Tcp, 1001, 0);
        let f2 = lookup(PktType::Udp, 1002, 0);
        let f3 = lookup(PktType::Icmp, 1003, 0);
        admit(&mut cache, &f1);
        admit(&mut cache, &f2);
        admit(&mut cache, &f3);
        assert_eq!(cache.get_count(), 3);

        let f4 = lookup(PktType::Tcp, 1004, 10);
        assert!(cache.allocate(&f4).is_some());

        // exactly one eviction, by round-robin the ICMP flow goes first
        assert_eq!(cache.get_count(), 3);
        assert_eq!(
            cache.prune_stats().get_reason_total(PruneReason::IdleMaxFlows),
            1
        );
        assert_eq!(
            cache
                .prune_stats()
                .get(PruneReason::IdleMaxFlows, PktType::Icmp.lru_index()),
            1
        );
        let (k3, _) = FlowKey::from_lookup(&f3);
        assert!(cache.find(&k3, 10).is_none());
        let (k1, _) = FlowKey::from_lookup(&f1);
        let (k4, _) = FlowKey::from_lookup(&f4);
        assert!(cache.find(&k1, 10).is_some());
        assert!(cache.find(&k4, 10).is_some());
    }

    #[test]
    fn allowlist_flows_survive_the_timeout_sweep() {
        // max_flows=2, idle timeout 60s, sweep at t=100
        let mut cache = new_cache(config(2, 10, 30));
        let f1 = lookup(PktType::Tcp, 2001, 0);
        let f2 = lookup(PktType::Udp, 2002, 0);
        let id1 = admit(&mut cache, &f1);
        assert!(cache.move_to_allowlist(id1));
        admit(&mut cache, &f2);

        assert_eq!(cache.timeout(10, 100), 1);

        let (k1, _) = FlowKey::from_lookup(&f1);
        let (k2, _) = FlowKey::from_lookup(&f2);
        assert!(cache.find(&k1, 100).is_some());
        assert!(cache.find(&k2, 100).is_none());
        assert_eq!(cache.get_lru_flow_count(ALLOWLIST_LRU_INDEX), 1);
    }

    #[test]
    fn half_open_eviction_trims_only_the_matching_list() {
        // max_flows=4 makes the uni bound 4/4+1 = 2
        let mut cache = new_cache(config(4, 10, 30));
        let ip1 = lookup(PktType::Ip, 0, 0);
        let mut ip2 = lookup(PktType::Ip, 0, 0);
        ip2.src_ip = "10.0.0.3".parse().unwrap();
        let mut ip3 = lookup(PktType::Ip, 0, 0);
        ip3.src_ip = "10.0.0.4".parse().unwrap();
        let tcp = lookup(PktType::Tcp, 3001, 0);
        admit(&mut cache, &ip1);
        admit(&mut cache, &ip2);
        admit(&mut cache, &ip3);
        admit(&mut cache, &tcp);
        assert_eq!(cache.uni_ip_flows_size(), 3);
        assert_eq!(cache.uni_flows_size(), 1);

        let mut ip4 = lookup(PktType::Ip, 0, 0);
        ip4.src_ip = "10.0.0.5".parse().unwrap();
        assert!(cache.allocate(&ip4).is_some());

        // the oldest IP half-open flow went, the non-IP list is untouched
        assert_eq!(cache.prune_stats().get_reason_total(PruneReason::Uni), 1);
        let (k_ip1, _) = FlowKey::from_lookup(&ip1);
        assert!(cache.find(&k_ip1, 0).is_none());
        assert_eq!(cache.uni_ip_flows_size(), 3);
        assert_eq!(cache.uni_flows_size(), 1);
        assert_eq!(cache.get_count(), 4);
    }

    #[test]
    fn find_promotes_to_mru() {
        let mut cache = new_cache(config(8, 10, 30));
        let f1 = lookup(PktType::Tcp, 4001, 0);
        let f2 = lookup(PktType::Tcp, 4002, 0);
        let f3 = lookup(PktType::Tcp, 4003, 0);
        let id1 = admit(&mut cache, &f1);
        admit(&mut cache, &f2);
        admit(&mut cache, &f3);

        let (k1, _) = FlowKey::from_lookup(&f1);
        assert_eq!(cache.find(&k1, 1), Some(id1));
        assert_eq!(cache.walk_first(PktType::Tcp.lru_index()), Some(id1));
    }

    #[test]
    fn find_keeps_last_data_seen_monotonic() {
        let mut cache = new_cache(config(8, 10, 30));
        let f1 = lookup(PktType::Tcp, 4101, 0);
        let id = admit(&mut cache, &f1);
        let (key, _) = FlowKey::from_lookup(&f1);
        cache.find(&key, 50);
        assert_eq!(cache.flow(id).last_data_seen, 50);
        cache.find(&key, 40);
        assert_eq!(cache.flow(id).last_data_seen, 50);
    }

    #[test]
    fn timeout_is_idempotent_without_aged_flows() {
        let mut cache = new_cache(config(8, 10, 30));
        admit(&mut cache, &lookup(PktType::Tcp, 4201, 100));
        admit(&mut cache, &lookup(PktType::Udp, 4202, 100));

        assert_eq!(cache.timeout(0, 100), 0);
        assert_eq!(cache.timeout(10, 100), 0);
        assert_eq!(cache.timeout(10, 100), 0);
        assert_eq!(cache.get_count(), 2);
    }

    #[test]
    fn timeout_honours_hard_expiration() {
        let mut cache = new_cache(config(8, 10, 30));
        let f1 = lookup(PktType::Tcp, 4301, 0);
        let id = admit(&mut cache, &f1);
        cache.flow_mut(id).set_idle_timeout(1);
        cache.flow_mut(id).set_hard_expiration(500);

        // idle-expired but the hard deadline is still ahead
        assert_eq!(cache.timeout(10, 100), 0);
        assert_eq!(cache.get_count(), 1);
        assert_eq!(cache.timeout(10, 501), 1);
        assert_eq!(cache.get_count(), 0);
    }

    #[test]
    fn timeout_skips_suspended_flows_without_spinning() {
        let mut cache = new_cache(config(8, 10, 30));
        let f1 = lookup(PktType::Tcp, 4401, 0);
        let id = admit(&mut cache, &f1);
        cache.flow_mut(id).suspend();

        assert_eq!(cache.timeout(10, 1000), 0);
        assert_eq!(cache.get_count(), 1);
    }

    #[test]
    fn allocate_returns_none_when_nothing_can_be_pruned() {
        let mut cache = new_cache(config(1, 10, 30));
        let f1 = lookup(PktType::Tcp, 4501, 0);
        let id = admit(&mut cache, &f1);
        cache.flow_mut(id).suspend();
        cache.flow_mut(id).add_packet(false, 100);
        cache.unlink_uni(id);

        let f2 = lookup(PktType::Tcp, 4502, 0);
        assert!(cache.allocate(&f2).is_none());
        assert_eq!(cache.get_count(), 1);
    }

    #[test]
    fn keep_flow_survives_one_release() {
        let mut cache = new_cache(config(8, 10, 30));
        let f1 = lookup(PktType::Tcp, 4601, 0);
        let id = admit(&mut cache, &f1);
        cache.flow_mut(id).flags.insert(FlowFlags::KEEP_FLOW);

        assert!(!cache.release(id, PruneReason::User, true));
        assert_eq!(cache.get_count(), 1);
        assert!(!cache.flow(id).flags.contains(FlowFlags::KEEP_FLOW));

        assert!(cache.release(id, PruneReason::User, true));
        assert_eq!(cache.get_count(), 0);
        assert_eq!(cache.prune_stats().get_reason_total(PruneReason::User), 1);
    }

    struct FlushProbe(Arc<AtomicU32>);

    impl FlowData for FlushProbe {
        fn flush(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn release_of_a_blocked_flow_skips_the_flush() {
        let mut cache = new_cache(config(8, 10, 30));
        let flushes = Arc::new(AtomicU32::new(0));

        let f1 = lookup(PktType::Tcp, 4701, 0);
        let id = admit(&mut cache, &f1);
        cache
            .flow_mut(id)
            .set_data(0, Box::new(FlushProbe(flushes.clone())));
        cache.flow_mut(id).block();

        assert!(cache.release(id, PruneReason::User, true));
        assert_eq!(flushes.load(Ordering::Relaxed), 0);
        assert_eq!(cache.get_count(), 0);
    }

    #[test]
    fn excess_migrates_to_allowlist_when_configured() {
        let mut cfg = config(3, 1, 30);
        cfg.move_to_allowlist_on_excess = true;
        let mut cache = new_cache(cfg);
        for sport in 0..3u16 {
            admit(&mut cache, &lookup(PktType::Tcp, 5000 + sport, 0));
        }

        let pruned = cache.prune_excess(None);

        assert_eq!(pruned, 1);
        assert_eq!(cache.get_count(), 3);
        assert_eq!(cache.get_lru_flow_count(ALLOWLIST_LRU_INDEX), 1);
        assert_eq!(cache.excess_to_allowlist_count(), 1);
        let id = cache.walk_first(ALLOWLIST_LRU_INDEX).unwrap();
        let flow = cache.flow(id);
        assert!(flow.flags.contains(FlowFlags::IN_ALLOWLIST));
        assert!(flow.flags.contains(FlowFlags::ALLOWED_ON_EXCESS));
        assert_eq!(flow.last_verdict, Verdict::Whitelist);
        assert_eq!(flow.flow_state, FlowState::Allow);
    }

    #[test]
    fn excess_evicts_when_allowlist_is_off() {
        let mut cache = new_cache(config(3, 1, 30));
        for sport in 0..3u16 {
            admit(&mut cache, &lookup(PktType::Tcp, 5100 + sport, 0));
        }

        let pruned = cache.prune_excess(None);

        assert_eq!(pruned, 1);
        assert_eq!(cache.get_count(), 2);
        assert_eq!(cache.prune_stats().get_reason_total(PruneReason::Excess), 1);
        assert_eq!(cache.get_lru_flow_count(ALLOWLIST_LRU_INDEX), 0);
    }

    #[test]
    fn excess_rotates_blocked_flows_to_the_back() {
        let mut cache = new_cache(config(3, 1, 30));
        let blocked = admit(&mut cache, &lookup(PktType::Tcp, 5200, 0));
        cache.flow_mut(blocked).block();
        let blocked_key = *cache.key(blocked);
        admit(&mut cache, &lookup(PktType::Tcp, 5201, 0));
        admit(&mut cache, &lookup(PktType::Tcp, 5202, 0));

        let pruned = cache.prune_excess(None);

        // the blocked LRU front was skipped, the next-oldest went instead
        assert_eq!(pruned, 1);
        assert!(cache.find(&blocked_key, 0).is_some());
        assert_eq!(cache.get_count(), 2);
    }

    static KICKS: AtomicU32 = AtomicU32::new(0);

    fn count_kick() {
        KICKS.fetch_add(1, Ordering::Relaxed);
    }

    #[test]
    fn delete_flows_walks_the_three_modes() {
        watchdog::set_kicker(count_kick);
        let mut cache = new_cache(config(8, 10, 30));
        let normal = admit(&mut cache, &lookup(PktType::Tcp, 5301, 0));
        let offloaded = admit(&mut cache, &lookup(PktType::Tcp, 5302, 0));
        let blocked = admit(&mut cache, &lookup(PktType::Tcp, 5303, 0));
        cache.flow_mut(offloaded).suspend();
        cache.flow_mut(blocked).block();
        // the sticky bit does not protect against reload deletion
        cache.flow_mut(normal).flags.insert(FlowFlags::KEEP_FLOW);

        assert_eq!(cache.delete_flows(5), 3);
        assert_eq!(cache.get_count(), 0);
        let stats = cache.delete_stats();
        assert_eq!(stats.get(FlowDeleteState::Allowed), 1);
        assert_eq!(stats.get(FlowDeleteState::Offloaded), 1);
        assert_eq!(stats.get(FlowDeleteState::Blocked), 1);
        assert!(KICKS.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn purge_retires_everything_including_the_allowlist() {
        let mut cache = new_cache(config(8, 10, 30));
        let id = admit(&mut cache, &lookup(PktType::Tcp, 5401, 0));
        assert!(cache.move_to_allowlist(id));
        admit(&mut cache, &lookup(PktType::Udp, 5402, 0));
        admit(&mut cache, &lookup(PktType::Icmp, 5403, 0));

        assert_eq!(cache.purge(), 3);
        assert_eq!(cache.get_count(), 0);
        assert_eq!(cache.uni_flows_size(), 0);
        assert_eq!(cache.uni_ip_flows_size(), 0);
        assert_eq!(cache.prune_stats().get_reason_total(PruneReason::None), 3);
    }

    #[test]
    fn prune_idle_spares_the_saved_flow() {
        let mut cache = new_cache(config(8, 10, 0));
        let id = admit(&mut cache, &lookup(PktType::Tcp, 5501, 0));
        assert_eq!(cache.prune_idle(100, Some(id)), 0);
        assert_eq!(cache.get_count(), 1);
    }

    #[test]
    fn count_flows_in_lru_matches_node_count() {
        let mut cache = new_cache(config(8, 10, 30));
        for sport in 0..4u16 {
            admit(&mut cache, &lookup(PktType::Udp, 5600 + sport, 0));
        }
        let tag = PktType::Udp.lru_index();
        assert_eq!(cache.count_flows_in_lru(tag), 4);
        assert_eq!(cache.get_lru_flow_count(tag), 4);
    }
}
