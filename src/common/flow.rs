use bitflags::bitflags;

use super::enums::{FlowState, TcpState, Verdict};
use super::inspector::FlowData;
use super::lookup_key::LookupKey;
use super::INVALID_INDEX;
use crate::utils::net::MappedAddr;

bitflags! {
    pub struct FlowFlags: u32 {
        /// The packet that created the flow came from the client.
        const CLIENT_INITIATED  = 0x0001;
        /// The initiator landed on the key's (ip_h, port_h) side.
        const KEY_IS_REVERSED   = 0x0002;
        const IN_ALLOWLIST      = 0x0004;
        const ALLOWED_ON_EXCESS = 0x0008;
        /// A drop verdict has been committed.
        const BLOCKED           = 0x0010;
        /// Offloaded to hardware; state mutations are deferred.
        const SUSPENDED         = 0x0020;
        const HA_STANDBY        = 0x0040;
        const HARD_EXPIRATION   = 0x0080;
        /// One-shot sticky bit: the flow survives the next release attempt.
        const KEEP_FLOW         = 0x0100;
        const TIMED_OUT         = 0x0200;
        const PRUNED            = 0x0400;
    }
}

impl Default for FlowFlags {
    fn default() -> Self {
        FlowFlags::empty()
    }
}

/// Session counters. Packet and byte counts are monotonic over the flow's
/// lifetime; `start_time` is the creating packet's timestamp.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowStats {
    pub client_pkts: u64,
    pub server_pkts: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    pub start_time: i64,
}

/// TCP stream state pair, present only on TCP flows with a session.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpStatePair {
    pub client: TcpState,
    pub server: TcpState,
}

/// One tracked conversation. The table owns the key; the record carries
/// everything else, including the opaque per-inspector data chain.
#[derive(Default)]
pub struct Flow {
    pub client_ip: MappedAddr,
    pub server_ip: MappedAddr,
    pub stats: FlowStats,

    pub last_data_seen: i64,
    /// Idle timeout in seconds, set from the per-class default at creation.
    pub idle_timeout: i64,
    /// Hard deadline, meaningful only with `HARD_EXPIRATION`.
    pub expire_time: i64,

    pub flags: FlowFlags,
    pub flow_state: FlowState,
    pub last_verdict: Verdict,
    pub tcp_state: Option<TcpStatePair>,

    /// Generation marker so one dump pass visits the flow at most once.
    pub dump_code: u8,

    data: Vec<Option<Box<dyn FlowData>>>,

    // unidirectional list linkage; prev points toward newer entries
    pub(crate) uni_prev: u32,
    pub(crate) uni_next: u32,
    pub(crate) in_uni: bool,
}

impl Flow {
    pub fn new(lookup: &LookupKey, key_is_reversed: bool) -> Self {
        let mut flags = FlowFlags::CLIENT_INITIATED;
        if key_is_reversed {
            flags |= FlowFlags::KEY_IS_REVERSED;
        }
        Flow {
            client_ip: MappedAddr::from_ip(lookup.src_ip),
            server_ip: MappedAddr::from_ip(lookup.dst_ip),
            stats: FlowStats {
                start_time: lookup.timestamp,
                ..Default::default()
            },
            last_data_seen: lookup.timestamp,
            flags,
            uni_prev: INVALID_INDEX,
            uni_next: INVALID_INDEX,
            ..Default::default()
        }
    }

    pub fn was_blocked(&self) -> bool {
        self.flags.contains(FlowFlags::BLOCKED)
    }

    pub fn is_suspended(&self) -> bool {
        self.flags.contains(FlowFlags::SUSPENDED)
    }

    pub fn is_hard_expiration(&self) -> bool {
        self.flags.contains(FlowFlags::HARD_EXPIRATION)
    }

    pub fn block(&mut self) {
        self.flags.insert(FlowFlags::BLOCKED);
        self.flow_state = FlowState::Block;
        self.last_verdict = Verdict::Block;
    }

    pub fn trust(&mut self) {
        self.flow_state = FlowState::Allow;
    }

    pub fn suspend(&mut self) {
        self.flags.insert(FlowFlags::SUSPENDED);
    }

    pub fn set_idle_timeout(&mut self, seconds: i64) {
        self.idle_timeout = seconds;
    }

    pub fn set_hard_expiration(&mut self, expire_time: i64) {
        self.expire_time = expire_time;
        self.flags.insert(FlowFlags::HARD_EXPIRATION);
    }

    /// Account one packet. `from_client` follows the flow's client/server
    /// perspective, not the key's canonical order.
    pub fn add_packet(&mut self, from_client: bool, bytes: u64) {
        if from_client {
            self.stats.client_pkts += 1;
            self.stats.client_bytes += bytes;
        } else {
            self.stats.server_pkts += 1;
            self.stats.server_bytes += bytes;
        }
    }

    pub fn two_way_traffic(&self) -> bool {
        self.stats.client_pkts > 0 && self.stats.server_pkts > 0
    }

    pub fn set_data(&mut self, slot: usize, data: Box<dyn FlowData>) {
        if self.data.len() <= slot {
            self.data.resize_with(slot + 1, || None);
        }
        self.data[slot] = Some(data);
    }

    pub fn data(&self, slot: usize) -> Option<&dyn FlowData> {
        self.data.get(slot)?.as_deref()
    }

    pub fn data_mut(&mut self, slot: usize) -> Option<&mut (dyn FlowData + 'static)> {
        self.data.get_mut(slot)?.as_deref_mut()
    }

    /// Dispatch the cleanup event to every attached inspector state.
    pub fn flush(&mut self, _do_cleanup: bool) {
        for data in self.data.iter_mut().flatten() {
            data.flush();
        }
    }

    /// Drop inspector data in registration order.
    pub fn free_flow_data(&mut self) {
        for slot in self.data.iter_mut() {
            slot.take();
        }
        self.data.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::PktType;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn lookup() -> LookupKey {
        LookupKey {
            timestamp: 1000,
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "8.8.8.8".parse().unwrap(),
            src_port: 49152,
            dst_port: 443,
            pkt_type: PktType::Tcp,
            ..Default::default()
        }
    }

    #[test]
    fn creation_snapshot() {
        let flow = Flow::new(&lookup(), true);
        assert!(flow.flags.contains(FlowFlags::CLIENT_INITIATED));
        assert!(flow.flags.contains(FlowFlags::KEY_IS_REVERSED));
        assert_eq!(flow.stats.start_time, 1000);
        assert_eq!(flow.last_data_seen, 1000);
        assert_eq!(flow.client_ip.to_string(), "10.0.0.1");
        assert_eq!(flow.server_ip.to_string(), "8.8.8.8");
    }

    #[test]
    fn packet_accounting() {
        let mut flow = Flow::new(&lookup(), false);
        flow.add_packet(true, 100);
        flow.add_packet(true, 50);
        assert!(!flow.two_way_traffic());
        flow.add_packet(false, 1400);
        assert!(flow.two_way_traffic());
        assert_eq!(flow.stats.client_pkts, 2);
        assert_eq!(flow.stats.client_bytes, 150);
        assert_eq!(flow.stats.server_bytes, 1400);
    }

    struct CountingData(Arc<AtomicUsize>);

    impl FlowData for CountingData {
        fn flush(&mut self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    impl Drop for CountingData {
        fn drop(&mut self) {
            self.0.fetch_add(100, Ordering::Relaxed);
        }
    }

    #[test]
    fn data_slots_flush_and_free() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut flow = Flow::new(&lookup(), false);
        flow.set_data(0, Box::new(CountingData(count.clone())));
        flow.set_data(2, Box::new(CountingData(count.clone())));
        assert!(flow.data(1).is_none());

        flow.flush(true);
        assert_eq!(count.load(Ordering::Relaxed), 2);

        flow.free_flow_data();
        assert_eq!(count.load(Ordering::Relaxed), 202);
        assert!(flow.data(0).is_none());
    }
}
