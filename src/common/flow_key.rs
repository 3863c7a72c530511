use super::enums::PktType;
use super::lookup_key::LookupKey;
use crate::utils::net::MappedAddr;

/// Canonical identity of a conversation. Endpoints are stored in
/// `(low, high)` order by the total order on (address bytes, port), so both
/// directions of a conversation hash to the same key. Whether the packet
/// that created the flow had its source on the high side is returned to the
/// caller and remembered on the record (`KEY_IS_REVERSED`), never on the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FlowKey {
    pub address_space_id: u32,
    pub ip_l: MappedAddr,
    pub ip_h: MappedAddr,
    pub port_l: u16,
    pub port_h: u16,
    pub vlan_tag: u32,
    pub mpls_label: u32,
    pub pkt_type: PktType,
}

impl FlowKey {
    /// Builds the canonical key. The bool is true when the packet's source
    /// ended up on the `(ip_h, port_h)` side.
    pub fn from_lookup(lookup: &LookupKey) -> (Self, bool) {
        let src = MappedAddr::from_ip(lookup.src_ip);
        let dst = MappedAddr::from_ip(lookup.dst_ip);
        let reversed = (src, lookup.src_port) > (dst, lookup.dst_port);

        let (ip_l, port_l, ip_h, port_h) = if reversed {
            (dst, lookup.dst_port, src, lookup.src_port)
        } else {
            (src, lookup.src_port, dst, lookup.dst_port)
        };

        (
            FlowKey {
                address_space_id: lookup.address_space_id,
                ip_l,
                ip_h,
                port_l,
                port_h,
                vlan_tag: lookup.vlan_tag,
                mpls_label: lookup.mpls_label,
                pkt_type: lookup.pkt_type,
            },
            reversed,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::utils::hasher::Jenkins64Hasher;

    fn lookup(src: &str, sport: u16, dst: &str, dport: u16) -> LookupKey {
        LookupKey {
            src_ip: src.parse().unwrap(),
            src_port: sport,
            dst_ip: dst.parse().unwrap(),
            dst_port: dport,
            pkt_type: PktType::Tcp,
            address_space_id: 1,
            ..Default::default()
        }
    }

    #[test]
    fn both_directions_share_a_key() {
        let (forward, fwd_reversed) = FlowKey::from_lookup(&lookup("10.0.0.1", 49152, "8.8.8.8", 443));
        let (backward, bwd_reversed) = FlowKey::from_lookup(&lookup("8.8.8.8", 443, "10.0.0.1", 49152));
        assert_eq!(forward, backward);
        assert_ne!(fwd_reversed, bwd_reversed);
    }

    #[test]
    fn low_high_ordering() {
        let (key, reversed) = FlowKey::from_lookup(&lookup("10.0.0.1", 49152, "8.8.8.8", 443));
        // 8.8.8.8 < 10.0.0.1 byte-wise, so the initiator landed on the high side
        assert!(reversed);
        assert_eq!(key.ip_l, MappedAddr::from_ip("8.8.8.8".parse().unwrap()));
        assert_eq!(key.port_l, 443);
        assert_eq!(key.port_h, 49152);
    }

    #[test]
    fn same_address_orders_by_port() {
        let (key, reversed) = FlowKey::from_lookup(&lookup("10.0.0.1", 80, "10.0.0.1", 9000));
        assert!(!reversed);
        assert_eq!(key.port_l, 80);
        assert_eq!(key.port_h, 9000);
    }

    #[test]
    fn key_hashes_into_set() {
        let hasher = Jenkins64Hasher::default();
        let mut set = HashSet::with_hasher(hasher);
        let (a, _) = FlowKey::from_lookup(&lookup("10.0.0.1", 49152, "8.8.8.8", 443));
        let (b, _) = FlowKey::from_lookup(&lookup("8.8.8.8", 443, "10.0.0.1", 49152));
        assert!(set.insert(a));
        assert!(!set.insert(b));
    }
}
