use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use super::enums::PktType;

/// Per-packet view used to find or create a flow. The dissector fills this in
/// from the wire; for ICMP the type/code pair rides in the port fields.
#[derive(Debug, Clone)]
pub struct LookupKey {
    pub timestamp: i64, // seconds since epoch
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_type: PktType,
    pub address_space_id: u32,
    pub vlan_tag: u32,
    pub mpls_label: u32,
}

impl Default for LookupKey {
    fn default() -> Self {
        LookupKey {
            timestamp: 0,
            src_ip: Ipv4Addr::UNSPECIFIED.into(),
            dst_ip: Ipv4Addr::UNSPECIFIED.into(),
            src_port: 0,
            dst_port: 0,
            pkt_type: PktType::default(),
            address_space_id: 0,
            vlan_tag: 0,
            mpls_label: 0,
        }
    }
}

impl fmt::Display for LookupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}:{} > {}:{}, asid: {}, vlan: {}, mpls: {}",
            self.timestamp,
            self.pkt_type,
            self.src_ip,
            self.src_port,
            self.dst_ip,
            self.dst_port,
            self.address_space_id,
            self.vlan_tag,
            self.mpls_label,
        )
    }
}
