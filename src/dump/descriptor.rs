//! Fixed-size flow descriptor shared by the binary dump writer, the
//! in-worker text dump and the offline rendering tool.
//!
//! The on-disk record is the field sequence below, packed, in host byte
//! order; the consuming tool runs on the same architecture.

use std::fmt;
use std::io;

use crate::common::enums::{tcp_state_to_str, PktType, TCP_MAX_STATES};
use crate::common::flow::{Flow, FlowFlags};
use crate::common::flow_key::FlowKey;
use crate::utils::net::MappedAddr;

use super::TextSink;

pub const DESCRIPTOR_BYTES: usize = 109;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct FlowDescriptor {
    pub src_ip: MappedAddr,
    pub dst_ip: MappedAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub pkt_type: u8,
    pub address_space_id: u32,
    /// 1-based worker index.
    pub instance_number: u32,
    pub tcp_client_state: u8,
    pub tcp_server_state: u8,
    pub client_pkts: u64,
    pub server_pkts: u64,
    pub client_bytes: u64,
    pub server_bytes: u64,
    /// Seconds to the hard expiry, or the absolute idle remainder.
    pub expiration_time: u64,
    pub idle_time: i64,
    pub up_time: i64,
    /// Negative once the flow has already timed out.
    pub remaining_time: i32,
    pub allowed_on_excess: bool,
    pub in_allowlist: bool,
}

impl FlowDescriptor {
    pub fn from_flow(key: &FlowKey, flow: &Flow, instance_number: u32, now: i64) -> Self {
        let (src_ip, dst_ip, src_port, dst_port) =
            if flow.flags.contains(FlowFlags::KEY_IS_REVERSED) {
                (key.ip_h, key.ip_l, key.port_h, key.port_l)
            } else {
                (key.ip_l, key.ip_h, key.port_l, key.port_h)
            };

        let (tcp_client_state, tcp_server_state) = match (key.pkt_type, flow.tcp_state) {
            (PktType::Tcp, Some(pair)) => (pair.client as u8, pair.server as u8),
            _ => (TCP_MAX_STATES, TCP_MAX_STATES),
        };

        let remaining_time = (flow.last_data_seen + flow.idle_timeout - now) as i32;
        let expiration_time = if flow.is_hard_expiration() {
            (flow.expire_time - now).unsigned_abs()
        } else {
            remaining_time.unsigned_abs() as u64
        };

        FlowDescriptor {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            pkt_type: key.pkt_type as u8,
            address_space_id: key.address_space_id,
            instance_number,
            tcp_client_state,
            tcp_server_state,
            client_pkts: flow.stats.client_pkts,
            server_pkts: flow.stats.server_pkts,
            client_bytes: flow.stats.client_bytes,
            server_bytes: flow.stats.server_bytes,
            expiration_time,
            idle_time: now - flow.last_data_seen,
            up_time: now - flow.stats.start_time,
            remaining_time,
            allowed_on_excess: flow.flags.contains(FlowFlags::ALLOWED_ON_EXCESS),
            in_allowlist: flow.flags.contains(FlowFlags::IN_ALLOWLIST),
        }
    }

    pub fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.src_ip.0);
        buf.extend_from_slice(&self.dst_ip.0);
        buf.extend_from_slice(&self.src_port.to_ne_bytes());
        buf.extend_from_slice(&self.dst_port.to_ne_bytes());
        buf.push(self.pkt_type);
        buf.extend_from_slice(&self.address_space_id.to_ne_bytes());
        buf.extend_from_slice(&self.instance_number.to_ne_bytes());
        buf.push(self.tcp_client_state);
        buf.push(self.tcp_server_state);
        buf.extend_from_slice(&self.client_pkts.to_ne_bytes());
        buf.extend_from_slice(&self.server_pkts.to_ne_bytes());
        buf.extend_from_slice(&self.client_bytes.to_ne_bytes());
        buf.extend_from_slice(&self.server_bytes.to_ne_bytes());
        buf.extend_from_slice(&self.expiration_time.to_ne_bytes());
        buf.extend_from_slice(&self.idle_time.to_ne_bytes());
        buf.extend_from_slice(&self.up_time.to_ne_bytes());
        buf.extend_from_slice(&self.remaining_time.to_ne_bytes());
        buf.push(self.allowed_on_excess as u8);
        buf.push(self.in_allowlist as u8);
    }

    pub fn decode(rec: &[u8]) -> Option<Self> {
        if rec.len() < DESCRIPTOR_BYTES {
            return None;
        }
        let mut at = 0usize;
        let mut bytes = |n: usize| {
            let slice = &rec[at..at + n];
            at += n;
            slice
        };
        Some(FlowDescriptor {
            src_ip: MappedAddr(bytes(16).try_into().unwrap()),
            dst_ip: MappedAddr(bytes(16).try_into().unwrap()),
            src_port: u16::from_ne_bytes(bytes(2).try_into().unwrap()),
            dst_port: u16::from_ne_bytes(bytes(2).try_into().unwrap()),
            pkt_type: bytes(1)[0],
            address_space_id: u32::from_ne_bytes(bytes(4).try_into().unwrap()),
            instance_number: u32::from_ne_bytes(bytes(4).try_into().unwrap()),
            tcp_client_state: bytes(1)[0],
            tcp_server_state: bytes(1)[0],
            client_pkts: u64::from_ne_bytes(bytes(8).try_into().unwrap()),
            server_pkts: u64::from_ne_bytes(bytes(8).try_into().unwrap()),
            client_bytes: u64::from_ne_bytes(bytes(8).try_into().unwrap()),
            server_bytes: u64::from_ne_bytes(bytes(8).try_into().unwrap()),
            expiration_time: u64::from_ne_bytes(bytes(8).try_into().unwrap()),
            idle_time: i64::from_ne_bytes(bytes(8).try_into().unwrap()),
            up_time: i64::from_ne_bytes(bytes(8).try_into().unwrap()),
            remaining_time: i32::from_ne_bytes(bytes(4).try_into().unwrap()),
            allowed_on_excess: bytes(1)[0] != 0,
            in_allowlist: bytes(1)[0] != 0,
        })
    }

    /// Write the textual record, newline terminated.
    pub fn print<W: TextSink>(&self, out: &mut W) -> io::Result<()> {
        out.write_str(&format!("{}\n", self))
    }
}

impl fmt::Display for FlowDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut proto = String::new();
        match PktType::try_from(self.pkt_type) {
            Ok(PktType::Ip) => write!(
                f,
                "Instance-ID: {} IP {}: {} {}",
                self.instance_number, self.address_space_id, self.src_ip, self.dst_ip
            )?,
            Ok(PktType::Icmp) => write!(
                f,
                "Instance-ID: {} ICMP {}: {} type {} {}",
                self.instance_number,
                self.address_space_id,
                self.src_ip,
                self.src_port,
                self.dst_ip
            )?,
            Ok(PktType::Tcp) => {
                write!(
                    f,
                    "Instance-ID: {} TCP {}: {}/{} {}/{}",
                    self.instance_number,
                    self.address_space_id,
                    self.src_ip,
                    self.src_port,
                    self.dst_ip,
                    self.dst_port
                )?;
                proto = format!(
                    " state client {} server {}",
                    tcp_state_to_str(self.tcp_client_state),
                    tcp_state_to_str(self.tcp_server_state)
                );
            }
            Ok(pkt_type) => write!(
                f,
                "Instance-ID: {} {} {}: {}/{} {}/{}",
                self.instance_number,
                pkt_type,
                self.address_space_id,
                self.src_ip,
                self.src_port,
                self.dst_ip,
                self.dst_port
            )?,
            Err(_) => {
                debug_assert!(false, "descriptor with unknown pkt_type {}", self.pkt_type);
                write!(
                    f,
                    "Instance-ID: {} UNKNOWN {}: {} {}",
                    self.instance_number, self.address_space_id, self.src_ip, self.dst_ip
                )?;
            }
        }

        let display_str = if self.remaining_time < 0 {
            "s, timed out for "
        } else {
            "s, timeout in "
        };
        write!(
            f,
            " pkts/bytes client {}/{} server {}/{} idle {}s, uptime {}{}{}",
            self.client_pkts,
            self.client_bytes,
            self.server_pkts,
            self.server_bytes,
            self.idle_time,
            self.up_time,
            display_str,
            timeout_to_str(self.expiration_time as i64)
        )?;

        write!(f, "{}", proto)?;
        if self.allowed_on_excess {
            write!(f, " (allowlist on excess)")?;
        } else if self.in_allowlist {
            write!(f, " (allowlist)")?;
        }
        Ok(())
    }
}

/// Renders a duration as `<H>h<M>m<S>s`: hours and minutes are omitted when
/// both are zero, each non-zero component keeps its unit suffix, and a zero
/// total renders as `0s`.
pub fn timeout_to_str(mut t: i64) -> String {
    let mut out = String::new();

    let hours = t / (60 * 60);
    if hours != 0 {
        out.push_str(&format!("{}h", hours));
        t -= hours * 60 * 60;
    }

    let minutes = t / 60;
    if minutes != 0 || hours != 0 {
        out.push_str(&format!("{}m", minutes));
        t -= minutes * 60;
    }

    if t != 0 || hours == 0 {
        out.push_str(&format!("{}s", t));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::enums::TcpState;
    use crate::common::flow::TcpStatePair;
    use crate::common::lookup_key::LookupKey;

    #[test]
    fn duration_formatting() {
        assert_eq!(timeout_to_str(0), "0s");
        assert_eq!(timeout_to_str(59), "59s");
        assert_eq!(timeout_to_str(60), "1m0s");
        assert_eq!(timeout_to_str(61), "1m1s");
        assert_eq!(timeout_to_str(3600), "1h0m");
        assert_eq!(timeout_to_str(3661), "1h1m1s");
        assert_eq!(timeout_to_str(7322), "2h2m2s");
    }

    fn tcp_flow(now: i64) -> (FlowKey, Flow) {
        let lookup = LookupKey {
            timestamp: now - 20,
            src_ip: "10.1.2.3".parse().unwrap(),
            src_port: 49152,
            dst_ip: "8.8.8.8".parse().unwrap(),
            dst_port: 443,
            pkt_type: PktType::Tcp,
            address_space_id: 3,
            ..Default::default()
        };
        let (key, reversed) = FlowKey::from_lookup(&lookup);
        let mut flow = Flow::new(&lookup, reversed);
        flow.set_idle_timeout(60);
        flow.add_packet(true, 500);
        flow.add_packet(true, 500);
        flow.add_packet(false, 4000);
        flow.tcp_state = Some(TcpStatePair {
            client: TcpState::Established,
            server: TcpState::Established,
        });
        (key, flow)
    }

    #[test]
    fn descriptor_preserves_initiator_perspective() {
        let (key, flow) = tcp_flow(1000);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        assert_eq!(descriptor.src_ip.to_string(), "10.1.2.3");
        assert_eq!(descriptor.src_port, 49152);
        assert_eq!(descriptor.dst_ip.to_string(), "8.8.8.8");
        assert_eq!(descriptor.dst_port, 443);
        assert_eq!(descriptor.idle_time, 20);
        assert_eq!(descriptor.up_time, 20);
        assert_eq!(descriptor.remaining_time, 40);
        assert_eq!(descriptor.expiration_time, 40);
    }

    #[test]
    fn tcp_text_format() {
        let (key, flow) = tcp_flow(1000);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        assert_eq!(
            descriptor.to_string(),
            "Instance-ID: 1 TCP 3: 10.1.2.3/49152 8.8.8.8/443 pkts/bytes client 2/1000 \
             server 1/4000 idle 20s, uptime 20s, timeout in 40s state client EST server EST"
        );
    }

    #[test]
    fn timed_out_flow_renders_negative_remainder() {
        let (key, mut flow) = tcp_flow(1000);
        flow.set_idle_timeout(5);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 2, 1000);
        assert_eq!(descriptor.remaining_time, -15);
        assert!(descriptor.to_string().contains("s, timed out for 15s"));
    }

    #[test]
    fn icmp_text_format() {
        let lookup = LookupKey {
            timestamp: 100,
            src_ip: "192.168.1.10".parse().unwrap(),
            src_port: 8, // echo request
            dst_ip: "192.168.1.1".parse().unwrap(),
            dst_port: 0,
            pkt_type: PktType::Icmp,
            ..Default::default()
        };
        let (key, reversed) = FlowKey::from_lookup(&lookup);
        let mut flow = Flow::new(&lookup, reversed);
        flow.set_idle_timeout(30);
        flow.add_packet(true, 64);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 100);
        assert_eq!(
            descriptor.to_string(),
            "Instance-ID: 1 ICMP 0: 192.168.1.10 type 8 192.168.1.1 pkts/bytes client 1/64 \
             server 0/0 idle 0s, uptime 0s, timeout in 30s"
        );
    }

    #[test]
    fn allowlist_suffixes() {
        let (key, mut flow) = tcp_flow(1000);
        flow.flags.insert(FlowFlags::IN_ALLOWLIST);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        assert!(descriptor.to_string().ends_with(" (allowlist)"));

        flow.flags.insert(FlowFlags::ALLOWED_ON_EXCESS);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        assert!(descriptor.to_string().ends_with(" (allowlist on excess)"));
    }

    #[test]
    fn binary_record_is_packed() {
        let (key, flow) = tcp_flow(1000);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        let mut buf = Vec::new();
        descriptor.encode(&mut buf);
        assert_eq!(buf.len(), DESCRIPTOR_BYTES);
    }

    #[test]
    fn binary_to_text_is_identity() {
        let (key, flow) = tcp_flow(1000);
        let descriptor = FlowDescriptor::from_flow(&key, &flow, 1, 1000);
        let mut buf = Vec::new();
        descriptor.encode(&mut buf);
        let decoded = FlowDescriptor::decode(&buf).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(decoded.to_string(), descriptor.to_string());
    }

    #[test]
    fn short_record_rejected() {
        assert!(FlowDescriptor::decode(&[0u8; DESCRIPTOR_BYTES - 1]).is_none());
    }
}
