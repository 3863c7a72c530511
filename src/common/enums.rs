use std::fmt;
use std::str::FromStr;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Protocol class of a flow. The numbering is the on-disk numbering of the
/// flow-dump descriptor and doubles as the recency-queue index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PktType {
    Ip = 0,
    Icmp = 1,
    Tcp = 2,
    Udp = 3,
    Pdu = 4,
    File = 5,
    User = 6,
}

pub const PKT_TYPE_MAX: usize = 7;

impl Default for PktType {
    fn default() -> Self {
        PktType::Ip
    }
}

impl PktType {
    pub fn lru_index(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for PktType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PktType::Ip => write!(f, "IP"),
            PktType::Icmp => write!(f, "ICMP"),
            PktType::Tcp => write!(f, "TCP"),
            PktType::Udp => write!(f, "UDP"),
            PktType::Pdu => write!(f, "PDU"),
            PktType::File => write!(f, "FILE"),
            PktType::User => write!(f, "USER"),
        }
    }
}

impl FromStr for PktType {
    type Err = ();

    // only the dumpable transport classes have a spelled form
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IP" => Ok(PktType::Ip),
            "ICMP" => Ok(PktType::Icmp),
            "TCP" => Ok(PktType::Tcp),
            "UDP" => Ok(PktType::Udp),
            _ => Err(()),
        }
    }
}

/// TCP stream tracker state, one per direction on a TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum TcpState {
    Listen = 0,
    SynSent = 1,
    SynRecv = 2,
    Established = 3,
    MidStreamSent = 4,
    MidStreamRecv = 5,
    FinWait1 = 6,
    FinWait2 = 7,
    CloseWait = 8,
    Closing = 9,
    LastAck = 10,
    TimeWait = 11,
    Closed = 12,
    None = 13,
}

/// Serialized marker for "flow has no TCP session".
pub const TCP_MAX_STATES: u8 = 14;

impl Default for TcpState {
    fn default() -> Self {
        TcpState::None
    }
}

const TCP_STATE_NAMES: [&str; 14] = [
    "LST", "SYS", "SYR", "EST", "MDS", "MDR", "FW1", "FW2", "CLW", "CLG", "LAK", "TWT", "CLD",
    "NON",
];

pub fn tcp_state_to_str(tcp_state: u8) -> &'static str {
    if tcp_state as usize >= TCP_STATE_NAMES.len() {
        return "NON";
    }
    TCP_STATE_NAMES[tcp_state as usize]
}

/// Forwarding disposition of a flow, as summarized by the dump facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FlowState {
    Setup = 0,
    Inspect = 1,
    Block = 2,
    Reset = 3,
    Allow = 4,
}

pub const FLOW_STATE_MAX: usize = FlowState::Allow as usize + 1;

impl Default for FlowState {
    fn default() -> Self {
        FlowState::Setup
    }
}

/// Why a flow left the cache. Kept separate from error kinds; each release
/// pegs one of these against the flow's class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum PruneReason {
    IdleMaxFlows = 0,
    IdleProtocolTimeout = 1,
    Excess = 2,
    Uni = 3,
    Memcap = 4,
    User = 5,
    Ha = 6,
    None = 7,
}

pub const PRUNE_REASON_MAX: usize = 8;

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PruneReason::IdleMaxFlows => "idle max flows",
            PruneReason::IdleProtocolTimeout => "idle protocol timeout",
            PruneReason::Excess => "excess",
            PruneReason::Uni => "uni",
            PruneReason::Memcap => "memcap",
            PruneReason::User => "user",
            PruneReason::Ha => "ha",
            PruneReason::None => "none",
        };
        write!(f, "{}", s)
    }
}

/// Category accounting for the reload-driven delete sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive)]
#[repr(u8)]
pub enum FlowDeleteState {
    Allowed = 0,
    Offloaded = 1,
    Blocked = 2,
}

pub const FLOW_DELETE_STATE_MAX: usize = 3;

/// Last verdict committed on a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Pass,
    Block,
    Replace,
    Whitelist,
    Blacklist,
    Ignore,
}

impl Default for Verdict {
    fn default() -> Self {
        Verdict::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkt_type_round_trip() {
        assert_eq!(PktType::try_from(3u8), Ok(PktType::Udp));
        assert_eq!(u8::from(PktType::Pdu), 4);
        assert!(PktType::try_from(7u8).is_err());
    }

    #[test]
    fn pkt_type_parse() {
        assert_eq!("TCP".parse::<PktType>(), Ok(PktType::Tcp));
        assert!("GRE".parse::<PktType>().is_err());
        // only upper case is the spelled form
        assert!("tcp".parse::<PktType>().is_err());
    }

    #[test]
    fn tcp_state_names() {
        assert_eq!(tcp_state_to_str(TcpState::Established as u8), "EST");
        assert_eq!(tcp_state_to_str(TcpState::None as u8), "NON");
        assert_eq!(tcp_state_to_str(TCP_MAX_STATES), "NON");
        assert_eq!(tcp_state_to_str(200), "NON");
    }
}
