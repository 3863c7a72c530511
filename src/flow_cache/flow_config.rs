use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Deserialize;

use crate::common::enums::PktType;

pub const TIMEOUT_IP: Duration = Duration::from_secs(180);
pub const TIMEOUT_ICMP: Duration = Duration::from_secs(30);
pub const TIMEOUT_TCP: Duration = Duration::from_secs(3600);
pub const TIMEOUT_UDP: Duration = Duration::from_secs(180);
pub const TIMEOUT_OTHERS: Duration = Duration::from_secs(180);

/// Nominal idle timeout per protocol class, used by the timer sweep.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ProtoTimeouts {
    #[serde(with = "humantime_serde")]
    pub ip: Duration,
    #[serde(with = "humantime_serde")]
    pub icmp: Duration,
    #[serde(with = "humantime_serde")]
    pub tcp: Duration,
    #[serde(with = "humantime_serde")]
    pub udp: Duration,
    #[serde(with = "humantime_serde")]
    pub pdu: Duration,
    #[serde(with = "humantime_serde")]
    pub file: Duration,
    #[serde(with = "humantime_serde")]
    pub user: Duration,
}

impl Default for ProtoTimeouts {
    fn default() -> Self {
        ProtoTimeouts {
            ip: TIMEOUT_IP,
            icmp: TIMEOUT_ICMP,
            tcp: TIMEOUT_TCP,
            udp: TIMEOUT_UDP,
            pdu: TIMEOUT_OTHERS,
            file: TIMEOUT_OTHERS,
            user: TIMEOUT_OTHERS,
        }
    }
}

impl ProtoTimeouts {
    pub fn nominal(&self, pkt_type: PktType) -> Duration {
        match pkt_type {
            PktType::Ip => self.ip,
            PktType::Icmp => self.icmp,
            PktType::Tcp => self.tcp,
            PktType::Udp => self.udp,
            PktType::Pdu => self.pdu,
            PktType::File => self.file,
            PktType::User => self.user,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowCacheConfig {
    pub max_flows: usize,
    /// Minimum idle seconds before a flow is eligible for capacity-driven
    /// idle pruning. Distinct from the per-class nominal timeouts.
    #[serde(with = "humantime_serde")]
    pub pruning_timeout: Duration,
    /// Batch size for the idle-prune sweep.
    pub cleanup_flows: u32,
    /// Batch size for memcap-driven pruning.
    pub prune_flows: u32,
    pub move_to_allowlist_on_excess: bool,
    pub proto: ProtoTimeouts,
}

impl Default for FlowCacheConfig {
    fn default() -> Self {
        FlowCacheConfig {
            max_flows: 476288,
            pruning_timeout: Duration::from_secs(30),
            cleanup_flows: 10,
            prune_flows: 10,
            move_to_allowlist_on_excess: false,
            proto: ProtoTimeouts::default(),
        }
    }
}

impl FlowCacheConfig {
    pub fn pruning_timeout_secs(&self) -> i64 {
        self.pruning_timeout.as_secs() as i64
    }

    pub fn nominal_timeout_secs(&self, pkt_type: PktType) -> i64 {
        self.proto.nominal(pkt_type).as_secs() as i64
    }
}

/// Shared handle to the flow-cache configuration; a reload swaps the inner
/// arc without locking the packet path.
pub type FlowAccess = Arc<ArcSwap<FlowCacheConfig>>;

pub fn flow_access(config: FlowCacheConfig) -> FlowAccess {
    Arc::new(ArcSwap::from_pointee(config))
}
