pub mod cache;
pub mod flow_config;
pub mod indexed_lru;
pub mod uni_list;

pub use cache::{FlowCache, FlowDeleteStats, PruneStats};
pub use flow_config::{flow_access, FlowAccess, FlowCacheConfig, ProtoTimeouts};
pub use indexed_lru::IndexedLruTable;
pub use uni_list::{FlowTable, FlowUniList};

/// Queue indices. One recency queue per protocol class plus the allowlist;
/// the class numbering doubles as the queue index.
pub const FIRST_PROTO: u8 = 0;
pub const MAX_PROTOCOLS: u8 = 7;
pub const ALLOWLIST_LRU_INDEX: u8 = 7;
pub const TOTAL_LRU_COUNT: u8 = 8;
