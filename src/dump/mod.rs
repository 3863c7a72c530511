pub mod descriptor;
pub mod dump_flows;
pub mod filter;

pub use descriptor::{FlowDescriptor, DESCRIPTOR_BYTES};
pub use dump_flows::{DumpFlows, DumpFlowsSummary, FlowsSummary};
pub use filter::{DumpFilter, FilterError, FilterSpec};

use std::io;
use std::sync::atomic::AtomicU8;

/// Process-wide dump generation counter, bumped when a dump command is
/// created. Every flow remembers the last generation that visited it, so one
/// pass sees each flow at most once even across suspensions. The counter
/// wraps: two dump commands within the lifetime of a single flow can share a
/// code only if 256 other dumps ran in between, which costs at worst one
/// stale skip.
pub static DUMP_CODE: AtomicU8 = AtomicU8::new(0);

/// The one capability the dump engine needs from a text output.
pub trait TextSink {
    fn write_str(&mut self, s: &str) -> io::Result<()>;
}

impl<W: io::Write> TextSink for W {
    fn write_str(&mut self, s: &str) -> io::Result<()> {
        self.write_all(s.as_bytes())
    }
}
