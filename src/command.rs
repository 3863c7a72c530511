//! Control-plane commands executed on the packet workers.
//!
//! A command object is created once per operator request and then driven by
//! every worker against its own cache, at packet-processing boundaries. A
//! false return from `execute` means "re-enter me later": long tasks yield
//! cooperatively instead of starving the packet path.

use crate::flow_cache::FlowCache;

pub trait WorkerCommand {
    /// Run one slice of the command on this worker. Returns true when the
    /// command is finished for this worker.
    fn execute(&mut self, cache: &mut FlowCache, instance_id: usize, now: i64) -> bool;

    fn stringify(&self) -> &'static str;
}

/// `delete-flows N`: force-delete up to `n` flows, least disruptive first.
pub struct DeleteFlows {
    num_to_delete: u32,
    pub deleted: u32,
}

impl DeleteFlows {
    pub fn new(num_to_delete: u32) -> Self {
        DeleteFlows {
            num_to_delete,
            deleted: 0,
        }
    }
}

impl WorkerCommand for DeleteFlows {
    fn execute(&mut self, cache: &mut FlowCache, _instance_id: usize, _now: i64) -> bool {
        self.deleted += cache.delete_flows(self.num_to_delete);
        true
    }

    fn stringify(&self) -> &'static str {
        "DeleteFlows"
    }
}
