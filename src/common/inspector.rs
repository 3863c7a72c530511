//! Inspector attachment points.
//!
//! Inspectors register a data slot index once at startup and park their
//! per-flow state in that slot, surrendering ownership to the flow. The flow
//! destroys slots in registration order.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::enums::PruneReason;
use super::flow::Flow;

/// Per-inspector state attached to one flow.
pub trait FlowData: Send {
    /// Flush any buffered work before the flow goes away. Called on release
    /// of unblocked flows, before the keep-flow check.
    fn flush(&mut self) {}
}

/// Lifetime hooks the cache drives for every registered inspector.
pub trait Inspector: Send + Sync {
    fn on_flow_create(&self, flow: &mut Flow);
    fn on_flow_release(&self, flow: &mut Flow, reason: PruneReason);
    /// Honoured only when the flow is not suspended.
    fn on_timeout(&self, _flow: &mut Flow) {}
}

#[derive(Default)]
pub struct InspectorRegistry {
    inspectors: Vec<Arc<dyn Inspector>>,
    next_slot: AtomicUsize,
}

impl InspectorRegistry {
    pub fn new() -> Self {
        Default::default()
    }

    /// Hands out the next per-flow data slot index.
    pub fn allocate_slot(&self) -> usize {
        self.next_slot.fetch_add(1, Ordering::Relaxed)
    }

    pub fn register(&mut self, inspector: Arc<dyn Inspector>) {
        self.inspectors.push(inspector);
    }

    pub fn inspectors(&self) -> &[Arc<dyn Inspector>] {
        &self.inspectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slots_are_unique_and_ordered() {
        let registry = InspectorRegistry::new();
        assert_eq!(registry.allocate_slot(), 0);
        assert_eq!(registry.allocate_slot(), 1);
        assert_eq!(registry.allocate_slot(), 2);
    }
}
