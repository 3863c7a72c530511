//! Packet tracer and cooperative-suspend scopes.
//!
//! The tracer is per-worker (thread-local): it is enabled by the operator for
//! one packet's walk through the engine, and multi-flow maintenance loops
//! suspend it so tracer output stays attributed to the traced packet.

use std::cell::Cell;
use std::fmt;

use log::debug;

thread_local! {
    static TRACER_ACTIVE: Cell<bool> = Cell::new(false);
    static TRACER_SUSPENDED: Cell<u32> = Cell::new(0);
    static ACTIVE_SUSPEND: Cell<Option<SuspendReason>> = Cell::new(None);
}

/// Why packet processing is currently suspended. Inspectors consult this to
/// avoid issuing new verdicts while the cache is mid-sweep; cancellation is
/// cooperative and always completes the current record.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum SuspendReason {
    Prune,
    Timeout,
    Reload,
    Exit,
}

pub fn active_suspend() -> Option<SuspendReason> {
    ACTIVE_SUSPEND.with(|r| r.get())
}

pub struct ActiveSuspendGuard {
    prev: Option<SuspendReason>,
}

impl ActiveSuspendGuard {
    pub fn new(reason: SuspendReason) -> Self {
        let prev = ACTIVE_SUSPEND.with(|r| r.replace(Some(reason)));
        ActiveSuspendGuard { prev }
    }
}

impl Drop for ActiveSuspendGuard {
    fn drop(&mut self) {
        ACTIVE_SUSPEND.with(|r| r.set(self.prev));
    }
}

pub struct PacketTracer;

impl PacketTracer {
    pub fn set_active(on: bool) {
        TRACER_ACTIVE.with(|a| a.set(on));
    }

    pub fn is_active() -> bool {
        TRACER_ACTIVE.with(|a| a.get()) && TRACER_SUSPENDED.with(|s| s.get()) == 0
    }

    pub fn log(args: fmt::Arguments) {
        debug!(target: "packet_tracer", "{}", args);
    }
}

/// Suspends tracer output for the enclosing scope.
pub struct PacketTracerSuspend;

impl PacketTracerSuspend {
    pub fn new() -> Self {
        TRACER_SUSPENDED.with(|s| s.set(s.get() + 1));
        PacketTracerSuspend
    }
}

impl Drop for PacketTracerSuspend {
    fn drop(&mut self) {
        TRACER_SUSPENDED.with(|s| s.set(s.get().saturating_sub(1)));
    }
}

/// Re-enables tracer output inside a suspended scope, e.g. for the one line
/// logged when a traced flow is released mid-sweep.
pub struct PacketTracerUnsuspend;

impl PacketTracerUnsuspend {
    pub fn new() -> Self {
        TRACER_SUSPENDED.with(|s| s.set(s.get().saturating_sub(1)));
        PacketTracerUnsuspend
    }
}

impl Drop for PacketTracerUnsuspend {
    fn drop(&mut self) {
        TRACER_SUSPENDED.with(|s| s.set(s.get() + 1));
    }
}
