use std::sync::OnceLock;

static KICKER: OnceLock<fn()> = OnceLock::new();

/// Install the preemptive-kick hook. Only the first registration wins.
pub fn set_kicker(f: fn()) -> bool {
    KICKER.set(f).is_ok()
}

/// Kick the watchdog if a hook was installed. Long sweeps call this
/// periodically so the supervisor does not preempt a healthy worker.
pub fn kick() {
    if let Some(f) = KICKER.get() {
        f();
    }
}
