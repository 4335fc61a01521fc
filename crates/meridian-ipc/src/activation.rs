//! Process activation state
//!
//! Tracks whether this process is foregrounded, and coalesces external
//! write signals raised while backgrounded. Both flags start false and
//! share one mutex, so raising a signal never races clearing the pending
//! flag on a foreground transition.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct Flags {
    active: bool,
    pending_external_write: bool,
}

#[derive(Debug, Default)]
pub struct ProcessActivation {
    flags: Mutex<Flags>,
}

impl ProcessActivation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self) -> bool {
        self.flags.lock().active
    }

    /// Records one external write signal.
    ///
    /// Returns `true` when the caller should deliver promptly (process is
    /// active). While inactive the signal coalesces into the pending flag:
    /// however many times this is called, at most one deferred delivery is
    /// owed on the next foreground transition.
    pub(crate) fn note_external_write(&self) -> bool {
        let mut flags = self.flags.lock();
        if flags.active {
            true
        } else {
            flags.pending_external_write = true;
            false
        }
    }

    /// Applies an activation transition.
    ///
    /// Returns `true` exactly when a deferred external write must be
    /// delivered now: a background-to-foreground transition with the
    /// pending flag set. The flag is cleared in the same critical section,
    /// so redelivery happens exactly once per pending window.
    pub(crate) fn transition(&self, active: bool) -> bool {
        let mut flags = self.flags.lock();
        let was_active = flags.active;
        flags.active = active;
        if active && !was_active && flags.pending_external_write {
            flags.pending_external_write = false;
            true
        } else {
            false
        }
    }
}
