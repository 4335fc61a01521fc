//! Startup gate
//!
//! The storage facade asks its delegate whether bootstrap has finished
//! before deciding how to treat touches with no observer registry. The
//! gate is flipped exactly once, by whoever drives app startup.

use std::sync::atomic::{AtomicBool, Ordering};

use meridian_storage::StorageDelegate;

#[derive(Debug, Default)]
pub struct StartupGate {
    ready: AtomicBool,
}

impl StartupGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks bootstrap as complete. From here on, a write that touches
    /// entities without an installed observer registry is a programming
    /// error rather than a startup-window artifact.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        tracing::debug!("Startup gate opened");
    }
}

impl StorageDelegate for StartupGate {
    fn is_storage_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
