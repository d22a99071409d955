//! ---
//! ms_section: "01-core-functionality"
//! ms_subsection: "module"
//! ms_type: "source"
//! ms_scope: "code"
//! ms_description: "Model change tracking shared by the publishers."
//! ms_version: "v0.0.0-prealpha"
//! ms_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// Dirty flags telling each publisher that the model changed since its last cycle.
///
/// `mark_changed` raises both flags; each consumer clears only its own.
#[derive(Debug, Default)]
pub struct ChangeTracker {
    needs_table_refresh: AtomicBool,
    needs_broadcast: AtomicBool,
    notify: Notify,
}

impl ChangeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_changed(&self) {
        self.needs_table_refresh.store(true, Ordering::SeqCst);
        self.needs_broadcast.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Read and clear the table-refresh flag.
    pub fn take_table_refresh(&self) -> bool {
        self.needs_table_refresh.swap(false, Ordering::SeqCst)
    }

    /// Raise the table-refresh flag again after a cycle that could not publish.
    pub fn restore_table_refresh(&self) {
        self.needs_table_refresh.store(true, Ordering::SeqCst);
    }

    /// Read and clear the broadcast flag.
    pub fn take_broadcast(&self) -> bool {
        self.needs_broadcast.swap(false, Ordering::SeqCst)
    }

    pub fn needs_table_refresh(&self) -> bool {
        self.needs_table_refresh.load(Ordering::SeqCst)
    }

    pub fn needs_broadcast(&self) -> bool {
        self.needs_broadcast.load(Ordering::SeqCst)
    }

    /// Resolves on the next `mark_changed` after the call.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}
