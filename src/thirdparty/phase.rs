use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Lifecycle of one third-party resource type
///
/// `Installed` is the only serving phase. `Removing` is terminal-pending: the
/// type never returns to `Installed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResourcePhase {
    Declared = 0,
    Installing = 1,
    Installed = 2,
    Removing = 3,
    Removed = 4,
}

impl ResourcePhase {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ResourcePhase::Declared,
            1 => ResourcePhase::Installing,
            2 => ResourcePhase::Installed,
            3 => ResourcePhase::Removing,
            _ => ResourcePhase::Removed,
        }
    }

    /// Whether handlers may still touch storage
    pub fn accepts_requests(&self) -> bool {
        matches!(self, ResourcePhase::Installing | ResourcePhase::Installed)
    }
}

impl fmt::Display for ResourcePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Phase shared between the manager and the handlers of one resource type
#[derive(Debug, Clone)]
pub struct PhaseCell {
    inner: Arc<AtomicU8>,
}

impl PhaseCell {
    pub fn new(phase: ResourcePhase) -> Self {
        Self {
            inner: Arc::new(AtomicU8::new(phase as u8)),
        }
    }

    pub fn get(&self) -> ResourcePhase {
        ResourcePhase::from_u8(self.inner.load(Ordering::Acquire))
    }

    pub fn set(&self, phase: ResourcePhase) {
        self.inner.store(phase as u8, Ordering::Release);
    }
}

impl Default for PhaseCell {
    fn default() -> Self {
        Self::new(ResourcePhase::Declared)
    }
}
