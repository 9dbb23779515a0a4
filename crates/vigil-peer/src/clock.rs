use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Wall-clock port. Core logic never reads ambient time; the coordinator
/// asks this instead, so tests can pin or step the clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Whether the surface this peer serves is actively viewed. When not, the
/// scheduler doubles every polling interval to save request budget.
pub trait VisibilityProbe: Send + Sync {
    fn low_priority(&self) -> bool;
}

/// Shared flag implementation; hand one clone to the UI layer and one to the
/// coordinator.
#[derive(Debug, Clone, Default)]
pub struct VisibilityFlag {
    low_priority: Arc<AtomicBool>,
}

impl VisibilityFlag {
    pub fn new(low_priority: bool) -> Self {
        Self {
            low_priority: Arc::new(AtomicBool::new(low_priority)),
        }
    }

    pub fn set_low_priority(&self, low_priority: bool) {
        self.low_priority.store(low_priority, Ordering::SeqCst);
    }
}

impl VisibilityProbe for VisibilityFlag {
    fn low_priority(&self) -> bool {
        self.low_priority.load(Ordering::SeqCst)
    }
}
