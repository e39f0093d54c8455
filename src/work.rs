//! Delayed work items.
//!
//! Every periodic task of the core is a [`DelayedWork`] owned by its component. Nothing
//! runs asynchronously behind the owner's back: the owner polls with the current
//! monotonic time and runs whatever became due.

/// A one-shot timer with delayed-work semantics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DelayedWork {
    deadline: Option<u64>,
}

impl DelayedWork {
    pub const fn new() -> Self {
        Self { deadline: None }
    }

    /// Queues the work unless it is already pending. Returns false if it was pending,
    /// in which case the old deadline is kept.
    pub fn schedule(&mut self, now_ms: u64, delay_ms: u64) -> bool {
        if self.deadline.is_some() {
            return false;
        }

        self.deadline = Some(now_ms.saturating_add(delay_ms));
        true
    }

    /// Queues the work, moving the deadline if it was already pending
    pub fn reschedule(&mut self, now_ms: u64, delay_ms: u64) {
        self.deadline = Some(now_ms.saturating_add(delay_ms));
    }

    /// Returns true if the work was pending
    pub fn cancel(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_pending(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<u64> {
        self.deadline
    }

    /// Consumes the pending work if its deadline has passed. The caller runs the
    /// work body when this returns true; the body may schedule the work again.
    pub fn take_due(&mut self, now_ms: u64) -> bool {
        match self.deadline {
            Some(deadline) if deadline <= now_ms => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}

/// Earliest deadline among a set of works
pub fn earliest<'a>(works: impl IntoIterator<Item = &'a DelayedWork>) -> Option<u64> {
    works.into_iter().filter_map(DelayedWork::deadline).min()
}
