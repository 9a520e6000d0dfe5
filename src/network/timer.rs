//! Loss Timer
//!
//! At most one armed deadline per node, keyed by the ball's sequence.
//! Arming a newer sequence aborts the older task; cancelling checks the
//! sequence so a late cancel never kills a newer timer.

use std::sync::{Mutex, MutexGuard};
use tokio::task::AbortHandle;
use tracing::debug;

struct Armed {
    sequence: u64,
    handle: AbortHandle,
}

/// Cancellable deadline slot.
#[derive(Default)]
pub struct LossTimer {
    slot: Mutex<Option<Armed>>,
}

impl LossTimer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<Armed>> {
        // A panic while holding the lock leaves the slot usable
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Track the task that fires the deadline for `sequence`, aborting
    /// whatever was armed before.
    pub fn arm(&self, sequence: u64, handle: AbortHandle) {
        let previous = self.slot().replace(Armed { sequence, handle });
        if let Some(previous) = previous {
            if previous.sequence != sequence {
                debug!("Loss timer {} superseded by {}", previous.sequence, sequence);
            }
            previous.handle.abort();
        }
    }

    /// Abort the timer for `sequence`. Returns false if a different
    /// sequence (or nothing) is armed.
    pub fn cancel(&self, sequence: u64) -> bool {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(armed) if armed.sequence == sequence => {
                armed.handle.abort();
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Abort whatever is armed.
    pub fn cancel_all(&self) {
        if let Some(armed) = self.slot().take() {
            armed.handle.abort();
        }
    }

    /// The timer fired; forget it if it is still the armed one.
    pub fn fired(&self, sequence: u64) {
        let mut slot = self.slot();
        if slot.as_ref().map_or(false, |a| a.sequence == sequence) {
            *slot = None;
        }
    }

    /// Sequence currently armed.
    pub fn armed_sequence(&self) -> Option<u64> {
        self.slot().as_ref().map(|a| a.sequence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn spawn_counter(fired: &Arc<AtomicUsize>, after: Duration) -> AbortHandle {
        let fired = fired.clone();
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            fired.fetch_add(1, Ordering::SeqCst);
        })
        .abort_handle()
    }

    #[tokio::test]
    async fn test_cancel_matching_sequence() {
        let timer = LossTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(3, spawn_counter(&fired, Duration::from_millis(50)));
        assert!(!timer.cancel(2));
        assert_eq!(timer.armed_sequence(), Some(3));
        assert!(timer.cancel(3));
        assert_eq!(timer.armed_sequence(), None);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_rearm_aborts_previous() {
        let timer = LossTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(0, spawn_counter(&fired, Duration::from_millis(50)));
        timer.arm(1, spawn_counter(&fired, Duration::from_millis(60)));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        timer.fired(1);
        assert_eq!(timer.armed_sequence(), None);
    }

    #[tokio::test]
    async fn test_cancel_all() {
        let timer = LossTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));

        timer.arm(9, spawn_counter(&fired, Duration::from_millis(30)));
        timer.cancel_all();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!timer.cancel(9));
    }
}
