//! Trailing-edge debounce as a cancellable scheduled task.
//!
//! Two call-site behaviors exist and both are preserved:
//! - `arm`: schedule only if nothing is pending (the edit-broadcast path —
//!   a burst of edits fires once, `delay` after the first edit).
//! - `reset`: cancel any pending run and reschedule (the local-save path —
//!   the save fires `delay` after the last edit).

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A single-slot debounce timer.
pub struct Debounce {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Debounce {
    pub fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    /// Schedule `action` to run after `delay` unless a run is already pending.
    pub fn arm<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Cancel any pending run and schedule `action` after a fresh `delay`.
    pub fn reset<F>(&self, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
        *slot = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            action.await;
        }));
    }

    /// Cancel any pending run.
    pub fn cancel(&self) {
        let mut slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = slot.take() {
            handle.abort();
        }
    }

    /// Whether a run is currently scheduled.
    pub fn is_armed(&self) -> bool {
        let slot = self.task.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Default for Debounce {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Debounce {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_arm_coalesces_bursts() {
        let fired = Arc::new(AtomicU32::new(0));
        let debounce = Debounce::new();

        for _ in 0..10 {
            let fired = fired.clone();
            debounce.arm(Duration::from_millis(30), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reset_postpones() {
        let fired = Arc::new(AtomicU32::new(0));
        let debounce = Debounce::new();

        for _ in 0..3 {
            let fired = fired.clone();
            debounce.reset(Duration::from_millis(40), async move {
                fired.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(15)).await;
        }
        // Still within the window of the last reset.
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_prevents_run() {
        let fired = Arc::new(AtomicU32::new(0));
        let debounce = Debounce::new();

        let f = fired.clone();
        debounce.arm(Duration::from_millis(20), async move {
            f.fetch_add(1, Ordering::SeqCst);
        });
        debounce.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert!(!debounce.is_armed());
    }

    #[tokio::test]
    async fn test_rearm_after_fire() {
        let fired = Arc::new(AtomicU32::new(0));
        let debounce = Debounce::new();

        for _ in 0..2 {
            let f = fired.clone();
            debounce.arm(Duration::from_millis(10), async move {
                f.fetch_add(1, Ordering::SeqCst);
            });
            tokio::time::sleep(Duration::from_millis(40)).await;
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }
}
