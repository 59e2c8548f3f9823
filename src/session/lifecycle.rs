//! Session teardown primitives: the one-way shutdown flag and keyed timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Set once when a session starts tearing down; never cleared.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag.  Returns `true` only for the caller that set it first.
    pub fn begin(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A single pending timer that posts an event when it fires.
///
/// Rescheduling aborts the pending timer first, so at most one is ever
/// armed.  Each schedule gets a new generation; an event whose generation is
/// no longer current is stale.  Dropping the slot aborts the timer.
#[derive(Debug, Default)]
pub struct TimerSlot {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl TimerSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm the timer.  `event` receives the new generation.
    pub fn schedule<T, F>(&mut self, delay: Duration, events: &mpsc::Sender<T>, event: F) -> u64
    where
        T: Send + 'static,
        F: FnOnce(u64) -> T,
    {
        self.cancel();
        self.generation += 1;
        let event = event(self.generation);
        let events = events.clone();
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event).await;
        }));
        self.generation
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.is_some()
    }

    /// Accept a fired event: `true` when `generation` is the armed one, which
    /// also disarms the slot.
    pub fn fire(&mut self, generation: u64) -> bool {
        if self.handle.is_some() && generation == self.generation {
            self.handle = None;
            true
        } else {
            false
        }
    }
}

impl Drop for TimerSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_begins_once() {
        let flag = ShutdownFlag::new();
        let other = flag.clone();
        assert!(!flag.is_set());
        assert!(flag.begin());
        assert!(!other.begin());
        assert!(other.is_set());
    }

    #[tokio::test(start_paused = true)]
    async fn timer_fires_with_its_generation() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = TimerSlot::new();
        let generation = slot.schedule(Duration::from_millis(250), &tx, |g| g);

        assert_eq!(rx.recv().await, Some(generation));
        assert!(slot.fire(generation));
        assert!(!slot.is_armed());
        assert!(!slot.fire(generation));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_replaces_pending_timer() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut slot = TimerSlot::new();
        let first = slot.schedule(Duration::from_millis(100), &tx, |g| g);
        let second = slot.schedule(Duration::from_millis(100), &tx, |g| g);
        assert_ne!(first, second);

        assert_eq!(rx.recv().await, Some(second));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert!(!slot.fire(first));
        assert!(slot.fire(second));
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_and_drop_abort_the_timer() {
        let (tx, mut rx) = mpsc::channel::<u64>(4);
        let mut slot = TimerSlot::new();
        slot.schedule(Duration::from_millis(50), &tx, |g| g);
        slot.cancel();
        assert!(!slot.is_armed());

        let mut dropped = TimerSlot::new();
        dropped.schedule(Duration::from_millis(50), &tx, |g| g);
        drop(dropped);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }
}
