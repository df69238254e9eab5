//! Fixed-delay recurring tasks
//!
//! Each firing runs in its own spawned task so that a panic inside it is
//! observed as a `JoinError`, logged, and the schedule keeps going.
//! Cancellation is a watch flag that is only checked while sleeping, so a
//! firing that is already running always completes.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// Handle to a running schedule
#[derive(Debug)]
pub struct ScheduleHandle {
    label: String,
    cancel_tx: watch::Sender<bool>,
    next_fire: Arc<Mutex<Option<DateTime<Utc>>>>,
    task: JoinHandle<()>,
}

impl ScheduleHandle {
    /// Schedule label
    #[inline]
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Prevent future firings
    pub fn cancel(&self) {
        // Receiver lives as long as the loop; a send error means it already ended.
        let _ = self.cancel_tx.send(true);
    }

    /// Whether cancellation has been requested
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Whether the loop has exited
    #[inline]
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// When the next firing is due, if one is pending
    #[must_use]
    pub fn next_fire(&self) -> Option<DateTime<Utc>> {
        *self.next_fire.lock()
    }
}

/// Start a fixed-delay schedule
///
/// `tick` is called after `initial_delay`, then again `delay` after each
/// firing completes. Must be called from within a tokio runtime.
pub fn spawn_fixed_delay<F, Fut>(
    label: impl Into<String>,
    initial_delay: Duration,
    delay: Duration,
    tick: F,
) -> ScheduleHandle
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let label = label.into();
    let (cancel_tx, mut cancel_rx) = watch::channel(false);
    let next_fire = Arc::new(Mutex::new(None));

    let loop_label = label.clone();
    let loop_next = Arc::clone(&next_fire);
    let task = tokio::spawn(async move {
        let mut wait = initial_delay;
        loop {
            *loop_next.lock() = chrono::Duration::from_std(wait)
                .ok()
                .map(|d| Utc::now() + d);
            let cancelled = tokio::select! {
                () = tokio::time::sleep(wait) => false,
                // A dropped handle counts as a cancel.
                changed = cancel_rx.changed() => changed.is_err() || *cancel_rx.borrow(),
            };
            if cancelled {
                break;
            }
            *loop_next.lock() = None;

            if let Err(e) = tokio::spawn(tick()).await {
                if e.is_panic() {
                    error!(schedule = %loop_label, "scheduled run panicked: {}", e);
                }
            }
            wait = delay;
        }
        *loop_next.lock() = None;
        debug!(schedule = %loop_label, "schedule cancelled");
    });

    ScheduleHandle {
        label,
        cancel_tx,
        next_fire,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn fires_after_initial_then_fixed_delay() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = spawn_fixed_delay(
            "test",
            Duration::from_secs(5),
            Duration::from_secs(60),
            move || {
                let h = Arc::clone(&h);
                async move {
                    h.fetch_add(1, Ordering::SeqCst);
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert!(handle.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn survives_panicking_runs() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        let handle = spawn_fixed_delay("panics", Duration::ZERO, Duration::from_secs(1), move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
                panic!("scripted failure");
            }
        });

        tokio::time::sleep(Duration::from_millis(3_500)).await;
        assert!(hits.load(Ordering::SeqCst) >= 3);
        assert!(!handle.is_finished());
        handle.cancel();
    }
}
