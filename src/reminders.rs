use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::time::now_ms;
use crate::{AppError, AppResult};

/// Minimum lead time for a reminder. Some host schedulers mishandle zero or
/// negative-delay timers, so anything closer than this is rejected.
pub const MIN_LEAD_SECONDS: i64 = 5;

/// Delivery port for fired reminders. The host wires this to its
/// notification surface; tests use a recording fake.
pub trait Notifier: Send + Sync + 'static {
    fn notify(&self, title: &str, body: &str, tx_id: Option<&str>);
}

/// Default headless delivery: a structured log line.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str, tx_id: Option<&str>) {
        info!(
            target = "daftar",
            event = "reminder_fired",
            title = %title,
            body = %body,
            tx_id = tx_id.unwrap_or("")
        );
    }
}

struct Pending {
    task: JoinHandle<()>,
}

/// One-shot debt reminder scheduler.
///
/// Handles are opaque uuids; a transaction row stores its handle in
/// `reminder_id` so delete/replace paths can cancel the timer.
pub struct ReminderScheduler {
    notifier: Arc<dyn Notifier>,
    pending: Arc<Mutex<HashMap<String, Pending>>>,
}

impl ReminderScheduler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        ReminderScheduler {
            notifier,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Schedule a one-shot reminder at `timestamp_ms` (epoch millis).
    /// Fails with `SCHEDULE/*` when the instant is invalid or closer than
    /// [`MIN_LEAD_SECONDS`].
    pub fn schedule(
        &self,
        timestamp_ms: i64,
        title: &str,
        body: &str,
        tx_id: Option<&str>,
    ) -> AppResult<String> {
        if timestamp_ms <= 0 {
            return Err(AppError::new("SCHEDULE/INVALID_TIMESTAMP", "Invalid timestamp")
                .with_context("timestamp", timestamp_ms.to_string()));
        }
        let delta_ms = timestamp_ms - now_ms();
        // Whole-second ceiling: a 4.2s lead still counts as under threshold.
        let delta_seconds = (delta_ms + 999) / 1000;
        if delta_seconds < MIN_LEAD_SECONDS {
            return Err(AppError::new(
                "SCHEDULE/TOO_SOON",
                "Reminder time must be in the future",
            )
            .with_context("delta_ms", delta_ms.to_string()));
        }

        let handle = Uuid::new_v4().to_string();
        let notifier = self.notifier.clone();
        let pending = Arc::clone(&self.pending);
        let key = handle.clone();
        let title = title.to_string();
        let body = body.to_string();
        let tx_ref = tx_id.map(str::to_string);

        let task = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(delta_ms.max(0) as u64)).await;
            // Remove first: a handle that fired is no longer live.
            let was_live = pending.lock().unwrap_or_else(|e| e.into_inner()).remove(&key);
            if was_live.is_some() {
                notifier.notify(&title, &body, tx_ref.as_deref());
            }
        });

        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle.clone(), Pending { task });

        info!(
            target = "daftar",
            event = "reminder_scheduled",
            handle = %handle,
            delta_seconds = delta_seconds
        );
        Ok(handle)
    }

    /// Cancel a reminder. Best-effort by contract: an absent or
    /// already-fired handle is a successful no-op, never an error.
    pub fn cancel(&self, handle: &str) {
        let removed = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(handle);
        match removed {
            Some(entry) => {
                entry.task.abort();
                info!(target = "daftar", event = "reminder_cancelled", handle = %handle);
            }
            None => {
                debug!(target = "daftar", event = "reminder_cancel_noop", handle = %handle);
            }
        }
    }

    /// Cancel a batch of handles. Used by bulk replace/clear before any
    /// rows are deleted so no stale reminder outlives its transaction.
    pub fn cancel_all<I, S>(&self, handles: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for handle in handles {
            self.cancel(handle.as_ref());
        }
    }

    pub fn is_live(&self, handle: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(handle)
    }

    pub fn live_count(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Drop for ReminderScheduler {
    fn drop(&mut self) {
        let mut map = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        for (handle, entry) in map.drain() {
            entry.task.abort();
            warn!(target = "daftar", event = "reminder_dropped", handle = %handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingNotifier {
        fired: Mutex<Vec<String>>,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, title: &str, _body: &str, _tx_id: Option<&str>) {
            self.fired
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(title.to_string());
        }
    }

    fn scheduler() -> (ReminderScheduler, Arc<RecordingNotifier>) {
        let notifier = Arc::new(RecordingNotifier {
            fired: Mutex::new(Vec::new()),
        });
        (ReminderScheduler::new(notifier.clone()), notifier)
    }

    #[tokio::test]
    async fn rejects_timestamps_under_the_lead_threshold() {
        let (sched, _) = scheduler();
        let err = sched
            .schedule(now_ms() + 2_000, "Debt", "", None)
            .expect_err("2s lead must be rejected");
        assert_eq!(err.code(), "SCHEDULE/TOO_SOON");
        assert_eq!(err.message(), "Reminder time must be in the future");
        assert_eq!(sched.live_count(), 0);
    }

    #[tokio::test]
    async fn rejects_invalid_instants() {
        let (sched, _) = scheduler();
        let err = sched.schedule(0, "Debt", "", None).expect_err("zero ts");
        assert_eq!(err.code(), "SCHEDULE/INVALID_TIMESTAMP");
        let err = sched.schedule(-5, "Debt", "", None).expect_err("negative ts");
        assert_eq!(err.code(), "SCHEDULE/INVALID_TIMESTAMP");
    }

    #[tokio::test]
    async fn schedules_and_cancels_a_live_reminder() {
        let (sched, notifier) = scheduler();
        let handle = sched
            .schedule(now_ms() + 3_600_000, "Debt", "client owes", Some("t1"))
            .expect("schedule one hour out");
        assert!(sched.is_live(&handle));

        sched.cancel(&handle);
        assert!(!sched.is_live(&handle));
        assert!(notifier.fired.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_an_absent_handle_is_a_noop() {
        let (sched, _) = scheduler();
        sched.cancel("no-such-handle");
        sched.cancel("");
        assert_eq!(sched.live_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_and_forgets_the_handle() {
        let (sched, notifier) = scheduler();
        let handle = sched
            .schedule(now_ms() + 10_000, "Debt due", "", None)
            .expect("schedule");

        // Paused time auto-advances while the runtime is otherwise idle.
        tokio::time::sleep(Duration::from_secs(30)).await;
        tokio::task::yield_now().await;

        assert!(!sched.is_live(&handle));
        assert_eq!(
            notifier.fired.lock().unwrap().as_slice(),
            &["Debt due".to_string()]
        );
    }
}
