//! Recurring background tasks.
//!
//! A [`RecurringTaskRunner`] drives one async action on a fixed interval in
//! its own tokio task. The loop sleeps in short slices so cancellation is
//! observed within about a second, and an error returned by the action is
//! logged without stopping subsequent runs.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Granularity at which the loop re-checks cancellation while idle.
const SLICE: Duration = Duration::from_secs(1);

/// How long [`RecurringTaskRunner::join`] waits for the task to wind down.
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct RecurringTaskRunner {
    name: String,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RecurringTaskRunner {
    /// Spawn the background loop. The first run happens `initial_delay`
    /// after start; later runs happen `interval` after the start of the
    /// previous run.
    pub fn start<F, Fut>(
        name: &str,
        interval: Duration,
        initial_delay: Duration,
        action: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        Self::start_with_token(name, interval, initial_delay, CancellationToken::new(), action)
    }

    /// Like [`start`](Self::start) but using a caller-supplied token, so the
    /// action can hold a clone and stop its own runner (e.g. a download
    /// poller that has reached a terminal state).
    pub fn start_with_token<F, Fut>(
        name: &str,
        interval: Duration,
        initial_delay: Duration,
        cancel: CancellationToken,
        mut action: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send,
    {
        let token = cancel.clone();
        let task_name = name.to_string();

        let handle = tokio::spawn(async move {
            let mut next_run = Instant::now() + initial_delay;
            debug!(task = %task_name, "recurring task started");
            loop {
                if token.is_cancelled() {
                    break;
                }
                if Instant::now() >= next_run {
                    next_run = Instant::now() + interval;
                    if let Err(e) = action().await {
                        warn!(task = %task_name, error = %e, "recurring task run failed");
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(SLICE) => {}
                }
            }
            debug!(task = %task_name, "recurring task stopped");
        });

        Self {
            name: name.to_string(),
            cancel,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request the loop to stop after the current slice.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Wait (bounded) for the task to finish after cancellation.
    pub async fn join(self) {
        match tokio::time::timeout(JOIN_TIMEOUT, self.handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task = %self.name, error = %e, "recurring task panicked"),
            Err(_) => warn!(task = %self.name, "recurring task did not stop in time"),
        }
    }

    /// Cancel and wait, in one step.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.join().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn runs_immediately_with_zero_delay_then_on_interval() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner = RecurringTaskRunner::start(
            "test",
            Duration::from_secs(5),
            Duration::ZERO,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        runner.shutdown().await;
        let settled = count.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), settled);
    }

    #[tokio::test(start_paused = true)]
    async fn initial_delay_defers_first_run() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner = RecurringTaskRunner::start(
            "delayed",
            Duration::from_secs(5),
            Duration::from_secs(3),
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_millis(2900)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        runner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn action_errors_do_not_stop_the_loop() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let runner = RecurringTaskRunner::start(
            "failing",
            Duration::from_secs(2),
            Duration::ZERO,
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    anyhow::bail!("boom")
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(7)).await;
        assert!(count.load(Ordering::SeqCst) >= 3);

        runner.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn action_can_cancel_its_own_runner() {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let token = CancellationToken::new();
        let t = token.clone();
        let runner = RecurringTaskRunner::start_with_token(
            "self-stopping",
            Duration::from_secs(1),
            Duration::ZERO,
            token,
            move || {
                let c = c.clone();
                let t = t.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) + 1 >= 2 {
                        t.cancel();
                    }
                    Ok(())
                }
            },
        );

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        runner.join().await;
    }
}
