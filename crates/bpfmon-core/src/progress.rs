//! Progress ticks for a running session.
//!
//! The ticker only reports; it never decides when the probe stops.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Snapshot of a running session's clock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressUpdate {
    pub session_id: String,
    pub probe_id: String,
    pub elapsed: Duration,
    /// Time left before the duration bound, `None` for unbounded runs.
    pub remaining: Option<Duration>,
}

/// Background task publishing [`ProgressUpdate`]s. Aborted on drop.
pub struct ProgressTicker {
    task: JoinHandle<()>,
}

impl ProgressTicker {
    /// Start ticking every `interval` until the receiver goes away or the
    /// ticker is dropped.
    pub fn spawn(
        session_id: String,
        probe_id: String,
        bound: Option<Duration>,
        interval: Duration,
        tx: mpsc::UnboundedSender<ProgressUpdate>,
    ) -> Self {
        let started = Instant::now();
        let task = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(started + interval, interval);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticks.tick().await;
                let elapsed = started.elapsed();
                let update = ProgressUpdate {
                    session_id: session_id.clone(),
                    probe_id: probe_id.clone(),
                    elapsed,
                    remaining: bound.map(|b| b.saturating_sub(elapsed)),
                };
                if tx.send(update).is_err() {
                    break;
                }
            }
        });
        Self { task }
    }
}

impl Drop for ProgressTicker {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_report_remaining_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ticker = ProgressTicker::spawn(
            "s1".into(),
            "exec".into(),
            Some(Duration::from_secs(5)),
            Duration::from_secs(1),
            tx,
        );

        let first = rx.recv().await.unwrap();
        assert_eq!(first.elapsed, Duration::from_secs(1));
        assert_eq!(first.remaining, Some(Duration::from_secs(4)));

        let second = rx.recv().await.unwrap();
        assert_eq!(second.remaining, Some(Duration::from_secs(3)));

        drop(ticker);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unbounded_run_has_no_remaining() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ticker = ProgressTicker::spawn(
            "s2".into(),
            "fork".into(),
            None,
            Duration::from_millis(500),
            tx,
        );
        let update = rx.recv().await.unwrap();
        assert!(update.remaining.is_none());
        assert_eq!(update.elapsed, Duration::from_millis(500));
    }
}
