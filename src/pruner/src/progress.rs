//! Background aggregation of sweep progress.
//!
//! Sweeps send [`ProgressMessage`] increments over an unbounded channel. The
//! reporter task sums them and logs the totals and removal rate every
//! interval. Reporting has no influence on what gets pruned.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Work completed by a sweep since its previous message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressMessage {
    pub txns_removed: u64,
    pub docs_cleaned: u64,
}

/// Totals aggregated by a reporter.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProgressTotals {
    pub txns_removed: u64,
    pub docs_cleaned: u64,
}

impl ProgressTotals {
    fn add(&mut self, msg: ProgressMessage) {
        self.txns_removed += msg.txns_removed;
        self.docs_cleaned += msg.docs_cleaned;
    }
}

/// Handle to a running reporter task.
pub struct ProgressReporter {
    sender: mpsc::UnboundedSender<ProgressMessage>,
    cancel: CancellationToken,
    handle: JoinHandle<ProgressTotals>,
}

impl ProgressReporter {
    /// Spawn a reporter logging every `interval`.
    pub fn start(interval: Duration) -> Self {
        let (sender, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_reporter(rx, cancel.clone(), interval));
        Self {
            sender,
            cancel,
            handle,
        }
    }

    /// A sender for one sweep.
    pub fn sender(&self) -> mpsc::UnboundedSender<ProgressMessage> {
        self.sender.clone()
    }

    /// Stop the reporter and return what it aggregated. Messages already
    /// queued when this is called are included.
    pub async fn stop(self) -> ProgressTotals {
        drop(self.sender);
        self.cancel.cancel();
        match self.handle.await {
            Ok(totals) => totals,
            Err(err) => {
                warn!(error = %err, "progress reporter failed");
                ProgressTotals::default()
            }
        }
    }
}

async fn run_reporter(
    mut rx: mpsc::UnboundedReceiver<ProgressMessage>,
    cancel: CancellationToken,
    interval: Duration,
) -> ProgressTotals {
    let started = Instant::now();
    let mut ticker = tokio::time::interval_at(started + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut totals = ProgressTotals::default();
    let mut open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            msg = rx.recv(), if open => match msg {
                Some(msg) => totals.add(msg),
                None => open = false,
            },

            _ = ticker.tick() => {
                let elapsed = started.elapsed().as_secs_f64();
                let rate = if elapsed > 0.0 {
                    totals.txns_removed as f64 / elapsed
                } else {
                    0.0
                };
                debug!(
                    txns_removed = totals.txns_removed,
                    docs_cleaned = totals.docs_cleaned,
                    "pruning has removed {} txns ({:.0}txn/s) cleaning {} docs",
                    totals.txns_removed,
                    rate,
                    totals.docs_cleaned,
                );
            }
        }
    }

    while let Ok(msg) = rx.try_recv() {
        totals.add(msg);
    }
    totals
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_totals_include_every_sender() {
        let reporter = ProgressReporter::start(Duration::from_secs(15));
        let forward = reporter.sender();
        let reverse = reporter.sender();

        forward
            .send(ProgressMessage {
                txns_removed: 10,
                docs_cleaned: 4,
            })
            .unwrap();
        reverse
            .send(ProgressMessage {
                txns_removed: 5,
                docs_cleaned: 1,
            })
            .unwrap();
        forward
            .send(ProgressMessage {
                txns_removed: 1,
                docs_cleaned: 0,
            })
            .unwrap();

        let totals = reporter.stop().await;
        assert_eq!(
            totals,
            ProgressTotals {
                txns_removed: 16,
                docs_cleaned: 5,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_keeps_running_across_intervals() {
        let reporter = ProgressReporter::start(Duration::from_secs(15));
        let sender = reporter.sender();

        for _ in 0..4 {
            sender
                .send(ProgressMessage {
                    txns_removed: 100,
                    docs_cleaned: 10,
                })
                .unwrap();
            tokio::time::advance(Duration::from_secs(16)).await;
            tokio::task::yield_now().await;
        }
        drop(sender);

        let totals = reporter.stop().await;
        assert_eq!(totals.txns_removed, 400);
        assert_eq!(totals.docs_cleaned, 40);
    }

    #[tokio::test]
    async fn test_stop_without_messages() {
        let reporter = ProgressReporter::start(Duration::from_millis(1));
        assert_eq!(reporter.stop().await, ProgressTotals::default());
    }
}
