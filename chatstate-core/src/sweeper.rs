//! Background deletion of expired checkpoint data for backends without a
//! managed TTL.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::StoreError;

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// What one sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Partitions deleted together with everything under them.
    pub partitions: usize,
    /// Individual checkpoints deleted (with their pending writes) from
    /// partitions that are still alive.
    pub checkpoints: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.partitions == 0 && self.checkpoints == 0
    }
}

impl std::ops::AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.partitions += other.partitions;
        self.checkpoints += other.checkpoints;
    }
}

#[async_trait::async_trait]
pub trait ExpirySweep: Send + Sync {
    /// Deletes partitions and checkpoints whose `expire_at` is at or before `now`.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepReport, StoreError>;
}

pub struct TtlSweeper {
    target: Arc<dyn ExpirySweep>,
    interval: Duration,
    token: CancellationToken,
}

impl TtlSweeper {
    pub fn new(target: Arc<dyn ExpirySweep>) -> Self {
        Self {
            target,
            interval: DEFAULT_SWEEP_INTERVAL,
            token: CancellationToken::new(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Stops the sweeper when `token` (or a parent of it) is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        self.target.sweep_expired(Utc::now()).await
    }

    /// Sweeps every interval (the first sweep runs immediately) until the
    /// handle is shut down or the token is cancelled. Sweep failures are
    /// logged and the loop continues.
    pub fn spawn(self) -> SweeperHandle {
        let token = self.token.clone();
        let interval = if self.interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            self.interval
        };
        let span = tracing::info_span!("ttl_sweeper", interval_secs = interval.as_secs());

        let join = tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match self.run_once().await {
                        Ok(report) if report.is_empty() => tracing::debug!("nothing expired"),
                        Ok(report) => tracing::info!(
                            partitions = report.partitions,
                            checkpoints = report.checkpoints,
                            "removed expired checkpoint data"
                        ),
                        Err(error) => tracing::warn!(error = %error, "expiry sweep failed"),
                    }
                }
                tracing::debug!("sweeper stopped");
            }
            .instrument(span),
        );

        SweeperHandle { token, join }
    }
}

pub struct SweeperHandle {
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the loop and waits for the in-flight sweep, if any, to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        if let Err(error) = self.join.await {
            tracing::warn!(error = %error, "sweeper task ended abnormally");
        }
    }
}
