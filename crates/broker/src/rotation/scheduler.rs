//! Rotation scheduler
//!
//! A single task owns the [`RotationQueue`]. It wakes on a fixed poll
//! interval, pops every due entry and spawns one rotation task per entry.
//! Everything else talks to it through a [`SchedulerHandle`].
//!
//! Every popped entry is pushed back: at `now + period` after a successful
//! rotation, at `now + retry_delay` after a failed one. The only exception
//! is a target the [`Rotator`] reports as no longer scheduled (deleted role,
//! disabled rotation).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::queue::{RotationKey, RotationQueue};
use crate::config::BrokerConfig;
use crate::error::BrokerResult;

/// Performs the rotation behind a queue entry
#[async_trait]
pub trait Rotator: Send + Sync + 'static {
    /// Rotate `key`
    ///
    /// `Ok(Some(period))` reschedules at `now + period`; `Ok(None)` means
    /// the target should no longer be scheduled.
    async fn rotate(&self, key: &RotationKey) -> BrokerResult<Option<Duration>>;
}

enum Command {
    Schedule {
        key: RotationKey,
        due_at: DateTime<Utc>,
    },
    Unschedule {
        key: RotationKey,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<(RotationKey, DateTime<Utc>)>>,
    },
}

/// Command side of the scheduler; cheap to clone
#[derive(Debug, Clone)]
pub struct SchedulerHandle {
    tx: mpsc::Sender<Command>,
}

/// Receiving side, consumed by [`RotationScheduler::new`]
pub struct CommandReceiver {
    rx: mpsc::Receiver<Command>,
}

/// Create the command channel before the scheduler itself
///
/// The handle can be shared with components the [`Rotator`] depends on, then
/// the receiver is handed to the scheduler once the rotator exists.
pub fn channel(buffer: usize) -> (SchedulerHandle, CommandReceiver) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (SchedulerHandle { tx }, CommandReceiver { rx })
}

impl SchedulerHandle {
    /// Schedule `key` at `due_at`, replacing any existing schedule
    pub async fn schedule(&self, key: RotationKey, due_at: DateTime<Utc>) {
        if self.tx.send(Command::Schedule { key, due_at }).await.is_err() {
            tracing::debug!("Scheduler stopped; schedule request dropped");
        }
    }

    /// Remove `key` from the queue
    pub async fn unschedule(&self, key: RotationKey) {
        if self.tx.send(Command::Unschedule { key }).await.is_err() {
            tracing::debug!("Scheduler stopped; unschedule request dropped");
        }
    }

    /// Queued `(key, due_at)` pairs in due order; empty once stopped
    pub async fn snapshot(&self) -> Vec<(RotationKey, DateTime<Utc>)> {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Snapshot { reply }).await.is_err() {
            return Vec::new();
        }
        rx.await.unwrap_or_default()
    }

    /// Due time of `key`, if queued
    pub async fn due_at(&self, key: &RotationKey) -> Option<DateTime<Utc>> {
        self.snapshot()
            .await
            .into_iter()
            .find_map(|(queued, due_at)| (&queued == key).then_some(due_at))
    }
}

/// Background task owning the rotation queue
pub struct RotationScheduler<R: Rotator> {
    queue: RotationQueue,
    commands: mpsc::Receiver<Command>,
    handle: SchedulerHandle,
    rotator: Arc<R>,
    poll_interval: Duration,
    retry_delay: Duration,
    shutdown: CancellationToken,
}

impl<R: Rotator> RotationScheduler<R> {
    pub fn new(
        config: &BrokerConfig,
        handle: SchedulerHandle,
        commands: CommandReceiver,
        rotator: Arc<R>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue: RotationQueue::new(),
            commands: commands.rx,
            handle,
            rotator,
            poll_interval: config.poll_interval,
            retry_delay: config.retry_delay,
            shutdown,
        }
    }

    /// Run the poll loop on its own task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll loop; returns when the shutdown token is cancelled
    ///
    /// Rotation tasks already dispatched keep running after shutdown.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "Rotation scheduler started"
        );

        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    tracing::info!(queued = self.queue.len(), "Rotation scheduler shutting down");
                    return;
                }
                Some(command) = self.commands.recv() => self.apply(command),
                _ = ticker.tick() => self.dispatch_due(Utc::now()),
            }
        }
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Schedule { key, due_at } => {
                tracing::debug!(key = %key, due_at = %due_at, "Rotation scheduled");
                self.queue.push(key, due_at);
            }
            Command::Unschedule { key } => {
                if self.queue.remove(&key) {
                    tracing::debug!(key = %key, "Rotation unscheduled");
                }
            }
            Command::Snapshot { reply } => {
                let _ = reply.send(self.queue.snapshot());
            }
        }
    }

    fn dispatch_due(&mut self, now: DateTime<Utc>) {
        while let Some((key, due_at)) = self.queue.pop_due(now) {
            tracing::debug!(key = %key, due_at = %due_at, "Dispatching rotation");
            let rotator = Arc::clone(&self.rotator);
            let handle = self.handle.clone();
            let retry_delay = self.retry_delay;
            tokio::spawn(async move {
                rotate_and_requeue(rotator.as_ref(), &handle, key, retry_delay).await;
            });
        }
    }
}

async fn rotate_and_requeue<R: Rotator>(
    rotator: &R,
    handle: &SchedulerHandle,
    key: RotationKey,
    retry_delay: Duration,
) {
    let next = match rotator.rotate(&key).await {
        Ok(Some(period)) => {
            tracing::info!(key = %key, "Scheduled rotation completed");
            Some(period)
        }
        Ok(None) => {
            tracing::info!(key = %key, "Rotation target no longer scheduled");
            None
        }
        Err(e) => {
            tracing::error!(
                key = %key,
                error = %e,
                retry_in_ms = retry_delay.as_millis() as u64,
                "Scheduled rotation failed"
            );
            Some(retry_delay)
        }
    };

    if let Some(delay) = next {
        handle.schedule(key, due_after(Utc::now(), delay)).await;
    }
}

/// `now + delay`, saturating at the far end of the calendar
pub(crate) fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
