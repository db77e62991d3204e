//! Fixed-cadence polling of tracked values.
//!
//! Polling backs up push notifications: pushes can be lost across stream
//! failures, a poll always converges. The loop sleeps while nothing is
//! tracked.

use futures_util::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::RemoteResult;
use crate::optimistic::WriteSequencer;
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{PollSample, ReconcilerHandle, SyncInput};
use crate::store::{StoredValue, ValueKey};

/// Reference-counted set of values being polled.
#[derive(Clone, Default)]
pub(crate) struct TrackedValues {
    keys: Arc<Mutex<HashMap<ValueKey, usize>>>,
    changed: Arc<Notify>,
}

impl TrackedValues {
    pub(crate) fn track(&self, key: ValueKey) {
        *self.keys.lock().entry(key).or_insert(0) += 1;
        self.changed.notify_one();
    }

    /// Returns `false` when the key was not tracked.
    pub(crate) fn untrack(&self, key: &ValueKey) -> bool {
        let mut keys = self.keys.lock();
        match keys.get_mut(key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                true
            }
            Some(_) => {
                keys.remove(key);
                true
            }
            None => false,
        }
    }

    pub(crate) fn keys(&self) -> Vec<ValueKey> {
        self.keys.lock().keys().cloned().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }

    async fn changed(&self) {
        self.changed.notified().await
    }
}

pub(crate) struct PollLoop {
    pub(crate) remote: SharedRemote,
    pub(crate) inbox: ReconcilerHandle,
    pub(crate) tracked: TrackedValues,
    pub(crate) sequencer: WriteSequencer,
    pub(crate) interval: Duration,
    pub(crate) deadline: Option<Duration>,
    pub(crate) token: CancellationToken,
}

impl PollLoop {
    pub(crate) async fn run(self) {
        loop {
            while self.tracked.is_empty() {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = self.tracked.changed() => {}
                }
            }
            debug!("Poll loop active");

            let mut ticker = tokio::time::interval(self.interval);
            // A cycle still running when the next tick fires skips that tick
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = ticker.tick() => {}
                }
                let keys = self.tracked.keys();
                if keys.is_empty() {
                    debug!("Nothing tracked, poll loop idle");
                    break;
                }
                tokio::select! {
                    _ = self.token.cancelled() => return,
                    _ = self.cycle(keys) => {}
                }
            }
        }
    }

    async fn cycle(&self, keys: Vec<ValueKey>) {
        let issued_seq = self.sequencer.current();
        trace!("Poll cycle over {} values", keys.len());

        let values = join_all(keys.into_iter().map(|key| async move {
            let result = self.sample(&key).await;
            (key, result)
        }));
        let cpu = with_deadline(self.deadline, self.remote.get_engine_cpu_timings());
        let (values, cpu) = tokio::join!(values, cpu);

        for (key, result) in values {
            match result {
                Some(Ok(value)) => self.inbox.send(SyncInput::Poll(PollSample {
                    key,
                    value,
                    issued_seq,
                })),
                Some(Err(error)) => self.inbox.send(SyncInput::PollFailed { key, error }),
                None => {}
            }
        }
        match cpu {
            Ok(timings) => self.inbox.send(SyncInput::CpuSample(timings)),
            Err(error) => self.inbox.send(SyncInput::CpuPollFailed(error)),
        }
    }

    async fn sample(&self, key: &ValueKey) -> Option<RemoteResult<StoredValue>> {
        let result = match key {
            ValueKey::Parameter(a) => with_deadline(
                self.deadline,
                self.remote.get_parameter_value(a.processor_id, a.parameter_id),
            )
            .await
            .map(StoredValue::Normalized),
            ValueKey::Property(a) => with_deadline(
                self.deadline,
                self.remote.get_property_value(a.processor_id, &a.name),
            )
            .await
            .map(StoredValue::Text),
            // No query exists for bypass state
            ValueKey::Bypass(_) => return None,
        };
        Some(result)
    }
}
