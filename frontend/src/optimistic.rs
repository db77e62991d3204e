//! Optimistic writes.
//!
//! User edits land in the store before the engine has seen them. The ledger
//! tracks which values are still in flight so that polls cannot pull an
//! edit back and so that a rejected write can be undone to the last value
//! the engine confirmed.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::convert::{clamp_normalized, DomainExt};
use crate::error::{RemoteResult, SyncError, SyncResult};
use crate::remote::{with_deadline, SharedRemote};
use crate::state::{ReconcilerHandle, SyncInput};
use crate::store::{ParameterAddress, PropertyAddress, StoreReader, StoredValue, ValueKey};
use sushi_console_types::ProcessorId;

/// Whether two stored values differ by more than `epsilon`. Text and flags
/// compare exactly.
pub(crate) fn differs(a: &StoredValue, b: &StoredValue, epsilon: f64) -> bool {
    match (a, b) {
        (StoredValue::Normalized(x), StoredValue::Normalized(y)) => (x - y).abs() > epsilon,
        _ => a != b,
    }
}

/// Session-wide write sequence. Numbers start at 1; 0 means "no write yet".
#[derive(Debug, Clone, Default)]
pub struct WriteSequencer(Arc<AtomicU64>);

impl WriteSequencer {
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sequence number handed out so far.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
struct PendingWrite {
    latest: u64,
    /// Values sent during this episode by sequence number. Failed writes
    /// are removed; confirmed ones stay so their echoes can be recognized.
    sent: BTreeMap<u64, StoredValue>,
    /// Last value known to be on the engine
    baseline: Option<StoredValue>,
    /// Highest confirmed sequence number in this episode
    confirmed: u64,
    started: Instant,
}

/// Outcome of a write reply as seen by the ledger.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Resolution {
    /// The newest write for the key was confirmed
    Settled,
    /// An older write replied while a newer one is still in flight
    Superseded,
    /// The newest write failed; put this value back
    Revert(Option<StoredValue>),
    /// Nothing pending for this key (expired, reverted or removed)
    Unknown,
}

/// Classification of a pushed value against pending writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Echo {
    /// Engine echo of an older write than the one in flight
    Stale,
    /// Engine echo of the newest write
    Current,
    /// Not one of ours
    Foreign,
}

/// Pending optimistic writes, keyed by value.
#[derive(Debug)]
pub(crate) struct OptimisticLedger {
    pending: HashMap<ValueKey, PendingWrite>,
    last_issued: HashMap<ValueKey, u64>,
    timeout: Duration,
}

impl OptimisticLedger {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            pending: HashMap::new(),
            last_issued: HashMap::new(),
            timeout,
        }
    }

    /// Record a local write. `current` is the stored value it replaces.
    pub(crate) fn begin(
        &mut self,
        key: ValueKey,
        seq: u64,
        value: StoredValue,
        current: Option<StoredValue>,
        now: Instant,
    ) {
        self.last_issued.insert(key.clone(), seq);
        let entry = self.pending.entry(key).or_insert_with(|| PendingWrite {
            latest: seq,
            sent: BTreeMap::new(),
            baseline: current,
            confirmed: 0,
            started: now,
        });
        entry.latest = entry.latest.max(seq);
        entry.sent.insert(seq, value);
        entry.started = now;
    }

    pub(crate) fn confirm(&mut self, key: &ValueKey, seq: u64) -> Resolution {
        let Some(entry) = self.pending.get_mut(key) else {
            return Resolution::Unknown;
        };
        if seq == entry.latest {
            self.pending.remove(key);
            return Resolution::Settled;
        }
        let Some(value) = entry.sent.get(&seq).cloned() else {
            return Resolution::Unknown;
        };
        if seq > entry.confirmed {
            entry.confirmed = seq;
            entry.baseline = Some(value);
        }
        Resolution::Superseded
    }

    pub(crate) fn fail(&mut self, key: &ValueKey, seq: u64) -> Resolution {
        let Some(entry) = self.pending.get_mut(key) else {
            return Resolution::Unknown;
        };
        if seq == entry.latest {
            let baseline = entry.baseline.clone();
            self.pending.remove(key);
            return Resolution::Revert(baseline);
        }
        if entry.sent.remove(&seq).is_none() {
            return Resolution::Unknown;
        }
        Resolution::Superseded
    }

    /// Whether a pending write protects this key from poll samples.
    /// Expired entries are dropped.
    pub(crate) fn shields(&mut self, key: &ValueKey, now: Instant) -> bool {
        let Some(entry) = self.pending.get(key) else {
            return false;
        };
        if now.duration_since(entry.started) < self.timeout {
            return true;
        }
        debug!("Optimistic write for {} timed out", key);
        self.pending.remove(key);
        false
    }

    /// Whether a write to this key was issued after `issued_seq`.
    pub(crate) fn written_since(&self, key: &ValueKey, issued_seq: u64) -> bool {
        self.last_issued
            .get(key)
            .is_some_and(|&seq| seq > issued_seq)
    }

    pub(crate) fn classify_push(&self, key: &ValueKey, value: &StoredValue, epsilon: f64) -> Echo {
        let Some(entry) = self.pending.get(key) else {
            return Echo::Foreign;
        };
        for (&seq, sent) in entry.sent.iter().rev() {
            if !differs(sent, value, epsilon) {
                return if seq == entry.latest {
                    Echo::Current
                } else {
                    Echo::Stale
                };
            }
        }
        Echo::Foreign
    }

    /// The engine reported a value authoritatively; it becomes the revert
    /// target for this key.
    pub(crate) fn observe(&mut self, key: &ValueKey, value: StoredValue) {
        if let Some(entry) = self.pending.get_mut(key) {
            entry.baseline = Some(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_pending(&self, key: &ValueKey) -> bool {
        self.pending.contains_key(key)
    }

    /// Drop bookkeeping for keys rejected by `keep`.
    pub(crate) fn retain(&mut self, mut keep: impl FnMut(&ValueKey) -> bool) {
        self.pending.retain(|k, _| keep(k));
        self.last_issued.retain(|k, _| keep(k));
    }

    pub(crate) fn clear(&mut self) {
        self.pending.clear();
        self.last_issued.clear();
    }
}

/// Entry point for user-driven value changes.
///
/// Every method returns immediately: the local value goes to the reconciler
/// inbox and the remote call runs on a spawned task.
#[derive(Clone)]
pub struct WriteCoordinator {
    remote: SharedRemote,
    inbox: ReconcilerHandle,
    store: StoreReader,
    sequencer: WriteSequencer,
    deadline: Option<Duration>,
    token: CancellationToken,
    runtime: Handle,
}

impl WriteCoordinator {
    pub(crate) fn new(
        remote: SharedRemote,
        inbox: ReconcilerHandle,
        store: StoreReader,
        sequencer: WriteSequencer,
        deadline: Option<Duration>,
        token: CancellationToken,
        runtime: Handle,
    ) -> Self {
        Self {
            remote,
            inbox,
            store,
            sequencer,
            deadline,
            token,
            runtime,
        }
    }

    /// Set a parameter to a normalized value.
    pub fn set_parameter(&self, address: ParameterAddress, normalized: f64) -> SyncResult<u64> {
        self.ensure_known(&ValueKey::Parameter(address))?;
        let value = clamp_normalized(normalized);
        let remote = self.remote.clone();
        Ok(self.dispatch(
            ValueKey::Parameter(address),
            StoredValue::Normalized(value),
            async move {
                remote
                    .set_parameter_value(address.processor_id, address.parameter_id, value)
                    .await
            },
        ))
    }

    /// Set a parameter from a value in its domain (dB, Hz, ...).
    pub fn set_parameter_domain(&self, address: ParameterAddress, domain: f64) -> SyncResult<u64> {
        let normalized = {
            let store = self.store.read();
            let param = store
                .parameter(address)
                .ok_or_else(|| unknown(&ValueKey::Parameter(address)))?;
            param.normalize(domain)
        };
        trace!(
            "Domain value {} for {}/{} normalizes to {:.4}",
            domain,
            address.processor_id,
            address.parameter_id,
            normalized
        );
        self.set_parameter(address, normalized)
    }

    /// Flip a boolean-style parameter (mute): above 0.5 goes to 0, else 1.
    pub fn toggle_parameter(&self, address: ParameterAddress) -> SyncResult<u64> {
        let current = self
            .store
            .read()
            .parameter(address)
            .map(|p| p.value)
            .ok_or_else(|| unknown(&ValueKey::Parameter(address)))?;
        let next = if current > 0.5 { 0.0 } else { 1.0 };
        self.set_parameter(address, next)
    }

    pub fn set_property(
        &self,
        address: PropertyAddress,
        value: impl Into<String>,
    ) -> SyncResult<u64> {
        let key = ValueKey::Property(address.clone());
        self.ensure_known(&key)?;
        let value = value.into();
        let remote = self.remote.clone();
        let sent = value.clone();
        Ok(self.dispatch(key, StoredValue::Text(value), async move {
            remote
                .set_property_value(address.processor_id, &address.name, &sent)
                .await
        }))
    }

    pub fn set_bypass(&self, processor_id: ProcessorId, bypassed: bool) -> SyncResult<u64> {
        let key = ValueKey::Bypass(processor_id);
        self.ensure_known(&key)?;
        let remote = self.remote.clone();
        Ok(self.dispatch(key, StoredValue::Flag(bypassed), async move {
            remote.set_processor_bypass(processor_id, bypassed).await
        }))
    }

    fn ensure_known(&self, key: &ValueKey) -> SyncResult<()> {
        let store = self.store.read();
        if !store.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if !store.contains(key) {
            return Err(unknown(key));
        }
        Ok(())
    }

    fn dispatch<F>(&self, key: ValueKey, value: StoredValue, call: F) -> u64
    where
        F: Future<Output = RemoteResult<()>> + Send + 'static,
    {
        let seq = self.sequencer.next();
        trace!("Write #{} to {}: {:?}", seq, key, value);
        self.inbox.send(SyncInput::LocalWrite {
            key: key.clone(),
            value,
            seq,
        });

        let inbox = self.inbox.clone();
        let token = self.token.clone();
        let deadline = self.deadline;
        self.runtime.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = with_deadline(deadline, call) => match result {
                    Ok(()) => inbox.send(SyncInput::WriteConfirmed { key, seq }),
                    Err(error) => inbox.send(SyncInput::WriteFailed { key, seq, error }),
                },
            }
        });
        seq
    }
}

fn unknown(key: &ValueKey) -> SyncError {
    SyncError::MalformedUpdate(key.to_string())
}
