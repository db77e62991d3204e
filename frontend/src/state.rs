//! Messages funneled into the reconciler and notices sent back to the UI.

use sushi_console_types::{
    CpuTimings, EngineEvent, EngineInfo, MoveProcessorRequest, NotificationKind, ParameterInfo,
    PlayingMode, ProcessorId, ProcessorInfo, PropertyInfo, TrackId, TrackInfo,
};
use tokio::sync::{mpsc, oneshot};

use crate::error::{RemoteError, SyncError};
use crate::store::{StoredValue, ValueKey};

/// A track as returned by a full topology load. `None` marks a nested query
/// that failed; the reconciler keeps whatever it already had for that part.
#[derive(Debug, Clone)]
pub struct TrackSnapshot {
    pub info: TrackInfo,
    pub processors: Option<Vec<ProcessorInfo>>,
    pub parameters: Option<Vec<(ParameterInfo, Option<f64>)>>,
}

/// Parameters and properties of one processor with their current values.
#[derive(Debug, Clone, Default)]
pub struct ProcessorDetails {
    pub parameters: Vec<(ParameterInfo, Option<f64>)>,
    pub properties: Vec<(PropertyInfo, Option<String>)>,
}

/// Result of a query issued by the core.
#[derive(Debug, Clone)]
pub enum QueryResult {
    /// Full topology reload
    Topology {
        tracks: Vec<TrackSnapshot>,
        /// Write sequence number current when the load started
        issued_seq: u64,
    },
    /// Processor chain of a single track
    TrackProcessors {
        track_id: TrackId,
        processors: Vec<ProcessorInfo>,
    },
    /// On-demand load of one processor
    ProcessorDetails {
        processor_id: ProcessorId,
        details: ProcessorDetails,
        issued_seq: u64,
    },
    PlayingMode(PlayingMode),
    /// The query failed; previous state is retained
    Failed { context: String, error: RemoteError },
}

/// A value fetched by the poll loop.
#[derive(Debug, Clone)]
pub struct PollSample {
    pub key: ValueKey,
    pub value: StoredValue,
    /// Write sequence number current when the poll request was issued
    pub issued_seq: u64,
}

/// Everything the reconciler consumes. The inbox is the single entry point
/// for store mutations.
#[derive(Debug)]
pub enum SyncInput {
    /// Handshake succeeded
    Connected(EngineInfo),
    Query(QueryResult),
    Push(EngineEvent),
    Poll(PollSample),
    /// A poll request failed
    PollFailed { key: ValueKey, error: RemoteError },
    CpuSample(CpuTimings),
    CpuPollFailed(RemoteError),
    StreamLost {
        kind: NotificationKind,
        error: RemoteError,
    },
    StreamRestored(NotificationKind),
    /// Optimistic local write, applied before the remote call is issued
    LocalWrite {
        key: ValueKey,
        value: StoredValue,
        seq: u64,
    },
    WriteConfirmed {
        key: ValueKey,
        seq: u64,
    },
    WriteFailed {
        key: ValueKey,
        seq: u64,
        error: RemoteError,
    },
    /// Optimistic relocation of a processor ahead of a move request
    LocalMove(MoveProcessorRequest),
    /// The move request succeeded; the relocation is kept
    MoveSettled(ProcessorId),
    /// The move request failed; undo the relocation
    MoveFailed {
        processor_id: ProcessorId,
        error: RemoteError,
    },
    /// Tear-down: clear the store and stop the reconciler
    Disconnected,
    /// Answered once every earlier input has been applied
    Flush(oneshot::Sender<()>),
}

/// Follow-up queries requested by the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Refetch {
    AllTracks,
    TrackProcessors(TrackId),
}

/// Notices broadcast to the UI.
#[derive(Debug, Clone)]
pub enum SyncNotice {
    /// The store changed; re-render
    StoreChanged { revision: u64 },
    /// A local write was refused by the engine and has been reverted
    WriteRejected(SyncError),
    /// A notification stream failed
    CapabilityLost(SyncError),
    /// A notification stream was re-established
    CapabilityRestored(NotificationKind),
    Disconnected,
}

/// Sending half of the reconciler inbox.
#[derive(Clone)]
pub struct ReconcilerHandle {
    tx: mpsc::UnboundedSender<SyncInput>,
}

impl ReconcilerHandle {
    pub(crate) fn new(tx: mpsc::UnboundedSender<SyncInput>) -> Self {
        Self { tx }
    }

    /// Queue an input. Inputs sent after the reconciler stopped are dropped.
    pub(crate) fn send(&self, input: SyncInput) {
        if self.tx.send(input).is_err() {
            tracing::trace!("Reconciler stopped, input dropped");
        }
    }

    /// Wait until every input queued before this call has been applied.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        self.send(SyncInput::Flush(tx));
        // A closed channel means the reconciler is gone; nothing left to wait for
        let _ = rx.await;
    }
}
