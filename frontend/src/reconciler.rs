//! The reconciler: single writer of the topology store.
//!
//! Query results, pushed events, poll samples and local writes all arrive
//! through one inbox and are applied in order. Each input is applied under
//! one write lock so readers never observe half an update.

use std::collections::{HashMap, HashSet};
use sushi_console_types::{
    EngineEvent, NotificationKind, Parameter, Processor, ProcessorId, Property, Track, TrackId,
};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::SyncConfig;
use crate::convert::clamp_normalized;
use crate::error::SyncError;
use crate::loader::Loader;
use crate::optimistic::{differs, Echo, OptimisticLedger, Resolution};
use crate::state::{
    PollSample, ProcessorDetails, QueryResult, Refetch, SyncInput, SyncNotice, TrackSnapshot,
};
use crate::store::{
    CpuLoad, ParameterAddress, PropertyAddress, SharedStore, StoredValue, TopologyStore, ValueKey,
};

pub(crate) struct Reconciler {
    store: SharedStore,
    ledger: OptimisticLedger,
    /// Optimistically relocated processors and where they came from
    pending_moves: HashMap<ProcessorId, (TrackId, usize)>,
    cpu_failures: u32,
    cpu_failure_threshold: u32,
    epsilon: f64,
    notices: broadcast::Sender<SyncNotice>,
    stopped: bool,
}

impl Reconciler {
    pub(crate) fn new(
        store: SharedStore,
        config: &SyncConfig,
        notices: broadcast::Sender<SyncNotice>,
    ) -> Self {
        Self {
            store,
            ledger: OptimisticLedger::new(config.optimistic_timeout()),
            pending_moves: HashMap::new(),
            cpu_failures: 0,
            cpu_failure_threshold: config.cpu_failure_threshold.max(1),
            epsilon: config.parameter_epsilon,
            notices,
            stopped: false,
        }
    }

    /// Drain the inbox until a disconnect is applied.
    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<SyncInput>,
        loader: Loader,
    ) {
        while let Some(input) = inbox.recv().await {
            for refetch in self.apply(input) {
                loader.spawn_refetch(refetch);
            }
            if self.stopped {
                break;
            }
        }
        debug!("Reconciler stopped");
    }

    /// Apply one input. Returns the follow-up queries it calls for.
    pub(crate) fn apply(&mut self, input: SyncInput) -> Vec<Refetch> {
        if let SyncInput::Flush(done) = input {
            let _ = done.send(());
            return Vec::new();
        }

        let mut refetch = Vec::new();
        let mut notices = Vec::new();
        let shared = self.store.clone();
        let (before, after) = {
            let mut store = shared.write();
            let before = store.revision();
            let accepts = store.is_connected()
                || matches!(input, SyncInput::Connected(_) | SyncInput::Disconnected);
            if accepts {
                self.handle(&mut store, input, &mut refetch, &mut notices);
            } else {
                trace!("Not connected, dropping {:?}", input);
            }
            (before, store.revision())
        };

        if after != before {
            let _ = self
                .notices
                .send(SyncNotice::StoreChanged { revision: after });
        }
        for notice in notices {
            let _ = self.notices.send(notice);
        }
        refetch
    }

    fn handle(
        &mut self,
        store: &mut TopologyStore,
        input: SyncInput,
        refetch: &mut Vec<Refetch>,
        notices: &mut Vec<SyncNotice>,
    ) {
        match input {
            SyncInput::Connected(info) => {
                info!(
                    "Connected to engine {} ({} Hz)",
                    info.version, info.sample_rate
                );
                self.cpu_failures = 0;
                store.set_connected(true);
                store.set_engine_info(info);
            }
            SyncInput::Query(result) => self.apply_query(store, result),
            SyncInput::Push(event) => self.apply_event(store, event, refetch),
            SyncInput::Poll(sample) => self.apply_poll(store, sample),
            SyncInput::PollFailed { key, error } => {
                warn!("{}", SyncError::transient(format!("poll {}", key), error));
            }
            SyncInput::CpuSample(timings) => {
                self.cpu_failures = 0;
                store.set_cpu_load(CpuLoad::Known(timings));
            }
            SyncInput::CpuPollFailed(error) => {
                self.cpu_failures += 1;
                warn!(
                    "{} ({} in a row)",
                    SyncError::transient("poll CPU timings", error),
                    self.cpu_failures
                );
                if self.cpu_failures >= self.cpu_failure_threshold {
                    store.set_cpu_load(CpuLoad::Unknown);
                }
            }
            SyncInput::StreamLost { kind, error } => {
                let err = SyncError::NotificationStream {
                    kind,
                    source: error,
                };
                error!("{}", err);
                store.mark_stream(kind, true);
                if kind == NotificationKind::CpuTiming {
                    store.set_cpu_load(CpuLoad::Unknown);
                }
                notices.push(SyncNotice::CapabilityLost(err));
            }
            SyncInput::StreamRestored(kind) => {
                info!("Subscription to {} re-established", kind.name());
                if store.mark_stream(kind, false) {
                    notices.push(SyncNotice::CapabilityRestored(kind));
                }
            }
            SyncInput::LocalWrite { key, value, seq } => {
                let Some(current) = store.read_value(&key) else {
                    debug!("Local write #{} to unknown {} dropped", seq, key);
                    return;
                };
                self.ledger
                    .begin(key.clone(), seq, value.clone(), Some(current), Instant::now());
                store.write_value(&key, &value);
            }
            SyncInput::WriteConfirmed { key, seq } => match self.ledger.confirm(&key, seq) {
                Resolution::Superseded => trace!("Write #{} to {} confirmed late", seq, key),
                other => trace!("Write #{} to {} confirmed: {:?}", seq, key, other),
            },
            SyncInput::WriteFailed { key, seq, error } => {
                let err = SyncError::rejected(key.to_string(), error);
                match self.ledger.fail(&key, seq) {
                    Resolution::Superseded => {
                        debug!("Write #{} superseded before it failed: {}", seq, err);
                        return;
                    }
                    Resolution::Revert(Some(previous)) => {
                        store.write_value(&key, &previous);
                    }
                    _ => {}
                }
                warn!("{}", err);
                notices.push(SyncNotice::WriteRejected(err));
            }
            SyncInput::LocalMove(request) => {
                let on_source = store
                    .track(request.source_track_id)
                    .is_some_and(|t| t.processor(request.processor_id).is_some());
                if !on_source {
                    debug!(
                        "Processor {} is not on track {}, move not applied locally",
                        request.processor_id, request.source_track_id
                    );
                    return;
                }
                if let Some(origin) = store.relocate_processor(
                    request.processor_id,
                    request.dest_track_id,
                    request.insertion,
                ) {
                    self.pending_moves
                        .entry(request.processor_id)
                        .or_insert(origin);
                }
            }
            SyncInput::MoveSettled(processor_id) => {
                self.pending_moves.remove(&processor_id);
            }
            SyncInput::MoveFailed {
                processor_id,
                error,
            } => {
                warn!("Moving processor {} failed: {}", processor_id, error);
                if let Some((track_id, index)) = self.pending_moves.remove(&processor_id) {
                    store.restore_processor(processor_id, track_id, index);
                }
            }
            SyncInput::Disconnected => {
                info!("Disconnected, clearing topology");
                store.clear();
                self.ledger.clear();
                self.pending_moves.clear();
                self.cpu_failures = 0;
                self.stopped = true;
                notices.push(SyncNotice::Disconnected);
            }
            SyncInput::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    // ---- Queries ----

    fn apply_query(&mut self, store: &mut TopologyStore, result: QueryResult) {
        match result {
            QueryResult::Topology { tracks, issued_seq } => {
                let tracks = self.build_tracks(store, tracks, issued_seq);
                if store.replace_tracks(tracks) {
                    info!("Topology reloaded: {} tracks", store.tracks().len());
                }
                self.prune(store);
            }
            QueryResult::TrackProcessors {
                track_id,
                processors,
            } => {
                if store.track(track_id).is_none() {
                    debug!("{}", SyncError::MalformedUpdate(format!("track {}", track_id)));
                    return;
                }
                let mut chain: Vec<Processor> = processors
                    .iter()
                    .map(|info| Processor::from_info(info, track_id))
                    .collect();
                self.protect_moves(store, track_id, &mut chain);
                store.set_track_processors(track_id, chain);
                self.prune(store);
            }
            QueryResult::ProcessorDetails {
                processor_id,
                details,
                issued_seq,
            } => self.apply_details(store, processor_id, details, issued_seq),
            QueryResult::PlayingMode(mode) => {
                store.set_playing_mode(mode);
            }
            QueryResult::Failed { context, error } => {
                warn!("{}", SyncError::transient(context, error));
            }
        }
    }

    fn build_tracks(
        &mut self,
        store: &TopologyStore,
        snapshots: Vec<TrackSnapshot>,
        issued_seq: u64,
    ) -> Vec<Track> {
        let now = Instant::now();
        let mut seen: HashSet<ProcessorId> = HashSet::new();
        let mut tracks = Vec::with_capacity(snapshots.len());

        for snapshot in snapshots {
            let track_id = snapshot.info.id;
            let previous = store.track(track_id);
            let mut track = Track::from_info(&snapshot.info);

            let mut chain = match snapshot.processors {
                Some(list) => list
                    .iter()
                    .map(|info| {
                        let mut processor = Processor::from_info(info, track_id);
                        if let Some(known) = store.processor(info.id) {
                            processor.parameters = known.parameters.clone();
                            processor.properties = known.properties.clone();
                        }
                        processor
                    })
                    .collect(),
                None => previous.map(|t| t.processors.clone()).unwrap_or_default(),
            };
            self.protect_moves(store, track_id, &mut chain);
            chain.retain(|p| seen.insert(p.id));
            track.processors = chain;

            track.parameters = match snapshot.parameters {
                Some(list) => list
                    .iter()
                    .map(|(info, value)| {
                        let key = ValueKey::Parameter(ParameterAddress::new(track_id, info.id));
                        let stored = previous.and_then(|t| t.parameter(info.id)).map(|p| p.value);
                        let value = if self.keeps_local(&key, issued_seq, now) {
                            stored.or(*value)
                        } else {
                            value.or(stored)
                        };
                        Parameter::from_info(info, clamp_normalized(value.unwrap_or(0.0)))
                    })
                    .collect(),
                None => previous.map(|t| t.parameters.clone()).unwrap_or_default(),
            };

            tracks.push(track);
        }
        tracks
    }

    fn apply_details(
        &mut self,
        store: &mut TopologyStore,
        processor_id: ProcessorId,
        details: ProcessorDetails,
        issued_seq: u64,
    ) {
        let Some(known) = store.processor(processor_id) else {
            debug!(
                "{}",
                SyncError::MalformedUpdate(format!("processor {}", processor_id))
            );
            return;
        };
        let now = Instant::now();

        let parameters = details
            .parameters
            .iter()
            .map(|(info, value)| {
                let key = ValueKey::Parameter(ParameterAddress::new(processor_id, info.id));
                let stored = known.parameter(info.id).map(|p| p.value);
                let value = if self.keeps_local(&key, issued_seq, now) {
                    stored.or(*value)
                } else {
                    value.or(stored)
                };
                Parameter::from_info(info, clamp_normalized(value.unwrap_or(0.0)))
            })
            .collect();

        let properties = details
            .properties
            .iter()
            .map(|(info, value)| {
                let key = ValueKey::Property(PropertyAddress::new(processor_id, &info.name));
                let stored = known.property_value(&info.name).map(str::to_string);
                let value = if self.keeps_local(&key, issued_seq, now) {
                    stored.or_else(|| value.clone())
                } else {
                    value.clone().or(stored)
                };
                Property {
                    id: info.id,
                    name: info.name.clone(),
                    value: value.unwrap_or_default(),
                }
            })
            .collect();

        store.set_processor_details(processor_id, parameters, properties);
    }

    /// Whether a queried value must yield to the stored one: a local write
    /// went out after the query was issued, or one is still pending.
    fn keeps_local(&mut self, key: &ValueKey, issued_seq: u64, now: Instant) -> bool {
        self.ledger.written_since(key, issued_seq) || self.ledger.shields(key, now)
    }

    /// Keep optimistically moved processors where the user dropped them
    /// until their move request settles.
    fn protect_moves(&self, store: &TopologyStore, track_id: TrackId, chain: &mut Vec<Processor>) {
        for &id in self.pending_moves.keys() {
            let Some(current) = store.processor(id) else {
                continue;
            };
            chain.retain(|p| p.id != id);
            if current.track_id == track_id {
                let at = store
                    .track(track_id)
                    .and_then(|t| t.processor_index(id))
                    .unwrap_or(chain.len())
                    .min(chain.len());
                chain.insert(at, current.clone());
            }
        }
    }

    /// Forget pending bookkeeping for entities no longer in the store.
    fn prune(&mut self, store: &TopologyStore) {
        self.ledger.retain(|key| store.contains(key));
        self.pending_moves
            .retain(|id, _| store.processor(*id).is_some());
    }

    // ---- Push ----

    fn apply_event(
        &mut self,
        store: &mut TopologyStore,
        event: EngineEvent,
        refetch: &mut Vec<Refetch>,
    ) {
        trace!("{}", event.description());
        match event {
            EngineEvent::ParameterChanged {
                processor_id,
                parameter_id,
                normalized_value,
                ..
            } => {
                let key = ValueKey::Parameter(ParameterAddress::new(processor_id, parameter_id));
                let value = StoredValue::Normalized(clamp_normalized(normalized_value));
                self.apply_pushed_value(store, key, value);
            }
            EngineEvent::PropertyChanged {
                processor_id,
                property_id,
                value,
            } => {
                let name = store
                    .processor(processor_id)
                    .and_then(|p| p.property_by_id(property_id))
                    .map(|p| p.name.clone());
                let Some(name) = name else {
                    debug!(
                        "{}",
                        SyncError::MalformedUpdate(format!(
                            "property {} of processor {}",
                            property_id, processor_id
                        ))
                    );
                    return;
                };
                let key = ValueKey::Property(PropertyAddress::new(processor_id, name));
                self.apply_pushed_value(store, key, StoredValue::Text(value));
            }
            EngineEvent::TrackAdded { track_id } => {
                debug!("Track {} added, reloading topology", track_id);
                refetch.push(Refetch::AllTracks);
            }
            EngineEvent::TrackDeleted { track_id } => {
                if store.remove_track(track_id).is_some() {
                    self.prune(store);
                } else {
                    debug!("{}", SyncError::MalformedUpdate(format!("track {}", track_id)));
                }
            }
            EngineEvent::ProcessorAdded {
                processor_id,
                track_id,
            } => {
                let Some(track) = store.track(track_id) else {
                    debug!("{}", SyncError::MalformedUpdate(format!("track {}", track_id)));
                    return;
                };
                if track.processor(processor_id).is_some() {
                    trace!("Processor {} already on track {}", processor_id, track_id);
                    return;
                }
                refetch.push(Refetch::TrackProcessors(track_id));
            }
            EngineEvent::ProcessorDeleted {
                processor_id,
                track_id,
            } => {
                if store.remove_processor(processor_id, track_id) {
                    self.prune(store);
                } else {
                    debug!(
                        "Processor {} not on track {}, nothing to delete",
                        processor_id, track_id
                    );
                }
            }
            EngineEvent::CpuLoadChanged(timings) => {
                self.cpu_failures = 0;
                store.set_cpu_load(CpuLoad::Known(timings));
            }
        }
    }

    fn apply_pushed_value(
        &mut self,
        store: &mut TopologyStore,
        key: ValueKey,
        value: StoredValue,
    ) {
        if !store.contains(&key) {
            debug!("{}", SyncError::MalformedUpdate(key.to_string()));
            return;
        }
        let echo = self.ledger.classify_push(&key, &value, self.epsilon);
        self.ledger.observe(&key, value.clone());
        if echo == Echo::Stale {
            trace!("Ignoring echo of an older write to {}", key);
            return;
        }
        store.write_value(&key, &value);
    }

    // ---- Poll ----

    fn apply_poll(&mut self, store: &mut TopologyStore, sample: PollSample) {
        let PollSample {
            key,
            value,
            issued_seq,
        } = sample;
        let Some(current) = store.read_value(&key) else {
            debug!("{}", SyncError::MalformedUpdate(key.to_string()));
            return;
        };
        if self.ledger.written_since(&key, issued_seq) {
            trace!("Poll sample for {} predates a local write", key);
            return;
        }
        if self.ledger.shields(&key, Instant::now()) {
            trace!("Poll sample for {} held back by a pending write", key);
            return;
        }
        if differs(&current, &value, self.epsilon) {
            store.write_value(&key, &value);
        }
    }
}
