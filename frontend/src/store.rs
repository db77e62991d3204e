//! Topology store: the local mirror of engine state.
//!
//! Only the reconciler mutates the store (the write methods are crate-private
//! and the reconciler task is their only caller). Everyone else reads through
//! a [`StoreReader`].

use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashSet;
use std::sync::Arc;
use sushi_console_types::{
    CpuTimings, EngineInfo, Insertion, NotificationKind, Parameter, ParameterId, PlayingMode,
    Processor, ProcessorId, Property, Track, TrackId,
};

use crate::convert::clamp_normalized;

/// Address of a parameter. Track-level parameters use the track id as
/// `processor_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParameterAddress {
    pub processor_id: ProcessorId,
    pub parameter_id: ParameterId,
}

impl ParameterAddress {
    pub fn new(processor_id: ProcessorId, parameter_id: ParameterId) -> Self {
        Self {
            processor_id,
            parameter_id,
        }
    }
}

/// Address of a property by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyAddress {
    pub processor_id: ProcessorId,
    pub name: String,
}

impl PropertyAddress {
    pub fn new(processor_id: ProcessorId, name: impl Into<String>) -> Self {
        Self {
            processor_id,
            name: name.into(),
        }
    }
}

/// Any individually writable value in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ValueKey {
    Parameter(ParameterAddress),
    Property(PropertyAddress),
    Bypass(ProcessorId),
}

impl std::fmt::Display for ValueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValueKey::Parameter(a) => {
                write!(f, "parameter {}/{}", a.processor_id, a.parameter_id)
            }
            ValueKey::Property(a) => write!(f, "property {}/{}", a.processor_id, a.name),
            ValueKey::Bypass(id) => write!(f, "bypass of processor {}", id),
        }
    }
}

/// A value held under a [`ValueKey`].
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    /// Normalized parameter value
    Normalized(f64),
    Text(String),
    Flag(bool),
}

/// CPU load as surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum CpuLoad {
    /// No trustworthy sample; displayed as 0
    #[default]
    Unknown,
    Known(CpuTimings),
}

impl CpuLoad {
    /// Average load for display. Unknown load is reported as 0 rather than
    /// a guessed value.
    pub fn display(&self) -> f32 {
        match self {
            CpuLoad::Unknown => 0.0,
            CpuLoad::Known(t) => t.average,
        }
    }
}

/// Local mirror of the engine topology.
#[derive(Debug, Default)]
pub struct TopologyStore {
    connected: bool,
    engine_info: Option<EngineInfo>,
    tracks: Vec<Track>,
    cpu: CpuLoad,
    playing_mode: Option<PlayingMode>,
    lost_streams: HashSet<NotificationKind>,
    /// Bumped on every effective change
    revision: u64,
}

impl TopologyStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- Reads ----

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn engine_info(&self) -> Option<&EngineInfo> {
        self.engine_info.as_ref()
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn track(&self, id: TrackId) -> Option<&Track> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn processor(&self, id: ProcessorId) -> Option<&Processor> {
        self.tracks.iter().find_map(|t| t.processor(id))
    }

    pub fn cpu_load(&self) -> CpuLoad {
        self.cpu
    }

    pub fn playing_mode(&self) -> Option<PlayingMode> {
        self.playing_mode
    }

    /// Notification kinds whose subscription failed.
    pub fn lost_streams(&self) -> &HashSet<NotificationKind> {
        &self.lost_streams
    }

    /// Resolve a parameter address. Track-level parameters take precedence
    /// when an id names both a track and a processor.
    pub fn parameter(&self, address: ParameterAddress) -> Option<&Parameter> {
        if let Some(track) = self.track(address.processor_id) {
            if let Some(p) = track.parameter(address.parameter_id) {
                return Some(p);
            }
        }
        self.processor(address.processor_id)?
            .parameter(address.parameter_id)
    }

    pub fn property(&self, address: &PropertyAddress) -> Option<&Property> {
        self.processor(address.processor_id)?
            .properties
            .get(&address.name)
    }

    pub fn read_value(&self, key: &ValueKey) -> Option<StoredValue> {
        match key {
            ValueKey::Parameter(a) => self.parameter(*a).map(|p| StoredValue::Normalized(p.value)),
            ValueKey::Property(a) => self
                .property(a)
                .map(|p| StoredValue::Text(p.value.clone())),
            ValueKey::Bypass(id) => self.processor(*id).map(|p| StoredValue::Flag(p.bypassed)),
        }
    }

    /// Whether the key names an entity present in the store.
    pub fn contains(&self, key: &ValueKey) -> bool {
        self.read_value(key).is_some()
    }

    /// Total number of processor entries with this id across all tracks.
    pub fn processor_copies(&self, id: ProcessorId) -> usize {
        self.tracks
            .iter()
            .map(|t| t.processors.iter().filter(|p| p.id == id).count())
            .sum()
    }

    // ---- Writes (reconciler only) ----

    fn touch(&mut self) {
        self.revision += 1;
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        if self.connected != connected {
            self.connected = connected;
            self.touch();
        }
    }

    pub(crate) fn set_engine_info(&mut self, info: EngineInfo) -> bool {
        if self.engine_info.as_ref() == Some(&info) {
            return false;
        }
        self.engine_info = Some(info);
        self.touch();
        true
    }

    pub(crate) fn set_cpu_load(&mut self, load: CpuLoad) -> bool {
        if self.cpu == load {
            return false;
        }
        self.cpu = load;
        self.touch();
        true
    }

    pub(crate) fn set_playing_mode(&mut self, mode: PlayingMode) -> bool {
        if self.playing_mode == Some(mode) {
            return false;
        }
        self.playing_mode = Some(mode);
        self.touch();
        true
    }

    pub(crate) fn mark_stream(&mut self, kind: NotificationKind, lost: bool) -> bool {
        let changed = if lost {
            self.lost_streams.insert(kind)
        } else {
            self.lost_streams.remove(&kind)
        };
        if changed {
            self.touch();
        }
        changed
    }

    /// Replace the whole topology.
    pub(crate) fn replace_tracks(&mut self, tracks: Vec<Track>) -> bool {
        if self.tracks == tracks {
            return false;
        }
        self.tracks = tracks;
        self.touch();
        true
    }

    /// Remove a track together with all of its processors and parameters.
    pub(crate) fn remove_track(&mut self, id: TrackId) -> Option<Track> {
        let index = self.tracks.iter().position(|t| t.id == id)?;
        let track = self.tracks.remove(index);
        self.touch();
        Some(track)
    }

    /// Replace the processor chain of one track.
    ///
    /// Processors already known keep their loaded parameters and properties.
    /// Any copy of these processors on another track is dropped so a
    /// processor is never contained twice.
    pub(crate) fn set_track_processors(
        &mut self,
        track_id: TrackId,
        mut processors: Vec<Processor>,
    ) -> bool {
        let Some(dest) = self.tracks.iter().position(|t| t.id == track_id) else {
            return false;
        };

        let incoming: HashSet<ProcessorId> = processors.iter().map(|p| p.id).collect();
        let previous = std::mem::take(&mut self.tracks[dest].processors);
        let mut known: Vec<Processor> = previous.clone();
        let mut moved_in = false;
        for track in &mut self.tracks {
            track.processors.retain(|p| {
                if incoming.contains(&p.id) {
                    known.push(p.clone());
                    moved_in = true;
                    false
                } else {
                    true
                }
            });
        }

        for processor in &mut processors {
            processor.track_id = track_id;
            if let Some(existing) = known.iter().find(|p| p.id == processor.id) {
                if processor.parameters.is_empty() {
                    processor.parameters = existing.parameters.clone();
                }
                if processor.properties.is_empty() {
                    processor.properties = existing.properties.clone();
                }
            }
        }

        let changed = moved_in || previous != processors;
        self.tracks[dest].processors = processors;
        if changed {
            self.touch();
        }
        changed
    }

    /// Remove a processor from the given track. Returns `false` when the
    /// processor is not on that track (already gone or already moved).
    pub(crate) fn remove_processor(&mut self, id: ProcessorId, track_id: TrackId) -> bool {
        let Some(track) = self.tracks.iter_mut().find(|t| t.id == track_id) else {
            return false;
        };
        let before = track.processors.len();
        track.processors.retain(|p| p.id != id);
        if track.processors.len() == before {
            return false;
        }
        self.touch();
        true
    }

    /// Move a processor to another track (or another position on the same
    /// track). Returns the original `(track, index)` so the move can be undone.
    pub(crate) fn relocate_processor(
        &mut self,
        id: ProcessorId,
        dest_track_id: TrackId,
        insertion: Insertion,
    ) -> Option<(TrackId, usize)> {
        let dest = self.tracks.iter().position(|t| t.id == dest_track_id)?;
        let (source, index) = self.locate(id)?;
        let original = (self.tracks[source].id, index);

        let mut processor = self.tracks[source].processors.remove(index);
        processor.track_id = dest_track_id;

        let chain = &mut self.tracks[dest].processors;
        let at = match insertion {
            Insertion::End => chain.len(),
            Insertion::BeforeProcessor(anchor) => chain
                .iter()
                .position(|p| p.id == anchor)
                .unwrap_or(chain.len()),
        };
        chain.insert(at, processor);
        self.touch();
        Some(original)
    }

    /// Put a processor back at an exact position (undo of a relocation).
    pub(crate) fn restore_processor(
        &mut self,
        id: ProcessorId,
        track_id: TrackId,
        index: usize,
    ) -> bool {
        let Some(dest) = self.tracks.iter().position(|t| t.id == track_id) else {
            return false;
        };
        let Some((source, current)) = self.locate(id) else {
            return false;
        };
        if source == dest && current == index {
            return false;
        }

        let mut processor = self.tracks[source].processors.remove(current);
        processor.track_id = track_id;
        let chain = &mut self.tracks[dest].processors;
        let at = index.min(chain.len());
        chain.insert(at, processor);
        self.touch();
        true
    }

    /// `(track index, processor index)` of a processor.
    fn locate(&self, id: ProcessorId) -> Option<(usize, usize)> {
        self.tracks
            .iter()
            .enumerate()
            .find_map(|(ti, t)| t.processor_index(id).map(|pi| (ti, pi)))
    }

    /// Merge freshly loaded parameters and properties into a processor.
    pub(crate) fn set_processor_details(
        &mut self,
        id: ProcessorId,
        parameters: Vec<Parameter>,
        properties: Vec<Property>,
    ) -> bool {
        let Some(processor) = self.processor_mut(id) else {
            return false;
        };
        let properties = properties
            .into_iter()
            .map(|p| (p.name.clone(), p))
            .collect();
        if processor.parameters == parameters && processor.properties == properties {
            return false;
        }
        processor.parameters = parameters;
        processor.properties = properties;
        self.touch();
        true
    }

    /// Write a single value. `None` when the key is unknown, otherwise
    /// whether the stored value changed.
    pub(crate) fn write_value(&mut self, key: &ValueKey, value: &StoredValue) -> Option<bool> {
        let changed = match (key, value) {
            (ValueKey::Parameter(a), StoredValue::Normalized(v)) => {
                let param = self.parameter_mut(*a)?;
                let v = clamp_normalized(*v);
                if param.value == v {
                    false
                } else {
                    param.value = v;
                    true
                }
            }
            (ValueKey::Property(a), StoredValue::Text(v)) => {
                let prop = self
                    .processor_mut(a.processor_id)?
                    .properties
                    .get_mut(&a.name)?;
                if &prop.value == v {
                    false
                } else {
                    prop.value = v.clone();
                    true
                }
            }
            (ValueKey::Bypass(id), StoredValue::Flag(b)) => {
                let processor = self.processor_mut(*id)?;
                if processor.bypassed == *b {
                    false
                } else {
                    processor.bypassed = *b;
                    true
                }
            }
            _ => return None,
        };
        if changed {
            self.touch();
        }
        Some(changed)
    }

    /// Drop everything. Used on disconnect.
    pub(crate) fn clear(&mut self) {
        self.connected = false;
        self.engine_info = None;
        self.tracks.clear();
        self.cpu = CpuLoad::Unknown;
        self.playing_mode = None;
        self.lost_streams.clear();
        self.touch();
    }

    fn processor_mut(&mut self, id: ProcessorId) -> Option<&mut Processor> {
        self.tracks
            .iter_mut()
            .find_map(|t| t.processors.iter_mut().find(|p| p.id == id))
    }

    fn parameter_mut(&mut self, address: ParameterAddress) -> Option<&mut Parameter> {
        let on_track = self
            .tracks
            .iter()
            .any(|t| t.id == address.processor_id && t.parameter(address.parameter_id).is_some());
        if on_track {
            return self
                .tracks
                .iter_mut()
                .find(|t| t.id == address.processor_id)?
                .parameters
                .iter_mut()
                .find(|p| p.parameter_id == address.parameter_id);
        }
        self.processor_mut(address.processor_id)?
            .parameters
            .iter_mut()
            .find(|p| p.parameter_id == address.parameter_id)
    }
}

/// Shared store cell. The reconciler holds the only writer.
pub(crate) type SharedStore = Arc<RwLock<TopologyStore>>;

/// Read-only handle to the topology store.
#[derive(Clone)]
pub struct StoreReader {
    inner: SharedStore,
}

impl StoreReader {
    pub(crate) fn new(inner: SharedStore) -> Self {
        Self { inner }
    }

    /// Lock the store for reading. Keep the guard short-lived; the reconciler
    /// waits for it.
    pub fn read(&self) -> RwLockReadGuard<'_, TopologyStore> {
        self.inner.read()
    }

    pub fn revision(&self) -> u64 {
        self.inner.read().revision()
    }

    /// Clone of the current tracks, for callers that must not hold the lock.
    pub fn snapshot(&self) -> Vec<Track> {
        self.inner.read().tracks().to_vec()
    }
}
