//! Scripted in-memory engine for integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use sushi_console::types::{
    CpuTimings, CreateProcessorRequest, DeleteProcessorRequest, EngineEvent, EngineInfo,
    Insertion, MoveProcessorRequest, NotificationKind, ParameterId, ParameterInfo, PlayingMode,
    ProcessorId, ProcessorInfo, PropertyInfo, TrackId, TrackInfo, TrackKind,
};
use sushi_console::{
    Config, EngineSession, EventStream, RemoteControl, RemoteError, RemoteResult, SharedRemote,
};
use tokio::sync::mpsc;

/// Calls recorded by the fake engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Query(&'static str),
    SetParameter {
        processor_id: ProcessorId,
        parameter_id: ParameterId,
        value: f64,
    },
    SetProperty {
        processor_id: ProcessorId,
        name: String,
        value: String,
    },
    SetBypass(ProcessorId, bool),
    SetPlayingMode(PlayingMode),
    CreateTrack { name: String, channels: u32 },
    CreateMultibusTrack { name: String, buses: u32 },
    CreatePreTrack(String),
    CreatePostTrack(String),
    DeleteTrack(TrackId),
    CreateProcessor(CreateProcessorRequest),
    DeleteProcessor(DeleteProcessorRequest),
    MoveProcessor(MoveProcessorRequest),
    Subscribe(NotificationKind),
}

#[derive(Debug, Clone)]
pub struct FakeTrack {
    pub info: TrackInfo,
    pub processors: Vec<ProcessorInfo>,
    pub parameters: Vec<(ParameterInfo, f64)>,
}

#[derive(Debug, Default)]
struct EngineState {
    tracks: Vec<FakeTrack>,
    processor_parameters: HashMap<ProcessorId, Vec<(ParameterInfo, f64)>>,
    properties: HashMap<ProcessorId, Vec<(PropertyInfo, String)>>,
    cpu: CpuTimings,
    playing_mode: PlayingMode,
    next_id: u32,
}

impl EngineState {
    fn parameter_mut(
        &mut self,
        owner: ProcessorId,
        id: ParameterId,
    ) -> Option<&mut (ParameterInfo, f64)> {
        if let Some(track) = self.tracks.iter_mut().find(|t| t.info.id == owner) {
            if let Some(p) = track.parameters.iter_mut().find(|(i, _)| i.id == id) {
                return Some(p);
            }
        }
        self.processor_parameters
            .get_mut(&owner)?
            .iter_mut()
            .find(|(i, _)| i.id == id)
    }

    fn track_mut(&mut self, id: TrackId) -> Option<&mut FakeTrack> {
        self.tracks.iter_mut().find(|t| t.info.id == id)
    }
}

/// In-memory engine. Mutations update its state and emit the matching
/// notifications, like the real engine does.
pub struct FakeEngine {
    state: Mutex<EngineState>,
    calls: Mutex<Vec<Call>>,
    /// Method name -> (remaining failures, error)
    failures: Mutex<HashMap<&'static str, (usize, RemoteError)>>,
    streams: Mutex<HashMap<NotificationKind, mpsc::UnboundedSender<RemoteResult<EngineEvent>>>>,
    value_delay: Mutex<Option<Duration>>,
    write_delay: Mutex<Option<Duration>>,
}

pub fn param(id: ParameterId, name: &str, min: f64, max: f64, unit: &str) -> ParameterInfo {
    ParameterInfo {
        id,
        name: name.to_string(),
        unit: unit.to_string(),
        min_domain: min,
        max_domain: max,
    }
}

pub fn processor(id: ProcessorId, name: &str, label: &str) -> ProcessorInfo {
    ProcessorInfo {
        id,
        name: name.to_string(),
        label: label.to_string(),
        bypassed: false,
    }
}

fn strip_parameters() -> Vec<(ParameterInfo, f64)> {
    vec![
        (param(5, "gain", -120.0, 24.0, "dB"), 0.5),
        (param(6, "pan", -1.0, 1.0, ""), 0.5),
        (param(7, "mute", 0.0, 1.0, ""), 0.0),
    ]
}

impl FakeEngine {
    /// Track 1 "Drums" with processors 10 (Equalizer) and 11 (Compressor),
    /// track 2 "Bass" with send 20. Both tracks carry gain 5, pan 6, mute 7.
    pub fn new() -> Arc<Self> {
        let mut state = EngineState {
            next_id: 100,
            playing_mode: PlayingMode::Stopped,
            cpu: CpuTimings {
                average: 0.12,
                min: 0.05,
                max: 0.2,
            },
            ..EngineState::default()
        };
        state.tracks = vec![
            FakeTrack {
                info: TrackInfo {
                    id: 1,
                    name: "Drums".to_string(),
                    kind: TrackKind::Regular,
                    input_channels: 2,
                    output_channels: 2,
                },
                processors: vec![
                    processor(10, "eq_0", "Equalizer"),
                    processor(11, "comp_0", "Compressor"),
                ],
                parameters: strip_parameters(),
            },
            FakeTrack {
                info: TrackInfo {
                    id: 2,
                    name: "Bass".to_string(),
                    kind: TrackKind::Regular,
                    input_channels: 2,
                    output_channels: 2,
                },
                processors: vec![processor(20, "send_0", "Send")],
                parameters: strip_parameters(),
            },
        ];
        state.processor_parameters.insert(
            10,
            vec![
                (param(0, "frequency", 20.0, 20000.0, "Hz"), 0.25),
                (param(1, "gain", -24.0, 24.0, "dB"), 0.5),
            ],
        );
        state.processor_parameters.insert(11, vec![]);
        state.processor_parameters.insert(20, vec![]);
        state.properties.insert(
            20,
            vec![(
                PropertyInfo {
                    id: 0,
                    name: "destination_name".to_string(),
                },
                "Reverb".to_string(),
            )],
        );

        Arc::new(Self {
            state: Mutex::new(state),
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
            streams: Mutex::new(HashMap::new()),
            value_delay: Mutex::new(None),
            write_delay: Mutex::new(None),
        })
    }

    pub fn remote(self: &Arc<Self>) -> SharedRemote {
        self.clone()
    }

    // ---- Scripting ----

    /// Make `method` fail until healed.
    pub fn fail(&self, method: &'static str, error: RemoteError) {
        self.failures.lock().insert(method, (usize::MAX, error));
    }

    /// Make the next `times` calls of `method` fail.
    pub fn fail_times(&self, method: &'static str, times: usize, error: RemoteError) {
        self.failures.lock().insert(method, (times, error));
    }

    pub fn heal(&self, method: &'static str) {
        self.failures.lock().remove(method);
    }

    /// Delay replies of parameter and property value queries.
    pub fn delay_values(&self, delay: Option<Duration>) {
        *self.value_delay.lock() = delay;
    }

    /// Delay replies of value writes and processor moves.
    pub fn delay_writes(&self, delay: Option<Duration>) {
        *self.write_delay.lock() = delay;
    }

    /// Change a value without notifying subscribers.
    pub fn set_value_silently(&self, owner: ProcessorId, id: ParameterId, value: f64) {
        if let Some(p) = self.state.lock().parameter_mut(owner, id) {
            p.1 = value;
        }
    }

    pub fn set_cpu(&self, timings: CpuTimings) {
        self.state.lock().cpu = timings;
    }

    /// Push an event to subscribers of its kind. Returns `false` when
    /// nobody is subscribed.
    pub fn emit(&self, event: EngineEvent) -> bool {
        let kind = event.kind();
        match self.streams.lock().get(&kind) {
            Some(tx) => tx.send(Ok(event)).is_ok(),
            None => false,
        }
    }

    /// Fail the stream of one kind.
    pub fn break_stream(&self, kind: NotificationKind, error: RemoteError) {
        if let Some(tx) = self.streams.lock().remove(&kind) {
            let _ = tx.send(Err(error));
        }
    }

    pub fn is_subscribed(&self, kind: NotificationKind) -> bool {
        self.streams
            .lock()
            .get(&kind)
            .is_some_and(|tx| !tx.is_closed())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| predicate(c)).count()
    }

    pub fn queries(&self, name: &'static str) -> usize {
        self.count(|c| *c == Call::Query(name))
    }

    pub fn track_order(&self, track_id: TrackId) -> Vec<ProcessorId> {
        self.state
            .lock()
            .tracks
            .iter()
            .find(|t| t.info.id == track_id)
            .map(|t| t.processors.iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    // ---- Internals ----

    fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    fn check(&self, method: &'static str) -> RemoteResult<()> {
        let mut failures = self.failures.lock();
        let Some((remaining, error)) = failures.get_mut(method) else {
            return Ok(());
        };
        let error = error.clone();
        if *remaining != usize::MAX {
            *remaining -= 1;
            if *remaining == 0 {
                failures.remove(method);
            }
        }
        Err(error)
    }

    fn query(&self, method: &'static str) -> RemoteResult<()> {
        self.record(Call::Query(method));
        self.check(method)
    }

    async fn value_pause(&self) {
        let delay = *self.value_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    async fn write_pause(&self) {
        let delay = *self.write_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn next_id(&self) -> u32 {
        let mut state = self.state.lock();
        state.next_id += 1;
        state.next_id
    }

    fn add_track(&self, name: &str, kind: TrackKind, channels: u32) {
        let id = self.next_id();
        self.state.lock().tracks.push(FakeTrack {
            info: TrackInfo {
                id,
                name: name.to_string(),
                kind,
                input_channels: channels,
                output_channels: channels,
            },
            processors: vec![],
            parameters: strip_parameters(),
        });
        self.emit(EngineEvent::TrackAdded { track_id: id });
    }

    fn not_found(what: impl std::fmt::Display) -> RemoteError {
        RemoteError::NotFound(what.to_string())
    }
}

#[async_trait]
impl RemoteControl for FakeEngine {
    async fn get_engine_info(&self) -> RemoteResult<EngineInfo> {
        self.query("get_engine_info")?;
        Ok(EngineInfo {
            version: "1.1.0".to_string(),
            sample_rate: 48000.0,
            buffer_size: 64,
            input_channels: 2,
            output_channels: 2,
        })
    }

    async fn get_all_tracks(&self) -> RemoteResult<Vec<TrackInfo>> {
        self.query("get_all_tracks")?;
        Ok(self
            .state
            .lock()
            .tracks
            .iter()
            .map(|t| t.info.clone())
            .collect())
    }

    async fn get_track_processors(&self, track_id: TrackId) -> RemoteResult<Vec<ProcessorInfo>> {
        self.query("get_track_processors")?;
        self.state
            .lock()
            .tracks
            .iter()
            .find(|t| t.info.id == track_id)
            .map(|t| t.processors.clone())
            .ok_or_else(|| Self::not_found(format!("track {}", track_id)))
    }

    async fn get_track_parameters(&self, track_id: TrackId) -> RemoteResult<Vec<ParameterInfo>> {
        self.query("get_track_parameters")?;
        self.state
            .lock()
            .tracks
            .iter()
            .find(|t| t.info.id == track_id)
            .map(|t| t.parameters.iter().map(|(i, _)| i.clone()).collect())
            .ok_or_else(|| Self::not_found(format!("track {}", track_id)))
    }

    async fn get_processor_parameters(
        &self,
        processor_id: ProcessorId,
    ) -> RemoteResult<Vec<ParameterInfo>> {
        self.query("get_processor_parameters")?;
        self.state
            .lock()
            .processor_parameters
            .get(&processor_id)
            .map(|list| list.iter().map(|(i, _)| i.clone()).collect())
            .ok_or_else(|| Self::not_found(format!("processor {}", processor_id)))
    }

    async fn get_parameter_value(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
    ) -> RemoteResult<f64> {
        self.query("get_parameter_value")?;
        // Value is read when the request arrives, answered after the delay
        let value = self
            .state
            .lock()
            .parameter_mut(processor_id, parameter_id)
            .map(|(_, v)| *v);
        self.value_pause().await;
        value.ok_or_else(|| Self::not_found(format!("parameter {}/{}", processor_id, parameter_id)))
    }

    async fn get_parameter_value_in_domain(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
    ) -> RemoteResult<f64> {
        self.query("get_parameter_value_in_domain")?;
        let value = self
            .state
            .lock()
            .parameter_mut(processor_id, parameter_id)
            .map(|(info, v)| info.min_domain + *v * (info.max_domain - info.min_domain));
        self.value_pause().await;
        value.ok_or_else(|| Self::not_found(format!("parameter {}/{}", processor_id, parameter_id)))
    }

    async fn get_processor_properties(
        &self,
        processor_id: ProcessorId,
    ) -> RemoteResult<Vec<PropertyInfo>> {
        self.query("get_processor_properties")?;
        Ok(self
            .state
            .lock()
            .properties
            .get(&processor_id)
            .map(|list| list.iter().map(|(i, _)| i.clone()).collect())
            .unwrap_or_default())
    }

    async fn get_property_value(
        &self,
        processor_id: ProcessorId,
        property_name: &str,
    ) -> RemoteResult<String> {
        self.query("get_property_value")?;
        let value = self
            .state
            .lock()
            .properties
            .get(&processor_id)
            .and_then(|list| list.iter().find(|(i, _)| i.name == property_name))
            .map(|(_, v)| v.clone());
        self.value_pause().await;
        value.ok_or_else(|| Self::not_found(format!("property {}/{}", processor_id, property_name)))
    }

    async fn get_engine_cpu_timings(&self) -> RemoteResult<CpuTimings> {
        self.query("get_engine_cpu_timings")?;
        Ok(self.state.lock().cpu)
    }

    async fn get_playing_mode(&self) -> RemoteResult<PlayingMode> {
        self.query("get_playing_mode")?;
        Ok(self.state.lock().playing_mode)
    }

    async fn set_parameter_value(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
        normalized_value: f64,
    ) -> RemoteResult<()> {
        self.record(Call::SetParameter {
            processor_id,
            parameter_id,
            value: normalized_value,
        });
        self.write_pause().await;
        self.check("set_parameter_value")?;
        let found = match self.state.lock().parameter_mut(processor_id, parameter_id) {
            Some(p) => {
                p.1 = normalized_value;
                true
            }
            None => false,
        };
        if !found {
            return Err(Self::not_found(format!(
                "parameter {}/{}",
                processor_id, parameter_id
            )));
        }
        self.emit(EngineEvent::ParameterChanged {
            processor_id,
            parameter_id,
            normalized_value,
            domain_value: None,
        });
        Ok(())
    }

    async fn set_property_value(
        &self,
        processor_id: ProcessorId,
        property_name: &str,
        value: &str,
    ) -> RemoteResult<()> {
        self.record(Call::SetProperty {
            processor_id,
            name: property_name.to_string(),
            value: value.to_string(),
        });
        self.write_pause().await;
        self.check("set_property_value")?;
        let property_id = {
            let mut state = self.state.lock();
            let entry = state
                .properties
                .get_mut(&processor_id)
                .and_then(|list| list.iter_mut().find(|(i, _)| i.name == property_name));
            match entry {
                Some((info, v)) => {
                    *v = value.to_string();
                    Some(info.id)
                }
                None => None,
            }
        };
        let property_id = property_id
            .ok_or_else(|| Self::not_found(format!("property {}", property_name)))?;
        self.emit(EngineEvent::PropertyChanged {
            processor_id,
            property_id,
            value: value.to_string(),
        });
        Ok(())
    }

    async fn set_processor_bypass(
        &self,
        processor_id: ProcessorId,
        bypassed: bool,
    ) -> RemoteResult<()> {
        self.record(Call::SetBypass(processor_id, bypassed));
        self.write_pause().await;
        self.check("set_processor_bypass")?;
        let mut state = self.state.lock();
        let processor = state
            .tracks
            .iter_mut()
            .find_map(|t| t.processors.iter_mut().find(|p| p.id == processor_id))
            .ok_or_else(|| Self::not_found(format!("processor {}", processor_id)))?;
        processor.bypassed = bypassed;
        Ok(())
    }

    async fn set_playing_mode(&self, mode: PlayingMode) -> RemoteResult<()> {
        self.record(Call::SetPlayingMode(mode));
        self.check("set_playing_mode")?;
        self.state.lock().playing_mode = mode;
        Ok(())
    }

    async fn create_track(&self, name: &str, channels: u32) -> RemoteResult<()> {
        self.record(Call::CreateTrack {
            name: name.to_string(),
            channels,
        });
        self.check("create_track")?;
        self.add_track(name, TrackKind::Regular, channels);
        Ok(())
    }

    async fn create_multibus_track(&self, name: &str, buses: u32) -> RemoteResult<()> {
        self.record(Call::CreateMultibusTrack {
            name: name.to_string(),
            buses,
        });
        self.check("create_multibus_track")?;
        self.add_track(name, TrackKind::Multibus, buses * 2);
        Ok(())
    }

    async fn create_pre_track(&self, name: &str) -> RemoteResult<()> {
        self.record(Call::CreatePreTrack(name.to_string()));
        self.check("create_pre_track")?;
        self.add_track(name, TrackKind::Pre, 2);
        Ok(())
    }

    async fn create_post_track(&self, name: &str) -> RemoteResult<()> {
        self.record(Call::CreatePostTrack(name.to_string()));
        self.check("create_post_track")?;
        self.add_track(name, TrackKind::Post, 2);
        Ok(())
    }

    async fn delete_track(&self, track_id: TrackId) -> RemoteResult<()> {
        self.record(Call::DeleteTrack(track_id));
        self.check("delete_track")?;
        let removed = {
            let mut state = self.state.lock();
            let before = state.tracks.len();
            state.tracks.retain(|t| t.info.id != track_id);
            state.tracks.len() != before
        };
        if !removed {
            return Err(Self::not_found(format!("track {}", track_id)));
        }
        self.emit(EngineEvent::TrackDeleted { track_id });
        Ok(())
    }

    async fn create_processor_on_track(
        &self,
        request: &CreateProcessorRequest,
    ) -> RemoteResult<()> {
        self.record(Call::CreateProcessor(request.clone()));
        self.check("create_processor_on_track")?;
        let id = self.next_id();
        {
            let mut state = self.state.lock();
            let track = state
                .track_mut(request.track_id)
                .ok_or_else(|| Self::not_found(format!("track {}", request.track_id)))?;
            let info = processor(id, &request.name, &request.uid);
            let at = match request.insertion {
                Insertion::End => track.processors.len(),
                Insertion::BeforeProcessor(anchor) => track
                    .processors
                    .iter()
                    .position(|p| p.id == anchor)
                    .unwrap_or(track.processors.len()),
            };
            track.processors.insert(at, info);
            state.processor_parameters.insert(id, vec![]);
        }
        self.emit(EngineEvent::ProcessorAdded {
            processor_id: id,
            track_id: request.track_id,
        });
        Ok(())
    }

    async fn delete_processor_from_track(
        &self,
        request: &DeleteProcessorRequest,
    ) -> RemoteResult<()> {
        self.record(Call::DeleteProcessor(*request));
        self.check("delete_processor_from_track")?;
        {
            let mut state = self.state.lock();
            let track = state
                .track_mut(request.track_id)
                .ok_or_else(|| Self::not_found(format!("track {}", request.track_id)))?;
            track.processors.retain(|p| p.id != request.processor_id);
        }
        self.emit(EngineEvent::ProcessorDeleted {
            processor_id: request.processor_id,
            track_id: request.track_id,
        });
        Ok(())
    }

    async fn move_processor_on_track(&self, request: &MoveProcessorRequest) -> RemoteResult<()> {
        self.record(Call::MoveProcessor(*request));
        self.write_pause().await;
        self.check("move_processor_on_track")?;
        {
            let mut state = self.state.lock();
            let source = state
                .track_mut(request.source_track_id)
                .ok_or_else(|| Self::not_found(format!("track {}", request.source_track_id)))?;
            let index = source
                .processors
                .iter()
                .position(|p| p.id == request.processor_id)
                .ok_or_else(|| Self::not_found(format!("processor {}", request.processor_id)))?;
            let moved = source.processors.remove(index);
            let dest = state
                .track_mut(request.dest_track_id)
                .ok_or_else(|| Self::not_found(format!("track {}", request.dest_track_id)))?;
            let at = match request.insertion {
                Insertion::End => dest.processors.len(),
                Insertion::BeforeProcessor(anchor) => dest
                    .processors
                    .iter()
                    .position(|p| p.id == anchor)
                    .unwrap_or(dest.processors.len()),
            };
            dest.processors.insert(at, moved);
        }
        self.emit(EngineEvent::ProcessorDeleted {
            processor_id: request.processor_id,
            track_id: request.source_track_id,
        });
        self.emit(EngineEvent::ProcessorAdded {
            processor_id: request.processor_id,
            track_id: request.dest_track_id,
        });
        Ok(())
    }

    async fn subscribe(&self, kind: NotificationKind) -> RemoteResult<EventStream> {
        self.record(Call::Subscribe(kind));
        self.check("subscribe")?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.lock().insert(kind, tx);
        Ok(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed())
    }
}

/// Config used by the tests: defaults, no reconnect.
pub fn test_config() -> Config {
    Config::default()
}

/// Connect and wait until every notification stream is up.
pub async fn connect(engine: &Arc<FakeEngine>, config: Config) -> EngineSession {
    let session = match EngineSession::connect(engine.remote(), config).await {
        Ok(session) => session,
        Err(e) => panic!("connect failed: {}", e),
    };
    wait_subscribed(engine).await;
    session
}

pub async fn wait_subscribed(engine: &FakeEngine) {
    for _ in 0..100 {
        if NotificationKind::ALL.iter().all(|&k| engine.is_subscribed(k)) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("subscriptions were not established");
}

/// Let spawned tasks run, then wait for the reconciler to catch up.
pub async fn settle(session: &EngineSession) {
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(1)).await;
        session.flush().await;
    }
}

pub fn order(session: &EngineSession, track_id: TrackId) -> Vec<ProcessorId> {
    session
        .store()
        .read()
        .track(track_id)
        .map(|t| t.processors.iter().map(|p| p.id).collect())
        .unwrap_or_default()
}
