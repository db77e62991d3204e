//! Remote control boundary to the engine.
//!
//! The synchronization core only talks to the engine through this trait.
//! Transport encoding (gRPC-web, websocket framing, ...) is the concern of
//! the implementation.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use sushi_console_types::{
    CpuTimings, CreateProcessorRequest, DeleteProcessorRequest, EngineEvent, EngineInfo,
    MoveProcessorRequest, NotificationKind, ParameterId, ParameterInfo, PlayingMode, ProcessorId,
    ProcessorInfo, PropertyInfo, TrackId, TrackInfo,
};

use crate::error::{RemoteError, RemoteResult};

/// Stream of engine notifications. Ends or yields an error when the
/// subscription fails.
pub type EventStream = BoxStream<'static, RemoteResult<EngineEvent>>;

/// Shared handle to a remote control implementation.
pub type SharedRemote = Arc<dyn RemoteControl>;

/// Request/response and subscribe primitives exposed by the engine.
#[async_trait]
pub trait RemoteControl: Send + Sync {
    // ---- Queries ----

    async fn get_engine_info(&self) -> RemoteResult<EngineInfo>;

    async fn get_all_tracks(&self) -> RemoteResult<Vec<TrackInfo>>;

    async fn get_track_processors(&self, track_id: TrackId) -> RemoteResult<Vec<ProcessorInfo>>;

    async fn get_track_parameters(&self, track_id: TrackId) -> RemoteResult<Vec<ParameterInfo>>;

    async fn get_processor_parameters(
        &self,
        processor_id: ProcessorId,
    ) -> RemoteResult<Vec<ParameterInfo>>;

    /// Current value on the unit interval.
    async fn get_parameter_value(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
    ) -> RemoteResult<f64>;

    /// Current value in the parameter's domain.
    async fn get_parameter_value_in_domain(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
    ) -> RemoteResult<f64>;

    async fn get_processor_properties(
        &self,
        processor_id: ProcessorId,
    ) -> RemoteResult<Vec<PropertyInfo>>;

    async fn get_property_value(
        &self,
        processor_id: ProcessorId,
        property_name: &str,
    ) -> RemoteResult<String>;

    async fn get_engine_cpu_timings(&self) -> RemoteResult<CpuTimings>;

    async fn get_playing_mode(&self) -> RemoteResult<PlayingMode>;

    // ---- Mutations ----

    async fn set_parameter_value(
        &self,
        processor_id: ProcessorId,
        parameter_id: ParameterId,
        normalized_value: f64,
    ) -> RemoteResult<()>;

    async fn set_property_value(
        &self,
        processor_id: ProcessorId,
        property_name: &str,
        value: &str,
    ) -> RemoteResult<()>;

    async fn set_processor_bypass(
        &self,
        processor_id: ProcessorId,
        bypassed: bool,
    ) -> RemoteResult<()>;

    async fn set_playing_mode(&self, mode: PlayingMode) -> RemoteResult<()>;

    async fn create_track(&self, name: &str, channels: u32) -> RemoteResult<()>;

    async fn create_multibus_track(&self, name: &str, buses: u32) -> RemoteResult<()>;

    async fn create_pre_track(&self, name: &str) -> RemoteResult<()>;

    async fn create_post_track(&self, name: &str) -> RemoteResult<()>;

    async fn delete_track(&self, track_id: TrackId) -> RemoteResult<()>;

    async fn create_processor_on_track(&self, request: &CreateProcessorRequest)
        -> RemoteResult<()>;

    async fn delete_processor_from_track(&self, request: &DeleteProcessorRequest)
        -> RemoteResult<()>;

    async fn move_processor_on_track(&self, request: &MoveProcessorRequest) -> RemoteResult<()>;

    // ---- Subscriptions ----

    /// Open the notification stream for one kind.
    async fn subscribe(&self, kind: NotificationKind) -> RemoteResult<EventStream>;
}

/// Run a remote call under an optional deadline.
///
/// Deadlines shorter than one UI frame are raised to one frame.
pub async fn with_deadline<T, F>(deadline: Option<Duration>, call: F) -> RemoteResult<T>
where
    F: std::future::Future<Output = RemoteResult<T>>,
{
    match deadline {
        None => call.await,
        Some(limit) => {
            let limit = limit.max(MIN_DEADLINE);
            match tokio::time::timeout(limit, call).await {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout(limit.as_millis() as u64)),
            }
        }
    }
}

/// One frame at 60 Hz.
pub const MIN_DEADLINE: Duration = Duration::from_millis(16);
