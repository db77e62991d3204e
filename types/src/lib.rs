//! Shared types for the Sushi console.
//!
//! This crate contains the mixing topology model, engine notifications and
//! mutation request types used by the synchronization core and by
//! implementations of the remote control boundary.

pub mod api;
pub mod events;
pub mod topology;

// Re-export commonly used types
pub use api::{
    ChannelConfig, CreateProcessorRequest, CreateTrackRequest, DeleteProcessorRequest, Insertion,
    MoveProcessorRequest, PlayingMode, PluginType,
};
pub use events::{EngineEvent, NotificationKind};
pub use topology::{
    CpuTimings, EngineInfo, Parameter, ParameterId, ParameterInfo, Processor, ProcessorId,
    ProcessorInfo, ProcessorLabel, Property, PropertyId, PropertyInfo, Track, TrackId, TrackInfo,
    TrackKind,
};
