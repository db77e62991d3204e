//! Push notifications emitted by the engine.

use crate::topology::{CpuTimings, ParameterId, ProcessorId, PropertyId, TrackId};
use serde::{Deserialize, Serialize};

/// Notification stream kinds. The engine exposes one subscription per kind;
/// ordering is only guaranteed within a single kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Parameter,
    Property,
    Track,
    Processor,
    CpuTiming,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 5] = [
        NotificationKind::Parameter,
        NotificationKind::Property,
        NotificationKind::Track,
        NotificationKind::Processor,
        NotificationKind::CpuTiming,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            NotificationKind::Parameter => "parameter updates",
            NotificationKind::Property => "property updates",
            NotificationKind::Track => "track changes",
            NotificationKind::Processor => "processor changes",
            NotificationKind::CpuTiming => "engine CPU timings",
        }
    }
}

/// Event pushed by the engine to subscribed clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EngineEvent {
    /// A parameter value changed
    ParameterChanged {
        processor_id: ProcessorId,
        parameter_id: ParameterId,
        /// New value on the unit interval
        normalized_value: f64,
        /// Same value in the parameter's domain, when the engine reports it
        #[serde(default)]
        domain_value: Option<f64>,
    },
    /// A property value changed
    PropertyChanged {
        processor_id: ProcessorId,
        property_id: PropertyId,
        value: String,
    },
    /// A track was created
    TrackAdded { track_id: TrackId },
    /// A track was deleted
    TrackDeleted { track_id: TrackId },
    /// A processor was added to a track
    ProcessorAdded {
        processor_id: ProcessorId,
        track_id: TrackId,
    },
    /// A processor was removed from a track
    ProcessorDeleted {
        processor_id: ProcessorId,
        track_id: TrackId,
    },
    /// Engine CPU load sample
    CpuLoadChanged(CpuTimings),
}

impl EngineEvent {
    /// The subscription this event is delivered on.
    pub fn kind(&self) -> NotificationKind {
        match self {
            EngineEvent::ParameterChanged { .. } => NotificationKind::Parameter,
            EngineEvent::PropertyChanged { .. } => NotificationKind::Property,
            EngineEvent::TrackAdded { .. } | EngineEvent::TrackDeleted { .. } => {
                NotificationKind::Track
            }
            EngineEvent::ProcessorAdded { .. } | EngineEvent::ProcessorDeleted { .. } => {
                NotificationKind::Processor
            }
            EngineEvent::CpuLoadChanged(_) => NotificationKind::CpuTiming,
        }
    }

    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            EngineEvent::ParameterChanged {
                processor_id,
                parameter_id,
                normalized_value,
                ..
            } => format!(
                "Parameter {} on processor {} changed to {:.4}",
                parameter_id, processor_id, normalized_value
            ),
            EngineEvent::PropertyChanged {
                processor_id,
                property_id,
                value,
            } => format!(
                "Property {} on processor {} changed to {:?}",
                property_id, processor_id, value
            ),
            EngineEvent::TrackAdded { track_id } => format!("Track {} added", track_id),
            EngineEvent::TrackDeleted { track_id } => format!("Track {} deleted", track_id),
            EngineEvent::ProcessorAdded {
                processor_id,
                track_id,
            } => format!("Processor {} added to track {}", processor_id, track_id),
            EngineEvent::ProcessorDeleted {
                processor_id,
                track_id,
            } => format!(
                "Processor {} deleted from track {}",
                processor_id, track_id
            ),
            EngineEvent::CpuLoadChanged(timings) => {
                format!("CPU load {:.1}%", timings.average * 100.0)
            }
        }
    }
}
