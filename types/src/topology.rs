//! Mixing topology: tracks, processors, parameters and properties.
//!
//! These are the entities mirrored from the engine. Parameter values are
//! always kept on the normalized unit interval; domain values are derived
//! from `min_domain`/`max_domain` on demand and never stored.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Engine-assigned identifier for a track.
pub type TrackId = u32;

/// Engine-assigned identifier for a processor.
///
/// Tracks are processors inside the engine, so a `TrackId` can be used
/// wherever a processor id is expected (track-level parameters).
pub type ProcessorId = u32;

/// Identifier of a parameter, unique within its owning processor.
pub type ParameterId = u32;

/// Identifier of a property, unique within its owning processor.
pub type PropertyId = u32;

/// Kind of a track as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    #[default]
    Regular,
    Pre,
    Post,
    Multibus,
}

/// Kind discriminator derived from a processor's label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorLabel {
    Normal,
    Send,
    Return,
}

impl ProcessorLabel {
    /// Classify an engine label string.
    pub fn from_label(label: &str) -> Self {
        match label {
            "Send" => ProcessorLabel::Send,
            "Return" => ProcessorLabel::Return,
            _ => ProcessorLabel::Normal,
        }
    }
}

/// A parameter of a track or processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameter {
    pub parameter_id: ParameterId,
    pub name: String,
    /// Normalized value in `[0, 1]`
    pub value: f64,
    pub min_domain: f64,
    pub max_domain: f64,
    #[serde(default)]
    pub unit: String,
}

impl Parameter {
    /// Build a parameter from its engine description and a normalized value.
    pub fn from_info(info: &ParameterInfo, value: f64) -> Self {
        Self {
            parameter_id: info.id,
            name: info.name.clone(),
            value,
            min_domain: info.min_domain,
            max_domain: info.max_domain,
            unit: info.unit.clone(),
        }
    }
}

/// A string-valued processor property.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub id: PropertyId,
    pub name: String,
    pub value: String,
}

/// A plugin instance placed on a track.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Processor {
    pub id: ProcessorId,
    pub name: String,
    /// Raw label as reported by the engine
    pub label: String,
    pub track_id: TrackId,
    #[serde(default)]
    pub bypassed: bool,
    /// Parameters, loaded on demand
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    /// Properties keyed by name
    #[serde(default)]
    pub properties: BTreeMap<String, Property>,
}

impl Processor {
    /// Create a processor from its engine description with no loaded details.
    pub fn from_info(info: &ProcessorInfo, track_id: TrackId) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            label: info.label.clone(),
            track_id,
            bypassed: info.bypassed,
            parameters: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> ProcessorLabel {
        ProcessorLabel::from_label(&self.label)
    }

    pub fn parameter(&self, parameter_id: ParameterId) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.parameter_id == parameter_id)
    }

    pub fn property_value(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(|p| p.value.as_str())
    }

    /// Find a property by its engine id.
    pub fn property_by_id(&self, id: PropertyId) -> Option<&Property> {
        self.properties.values().find(|p| p.id == id)
    }

    /// Text shown on the processor card.
    ///
    /// Sends show their destination, returns show their instance name.
    pub fn display_text(&self) -> String {
        match self.kind() {
            ProcessorLabel::Send => match self.property_value("destination_name") {
                Some(dest) => format!("{} → {}", self.label, dest),
                None => format!("{} →", self.label),
            },
            ProcessorLabel::Return => format!("{} ({})", self.label, self.name),
            ProcessorLabel::Normal => self.label.clone(),
        }
    }
}

/// A mixing channel strip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    pub name: String,
    #[serde(default)]
    pub kind: TrackKind,
    #[serde(default)]
    pub input_channels: u32,
    #[serde(default)]
    pub output_channels: u32,
    /// Processors in engine order
    #[serde(default)]
    pub processors: Vec<Processor>,
    /// Track-level parameters (gain, pan, mute, ...)
    #[serde(default)]
    pub parameters: Vec<Parameter>,
}

impl Track {
    pub fn from_info(info: &TrackInfo) -> Self {
        Self {
            id: info.id,
            name: info.name.clone(),
            kind: info.kind,
            input_channels: info.input_channels,
            output_channels: info.output_channels,
            processors: Vec::new(),
            parameters: Vec::new(),
        }
    }

    pub fn parameter(&self, parameter_id: ParameterId) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.parameter_id == parameter_id)
    }

    /// Find a track parameter by case-insensitive name.
    pub fn parameter_named(&self, name: &str) -> Option<&Parameter> {
        self.parameters
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
    }

    pub fn gain(&self) -> Option<&Parameter> {
        self.parameter_named("gain")
    }

    pub fn pan(&self) -> Option<&Parameter> {
        self.parameter_named("pan")
    }

    pub fn mute(&self) -> Option<&Parameter> {
        self.parameter_named("mute")
    }

    pub fn processor(&self, id: ProcessorId) -> Option<&Processor> {
        self.processors.iter().find(|p| p.id == id)
    }

    /// Position of a processor within this track's chain.
    pub fn processor_index(&self, id: ProcessorId) -> Option<usize> {
        self.processors.iter().position(|p| p.id == id)
    }
}

// ============================================================================
// Engine query results
// ============================================================================

/// Engine identification, fetched during the connection handshake.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EngineInfo {
    pub version: String,
    pub sample_rate: f64,
    /// Not reported by every engine build; 0 when unknown
    #[serde(default)]
    pub buffer_size: u32,
    pub input_channels: u32,
    pub output_channels: u32,
}

/// Track description returned by `GetAllTracks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub id: TrackId,
    pub name: String,
    #[serde(default)]
    pub kind: TrackKind,
    #[serde(default)]
    pub input_channels: u32,
    #[serde(default)]
    pub output_channels: u32,
}

/// Processor description returned by `GetTrackProcessors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessorInfo {
    pub id: ProcessorId,
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub bypassed: bool,
}

/// Parameter description (without value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterInfo {
    pub id: ParameterId,
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub min_domain: f64,
    pub max_domain: f64,
}

/// Property description (without value).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropertyInfo {
    pub id: PropertyId,
    pub name: String,
}

/// Engine CPU timings; loads are fractions of the audio callback budget.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CpuTimings {
    pub average: f32,
    pub min: f32,
    pub max: f32,
}
