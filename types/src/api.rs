//! Request types for topology mutations and transport control.

use crate::topology::{ProcessorId, TrackId};
use serde::{Deserialize, Serialize};

// ============================================================================
// Plugin kinds
// ============================================================================

/// Plugin format used when creating a processor.
///
/// The discriminants are the engine's wire ordinals and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum PluginType {
    Internal = 0,
    Vst2 = 1,
    Vst3 = 2,
    Lv2 = 3,
    Dummy = 4,
}

impl PluginType {
    /// Wire ordinal of this plugin type.
    pub fn ordinal(self) -> i32 {
        self as i32
    }

    /// Parse a wire ordinal.
    pub fn from_ordinal(value: i32) -> Option<Self> {
        match value {
            0 => Some(PluginType::Internal),
            1 => Some(PluginType::Vst2),
            2 => Some(PluginType::Vst3),
            3 => Some(PluginType::Lv2),
            4 => Some(PluginType::Dummy),
            _ => None,
        }
    }
}

impl TryFrom<i32> for PluginType {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        PluginType::from_ordinal(value).ok_or(value)
    }
}

// ============================================================================
// Track API Types
// ============================================================================

/// Channel layout of a new track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Mono,
    Stereo,
    Multibus { buses: u32 },
    /// Pre-master track processing engine input
    Pre,
    /// Post-master track processing engine output
    Post,
}

impl ChannelConfig {
    /// Channel count for regular tracks, `None` for the other kinds.
    pub fn channels(&self) -> Option<u32> {
        match self {
            ChannelConfig::Mono => Some(1),
            ChannelConfig::Stereo => Some(2),
            _ => None,
        }
    }
}

/// Request to create a new track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateTrackRequest {
    pub name: String,
    pub config: ChannelConfig,
}

// ============================================================================
// Processor API Types
// ============================================================================

/// Where a processor is placed on a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Insertion {
    /// Append after the last processor
    #[default]
    End,
    /// Insert immediately before the given processor
    BeforeProcessor(ProcessorId),
}

/// Request to instantiate a plugin on a track.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProcessorRequest {
    pub name: String,
    pub uid: String,
    #[serde(default)]
    pub path: String,
    pub plugin_type: PluginType,
    pub track_id: TrackId,
    #[serde(default)]
    pub insertion: Insertion,
}

/// Request to remove a processor from a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteProcessorRequest {
    pub processor_id: ProcessorId,
    pub track_id: TrackId,
}

/// Request to move a processor, possibly across tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveProcessorRequest {
    pub processor_id: ProcessorId,
    pub source_track_id: TrackId,
    pub dest_track_id: TrackId,
    #[serde(default)]
    pub insertion: Insertion,
}

// ============================================================================
// Transport API Types
// ============================================================================

/// Engine transport state. Discriminants are wire values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[repr(i32)]
pub enum PlayingMode {
    #[default]
    Stopped = 1,
    Playing = 2,
    Recording = 3,
}

impl PlayingMode {
    pub fn from_wire(value: i32) -> Option<Self> {
        match value {
            1 => Some(PlayingMode::Stopped),
            2 => Some(PlayingMode::Playing),
            3 => Some(PlayingMode::Recording),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_type_ordinals() {
        assert_eq!(PluginType::Internal.ordinal(), 0);
        assert_eq!(PluginType::Vst2.ordinal(), 1);
        assert_eq!(PluginType::Vst3.ordinal(), 2);
        assert_eq!(PluginType::Lv2.ordinal(), 3);
        assert_eq!(PluginType::Dummy.ordinal(), 4);
    }

    #[test]
    fn test_plugin_type_from_ordinal() {
        assert_eq!(PluginType::try_from(2), Ok(PluginType::Vst3));
        assert_eq!(PluginType::try_from(5), Err(5));
        assert_eq!(PluginType::from_ordinal(-1), None);
    }

    #[test]
    fn test_channel_config_channels() {
        assert_eq!(ChannelConfig::Mono.channels(), Some(1));
        assert_eq!(ChannelConfig::Stereo.channels(), Some(2));
        assert_eq!(ChannelConfig::Multibus { buses: 4 }.channels(), None);
        assert_eq!(ChannelConfig::Post.channels(), None);
    }

    #[test]
    fn test_playing_mode_wire_values() {
        assert_eq!(PlayingMode::Playing as i32, 2);
        assert_eq!(PlayingMode::from_wire(1), Some(PlayingMode::Stopped));
        assert_eq!(PlayingMode::from_wire(0), None);
    }
}
