//! Wire protocol types shared with the mixer server
//!
//! JSON messages with a `type` discriminator and camelCase fields, plus the
//! mixer-state types carried inside them.

use serde::{Deserialize, Serialize};

/// Channel identifier. Inputs and outputs occupy disjoint numeric bands:
/// inputs are `0..OUTPUT_CHANNEL_BASE`, outputs `OUTPUT_CHANNEL_BASE..`.
pub type ChannelId = u32;

/// First channel id of the output band.
pub const OUTPUT_CHANNEL_BASE: ChannelId = 1000;

/// True if the id falls in the input band
pub fn is_input_channel(id: ChannelId) -> bool {
    id < OUTPUT_CHANNEL_BASE
}

/// True if the id falls in the output band
pub fn is_output_channel(id: ChannelId) -> bool {
    id >= OUTPUT_CHANNEL_BASE
}

/// State of a single mixer channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    pub id: ChannelId,
    pub name: String,
    /// Normalized fader position (0.0 = -inf, 1.0 = 0 dB, 1.25 = +10 dB)
    pub fader: f32,
    pub mute: bool,
    pub solo: bool,
    /// -1.0 = hard left, 0.0 = center, 1.0 = hard right
    pub pan: f32,
    /// Input gain in dB
    pub gain: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(default)]
    pub phase_invert: bool,
}

impl Channel {
    /// A fresh channel with neutral settings
    pub fn new(id: ChannelId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            fader: 0.0,
            mute: false,
            solo: false,
            pan: 0.0,
            gain: 0.0,
            color: None,
            phase_invert: false,
        }
    }
}

/// Master bus state
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterState {
    pub fader: f32,
    pub mute: bool,
}

/// One enabled (or explicitly disabled) point of the routing matrix
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingPoint {
    pub input_channel: ChannelId,
    pub output_channel: ChannelId,
    pub enabled: bool,
}

/// Per-channel meter reading. Volatile: last-writer-wins, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterSample {
    pub channel_id: ChannelId,
    pub level: f32,
    pub peak: f32,
}

/// Complete replacement of the mixer state, sent after connect or on demand
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MixerSnapshot {
    pub channels: Vec<Channel>,
    /// Only enabled points are listed; absence means "not routed"
    pub routing: Vec<RoutingPoint>,
    #[serde(default)]
    pub master: MasterState,
}

/// Partial update to one channel; only the supplied fields are merged
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fader: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solo: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pan: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gain: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl ChannelDelta {
    /// Delta carrying a single fader value
    pub fn fader(value: f32) -> Self {
        Self {
            fader: Some(value),
            ..Default::default()
        }
    }

    /// Delta carrying a single mute flag
    pub fn mute(muted: bool) -> Self {
        Self {
            mute: Some(muted),
            ..Default::default()
        }
    }

    /// Delta carrying a single solo flag
    pub fn solo(solo: bool) -> Self {
        Self {
            solo: Some(solo),
            ..Default::default()
        }
    }

    /// Delta carrying a single pan value
    pub fn pan(pan: f32) -> Self {
        Self {
            pan: Some(pan),
            ..Default::default()
        }
    }

    /// Delta carrying a single gain value
    pub fn gain(gain: f32) -> Self {
        Self {
            gain: Some(gain),
            ..Default::default()
        }
    }
}

/// Message from this client to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Request a complete state snapshot
    GetFullState,
    /// Heartbeat; the server answers with `Pong`
    Ping,
    #[serde(rename_all = "camelCase")]
    SetChannelFader { channel_id: ChannelId, value: f32 },
    #[serde(rename_all = "camelCase")]
    SetChannelMute { channel_id: ChannelId, muted: bool },
    #[serde(rename_all = "camelCase")]
    SetChannelSolo { channel_id: ChannelId, solo: bool },
    #[serde(rename_all = "camelCase")]
    SetChannelPan { channel_id: ChannelId, pan: f32 },
    #[serde(rename_all = "camelCase")]
    SetChannelGain { channel_id: ChannelId, gain: f32 },
    SetMasterFader {
        value: f32,
    },
    #[serde(rename_all = "camelCase")]
    SetRouting {
        input_channel: ChannelId,
        output_channel: ChannelId,
        enabled: bool,
    },
    SaveScene {
        name: String,
    },
    RecallScene {
        name: String,
    },
    #[serde(rename_all = "camelCase")]
    SubscribeMeters {
        enabled: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_ms: Option<u32>,
    },
}

/// Message from the server to this client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    FullState {
        state: MixerSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    ChannelUpdate {
        channel_id: ChannelId,
        #[serde(flatten)]
        fields: ChannelDelta,
    },
    #[serde(rename_all = "camelCase")]
    RoutingUpdate {
        input_channel: ChannelId,
        output_channel: ChannelId,
        enabled: bool,
    },
    #[serde(rename_all = "camelCase")]
    MasterUpdate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fader: Option<f32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        mute: Option<bool>,
    },
    MeterUpdate {
        meters: Vec<MeterSample>,
    },
    Pong,
    Error {
        message: String,
    },
    SceneSaved {
        name: String,
    },
    SceneRecalled {
        name: String,
    },
}

/// What a learned MIDI control drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindTarget {
    Fader,
    Mute,
    Solo,
    Pan,
    Master,
}

impl BindTarget {
    /// Parse a user-facing target name (as typed in the learn command)
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "fader" => Some(BindTarget::Fader),
            "mute" => Some(BindTarget::Mute),
            "solo" => Some(BindTarget::Solo),
            "pan" => Some(BindTarget::Pan),
            "master" => Some(BindTarget::Master),
            _ => None,
        }
    }
}

/// Mapping from one physical control to one protocol target.
///
/// Created by MIDI-Learn, persisted in the config file, read-only for the
/// bridge outside the learn flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MidiBinding {
    /// Surface-local control identifier (e.g. "cc7", "note16", "pb0")
    pub control_id: String,
    pub target: BindTarget,
    /// Target channel; `None` for master
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<ChannelId>,
}
