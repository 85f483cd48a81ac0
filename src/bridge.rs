//! MIDI control-surface bridge
//!
//! Translates physical control movements into protocol commands and mirrors
//! confirmed state back to motorized faders and LEDs, with echo suppression
//! so a moving fader does not fight its own feedback.

pub mod device;
pub mod normalize;
pub mod surface;

pub use surface::{SurfaceBridge, FEEDBACK_SUPPRESS_WINDOW};

/// How the physical control reports values
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Continuous 0-127 position (faders, encoders, pitch-bend strips)
    Absolute,
    /// Momentary press (buttons / note messages)
    Toggle,
}

/// A movement or press on the surface, already reduced to 7-bit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEvent {
    /// Stable identifier of the physical control, e.g. `cc7@1`
    pub control_id: String,
    pub kind: ControlKind,
    /// 0-127; velocity for presses, position for absolute controls
    pub raw: u8,
}

/// Outbound update for the surface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Feedback {
    /// Move a motorized fader / encoder ring to a 7-bit position
    Position { control_id: String, raw: u8 },
    /// Switch a button LED
    Led { control_id: String, on: bool },
}

impl Feedback {
    pub fn control_id(&self) -> &str {
        match self {
            Feedback::Position { control_id, .. } => control_id,
            Feedback::Led { control_id, .. } => control_id,
        }
    }
}
