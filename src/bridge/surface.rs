//! Binding table, MIDI-Learn flow, and feedback suppression

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, trace};

use crate::bridge::normalize;
use crate::bridge::{ControlEvent, ControlKind, Feedback};
use crate::protocol::{BindTarget, ChannelId, ClientMessage, MidiBinding};
use crate::state::{StateStore, StoreUpdate};

/// Updates for a control are not echoed back to the surface while the user
/// touched it this recently
pub const FEEDBACK_SUPPRESS_WINDOW: Duration = Duration::from_millis(250);

/// Result of feeding one surface event through the bridge
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeOutput {
    /// Forward this command to the reconciliation engine
    Command(ClientMessage),
    /// Learn mode captured a new binding; persist it
    Learned(MidiBinding),
}

/// One armed learn request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LearnSession {
    target: BindTarget,
    channel: Option<ChannelId>,
}

/// Maps surface controls to mixer targets and back.
///
/// Not thread-safe on purpose: the event loop owns it and feeds it events
/// and store updates from one task.
pub struct SurfaceBridge {
    bindings: HashMap<String, MidiBinding>,
    learn: Option<LearnSession>,
    /// Last local touch per control, for echo suppression
    last_input: HashMap<String, Instant>,
    /// Last raw value written to each control, to skip no-op feedback
    last_sent: HashMap<String, u8>,
    /// Last absolute value seen per control; repeats from a poll tick or
    /// from the surface echoing a motor move are dropped
    last_raw_in: HashMap<String, u8>,
}

impl SurfaceBridge {
    pub fn new(bindings: Vec<MidiBinding>) -> Self {
        Self {
            bindings: bindings
                .into_iter()
                .map(|b| (b.control_id.clone(), b))
                .collect(),
            learn: None,
            last_input: HashMap::new(),
            last_sent: HashMap::new(),
            last_raw_in: HashMap::new(),
        }
    }

    pub fn bindings(&self) -> Vec<MidiBinding> {
        let mut all: Vec<MidiBinding> = self.bindings.values().cloned().collect();
        all.sort_by(|a, b| a.control_id.cmp(&b.control_id));
        all
    }

    /// Arm learn mode: the next surface event is captured as a binding
    /// instead of being forwarded
    pub fn arm_learn(&mut self, target: BindTarget, channel: Option<ChannelId>) {
        info!(?target, ?channel, "Learn armed, touch a control");
        self.learn = Some(LearnSession { target, channel });
    }

    pub fn cancel_learn(&mut self) {
        if self.learn.take().is_some() {
            info!("Learn cancelled");
        }
    }

    pub fn is_learning(&self) -> bool {
        self.learn.is_some()
    }

    /// Feed one surface event through the bridge
    pub fn on_event(&mut self, event: &ControlEvent, store: &StateStore) -> Option<BridgeOutput> {
        if let Some(learn) = self.learn.take() {
            self.last_input
                .insert(event.control_id.clone(), Instant::now());
            // Button releases would immediately re-capture; only the
            // initial touch counts
            if event.kind == ControlKind::Toggle && event.raw == 0 {
                self.learn = Some(learn);
                return None;
            }
            let binding = MidiBinding {
                control_id: event.control_id.clone(),
                target: learn.target,
                channel: learn.channel,
            };
            info!(control = %binding.control_id, target = ?binding.target,
                  channel = ?binding.channel, "Control learned");
            self.bindings
                .insert(binding.control_id.clone(), binding.clone());
            return Some(BridgeOutput::Learned(binding));
        }

        // Poll delivery repeats unchanged values every tick, and the surface
        // may echo a motor move back at us; both are dropped here so they
        // never amplify into protocol traffic
        if event.kind == ControlKind::Absolute {
            if self.last_raw_in.get(&event.control_id) == Some(&event.raw) {
                return None;
            }
            self.last_raw_in.insert(event.control_id.clone(), event.raw);
        }
        self.last_input
            .insert(event.control_id.clone(), Instant::now());

        let Some(binding) = self.bindings.get(&event.control_id) else {
            trace!(control = %event.control_id, "Unbound control ignored");
            return None;
        };

        let cmd = match binding.target {
            BindTarget::Fader => ClientMessage::SetChannelFader {
                channel_id: binding.channel?,
                value: normalize::fader_from_raw(event.raw),
            },
            BindTarget::Pan => ClientMessage::SetChannelPan {
                channel_id: binding.channel?,
                pan: normalize::pan_from_raw(event.raw),
            },
            BindTarget::Master => ClientMessage::SetMasterFader {
                value: normalize::fader_from_raw(event.raw),
            },
            BindTarget::Mute | BindTarget::Solo => {
                let pressed = match event.kind {
                    ControlKind::Toggle => event.raw > 0,
                    ControlKind::Absolute => normalize::is_press(event.raw),
                };
                if !pressed {
                    return None;
                }
                let channel_id = binding.channel?;
                let channel = store.channel(channel_id)?;
                if binding.target == BindTarget::Mute {
                    ClientMessage::SetChannelMute {
                        channel_id,
                        muted: !channel.mute,
                    }
                } else {
                    ClientMessage::SetChannelSolo {
                        channel_id,
                        solo: !channel.solo,
                    }
                }
            }
        };
        Some(BridgeOutput::Command(cmd))
    }

    /// Turn a store update into surface feedback.
    ///
    /// Controls touched inside the suppression window are skipped, as are
    /// writes that would not change the control's position.
    pub fn on_store_update(&mut self, update: &StoreUpdate, store: &StateStore) -> Vec<Feedback> {
        match update {
            StoreUpdate::Channel(channel) => {
                let mut out = Vec::new();
                for binding in self.bindings.values() {
                    if binding.channel != Some(channel.id) {
                        continue;
                    }
                    let feedback = match binding.target {
                        BindTarget::Fader => Feedback::Position {
                            control_id: binding.control_id.clone(),
                            raw: normalize::fader_to_raw(channel.fader),
                        },
                        BindTarget::Pan => Feedback::Position {
                            control_id: binding.control_id.clone(),
                            raw: normalize::pan_to_raw(channel.pan),
                        },
                        BindTarget::Mute => Feedback::Led {
                            control_id: binding.control_id.clone(),
                            on: channel.mute,
                        },
                        BindTarget::Solo => Feedback::Led {
                            control_id: binding.control_id.clone(),
                            on: channel.solo,
                        },
                        BindTarget::Master => continue,
                    };
                    out.push(feedback);
                }
                self.filter_feedback(out)
            }
            StoreUpdate::Master(master) => {
                let out = self
                    .bindings
                    .values()
                    .filter(|b| b.target == BindTarget::Master)
                    .map(|b| Feedback::Position {
                        control_id: b.control_id.clone(),
                        raw: normalize::fader_to_raw(master.fader),
                    })
                    .collect();
                self.filter_feedback(out)
            }
            StoreUpdate::Snapshot => {
                // Re-sync every bound control from the fresh state
                let mut out = Vec::new();
                for binding in self.bindings.values() {
                    let feedback = match (binding.target, binding.channel) {
                        (BindTarget::Master, _) => Feedback::Position {
                            control_id: binding.control_id.clone(),
                            raw: normalize::fader_to_raw(store.master().fader),
                        },
                        (target, Some(channel_id)) => {
                            let Some(channel) = store.channel(channel_id) else {
                                continue;
                            };
                            match target {
                                BindTarget::Fader => Feedback::Position {
                                    control_id: binding.control_id.clone(),
                                    raw: normalize::fader_to_raw(channel.fader),
                                },
                                BindTarget::Pan => Feedback::Position {
                                    control_id: binding.control_id.clone(),
                                    raw: normalize::pan_to_raw(channel.pan),
                                },
                                BindTarget::Mute => Feedback::Led {
                                    control_id: binding.control_id.clone(),
                                    on: channel.mute,
                                },
                                BindTarget::Solo => Feedback::Led {
                                    control_id: binding.control_id.clone(),
                                    on: channel.solo,
                                },
                                BindTarget::Master => continue,
                            }
                        }
                        _ => continue,
                    };
                    out.push(feedback);
                }
                self.filter_feedback(out)
            }
            // Meters, routing, connection and errors have no surface mirror
            _ => Vec::new(),
        }
    }

    fn filter_feedback(&mut self, candidates: Vec<Feedback>) -> Vec<Feedback> {
        let now = Instant::now();
        let mut out = Vec::new();
        for feedback in candidates {
            let id = feedback.control_id().to_string();
            if let Some(touched) = self.last_input.get(&id) {
                if now.duration_since(*touched) < FEEDBACK_SUPPRESS_WINDOW {
                    debug!(control = %id, "Feedback suppressed, control in use");
                    continue;
                }
            }
            let raw = match &feedback {
                Feedback::Position { raw, .. } => *raw,
                Feedback::Led { on, .. } => {
                    if *on {
                        127
                    } else {
                        0
                    }
                }
            };
            if self.last_sent.get(&id) == Some(&raw) {
                continue;
            }
            // The surface will likely echo this write; pre-arm the inbound
            // dedup so the echo dies at the door
            if matches!(feedback, Feedback::Position { .. }) {
                self.last_raw_in.insert(id.clone(), raw);
            }
            self.last_sent.insert(id, raw);
            out.push(feedback);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Channel, MasterState, MixerSnapshot};

    fn store_with_channels() -> StateStore {
        let store = StateStore::new();
        store.apply_full_state(MixerSnapshot {
            channels: vec![Channel::new(3, "Mic 3"), Channel::new(5, "Mic 5")],
            routing: Vec::new(),
            master: MasterState {
                fader: 1.0,
                mute: false,
            },
        });
        store
    }

    fn fader_binding(control_id: &str, channel: ChannelId) -> MidiBinding {
        MidiBinding {
            control_id: control_id.to_string(),
            target: BindTarget::Fader,
            channel: Some(channel),
        }
    }

    fn event(control_id: &str, kind: ControlKind, raw: u8) -> ControlEvent {
        ControlEvent {
            control_id: control_id.to_string(),
            kind,
            raw,
        }
    }

    #[test]
    fn test_unbound_control_discarded() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![]);
        let out = bridge.on_event(&event("cc7@1", ControlKind::Absolute, 100), &store);
        assert_eq!(out, None);
    }

    #[test]
    fn test_fader_event_normalized() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        let out = bridge.on_event(&event("cc7@1", ControlKind::Absolute, 127), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Command(ClientMessage::SetChannelFader {
                channel_id: 3,
                value: 1.0,
            }))
        );

        let out = bridge.on_event(&event("cc7@1", ControlKind::Absolute, 0), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Command(ClientMessage::SetChannelFader {
                channel_id: 3,
                value: 0.0,
            }))
        );
    }

    #[test]
    fn test_mute_press_flips_store_value() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![MidiBinding {
            control_id: "note16@1".to_string(),
            target: BindTarget::Mute,
            channel: Some(3),
        }]);

        let out = bridge.on_event(&event("note16@1", ControlKind::Toggle, 127), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Command(ClientMessage::SetChannelMute {
                channel_id: 3,
                muted: true,
            }))
        );

        // Release is not a press
        let out = bridge.on_event(&event("note16@1", ControlKind::Toggle, 0), &store);
        assert_eq!(out, None);

        // After the server confirms the mute, pressing again unmutes
        store.apply_delta(3, &crate::protocol::ChannelDelta::mute(true));
        let out = bridge.on_event(&event("note16@1", ControlKind::Toggle, 127), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Command(ClientMessage::SetChannelMute {
                channel_id: 3,
                muted: false,
            }))
        );
    }

    #[test]
    fn test_absolute_on_toggle_binding_uses_press_threshold() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![MidiBinding {
            control_id: "cc20@1".to_string(),
            target: BindTarget::Solo,
            channel: Some(5),
        }]);

        assert_eq!(
            bridge.on_event(&event("cc20@1", ControlKind::Absolute, 40), &store),
            None
        );
        assert_eq!(
            bridge.on_event(&event("cc20@1", ControlKind::Absolute, 100), &store),
            Some(BridgeOutput::Command(ClientMessage::SetChannelSolo {
                channel_id: 5,
                solo: true,
            }))
        );
    }

    #[test]
    fn test_learn_captures_without_forwarding() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![]);
        bridge.arm_learn(BindTarget::Mute, Some(5));
        assert!(bridge.is_learning());

        let out = bridge.on_event(&event("note3@1", ControlKind::Toggle, 127), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Learned(MidiBinding {
                control_id: "note3@1".to_string(),
                target: BindTarget::Mute,
                channel: Some(5),
            }))
        );
        assert!(!bridge.is_learning());

        // The learned control now drives its target
        let out = bridge.on_event(&event("note3@1", ControlKind::Toggle, 127), &store);
        assert_eq!(
            out,
            Some(BridgeOutput::Command(ClientMessage::SetChannelMute {
                channel_id: 5,
                muted: true,
            }))
        );
    }

    #[test]
    fn test_learn_ignores_button_release() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![]);
        bridge.arm_learn(BindTarget::Solo, Some(3));

        // A stray release from the previous press must not be captured
        assert_eq!(
            bridge.on_event(&event("note9@1", ControlKind::Toggle, 0), &store),
            None
        );
        assert!(bridge.is_learning());
    }

    #[test]
    fn test_feedback_for_remote_change() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        let mut channel = store.channel(3).unwrap();
        channel.fader = 0.5;
        let out = bridge.on_store_update(&StoreUpdate::Channel(channel), &store);
        assert_eq!(
            out,
            vec![Feedback::Position {
                control_id: "cc7@1".to_string(),
                raw: 64,
            }]
        );
    }

    #[test]
    fn test_feedback_suppressed_after_local_touch() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        bridge.on_event(&event("cc7@1", ControlKind::Absolute, 100), &store);

        let mut channel = store.channel(3).unwrap();
        channel.fader = 0.5;
        let out = bridge.on_store_update(&StoreUpdate::Channel(channel), &store);
        assert!(out.is_empty());
    }

    #[test]
    fn test_feedback_deduplicated() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        let mut channel = store.channel(3).unwrap();
        channel.fader = 0.5;
        let first = bridge.on_store_update(&StoreUpdate::Channel(channel.clone()), &store);
        assert_eq!(first.len(), 1);
        let second = bridge.on_store_update(&StoreUpdate::Channel(channel), &store);
        assert!(second.is_empty());
    }

    #[test]
    fn test_repeated_poll_value_not_amplified() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        // A poll source delivers the same position every tick
        assert!(bridge
            .on_event(&event("cc7@1", ControlKind::Absolute, 100), &store)
            .is_some());
        for _ in 0..5 {
            assert_eq!(
                bridge.on_event(&event("cc7@1", ControlKind::Absolute, 100), &store),
                None
            );
        }
        // A genuine move still goes through
        assert!(bridge
            .on_event(&event("cc7@1", ControlKind::Absolute, 101), &store)
            .is_some());
    }

    #[test]
    fn test_motor_echo_not_forwarded() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![fader_binding("cc7@1", 3)]);

        let mut channel = store.channel(3).unwrap();
        channel.fader = 0.5;
        let out = bridge.on_store_update(&StoreUpdate::Channel(channel), &store);
        assert_eq!(out.len(), 1);

        // The surface echoes the position we just wrote
        assert_eq!(
            bridge.on_event(&event("cc7@1", ControlKind::Absolute, 64), &store),
            None
        );
    }

    #[test]
    fn test_snapshot_resyncs_all_bound_controls() {
        let store = store_with_channels();
        let mut bridge = SurfaceBridge::new(vec![
            fader_binding("cc7@1", 3),
            MidiBinding {
                control_id: "note16@1".to_string(),
                target: BindTarget::Mute,
                channel: Some(5),
            },
            MidiBinding {
                control_id: "cc14@1".to_string(),
                target: BindTarget::Master,
                channel: None,
            },
        ]);

        let out = bridge.on_store_update(&StoreUpdate::Snapshot, &store);
        assert_eq!(out.len(), 3);
        assert!(out.contains(&Feedback::Position {
            control_id: "cc14@1".to_string(),
            raw: 127,
        }));
        assert!(out.contains(&Feedback::Led {
            control_id: "note16@1".to_string(),
            on: false,
        }));
    }
}
