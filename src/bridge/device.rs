//! Physical surface I/O via midir
//!
//! Controls are addressed by a stable string id (`cc7@1`, `note16@1`,
//! `pb@1`) so bindings survive restarts and port reshuffles. The `@n`
//! suffix is the 1-based MIDI channel.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use midir::{MidiInput, MidiInputConnection, MidiOutput, MidiOutputConnection};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::bridge::{ControlEvent, ControlKind, Feedback};
use crate::midi::{self, MidiMessage};

const CLIENT_NAME: &str = "mixremote";

/// Physical address of one control
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlAddress {
    /// Control change `cc` on 0-based MIDI channel `channel`
    Cc { channel: u8, cc: u8 },
    /// Note `note` on 0-based MIDI channel `channel`
    Note { channel: u8, note: u8 },
    /// Pitch-bend lever on 0-based MIDI channel `channel`
    PitchBend { channel: u8 },
}

impl fmt::Display for ControlAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ControlAddress::Cc { channel, cc } => write!(f, "cc{}@{}", cc, channel + 1),
            ControlAddress::Note { channel, note } => write!(f, "note{}@{}", note, channel + 1),
            ControlAddress::PitchBend { channel } => write!(f, "pb@{}", channel + 1),
        }
    }
}

impl FromStr for ControlAddress {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (head, chan) = s
            .split_once('@')
            .ok_or_else(|| anyhow!("control id '{s}' is missing the @channel suffix"))?;
        let channel: u8 = chan
            .parse::<u8>()
            .ok()
            .and_then(|c| c.checked_sub(1))
            .filter(|c| *c < 16)
            .ok_or_else(|| anyhow!("control id '{s}' has an invalid MIDI channel"))?;

        if let Some(num) = head.strip_prefix("cc") {
            let cc: u8 = num.parse().context("bad cc number")?;
            return Ok(ControlAddress::Cc { channel, cc });
        }
        if let Some(num) = head.strip_prefix("note") {
            let note: u8 = num.parse().context("bad note number")?;
            return Ok(ControlAddress::Note { channel, note });
        }
        if head == "pb" {
            return Ok(ControlAddress::PitchBend { channel });
        }
        Err(anyhow!("unknown control id '{s}'"))
    }
}

/// Reduce a parsed MIDI message to a surface control event
pub fn event_from_midi(msg: MidiMessage) -> Option<ControlEvent> {
    match msg {
        MidiMessage::ControlChange { channel, cc, value } => Some(ControlEvent {
            control_id: ControlAddress::Cc { channel, cc }.to_string(),
            kind: ControlKind::Absolute,
            raw: value,
        }),
        MidiMessage::NoteOn {
            channel,
            note,
            velocity,
        } => Some(ControlEvent {
            control_id: ControlAddress::Note { channel, note }.to_string(),
            kind: ControlKind::Toggle,
            raw: velocity,
        }),
        MidiMessage::NoteOff { channel, note, .. } => Some(ControlEvent {
            control_id: ControlAddress::Note { channel, note }.to_string(),
            kind: ControlKind::Toggle,
            raw: 0,
        }),
        MidiMessage::PitchBend { channel, value } => Some(ControlEvent {
            control_id: ControlAddress::PitchBend { channel }.to_string(),
            kind: ControlKind::Absolute,
            raw: midi::convert::to_7bit(value),
        }),
    }
}

/// Translate feedback into the MIDI message for its control
pub fn midi_for_feedback(feedback: &Feedback) -> Result<MidiMessage> {
    let address: ControlAddress = feedback.control_id().parse()?;
    let msg = match (*feedback).clone() {
        Feedback::Position { raw, .. } => match address {
            ControlAddress::Cc { channel, cc } => MidiMessage::ControlChange {
                channel,
                cc,
                value: raw,
            },
            ControlAddress::PitchBend { channel } => MidiMessage::PitchBend {
                channel,
                value: midi::convert::to_14bit(raw),
            },
            ControlAddress::Note { .. } => {
                return Err(anyhow!("position feedback on a button control"));
            }
        },
        Feedback::Led { on, .. } => match address {
            ControlAddress::Note { channel, note } => MidiMessage::NoteOn {
                channel,
                note,
                velocity: if on { 127 } else { 0 },
            },
            _ => return Err(anyhow!("LED feedback on a non-button control")),
        },
    };
    Ok(msg)
}

/// Open MIDI connection to the surface. Input events arrive on the channel
/// handed to [`MidirSurface::open`].
pub struct MidirSurface {
    port_name: String,
    _input: MidiInputConnection<()>,
    output: MidiOutputConnection,
}

impl MidirSurface {
    /// Names of all available (input, output) ports
    pub fn list_ports() -> Result<(Vec<String>, Vec<String>)> {
        let input = MidiInput::new(CLIENT_NAME)?;
        let output = MidiOutput::new(CLIENT_NAME)?;
        let inputs = input
            .ports()
            .iter()
            .filter_map(|p| input.port_name(p).ok())
            .collect();
        let outputs = output
            .ports()
            .iter()
            .filter_map(|p| output.port_name(p).ok())
            .collect();
        Ok((inputs, outputs))
    }

    /// Connect to the first input and output port whose names contain the
    /// given substrings (case-insensitive)
    pub fn open(
        input_port: &str,
        output_port: &str,
        tx: mpsc::UnboundedSender<ControlEvent>,
    ) -> Result<Self> {
        let input = MidiInput::new(CLIENT_NAME)?;
        let in_port = find_input_port(&input, input_port)
            .ok_or_else(|| anyhow!("no MIDI input port matching '{input_port}'"))?;
        let in_name = input.port_name(&in_port)?;

        let output = MidiOutput::new(CLIENT_NAME)?;
        let out_port = find_output_port(&output, output_port)
            .ok_or_else(|| anyhow!("no MIDI output port matching '{output_port}'"))?;
        let out_name = output.port_name(&out_port)?;

        let connection = input
            .connect(
                &in_port,
                CLIENT_NAME,
                move |_ts, bytes, _| {
                    trace!(data = %midi::format_hex(bytes), "<- surface");
                    let Some(msg) = MidiMessage::parse(bytes) else {
                        return;
                    };
                    if let Some(event) = event_from_midi(msg) {
                        // Receiver gone means the app is shutting down
                        let _ = tx.send(event);
                    }
                },
                (),
            )
            .map_err(|e| anyhow!("failed to open MIDI input '{in_name}': {e}"))?;

        let out_connection = output
            .connect(&out_port, CLIENT_NAME)
            .map_err(|e| anyhow!("failed to open MIDI output '{out_name}': {e}"))?;

        debug!(input = %in_name, output = %out_name, "Surface connected");
        Ok(Self {
            port_name: in_name,
            _input: connection,
            output: out_connection,
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    /// Write one feedback update to the surface. Errors are reported, not
    /// retried; the next state change will try again.
    pub fn send_feedback(&mut self, feedback: &Feedback) -> Result<()> {
        let msg = midi_for_feedback(feedback)?;
        let bytes = msg.encode();
        trace!(data = %midi::format_hex(&bytes), "-> surface");
        self.output
            .send(&bytes)
            .map_err(|e| anyhow!("MIDI send failed: {e}"))?;
        Ok(())
    }
}

/// A control source that can only be sampled, not subscribed to.
///
/// Some surfaces (and virtual ones in particular) expose no event callback;
/// the poll adapter turns them into the same [`ControlEvent`] stream the
/// midir callback produces.
pub trait PollSource: Send + 'static {
    /// Current value of every control the source exposes
    fn sample(&mut self) -> Vec<(ControlAddress, ControlKind, u8)>;
}

/// 100 Hz is well under the motion resolution of a hand on a fader
pub const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Reduce one sample to the values that changed since the previous tick
pub fn diff_sample(
    last: &mut HashMap<String, u8>,
    sample: Vec<(ControlAddress, ControlKind, u8)>,
) -> Vec<ControlEvent> {
    let mut out = Vec::new();
    for (address, kind, raw) in sample {
        let id = address.to_string();
        if last.get(&id) == Some(&raw) {
            continue;
        }
        last.insert(id.clone(), raw);
        out.push(ControlEvent {
            control_id: id,
            kind,
            raw,
        });
    }
    out
}

/// Drive a poll-only source at a fixed rate, emitting only changed values
pub fn spawn_poll_adapter<S: PollSource>(
    mut source: S,
    tx: mpsc::UnboundedSender<ControlEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut last = HashMap::new();
        let mut tick = tokio::time::interval(POLL_INTERVAL);
        loop {
            tick.tick().await;
            for event in diff_sample(&mut last, source.sample()) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        }
    })
}

fn find_input_port(input: &MidiInput, needle: &str) -> Option<midir::MidiInputPort> {
    let needle = needle.to_lowercase();
    input.ports().into_iter().find(|port| {
        input
            .port_name(port)
            .map(|name| name.to_lowercase().contains(&needle))
            .unwrap_or(false)
    })
}

fn find_output_port(output: &MidiOutput, needle: &str) -> Option<midir::MidiOutputPort> {
    let needle = needle.to_lowercase();
    output.ports().into_iter().find(|port| {
        output
            .port_name(port)
            .map(|name| name.to_lowercase().contains(&needle))
            .unwrap_or(false)
    })
}

/// Log available ports at startup so users can fill in the config
pub fn log_ports() {
    match MidirSurface::list_ports() {
        Ok((inputs, outputs)) => {
            for name in &inputs {
                debug!(port = %name, "MIDI input available");
            }
            for name in &outputs {
                debug!(port = %name, "MIDI output available");
            }
        }
        Err(err) => warn!(%err, "Could not enumerate MIDI ports"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_address_roundtrip() {
        let addrs = [
            ControlAddress::Cc { channel: 0, cc: 7 },
            ControlAddress::Note {
                channel: 1,
                note: 16,
            },
            ControlAddress::PitchBend { channel: 8 },
        ];
        for addr in addrs {
            let id = addr.to_string();
            assert_eq!(id.parse::<ControlAddress>().unwrap(), addr);
        }
        assert_eq!(
            ControlAddress::Cc { channel: 0, cc: 7 }.to_string(),
            "cc7@1"
        );
    }

    #[test]
    fn test_control_address_rejects_garbage() {
        assert!("cc7".parse::<ControlAddress>().is_err());
        assert!("cc7@0".parse::<ControlAddress>().is_err());
        assert!("cc7@17".parse::<ControlAddress>().is_err());
        assert!("xyz@1".parse::<ControlAddress>().is_err());
    }

    #[test]
    fn test_event_from_cc() {
        let event = event_from_midi(MidiMessage::ControlChange {
            channel: 0,
            cc: 7,
            value: 100,
        })
        .unwrap();
        assert_eq!(event.control_id, "cc7@1");
        assert_eq!(event.kind, ControlKind::Absolute);
        assert_eq!(event.raw, 100);
    }

    #[test]
    fn test_event_from_note_off_is_release() {
        let event = event_from_midi(MidiMessage::NoteOff {
            channel: 0,
            note: 16,
            velocity: 64,
        })
        .unwrap();
        assert_eq!(event.control_id, "note16@1");
        assert_eq!(event.raw, 0);
    }

    #[test]
    fn test_pitch_bend_reduced_to_7bit() {
        let event = event_from_midi(MidiMessage::PitchBend {
            channel: 0,
            value: 16383,
        })
        .unwrap();
        assert_eq!(event.control_id, "pb@1");
        assert_eq!(event.raw, 127);
    }

    #[test]
    fn test_diff_sample_emits_only_changes() {
        let fader = ControlAddress::Cc { channel: 0, cc: 7 };
        let button = ControlAddress::Note {
            channel: 0,
            note: 16,
        };
        let mut last = HashMap::new();

        let first = diff_sample(
            &mut last,
            vec![
                (fader, ControlKind::Absolute, 100),
                (button, ControlKind::Toggle, 0),
            ],
        );
        assert_eq!(first.len(), 2);

        // Unchanged tick: nothing
        let second = diff_sample(
            &mut last,
            vec![
                (fader, ControlKind::Absolute, 100),
                (button, ControlKind::Toggle, 0),
            ],
        );
        assert!(second.is_empty());

        // One control moved
        let third = diff_sample(
            &mut last,
            vec![
                (fader, ControlKind::Absolute, 101),
                (button, ControlKind::Toggle, 0),
            ],
        );
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].control_id, "cc7@1");
        assert_eq!(third[0].raw, 101);
    }

    #[tokio::test]
    async fn test_poll_adapter_forwards_changes() {
        struct Script {
            ticks: u8,
        }
        impl PollSource for Script {
            fn sample(&mut self) -> Vec<(ControlAddress, ControlKind, u8)> {
                self.ticks = self.ticks.saturating_add(1);
                // Holds at 50 for three ticks, then moves
                let raw = if self.ticks < 4 { 50 } else { 90 };
                vec![(ControlAddress::Cc { channel: 0, cc: 7 }, ControlKind::Absolute, raw)]
            }
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = spawn_poll_adapter(Script { ticks: 0 }, tx);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.raw, 50);
        let second = rx.recv().await.unwrap();
        assert_eq!(second.raw, 90);

        handle.abort();
    }

    #[test]
    fn test_feedback_to_midi() {
        let msg = midi_for_feedback(&Feedback::Position {
            control_id: "cc7@1".to_string(),
            raw: 64,
        })
        .unwrap();
        assert_eq!(
            msg,
            MidiMessage::ControlChange {
                channel: 0,
                cc: 7,
                value: 64,
            }
        );

        let msg = midi_for_feedback(&Feedback::Led {
            control_id: "note16@2".to_string(),
            on: true,
        })
        .unwrap();
        assert_eq!(
            msg,
            MidiMessage::NoteOn {
                channel: 1,
                note: 16,
                velocity: 127,
            }
        );

        // Position on a button makes no sense
        assert!(midi_for_feedback(&Feedback::Position {
            control_id: "note16@1".to_string(),
            raw: 10,
        })
        .is_err());
    }
}
