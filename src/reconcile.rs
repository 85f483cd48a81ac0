//! Reconciliation engine: merges server snapshots, server deltas, and
//! locally-initiated optimistic changes
//!
//! Local mutations are applied to the store immediately for responsiveness,
//! recorded as pending commands, and sent to the server. A server echo for
//! the same key retires the pending entry and the server value wins, even
//! when it differs from the optimistic guess. Pendings that are never
//! confirmed revert to the last server-confirmed value after a timeout, and
//! a full snapshot clears them all unconditionally.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    is_input_channel, is_output_channel, Channel, ChannelDelta, ChannelId, ClientMessage,
    RoutingPoint, ServerMessage,
};
use crate::state::StateStore;

/// Default window after which an unconfirmed command reverts
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(3);

/// Outbound command seam; implemented by the transport session.
///
/// Returns true if the command was accepted for delivery.
pub trait CommandSink: Send + Sync {
    fn send(&self, cmd: ClientMessage) -> bool;
}

/// Channel field a pending command targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelField {
    Fader,
    Mute,
    Solo,
    Pan,
    Gain,
}

/// Key identifying one optimistically-mutated value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PendingKey {
    Channel {
        channel_id: ChannelId,
        field: ChannelField,
    },
    Routing {
        input: ChannelId,
        output: ChannelId,
    },
    Master,
}

/// A typed write to one channel field; the value kind is fixed by the
/// variant, so a field can never be paired with the wrong value type
#[derive(Debug, Clone, Copy, PartialEq)]
enum FieldWrite {
    Fader(f32),
    Mute(bool),
    Solo(bool),
    Pan(f32),
    Gain(f32),
}

impl FieldWrite {
    fn field(self) -> ChannelField {
        match self {
            FieldWrite::Fader(_) => ChannelField::Fader,
            FieldWrite::Mute(_) => ChannelField::Mute,
            FieldWrite::Solo(_) => ChannelField::Solo,
            FieldWrite::Pan(_) => ChannelField::Pan,
            FieldWrite::Gain(_) => ChannelField::Gain,
        }
    }

    fn delta(self) -> ChannelDelta {
        match self {
            FieldWrite::Fader(v) => ChannelDelta::fader(v),
            FieldWrite::Mute(v) => ChannelDelta::mute(v),
            FieldWrite::Solo(v) => ChannelDelta::solo(v),
            FieldWrite::Pan(v) => ChannelDelta::pan(v),
            FieldWrite::Gain(v) => ChannelDelta::gain(v),
        }
    }

    fn command(self, channel_id: ChannelId) -> ClientMessage {
        match self {
            FieldWrite::Fader(value) => ClientMessage::SetChannelFader { channel_id, value },
            FieldWrite::Mute(muted) => ClientMessage::SetChannelMute { channel_id, muted },
            FieldWrite::Solo(solo) => ClientMessage::SetChannelSolo { channel_id, solo },
            FieldWrite::Pan(pan) => ClientMessage::SetChannelPan { channel_id, pan },
            FieldWrite::Gain(gain) => ClientMessage::SetChannelGain { channel_id, gain },
        }
    }

    /// The same field's current value in `channel`
    fn current(self, channel: &Channel) -> FieldWrite {
        match self {
            FieldWrite::Fader(_) => FieldWrite::Fader(channel.fader),
            FieldWrite::Mute(_) => FieldWrite::Mute(channel.mute),
            FieldWrite::Solo(_) => FieldWrite::Solo(channel.solo),
            FieldWrite::Pan(_) => FieldWrite::Pan(channel.pan),
            FieldWrite::Gain(_) => FieldWrite::Gain(channel.gain),
        }
    }
}

/// Store mutation that undoes one optimistic change, built at record time
/// so expiry only replays it
#[derive(Debug, Clone)]
enum RevertAction {
    Channel {
        channel_id: ChannelId,
        delta: ChannelDelta,
    },
    Routing(RoutingPoint),
    Master {
        fader: f32,
    },
}

/// An optimistically-applied local mutation awaiting server confirmation
#[derive(Debug, Clone)]
struct PendingCommand {
    /// Restores the last server-confirmed value on timeout
    revert: RevertAction,
    sent_at: Instant,
}

pub struct ReconcileEngine {
    store: Arc<StateStore>,
    sink: Arc<dyn CommandSink>,
    pending: Mutex<HashMap<PendingKey, PendingCommand>>,
    timeout: Duration,
}

impl ReconcileEngine {
    pub fn new(store: Arc<StateStore>, sink: Arc<dyn CommandSink>, timeout: Duration) -> Self {
        Self {
            store,
            sink,
            pending: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Number of outstanding pending commands
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    // =========================================================================
    // Local mutation entry points (UI and device bridge)
    // =========================================================================

    /// Route a protocol command through the optimistic path.
    ///
    /// Mutating commands are applied locally and tracked; anything else goes
    /// straight to the sink. Returns false when nothing was done (unknown
    /// channel, invalid routing point, or the sink refused the command while
    /// disconnected).
    pub fn submit(&self, cmd: ClientMessage) -> bool {
        match cmd {
            ClientMessage::SetChannelFader { channel_id, value } => {
                self.set_channel_field(channel_id, FieldWrite::Fader(value))
            }
            ClientMessage::SetChannelMute { channel_id, muted } => {
                self.set_channel_field(channel_id, FieldWrite::Mute(muted))
            }
            ClientMessage::SetChannelSolo { channel_id, solo } => {
                self.set_channel_field(channel_id, FieldWrite::Solo(solo))
            }
            ClientMessage::SetChannelPan { channel_id, pan } => {
                self.set_channel_field(channel_id, FieldWrite::Pan(pan))
            }
            ClientMessage::SetChannelGain { channel_id, gain } => {
                self.set_channel_field(channel_id, FieldWrite::Gain(gain))
            }
            ClientMessage::SetMasterFader { value } => self.set_master_fader(value),
            ClientMessage::SetRouting {
                input_channel,
                output_channel,
                enabled,
            } => self.set_routing(input_channel, output_channel, enabled),
            other => self.sink.send(other),
        }
    }

    /// Optimistically set one field of one channel
    fn set_channel_field(&self, channel_id: ChannelId, write: FieldWrite) -> bool {
        let Some(channel) = self.store.channel(channel_id) else {
            debug!(channel_id, ?write, "Local change for unknown channel dropped");
            return false;
        };

        let key = PendingKey::Channel {
            channel_id,
            field: write.field(),
        };
        let revert = RevertAction::Channel {
            channel_id,
            delta: write.current(&channel).delta(),
        };
        self.record_pending(key, revert);

        self.store.apply_delta(channel_id, &write.delta());
        self.sink.send(write.command(channel_id));
        true
    }

    /// Optimistically set the master fader
    fn set_master_fader(&self, value: f32) -> bool {
        let revert = RevertAction::Master {
            fader: self.store.master().fader,
        };
        self.record_pending(PendingKey::Master, revert);

        self.store.apply_master(Some(value), None);
        self.sink.send(ClientMessage::SetMasterFader { value });
        true
    }

    /// Optimistically set one routing point
    fn set_routing(&self, input: ChannelId, output: ChannelId, enabled: bool) -> bool {
        if !is_input_channel(input) || !is_output_channel(output) {
            debug!(input, output, "Routing point outside the id bands dropped");
            return false;
        }

        let revert = RevertAction::Routing(RoutingPoint {
            input_channel: input,
            output_channel: output,
            enabled: self.store.routing_enabled(input, output),
        });
        self.record_pending(PendingKey::Routing { input, output }, revert);

        self.store.upsert_routing(RoutingPoint {
            input_channel: input,
            output_channel: output,
            enabled,
        });
        self.sink.send(ClientMessage::SetRouting {
            input_channel: input,
            output_channel: output,
            enabled,
        });
        true
    }

    /// Record a pending command, preserving the original revert target when
    /// a newer local change supersedes an unconfirmed one for the same key
    fn record_pending(&self, key: PendingKey, revert: RevertAction) {
        let mut pending = self.pending.lock();
        let revert = pending
            .remove(&key)
            .map(|prev| prev.revert)
            .unwrap_or(revert);
        pending.insert(
            key,
            PendingCommand {
                revert,
                sent_at: Instant::now(),
            },
        );
        trace!(?key, "Pending recorded");
    }

    // =========================================================================
    // Server event ingress (applied strictly in receipt order)
    // =========================================================================

    pub fn on_server_message(&self, msg: ServerMessage) {
        match msg {
            ServerMessage::FullState { state } => {
                // A fresh snapshot always wins over speculative local state
                let cleared = {
                    let mut pending = self.pending.lock();
                    let n = pending.len();
                    pending.clear();
                    n
                };
                if cleared > 0 {
                    debug!(cleared, "Snapshot cleared pending commands");
                }
                self.store.apply_full_state(state);
            }
            ServerMessage::ChannelUpdate { channel_id, fields } => {
                self.retire_confirmed(channel_id, &fields);
                self.store.apply_delta(channel_id, &fields);
            }
            ServerMessage::RoutingUpdate {
                input_channel,
                output_channel,
                enabled,
            } => {
                self.pending.lock().remove(&PendingKey::Routing {
                    input: input_channel,
                    output: output_channel,
                });
                self.store.upsert_routing(RoutingPoint {
                    input_channel,
                    output_channel,
                    enabled,
                });
            }
            ServerMessage::MasterUpdate { fader, mute } => {
                if fader.is_some() {
                    self.pending.lock().remove(&PendingKey::Master);
                }
                self.store.apply_master(fader, mute);
            }
            ServerMessage::MeterUpdate { meters } => {
                // Non-authoritative: last-writer-wins, never reconciled
                self.store.apply_meters(meters);
            }
            ServerMessage::Pong => {
                trace!("Pong");
            }
            ServerMessage::Error { message } => {
                warn!(%message, "Server reported an error");
                self.store.publish_server_error(&message);
            }
            ServerMessage::SceneSaved { name } => {
                info!(%name, "Scene saved");
            }
            ServerMessage::SceneRecalled { name } => {
                info!(%name, "Scene recalled");
            }
        }
    }

    /// Retire pendings confirmed by a channel update.
    ///
    /// The server value becomes authoritative even if it differs from the
    /// optimistic one; a mismatch just means the optimistic guess was wrong.
    fn retire_confirmed(&self, channel_id: ChannelId, fields: &ChannelDelta) {
        let mut pending = self.pending.lock();
        let mut retire = |field: ChannelField| {
            pending.remove(&PendingKey::Channel { channel_id, field });
        };
        if fields.fader.is_some() {
            retire(ChannelField::Fader);
        }
        if fields.mute.is_some() {
            retire(ChannelField::Mute);
        }
        if fields.solo.is_some() {
            retire(ChannelField::Solo);
        }
        if fields.pan.is_some() {
            retire(ChannelField::Pan);
        }
        if fields.gain.is_some() {
            retire(ChannelField::Gain);
        }
    }

    // =========================================================================
    // Timeout reversion
    // =========================================================================

    /// Revert pendings older than the timeout window to the last
    /// server-confirmed value. Called periodically from the event loop.
    pub fn expire(&self) {
        self.expire_at(Instant::now());
    }

    fn expire_at(&self, now: Instant) {
        let expired: Vec<(PendingKey, RevertAction)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<PendingKey> = pending
                .iter()
                .filter(|(_, cmd)| now.duration_since(cmd.sent_at) >= self.timeout)
                .map(|(key, _)| *key)
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|cmd| (key, cmd.revert)))
                .collect()
        };

        for (key, revert) in expired {
            debug!(?key, "Pending timed out, reverting");
            match revert {
                RevertAction::Channel { channel_id, delta } => {
                    self.store.apply_delta(channel_id, &delta);
                }
                RevertAction::Routing(point) => {
                    self.store.upsert_routing(point);
                }
                RevertAction::Master { fader } => {
                    self.store.apply_master(Some(fader), None);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MasterState, MixerSnapshot};

    struct RecordingSink {
        sent: Mutex<Vec<ClientMessage>>,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<ClientMessage> {
            self.sent.lock().clone()
        }
    }

    impl CommandSink for RecordingSink {
        fn send(&self, cmd: ClientMessage) -> bool {
            self.sent.lock().push(cmd);
            true
        }
    }

    fn engine_with_channels(
        timeout: Duration,
    ) -> (Arc<StateStore>, Arc<RecordingSink>, ReconcileEngine) {
        let store = Arc::new(StateStore::new());
        store.apply_full_state(MixerSnapshot {
            channels: vec![Channel::new(3, "Mic 3"), Channel::new(1000, "Main")],
            routing: Vec::new(),
            master: MasterState {
                fader: 1.0,
                mute: false,
            },
        });
        let sink = RecordingSink::new();
        let engine = ReconcileEngine::new(store.clone(), sink.clone(), timeout);
        (store, sink, engine)
    }

    #[test]
    fn test_optimistic_apply_and_send() {
        let (store, sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);

        assert!(engine.submit(ClientMessage::SetChannelFader {
            channel_id: 3,
            value: 0.6,
        }));
        assert_eq!(store.channel(3).unwrap().fader, 0.6);
        assert_eq!(engine.pending_len(), 1);
        assert_eq!(
            sink.sent(),
            vec![ClientMessage::SetChannelFader {
                channel_id: 3,
                value: 0.6,
            }]
        );
    }

    #[test]
    fn test_unknown_channel_dropped() {
        let (_store, sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);
        assert!(!engine.submit(ClientMessage::SetChannelFader {
            channel_id: 99,
            value: 0.6,
        }));
        assert!(sink.sent().is_empty());
        assert_eq!(engine.pending_len(), 0);
    }

    #[test]
    fn test_routing_outside_bands_dropped() {
        let (store, sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);

        // Output-band id on the input side
        assert!(!engine.submit(ClientMessage::SetRouting {
            input_channel: 1000,
            output_channel: 1000,
            enabled: true,
        }));
        // Input-band id on the output side
        assert!(!engine.submit(ClientMessage::SetRouting {
            input_channel: 3,
            output_channel: 3,
            enabled: true,
        }));
        assert!(sink.sent().is_empty());
        assert_eq!(engine.pending_len(), 0);
        assert!(!store.routing_enabled(1000, 1000));
    }

    #[test]
    fn test_confirmation_retires_pending_and_server_wins() {
        let (store, _sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);

        engine.submit(ClientMessage::SetChannelFader {
            channel_id: 3,
            value: 0.6,
        });
        // Server echoes a different value: the optimistic guess was wrong
        engine.on_server_message(ServerMessage::ChannelUpdate {
            channel_id: 3,
            fields: ChannelDelta::fader(0.55),
        });

        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.channel(3).unwrap().fader, 0.55);
    }

    #[test]
    fn test_timeout_reverts_to_server_value() {
        let (store, _sink, engine) = engine_with_channels(Duration::from_millis(10));

        engine.submit(ClientMessage::SetChannelFader {
            channel_id: 3,
            value: 0.6,
        });
        assert_eq!(store.channel(3).unwrap().fader, 0.6);

        // Re-drag before confirmation: revert target stays the original
        engine.submit(ClientMessage::SetChannelFader {
            channel_id: 3,
            value: 0.9,
        });
        assert_eq!(engine.pending_len(), 1);

        engine.expire_at(Instant::now() + Duration::from_millis(20));
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.channel(3).unwrap().fader, 0.0);
    }

    #[test]
    fn test_snapshot_clears_all_pendings() {
        let (store, _sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);

        engine.submit(ClientMessage::SetChannelFader {
            channel_id: 3,
            value: 0.6,
        });
        engine.submit(ClientMessage::SetChannelMute {
            channel_id: 3,
            muted: true,
        });
        engine.submit(ClientMessage::SetRouting {
            input_channel: 3,
            output_channel: 1000,
            enabled: true,
        });
        assert_eq!(engine.pending_len(), 3);

        // Snapshot with channel 3 fader = 0.5 arrives before any echo
        engine.on_server_message(ServerMessage::FullState {
            state: MixerSnapshot {
                channels: vec![Channel {
                    fader: 0.5,
                    ..Channel::new(3, "Mic 3")
                }],
                routing: Vec::new(),
                master: MasterState::default(),
            },
        });

        assert_eq!(engine.pending_len(), 0);
        // Snapshot wins even over pending optimism
        assert_eq!(store.channel(3).unwrap().fader, 0.5);
        assert!(!store.channel(3).unwrap().mute);
        assert!(!store.routing_enabled(3, 1000));

        // And expiry afterwards must not resurrect reverted values
        engine.expire_at(Instant::now() + Duration::from_secs(60));
        assert_eq!(store.channel(3).unwrap().fader, 0.5);
    }

    #[test]
    fn test_routing_confirm_and_timeout() {
        let (store, _sink, engine) = engine_with_channels(Duration::from_millis(10));

        engine.submit(ClientMessage::SetRouting {
            input_channel: 3,
            output_channel: 1000,
            enabled: true,
        });
        assert!(store.routing_enabled(3, 1000));

        // Unconfirmed: reverts to not-routed
        engine.expire_at(Instant::now() + Duration::from_millis(20));
        assert!(!store.routing_enabled(3, 1000));

        // Confirmed: stays routed and pending is gone
        engine.submit(ClientMessage::SetRouting {
            input_channel: 3,
            output_channel: 1000,
            enabled: true,
        });
        engine.on_server_message(ServerMessage::RoutingUpdate {
            input_channel: 3,
            output_channel: 1000,
            enabled: true,
        });
        assert_eq!(engine.pending_len(), 0);
        engine.expire_at(Instant::now() + Duration::from_secs(60));
        assert!(store.routing_enabled(3, 1000));
    }

    #[test]
    fn test_master_fader_optimistic_path() {
        let (store, sink, engine) = engine_with_channels(Duration::from_millis(10));

        engine.submit(ClientMessage::SetMasterFader { value: 0.7 });
        assert_eq!(store.master().fader, 0.7);
        assert_eq!(sink.sent(), vec![ClientMessage::SetMasterFader { value: 0.7 }]);

        engine.expire_at(Instant::now() + Duration::from_millis(20));
        assert_eq!(store.master().fader, 1.0);
    }

    #[test]
    fn test_meters_never_reconciled() {
        let (store, _sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);
        engine.on_server_message(ServerMessage::MeterUpdate {
            meters: vec![crate::protocol::MeterSample {
                channel_id: 3,
                level: 0.2,
                peak: 0.3,
            }],
        });
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(store.meter(3).unwrap().level, 0.2);
    }

    #[test]
    fn test_non_mutating_commands_pass_through() {
        let (_store, sink, engine) = engine_with_channels(DEFAULT_PENDING_TIMEOUT);
        engine.submit(ClientMessage::SaveScene {
            name: "show".to_string(),
        });
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(
            sink.sent(),
            vec![ClientMessage::SaveScene {
                name: "show".to_string(),
            }]
        );
    }
}
