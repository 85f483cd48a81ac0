//! StateStore - mixer state with controlled mutation entry points and
//! subscription support
//!
//! All mutation goes through the methods below; reads are non-blocking
//! snapshots. Subscribers are notified synchronously after each atomic
//! mutation, so a partial state is never observable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use super::types::{ConnectionInfo, ConnectionStatus, StoreUpdate};
use crate::protocol::{
    Channel, ChannelDelta, ChannelId, MasterState, MeterSample, MixerSnapshot, RoutingPoint,
};

/// Minimum interval between meter publishes (~20 Hz)
const METER_PUBLISH_INTERVAL: Duration = Duration::from_millis(50);

type SubscriberFn = Arc<dyn Fn(&StoreUpdate) + Send + Sync>;

/// The single in-process source of truth for mixer state
#[derive(Clone)]
pub struct StateStore {
    channels: Arc<RwLock<BTreeMap<ChannelId, Channel>>>,
    /// Enabled routing points; absence means "not routed"
    routing: Arc<RwLock<HashSet<(ChannelId, ChannelId)>>>,
    master: Arc<RwLock<MasterState>>,
    /// Volatile meter data, kept off the channel-state locks
    meters: Arc<RwLock<HashMap<ChannelId, MeterSample>>>,
    connection: Arc<RwLock<ConnectionInfo>>,
    last_meter_publish: Arc<Mutex<Option<Instant>>>,
    subscribers: Arc<RwLock<Vec<SubscriberFn>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            channels: Arc::new(RwLock::new(BTreeMap::new())),
            routing: Arc::new(RwLock::new(HashSet::new())),
            master: Arc::new(RwLock::new(MasterState::default())),
            meters: Arc::new(RwLock::new(HashMap::new())),
            connection: Arc::new(RwLock::new(ConnectionInfo::default())),
            last_meter_publish: Arc::new(Mutex::new(None)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Subscribe to store update notifications
    pub fn subscribe<F>(&self, listener: F)
    where
        F: Fn(&StoreUpdate) + Send + Sync + 'static,
    {
        self.subscribers.write().push(Arc::new(listener));
    }

    fn publish(&self, update: StoreUpdate) {
        let subscribers = self.subscribers.read();
        for subscriber in subscribers.iter() {
            subscriber(&update);
        }
    }

    // =========================================================================
    // Mutation entry points (reconciliation engine / session only)
    // =========================================================================

    /// Replace the entire channel/routing/master set atomically
    pub fn apply_full_state(&self, snapshot: MixerSnapshot) {
        let new_channels: BTreeMap<ChannelId, Channel> = snapshot
            .channels
            .into_iter()
            .map(|c| (c.id, c))
            .collect();
        let new_routing: HashSet<(ChannelId, ChannelId)> = snapshot
            .routing
            .into_iter()
            .filter(|p| p.enabled)
            .map(|p| (p.input_channel, p.output_channel))
            .collect();

        {
            // Hold all three write locks so no reader sees a torn replacement
            let mut channels = self.channels.write();
            let mut routing = self.routing.write();
            let mut master = self.master.write();
            *channels = new_channels;
            *routing = new_routing;
            *master = snapshot.master;
        }

        trace!("Full state applied");
        self.publish(StoreUpdate::Snapshot);
    }

    /// Merge the supplied fields into one channel.
    ///
    /// Returns false (and publishes nothing) for an unknown channel id;
    /// servers may reference channels not yet known locally during a resize.
    pub fn apply_delta(&self, channel_id: ChannelId, delta: &ChannelDelta) -> bool {
        let updated = {
            let mut channels = self.channels.write();
            match channels.get_mut(&channel_id) {
                Some(channel) => {
                    if let Some(fader) = delta.fader {
                        channel.fader = fader;
                    }
                    if let Some(mute) = delta.mute {
                        channel.mute = mute;
                    }
                    if let Some(solo) = delta.solo {
                        channel.solo = solo;
                    }
                    if let Some(pan) = delta.pan {
                        channel.pan = pan;
                    }
                    if let Some(gain) = delta.gain {
                        channel.gain = gain;
                    }
                    if let Some(name) = &delta.name {
                        channel.name = name.clone();
                    }
                    if let Some(color) = &delta.color {
                        channel.color = Some(color.clone());
                    }
                    Some(channel.clone())
                }
                None => None,
            }
        };

        match updated {
            Some(channel) => {
                self.publish(StoreUpdate::Channel(channel));
                true
            }
            None => {
                trace!(channel_id, "Delta for unknown channel ignored");
                false
            }
        }
    }

    /// Merge master bus fields
    pub fn apply_master(&self, fader: Option<f32>, mute: Option<bool>) {
        let updated = {
            let mut master = self.master.write();
            if let Some(fader) = fader {
                master.fader = fader;
            }
            if let Some(mute) = mute {
                master.mute = mute;
            }
            *master
        };
        self.publish(StoreUpdate::Master(updated));
    }

    /// Upsert one routing point by (input, output) key
    pub fn upsert_routing(&self, point: RoutingPoint) {
        {
            let mut routing = self.routing.write();
            let key = (point.input_channel, point.output_channel);
            if point.enabled {
                routing.insert(key);
            } else {
                routing.remove(&key);
            }
        }
        self.publish(StoreUpdate::Routing(point));
    }

    /// Store meter samples (last-writer-wins) and publish at a bounded rate.
    ///
    /// Meters never touch the channel-state locks.
    pub fn apply_meters(&self, samples: Vec<MeterSample>) {
        {
            let mut meters = self.meters.write();
            for sample in &samples {
                meters.insert(sample.channel_id, *sample);
            }
        }

        let should_publish = {
            let mut last = self.last_meter_publish.lock();
            let now = Instant::now();
            match *last {
                Some(prev) if now.duration_since(prev) < METER_PUBLISH_INTERVAL => false,
                _ => {
                    *last = Some(now);
                    true
                }
            }
        };
        if should_publish {
            self.publish(StoreUpdate::Meters(samples));
        }
    }

    // =========================================================================
    // Connection transitions (transport session only)
    // =========================================================================

    pub fn set_connecting(&self, url: &str) {
        let info = {
            let mut connection = self.connection.write();
            connection.status = ConnectionStatus::Connecting;
            connection.server_url = Some(url.to_string());
            connection.last_error = None;
            connection.clone()
        };
        self.publish(StoreUpdate::Connection(info));
    }

    /// Successful open: resets the reconnect attempt counter
    pub fn set_connected(&self) {
        let info = {
            let mut connection = self.connection.write();
            connection.status = ConnectionStatus::Connected;
            connection.reconnect_attempts = 0;
            connection.last_error = None;
            connection.clone()
        };
        self.publish(StoreUpdate::Connection(info));
    }

    pub fn set_disconnected(&self) {
        let info = {
            let mut connection = self.connection.write();
            connection.status = ConnectionStatus::Disconnected;
            connection.clone()
        };
        self.publish(StoreUpdate::Connection(info));
    }

    /// Failure transition; increments the attempt counter and returns it
    pub fn record_error(&self, message: &str) -> u32 {
        let (info, attempts) = {
            let mut connection = self.connection.write();
            connection.status = ConnectionStatus::Error;
            connection.last_error = Some(message.to_string());
            connection.reconnect_attempts += 1;
            (connection.clone(), connection.reconnect_attempts)
        };
        self.publish(StoreUpdate::Connection(info));
        attempts
    }

    /// Fresh attempt budget for a user-initiated reconnect
    pub fn reset_reconnect_attempts(&self) {
        self.connection.write().reconnect_attempts = 0;
    }

    /// Terminal error: attempt ceiling reached, automatic recovery stops
    pub fn set_terminal_error(&self, message: &str) {
        let info = {
            let mut connection = self.connection.write();
            connection.status = ConnectionStatus::Error;
            connection.last_error = Some(message.to_string());
            connection.clone()
        };
        self.publish(StoreUpdate::Connection(info));
    }

    /// Relay a non-fatal server error to subscribers
    pub fn publish_server_error(&self, message: &str) {
        self.publish(StoreUpdate::ServerError(message.to_string()));
    }

    // =========================================================================
    // Read accessors (non-blocking snapshots)
    // =========================================================================

    pub fn channel(&self, channel_id: ChannelId) -> Option<Channel> {
        self.channels.read().get(&channel_id).cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        self.channels.read().values().cloned().collect()
    }

    pub fn master(&self) -> MasterState {
        *self.master.read()
    }

    pub fn routing_points(&self) -> Vec<RoutingPoint> {
        self.routing
            .read()
            .iter()
            .map(|&(input_channel, output_channel)| RoutingPoint {
                input_channel,
                output_channel,
                enabled: true,
            })
            .collect()
    }

    pub fn routing_enabled(&self, input: ChannelId, output: ChannelId) -> bool {
        self.routing.read().contains(&(input, output))
    }

    pub fn meter(&self, channel_id: ChannelId) -> Option<MeterSample> {
        self.meters.read().get(&channel_id).copied()
    }

    pub fn connection(&self) -> ConnectionInfo {
        self.connection.read().clone()
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}
