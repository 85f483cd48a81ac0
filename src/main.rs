//! mixremote: remote control client for a networked audio mixer
//!
//! Connects to the mixer server over WebSocket, keeps a local mirror of the
//! mixer state, and bridges a MIDI control surface onto it.

mod bridge;
mod config;
mod discovery;
mod midi;
mod protocol;
mod reconcile;
mod session;
mod state;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::bridge::device::MidirSurface;
use crate::bridge::surface::{BridgeOutput, SurfaceBridge};
use crate::config::AppConfig;
use crate::discovery::{rank_candidates, Discovery, StaticDiscovery};
use crate::protocol::{BindTarget, ChannelId, ClientMessage, MidiBinding};
use crate::reconcile::ReconcileEngine;
use crate::session::TransportSession;
use crate::state::{StateStore, StoreUpdate};

/// How often timed-out optimistic changes are swept
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Parser)]
#[command(name = "mixremote", version, about = "Mixer remote control client")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "MIXREMOTE_CONFIG")]
    config: Option<PathBuf>,

    /// Server WebSocket URL, overriding config and discovery
    #[arg(short, long, env = "MIXREMOTE_SERVER")]
    server: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    Ok(())
}

/// Console commands accepted on stdin while running
#[derive(Debug, Clone, PartialEq)]
enum ConsoleCommand {
    Learn {
        target: BindTarget,
        channel: Option<ChannelId>,
    },
    CancelLearn,
    SaveScene(String),
    RecallScene(String),
    Meters(bool),
    Quit,
}

fn parse_console_command(line: &str) -> Option<ConsoleCommand> {
    let mut words = line.split_whitespace();
    match words.next()? {
        "learn" => {
            let target = BindTarget::parse(words.next()?)?;
            let channel = match target {
                BindTarget::Master => None,
                _ => Some(words.next()?.parse().ok()?),
            };
            Some(ConsoleCommand::Learn { target, channel })
        }
        "cancel" => Some(ConsoleCommand::CancelLearn),
        "save" => Some(ConsoleCommand::SaveScene(words.next()?.to_string())),
        "recall" => Some(ConsoleCommand::RecallScene(words.next()?.to_string())),
        "meters" => match words.next()? {
            "on" => Some(ConsoleCommand::Meters(true)),
            "off" => Some(ConsoleCommand::Meters(false)),
            _ => None,
        },
        "quit" | "exit" => Some(ConsoleCommand::Quit),
        _ => None,
    }
}

/// Pick the server URL: explicit flag, then last-used, then best-ranked
/// discovery candidate
async fn resolve_server_url(args: &Args, config: &AppConfig) -> Result<String> {
    if let Some(url) = &args.server {
        return Ok(url.clone());
    }
    if let Some(url) = &config.server.url {
        return Ok(url.clone());
    }
    let discovery = StaticDiscovery::new(config.server.candidates.clone());
    let candidates = discovery.discover().await?;
    let ranked = rank_candidates(candidates, config.server.url.as_deref());
    ranked
        .first()
        .map(|c| {
            info!(server = %c.name, url = %c.ws_url(), "Discovered server");
            c.ws_url()
        })
        .ok_or_else(|| anyhow!("no server configured; set server.url or pass --server"))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    if args.list_ports {
        let (inputs, outputs) = MidirSurface::list_ports()?;
        println!("MIDI inputs:");
        for name in inputs {
            println!("  {name}");
        }
        println!("MIDI outputs:");
        for name in outputs {
            println!("  {name}");
        }
        return Ok(());
    }

    let config_path = args
        .config
        .clone()
        .unwrap_or_else(AppConfig::default_path);
    let mut config = AppConfig::load_or_default(&config_path)?;

    let url = resolve_server_url(&args, &config).await?;
    if config.server.url.as_deref() != Some(&url) {
        config.server.url = Some(url.clone());
        if let Err(err) = config.save(&config_path) {
            warn!(%err, "Could not persist server URL");
        }
    }

    let store = Arc::new(StateStore::new());
    let (session, mut server_events) = TransportSession::new(url, store.clone());
    let engine = Arc::new(ReconcileEngine::new(
        store.clone(),
        Arc::new(session.clone()),
        config.timing.pending_timeout(),
    ));

    // Store updates fan out synchronously; hand them to the loop via a queue
    let (update_tx, mut update_rx) = mpsc::unbounded_channel::<StoreUpdate>();
    store.subscribe(move |update| {
        let _ = update_tx.send(update.clone());
    });

    let (midi_tx, mut midi_rx) = mpsc::unbounded_channel();
    let mut surface = match MidirSurface::open(
        &config.midi.input_port,
        &config.midi.output_port,
        midi_tx,
    ) {
        Ok(surface) => {
            info!(port = %surface.port_name(), "MIDI surface ready");
            Some(surface)
        }
        Err(err) if config.midi.optional => {
            warn!(%err, "Running without a MIDI surface");
            bridge::device::log_ports();
            None
        }
        Err(err) => return Err(err),
    };
    let mut surface_bridge = SurfaceBridge::new(config.bindings.clone());

    session.connect();

    let mut expiry = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            event = server_events.recv() => {
                let Some(event) = event else { break };
                engine.on_server_message(event);
            }
            control = midi_rx.recv() => {
                let Some(control) = control else { break };
                match surface_bridge.on_event(&control, &store) {
                    Some(BridgeOutput::Command(cmd)) => {
                        engine.submit(cmd);
                    }
                    Some(BridgeOutput::Learned(binding)) => {
                        remember_binding(&mut config, binding);
                        if let Err(err) = config.save(&config_path) {
                            error!(%err, "Could not persist learned binding");
                        }
                    }
                    None => {}
                }
            }
            update = update_rx.recv() => {
                let Some(update) = update else { break };
                if let Some(device) = surface.as_mut() {
                    let mut failed = false;
                    for feedback in surface_bridge.on_store_update(&update, &store) {
                        if let Err(err) = device.send_feedback(&feedback) {
                            error!(%err, "Surface write failed, detaching surface");
                            failed = true;
                            break;
                        }
                    }
                    // Silently grabbing another device would be unsafe;
                    // a restart re-attaches
                    if failed {
                        surface = None;
                    }
                }
            }
            _ = expiry.tick() => {
                engine.expire();
            }
            line = stdin.next_line(), if stdin_open => {
                let Ok(Some(line)) = line else {
                    // Closed stdin (piped input ended, detached terminal)
                    stdin_open = false;
                    continue;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let Some(cmd) = parse_console_command(&line) else {
                    warn!(%line, "Unknown command (learn/cancel/save/recall/meters/quit)");
                    continue;
                };
                match cmd {
                    ConsoleCommand::Learn { target, channel } => {
                        surface_bridge.arm_learn(target, channel);
                    }
                    ConsoleCommand::CancelLearn => surface_bridge.cancel_learn(),
                    ConsoleCommand::SaveScene(name) => {
                        engine.submit(ClientMessage::SaveScene { name });
                    }
                    ConsoleCommand::RecallScene(name) => {
                        engine.submit(ClientMessage::RecallScene { name });
                    }
                    ConsoleCommand::Meters(enabled) => {
                        engine.submit(ClientMessage::SubscribeMeters {
                            enabled,
                            interval_ms: None,
                        });
                    }
                    ConsoleCommand::Quit => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    session.shutdown();
    debug!("Bye");
    Ok(())
}

/// Replace or add the binding for a control and keep the config in sync
fn remember_binding(config: &mut AppConfig, binding: MidiBinding) {
    if let Some(existing) = config
        .bindings
        .iter_mut()
        .find(|b| b.control_id == binding.control_id)
    {
        *existing = binding;
    } else {
        config.bindings.push(binding);
    }
}
