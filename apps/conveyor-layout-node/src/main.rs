mod config;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use conveyor_codec::{
    decode_envelope, encode_envelope, ChangeState, Envelope, Payload, Performative, TransferPallet,
};
use conveyor_core::{NodeId, NodeStatus};
use conveyor_node::runtime::RuntimeStats;
use conveyor_node::service::NodeService;
use conveyor_node::{ConveyorNode, NodeError, NodeTimings};
use conveyor_sim::{factory_reference_layout, LayoutSpec, OPERATOR};
use conveyor_transport::adapter::AsyncTransportAdapter;
use conveyor_transport::directory::IdentityDirectory;
use conveyor_transport_channel::{ChannelAdapter, ChannelHub};

use crate::config::LayoutNodeConfig;

const SHUTDOWN_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every node of a layout in this process (default)
    Run {
        /// Layout TOML file; the reference factory layout when omitted
        #[arg(long)]
        layout: Option<PathBuf>,
        /// Comma-separated pallet path to load at start, e.g. CNV1,CNV2,CNV3
        #[arg(long = "pallet")]
        pallets: Vec<String>,
        /// Node to take DOWN at start
        #[arg(long)]
        down: Vec<String>,
        /// Stop after this long, e.g. 90s; runs until interrupted otherwise
        #[arg(long = "for", value_parser = parse_duration)]
        run_for: Option<Duration>,
    },
    /// Print the reference factory layout as TOML
    Layout,
}

type ServiceHandle = JoinHandle<Result<RuntimeStats, NodeError>>;

#[tokio::main]
async fn main() {
    let filter = std::env::var("CONVEYOR_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run {
        layout: None,
        pallets: Vec::new(),
        down: Vec::new(),
        run_for: None,
    });

    match command {
        Commands::Layout => match factory_reference_layout().to_toml_string() {
            Ok(text) => print!("{text}"),
            Err(err) => {
                error!("failed to render layout: {err}");
                std::process::exit(1);
            }
        },
        Commands::Run {
            layout,
            pallets,
            down,
            run_for,
        } => {
            let cfg = match LayoutNodeConfig::new(cli.config) {
                Ok(cfg) => cfg,
                Err(err) => {
                    error!("failed to load configuration: {err}");
                    std::process::exit(1);
                }
            };
            if let Err(err) = run(cfg, layout, pallets, down, run_for).await {
                error!("{err}");
                std::process::exit(1);
            }
        }
    }
}

async fn run(
    cfg: LayoutNodeConfig,
    layout_path: Option<PathBuf>,
    pallets: Vec<String>,
    down: Vec<String>,
    run_for: Option<Duration>,
) -> Result<(), String> {
    let layout = match layout_path.or_else(|| cfg.layout_path.clone()) {
        Some(path) => load_layout(&path)?,
        None => factory_reference_layout(),
    };
    let timings = cfg.timings();
    timings
        .validate()
        .map_err(|err| format!("invalid timings: {err}"))?;
    let configs = layout
        .node_configs()
        .map_err(|err| format!("invalid layout: {err}"))?;

    let hub = ChannelHub::new();
    let operator = hub.connect(OPERATOR);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let epoch = Instant::now();

    let mut handles: Vec<(NodeId, ServiceHandle)> = Vec::with_capacity(configs.len());
    for node_config in configs {
        let id = node_config.node_id.clone();
        let node = ConveyorNode::new(node_config, timings.clone())
            .map_err(|err| format!("node {id}: {err}"))?;
        let adapter = hub.connect(id.as_str());
        let service = NodeService::new(node, adapter, IdentityDirectory).with_epoch(epoch);
        handles.push((id, tokio::spawn(service.run(shutdown_rx.clone()))));
    }
    info!(nodes = handles.len(), "layout running");

    let initial_down = layout
        .nodes
        .iter()
        .filter(|spec| spec.initial_state == NodeStatus::Down)
        .map(|spec| spec.id.clone())
        .chain(cfg.down.iter().cloned())
        .chain(down);
    for id in initial_down {
        send_state(&hub, &id, NodeStatus::Down)?;
    }
    for (n, pallet) in pallets.iter().enumerate() {
        send_pallet(&hub, pallet, n + 1)?;
    }

    let operator_task = tokio::spawn(watch_operator_replies(operator));

    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGTERM, signal_hook::consts::SIGINT] {
        signal_hook::flag::register(signal, Arc::clone(&stop))
            .map_err(|err| format!("failed to register signal handler: {err}"))?;
    }

    let deadline = run_for.map(|d| Instant::now() + d);
    loop {
        tokio::time::sleep(SHUTDOWN_POLL).await;
        if stop.load(Ordering::Relaxed) {
            info!("shutdown requested");
            break;
        }
        if deadline.is_some_and(|at| Instant::now() >= at) {
            info!("run time elapsed");
            break;
        }
        if handles.iter().all(|(_, handle)| handle.is_finished()) {
            warn!("all node services stopped");
            break;
        }
    }
    let _ = shutdown_tx.send(true);

    let mut failed = 0usize;
    for (id, handle) in handles {
        match handle.await {
            Ok(Ok(stats)) => info!(
                node = %id,
                inbound = stats.inbound_messages,
                sent = stats.sent_messages,
                malformed = stats.malformed_messages,
                send_failures = stats.send_failures,
                "node stopped"
            ),
            Ok(Err(err)) => {
                error!(node = %id, "node halted: {err}");
                failed += 1;
            }
            Err(err) => {
                error!(node = %id, "node task failed: {err}");
                failed += 1;
            }
        }
    }
    operator_task.abort();

    if failed > 0 {
        return Err(format!("{failed} node(s) halted"));
    }
    Ok(())
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    use serde::de::value::{Error, StrDeserializer};
    use serde::de::IntoDeserializer;

    let deserializer: StrDeserializer<'_, Error> = value.into_deserializer();
    humantime_serde::deserialize(deserializer).map_err(|err: Error| err.to_string())
}

fn load_layout(path: &Path) -> Result<LayoutSpec, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read layout {}: {err}", path.display()))?;
    LayoutSpec::from_toml_str(&text)
        .map_err(|err| format!("invalid layout {}: {err}", path.display()))
}

fn parse_path(spec: &str) -> Result<Vec<NodeId>, String> {
    let path = spec
        .split(',')
        .map(str::trim)
        .filter(|hop| !hop.is_empty())
        .map(NodeId::new)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| format!("invalid pallet path {spec:?}: {err}"))?;
    if path.is_empty() {
        return Err(format!("invalid pallet path {spec:?}: no hops"));
    }
    Ok(path)
}

fn operator_envelope(to: &NodeId, payload: Payload) -> Result<Envelope, String> {
    let operator = NodeId::new(OPERATOR).map_err(|err| err.to_string())?;
    Envelope::with_payload(Performative::Request, operator, to.clone(), &payload)
        .map_err(|err| format!("failed to build message for {to}: {err}"))
}

fn inject(hub: &ChannelHub, envelope: &Envelope) -> Result<(), String> {
    let bytes = encode_envelope(envelope).map_err(|err| format!("failed to encode: {err}"))?;
    hub.inject(OPERATOR, envelope.receiver.as_str(), bytes)
        .map_err(|err| format!("failed to deliver to {}: {err}", envelope.receiver))
}

fn send_state(hub: &ChannelHub, id: &str, state: NodeStatus) -> Result<(), String> {
    let to = NodeId::new(id).map_err(|err| format!("invalid node {id:?}: {err}"))?;
    let envelope = operator_envelope(&to, ChangeState { new_state: state }.into())?;
    inject(hub, &envelope)?;
    info!(node = %to, state = %state, "state change sent");
    Ok(())
}

fn send_pallet(hub: &ChannelHub, spec: &str, seq: usize) -> Result<(), String> {
    let target_path = parse_path(spec)?;
    let to = target_path[0].clone();
    let envelope = operator_envelope(
        &to,
        TransferPallet {
            target_path,
            elapsed_ms: 0,
        }
        .into(),
    )?
    .with_conversation(format!("{OPERATOR}-{seq}"))
    .with_reply_with("req1");
    inject(hub, &envelope)?;
    info!(node = %to, path = spec, "pallet sent");
    Ok(())
}

async fn watch_operator_replies(mut operator: ChannelAdapter) {
    while let Some((from, bytes)) = operator.next_inbound().await {
        match decode_envelope(&bytes) {
            Ok(reply) => {
                let reason = reply
                    .reply_body()
                    .ok()
                    .and_then(|body| body.reason)
                    .unwrap_or_default();
                info!(
                    from = %from,
                    performative = ?reply.performative,
                    conversation = reply.conversation_id.as_deref().unwrap_or(""),
                    reason = %reason,
                    "operator reply"
                );
            }
            Err(err) => warn!(from = %from, "undecodable reply: {err}"),
        }
    }
}
