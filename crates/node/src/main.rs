//! Binary to run one overlay node.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use weave_engine::{Event, EngineConfig, OverlayEngine};
use weave_topology::NodeAddress;
use weave_transport_tcp::{TcpConfig, TcpTransport};

#[derive(Parser, Debug)]
#[command(version, about = "Structured peer-to-peer overlay node", long_about = None)]
struct Args {
    /// Local port to listen on
    port: u16,

    /// Optional bootstrap node hostname
    bootstrap_host: Option<String>,

    /// Optional bootstrap node port
    bootstrap_port: Option<u16>,
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = tracing::subscriber::set_global_default(
        FmtSubscriber::builder().with_max_level(Level::INFO).finish(),
    ) {
        eprintln!("failed to install tracing subscriber: {e}");
        return ExitCode::FAILURE;
    }

    let args = Args::parse();
    if args.port == 0 {
        error!("listen port must be non-zero");
        return ExitCode::FAILURE;
    }

    let bootstrap = match (&args.bootstrap_host, args.bootstrap_port) {
        (Some(host), Some(port)) if port != 0 && !host.is_empty() => {
            Some(NodeAddress::new(host.clone(), port))
        }
        (Some(_), _) => {
            error!("a bootstrap host needs a non-zero bootstrap port");
            return ExitCode::FAILURE;
        }
        (None, _) => None,
    };

    let transport = Arc::new(TcpTransport::new(TcpConfig {
        listen: NodeAddress::new("0.0.0.0", args.port),
        ..TcpConfig::default()
    }));
    let engine = OverlayEngine::new(transport, EngineConfig::default());

    let address = match engine.start().await {
        Ok(address) => address,
        Err(e) => {
            error!("failed to start node: {e}");
            return ExitCode::FAILURE;
        }
    };
    info!("node {} up on {address}", engine.node_id());

    if let Some(bootstrap) = bootstrap {
        info!("joining the overlay via {bootstrap}");
        if let Err(e) = engine.join(&bootstrap).await {
            warn!("join attempt failed: {e}");
        }
    }

    // Log the event stream until we are told to stop.
    let mut events = engine.events();
    let event_log = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::NodeAdded { id, address } => info!("node {id} joined from {address}"),
                Event::NodeRemoved { id } => info!("node {id} left"),
                Event::NodeFailed { id } => warn!("node {id} failed"),
                Event::NetworkRepaired => info!("topology repaired"),
                Event::RegistrationSucceeded { responder } => {
                    info!("registered with the overlay via node {responder}");
                }
                Event::RegistrationFailed { reason } => warn!("registration failed: {reason}"),
                Event::DataReceived { from, data, data_type } => {
                    info!("received {} byte(s) of {data_type} from node {from}", data.len());
                }
                Event::MessageReceived { from, payload } => {
                    info!("message of {} byte(s) from node {from}", payload.len());
                }
                _ => {}
            }
        }
    });

    wait_for_shutdown_signal().await;

    info!("shutting down");
    engine.leave().await;
    event_log.abort();
    info!("shutdown complete");

    ExitCode::SUCCESS
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!("no SIGTERM handler ({e}), falling back to ctrl-c");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
