use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use device_link::{MockConnector, TransportKind};
use pin_control::{
    load_topology_file, ConnectorSet, Controller, DeviceConfig, MetricsHub, PinConfig,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(
    name = "pin-daemon",
    version,
    about = "Keeps GPIO daemons and Firmata boards connected and bridges their pins to JSON lines",
    disable_help_subcommand = true
)]
struct Cli {
    /// Use the in-process mock device for every transport
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    mock: bool,

    /// Log every connection attempt and configuration step
    #[arg(long, short, action = ArgAction::SetTrue, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a topology: inbound values on stdin, signals on stdout
    Run {
        /// Topology YAML file
        #[arg(long)]
        config: PathBuf,
        /// Print counters to stderr on shutdown
        #[arg(long, action = ArgAction::SetTrue)]
        metrics_dump: bool,
    },
    /// List serial ports a board could be attached to
    Ports,
    /// Validate a topology file without connecting
    Check {
        /// Topology YAML file
        #[arg(long)]
        config: PathBuf,
        /// Also print the parsed topology as JSON
        #[arg(long, action = ArgAction::SetTrue)]
        json: bool,
    },
}

/// One line of stdin: `{"node": "led", "payload": 1}`.
#[derive(Debug, Deserialize)]
struct Inbound {
    node: String,
    #[serde(default)]
    payload: Value,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            config,
            metrics_dump,
        } => run(&config, cli.mock, metrics_dump).await,
        Commands::Ports => list_ports(cli.mock),
        Commands::Check { config, json } => check(&config, json),
    }
}

fn setup_tracing(verbose: bool) {
    let fallback = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(fallback));
    // Best-effort; stdout is reserved for signals
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn connectors(mock: bool) -> ConnectorSet {
    if mock {
        return ConnectorSet::uniform(Arc::new(MockConnector::new()));
    }
    let set = ConnectorSet::new();
    #[cfg(feature = "firmata")]
    let set = set.with(TransportKind::Serial, Arc::new(device_link::FirmataConnector));
    #[cfg(feature = "pigpiod")]
    let set = set.with(TransportKind::GpioDaemon, Arc::new(device_link::PigpiodConnector));
    set
}

async fn run(path: &Path, mock: bool, metrics_dump: bool) -> Result<()> {
    let topology = load_topology_file(path)?;
    let metrics = MetricsHub::new()?;
    let (signals, mut signal_rx) = mpsc::unbounded_channel();

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(signal) = signal_rx.recv().await {
            match serde_json::to_string(&signal) {
                Ok(line) => {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                    stdout.flush().await?;
                }
                Err(e) => warn!(error = %e, "unserializable signal"),
            }
        }
        Ok::<_, std::io::Error>(())
    });

    let mut controller =
        Controller::start(&topology, &connectors(mock), signals, metrics.clone())?;
    info!(config = %path.display(), mock, "pin-daemon running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);
    loop {
        tokio::select! {
            _ = &mut interrupt => {
                info!("interrupt received");
                break;
            }
            line = lines.next_line() => match line? {
                Some(line) => handle_line(&controller, &line),
                None => {
                    info!("stdin closed");
                    break;
                }
            },
        }
    }

    controller.shutdown().await?;
    drop(controller);
    writer.await??;
    if metrics_dump {
        eprint!("{}", metrics.encode_text());
    }
    info!("pin-daemon stopped");
    Ok(())
}

fn handle_line(controller: &Controller, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }
    match serde_json::from_str::<Inbound>(line) {
        Ok(msg) => {
            if let Err(e) = controller.dispatch(&msg.node, msg.payload) {
                warn!(node = %msg.node, error = %e, "inbound value dropped");
            }
        }
        Err(e) => warn!(error = %e, "unreadable inbound line"),
    }
}

fn list_ports(mock: bool) -> Result<()> {
    let ports = if mock {
        MockConnector::list()
    } else {
        device_link::list_serial_ports()?
    };
    for port in ports {
        println!("{}\t{}", port.name, port.driver);
    }
    Ok(())
}

fn check(path: &Path, json: bool) -> Result<()> {
    let topology = load_topology_file(path)?;
    topology.check_ids()?;
    let mut problems = Vec::new();
    let mut kinds = HashMap::new();
    for spec in &topology.devices {
        match DeviceConfig::from_spec(spec) {
            Ok(cfg) => {
                let kind = cfg.endpoint.kind();
                println!("ok: device {} ({kind}, {})", cfg.id, cfg.endpoint);
                kinds.insert(spec.id.as_str(), kind);
            }
            Err(e) => problems.push(e.to_string()),
        }
    }
    for spec in &topology.pins {
        let Some(kind) = kinds.get(spec.device.as_str()) else {
            problems.push(format!("{}: device {} not configured", spec.id, spec.device));
            continue;
        };
        match PinConfig::from_spec(spec, *kind) {
            Ok(cfg) => println!(
                "ok: pin {} (pin={}, mode={:?}, topic={})",
                cfg.id,
                cfg.pin,
                cfg.mode,
                cfg.topic()
            ),
            Err(e) => problems.push(e.to_string()),
        }
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&topology)?);
    }
    if !problems.is_empty() {
        for p in &problems {
            eprintln!("error: {p}");
        }
        anyhow::bail!("{} problem(s) in {}", problems.len(), path.display());
    }
    println!(
        "ok: {} devices, {} pins",
        topology.devices.len(),
        topology.pins.len()
    );
    Ok(())
}
