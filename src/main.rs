use clap::{Parser, Subcommand, ValueEnum};
use shadowlink::capture::{AfPacketSocket, Bridge, ChannelSink};
use shadowlink::config::{self, CheckpointConfig, Config, Role};
use shadowlink::dataplane::{
    CheckpointOutcome, EngineSettings, GroupSettings, MirrorGroup, ProxyEvent,
};
use shadowlink::telemetry::init_logging;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Parser)]
#[command(name = "shadowlink")]
#[command(about = "Packet mirroring and output comparison for primary/secondary VM replication")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run the mirroring daemon
    Run {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,

        /// Side of the replication pair this host runs
        #[arg(long, value_enum)]
        role: RoleArg,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Validate config.toml
    Validate {
        /// Path to config.toml
        #[arg(short, long, default_value = "config.toml")]
        config: PathBuf,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Primary,
    Secondary,
}

impl From<RoleArg> for Role {
    fn from(arg: RoleArg) -> Self {
        match arg {
            RoleArg::Primary => Role::Primary,
            RoleArg::Secondary => Role::Secondary,
        }
    }
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Config {
            action: ConfigAction::Validate { config },
        } => {
            init_logging(None);
            cmd_config_validate(&config)
        }
        Commands::Run { config, role } => cmd_run(&config, role.into()),
    };

    if let Err(e) = result {
        eprintln!("[ERROR] {}", e);
        std::process::exit(1);
    }
}

fn load_validated(config_path: &PathBuf) -> Result<Config, String> {
    let cfg = config::load(config_path).map_err(|e| format!("Failed to parse config: {}", e))?;

    let validation = config::validate(&cfg);
    validation.print_diagnostics();

    if validation.has_errors() {
        return Err("Validation failed".to_string());
    }
    Ok(cfg)
}

fn cmd_config_validate(config_path: &PathBuf) -> Result<(), String> {
    println!("[INFO] Validating {}...", config_path.display());
    load_validated(config_path)?;
    println!("[INFO] Configuration is valid");
    Ok(())
}

fn cmd_run(config_path: &PathBuf, role: Role) -> Result<(), String> {
    let cfg = load_validated(config_path)?;
    init_logging(Some(&cfg.log));
    info!(config = %config_path.display(), %role, "shadowlink starting");

    let rt = tokio::runtime::Runtime::new()
        .map_err(|e| format!("Failed to create runtime: {}", e))?;

    rt.block_on(run(cfg, role))
}

async fn run(cfg: Config, role: Role) -> Result<(), String> {
    let mut group = MirrorGroup::new(GroupSettings::from_config(&cfg));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bridges: Vec<JoinHandle<()>> = Vec::new();

    for (name, proxy) in cfg.proxies.iter().filter(|(_, p)| p.role == role) {
        let (Some(guest_if), Some(uplink_if)) = (&proxy.guest_interface, &proxy.uplink_interface)
        else {
            warn!(name = %name, "no interfaces configured, skipping");
            continue;
        };

        let settings = EngineSettings::from_config(proxy)
            .map_err(|e| format!("Proxy {}: {}", name, e))?;
        let (sink, outbound) = ChannelSink::new();
        let engine = group.add_engine(name.clone(), settings, Arc::new(sink));

        info!(name = %name, guest = %guest_if, uplink = %uplink_if, "binding interfaces");
        let guest = bind(guest_if)?;
        let uplink = bind(uplink_if)?;

        let bridge = Bridge::new(engine, guest, uplink, outbound);
        let shutdown = shutdown_rx.clone();
        let name = name.clone();
        bridges.push(tokio::spawn(async move {
            if let Err(e) = bridge.run(shutdown).await {
                error!(name = %name, error = %e, "bridge failed");
            }
        }));
    }

    if group.engines().is_empty() {
        return Err(format!("No {} proxies with interfaces configured", role));
    }

    let events = group.take_events();
    group
        .start_all(role)
        .await
        .map_err(|e| format!("Failed to start engines: {}", e))?;
    info!(engines = group.engines().len(), "mirroring started");

    let result = supervise(&group, role, events, &cfg.checkpoint).await;

    group.stop_all(role).await;
    let _ = shutdown_tx.send(true);
    for bridge in bridges {
        let _ = bridge.await;
    }
    for (name, value) in group.metrics().export() {
        info!(metric = %name, value, "final");
    }
    result
}

fn bind(ifname: &str) -> Result<AfPacketSocket, String> {
    let socket = AfPacketSocket::bind(ifname).map_err(|e| {
        format!(
            "Failed to bind to {}: {}. Run with root privileges.",
            ifname, e
        )
    })?;
    debug!(interface = socket.ifname(), ifindex = socket.ifindex(), "capture socket ready");
    Ok(socket)
}

/// Checkpoint timer and event log, until Ctrl-C
async fn supervise(
    group: &MirrorGroup,
    role: Role,
    events: Option<mpsc::UnboundedReceiver<ProxyEvent>>,
    checkpoint: &CheckpointConfig,
) -> Result<(), String> {
    let Some(mut events) = events else {
        return Err("Event channel already taken".to_string());
    };
    let mut timer = tokio::time::interval(checkpoint.interval());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                return Ok(());
            }
            _ = timer.tick() => {
                // the secondary only holds its own output, which never leaves the host
                let outcome = match role {
                    Role::Primary => group.checkpoint_within(checkpoint.max_deferrals),
                    Role::Secondary => group.force_checkpoint(),
                };
                if outcome == CheckpointOutcome::Deferred {
                    debug!(pending = group.query_checkpoint_pending(), "checkpoint deferred");
                }
            }
            Some(event) = events.recv() => log_event(event),
        }
    }
}

fn log_event(event: ProxyEvent) {
    match event {
        ProxyEvent::Divergence {
            engine,
            name,
            key,
            mismatch,
        } => warn!(%engine, name = %name, %key, %mismatch, "output divergence, failover advised"),
        ProxyEvent::TransportLost {
            engine,
            name,
            reason,
        } => error!(%engine, name = %name, reason = %reason, "mirror transport lost, failing open"),
        ProxyEvent::CheckpointRequested { engine, name } => {
            info!(%engine, name = %name, "checkpoint requested")
        }
    }
}
