//! relaymesh - tunnel orchestration for near/far relay pairs
//!
//! Creates tunnels on top of ssh, frp, gost, chisel and trusttunnel, keeps
//! their processes supervised and samples their health in the background.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use config::{ConfigManager, RelaymeshConfig};
use relaymesh_control::{
    Autopilot, ControlError, CreateTunnelRequest, NewNode, PortAllocator, SimulatedProber,
    TrackingMap, TunnelManager, TunnelStore, TunnelView,
};
use relaymesh_engines::{EngineRegistry, CATALOG, FIXED_PORT_SERVICES};
use relaymesh_relay_db::entities::relay_node::NodeRole;
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// relaymesh - Orchestrate encrypted tunnels between relay nodes
#[derive(Parser, Debug)]
#[command(name = "relaymesh")]
#[command(about = "relaymesh - Orchestrate encrypted tunnels between relay nodes")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Registry database URL (overrides the config file)
    #[arg(long, global = true, env = "RELAYMESH_DATABASE_URL")]
    database_url: Option<String>,

    /// Directory for rendered engine configs (overrides the config file)
    #[arg(long, global = true, env = "RELAYMESH_WORK_DIR")]
    work_dir: Option<PathBuf>,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Manage the relay node directory
    Node {
        #[command(subcommand)]
        action: NodeCommands,
    },

    /// List supported engines and the fixed-port services
    Engines,

    /// Create a tunnel and supervise it until Ctrl-C
    #[command(long_about = r#"
Create a tunnel between a near and a far relay node. A port is drawn from
the dynamic range unless --port is given; 80 and 443 are always refused.
The engine process stays supervised in the foreground until Ctrl-C. The
tunnel row stays active, so `relaymesh daemon` resumes it later.

EXAMPLES:
  # gost over TLS with a random port
  relaymesh create --engine gost --near 1 --far 2

  # frp over kcp on a fixed port, forwarding to a local service
  relaymesh create --engine frp --near 1 --far 2 --port 24000 \
    --transport kcp --config '{"token":"s3cret","local_port":8080}'

  # Run the server side of a chisel tunnel on the far node
  relaymesh create --engine chisel --near 2 --server
    "#)]
    Create {
        /// Engine name (ssh, frp, gost, chisel, trusttunnel)
        #[arg(long)]
        engine: String,

        /// Near node id
        #[arg(long)]
        near: i32,

        /// Far node id
        #[arg(long)]
        far: Option<i32>,

        /// Explicit port (random from the configured range if omitted)
        #[arg(long)]
        port: Option<u16>,

        /// Transport (engine default if omitted)
        #[arg(long, default_value = "")]
        transport: String,

        /// Engine options as a JSON object
        #[arg(long)]
        config: Option<String>,

        /// Run the server side of the engine
        #[arg(long)]
        server: bool,
    },

    /// Stop a tunnel and mark it inactive
    Stop { id: i32 },

    /// Stop a tunnel and remove it from the registry
    Delete { id: i32 },

    /// List tunnels
    List,

    /// Show one tunnel
    Status { id: i32 },

    /// Run monitoring cycles
    Monitor {
        /// Run a single cycle and print its report
        #[arg(long)]
        once: bool,
    },

    /// Enable, disable or inspect scheduled monitoring
    Autopilot {
        #[command(subcommand)]
        action: AutopilotCommands,
    },

    /// Render the command line, systemd unit and setup script for a tunnel
    DeployPlan {
        id: i32,

        /// Write the unit and setup script into this directory
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },

    /// Resume active tunnels and run the autopilot until Ctrl-C
    #[command(long_about = r#"
Restore port assignments, restart every active tunnel that has no live
process, then keep supervising while the autopilot samples health every
autopilot_interval_secs. Ctrl-C stops all engine processes and leaves the
registry untouched.

ENVIRONMENT VARIABLES:
  RELAYMESH_DATABASE_URL  Registry database URL
  RELAYMESH_WORK_DIR      Directory for rendered engine configs
  RUST_LOG                Log filter (overrides --verbose)
    "#)]
    Daemon,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
}

#[derive(Subcommand, Debug)]
enum NodeCommands {
    /// Register a relay node
    Add {
        /// Unique node name
        name: String,

        #[arg(long, value_enum)]
        role: RoleArg,

        /// Host name or IP address
        #[arg(long)]
        address: String,

        #[arg(long, default_value_t = 22)]
        ssh_port: u16,

        #[arg(long)]
        ssh_user: Option<String>,
    },

    /// List relay nodes
    List,
}

#[derive(Subcommand, Debug)]
enum AutopilotCommands {
    Enable,
    Disable,
    Status,
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Show the effective configuration
    Show,

    /// Persist the registry database URL
    SetDb { url: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum RoleArg {
    Near,
    Far,
}

impl From<RoleArg> for NodeRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Near => NodeRole::Near,
            RoleArg::Far => NodeRole::Far,
        }
    }
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    let default_directives = format!(
        "relaymesh={lvl},relaymesh_control={lvl},relaymesh_engines={lvl},relaymesh_relay_db={lvl}",
        lvl = log_level
    );

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&default_directives))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

/// Render a control error with its stable code
fn reported(e: ControlError) -> anyhow::Error {
    let report = e.report();
    anyhow::anyhow!("{} [{}]", report.message, report.code)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize output")?
    );
    Ok(())
}

/// Connect, migrate and rebuild in-memory port state
async fn open_manager(config: &RelaymeshConfig) -> Result<TunnelManager> {
    let db = relaymesh_relay_db::connect(&config.database_url)
        .await
        .context(format!("Failed to connect to database: {}", config.database_url))?;
    relaymesh_relay_db::migrate(&db)
        .await
        .context("Failed to run database migrations")?;

    let engines = EngineRegistry::with_defaults(config.supervisor_config());
    let manager = TunnelManager::new(
        TunnelStore::new(db),
        engines,
        Arc::new(PortAllocator::new(config.allocator_config())),
        Arc::new(TrackingMap::new()),
    );

    let restored = manager
        .restore()
        .await
        .context("Failed to restore port assignments")?;
    debug!(restored, "Registry restored");

    Ok(manager)
}

fn autopilot_for(manager: &TunnelManager, config: &RelaymeshConfig) -> Autopilot {
    Autopilot::new(
        manager.store().clone(),
        manager.tracking().clone(),
        Arc::new(SimulatedProber::default()),
        config.autopilot_config(),
    )
}

fn print_tunnels(views: &[TunnelView]) {
    if views.is_empty() {
        println!("No tunnels registered");
        return;
    }

    println!(
        "{:<5} {:<12} {:<20} {:<6} {:<9} {:>6} {:<12} {:>8}",
        "ID", "ENGINE", "TRANSPORT", "PORT", "STATUS", "SCORE", "PROCESS", "PID"
    );
    for view in views {
        let record = &view.record;
        let (process, pid) = match &view.runtime {
            Some(runtime) => (
                runtime.status.as_str().to_string(),
                runtime.pid.map(|p| p.to_string()).unwrap_or_default(),
            ),
            None => ("-".to_string(), String::new()),
        };
        println!(
            "{:<5} {:<12} {:<20} {:<6} {:<9} {:>6.1} {:<12} {:>8}",
            record.id,
            record.engine,
            record.transport,
            record.port,
            record.status.as_str(),
            record.score,
            process,
            pid
        );
    }
}

fn write_plan(dir: &Path, unit_name: &str, unit: &str, script: &str) -> Result<()> {
    std::fs::create_dir_all(dir).context(format!("Failed to create directory: {:?}", dir))?;

    let unit_path = dir.join(format!("{}.service", unit_name));
    std::fs::write(&unit_path, unit).context(format!("Failed to write {:?}", unit_path))?;

    let script_path = dir.join(format!("{}-setup.sh", unit_name));
    std::fs::write(&script_path, script).context(format!("Failed to write {:?}", script_path))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&script_path, std::fs::Permissions::from_mode(0o755))
            .context(format!("Failed to mark {:?} executable", script_path))?;
    }

    println!("Wrote {}", unit_path.display());
    println!("Wrote {}", script_path.display());
    Ok(())
}

/// Periodic adapter health sweep; persists exhausted tunnels as failed
async fn health_loop(manager: TunnelManager, period: Duration, cancel: CancellationToken) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        match manager.health_check_all().await {
            Ok(report) => {
                let unhealthy = report
                    .iter()
                    .filter(|h| !h.health.as_ref().is_some_and(|r| r.healthy))
                    .count();
                debug!(checked = report.len(), unhealthy, "Health sweep completed");
            }
            Err(e) => warn!("Health sweep failed: {}", e),
        }
    }
}

async fn run_daemon(manager: TunnelManager, config: &RelaymeshConfig) -> Result<()> {
    info!("relaymesh daemon starting...");

    for (tunnel_id, result) in manager.resume_active().await.map_err(reported)? {
        if result.success {
            info!(tunnel_id, pid = ?result.pid, "Tunnel resumed");
        } else {
            warn!(
                tunnel_id,
                "Tunnel could not be resumed: {}",
                result.error.unwrap_or_default()
            );
        }
    }

    let period = config.autopilot_interval();
    let cancel = CancellationToken::new();
    let autopilot = Arc::new(autopilot_for(&manager, config));

    let monitor_task = {
        let autopilot = autopilot.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { autopilot.run_periodic(period, cancel).await })
    };
    let health_task = tokio::spawn(health_loop(manager.clone(), period, cancel.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");

    cancel.cancel();
    for (name, task) in [("autopilot", monitor_task), ("health", health_task)] {
        if let Err(e) = task.await {
            error!("{} task panicked: {}", name, e);
        }
    }

    manager.shutdown().await;
    info!("relaymesh daemon stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let mut config = ConfigManager::load()?;
    if let Some(url) = cli.database_url {
        config.database_url = url;
    }
    if let Some(dir) = cli.work_dir {
        config.work_dir = dir;
    }

    match cli.command {
        Commands::Config { action } => match action {
            ConfigCommands::Show => print_json(&config),
            ConfigCommands::SetDb { url } => {
                ConfigManager::set_database_url(url.clone())?;
                println!("Database URL set to {}", url);
                Ok(())
            }
        },

        Commands::Engines => {
            if cli.json {
                return print_json(&CATALOG);
            }
            println!(
                "{:<12} {:<10} {:<20} {:>8}  TRANSPORTS",
                "ENGINE", "ROLE", "ENCRYPTION", "PRIORITY"
            );
            for entry in &CATALOG {
                println!(
                    "{:<12} {:<10} {:<20} {:>8}  {}",
                    entry.name,
                    format!("{:?}", entry.role).to_lowercase(),
                    entry.encryption,
                    entry.fallback_priority,
                    entry.transports.join(", ")
                );
            }
            println!();
            for service in FIXED_PORT_SERVICES {
                let engine = service.engine.map(|e| e.to_string());
                println!(
                    "Fixed port {}: {} ({})",
                    service.port,
                    service.name,
                    engine.as_deref().unwrap_or("static site")
                );
            }
            Ok(())
        }

        Commands::Node { action } => {
            let manager = open_manager(&config).await?;
            match action {
                NodeCommands::Add {
                    name,
                    role,
                    address,
                    ssh_port,
                    ssh_user,
                } => {
                    let node = manager
                        .store()
                        .add_node(NewNode {
                            name,
                            role: role.into(),
                            address,
                            ssh_port,
                            ssh_user,
                        })
                        .await
                        .context("Failed to add relay node")?;
                    if cli.json {
                        return print_json(&node);
                    }
                    println!("Added node {} ({})", node.id, node.name);
                    Ok(())
                }
                NodeCommands::List => {
                    let nodes = manager
                        .store()
                        .list_nodes()
                        .await
                        .context("Failed to list relay nodes")?;
                    if cli.json {
                        return print_json(&nodes);
                    }
                    println!(
                        "{:<5} {:<20} {:<5} {:<30} {:>6}  USER",
                        "ID", "NAME", "ROLE", "ADDRESS", "SSH"
                    );
                    for node in nodes {
                        println!(
                            "{:<5} {:<20} {:<5} {:<30} {:>6}  {}",
                            node.id,
                            node.name,
                            format!("{:?}", node.role).to_lowercase(),
                            node.address,
                            node.ssh_port,
                            node.ssh_user.unwrap_or_default()
                        );
                    }
                    Ok(())
                }
            }
        }

        Commands::Create {
            engine,
            near,
            far,
            port,
            transport,
            config: options,
            server,
        } => {
            let mut blob = match options.as_deref() {
                Some(raw) => match serde_json::from_str::<Value>(raw)
                    .context("Failed to parse --config as JSON")?
                {
                    Value::Object(map) => map,
                    _ => anyhow::bail!("--config must be a JSON object"),
                },
                None => Map::new(),
            };
            if server {
                blob.insert("mode".to_string(), Value::String("server".to_string()));
            }

            let manager = open_manager(&config).await?;
            let response = manager
                .create_tunnel(CreateTunnelRequest {
                    engine,
                    near_node_id: near,
                    far_node_id: far,
                    port,
                    transport,
                    config: blob,
                })
                .await
                .map_err(reported)?;

            if cli.json {
                print_json(&response)?;
            } else {
                println!("Tunnel {} created on port {}", response.tunnel_id, response.port);
            }

            if !response.start.success {
                anyhow::bail!(
                    "Engine failed to start: {}",
                    response.start.error.unwrap_or_default()
                );
            }

            info!(
                tunnel_id = response.tunnel_id,
                pid = ?response.start.pid,
                "Supervising tunnel, press Ctrl+C to stop"
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, shutting down...");
            manager.shutdown().await;
            Ok(())
        }

        Commands::Stop { id } => {
            let manager = open_manager(&config).await?;
            let result = manager.stop_tunnel(id).await.map_err(reported)?;
            if cli.json {
                return print_json(&result);
            }
            match result.note {
                Some(note) => println!("Tunnel {} stopped ({})", id, note),
                None => println!("Tunnel {} stopped", id),
            }
            Ok(())
        }

        Commands::Delete { id } => {
            let manager = open_manager(&config).await?;
            let result = manager.delete_tunnel(id).await.map_err(reported)?;
            if cli.json {
                return print_json(&result);
            }
            println!("Tunnel {} deleted", id);
            Ok(())
        }

        Commands::List => {
            let manager = open_manager(&config).await?;
            let views = manager.list_tunnels().await.map_err(reported)?;
            if cli.json {
                return print_json(&views);
            }
            print_tunnels(&views);
            Ok(())
        }

        Commands::Status { id } => {
            let manager = open_manager(&config).await?;
            let view = manager.get_status(id).await.map_err(reported)?;
            let samples = manager
                .store()
                .samples_for_tunnel(id)
                .await
                .context("Failed to load monitor samples")?;
            if cli.json {
                return print_json(&serde_json::json!({ "tunnel": view, "samples": samples }));
            }

            print_tunnels(std::slice::from_ref(&view));
            if let Some(error) = &view.record.last_error {
                println!("\nLast error: {}", error);
            }
            if !samples.is_empty() {
                println!("\nRecent samples:");
                for sample in samples.iter().take(10) {
                    println!(
                        "  {}  {:>7.1} ms  jitter {:>5.1}  loss {:>5.1}%  {:>5.1} {}",
                        sample.created_at.format("%Y-%m-%d %H:%M:%S"),
                        sample.latency_ms,
                        sample.jitter_ms,
                        sample.packet_loss,
                        sample.score,
                        sample.status
                    );
                }
            }
            Ok(())
        }

        Commands::Monitor { once } => {
            let manager = open_manager(&config).await?;
            let autopilot = autopilot_for(&manager, &config);

            if once {
                let report = autopilot.run_cycle().await.map_err(reported)?;
                if cli.json {
                    return print_json(&report);
                }
                for target in &report.targets {
                    println!(
                        "{:<32} {:>7.1} ms  {:>5.1}% loss  {:>5.1} {}",
                        target.target,
                        target.measurement.latency_ms,
                        target.measurement.packet_loss,
                        target.measurement.score,
                        target.measurement.bucket.as_str()
                    );
                }
                println!(
                    "\n{} samples written, {} purged",
                    report.samples_written, report.samples_purged
                );
                for id in &report.records_failed {
                    println!("Tunnel {} marked failed", id);
                }
                return Ok(());
            }

            let cancel = CancellationToken::new();
            let period = config.autopilot_interval();
            tokio::select! {
                _ = autopilot.run_periodic(period, cancel.clone()) => {}
                result = tokio::signal::ctrl_c() => {
                    result.context("Failed to listen for Ctrl+C")?;
                    info!("Received Ctrl+C, shutting down...");
                    cancel.cancel();
                }
            }
            Ok(())
        }

        Commands::Autopilot { action } => {
            let manager = open_manager(&config).await?;
            let autopilot = autopilot_for(&manager, &config);
            match action {
                AutopilotCommands::Enable => autopilot.set_enabled(true).await.map_err(reported)?,
                AutopilotCommands::Disable => {
                    autopilot.set_enabled(false).await.map_err(reported)?
                }
                AutopilotCommands::Status => {}
            }

            let enabled = autopilot.is_enabled().await.map_err(reported)?;
            let last_cycle = autopilot.last_cycle().await.map_err(reported)?;
            if cli.json {
                return print_json(&serde_json::json!({
                    "enabled": enabled,
                    "last_cycle": last_cycle,
                }));
            }
            println!("Autopilot: {}", if enabled { "enabled" } else { "disabled" });
            match last_cycle {
                Some(at) => println!("Last cycle: {}", at.to_rfc3339()),
                None => println!("Last cycle: never"),
            }
            Ok(())
        }

        Commands::DeployPlan { id, output_dir } => {
            let manager = open_manager(&config).await?;
            let plan = manager.get_deployment_plan(id).await.map_err(reported)?;

            if let Some(dir) = output_dir {
                return write_plan(&dir, &plan.unit_name, &plan.supervisor_unit, &plan.setup_script);
            }
            if cli.json {
                return print_json(&plan);
            }
            println!("# command\n{}\n", plan.command);
            println!("# {}.service\n{}", plan.unit_name, plan.supervisor_unit);
            println!("# setup script\n{}", plan.setup_script);
            Ok(())
        }

        Commands::Daemon => {
            let manager = open_manager(&config).await?;
            run_daemon(manager, &config).await
        }
    }
}
