//! fleetd CLI - device fleet management daemon and admin tool.
//!
//! `fleetd serve` runs the enrollment sync engine together with the device
//! inventory worker; the other subcommands inspect and edit the stores.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use fleetd_depsync::{Cursor, CursorStore, DepSyncer, Phase, ScriptedClient, SYNC_TOPIC};
use fleetd_fleet::{Blueprint, BlueprintStore, DeviceStore, DeviceSyncWorker, Profile, ProfileStore};
use fleetd_pubsub::EventBus;
use fleetd_storage::SqliteStore;

use crate::config::FleetConfig;

#[derive(Parser)]
#[command(name = "fleetd")]
#[command(about = "fleetd - Device fleet management")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file (default: platform config dir).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the database path from the configuration.
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the enrollment sync engine and device worker until Ctrl-C.
    Serve {
        /// JSON script of enrollment API replies.
        #[arg(short, long)]
        fixture: PathBuf,
    },

    /// Manage blueprints.
    #[command(subcommand)]
    Blueprint(BlueprintCommand),

    /// Manage configuration profiles.
    #[command(subcommand)]
    Profile(ProfileCommand),

    /// Inspect the device inventory.
    #[command(subcommand)]
    Device(DeviceCommand),

    /// Inspect or reset the enrollment sync cursor.
    #[command(subcommand)]
    Cursor(CursorCommand),
}

#[derive(Subcommand)]
enum BlueprintCommand {
    /// List all blueprints.
    List,
    /// Show one blueprint as JSON.
    Show { name: String },
    /// Create or update a blueprint from a JSON file.
    Apply { file: PathBuf },
    /// Remove a blueprint by name or uuid.
    Remove { name: String },
}

#[derive(Subcommand)]
enum ProfileCommand {
    /// Add or replace a profile from a .mobileconfig file.
    Add { identifier: String, file: PathBuf },
    /// List profile identifiers.
    List,
    /// Remove a profile no blueprint uses.
    Remove { identifier: String },
}

#[derive(Subcommand)]
enum DeviceCommand {
    /// List all devices.
    List,
}

#[derive(Subcommand)]
enum CursorCommand {
    /// Print the saved cursor.
    Show,
    /// Forget the saved cursor; the next run fetches from the start.
    ///
    /// Only run this while `fleetd serve` is stopped: a running engine keeps
    /// its cursor in memory and overwrites the reset on its next save.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = FleetConfig::load(cli.config.as_deref())?;
    if let Some(db) = cli.db {
        config.database = db;
    }
    let store = open_store(&config.database)?;

    match cli.command {
        Commands::Serve { fixture } => cmd_serve(store, &config, &fixture).await,
        Commands::Blueprint(cmd) => cmd_blueprint(store, cmd),
        Commands::Profile(cmd) => cmd_profile(store, cmd),
        Commands::Device(DeviceCommand::List) => cmd_device_list(store),
        Commands::Cursor(cmd) => cmd_cursor(store, cmd),
    }
}

fn open_store(path: &Path) -> Result<Arc<SqliteStore>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let store = SqliteStore::open(path)
        .with_context(|| format!("Failed to open database {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_blueprints(store: &Arc<SqliteStore>) -> Result<BlueprintStore<SqliteStore>> {
    let profiles = ProfileStore::open(store.clone()).context("Failed to open profile store")?;
    BlueprintStore::open(store.clone(), profiles).context("Failed to open blueprint store")
}

/// Run the sync engine against a scripted enrollment client.
async fn cmd_serve(store: Arc<SqliteStore>, config: &FleetConfig, fixture: &Path) -> Result<()> {
    let script = std::fs::read_to_string(fixture)
        .with_context(|| format!("Failed to read fixture {}", fixture.display()))?;
    let client = Arc::new(ScriptedClient::from_json(&script).context("Invalid fixture")?);

    let bus = Arc::new(EventBus::new(config.bus_capacity));
    let devices = DeviceStore::open(store.clone()).context("Failed to open device store")?;
    let subscription = bus
        .subscribe("device-sync", SYNC_TOPIC)
        .context("Failed to subscribe device worker")?;
    let worker = DeviceSyncWorker::new(devices).start(subscription);

    let engine = DepSyncer::new(client, bus.clone(), store, config.sync.clone())
        .context("Failed to create sync engine")?
        .start()
        .context("Failed to start sync engine")?;

    info!("Serving; press Ctrl-C to stop");
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
        _ = engine.wait_for(|s| s.phase == Phase::Stopped) => {
            warn!("Sync engine stopped on its own");
        }
    }

    let status_rx = engine.subscribe_status();
    let outcome = engine.stop().await;
    bus.close();
    let stats = worker.join().await?;
    let status = status_rx.borrow().clone();

    println!("Sync pages:        {}", status.pages);
    println!("Devices published: {}", status.devices_published);
    println!("Devices created:   {}", stats.created);
    println!("Devices updated:   {}", stats.updated);

    outcome.context("Sync engine failed")
}

fn cmd_blueprint(store: Arc<SqliteStore>, cmd: BlueprintCommand) -> Result<()> {
    let blueprints = open_blueprints(&store)?;

    match cmd {
        BlueprintCommand::List => {
            let all = blueprints.list().context("Failed to list blueprints")?;
            if all.is_empty() {
                println!("No blueprints.");
            }
            for bp in all {
                let triggers: Vec<_> = bp.apply_at.iter().map(|l| l.as_str()).collect();
                println!(
                    "{}  {}  profiles: {}  apply at: {}",
                    bp.uuid,
                    bp.name,
                    bp.profile_identifiers.len(),
                    triggers.join(",")
                );
            }
        }
        BlueprintCommand::Show { name } => {
            let bp = blueprints
                .get_by_name(&name)
                .with_context(|| format!("Failed to get blueprint {name}"))?;
            println!("{}", serde_json::to_string_pretty(&bp)?);
        }
        BlueprintCommand::Apply { file } => {
            let raw = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let mut bp: Blueprint = serde_json::from_str(&raw)
                .with_context(|| format!("Invalid blueprint {}", file.display()))?;

            let stored = match blueprints.get_by_name(&bp.name) {
                Ok(existing) => {
                    if bp.uuid.is_empty() {
                        bp.uuid = existing.uuid;
                    }
                    blueprints.save(&bp).context("Failed to save blueprint")?;
                    bp
                }
                Err(e) if e.is_not_found() => {
                    blueprints.create(bp).context("Failed to create blueprint")?
                }
                Err(e) => return Err(e).context("Failed to look up blueprint"),
            };
            println!("Applied blueprint {} ({})", stored.name, stored.uuid);
        }
        BlueprintCommand::Remove { name } => {
            let removed = blueprints
                .delete(&name)
                .with_context(|| format!("Failed to remove blueprint {name}"))?;
            println!("Removed blueprint {} ({})", removed.name, removed.uuid);
        }
    }
    Ok(())
}

fn cmd_profile(store: Arc<SqliteStore>, cmd: ProfileCommand) -> Result<()> {
    let profiles = ProfileStore::open(store).context("Failed to open profile store")?;

    match cmd {
        ProfileCommand::Add { identifier, file } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            profiles
                .save(&Profile::new(identifier.clone(), payload))
                .context("Failed to save profile")?;
            println!("Saved profile {identifier}");
        }
        ProfileCommand::List => {
            let all = profiles.list().context("Failed to list profiles")?;
            if all.is_empty() {
                println!("No profiles.");
            }
            for p in all {
                println!("{}  ({} bytes)", p.identifier, p.mobileconfig.len());
            }
        }
        ProfileCommand::Remove { identifier } => {
            profiles
                .delete(&identifier)
                .with_context(|| format!("Failed to remove profile {identifier}"))?;
            println!("Removed profile {identifier}");
        }
    }
    Ok(())
}

fn cmd_device_list(store: Arc<SqliteStore>) -> Result<()> {
    let devices = DeviceStore::open(store).context("Failed to open device store")?;
    let all = devices.list().context("Failed to list devices")?;
    if all.is_empty() {
        println!("No devices.");
    }
    for d in all {
        println!(
            "{}  {}  {}  {}",
            d.serial_number, d.model, d.dep_profile_status, d.uuid
        );
    }
    Ok(())
}

fn cmd_cursor(store: Arc<SqliteStore>, cmd: CursorCommand) -> Result<()> {
    let cursors = CursorStore::open(store).context("Failed to open cursor store")?;

    match cmd {
        CursorCommand::Show => {
            let cursor = cursors.load().context("Failed to load cursor")?;
            if cursor.is_empty() {
                println!("No cursor saved.");
            } else {
                println!("Cursor:     {}", cursor.value);
                println!("Created at: {}", cursor.created_at);
            }
        }
        CursorCommand::Reset => {
            cursors
                .save(&Cursor::default())
                .context("Failed to reset cursor")?;
            println!("Cursor reset. If `fleetd serve` is running it will overwrite this; stop it and reset again.");
        }
    }
    Ok(())
}
