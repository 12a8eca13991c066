// skein: command-line front end for the skein protocol engine
//
// Manages the local identity, configuration and store, and can run an
// in-process mesh to watch the protocol at work.

mod config;
mod identity;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use identity::NodeIdentity;
use skein_core::crypto::identity::parse_public_key_hex;
use skein_core::transport::LocalMedium;
use skein_core::{
    IdentityKeys, LinkManager, Message, ProtocolEvent, Store, UserId, PROTOCOL_VERSION,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "skein")]
#[command(about = "skein: store-and-forward messaging over short-range links", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the local identity
    Init {
        /// User id to claim (random when omitted)
        #[arg(short, long)]
        user_id: Option<UserId>,
        /// Replace an existing identity
        #[arg(long)]
        force: bool,
    },
    /// Show identity information
    Identity {
        #[command(subcommand)]
        action: Option<IdentityAction>,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Manage known device keys
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
    /// Show what the local store holds
    Status,
    /// Run an in-process line of nodes and send a broadcast and a relay message
    Simulate {
        #[arg(short, long, default_value = "4")]
        nodes: usize,
        #[arg(short, long, default_value = "3")]
        ttl: u8,
        #[arg(long, default_value = "hello mesh")]
        text: String,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    Show,
    Export,
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
}

#[derive(Subcommand)]
enum DeviceAction {
    /// Register a device key learned out of band
    Add { user_id: UserId, public_key: String },
    Show { user_id: UserId },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::Config::load()?;
    let _log_guard = init_logging(&config)?;

    match cli.command {
        Commands::Init { user_id, force } => cmd_init(user_id, force).await,
        Commands::Identity { action } => cmd_identity(action).await,
        Commands::Config { action } => cmd_config(config, action).await,
        Commands::Device { action } => cmd_device(&config, action).await,
        Commands::Status => cmd_status(&config).await,
        Commands::Simulate { nodes, ttl, text } => cmd_simulate(&config, nodes, ttl, text).await,
    }
}

/// RUST_LOG wins over the configured filter. The guard must outlive main.
fn init_logging(config: &config::Config) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    let Some(log_file) = &config.log_file else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return Ok(None);
    };
    let path = PathBuf::from(log_file);
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = path.file_name().context("log_file has no file name")?;
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(dir, file_name));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();
    Ok(Some(guard))
}

fn identity_file() -> Result<PathBuf> {
    Ok(config::Config::data_dir()?.join("identity.json"))
}

async fn cmd_init(user_id: Option<UserId>, force: bool) -> Result<()> {
    println!("{}", "Initializing skein...".bold());
    println!();

    let data_dir = config::Config::data_dir()?;
    println!("  {} Data directory: {}", "✓".green(), data_dir.display());

    let path = identity_file()?;
    if path.exists() && !force {
        let existing = NodeIdentity::load(&path)?;
        println!(
            "  {} Identity already exists (user {}), use --force to replace it",
            "•".yellow(),
            existing.user_id
        );
        return Ok(());
    }

    let identity = NodeIdentity::generate(user_id);
    identity.save(&path)?;
    println!("  {} Identity created", "✓".green());
    println!();
    print_identity(&identity);
    println!();

    println!("{}", "Next steps:".bold());
    println!(
        "  • Share your key:   {}",
        "skein identity show".bright_green()
    );
    println!(
        "  • Add a device:     {}",
        "skein device add <user-id> <public-key>".bright_green()
    );
    println!("  • Try the mesh:     {}", "skein simulate".bright_green());
    Ok(())
}

fn print_identity(identity: &NodeIdentity) {
    println!("{}", "Identity Information".bold());
    println!("  User ID:     {}", identity.user_id.to_string().bright_cyan());
    println!(
        "  Public Key:  {}",
        identity.keys.public_key_hex().bright_yellow()
    );
    println!("  Fingerprint: {}", identity.keys.fingerprint());
    println!("  Protocol:    {}", PROTOCOL_VERSION);
}

async fn cmd_identity(action: Option<IdentityAction>) -> Result<()> {
    let path = identity_file()?;
    let identity = NodeIdentity::load(&path)?;

    match action {
        None | Some(IdentityAction::Show) => print_identity(&identity),
        Some(IdentityAction::Export) => {
            println!("{}", "Export Identity (Backup)".bold());
            println!();
            println!(
                "{}",
                "⚠️  WARNING: Keep your keys secure!".bright_red().bold()
            );
            println!();
            println!("User ID:    {}", identity.user_id);
            println!("Public Key: {}", identity.keys.public_key_hex());
            println!("Secret Key: {}", hex::encode(identity.keys.to_bytes().as_slice()));
            println!();
            println!("Stored in: {}", path.display().to_string().bright_cyan());
        }
    }
    Ok(())
}

async fn cmd_config(mut config: config::Config, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }
        }
    }
    Ok(())
}

fn open_store(config: &config::Config) -> Result<Store> {
    let dir = config.storage_dir()?;
    Store::persistent(&dir).with_context(|| format!("Failed to open store at {}", dir.display()))
}

async fn cmd_device(config: &config::Config, action: DeviceAction) -> Result<()> {
    let store = open_store(config)?;
    match action {
        DeviceAction::Add {
            user_id,
            public_key,
        } => {
            let key = parse_public_key_hex(&public_key).context("Invalid public key")?;
            let changed = store.devices.upsert(user_id, key, skein_core::unix_now())?;
            store.flush()?;
            if changed {
                println!("{} Device {} stored", "✓".green(), user_id.to_string().bright_cyan());
            } else {
                println!("{} Device {} already known", "•".yellow(), user_id);
            }
        }
        DeviceAction::Show { user_id } => match store.devices.get(user_id)? {
            Some(record) => {
                println!("{}", "Device".bold());
                println!("  User ID:    {}", user_id.to_string().bright_cyan());
                println!("  Public Key: {}", hex::encode(record.public_key).bright_yellow());
                println!("  Updated:    {}", record.updated_at);
            }
            None => println!("{}", "Unknown device.".dimmed()),
        },
    }
    Ok(())
}

async fn cmd_status(config: &config::Config) -> Result<()> {
    let store = open_store(config)?;
    println!("{}", "Store".bold());
    println!("  Path:    {}", config.storage_dir()?.display());
    println!("  Blocks:  {}", store.blocks.len()?);
    println!("  Devices: {}", store.devices.count()?);

    match NodeIdentity::load(&identity_file()?) {
        Ok(identity) => println!("  User ID: {}", identity.user_id.to_string().bright_cyan()),
        Err(_) => println!("  User ID: {}", "(no identity)".dimmed()),
    }
    Ok(())
}

struct SimNode {
    address: String,
    manager: Arc<LinkManager>,
    events: UnboundedReceiver<ProtocolEvent>,
}

async fn cmd_simulate(config: &config::Config, nodes: usize, ttl: u8, text: String) -> Result<()> {
    anyhow::ensure!(nodes >= 2, "A simulation needs at least two nodes");

    info!("Simulating {} nodes, broadcast ttl {}", nodes, ttl);
    println!("{}", "skein mesh simulation".bold());
    println!();

    let medium = LocalMedium::new();
    let mut sim = Vec::with_capacity(nodes);
    for i in 0..nodes {
        let address = format!("node-{}", i + 1);
        let (tx, events) = unbounded_channel();
        let manager = LinkManager::new(
            i as UserId + 1,
            IdentityKeys::generate(),
            config.protocol.clone(),
            Arc::new(Store::memory()),
            medium.transport(&address),
            Arc::new(tx),
        )?;
        medium.attach(&address, &manager);
        manager.start()?;
        if i > 0 {
            medium.set_in_range(&format!("node-{}", i), &address, true);
        }
        sim.push(SimNode {
            address,
            manager,
            events,
        });
    }
    let managers: Vec<Arc<LinkManager>> = sim.iter().map(|n| n.manager.clone()).collect();

    medium.settle(&managers);
    println!(
        "{} {} nodes in a line, {} links up",
        "✓".green(),
        nodes,
        medium.link_count()
    );
    report(&mut sim);

    let first = sim[0].manager.clone();
    let broadcast = Message::builder().field("text", text.as_str()).build();
    let id = first.send_broadcast(broadcast, ttl)?;
    medium.run_until_idle(&managers);
    println!();
    println!(
        "{} Broadcast {} sent with TTL {}",
        "→".bright_green(),
        id,
        ttl
    );
    report(&mut sim);

    let last = sim[nodes - 1].manager.clone();
    first.add_device(last.user_id(), last.identity().public_key_bytes())?;
    let message = Message::builder()
        .receiver(last.user_id())
        .field("text", text.as_str())
        .build();
    let id = first.send_message(message)?;
    medium.run_until_idle(&managers);
    println!();
    println!(
        "{} Message {} sent to user {}",
        "→".bright_green(),
        id,
        last.user_id()
    );
    report(&mut sim);

    println!();
    println!("{} {} frames delivered", "✓".green(), medium.frames_delivered());
    for node in &sim {
        node.manager.stop();
    }
    Ok(())
}

fn report(sim: &mut [SimNode]) {
    for node in sim.iter_mut() {
        while let Ok(event) = node.events.try_recv() {
            print_event(&node.address, &event);
        }
    }
}

fn print_event(address: &str, event: &ProtocolEvent) {
    let at = address.bright_cyan();
    match event {
        ProtocolEvent::DeviceConnected { user_id, address } => {
            println!("  {} {} connected to user {} ({})", "↔".bright_green(), at, user_id, address)
        }
        ProtocolEvent::DeviceLost { user_id, address } => {
            println!("  {} {} lost user {} ({})", "✗".bright_red(), at, user_id, address)
        }
        ProtocolEvent::MessageReceived(message) => println!(
            "  {} {} got message {} from {}: {}",
            "←".bright_blue(),
            at,
            message.id,
            message.sender_id,
            message.text("text").unwrap_or("").bright_yellow()
        ),
        ProtocolEvent::BroadcastReceived(message) => println!(
            "  {} {} got broadcast {} from {} (ttl left {}): {}",
            "←".bright_blue(),
            at,
            message.id,
            message.sender_id,
            message.ttl,
            message.text("text").unwrap_or("").bright_yellow()
        ),
        ProtocolEvent::AckReceived(id) => {
            println!("  {} {} message {} acknowledged", "✓".green(), at, id)
        }
    }
}
