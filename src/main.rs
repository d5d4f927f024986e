//! WolfLAN - Virtual Ethernet LAN over a peer-to-peer overlay
//!
//! Creates a TAP interface and joins it to a named virtual network whose
//! members find each other by broadcast, static peers or announcements.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wolflan::config::WolfLanConfig;
use wolflan::discovery::{
    BroadcastDiscovery, BroadcastPubSub, CombinedDiscovery, Discovery, PubSub, StaticDiscovery,
};
use wolflan::error::{Error, Result};
use wolflan::ethernet::HardwareAddr;
use wolflan::network::{Discoverers, VirtualNetwork};
use wolflan::overlay::{Overlay, PeerId, TcpOverlay};

/// WolfLAN - Virtual Ethernet LAN over a peer-to-peer overlay
#[derive(Parser)]
#[command(name = "wolflan")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wolflan.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the interface and join the network
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wolflan.toml")]
        output: PathBuf,

        /// Network name
        #[arg(long, default_value = "default")]
        network: String,

        /// Interface address in CIDR notation
        #[arg(long)]
        address: Option<String>,
    },

    /// Validate configuration file
    Validate,

    /// Show node information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Command line wins over the config file; RUST_LOG wins over both
    let level = match cli.log_level {
        Some(ref level) => level.clone(),
        None => WolfLanConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string()),
    };
    init_logging(&level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init { output, network, address } => run_init(output, network, address),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Join the configured network and run until interrupted
#[cfg(target_os = "linux")]
async fn run_start(config_path: PathBuf) -> Result<()> {
    use wolflan::interface::{TapInterface, TapOptions, VirtualInterface};

    tracing::info!("Starting WolfLAN node...");

    let config = match WolfLanConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };

    if !nix::unistd::Uid::effective().is_root() {
        tracing::warn!("Not running as root; creating the TAP interface needs CAP_NET_ADMIN");
    }

    let local_id = config.local_identity()?.unwrap_or_else(PeerId::random);
    let overlay = TcpOverlay::bind(local_id, &config.node.bind_address, config.advertise_socket_addr()?).await?;

    let interface = TapInterface::create(&TapOptions {
        name_prefix: config.interface.name_prefix.clone(),
        address: config.interface.address.clone(),
        mtu: config.interface.mtu,
        hardware_address: config.hardware_address()?,
    })?;
    tracing::info!("Interface {} up with address {}", interface.name(), interface.hardware_address());

    let discoverers = build_discoverers(&config, &overlay)?;
    let shutdown = CancellationToken::new();
    let network = VirtualNetwork::create(
        &shutdown,
        &config.network.name,
        Arc::new(overlay.clone()),
        Arc::new(interface),
        discoverers,
        config.network_options(),
    )
    .await?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
        _ = network.closed() => {
            tracing::error!("Network {} stopped unexpectedly", network.name());
        }
    }

    shutdown.cancel();
    let result = network.close().await;
    overlay.shutdown();
    tracing::info!("WolfLAN node stopped");
    result
}

#[cfg(not(target_os = "linux"))]
async fn run_start(_config_path: PathBuf) -> Result<()> {
    Err(Error::LocalInterface("TAP interfaces are only supported on Linux".into()))
}

/// Discovery collaborators for the configured mode
fn build_discoverers(config: &WolfLanConfig, overlay: &TcpOverlay) -> Result<Discoverers> {
    let mut discoverers = Discoverers::default();

    if config.discovery.mode.uses_lookup() {
        let mut lookup = CombinedDiscovery::default();
        let peers = config.bootstrap_peers()?;
        if !peers.is_empty() {
            lookup.push(Arc::new(StaticDiscovery::new(peers)));
        }
        if config.discovery.broadcast {
            lookup.push(Arc::new(BroadcastDiscovery::new(
                overlay.local_id(),
                overlay.listen_locators(),
                config.discovery.lookup_port,
            )));
        }
        if !lookup.is_empty() {
            discoverers.lookup = Some(Arc::new(lookup) as Arc<dyn Discovery>);
        }
    }

    if config.discovery.mode.uses_group() && config.discovery.broadcast {
        discoverers.group = Some(Arc::new(BroadcastPubSub::new(config.discovery.group_port)) as Arc<dyn PubSub>);
    }

    if discoverers.lookup.is_none() && discoverers.group.is_none() {
        tracing::warn!("No discovery configured; only peers that connect to us will be found");
    }
    Ok(discoverers)
}

/// Initialize configuration file
fn run_init(output: PathBuf, network: String, address: Option<String>) -> Result<()> {
    if output.exists() {
        return Err(Error::Config(format!("{} already exists", output.display())));
    }

    let identity = PeerId::random();
    let mac = HardwareAddr::random_local();
    let address_line = match address {
        Some(ref address) => format!("address = \"{}\"", address),
        None => "# address = \"10.0.0.10/24\"".to_string(),
    };

    let config_content = format!(r#"# WolfLAN Configuration
# Generated configuration file

[network]
name = "{network}"

[node]
bind_address = "0.0.0.0:9600"
# advertise_address = "my-public-ip:9600"
identity = "{identity}"

[interface]
name_prefix = "tap"
{address_line}
mtu = 1500
hardware_address = "{mac}"

[discovery]
# lookup, group or both
mode = "both"
peers = []
# peers = ["192.168.1.20:9600", "/ip4/192.168.1.21/tcp/9600"]
broadcast = true
lookup_port = 9610
group_port = 9611
connect_timeout_secs = 15
bootstrap_timeout_secs = 30

[logging]
level = "info"
"#);

    // Never write something we could not load back
    WolfLanConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to set the interface address and bootstrap peers.");
    println!("Then start with: sudo wolflan --config {} start", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WolfLanConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Network:        {}", config.network.name);
            println!("  Bind Address:   {}", config.node.bind_address);
            println!("  Discovery:      {:?}", config.discovery.mode);
            println!("  Static Peers:   {}", config.discovery.peers.len());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show node information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WolfLanConfig::from_file(&config_path)?;
    let identity = config
        .local_identity()?
        .map(|id| id.to_string())
        .unwrap_or_else(|| "(random per start)".to_string());
    let mac = config
        .hardware_address()?
        .map(|mac| mac.to_string())
        .unwrap_or_else(|| "(assigned by kernel)".to_string());

    println!("WolfLAN Node Information");
    println!("========================");
    println!();
    println!("Network:          {}", config.network.name);
    println!("Identity:         {}", identity);
    println!("Bind Address:     {}", config.node.bind_address);
    println!("Advertise:        {}", config.advertise_address());
    println!();
    println!("Interface:");
    println!("  Name Prefix:    {}", config.interface.name_prefix);
    println!("  Address:        {}", config.interface.address.as_deref().unwrap_or("(none)"));
    println!("  Hardware:       {}", mac);
    println!("  MTU:            {}", config.interface.mtu);
    println!();
    println!("Discovery:");
    println!("  Mode:           {:?}", config.discovery.mode);
    println!("  Static Peers:   {:?}", config.discovery.peers);
    println!("  Broadcast:      {}", config.discovery.broadcast);
    println!("  Connect:        {} s", config.discovery.connect_timeout_secs);
    println!("  Bootstrap:      {} s", config.discovery.bootstrap_timeout_secs);

    Ok(())
}
