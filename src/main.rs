//! eipip - Encrypted personal-use IP-in-IP tunnel
//!
//! Bridges a TUN interface and a raw IPv4 socket, encrypting every inner
//! packet on the way out and decrypting it on the way in.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use eipip::codec::{CipherSuite, Codec, KeyMaterial};
use eipip::config::Config;
use eipip::encap::Encapsulator;
use eipip::stats::StatusReport;

/// Extra room on TUN reads so oversize packets are seen whole and rejected
const TUN_READ_SLACK: usize = 64;

/// eipip - Encrypted personal-use IP-in-IP tunnel
#[derive(Parser)]
#[command(name = "eipip")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "/etc/eipip/eipip.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bring the tunnel up and forward until interrupted
    Run,

    /// Write a new configuration file with a fresh key
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "eipip.toml")]
        output: PathBuf,

        /// Cipher suite (aes-cbc, chacha20-poly1305)
        #[arg(long, default_value = "aes-cbc", value_parser = parse_cipher)]
        cipher: CipherSuite,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Print a random hex key
    Genkey {
        /// Key length in bytes (16, 24 or 32)
        #[arg(long, default_value_t = 32, value_parser = parse_key_len)]
        bytes: usize,
    },

    /// Validate configuration file
    Validate,

    /// Show the status report written by a running tunnel
    Status {
        /// Status file path (defaults to dispatcher.status_file from the config)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}

fn parse_cipher(s: &str) -> Result<CipherSuite, String> {
    match s {
        "aes-cbc" => Ok(CipherSuite::AesCbc),
        "chacha20-poly1305" => Ok(CipherSuite::ChaCha20Poly1305),
        other => Err(format!("unknown cipher '{}'", other)),
    }
}

fn parse_key_len(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(n @ (16 | 24 | 32)) => Ok(n),
        _ => Err(format!("key length must be 16, 24 or 32, got '{}'", s)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => run_tunnel(&cli.config, cli.log_level.as_deref()).await,
        Commands::Init {
            output,
            cipher,
            force,
        } => {
            init_logging(cli.log_level.as_deref().unwrap_or("info"));
            run_init(&output, cipher, force)
        }
        Commands::Genkey { bytes } => {
            println!("{}", KeyMaterial::generate(bytes).to_hex());
            Ok(())
        }
        Commands::Validate => run_validate(&cli.config),
        Commands::Status { file } => run_status(&cli.config, file),
    }
}

/// Initialize logging. `RUST_LOG` wins over `level`.
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    Config::from_file(path).with_context(|| format!("failed to load {}", path.display()))
}

/// Run the tunnel daemon
#[cfg(target_os = "linux")]
async fn run_tunnel(config_path: &Path, log_level: Option<&str>) -> anyhow::Result<()> {
    use eipip::dispatcher::{Dispatcher, DispatcherSettings, StopReason};
    use eipip::transport::{PacketEndpoint, RawSocket, TunDevice};

    let config = load_config(config_path)?;
    init_logging(log_level.unwrap_or(&config.logging.level));

    if !nix::unistd::Uid::effective().is_root() {
        bail!("eipip needs root (CAP_NET_ADMIN and CAP_NET_RAW) to create the tunnel");
    }

    let peer = config.peer_config();
    let key = config.load_key().context("failed to load tunnel key")?;
    let codec = Codec::new(peer.cipher, key)?;
    let encap = Arc::new(Encapsulator::new(peer, codec)?);

    tracing::info!("Starting eipip {}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        "Tunnel {} -> {} (protocol {}, {}, inner MTU {})",
        peer.local_address,
        peer.remote_address,
        peer.protocol,
        peer.cipher,
        encap.mtu_budget()
    );

    let tun = TunDevice::create(&config.tunnel.interface, encap.mtu_budget() + TUN_READ_SLACK)
        .with_context(|| format!("failed to create TUN device {}", config.tunnel.interface))?;
    if let Some(address) = config.tunnel.address {
        tun.configure(address, config.tunnel.prefix, encap.mtu_budget())?;
        tracing::info!("{} configured as {}/{}", tun.name(), address, config.tunnel.prefix);
    }

    let raw = RawSocket::open(peer.protocol, Some(peer.local_address), peer.remote_address)
        .context("failed to open raw socket")?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let dispatcher = Dispatcher::new(tun, raw, encap, DispatcherSettings::from(&config.dispatcher));
    match dispatcher.run(cancel).await {
        Ok(StopReason::Cancelled) => {
            tracing::info!("eipip shut down");
            Ok(())
        }
        Err(e) => {
            tracing::error!("Tunnel failed: {}", e);
            Err(e.into())
        }
    }
}

#[cfg(not(target_os = "linux"))]
async fn run_tunnel(_config_path: &Path, _log_level: Option<&str>) -> anyhow::Result<()> {
    bail!("the tunnel daemon requires Linux TUN support")
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_on_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!("Cannot listen for SIGTERM: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    tracing::info!("Received shutdown signal");
    token.cancel();
}

/// Write a fresh configuration file
fn run_init(output: &Path, cipher: CipherSuite, force: bool) -> anyhow::Result<()> {
    if output.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", output.display());
    }

    let key_len = cipher.key_lengths().iter().copied().max().unwrap_or(32);
    let key = KeyMaterial::generate(key_len);
    Config::template(&key, cipher)
        .save(output)
        .with_context(|| format!("failed to write {}", output.display()))?;

    println!("✓ Configuration written to {}", output.display());
    println!("  Cipher: {} ({}-byte key)", cipher, key_len);
    println!();
    println!("Edit tunnel.local_address and tunnel.remote_address, then copy the");
    println!("same key to the peer with the two addresses swapped.");
    Ok(())
}

/// Validate the configuration file
fn run_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("✗ Configuration error: {:#}", e);
            return Err(e);
        }
    };
    let key = match config.load_key() {
        Ok(key) => key,
        Err(e) => {
            eprintln!("✗ Key error: {}", e);
            return Err(e.into());
        }
    };

    let peer = config.peer_config();
    println!("✓ Configuration is valid");
    println!("  Interface:      {}", config.tunnel.interface);
    println!("  Local:          {}", peer.local_address);
    println!("  Remote:         {}", peer.remote_address);
    println!("  Protocol:       {}", peer.protocol);
    println!("  TTL / TOS:      {} / {:#04x}", peer.ttl, peer.tos);
    println!("  PMTU discovery: {}", peer.pmtu_discovery);
    println!("  Cipher:         {} ({}-byte key)", peer.cipher, key.len());
    println!("  Outer MTU:      {}", peer.outer_mtu);
    println!("  Inner MTU:      {}", peer.mtu_budget());
    Ok(())
}

/// Print the status report of a running tunnel
fn run_status(config_path: &Path, file: Option<PathBuf>) -> anyhow::Result<()> {
    let path = match file {
        Some(path) => path,
        None => load_config(config_path)?
            .dispatcher
            .status_file
            .context("no --file given and dispatcher.status_file is not configured")?,
    };

    let report = StatusReport::read_from(&path)
        .with_context(|| format!("failed to read status file {}", path.display()))?;
    let stats = &report.stats;

    println!("eipip status ({})", report.generated_at.format("%Y-%m-%d %H:%M:%S UTC"));
    println!("==========================");
    println!("Interface:   {}", report.interface);
    println!("Tunnel:      {} -> {}", report.peer.local_address, report.peer.remote_address);
    println!("Protocol:    {} ({})", report.peer.protocol, report.peer.cipher);
    println!("Uptime:      {}s", report.uptime_secs);
    println!();
    println!("TX:          {} packets, {} bytes", stats.tx_packets, stats.tx_bytes);
    println!("RX:          {} packets, {} bytes", stats.rx_packets, stats.rx_bytes);
    println!("Dropped:     {}", stats.total_dropped());
    println!("  oversize   {}", stats.dropped_oversize);
    println!("  truncated  {}", stats.dropped_truncated);
    println!("  malformed  {}", stats.dropped_malformed);
    println!("  checksum   {}", stats.dropped_checksum);
    println!("  protocol   {}", stats.dropped_protocol);
    println!("  corrupt    {}", stats.dropped_corrupt);
    Ok(())
}
