use anyhow::{bail, Context, Result};
use skybridge_p2p::crypto::{CryptoProviderFactory, SelectionPolicy};
use skybridge_p2p::nat_traversal::{DiscoveredDevice, NatTraversalManager};
use skybridge_p2p::transport::{AppEvent, ConnectionId, Role, TransportManager};
use skybridge_p2p::CoreConfig;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();

    if args.len() < 2 {
        print_usage(&args[0]);
        std::process::exit(1);
    }

    let config = config_from_env()?;
    let runtime = tokio::runtime::Runtime::new()?;

    match args[1].as_str() {
        "nat" => runtime.block_on(run_nat(config))?,
        "listen" => {
            let port = match args.get(2) {
                Some(raw) => Some(raw.parse::<u16>().context("Invalid port")?),
                None => None,
            };
            runtime.block_on(run_listener(config, port))?
        }
        "connect" => {
            if args.len() < 3 {
                eprintln!("Usage: {} connect <host:port>", args[0]);
                std::process::exit(1);
            }
            runtime.block_on(run_dialer(config, &args[2]))?
        }
        _ => {
            eprintln!("Error: Invalid mode '{}'", args[1]);
            eprintln!();
            print_usage(&args[0]);
            std::process::exit(1);
        }
    }

    Ok(())
}

fn print_usage(program_name: &str) {
    eprintln!("skybridge-p2p - Secure direct P2P channels with NAT traversal");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("  {} nat                  # Detect NAT type and public endpoint", program_name);
    eprintln!("  {} listen [port]        # Accept peers (default port 9090)", program_name);
    eprintln!("  {} connect <host:port>  # Punch through and connect to a peer", program_name);
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("  SKYBRIDGE_STUN           Comma separated STUN servers (host:port)");
    eprintln!("  SKYBRIDGE_LISTEN_PORT    Default listener port");
    eprintln!("  SKYBRIDGE_CRYPTO_POLICY  prefer_post_quantum | classic_only | hybrid");
    eprintln!("  RUST_LOG                 Log filter (default: info)");
}

/// Map environment variables onto the default configuration
fn config_from_env() -> Result<CoreConfig> {
    let mut config = CoreConfig::default();

    if let Ok(servers) = env::var("SKYBRIDGE_STUN") {
        config.nat.stun_servers = servers
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }

    if let Ok(port) = env::var("SKYBRIDGE_LISTEN_PORT") {
        config.transport.listen_port = port
            .parse()
            .context("SKYBRIDGE_LISTEN_PORT must be a port number")?;
    }

    if let Ok(policy) = env::var("SKYBRIDGE_CRYPTO_POLICY") {
        config.crypto.policy = match policy.as_str() {
            "prefer_post_quantum" => SelectionPolicy::PreferPostQuantum,
            "classic_only" => SelectionPolicy::ClassicOnly,
            "hybrid" => SelectionPolicy::Hybrid,
            other => bail!("Unknown SKYBRIDGE_CRYPTO_POLICY '{}'", other),
        };
    }

    Ok(config)
}

async fn run_nat(config: CoreConfig) -> Result<()> {
    let nat = NatTraversalManager::new(config.nat);
    let nat_type = nat.detect_nat_type().await;

    println!("NAT type        : {:?}", nat_type);
    match nat.public_endpoint().await {
        Some(endpoint) => println!("Public endpoint : {}", endpoint),
        None => println!("Public endpoint : unknown"),
    }
    println!("Hole punching   : {}", if nat_type.is_traversable() { "likely" } else { "unlikely" });
    Ok(())
}

fn handshake(policy: SelectionPolicy) -> AppEvent {
    let provider = CryptoProviderFactory::create(policy);
    let device_name = env::var("HOSTNAME").unwrap_or_else(|_| "skybridge".to_string());
    AppEvent::handshake(
        APP_VERSION,
        device_name,
        vec![provider.algorithm().identifier().to_string()],
    )
}

fn print_event(connection: ConnectionId, event: &AppEvent) {
    match event {
        AppEvent::Handshake { app_version, device_name, capabilities } => {
            println!("[{}] handshake from {} v{} {:?}", connection, device_name, app_version, capabilities)
        }
        AppEvent::KeepAlive => {}
        AppEvent::TextMessage { text } => println!("[{}] {}", connection, text),
    }
}

async fn run_listener(config: CoreConfig, port: Option<u16>) -> Result<()> {
    let policy = config.crypto.policy;
    let transport = TransportManager::new(config.transport);

    // Handler runs on the dispatcher task; replies go through a queue
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .set_event_handler(Arc::new(move |connection, event| {
            print_event(connection, &event);
            if matches!(event, AppEvent::Handshake { .. }) {
                let _ = tx.send(connection);
            }
        }))
        .await;

    transport
        .start(Role::Listener, port)
        .await
        .context("Failed to start listener")?;
    println!("Listening on port {}", transport.local_port().await?);

    let greeting = handshake(policy);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            Some(connection) = rx.recv() => {
                if let Err(e) = transport.send(&greeting, connection).await {
                    warn!("Handshake reply failed: {}", e);
                }
            }
        }
    }

    transport.stop().await;
    Ok(())
}

async fn run_dialer(config: CoreConfig, target: &str) -> Result<()> {
    let policy = config.crypto.policy;
    let nat = NatTraversalManager::new(config.nat);
    let transport = TransportManager::new(config.transport);

    transport
        .set_event_handler(Arc::new(|connection, event| print_event(connection, &event)))
        .await;
    transport.start(Role::Dialer, None).await?;

    // Punching reuses the socket detection ran on
    let nat_type = nat.detect_nat_type().await;
    info!("Local NAT: {:?}", nat_type);

    let session = nat
        .create_session(DiscoveredDevice {
            device_id: target.to_string(),
            endpoints: vec![target.to_string()],
            display_name: target.to_string(),
        })
        .await;

    // Punch first; plain dialing still works against listeners on open networks
    let connection = match nat.perform_direct_connection(session.session_id).await {
        Ok(direct) => transport.adopt(direct).await,
        Err(e) => {
            warn!("Hole punching failed ({}), dialing directly", e);
            let addr: SocketAddr = tokio::net::lookup_host(target)
                .await
                .context("Failed to resolve peer")?
                .next()
                .context("Peer address did not resolve")?;
            transport.connect(addr).await.context("Failed to connect to peer")?
        }
    };
    info!("Connected to {} as {}", target, connection);

    transport.send(&handshake(policy), connection).await?;
    println!("Type a message and press Enter. Ctrl+D to exit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        transport
            .send(&AppEvent::text(line), connection)
            .await
            .context("Failed to send message")?;
    }

    transport.disconnect(connection).await?;
    transport.stop().await;
    Ok(())
}
