//! # onionnet
//!
//! Runs the pieces of an onionnet overlay: the registry, relays and users,
//! each as its own process, or all of them at once with `demo`.
//!
//! ## Usage
//! ```bash
//! onionnet registry                 # registry on 127.0.0.1:8080
//! onionnet relay --id 1             # relay 1 on 127.0.0.1:4001
//! onionnet user --id 1              # user 1 on 127.0.0.1:3001
//! onionnet send --from 1 --to 2 --message "hello" --hops 3
//! onionnet demo --relays 5 --hops 3 --message "hello"
//! onionnet config                   # print the effective configuration
//! ```
//!
//! Start the registry first; relays register with it at startup.

mod config;
mod launch;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use onionnet_transport::{Request, TcpTransport, Transport, UserId};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::{check_node_id, NodeConfig};
use crate::launch::{Launched, Launcher};

/// onionnet onion routing overlay
#[derive(Parser, Debug)]
#[command(name = "onionnet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults apply if it does not exist)
    #[arg(short, long, global = true, default_value = "onionnet.toml")]
    config: PathBuf,

    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the node registry
    Registry,

    /// Run a relay
    Relay {
        /// Relay ID; listens on base_router_port + id
        #[arg(long)]
        id: u32,
    },

    /// Run a user
    User {
        /// User ID; listens on base_user_port + id
        #[arg(long)]
        id: UserId,
    },

    /// Ask a running user to send a message
    Send {
        /// Sending user
        #[arg(long)]
        from: UserId,

        /// Destination user
        #[arg(long)]
        to: UserId,

        /// Message text
        #[arg(short, long)]
        message: String,

        /// Relays in the circuit (config default if omitted)
        #[arg(long)]
        hops: Option<usize>,
    },

    /// Start a registry, relays and two users in one process and send a
    /// message from user 1 to user 2
    Demo {
        /// Number of relays to start
        #[arg(long, default_value_t = 3)]
        relays: u32,

        /// Relays in the circuit (config default if omitted)
        #[arg(long)]
        hops: Option<usize>,

        /// Message text
        #[arg(short, long, default_value = "hello")]
        message: String,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let (config, source) = match NodeConfig::load_or_default(&cli.config).await {
        Ok(loaded) => loaded,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    init_logging(&config.logging.level);
    info!("Configuration {}", source);

    let launcher = Launcher::new(config);
    let result = match cli.command {
        Commands::Registry => cmd_registry(&launcher).await,
        Commands::Relay { id } => cmd_relay(&launcher, id).await,
        Commands::User { id } => cmd_user(&launcher, id).await,
        Commands::Send {
            from,
            to,
            message,
            hops,
        } => cmd_send(&launcher, from, to, message, hops).await,
        Commands::Demo {
            relays,
            hops,
            message,
        } => cmd_demo(&launcher, relays, hops, message).await,
        Commands::Config => cmd_config(&launcher),
    };

    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn cmd_registry(launcher: &Launcher) -> anyhow::Result<()> {
    let registry = launcher.registry().await?;
    run_until_shutdown(registry).await
}

async fn cmd_relay(launcher: &Launcher, id: u32) -> anyhow::Result<()> {
    let relay = launcher.relay(id).await?;
    run_until_shutdown(relay).await
}

async fn cmd_user(launcher: &Launcher, id: UserId) -> anyhow::Result<()> {
    let user = launcher.user(id).await?;
    run_until_shutdown(user).await
}

async fn cmd_send(
    launcher: &Launcher,
    from: UserId,
    to: UserId,
    message: String,
    hops: Option<usize>,
) -> anyhow::Result<()> {
    check_node_id("send --from", from)?;
    let network = &launcher.config().network;
    let address = network
        .user_address(from)
        .with_context(|| format!("user {} has no port in this layout", from))?;

    let transport = TcpTransport::new(launcher.config().rpc.clone());
    transport
        .call(
            &address,
            Request::SendMessage {
                message,
                destination_user_id: to,
                circuit_length: hops,
            },
        )
        .await
        .with_context(|| format!("contacting user {} at {}", from, address))?
        .into_ack()
        .with_context(|| format!("user {} could not send", from))?;

    let circuit = transport
        .call(&address, Request::GetLastCircuit)
        .await?
        .into_circuit()?;

    println!("Message from user {} to user {} sent", from, to);
    println!("   Circuit: {}", render_circuit(&circuit));
    Ok(())
}

async fn cmd_demo(
    launcher: &Launcher,
    relays: u32,
    hops: Option<usize>,
    message: String,
) -> anyhow::Result<()> {
    let hops = hops.unwrap_or(launcher.config().circuit.default_length);
    if relays == 0 {
        bail!("the demo needs at least one relay");
    }

    let _registry = launcher.registry().await?;
    let mut running = Vec::new();
    for id in 1..=relays {
        running.push(launcher.relay(id).await?);
    }
    let alice = launcher.user(1).await?;
    let bob = launcher.user(2).await?;

    let circuit = alice
        .node
        .send_message(&message, bob.node.user_id(), hops)
        .await
        .context("sending demo message")?;
    info!("Demo message dispatched through {} relays", circuit.len());

    let deadline = launcher.config().rpc.timeout();
    let delivered = tokio::time::timeout(deadline, async {
        loop {
            if let Some(received) = bob.node.last_received_message() {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .context("message was not delivered in time")?;

    println!("onionnet demo");
    println!("════════════════════════════════════════");
    println!("   Relays:    {}", relays);
    println!("   Circuit:   {}", render_circuit(&circuit.node_ids()));
    println!("   Sent:      {}", message);
    println!("   Delivered: {}", delivered);
    println!();
    for relay in &running {
        let stats = relay.node.stats();
        println!(
            "   relay {:>3}  received {}  forwarded {}  delivered {}  dropped {}",
            relay.node.node_id(),
            stats.received,
            stats.forwarded,
            stats.delivered,
            stats.dropped
        );
    }
    Ok(())
}

fn cmd_config(launcher: &Launcher) -> anyhow::Result<()> {
    print!("{}", launcher.config().to_toml()?);
    Ok(())
}

fn render_circuit(circuit: &[onionnet_transport::NodeId]) -> String {
    circuit
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(" -> ")
}

async fn run_until_shutdown<T>(launched: Launched<T>) -> anyhow::Result<()> {
    let Launched { address, handle, .. } = launched;
    tokio::select! {
        result = handle => {
            result.context("server task panicked")??;
            Ok(())
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down {}", address);
            Ok(())
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
