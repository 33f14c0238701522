// overmesh-cli — Overlay demonstration binary
//
// Cross-platform (macOS, Linux, Windows) command-line driver that assembles
// an in-process mesh, joins overlay nodes onto it, and prints what their
// delegates see.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tracing::info;

use overmesh_core::{
    LinkState, LocalMesh, OverlayDelegate, OverlayMessage, PeerOverlay, StateChange,
};

#[derive(Parser)]
#[command(name = "overmesh")]
#[command(about = "Overmesh — peer overlay over a flooding mesh", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scripted overlay session on an in-process mesh
    Simulate {
        /// Number of nodes to join
        #[arg(short, long, default_value = "3")]
        nodes: usize,
        /// Discovery rounds to wait before sampling traffic
        #[arg(short, long, default_value = "2")]
        rounds: u64,
        /// Payload for the sample broadcast
        #[arg(short, long, default_value = "hello from the overlay")]
        message: String,
        /// Bound the broadcast flood radius in hops
        #[arg(long)]
        hop_limit: Option<u32>,
        /// Wire the nodes in a line instead of a full mesh
        #[arg(long)]
        line: bool,
    },
    /// Manage profile documents
    Profile {
        #[command(subcommand)]
        action: ProfileAction,
    },
}

#[derive(Subcommand)]
enum ProfileAction {
    /// Write a starter profile document
    Init {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// Print the profile document
    Show {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
    /// List the profiles defined in the document
    List {
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            nodes,
            rounds,
            message,
            hop_limit,
            line,
        } => cmd_simulate(nodes, rounds, message, hop_limit, line).await,
        Commands::Profile { action } => match action {
            ProfileAction::Init { path } => cmd_profile_init(path),
            ProfileAction::Show { path } => cmd_profile_show(path),
            ProfileAction::List { path } => cmd_profile_list(path),
        },
    }
}

// ============================================================================
// SIMULATION
// ============================================================================

/// Delegate that prints every callback as a timestamped line.
struct EventPrinter {
    node: String,
}

fn stamp() -> String {
    chrono::Local::now().format("%H:%M:%S%.3f").to_string()
}

impl OverlayDelegate for EventPrinter {
    fn on_state_changed(&self, change: StateChange) {
        let cause = match change.cause {
            Some(cause) => format!(" ({cause})"),
            None => String::new(),
        };
        println!(
            "{} {} {} {} -> {}{}",
            stamp().dimmed(),
            self.node.bright_cyan(),
            "state".bold(),
            change.old,
            change.new,
            cause.bright_red(),
        );
    }

    fn on_message(&self, message: OverlayMessage, _note: String) {
        println!(
            "{} {} {} \"{}\" from {} ({} hops)",
            stamp().dimmed(),
            self.node.bright_cyan(),
            "recv".bright_green(),
            message.contents,
            message.sender.bright_yellow(),
            message.hops_traveled(),
        );
    }

    fn on_info(&self, note: String) {
        println!(
            "{} {} {}",
            stamp().dimmed(),
            self.node.bright_cyan(),
            note.dimmed(),
        );
    }
}

fn sim_profile(node: &str) -> String {
    serde_json::json!({
        "profiles": {
            "sim": {
                "node_id": node,
                "network_name": "simulation",
                "neighbor_query_interval_secs": 1
            }
        }
    })
    .to_string()
}

async fn wait_online(overlay: &PeerOverlay, name: &str) -> Result<()> {
    for _ in 0..50 {
        if overlay.state() == LinkState::Online {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    anyhow::bail!("{name} never came online");
}

async fn cmd_simulate(
    nodes: usize,
    rounds: u64,
    message: String,
    hop_limit: Option<u32>,
    line: bool,
) -> Result<()> {
    if nodes < 2 {
        anyhow::bail!("A simulation needs at least two nodes");
    }

    let names: Vec<String> = (1..=nodes).map(|i| format!("node-{i}")).collect();
    let mesh = Arc::new(LocalMesh::new("simulation"));

    if line {
        for pair in names.windows(2) {
            mesh.connect(&pair[0], &pair[1]);
        }
        println!("{} {}", "Topology:".bold(), names.join(" - "));
    } else {
        println!("{} full mesh, {} nodes", "Topology:".bold(), nodes);
    }
    println!();

    // Step 1: join everyone and wait for the mesh to report them online.
    let mut overlays = Vec::with_capacity(nodes);
    for name in &names {
        let overlay = PeerOverlay::new(mesh.clone());
        overlay.set_delegate(Arc::new(EventPrinter { node: name.clone() }));
        overlay
            .join(&sim_profile(name), "sim")
            .await
            .with_context(|| format!("Failed to join {name}"))?;
        overlays.push(overlay);
    }
    for (overlay, name) in overlays.iter().zip(&names) {
        wait_online(overlay, name).await?;
    }
    info!(nodes, "simulation mesh assembled");

    // Step 2: let discovery run for the requested number of rounds.
    tokio::time::sleep(Duration::from_secs(rounds) + Duration::from_millis(500)).await;

    // Step 3: sample traffic. A broadcast from the first node, then a
    // unicast back to it from the last.
    let first = &names[0];
    let last = &names[nodes - 1];
    match hop_limit {
        Some(limit) => {
            println!();
            println!("{} {first} broadcasts within {limit} hops", "-->".bold());
            overlays[0].broadcast_within(&message, limit).await?;
        }
        None => {
            println!();
            println!("{} {first} broadcasts", "-->".bold());
            overlays[0].broadcast(&message).await?;
        }
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    println!("{} {last} answers {first} directly", "-->".bold());
    overlays[nodes - 1]
        .send_to(&format!("ack from {last}"), first)
        .await?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Step 4: report what every node ended up knowing.
    println!();
    println!("{}", "Neighborhoods".bold());
    for (overlay, name) in overlays.iter().zip(&names) {
        let mut list = overlay.neighbors();
        list.sort();
        let rendered = if list.is_empty() {
            "(none)".to_string()
        } else {
            list.join(", ")
        };
        println!("  {name:<8} {rendered}");
    }

    println!();
    println!("{}", "Traffic".bold());
    println!(
        "  {:<8} {:<8} {:>6} {:>9} {:>6} {:>9} {:>6}",
        "node", "state", "tx", "tx bytes", "rx", "rx bytes", "hops"
    );
    for (overlay, name) in overlays.iter().zip(&names) {
        let snapshot = overlay.stats();
        println!(
            "  {:<8} {:<8} {:>6} {:>9} {:>6} {:>9} {:>6}",
            name,
            overlay.state().to_string(),
            snapshot.messages_tx,
            snapshot.bytes_tx,
            snapshot.messages_rx,
            snapshot.bytes_rx,
            snapshot.hop_count_sum,
        );
    }

    // Step 5: clean shutdown.
    println!();
    futures::future::join_all(overlays.iter().map(|overlay| overlay.leave())).await;
    println!("{} All nodes left the mesh", "✓".green());

    Ok(())
}

// ============================================================================
// PROFILE MANAGEMENT
// ============================================================================

fn cmd_profile_init(path: Option<PathBuf>) -> Result<()> {
    let store = config::ProfileStore::open(path)?;
    store.init()?;

    println!("{} Wrote starter profile document", "✓".green());
    println!("  Path:     {}", store.path().display().to_string().bright_cyan());
    println!("  Profiles: {}", store.selectors()?.join(", ").bright_yellow());

    Ok(())
}

fn cmd_profile_show(path: Option<PathBuf>) -> Result<()> {
    let store = config::ProfileStore::open(path)?;
    let document = store.read()?;

    println!("{} {}", "Profile document".bold(), store.path().display().to_string().dimmed());
    println!();
    println!("{document}");

    Ok(())
}

fn cmd_profile_list(path: Option<PathBuf>) -> Result<()> {
    let store = config::ProfileStore::open(path)?;
    let selectors = store.selectors()?;

    if selectors.is_empty() {
        println!("{}", "No profiles defined.".dimmed());
        return Ok(());
    }

    println!("{} ({} total)", "Profiles".bold(), selectors.len());
    for name in selectors {
        println!("  {} {}", "•".bright_green(), name.bright_cyan());
    }

    Ok(())
}
