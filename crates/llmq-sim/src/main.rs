//! Command-line driver for in-process LLMQ networks
//!
//! Runs a handful of nodes on a mock chain: quorums form through the DKG,
//! then every tip is chain-locked and submitted transactions get instant
//! locks.

use anyhow::{ensure, Context, Result};
use clap::{Parser, Subcommand};
use llmq::ChainView;
use llmq_core::{sha256d, LlmqConfig, OutPoint, Transaction};
use llmq_testkit::{test_config, Simulation};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "llmq-sim")]
#[command(about = "LLMQ - in-process quorum network simulator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Form quorums, then chain-lock blocks and instant-lock transactions
    Run {
        /// Number of masternodes
        #[arg(short = 'm', long, default_value = "3")]
        masternodes: usize,

        /// Number of regular nodes
        #[arg(short = 'o', long, default_value = "1")]
        observers: usize,

        /// Height to mine to
        #[arg(short = 'b', long, default_value = "60")]
        blocks: u32,

        /// Transactions submitted once a quorum is active
        #[arg(short = 't', long, default_value = "2")]
        transactions: usize,

        /// TOML configuration; defaults to the regression-test quorum
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Print the first masternode's DKG diagnostics as JSON
        #[arg(long)]
        diagnostics: bool,
    },

    /// Print the regression-test configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            masternodes,
            observers,
            blocks,
            transactions,
            config,
            diagnostics,
        } => {
            let config = load_config(config)?;
            run(config, masternodes, observers, blocks, transactions, diagnostics)
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&test_config())?);
            Ok(())
        }
    }
}

fn load_config(path: Option<PathBuf>) -> Result<LlmqConfig> {
    let Some(path) = path else {
        return Ok(test_config());
    };
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    LlmqConfig::from_toml_str(&text).with_context(|| format!("parsing {}", path.display()))
}

fn run(
    config: LlmqConfig,
    masternodes: usize,
    observers: usize,
    blocks: u32,
    transactions: usize,
    diagnostics: bool,
) -> Result<()> {
    ensure!(masternodes > 0, "at least one masternode is required");
    let llmq_type = config.instant_send_type;
    let sim = Simulation::builder(config)
        .masternodes(masternodes)
        .observers(observers)
        .build()?;
    sim.start()?;
    info!(masternodes, observers, "simulation started");

    let mut submitted = Vec::new();
    while sim.tip() < blocks {
        let block = sim.mine_block(Vec::new())?;
        let observer = sim.node(sim.nodes().len() - 1);
        let quorums = observer.ctx.registry().active_quorums(llmq_type).len();
        if quorums > 0 && submitted.len() < transactions {
            let tx = Transaction::new(
                sha256d(format!("sim-tx-{}", submitted.len()).as_bytes()),
                vec![OutPoint::new(block.hash, 0)],
            );
            for node in sim.nodes() {
                if let Err(e) = node.ctx.transaction_added(&tx) {
                    warn!(peer = %node.peer, error = %e, "transaction not accepted");
                }
            }
            submitted.push(tx.txid);
        }
    }
    sim.settle();

    for node in sim.nodes() {
        let best = node.ctx.chain_locks().best_chain_lock();
        let locked = submitted
            .iter()
            .filter(|txid| {
                let locks = node.ctx.instant_locks();
                locks.is_locked(txid) || locks.is_archived(txid)
            })
            .count();
        println!(
            "{} masternode={} quorums={} chain_lock={} instant_locks={}/{}",
            node.peer,
            node.ctx.is_masternode(),
            node.ctx.registry().active_quorums(llmq_type).len(),
            best.map_or_else(|| "none".to_string(), |b| b.height.to_string()),
            locked,
            submitted.len(),
        );
    }
    println!(
        "tip={} messages={} misbehavior_reports={}",
        sim.chain.tip_height(),
        sim.hub.delivered(),
        sim.hub.misbehavior().len()
    );

    if diagnostics && masternodes > 0 {
        let snapshot = sim.node(0).ctx.dkg().diagnostics().snapshot();
        println!("{}", snapshot.to_json()?);
    }

    sim.stop()?;
    Ok(())
}
