//! Membercoin node binary entry point.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;
mod node;

use config::NodeConfig;
use node::Node;

/// Membercoin full node.
#[derive(Parser, Debug)]
#[command(name = "member-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Data directory
    #[arg(short, long, default_value = ".membercoin")]
    data_dir: PathBuf,

    /// Network to run on
    #[arg(short, long, default_value = "mainnet")]
    network: String,

    /// Store block bodies in the block database instead of flat files
    #[arg(long)]
    use_block_db: bool,

    /// Maintain the transaction index
    #[arg(long)]
    txindex: bool,

    /// Blocks of body data to keep (-1 keeps all)
    #[arg(long, default_value = "-1")]
    blocks_to_keep: i64,

    /// Validation worker threads (0 = half the cores)
    #[arg(long, default_value = "0")]
    validation_threads: usize,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(Level::INFO);
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let network = match args.network.as_str() {
        "mainnet" => member_consensus::Network::Mainnet,
        "testnet" => member_consensus::Network::Testnet,
        "testnet4" => member_consensus::Network::Testnet4,
        "scalenet" => member_consensus::Network::Scalenet,
        "nol" => member_consensus::Network::Nol,
        "regtest" => member_consensus::Network::Regtest,
        other => anyhow::bail!("unknown network: {other}"),
    };

    let mut config = NodeConfig::new(network, args.data_dir);
    config.use_block_db = args.use_block_db;
    config.txindex = args.txindex;
    config.blocks_to_keep = args.blocks_to_keep;
    config.validation_threads = args.validation_threads;

    let node = Node::open(config)?;
    let tip = node.get_tip();
    info!(height = tip.height, tip = %tip.hash, "Ready");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");
    node.shutdown()?;
    Ok(())
}
