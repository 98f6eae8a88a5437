use bond_core::{is_node_able_to_mine, Block, Chain, InMemoryBlockStore, LoopbackGossip, MiningCoordinator};
use clap::{Parser, Subcommand};
use shared::{KeyPair, NodeConfig};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "bond-node")]
#[command(about = "Demo node for the proof-of-work consensus core")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Build a genesis chain, mine one block onto it, and print the result
    Demo,
    /// Mine a single block against a fresh genesis chain
    Mine {
        /// Hex-encoded 64-byte public key to receive the block reward
        #[arg(long)]
        reward_pubkey: Option<String>,
    },
    /// Print build version information
    Version,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Demo) {
        Command::Demo => run_demo(),
        Command::Mine { reward_pubkey } => run_mine(reward_pubkey),
        Command::Version => {
            print_version();
            Ok(())
        }
    }
}

fn run_demo() -> Result<(), Box<dyn std::error::Error>> {
    let config = NodeConfig::default();
    info!(network = %config.network, reward = config.reward, "starting demo chain");

    let keypair = KeyPair::generate()?;
    let genesis = Block::genesis(keypair.public_key.as_bytes(), 0);
    info!(block_id = %genesis.id(), "built genesis block");

    let chain = Arc::new(Chain::new(InMemoryBlockStore::new(), genesis));
    let coordinator =
        MiningCoordinator::new(Arc::clone(&chain), keypair.public_key.as_bytes().to_vec());

    let block = coordinator.mine_one()?;
    chain.check_new_block(&block)?;
    chain.add_block(block.clone())?;
    info!(block_id = %block.id(), height = chain.height(), "accepted mined block");

    let (_sender, gossip) = LoopbackGossip::new();
    info!(
        able_to_mine = is_node_able_to_mine(chain.height(), &gossip),
        "peer-height gate evaluated"
    );

    println!("chain height: {}", chain.height());
    println!("tip: {}", chain.tip());
    println!("utxo tx count: {}", chain.utxo_count_tx());
    Ok(())
}

fn run_mine(reward_pubkey: Option<String>) -> Result<(), Box<dyn std::error::Error>> {
    let keypair = KeyPair::generate()?;
    let reward_pubkey = match reward_pubkey {
        Some(hex_str) => hex::decode(hex_str)?,
        None => keypair.public_key.as_bytes().to_vec(),
    };

    let genesis = Block::genesis(&reward_pubkey, 0);
    let chain = Arc::new(Chain::new(InMemoryBlockStore::new(), genesis));
    let coordinator = MiningCoordinator::new(Arc::clone(&chain), reward_pubkey);

    let block = coordinator.mine_one()?;
    chain.check_new_block(&block)?;
    chain.add_block(block.clone())?;

    println!("mined block {}", block.id());
    println!("nonce: {}", block.header.nonce);
    Ok(())
}

fn print_version() {
    println!("bond-node {}", env!("CARGO_PKG_VERSION"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_runs_end_to_end() {
        assert!(run_demo().is_ok());
    }

    #[test]
    fn mine_with_a_default_keypair_succeeds() {
        assert!(run_mine(None).is_ok());
    }
}
