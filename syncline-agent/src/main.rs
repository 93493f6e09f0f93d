//! Syncline folder daemon binary.

use std::path::PathBuf;

use clap::Parser;
use syncline_agent::{AgentConfig, FolderAgent};

#[derive(Parser)]
#[command(name = "client-folder", about = "Syncline folder sync daemon", version)]
struct Args {
    /// Vault directory to watch and sync
    #[arg(long)]
    dir: PathBuf,

    /// Relay endpoint
    #[arg(long, default_value = "ws://127.0.0.1:3030/sync")]
    url: String,

    /// Identity announced to the relay and recorded in binary entries
    #[arg(long, default_value = "Anonymous")]
    name: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let agent = FolderAgent::new(AgentConfig::new(args.dir, args.url, args.name))?;
    agent.run().await?;
    Ok(())
}
