//! Canopy CLI
//!
//! Reconciles or deletes one managed instance described by a YAML document.

use clap::Parser;

use canopy_cli::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.run().await
}
