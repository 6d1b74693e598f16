//! Canopy CLI library

pub mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use canopy_common::telemetry::LogFormat;

/// Canopy - managed control plane instances on a hosting cluster
#[derive(Parser, Debug)]
#[command(name = "canopy")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Desired-state document
    #[arg(long, short = 'f', env = "CANOPY_FILE", global = true, default_value = "canopy.yaml")]
    pub file: PathBuf,

    /// Kubeconfig for the hosting cluster, overriding the document
    #[arg(long, env = "CANOPY_KUBECONFIG", global = true)]
    pub kubeconfig: Option<PathBuf>,

    /// Maximum number of tasks running at once
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// Log output: json or pretty
    #[arg(long, env = "CANOPY_LOG_FORMAT", global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Converge the instance and print its exports
    Reconcile(commands::reconcile::ReconcileArgs),
    /// Tear the instance down
    Delete,
}

impl Cli {
    /// Run the selected command
    pub async fn run(self) -> anyhow::Result<()> {
        commands::init_logging(self.log_format)?;
        let session = commands::Session::open(&self).await?;
        match self.command {
            Commands::Reconcile(args) => commands::reconcile::run(session, args).await,
            Commands::Delete => commands::delete::run(session).await,
        }
    }
}
