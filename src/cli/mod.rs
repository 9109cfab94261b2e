pub mod audit;
pub mod config;
pub mod evaluate;
pub mod paths;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "safety-guardian")]
#[command(
    author,
    version,
    about = "Judge proposed file moves, renames, deletes and copies before they run"
)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to config file
    #[arg(short, long, global = true, env = "SAFETY_GUARDIAN_CONFIG")]
    pub config: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Evaluate a single proposed operation
    Evaluate(evaluate::EvaluateArgs),

    /// Inspect the guardian audit log
    Audit(audit::AuditArgs),

    /// Configuration management
    Config(config::ConfigArgs),

    /// Show resolved XDG directory paths
    Paths,
}
