use anyhow::Result;
use clap::{Args, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::{Config, DEFAULT_CONFIG_TEMPLATE};

#[derive(Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommands,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show {
        /// Output format: toml (default) or json
        #[arg(short, long, default_value = "toml")]
        format: String,
    },

    /// Get a configuration value
    Get {
        /// Config key (e.g., guardian.min_confidence_threshold)
        key: String,
    },

    /// Set a configuration value
    Set {
        /// Config key (e.g., guardian.min_confidence_threshold)
        key: String,

        /// Value to set
        value: String,
    },

    /// Show config file path
    Path,

    /// Initialize default config file
    Init {
        /// Overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

pub async fn run(args: ConfigArgs, config_path: Option<&str>) -> Result<()> {
    let explicit = config_path.map(Path::new);
    match args.command {
        ConfigCommands::Show { format } => show_config(explicit, &format),
        ConfigCommands::Get { key } => get_config(explicit, &key),
        ConfigCommands::Set { key, value } => set_config(explicit, &key, &value),
        ConfigCommands::Path => show_path(explicit),
        ConfigCommands::Init { force } => init_config(explicit, force),
    }
}

fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf> {
    match explicit {
        Some(path) => Ok(path.to_path_buf()),
        None => Config::config_path(),
    }
}

fn show_config(explicit: Option<&Path>, format: &str) -> Result<()> {
    let config = Config::load_from(explicit)?;

    match format {
        "json" => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{}", json);
        }
        _ => {
            let toml = toml::to_string_pretty(&config)?;
            println!("{}", toml);
        }
    }

    Ok(())
}

fn get_config(explicit: Option<&Path>, key: &str) -> Result<()> {
    let config = Config::load_from(explicit)?;
    let value = config.get_value(key)?;
    println!("{}", value);
    Ok(())
}

fn set_config(explicit: Option<&Path>, key: &str, value: &str) -> Result<()> {
    let mut config = Config::load_from(explicit)?;
    config.set_value(key, value)?;
    config.save_to(&resolve_path(explicit)?)?;
    println!("Set {} = {}", key, value);
    Ok(())
}

fn show_path(explicit: Option<&Path>) -> Result<()> {
    let path = resolve_path(explicit)?;
    println!("{}", path.display());
    Ok(())
}

fn init_config(explicit: Option<&Path>, force: bool) -> Result<()> {
    let path = resolve_path(explicit)?;

    if path.exists() && !force {
        anyhow::bail!(
            "Config file already exists at {}. Use --force to overwrite.",
            path.display()
        );
    }

    // Create parent directories
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Write template config with comments
    std::fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;

    println!("Created config file at {}", path.display());
    Ok(())
}
