use anyhow::Result;
use clap::Parser;

use safety_guardian::cli::{self, Cli, Commands};
use safety_guardian::config::{Config, LoggingConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> Result<()> {
    init_logging(&cli);

    let config_path = cli.config.as_deref();
    match cli.command {
        Commands::Evaluate(args) => cli::evaluate::run(args, config_path).await,
        Commands::Audit(args) => cli::audit::run(args, config_path).await,
        Commands::Config(args) => cli::config::run(args, config_path).await,
        Commands::Paths => cli::paths::run(),
    }
}

fn init_logging(cli: &Cli) {
    // Logging settings are read before the main config load; fall back to
    // defaults if the file is missing or broken so the real error surfaces later.
    let logging = cli
        .config
        .as_deref()
        .map(std::path::PathBuf::from)
        .or_else(|| Config::config_path().ok())
        .and_then(|path| std::fs::read_to_string(path).ok())
        .and_then(|content| toml::from_str::<Config>(&content).ok())
        .map(|config| config.logging)
        .unwrap_or_else(LoggingConfig::default);

    let log_level = if cli.verbose {
        "debug"
    } else {
        logging.level.as_str()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // Logs go to stderr so `--json` output on stdout stays parseable.
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}
