//! CLI subcommand: `safety-guardian evaluate`
//!
//! Builds one operation from flags, runs it through the guardian and prints
//! the verdict. Exits with status 2 when the operation is not approved.

use anyhow::{Context, Result};
use clap::Args;
use std::path::PathBuf;

use crate::concurrency::DestinationLocks;
use crate::config::Config;
use crate::safety::{
    AuditLog, Classification, Guardian, Operation, OperationKind, Revalidator, create_reasoner,
};

#[derive(Args)]
pub struct EvaluateArgs {
    /// File or directory the operation acts on
    pub source: PathBuf,

    /// Where it would end up (omit for delete)
    pub destination: Option<PathBuf>,

    /// Operation kind: move, rename, delete or copy
    #[arg(short, long, default_value = "move")]
    pub kind: OperationKind,

    /// Category assigned by the classifier
    #[arg(long, default_value = "uncategorized")]
    pub category: String,

    /// Classifier confidence between 0 and 1
    #[arg(long, default_value_t = 1.0)]
    pub confidence: f64,

    /// The user has confirmed this operation
    #[arg(long)]
    pub approve: bool,

    /// An administrator-level override is present (implies --approve)
    #[arg(long)]
    pub elevated: bool,

    /// Mark the result as a dry run
    #[arg(long)]
    pub dry_run: bool,

    /// Re-check live state under the destination lock when approved
    #[arg(long)]
    pub revalidate: bool,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

pub async fn run(args: EvaluateArgs, config_path: Option<&str>) -> Result<()> {
    let mut config = Config::load_from(config_path.map(std::path::Path::new))?;
    if args.dry_run {
        config.guardian.dry_run = true;
    }

    let destination = match (args.kind, args.destination) {
        (_, Some(dest)) => dest,
        (OperationKind::Delete, None) => args.source.clone(),
        (kind, None) => anyhow::bail!("A destination is required for {}", kind),
    };

    let operation = Operation::new(
        &args.source,
        destination,
        args.kind,
        Classification::new(args.category, args.confidence),
    )
    .with_user_approval(args.approve)
    .with_elevated_approval(args.elevated);

    let reasoner = create_reasoner(&config.reasoning)?;
    let guardian =
        Guardian::new(reasoner).with_audit_log(AuditLog::open(config.paths.audit_log()));

    let result = guardian
        .evaluate(operation.clone(), &config.guardian)
        .await
        .context("Evaluation could not be completed")?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        println!("{}", operation);
        println!();
        println!("{}", result.summary());
        println!();
        println!("Recommended action: {}", result.recommended_action());
    }

    if !result.approved {
        std::process::exit(2);
    }

    if args.revalidate {
        let revalidator = Revalidator::new(DestinationLocks::new(&config.paths)?);
        let permit = revalidator
            .revalidate(&operation, &result, &config.guardian)
            .await?;
        if !args.json {
            println!("Revalidated; holding lock on {}", permit.directory().display());
        }
    }

    Ok(())
}
