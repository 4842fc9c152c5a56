use std::{path::PathBuf, sync::Arc};

use clap::{Parser, Subcommand};
use colloquy::{
    eval::{evaluate_directory, Extractor},
    providers::scripted::ScriptedProvider,
    transcript::export_transcripts,
    BatchRunner, Config, ConfigError, ModelRegistry,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Run scripted multi-agent conversations and grade the transcripts")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every task variant through the direction graph
    Generate {
        /// Path to the YAML configuration
        #[arg(long)]
        config: PathBuf,

        /// Replace every model with a canned reply
        #[arg(long)]
        dry_run: bool,

        /// Verbose logging
        #[arg(long)]
        debug: bool,
    },
    /// Rebuild transcript files from checkpoint logs
    ExportJson {
        #[arg(long, default_value = "inputs")]
        input_dir: PathBuf,

        #[arg(long)]
        debug: bool,
    },
    /// Grade transcripts with the configured evaluation model
    Eval {
        #[arg(long)]
        config: PathBuf,

        /// Directory holding the transcripts (defaults to globals.memory.path)
        #[arg(long)]
        input_dir: Option<PathBuf>,

        #[arg(long)]
        debug: bool,
    },
}

impl Command {
    fn debug(&self) -> bool {
        match self {
            Command::Generate { debug, .. }
            | Command::ExportJson { debug, .. }
            | Command::Eval { debug, .. } => *debug,
        }
    }
}

fn init_tracing(debug: bool) {
    let default = if debug { "info,colloquy=debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.command.debug());
    if let Err(error) = dotenvy::dotenv() {
        if !error.not_found() {
            warn!(error = %error, "failed to read .env");
        }
    }

    match cli.command {
        Command::Generate {
            config, dry_run, ..
        } => {
            let config = Config::from_file(&config)?;
            let models = if dry_run {
                info!("dry run: models replaced by a scripted provider");
                let provider = Arc::new(ScriptedProvider::new().with_fallback("(dry run)"));
                ModelRegistry::with_shared_provider(&config, provider)
            } else {
                ModelRegistry::from_config(&config)?
            };

            let summary = BatchRunner::new(&config, models).run().await?;
            for outcome in &summary.outcomes {
                println!("{:>4}  {}  {}", outcome.index, outcome.thread_id, outcome.status);
            }
            println!(
                "Total: {}, Completed: {}, Failed: {}",
                summary.outcomes.len(),
                summary.completed(),
                summary.failed()
            );
            if summary.failed() > 0 {
                std::process::exit(1);
            }
        }
        Command::ExportJson { input_dir, .. } => {
            if !input_dir.is_dir() {
                return Err(format!("{} is not a directory", input_dir.display()).into());
            }
            let written = export_transcripts(&input_dir).await?;
            println!("Exported {} transcripts to {}", written.len(), input_dir.display());
        }
        Command::Eval {
            config, input_dir, ..
        } => {
            let config = Config::from_file(&config)?;
            let evaluation = config.evaluation()?.clone();
            let models = ModelRegistry::for_models(&config, [evaluation.model.as_str()])?;
            let handle = models
                .get(&evaluation.model)
                .cloned()
                .ok_or_else(|| ConfigError::UnknownModel {
                    agent: "evaluation".to_string(),
                    model: evaluation.model.clone(),
                })?;

            let dir = input_dir.unwrap_or_else(|| config.globals.memory.path.clone());
            let extractor = Extractor::new(evaluation, handle)?;
            let report = evaluate_directory(&extractor, &dir, config.globals.concurrency).await?;

            println!(
                "Graded: {}, Failed: {}, Report: {}",
                report.matrix.rows.len() - report.failures.len(),
                report.failures.len(),
                report.csv_path.display()
            );
            for stem in &report.failures {
                println!("  - {stem}");
            }
        }
    }

    Ok(())
}
