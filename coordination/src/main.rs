//! Card evaluation CLI
//!
//! Registers the HTTP pipelines declared in a config file, evaluates one
//! payload and prints the outcome as JSON.
//!
//! # Usage
//!
//! ```bash
//! # Evaluate a payload (file path, or `-` for stdin)
//! cardeval evaluate --config cardeval.example.toml --payload card.json
//!
//! # Override the request ceiling
//! cardeval evaluate --config cardeval.toml --payload card.json --timeout-ms 5000
//!
//! # Print the content fingerprint only
//! cardeval fingerprint --payload card.json --pipeline grading
//!
//! # Verbose logging
//! RUST_LOG=cardeval_coordination=debug cardeval evaluate ...
//! ```

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use cardeval_coordination::{
    AnalysisRequest, ConfigFile, EnsembleOrchestrator, Fingerprint, FixedAccuracy, HttpPipeline,
    PipelineId, PipelineRegistration,
};

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Evaluate a payload with every configured pipeline
    Evaluate {
        /// Path to cardeval.toml
        #[arg(long)]
        config: PathBuf,

        /// JSON payload file, or `-` for stdin
        #[arg(long)]
        payload: PathBuf,

        /// Restrict to these pipeline ids (repeatable)
        #[arg(long = "pipeline")]
        pipelines: Vec<String>,

        /// Request ceiling in milliseconds (overrides the config file)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Also print the health snapshot after evaluating
        #[arg(long, default_value_t = false)]
        health: bool,
    },

    /// Print the content fingerprint of a payload
    Fingerprint {
        /// JSON payload file, or `-` for stdin
        #[arg(long)]
        payload: PathBuf,

        /// Pipeline ids included in the fingerprint (repeatable)
        #[arg(long = "pipeline")]
        pipelines: Vec<String>,
    },
}

fn read_payload(path: &Path) -> Result<serde_json::Value> {
    let text = if path == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read payload {}", path.display()))?
    };
    serde_json::from_str(&text).context("Payload is not valid JSON")
}

async fn evaluate(
    config_path: &Path,
    payload_path: &Path,
    pipelines: Vec<String>,
    timeout_ms: Option<u64>,
    health: bool,
) -> Result<()> {
    let file = ConfigFile::load(config_path)
        .with_context(|| format!("Failed to load {}", config_path.display()))?;
    if file.pipelines.is_empty() {
        bail!("No pipelines declared in {}", config_path.display());
    }

    let mut builder = EnsembleOrchestrator::builder(file.orchestrator.clone());
    for declared in &file.pipelines {
        let timeout = Duration::from_millis(declared.timeout_ms);
        let pipeline = HttpPipeline::new(declared.endpoint.clone(), timeout)
            .with_context(|| format!("Failed to set up pipeline {}", declared.id))?;

        let mut registration =
            PipelineRegistration::new(declared.id.as_str(), declared.kind, timeout);
        if let Some(factor) = declared.accuracy_factor {
            registration = registration.with_accuracy(Arc::new(FixedAccuracy(factor)));
        }

        info!(pipeline = %declared.id, kind = %declared.kind, endpoint = %declared.endpoint, "Registered pipeline");
        builder = builder.register_pipeline(registration, Arc::new(pipeline));
    }
    let orchestrator = builder.build()?;

    let payload = read_payload(payload_path)?;
    let requested: Vec<PipelineId> = pipelines.into_iter().map(PipelineId::from).collect();
    let request = AnalysisRequest::for_pipelines(payload, requested);

    let ceiling = timeout_ms
        .map(Duration::from_millis)
        .unwrap_or_else(|| orchestrator.config().request_timeout());
    let outcome = orchestrator.submit_with_timeout(request, ceiling).await;

    println!("{}", serde_json::to_string_pretty(&outcome)?);
    if health {
        let snapshot = orchestrator.health_snapshot().await;
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cardeval_coordination=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Evaluate {
            config,
            payload,
            pipelines,
            timeout_ms,
            health,
        } => evaluate(&config, &payload, pipelines, timeout_ms, health).await,
        Command::Fingerprint { payload, pipelines } => {
            let payload = read_payload(&payload)?;
            let requested: Vec<PipelineId> = pipelines.into_iter().map(PipelineId::from).collect();
            println!("{}", Fingerprint::from_payload(&payload, &requested));
            Ok(())
        }
    }
}
