//! bpmn-exec CLI
//!
//! Runs a process definition from a JSON file and prints the resulting
//! execution context.
//!
//! Usage:
//!   cargo run --features cli --bin bpmn-exec -- \
//!     order.json \
//!     --business-key order-42 \
//!     --var amount=250 \
//!     --var customer=acme \
//!     --complete approve \
//!     --complete ship

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;

use bpmn_exec::config::EngineConfig;
use bpmn_exec::gateway::{validate_definition, Severity};
use bpmn_exec::telemetry::init_tracing;
use bpmn_exec::{ProcessDefinition, ProcessExecutor, Variables};

/// Run a BPMN process definition
#[derive(Parser, Debug)]
#[command(name = "bpmn-exec")]
#[command(about = "Start a process instance from a JSON definition and drive its user tasks")]
struct Args {
    /// Process definition (camelCase JSON)
    definition: PathBuf,

    /// Business key of the new instance
    #[arg(long, short = 'k', default_value = "cli")]
    business_key: String,

    /// Initial variables in format key=value; values are parsed as JSON when possible
    #[arg(long = "var", short = 'v', value_parser = parse_key_val)]
    vars: Vec<(String, Value)>,

    /// User tasks (or event-gateway candidates) to complete, in order
    #[arg(long, short = 'c')]
    complete: Vec<String>,

    /// Engine config YAML; defaults to the file named by BPMN_EXEC_CONFIG
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print only the warnings/errors of the definition and exit
    #[arg(long)]
    validate: bool,
}

/// Parse key=value pairs from command line
fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s
        .find('=')
        .ok_or_else(|| format!("Invalid key=value pair: {}", s))?;
    let raw = &s[pos + 1..];
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Ok((s[..pos].to_string(), value))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::from_env()?,
    };

    let raw = std::fs::read_to_string(&args.definition)
        .with_context(|| format!("Failed to read {}", args.definition.display()))?;
    let definition: ProcessDefinition = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", args.definition.display()))?;

    let issues = validate_definition(&definition);
    for issue in &issues {
        match issue.severity {
            Severity::Error => tracing::error!("{issue}"),
            Severity::Warning => tracing::warn!("{issue}"),
        }
    }
    if args.validate {
        if issues.iter().any(|i| i.severity == Severity::Error) {
            anyhow::bail!("definition {} is invalid", definition.id);
        }
        println!("{} is valid ({} warnings)", definition.id, issues.len());
        return Ok(());
    }

    let executor = ProcessExecutor::with_config(config);
    let variables: Variables = args.vars.into_iter().collect();

    let mut ctx = executor
        .start(Arc::new(definition), &args.business_key, Some(variables))
        .await?;

    for task in &args.complete {
        ctx = executor
            .continue_instance(&ctx.process_instance_id, Some(task), None)
            .await
            .with_context(|| format!("Failed to complete {task}"))?;
    }

    println!("{}", serde_json::to_string_pretty(&ctx)?);
    Ok(())
}
