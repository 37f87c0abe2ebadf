use std::fs;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;
use tracing_subscriber::EnvFilter;

use scholar::citations::{reconcile_with_style, EvidenceChunk, MarkerStyle, SupportSpan};
use scholar::export::reference_list;

#[derive(Parser, Debug)]
#[command(name = "reconcile")]
#[command(about = "Insert citation markers into a saved model answer")]
struct Cli {
    #[arg(long)]
    file: String,
    #[arg(long, default_value_t = MarkerStyle::Plain)]
    style: MarkerStyle,
    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingDump {
    text: String,
    #[serde(default)]
    grounding_chunks: Vec<EvidenceChunk>,
    #[serde(default)]
    grounding_supports: Vec<SupportSpan>,
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let raw = fs::read_to_string(&cli.file).with_context(|| format!("failed opening {}", cli.file))?;
    let dump: GroundingDump = serde_json::from_str(&raw)
        .with_context(|| format!("invalid grounding JSON in {}", cli.file))?;

    let reconciled = reconcile_with_style(
        &dump.text,
        &dump.grounding_chunks,
        &dump.grounding_supports,
        cli.style,
    );

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reconciled)?);
        return Ok(());
    }

    println!("{}", reconciled.text);
    if !reconciled.sources.is_empty() {
        println!("\n{}", reference_list(&reconciled.sources));
    }
    Ok(())
}
