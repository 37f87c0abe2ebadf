use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use scholar::config::AppConfig;
use scholar::db::Database;
use scholar::export::{reference_list, to_bibtex, to_ris};
use scholar::gemini::GeminiClient;
use scholar::models::DetailLevel;
use scholar::research::ResearchService;

#[derive(Parser, Debug)]
#[command(name = "research")]
#[command(about = "Generate a grounded research report and export its citations")]
struct Cli {
    #[arg(long)]
    topic: String,
    #[arg(long, default_value_t = DetailLevel::Detailed)]
    detail: DetailLevel,
    #[arg(long)]
    markdown: Option<String>,
    #[arg(long)]
    bibtex: Option<String>,
    #[arg(long)]
    ris: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config = AppConfig::from_env();
    let db = Database::new(&config).await?;
    let gemini = GeminiClient::new(
        config.gemini_base_url.clone(),
        config.gemini_api_key.clone(),
    );
    let research = ResearchService::new(config, db, gemini, Arc::new(Semaphore::new(1)));

    let report = research.generate_research(&cli.topic, cli.detail).await?;

    println!("{}", report.content);
    if !report.sources.is_empty() {
        println!("\nReferences\n{}", reference_list(&report.sources));
    }

    let now = Utc::now();
    if let Some(path) = &cli.markdown {
        tokio::fs::write(path, &report.content)
            .await
            .with_context(|| format!("failed writing {}", path))?;
    }
    if let Some(path) = &cli.bibtex {
        tokio::fs::write(path, to_bibtex(&report.sources, now))
            .await
            .with_context(|| format!("failed writing {}", path))?;
    }
    if let Some(path) = &cli.ris {
        tokio::fs::write(path, to_ris(&report.sources))
            .await
            .with_context(|| format!("failed writing {}", path))?;
    }

    tracing::info!(report_id = %report.id, "report saved to history");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
