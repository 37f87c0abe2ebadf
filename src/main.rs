use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Semaphore;
use tracing_subscriber::EnvFilter;

use scholar::db::Database;
use scholar::gemini::GeminiClient;
use scholar::research::ResearchService;
use scholar::{run_server, AppConfig};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = AppConfig::from_env();
    if config.gemini_api_key.is_empty() {
        tracing::warn!("GEMINI_API_KEY is not set; research requests will fail");
    }

    let db = Database::new(&config).await?;
    let gemini = GeminiClient::new(
        config.gemini_base_url.clone(),
        config.gemini_api_key.clone(),
    );

    let generation_limit = Arc::new(Semaphore::new(config.max_concurrent_generations));
    let research = ResearchService::new(config.clone(), db.clone(), gemini, generation_limit);

    run_server(config, db, research).await
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
