use std::env;
use std::path::PathBuf;

use crate::citations::MarkerStyle;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub research_model: String,
    pub research_temperature: f32,
    pub chat_temperature: f32,
}

#[derive(Clone, Debug)]
pub struct ChatConfig {
    pub report_context_chars: usize,
    pub history_turns: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub gemini_base_url: String,
    pub gemini_api_key: String,
    pub models: ModelConfig,
    pub chat: ChatConfig,
    pub max_concurrent_generations: usize,
    pub marker_style: MarkerStyle,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("SCHOLAR_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let marker_style = match env::var("CITATION_MARKER_STYLE") {
            Ok(raw) => raw.parse().unwrap_or_else(|err| {
                tracing::warn!("{err}; falling back to superscript markers");
                MarkerStyle::Superscript
            }),
            Err(_) => MarkerStyle::Superscript,
        };

        Self {
            bind_addr: env::var("SCHOLAR_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            gemini_base_url: env::var("GEMINI_BASE_URL")
                .unwrap_or_else(|_| "https://generativelanguage.googleapis.com".to_string()),
            gemini_api_key: env::var("GEMINI_API_KEY")
                .or_else(|_| env::var("API_KEY"))
                .unwrap_or_default(),
            models: ModelConfig {
                research_model: env::var("RESEARCH_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                research_temperature: parse_env("RESEARCH_TEMPERATURE", 0.3),
                chat_temperature: parse_env("CHAT_TEMPERATURE", 0.5),
            },
            chat: ChatConfig {
                report_context_chars: parse_env("REPORT_CONTEXT_CHARS", 20_000),
                history_turns: parse_env("CHAT_HISTORY_TURNS", 6),
            },
            max_concurrent_generations: parse_env::<usize>("MAX_CONCURRENT_GENERATIONS", 2).max(1),
            marker_style,
        }
    }

    pub fn sqlite_dsn(&self) -> String {
        format!("sqlite://{}", self.data_dir.join("scholar.sqlite3").display())
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
