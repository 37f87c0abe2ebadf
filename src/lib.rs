pub mod citations;
pub mod config;
pub mod db;
pub mod export;
pub mod gemini;
pub mod models;
pub mod research;
pub mod server;

pub use citations::{reconcile, reconcile_with_style, MarkerStyle, Reconciled};
pub use config::AppConfig;
pub use server::run_server;
