use std::net::SocketAddr;

use anyhow::Result;
use askama::Template;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::Utc;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::db::Database;
use crate::export::{export_report, ExportFormat};
use crate::models::{
    ChatMessage, ChatRequest, FeedData, ReportSummary, ResearchReport, ResearchRequest,
    TopicRequest, TopicsResponse,
};
use crate::research::{RequestError, ResearchService};

const HISTORY_LIMIT: i64 = 100;

#[derive(Clone)]
struct AppState {
    db: Database,
    research: ResearchService,
}

pub async fn run_server(config: AppConfig, db: Database, research: ResearchService) -> Result<()> {
    let state = AppState { db, research };

    let app = Router::new()
        .route("/", get(index_page))
        .route("/api/research", post(start_research))
        .route("/api/reports", get(list_reports))
        .route("/api/reports/:report_id", get(get_report))
        .route(
            "/api/reports/:report_id/chat",
            get(get_chat).post(chat_handler),
        )
        .route(
            "/api/reports/:report_id/export/:format",
            get(export_handler),
        )
        .route("/api/feed", get(get_feed))
        .route("/api/feed/refresh", post(refresh_feed))
        .route("/api/feed/topics", get(list_topics).post(follow_topic))
        .route("/api/feed/topics/:topic", delete(unfollow_topic))
        .nest_service("/static", ServeDir::new("static"))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = config.bind_addr.parse()?;
    tracing::info!("listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn index_page(State(state): State<AppState>) -> Result<Html<String>, ApiError> {
    let reports = state.db.list_reports(HISTORY_LIMIT).await?;
    let topics = state.db.feed_topics().await?;

    let template = IndexTemplate { reports, topics };
    let body = template.render()?;

    Ok(Html(body))
}

async fn start_research(
    State(state): State<AppState>,
    Json(request): Json<ResearchRequest>,
) -> Result<Json<ResearchReport>, ApiError> {
    let report = state
        .research
        .generate_research(&request.topic, request.detail_level)
        .await?;
    Ok(Json(report))
}

async fn list_reports(
    State(state): State<AppState>,
) -> Result<Json<Vec<ReportSummary>>, ApiError> {
    Ok(Json(state.db.list_reports(HISTORY_LIMIT).await?))
}

async fn get_report(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
) -> Result<Json<ResearchReport>, ApiError> {
    match state.db.get_report(&report_id).await? {
        Some(report) => Ok(Json(report)),
        None => Err(ApiError::not_found(format!(
            "report not found: {}",
            report_id
        ))),
    }
}

async fn get_chat(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
) -> Result<Json<Vec<ChatMessage>>, ApiError> {
    Ok(Json(state.research.chat_transcript(&report_id).await?))
}

async fn chat_handler(
    State(state): State<AppState>,
    Path(report_id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatMessage>, ApiError> {
    let reply = state.research.chat(&report_id, &request.message).await?;
    Ok(Json(reply))
}

async fn export_handler(
    State(state): State<AppState>,
    Path((report_id, format)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let format: ExportFormat = format
        .parse()
        .map_err(|err: anyhow::Error| ApiError::bad_request(err.to_string()))?;
    let Some(report) = state.db.get_report(&report_id).await? else {
        return Err(ApiError::not_found(format!(
            "report not found: {}",
            report_id
        )));
    };

    let file = export_report(&report, format, Utc::now());
    let headers = [
        (header::CONTENT_TYPE, file.content_type.to_string()),
        (
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", file.filename.replace('"', "")),
        ),
    ];
    Ok((headers, file.body).into_response())
}

async fn get_feed(State(state): State<AppState>) -> Result<Json<Option<FeedData>>, ApiError> {
    Ok(Json(state.db.latest_feed().await?))
}

async fn refresh_feed(State(state): State<AppState>) -> Result<Json<FeedData>, ApiError> {
    Ok(Json(state.research.refresh_feed().await?))
}

async fn list_topics(State(state): State<AppState>) -> Result<Json<TopicsResponse>, ApiError> {
    let topics = state.db.feed_topics().await?;
    Ok(Json(TopicsResponse { topics }))
}

async fn follow_topic(
    State(state): State<AppState>,
    Json(request): Json<TopicRequest>,
) -> Result<Json<TopicsResponse>, ApiError> {
    let topics = state.research.follow_topic(&request.topic).await?;
    Ok(Json(TopicsResponse { topics }))
}

async fn unfollow_topic(
    State(state): State<AppState>,
    Path(topic): Path<String>,
) -> Result<Json<TopicsResponse>, ApiError> {
    let topics = state.research.unfollow_topic(&topic).await?;
    Ok(Json(TopicsResponse { topics }))
}

#[derive(Template)]
#[template(path = "index.html")]
struct IndexTemplate {
    reports: Vec<ReportSummary>,
    topics: Vec<String>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn not_found(message: String) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message,
        }
    }

    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(value: anyhow::Error) -> Self {
        let status = match value.downcast_ref::<RequestError>() {
            Some(RequestError::Invalid(_)) => StatusCode::BAD_REQUEST,
            Some(RequestError::NotFound(_)) => StatusCode::NOT_FOUND,
            Some(RequestError::Upstream(_)) => StatusCode::BAD_GATEWAY,
            None => {
                tracing::error!("request failed: {value:#}");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        Self {
            status,
            message: value.to_string(),
        }
    }
}

impl From<askama::Error> for ApiError {
    fn from(value: askama::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: value.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status_for(err: anyhow::Error) -> StatusCode {
        ApiError::from(err).status
    }

    #[test]
    fn request_errors_choose_status() {
        assert_eq!(
            status_for(RequestError::Invalid("empty topic".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(RequestError::NotFound("report not found: r".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(RequestError::Upstream("Failed to refresh feed.").into()),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            status_for(anyhow::anyhow!("disk full")),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn upstream_error_keeps_generic_message() {
        let err = ApiError::from(anyhow::Error::from(RequestError::Upstream(
            "Failed to generate chat response.",
        )));
        assert_eq!(err.message, "Failed to generate chat response.");
    }
}
