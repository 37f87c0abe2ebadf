use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::citations::{reconcile_with_style, Reconciled};
use crate::config::AppConfig;
use crate::db::Database;
use crate::gemini::{GeminiClient, Turn};
use crate::models::{ChatMessage, ChatRole, DetailLevel, FeedData, ResearchReport};

pub const CHAT_INTRO_MESSAGE: &str =
    "Hi! I can answer questions about this research report. What would you like to know?";

const RESEARCH_FAILED: &str =
    "Failed to generate research report. Please check your API key and try again.";
const FEED_FAILED: &str = "Failed to refresh feed.";
const CHAT_FAILED: &str = "Failed to generate chat response.";

const RESEARCH_FALLBACK: &str = "No content generated.";
const FEED_FALLBACK: &str = "No updates found.";
const CHAT_FALLBACK: &str = "I couldn't generate a response.";

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("{0}")]
    Invalid(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Upstream(&'static str),
}

#[derive(Clone)]
pub struct ResearchService {
    config: AppConfig,
    db: Database,
    gemini: GeminiClient,
    generation_limit: Arc<Semaphore>,
}

impl ResearchService {
    pub fn new(
        config: AppConfig,
        db: Database,
        gemini: GeminiClient,
        generation_limit: Arc<Semaphore>,
    ) -> Self {
        Self {
            config,
            db,
            gemini,
            generation_limit,
        }
    }

    pub async fn generate_research(
        &self,
        topic: &str,
        detail_level: DetailLevel,
    ) -> Result<ResearchReport> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(RequestError::Invalid("research topic must not be empty".into()).into());
        }

        let system = research_instruction(detail_level);
        let reconciled = self
            .generate(
                &system,
                &[Turn::user(topic)],
                self.config.models.research_temperature,
                RESEARCH_FALLBACK,
                RESEARCH_FAILED,
            )
            .await?;

        let report = ResearchReport {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            detail_level,
            content: reconciled.text,
            sources: reconciled.sources,
            created_at: Utc::now(),
        };
        self.db.insert_report(&report).await?;

        tracing::info!(
            report_id = %report.id,
            sources = report.sources.len(),
            "research report stored"
        );
        Ok(report)
    }

    pub async fn chat(&self, report_id: &str, message: &str) -> Result<ChatMessage> {
        let message = message.trim();
        if message.is_empty() {
            return Err(RequestError::Invalid("chat message must not be empty".into()).into());
        }

        let report = self
            .db
            .get_report(report_id)
            .await?
            .ok_or_else(|| RequestError::NotFound(format!("report not found: {report_id}")))?;

        let history = self
            .db
            .latest_chat_messages(report_id, self.config.chat.history_turns as i64)
            .await?;
        let contents = chat_contents(&history, message);
        let system = chat_instruction(&report.content, self.config.chat.report_context_chars);

        let reconciled = self
            .generate(
                &system,
                &contents,
                self.config.models.chat_temperature,
                CHAT_FALLBACK,
                CHAT_FAILED,
            )
            .await?;

        self.db
            .save_chat_message(report_id, ChatRole::User, message, &[])
            .await?;
        self.db
            .save_chat_message(
                report_id,
                ChatRole::Model,
                &reconciled.text,
                &reconciled.sources,
            )
            .await
    }

    pub async fn chat_transcript(&self, report_id: &str) -> Result<Vec<ChatMessage>> {
        let report = self
            .db
            .get_report(report_id)
            .await?
            .ok_or_else(|| RequestError::NotFound(format!("report not found: {report_id}")))?;

        let messages = self.db.chat_messages(report_id).await?;
        if !messages.is_empty() {
            return Ok(messages);
        }

        Ok(vec![ChatMessage {
            id: "intro".to_string(),
            role: ChatRole::Model,
            content: CHAT_INTRO_MESSAGE.to_string(),
            sources: vec![],
            created_at: report.created_at,
        }])
    }

    pub async fn follow_topic(&self, topic: &str) -> Result<Vec<String>> {
        let topic = topic.trim();
        if topic.is_empty() {
            return Err(RequestError::Invalid("topic must not be empty".into()).into());
        }
        if !self.db.add_feed_topic(topic).await? {
            return Err(RequestError::Invalid(format!("already following {topic}")).into());
        }
        self.db.feed_topics().await
    }

    pub async fn unfollow_topic(&self, topic: &str) -> Result<Vec<String>> {
        if !self.db.remove_feed_topic(topic).await? {
            return Err(RequestError::NotFound(format!("not following {topic}")).into());
        }
        self.db.feed_topics().await
    }

    pub async fn refresh_feed(&self) -> Result<FeedData> {
        let topics = self.db.feed_topics().await?;
        if topics.is_empty() {
            return Err(RequestError::Invalid(
                "Please add at least one topic to generate a feed.".into(),
            )
            .into());
        }

        let topics_str = topics.join(", ");
        let reconciled = self
            .generate(
                &feed_instruction(&topics_str),
                &[Turn::user(format!(
                    "Fetch the latest research updates for: {topics_str}"
                ))],
                self.config.models.research_temperature,
                FEED_FALLBACK,
                FEED_FAILED,
            )
            .await?;

        let feed = FeedData {
            content: reconciled.text,
            sources: reconciled.sources,
            last_updated: Utc::now(),
        };
        self.db.save_feed(&feed).await?;
        Ok(feed)
    }

    async fn generate(
        &self,
        system_instruction: &str,
        contents: &[Turn],
        temperature: f32,
        fallback: &str,
        failure: &'static str,
    ) -> Result<Reconciled> {
        let started = Instant::now();
        let _permit = self.generation_limit.acquire().await?;

        let answer = match self
            .gemini
            .generate_grounded(
                &self.config.models.research_model,
                system_instruction,
                contents,
                temperature,
            )
            .await
        {
            Ok(answer) => answer,
            Err(err) => {
                tracing::error!("model call failed: {err:#}");
                return Err(RequestError::Upstream(failure).into());
            }
        };

        let text = if answer.text.trim().is_empty() {
            fallback.to_string()
        } else {
            answer.text
        };

        let reconciled = reconcile_with_style(
            &text,
            &answer.chunks,
            &answer.supports,
            self.config.marker_style,
        );
        tracing::debug!(
            latency_ms = started.elapsed().as_millis() as u64,
            chunks = answer.chunks.len(),
            supports = answer.supports.len(),
            sources = reconciled.sources.len(),
            "grounded generation finished"
        );
        Ok(reconciled)
    }
}

fn research_instruction(detail_level: DetailLevel) -> String {
    let detail = match detail_level {
        DetailLevel::Concise => {
            "Provide a HIGH-LEVEL SUMMARY. Focus on brevity, bullet points, and key takeaways. \
             Limit deep technical exposition."
        }
        DetailLevel::Detailed => {
            "Provide an IN-DEPTH COMPREHENSIVE ANALYSIS. Include extensive background, \
             methodology analysis, and thorough synthesis."
        }
    };

    format!(
        "You are ScholarAgent, an academic research assistant.\n\
         Research the provided topic using real-world data found via Google Search.\n\n\
         Structure the response as an academic report with these Markdown sections:\n\
         # Title of Research\n\
         ## Executive Summary\n\
         ## Key Developments & Findings\n\
         ## Methodologies & Approaches (if relevant)\n\
         ## Cross-Disciplinary Synthesis\n\
         ## Conclusion & Future Outlook\n\n\
         Detail level: {detail}\n\n\
         Tone: professional, objective, academic. Use bullet points and bold text for emphasis.\n\
         You MUST use the googleSearch tool to find recent papers, articles, and reputable academic sources."
    )
}

fn feed_instruction(topics: &str) -> String {
    format!(
        "You are an academic feed curator. The user follows these research topics: {topics}.\n\
         1. Use Google Search to find the latest (past 1-3 months) significant papers, articles, and breakthroughs for these topics.\n\
         2. Prioritize peer-reviewed journals, preprints (arXiv, bioRxiv), and reputable academic news.\n\
         3. Create a \"Research Digest\" organized by topic.\n\
         4. For each item, provide a bold title and a concise summary of the findings.\n\
         Format as Markdown. You MUST use the googleSearch tool."
    )
}

fn chat_instruction(report_content: &str, context_chars: usize) -> String {
    let context: String = report_content.chars().take(context_chars).collect();
    format!(
        "You are an academic assistant. The user is reading the research report below; \
         answer their questions based on it.\n\n\
         --- BEGIN REPORT CONTEXT ---\n{context}\n--- END REPORT CONTEXT ---\n\n\
         1. Answer primarily from the report context.\n\
         2. If the answer is not in the report, or facts need verifying, use the googleSearch tool to find authoritative academic sources.\n\
         3. Keep answers concise and conversational but professional.\n\
         4. External information you use is cited automatically."
    )
}

fn chat_contents(history: &[ChatMessage], message: &str) -> Vec<Turn> {
    history
        .iter()
        .map(|msg| Turn {
            role: msg.role,
            text: msg.content.clone(),
        })
        .chain(std::iter::once(Turn::user(message)))
        .collect()
}
