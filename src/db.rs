use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::citations::EvidenceChunk;
use crate::config::AppConfig;
use crate::models::{ChatMessage, ChatRole, DetailLevel, FeedData, ReportSummary, ResearchReport};

const DEFAULT_FEED_TOPICS: [&str; 2] = ["Artificial Intelligence", "Climate Change"];

#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(config: &AppConfig) -> Result<Self> {
        tokio::fs::create_dir_all(&config.data_dir).await?;
        Self::connect(&config.sqlite_dsn(), 10).await
    }

    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open sqlite database {dsn}"))?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS reports (
                id TEXT PRIMARY KEY,
                topic TEXT NOT NULL,
                detail_level TEXT NOT NULL,
                content TEXT NOT NULL,
                sources TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chat_messages (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                report_id TEXT NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                sources TEXT NOT NULL,
                created_at TEXT NOT NULL,
                FOREIGN KEY (report_id) REFERENCES reports(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS feed_topics (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                topic TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS feed_snapshots (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                content TEXT NOT NULL,
                sources TEXT NOT NULL,
                last_updated TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS app_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.seed_feed_topics().await?;
        Ok(())
    }

    async fn seed_feed_topics(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let seeded = sqlx::query(
            "INSERT OR IGNORE INTO app_meta (key, value) VALUES ('feed_topics_seeded', ?)",
        )
        .bind(Utc::now().to_rfc3339())
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if seeded > 0 {
            for topic in DEFAULT_FEED_TOPICS {
                sqlx::query("INSERT OR IGNORE INTO feed_topics (topic) VALUES (?)")
                    .bind(topic)
                    .execute(&mut *tx)
                    .await?;
            }
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_report(&self, report: &ResearchReport) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reports (id, topic, detail_level, content, sources, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&report.id)
        .bind(&report.topic)
        .bind(report.detail_level.as_str())
        .bind(&report.content)
        .bind(sources_to_json(&report.sources)?)
        .bind(report.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get_report(&self, report_id: &str) -> Result<Option<ResearchReport>> {
        let row = sqlx::query(
            r#"
            SELECT id, topic, detail_level, content, sources, created_at
            FROM reports
            WHERE id = ?
            "#,
        )
        .bind(report_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_report))
    }

    pub async fn list_reports(&self, limit: i64) -> Result<Vec<ReportSummary>> {
        let rows = sqlx::query(
            r#"
            SELECT id, topic, detail_level, content, sources, created_at
            FROM reports
            ORDER BY created_at DESC, rowid DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(row_to_report)
            .map(|report| ReportSummary {
                id: report.id,
                topic: report.topic,
                source_count: report.sources.len(),
                created_at: report.created_at,
            })
            .collect())
    }

    pub async fn save_chat_message(
        &self,
        report_id: &str,
        role: ChatRole,
        content: &str,
        sources: &[EvidenceChunk],
    ) -> Result<ChatMessage> {
        let message = ChatMessage {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.to_string(),
            sources: sources.to_vec(),
            created_at: Utc::now(),
        };

        sqlx::query(
            r#"
            INSERT INTO chat_messages (id, report_id, role, content, sources, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&message.id)
        .bind(report_id)
        .bind(role.as_str())
        .bind(&message.content)
        .bind(sources_to_json(&message.sources)?)
        .bind(message.created_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    pub async fn chat_messages(&self, report_id: &str) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, sources, created_at
            FROM chat_messages
            WHERE report_id = ?
            ORDER BY seq ASC
            "#,
        )
        .bind(report_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(row_to_message).collect())
    }

    pub async fn latest_chat_messages(
        &self,
        report_id: &str,
        limit: i64,
    ) -> Result<Vec<ChatMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT id, role, content, sources, created_at
            FROM chat_messages
            WHERE report_id = ?
            ORDER BY seq DESC
            LIMIT ?
            "#,
        )
        .bind(report_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<ChatMessage> = rows.into_iter().map(row_to_message).collect();
        out.reverse();
        Ok(out)
    }

    pub async fn feed_topics(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT topic FROM feed_topics ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("topic"))
            .collect())
    }

    /// Returns false when the topic was already followed.
    pub async fn add_feed_topic(&self, topic: &str) -> Result<bool> {
        let inserted = sqlx::query("INSERT OR IGNORE INTO feed_topics (topic) VALUES (?)")
            .bind(topic)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(inserted > 0)
    }

    pub async fn remove_feed_topic(&self, topic: &str) -> Result<bool> {
        let removed = sqlx::query("DELETE FROM feed_topics WHERE topic = ?")
            .bind(topic)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed > 0)
    }

    pub async fn save_feed(&self, feed: &FeedData) -> Result<()> {
        sqlx::query(
            "INSERT INTO feed_snapshots (content, sources, last_updated) VALUES (?, ?, ?)",
        )
        .bind(&feed.content)
        .bind(sources_to_json(&feed.sources)?)
        .bind(feed.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn latest_feed(&self) -> Result<Option<FeedData>> {
        let row = sqlx::query(
            r#"
            SELECT content, sources, last_updated
            FROM feed_snapshots
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| FeedData {
            content: r.get("content"),
            sources: sources_from_json(&r.get::<String, _>("sources")),
            last_updated: parse_timestamp(&r.get::<String, _>("last_updated")),
        }))
    }
}

fn sources_to_json(sources: &[EvidenceChunk]) -> Result<String> {
    serde_json::to_string(sources).context("failed to encode sources")
}

fn sources_from_json(raw: &str) -> Vec<EvidenceChunk> {
    serde_json::from_str(raw).unwrap_or_else(|err| {
        tracing::warn!("discarding unreadable stored sources: {err}");
        vec![]
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn row_to_report(row: SqliteRow) -> ResearchReport {
    ResearchReport {
        id: row.get("id"),
        topic: row.get("topic"),
        detail_level: DetailLevel::from_db(&row.get::<String, _>("detail_level")),
        content: row.get("content"),
        sources: sources_from_json(&row.get::<String, _>("sources")),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

fn row_to_message(row: SqliteRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        role: ChatRole::from_db(&row.get::<String, _>("role")),
        content: row.get("content"),
        sources: sources_from_json(&row.get::<String, _>("sources")),
        created_at: parse_timestamp(&row.get::<String, _>("created_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    async fn memory_db() -> Database {
        Database::connect("sqlite::memory:", 1)
            .await
            .expect("in-memory database")
    }

    fn report(topic: &str, created_at: DateTime<Utc>) -> ResearchReport {
        ResearchReport {
            id: Uuid::new_v4().to_string(),
            topic: topic.to_string(),
            detail_level: DetailLevel::Concise,
            content: format!("# {topic}"),
            sources: vec![EvidenceChunk::web("https://a.org", "A")],
            created_at,
        }
    }

    #[tokio::test]
    async fn report_round_trips_with_sources() {
        let db = memory_db().await;
        let stored = report("CRISPR", Utc::now());
        db.insert_report(&stored).await.expect("insert");

        let loaded = db.get_report(&stored.id).await.expect("get").expect("present");
        assert_eq!(loaded.topic, "CRISPR");
        assert_eq!(loaded.detail_level, DetailLevel::Concise);
        assert_eq!(loaded.sources, stored.sources);
        assert!(db.get_report("missing").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn history_lists_newest_first() {
        let db = memory_db().await;
        let now = Utc::now();
        db.insert_report(&report("older", now - Duration::minutes(5)))
            .await
            .expect("insert");
        db.insert_report(&report("newer", now)).await.expect("insert");

        let history = db.list_reports(10).await.expect("list");
        let topics: Vec<&str> = history.iter().map(|r| r.topic.as_str()).collect();
        assert_eq!(topics, vec!["newer", "older"]);
        assert_eq!(history[0].source_count, 1);
    }

    #[tokio::test]
    async fn latest_chat_messages_keeps_chronological_order() {
        let db = memory_db().await;
        let stored = report("fusion", Utc::now());
        db.insert_report(&stored).await.expect("insert");

        for idx in 0..5 {
            let role = if idx % 2 == 0 {
                ChatRole::User
            } else {
                ChatRole::Model
            };
            db.save_chat_message(&stored.id, role, &format!("m{idx}"), &[])
                .await
                .expect("save");
        }

        let latest = db.latest_chat_messages(&stored.id, 3).await.expect("latest");
        let contents: Vec<&str> = latest.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m2", "m3", "m4"]);
        assert_eq!(db.chat_messages(&stored.id).await.expect("all").len(), 5);
    }

    #[tokio::test]
    async fn feed_topics_are_seeded_once_and_unique() {
        let db = memory_db().await;
        assert_eq!(
            db.feed_topics().await.expect("topics"),
            vec!["Artificial Intelligence", "Climate Change"]
        );

        assert!(db.remove_feed_topic("Climate Change").await.expect("remove"));
        assert!(db.add_feed_topic("Materials").await.expect("add"));
        assert!(!db.add_feed_topic("Materials").await.expect("add again"));

        db.seed_feed_topics().await.expect("reseed");
        assert_eq!(
            db.feed_topics().await.expect("topics"),
            vec!["Artificial Intelligence", "Materials"]
        );
    }

    #[tokio::test]
    async fn latest_feed_returns_most_recent_snapshot() {
        let db = memory_db().await;
        assert!(db.latest_feed().await.expect("feed").is_none());

        for content in ["first", "second"] {
            db.save_feed(&FeedData {
                content: content.to_string(),
                sources: vec![],
                last_updated: Utc::now(),
            })
            .await
            .expect("save");
        }

        let feed = db.latest_feed().await.expect("feed").expect("present");
        assert_eq!(feed.content, "second");
    }
}
