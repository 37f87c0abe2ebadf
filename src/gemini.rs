use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::citations::{EvidenceChunk, SupportSpan};
use crate::models::ChatRole;

#[derive(Debug, Clone)]
pub struct Turn {
    pub role: ChatRole,
    pub text: String,
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            text: text.into(),
        }
    }
}

/// Raw model answer plus the grounding metadata needed for citation reconciliation.
#[derive(Debug, Clone, Default)]
pub struct GroundedAnswer {
    pub text: String,
    pub chunks: Vec<EvidenceChunk>,
    pub supports: Vec<SupportSpan>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateReq<'a> {
    system_instruction: Content<'a>,
    contents: Vec<Content<'a>>,
    tools: Vec<Tool>,
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    role: Option<&'a str>,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: EmptyObject,
}

#[derive(Serialize)]
struct EmptyObject {}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResp {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
    #[serde(default)]
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Default, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<EvidenceChunk>,
    #[serde(default)]
    grounding_supports: Vec<SupportSpan>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    #[serde(default)]
    block_reason: Option<String>,
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    base_url: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        }
    }

    pub async fn generate_grounded(
        &self,
        model: &str,
        system_instruction: &str,
        contents: &[Turn],
        temperature: f32,
    ) -> Result<GroundedAnswer> {
        if self.api_key.trim().is_empty() {
            anyhow::bail!("GEMINI_API_KEY is not set");
        }

        let request = build_request(system_instruction, contents, temperature);

        let url = format!("{}/v1beta/models/{model}:generateContent", self.base_url);
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .json(&request)
            .send()
            .await
            .context("failed to call generateContent endpoint")?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!(
                "generateContent returned {status}: {}",
                normalize_err_body(&body)
            );
        }

        let response = response
            .json::<GenerateResp>()
            .await
            .context("failed to decode generateContent response")?;

        grounded_answer_from_response(response)
    }
}

fn build_request<'a>(
    system_instruction: &'a str,
    contents: &'a [Turn],
    temperature: f32,
) -> GenerateReq<'a> {
    GenerateReq {
        system_instruction: Content {
            role: None,
            parts: vec![Part {
                text: system_instruction,
            }],
        },
        contents: contents
            .iter()
            .map(|turn| Content {
                role: Some(turn.role.as_str()),
                parts: vec![Part { text: &turn.text }],
            })
            .collect(),
        tools: vec![Tool {
            google_search: EmptyObject {},
        }],
        generation_config: GenerationConfig { temperature },
    }
}

fn grounded_answer_from_response(response: GenerateResp) -> Result<GroundedAnswer> {
    let Some(candidate) = response.candidates.into_iter().next() else {
        let reason = response
            .prompt_feedback
            .and_then(|feedback| feedback.block_reason)
            .unwrap_or_else(|| "no candidates returned".to_string());
        anyhow::bail!("generateContent produced no answer: {reason}");
    };

    let text = candidate
        .content
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter(|part| !part.thought)
                .filter_map(|part| part.text)
                .collect::<String>()
        })
        .unwrap_or_default();

    let metadata = candidate.grounding_metadata.unwrap_or_default();

    Ok(GroundedAnswer {
        text,
        chunks: metadata.grounding_chunks,
        supports: metadata.grounding_supports,
    })
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        let error = json.get("error");
        if let Some(message) = error
            .and_then(|e| e.get("message"))
            .and_then(|v| v.as_str())
        {
            return message.to_string();
        }
        if let Some(err) = error.and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}
