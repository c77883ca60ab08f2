//! Chat-completions client that expands a concept term into a definition
//! plus related terms, as strict JSON.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

use crate::concepts::ConceptExpansion;

/// Trait implemented by concrete expansion backends, so callers and tests
/// can swap the real chat service for a counting fake.
pub trait ConceptModel: Send + Sync {
    /// Produces one concept expansion for the given term.
    fn expand_concept(&self, term: &str) -> Result<ConceptExpansion>;
}

/// Blocking chat client that talks to OpenAI-compatible endpoints.
///
/// Upstream failures propagate directly; there is no retry here. The
/// timeout on the underlying client is the only deadline a request-path
/// call carries.
pub struct ExpansionClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    max_tokens: usize,
}

impl ExpansionClient {
    /// Builds a new expansion client.
    pub fn new(
        api_key: String,
        base_url: String,
        model: String,
        temperature: f32,
        max_tokens: usize,
        timeout: Duration,
    ) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing chat API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing chat model name");
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid chat API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("failed to build chat HTTP client")?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            model,
            temperature,
            max_tokens,
        })
    }

    /// Chat model identifier this client targets.
    pub fn model(&self) -> &str {
        &self.model
    }

    fn build_prompt(term: &str) -> String {
        let term_line = format!("Term: {term}");
        [
            "You are helping build a semantic search time-series over a corpus of historical letters.",
            "Given a user-provided concept term, produce a compact concept expansion that will be embedded.",
            "Return ONLY valid JSON with keys: term, definition, related_terms.",
            "",
            "Guidelines:",
            "- definition: 1-2 sentences, concrete, avoid academic tone.",
            "- related_terms: 8-16 single words or short phrases likely to appear in the letters (first-person, period-appropriate).",
            "- Keep the list unique and concise.",
            "",
            term_line.as_str(),
        ]
        .join("\n")
    }
}

impl ConceptModel for ExpansionClient {
    fn expand_concept(&self, term: &str) -> Result<ConceptExpansion> {
        let prompt = Self::build_prompt(term);
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            response_format: ResponseFormat { kind: "json_object" },
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You output strict JSON only.",
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .context("failed to call chat completions")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("chat completions returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp.json().context("failed to parse chat response")?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .unwrap_or_default();
        let raw: RawExpansion = serde_json::from_str(&content)
            .context("chat model returned malformed expansion JSON")?;

        let expansion = ConceptExpansion {
            term: if raw.term.trim().is_empty() {
                term.to_string()
            } else {
                raw.term
            },
            definition: raw.definition,
            related_terms: raw
                .related_terms
                .into_iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
        };
        if expansion.definition.trim().is_empty() {
            bail!("concept expansion missing definition");
        }
        Ok(expansion)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    response_format: ResponseFormat,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct RawExpansion {
    #[serde(default)]
    term: String,
    #[serde(default)]
    definition: String,
    #[serde(default)]
    related_terms: Vec<String>,
}
