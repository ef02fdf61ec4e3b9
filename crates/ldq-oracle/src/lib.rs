//! Classification oracle capability: task model, error taxonomy, and the
//! OpenAI-compatible chat adapter.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use ldq_core::LeadId;
use serde::Deserialize;
use serde_json::json;
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "ldq-oracle";

/// How a classification call can fail. Domain ambiguity is never an error:
/// an off-list category resolves to the fallback label and sub-floor scores
/// simply appear in the response.
#[derive(Debug, Clone, Error)]
pub enum OracleError {
    #[error("classification backend unavailable: {0}")]
    Unavailable(String),
    #[error("classification reply did not match the requested shape: {0}")]
    Malformed(String),
}

/// One candidate in a scored-list comparison: the stored lead's id plus a
/// pre-rendered, bounded text summary.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateDigest {
    pub id: LeadId,
    pub summary: String,
}

/// Score bands spelled out to the oracle for scored-list tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScoringRubric {
    pub near_certain: u8,
    pub very_likely: u8,
    pub possible: u8,
}

impl Default for ScoringRubric {
    fn default() -> Self {
        Self {
            near_certain: 90,
            very_likely: 70,
            possible: 50,
        }
    }
}

/// The three classification task kinds.
#[derive(Debug, Clone, PartialEq)]
pub enum OracleTask {
    /// Yes/no question about a piece of text.
    Boolean { question: String, text: String },
    /// Pick one label from a closed set; off-list or unclear answers
    /// resolve to `fallback_label`.
    Category {
        text: String,
        labels: Vec<String>,
        fallback_label: String,
    },
    /// Score every candidate against the reference per the rubric.
    ScoredList {
        reference: String,
        candidates: Vec<CandidateDigest>,
        rubric: ScoringRubric,
    },
}

/// A classification request: the task plus the caller's deadline. Expiry of
/// the deadline surfaces as [`OracleError::Unavailable`].
#[derive(Debug, Clone, PartialEq)]
pub struct OracleRequest {
    pub task: OracleTask,
    pub timeout: Duration,
}

/// One scored candidate in a scored-list reply. `score` is clamped to
/// [0, 100] at parse time; filtering against the reporting floor is the
/// caller's job.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredMatch {
    pub lead_id: LeadId,
    pub score: u8,
    pub rationale: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OracleResponse {
    Boolean(bool),
    Category(String),
    ScoredList(Vec<ScoredMatch>),
}

/// The capability boundary: side-effect-free, idempotent classification.
#[async_trait]
pub trait ClassifierOracle: Send + Sync {
    async fn classify(&self, request: OracleRequest) -> Result<OracleResponse, OracleError>;
}

/// Bound a payload fragment before it goes into a task.
pub fn clip(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let mut clipped: String = text.chars().take(max_chars).collect();
        clipped.push_str("...");
        clipped
    }
}

/// Canned-answer oracle: returns the same reply for every call and counts
/// invocations. The injectable stand-in for tests and deterministic
/// rule-engine backends.
#[derive(Debug)]
pub struct StaticOracle {
    reply: Result<OracleResponse, OracleError>,
    calls: AtomicUsize,
}

impl StaticOracle {
    pub fn answering(response: OracleResponse) -> Self {
        Self {
            reply: Ok(response),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(error: OracleError) -> Self {
        Self {
            reply: Err(error),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClassifierOracle for StaticOracle {
    async fn classify(&self, _request: OracleRequest) -> Result<OracleResponse, OracleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.reply.clone()
    }
}

#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
}

impl Default for OpenAiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: None,
            model: "gpt-4o-mini".to_string(),
        }
    }
}

/// Chat-completions adapter for any OpenAI-compatible backend.
#[derive(Debug, Clone)]
pub struct OpenAiOracle {
    client: reqwest::Client,
    config: OpenAiConfig,
}

struct RenderedPrompt {
    system: String,
    user: String,
    max_tokens: u32,
    temperature: f64,
}

impl OpenAiOracle {
    pub fn new(config: OpenAiConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .build()
            .context("building classification http client")?;
        Ok(Self { client, config })
    }
}

fn render(task: &OracleTask) -> RenderedPrompt {
    match task {
        OracleTask::Boolean { question, text } => RenderedPrompt {
            system: "You answer yes/no questions about a piece of text. \
                     Respond with only 'YES' or 'NO'."
                .to_string(),
            user: format!("{question}\n\nTEXT:\n\"{text}\""),
            max_tokens: 10,
            temperature: 0.0,
        },
        OracleTask::Category {
            text,
            labels,
            fallback_label,
        } => {
            let listed = labels
                .iter()
                .map(|label| format!("- \"{label}\""))
                .collect::<Vec<_>>()
                .join("\n");
            RenderedPrompt {
                system: format!(
                    "You classify text into exactly one of the following categories:\n{listed}\n\
                     Respond with only the category name, nothing else. If the text does not \
                     clearly fit any category, respond with \"{fallback_label}\"."
                ),
                user: format!("Please categorize this text: \"{text}\""),
                max_tokens: 20,
                temperature: 0.0,
            }
        }
        OracleTask::ScoredList {
            reference,
            candidates,
            rubric,
        } => {
            let listed = candidates
                .iter()
                .map(|c| format!("Lead (ID: {}):\n{}", c.id, c.summary))
                .collect::<Vec<_>>()
                .join("\n\n");
            RenderedPrompt {
                system: format!(
                    "You are a duplicate detection system for a sales-lead store. Compare a new \
                     lead with existing leads and find potential duplicates, considering contact \
                     names (including nicknames and abbreviations), companies, platforms, deal \
                     values, and project descriptions in the notes.\n\n\
                     For each potential duplicate, give a similarity score from 0-100 where:\n\
                     - {nc}-100: almost certain duplicate\n\
                     - {vl}-{nc_lo}: very likely duplicate\n\
                     - {po}-{vl_lo}: possible duplicate worth reviewing\n\
                     - below {po}: not a duplicate\n\n\
                     Respond with a JSON object in this exact format:\n\
                     {{\"duplicates\": [{{\"leadId\": 123, \"similarityScore\": 85, \"reason\": \"...\"}}]}}\n\
                     If no duplicates are found, return: {{\"duplicates\": []}}\n\
                     Only include leads scoring {po} or higher.",
                    nc = rubric.near_certain,
                    nc_lo = rubric.near_certain.saturating_sub(1),
                    vl = rubric.very_likely,
                    vl_lo = rubric.very_likely.saturating_sub(1),
                    po = rubric.possible,
                ),
                user: format!(
                    "NEW LEAD TO CHECK:\n{reference}\n\n\
                     EXISTING LEADS TO COMPARE AGAINST:\n{listed}\n\n\
                     Analyze the new lead against all existing leads and identify potential \
                     duplicates."
                ),
                max_tokens: 1000,
                temperature: 0.1,
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireScoredReply {
    #[serde(default)]
    duplicates: Vec<WireScoredMatch>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireScoredMatch {
    lead_id: LeadId,
    similarity_score: i64,
    #[serde(default)]
    reason: String,
}

fn normalize_reply(content: &str) -> String {
    content
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '.')
        .to_lowercase()
}

fn parse_boolean(content: &str) -> Result<bool, OracleError> {
    match normalize_reply(content).as_str() {
        "yes" => Ok(true),
        "no" => Ok(false),
        other => Err(OracleError::Malformed(format!(
            "expected yes/no, got {other:?}"
        ))),
    }
}

fn parse_category(content: &str, labels: &[String], fallback_label: &str) -> String {
    let normalized = normalize_reply(content);
    labels
        .iter()
        .find(|label| label.to_lowercase() == normalized)
        .cloned()
        .unwrap_or_else(|| fallback_label.to_string())
}

fn strip_fences(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_start_matches('\n')
        .trim_end_matches('`')
        .trim()
}

fn parse_scored(content: &str) -> Result<Vec<ScoredMatch>, OracleError> {
    let reply: WireScoredReply = serde_json::from_str(strip_fences(content))
        .map_err(|err| OracleError::Malformed(format!("scored-list reply: {err}")))?;
    Ok(reply
        .duplicates
        .into_iter()
        .map(|m| ScoredMatch {
            lead_id: m.lead_id,
            score: m.similarity_score.clamp(0, 100) as u8,
            rationale: m.reason,
        })
        .collect())
}

#[async_trait]
impl ClassifierOracle for OpenAiOracle {
    async fn classify(&self, request: OracleRequest) -> Result<OracleResponse, OracleError> {
        let prompt = render(&request.task);
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );
        let body = json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": prompt.system},
                {"role": "user", "content": prompt.user},
            ],
            "max_tokens": prompt.max_tokens,
            "temperature": prompt.temperature,
        });

        let mut http_request = self.client.post(&url).json(&body);
        if let Some(api_key) = &self.config.api_key {
            http_request = http_request.bearer_auth(api_key);
        }

        let exchange = async {
            let response = http_request
                .send()
                .await
                .map_err(|err| OracleError::Unavailable(err.to_string()))?;
            let status = response.status();
            if !status.is_success() {
                return Err(OracleError::Unavailable(format!(
                    "classification backend returned status {status}"
                )));
            }
            response
                .json::<ChatReply>()
                .await
                .map_err(|err| OracleError::Malformed(err.to_string()))
        };

        let reply = tokio::time::timeout(request.timeout, exchange)
            .await
            .map_err(|_| {
                OracleError::Unavailable(format!(
                    "classification call exceeded {}ms",
                    request.timeout.as_millis()
                ))
            })??;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| OracleError::Malformed("reply carried no message content".into()))?;
        debug!(chars = content.len(), "oracle reply received");

        match &request.task {
            OracleTask::Boolean { .. } => parse_boolean(&content).map(OracleResponse::Boolean),
            OracleTask::Category {
                labels,
                fallback_label,
                ..
            } => Ok(OracleResponse::Category(parse_category(
                &content,
                labels,
                fallback_label,
            ))),
            OracleTask::ScoredList { .. } => parse_scored(&content).map(OracleResponse::ScoredList),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boolean_replies_parse_strictly() {
        assert!(parse_boolean("YES").unwrap());
        assert!(!parse_boolean(" no. ").unwrap());
        assert!(parse_boolean("the text mentions Initech").is_err());
        assert!(parse_boolean("").is_err());
    }

    #[test]
    fn off_list_category_resolves_to_fallback() {
        let labels = vec![
            "development".to_string(),
            "design".to_string(),
            "mobile app design and development".to_string(),
        ];
        assert_eq!(parse_category("Design", &labels, "development"), "design");
        assert_eq!(
            parse_category("\"mobile app design and development\"", &labels, "development"),
            "mobile app design and development"
        );
        assert_eq!(
            parse_category("consulting", &labels, "development"),
            "development"
        );
        assert_eq!(parse_category("", &labels, "development"), "development");
    }

    #[test]
    fn scored_replies_tolerate_fences_and_clamp_scores() {
        let fenced = "```json\n{\"duplicates\":[{\"leadId\":7,\"similarityScore\":140,\"reason\":\"same person\"}]}\n```";
        let parsed = parse_scored(fenced).unwrap();
        assert_eq!(parsed.len(), 1);
        assert_eq!(parsed[0].lead_id, 7);
        assert_eq!(parsed[0].score, 100);
        assert_eq!(parsed[0].rationale, "same person");

        let empty = parse_scored("{\"duplicates\": []}").unwrap();
        assert!(empty.is_empty());

        assert!(parse_scored("no duplicates found").is_err());
    }

    #[test]
    fn clip_bounds_payloads() {
        assert_eq!(clip("short", 10), "short");
        let clipped = clip(&"x".repeat(20), 5);
        assert_eq!(clipped, "xxxxx...");
    }

    #[tokio::test]
    async fn static_oracle_counts_calls() {
        let oracle = StaticOracle::answering(OracleResponse::Boolean(true));
        let request = OracleRequest {
            task: OracleTask::Boolean {
                question: "mentions a company?".into(),
                text: "hello".into(),
            },
            timeout: Duration::from_secs(1),
        };
        assert_eq!(
            oracle.classify(request.clone()).await.unwrap(),
            OracleResponse::Boolean(true)
        );
        assert_eq!(oracle.calls(), 1);
        oracle.classify(request).await.unwrap();
        assert_eq!(oracle.calls(), 2);
    }
}
