// Chat-completions client for chemical analysis and safety lookups
// Retries transient failures with exponential backoff; analysis degrades to
// a fixed sentinel text instead of failing the caller.

use crate::core::config::KnowledgeConfig;
use crate::core::errors::{KnowledgeError, KnowledgeResult};
use crate::core::types::ChemicalRecord;
use crate::services::knowledge::extract::extract_chemical_record;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};

/// Analysis text returned when the model cannot be reached
pub const ANALYSIS_UNAVAILABLE: &str = "model request failed";

/// Upper bound on the wait between attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

const ANALYSIS_SYSTEM_PROMPT: &str = "You are a chemical safety expert. \
     Analyze chemical container labels and explain the substance, its hazards \
     and how to handle, store and dispose of it safely.";

const RECORD_SYSTEM_PROMPT: &str = "You are a chemical safety expert. \
     Reply with JSON only, without any other text. Make sure the JSON is valid.";

const RECORD_PROMPT: &str = r#"Provide detailed safety information for the chemical below. Return JSON only, with no other content:
{
    "chemical_name": {
        "zh": "Chinese name",
        "en": "English name"
    },
    "formula": "molecular formula",
    "cas": "CAS number",
    "hazard_class": "hazard class",
    "main_hazards": [
        "main hazard 1",
        "main hazard 2"
    ],
    "safety_measures": [
        "protective measure 1",
        "protective measure 2"
    ],
    "first_aid": [
        "first aid measure 1",
        "first aid measure 2"
    ],
    "storage": [
        "storage note 1",
        "storage note 2"
    ]
}

Chemical: "#;

/// Source of free-text analysis for an instruction
pub trait KnowledgeSource: Send + Sync {
    /// Never fails; returns [`ANALYSIS_UNAVAILABLE`] when no answer is available
    fn analyze(&self, instruction: &str) -> impl Future<Output = String> + Send;
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    #[serde(default)]
    message: Option<ResponseMessage>,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Outcome of one streamed line
enum StreamLine {
    Content(String),
    Done,
    Skip,
}

fn parse_stream_line(line: &[u8]) -> StreamLine {
    let Ok(line) = std::str::from_utf8(line) else {
        return StreamLine::Skip;
    };
    let line = line.trim();
    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);

    if payload.is_empty() {
        return StreamLine::Skip;
    }
    if payload == "[DONE]" {
        return StreamLine::Done;
    }

    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta)
            .and_then(|d| d.content)
            .map(StreamLine::Content)
            .unwrap_or(StreamLine::Skip),
        Err(e) => {
            debug!("Ignoring non-JSON stream line ({}): {}", e, payload);
            StreamLine::Skip
        }
    }
}

/// Wait after the `attempt`-th failure: `base * 2^(attempt-1)`, capped
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt.saturating_sub(1))
        .and_then(|factor| base.checked_mul(factor))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

fn snippet(text: &str) -> &str {
    match text.char_indices().nth(200) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// HTTP client for an OpenAI-compatible chat-completions endpoint
pub struct KnowledgeClient {
    http_client: reqwest::Client,
    config: KnowledgeConfig,
    url: String,
}

impl KnowledgeClient {
    pub fn new(config: KnowledgeConfig) -> KnowledgeResult<Self> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .pool_max_idle_per_host(5)
            .build()
            .map_err(KnowledgeError::ClientBuild)?;

        let url = config.url();
        info!(
            "Knowledge client: {} (model {}, stream {}, {} attempts)",
            url, config.model, config.stream, config.max_attempts
        );

        Ok(Self {
            http_client,
            config,
            url,
        })
    }

    /// Send one chat request with a system and a user message.
    ///
    /// Transport failures and 429/5xx responses are retried up to
    /// `max_attempts` times in total, sleeping `backoff_base * 2^(n-1)` after
    /// the n-th failed attempt (capped at 10s).
    #[instrument(skip(self, system, user), fields(model = %self.config.model))]
    pub async fn query(&self, system: &str, user: &str) -> KnowledgeResult<String> {
        let request = ChatCompletionRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
            stream: self.config.stream,
        };

        let max_attempts = self.config.max_attempts.max(1);
        let start = Instant::now();

        let mut attempt = 1;
        let last_error = loop {
            match self.send_once(&request).await {
                Ok(content) => {
                    debug!(
                        "Model answered in {:.2}s ({} chars, attempt {})",
                        start.elapsed().as_secs_f64(),
                        content.chars().count(),
                        attempt
                    );
                    return Ok(content);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    let delay = backoff_delay(self.config.backoff_base, attempt);
                    warn!(
                        "Model request failed (attempt {}/{}): {}. Retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_retryable() => break e,
                Err(e) => {
                    error!("Model request failed without retry: {}", e);
                    return Err(e);
                }
            }
        };

        error!(
            "Model request failed after {} attempts: {}",
            max_attempts, last_error
        );
        Err(KnowledgeError::RetriesExhausted {
            attempts: max_attempts,
            last_error: last_error.to_string(),
        })
    }

    async fn send_once(&self, request: &ChatCompletionRequest<'_>) -> KnowledgeResult<String> {
        let mut builder = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .json(request);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = builder.send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KnowledgeError::Rejected {
                status: status.as_u16(),
                body: snippet(&body).to_string(),
            });
        }

        if request.stream {
            self.read_stream(response).await
        } else {
            let body = response.text().await?;
            let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|e| {
                KnowledgeError::MalformedResponse(format!("{}: {}", e, snippet(&body)))
            })?;
            parsed
                .choices
                .into_iter()
                .next()
                .and_then(|c| c.message)
                .and_then(|m| m.content)
                .ok_or_else(|| {
                    KnowledgeError::MalformedResponse(format!(
                        "missing choices[0].message.content: {}",
                        snippet(&body)
                    ))
                })
        }
    }

    /// Concatenate `choices[0].delta.content` over newline-delimited chunks
    async fn read_stream(&self, response: reqwest::Response) -> KnowledgeResult<String> {
        let mut stream = response.bytes_stream();
        let mut pending: Vec<u8> = Vec::new();
        let mut content = String::new();
        let mut saw_content = false;
        let mut done = false;

        'read: while let Some(chunk) = stream.next().await {
            pending.extend_from_slice(&chunk?);

            while let Some(newline) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match parse_stream_line(&line) {
                    StreamLine::Content(fragment) => {
                        saw_content = true;
                        content.push_str(&fragment);
                    }
                    StreamLine::Done => {
                        done = true;
                        break 'read;
                    }
                    StreamLine::Skip => {}
                }
            }
        }

        // Last line may come without a trailing newline
        if !done {
            if let StreamLine::Content(fragment) = parse_stream_line(&pending) {
                saw_content = true;
                content.push_str(&fragment);
            }
        }

        if !saw_content {
            return Err(KnowledgeError::MalformedResponse(
                "stream ended without any content".to_string(),
            ));
        }
        Ok(content)
    }

    /// Free-text analysis of an instruction, or [`ANALYSIS_UNAVAILABLE`]
    #[instrument(skip_all)]
    pub async fn analyze(&self, instruction: &str) -> String {
        match self.query(ANALYSIS_SYSTEM_PROMPT, instruction).await {
            Ok(content) => content,
            Err(e) => {
                warn!("Analysis unavailable: {}", e);
                ANALYSIS_UNAVAILABLE.to_string()
            }
        }
    }

    /// Ask for a structured safety record for `chemical_name`
    #[instrument(skip(self))]
    pub async fn chemical_info(&self, chemical_name: &str) -> Option<ChemicalRecord> {
        let prompt = format!("{}{}", RECORD_PROMPT, chemical_name);
        match self.query(RECORD_SYSTEM_PROMPT, &prompt).await {
            Ok(content) => {
                debug!("Raw record response: {}", content);
                extract_chemical_record(&content)
            }
            Err(e) => {
                warn!("Chemical info lookup for '{}' failed: {}", chemical_name, e);
                None
            }
        }
    }
}

impl KnowledgeSource for KnowledgeClient {
    fn analyze(&self, instruction: &str) -> impl Future<Output = String> + Send {
        KnowledgeClient::analyze(self, instruction)
    }
}
