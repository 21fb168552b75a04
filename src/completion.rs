use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{AppConfig, NO_ADDRESS_TOKEN};
use crate::credentials::Credentials;
use crate::errors::{AppError, AppResult};
use crate::ledger::UsageLedger;
use crate::prompts::Prompts;
use crate::store::{AddressRef, WorkItem};
use crate::telemetry::TelemetryClient;

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct ChatUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: Option<String>,
    pub usage: Option<ChatUsage>,
    pub choices: usize,
}

#[async_trait]
pub trait ChatCompleter: Send + Sync {
    async fn complete(&self, system: &str, user: &str) -> AppResult<ChatOutcome>;
}

/// Wraps the completion API: one request per establishment, no retries.
/// Token usage flows into the ledger after every call; parsing happens
/// afterwards on the raw text.
pub struct CompletionClient {
    completer: Arc<dyn ChatCompleter>,
    prompts: Prompts,
    ledger: UsageLedger,
    telemetry: TelemetryClient,
}

impl CompletionClient {
    pub fn new(
        config: &AppConfig,
        credentials: &Credentials,
        prompts: Prompts,
        ledger: UsageLedger,
        telemetry: TelemetryClient,
    ) -> Self {
        let http = HttpChatClient::new(config, credentials.openai().clone());
        Self::with_completer(Arc::new(http), prompts, ledger, telemetry)
    }

    pub fn with_completer(
        completer: Arc<dyn ChatCompleter>,
        prompts: Prompts,
        ledger: UsageLedger,
        telemetry: TelemetryClient,
    ) -> Self {
        Self {
            completer,
            prompts,
            ledger,
            telemetry,
        }
    }

    pub fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Asks the model for address candidates for one establishment and
    /// fills `refs` and `raw_gpt` on a fresh `WorkItem`.
    pub async fn extract(&mut self, name: &str) -> AppResult<WorkItem> {
        let system = self.prompts.render_system(NO_ADDRESS_TOKEN);
        let user = self.prompts.render_user(name);

        let begin = Instant::now();
        let outcome = self
            .completer
            .complete(&system, &user)
            .await
            .map_err(|err| AppError::extraction(name, err.to_string()))?;
        let elapsed = begin.elapsed();

        // Usage is accounted before the response is inspected, so a
        // malformed body still pays for its tokens.
        if let Some(usage) = outcome.usage {
            self.ledger.add(usage.prompt_tokens, usage.completion_tokens)?;
        }

        let raw = outcome
            .content
            .filter(|content| !content.is_empty())
            .ok_or_else(|| AppError::extraction(name, "completion returned no content"))?;

        let mut item = WorkItem::new(name);
        item.raw_gpt = Some(raw.clone());

        let trimmed = raw.trim();
        if trimmed == NO_ADDRESS_TOKEN {
            warn!("returned no-address flag for {name}");
            warn!("raw response: {raw}");
        } else {
            if trimmed.contains(NO_ADDRESS_TOKEN) {
                warn!(
                    "no-address token mixed with other content for {name}; parsing all lines"
                );
            }
            item.refs = parse_candidates(&raw)
                .into_iter()
                .map(AddressRef::new)
                .collect();
        }

        info!(
            "{} s ({}): {} / {} | {}",
            elapsed.as_secs(),
            outcome.choices,
            self.ledger
                .last_call_tokens()
                .map(|count| count.to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.ledger.total(),
            item.refs
                .iter()
                .map(|address| address.text.as_str())
                .collect::<Vec<_>>()
                .join(" + ")
        );
        let _ = self.telemetry.record(
            "completion_call",
            serde_json::json!({
                "elapsed_ms": elapsed.as_millis() as u64,
                "candidates": item.refs.len(),
                "tokens": self.ledger.last_call_tokens(),
            }),
        );

        Ok(item)
    }
}

/// Splits a raw completion into address candidates: one per line, trimmed,
/// with an optional leading ordinal or bullet prefix dropped.
pub fn parse_candidates(raw: &str) -> Vec<String> {
    raw.lines()
        .map(|line| strip_ordinal_prefix(line.trim()))
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn strip_ordinal_prefix(line: &str) -> &str {
    let rest = if let Some(stripped) = line
        .strip_prefix('-')
        .or_else(|| line.strip_prefix('*'))
        .or_else(|| line.strip_prefix('•'))
    {
        stripped
    } else {
        let digits = line.chars().take_while(|c| c.is_ascii_digit()).count();
        if digits == 0 {
            return line;
        }
        let after = &line[digits..];
        match after.chars().next() {
            Some('.') | Some(')') | Some(':') => &after[1..],
            // "12 Main St" style lines start with digits but carry no
            // separator right after them; leave them whole.
            _ => return line,
        }
    };
    rest.trim_start()
}

struct HttpChatClient {
    http: reqwest::Client,
    api_base: String,
    api_key: SecretString,
    model: String,
    temperature: f64,
}

impl HttpChatClient {
    fn new(config: &AppConfig, api_key: SecretString) -> Self {
        let http = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .expect("chat http client");
        Self {
            http,
            api_base: config.openai_api_base.clone(),
            api_key,
            model: config.openai_model.clone(),
            temperature: config.openai_temperature,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f64,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsageRaw>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ChatUsageRaw {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[async_trait]
impl ChatCompleter for HttpChatClient {
    async fn complete(&self, system: &str, user: &str) -> AppResult<ChatOutcome> {
        let body = ChatRequest {
            model: &self.model,
            temperature: self.temperature,
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
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(self.api_key.expose_secret())
            .json(&body)
            .send()
            .await?
            .error_for_status()?;

        let parsed: ChatResponse = response.json().await?;
        let choices = parsed.choices.len();
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content);

        Ok(ChatOutcome {
            content,
            usage: parsed.usage.map(|usage| ChatUsage {
                prompt_tokens: usage.prompt_tokens,
                completion_tokens: usage.completion_tokens,
            }),
            choices,
        })
    }
}
