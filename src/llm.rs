//! LLM client abstraction.
//!
//! Every call site declares a [`Signature`]: instructions plus named input
//! and output fields. A [`Prompt`] fills in the inputs (and optionally
//! images for vision calls) and a [`LlmClient`] returns a [`Completion`]
//! holding the output fields as a JSON object.
//!
//! Call sites never read completion fields loosely. They deserialize into
//! their own reply type through [`complete_as`], which re-asks the model
//! when the reply does not match the declared shape.
//!
//! # Providers
//!
//! - **[`OpenAiClient`]**: chat completions API with JSON-object response
//!   format, retry and backoff.
//! - **[`DisabledClient`]**: always fails; used when `llm.provider = "disabled"`.
//!
//! Retry strategy for HTTP calls:
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - other 4xx → fail immediately
//! - network errors → retry

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::config::LlmConfig;

/// One named field of a signature.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub desc: &'static str,
}

pub const fn field(name: &'static str, desc: &'static str) -> FieldSpec {
    FieldSpec { name, desc }
}

/// The contract of one LLM call site.
#[derive(Debug, Clone)]
pub struct Signature {
    pub name: &'static str,
    pub instructions: String,
    pub inputs: Vec<FieldSpec>,
    pub outputs: Vec<FieldSpec>,
}

/// Which configured model serves a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    Text,
    Vision,
}

/// A signature with its input values filled in.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub signature: Signature,
    pub values: Vec<(&'static str, String)>,
    /// Base64-encoded PNG images.
    pub images: Vec<String>,
    pub model: ModelKind,
}

impl Prompt {
    pub fn new(signature: Signature) -> Self {
        Self {
            signature,
            values: Vec::new(),
            images: Vec::new(),
            model: ModelKind::Text,
        }
    }

    pub fn input(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.values.push((name, value.into()));
        self
    }

    pub fn image(mut self, png_base64: impl Into<String>) -> Self {
        self.images.push(png_base64.into());
        self.model = ModelKind::Vision;
        self
    }

    pub fn name(&self) -> &'static str {
        self.signature.name
    }

    pub fn value(&self, name: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// System message: instructions, field declarations and the reply format.
    pub fn system_text(&self) -> String {
        let sig = &self.signature;
        let mut out = String::new();
        out.push_str(sig.instructions.trim());
        out.push_str("\n\nYour input fields are:\n");
        for f in &sig.inputs {
            out.push_str(&format!("- `{}`: {}\n", f.name, f.desc));
        }
        out.push_str("\nYour output fields are:\n");
        for f in &sig.outputs {
            out.push_str(&format!("- `{}`: {}\n", f.name, f.desc));
        }
        let keys: Vec<String> = sig.outputs.iter().map(|f| format!("\"{}\"", f.name)).collect();
        out.push_str(&format!(
            "\nRespond with a single JSON object with exactly these keys: {}.",
            keys.join(", ")
        ));
        out
    }

    /// User message: one `[[ ## name ## ]]` block per input field.
    pub fn user_text(&self) -> String {
        let mut out = String::new();
        for f in &self.signature.inputs {
            let value = self.value(f.name).unwrap_or("");
            out.push_str(&format!("[[ ## {} ## ]]\n{}\n\n", f.name, value));
        }
        out.trim_end().to_string()
    }
}

/// Output fields of one completion.
#[derive(Debug, Clone, Default)]
pub struct Completion {
    pub fields: Map<String, Value>,
}

impl Completion {
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => bail!("completion is not a JSON object: {}", other),
        }
    }

    /// Parse model text into fields, tolerating code fences around the JSON.
    pub fn from_text(text: &str) -> Result<Self> {
        let start = text
            .find('{')
            .ok_or_else(|| anyhow!("no JSON object in completion"))?;
        let end = text
            .rfind('}')
            .ok_or_else(|| anyhow!("no JSON object in completion"))?;
        if end < start {
            bail!("no JSON object in completion");
        }
        let value: Value = serde_json::from_str(&text[start..=end])?;
        Self::from_value(value)
    }

    pub fn parse<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// A black-box structured completion capability.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion>;
}

/// Run `prompt` and deserialize the completion into `T`.
///
/// A completion that does not match `T` is requested again up to
/// `schema_retries` more times; transport errors are returned at once.
pub async fn complete_as<T: DeserializeOwned>(
    client: &dyn LlmClient,
    prompt: &Prompt,
    schema_retries: u32,
) -> Result<T> {
    let mut last_err = None;
    for attempt in 0..=schema_retries {
        let completion = client.complete(prompt).await?;
        match completion.parse::<T>() {
            Ok(value) => return Ok(value),
            Err(e) => {
                warn!(
                    signature = prompt.name(),
                    attempt = attempt + 1,
                    error = %e,
                    "completion did not match declared fields"
                );
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| anyhow!("completion did not match declared fields")))
}

/// Build the client selected by `llm.provider`.
pub fn build_client(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledClient)),
        "openai" => Ok(Arc::new(OpenAiClient::from_config(config)?)),
        other => bail!("Unknown llm provider: {}", other),
    }
}

/// Client used when no provider is configured.
pub struct DisabledClient;

#[async_trait]
impl LlmClient for DisabledClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        bail!(
            "LLM provider is disabled (cannot run '{}'); set [llm] provider in the config",
            prompt.name()
        )
    }
}

/// OpenAI chat completions client.
pub struct OpenAiClient {
    http: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    vision_model: String,
    temperature: f32,
    max_retries: u32,
}

impl OpenAiClient {
    /// Build from config; the key comes from `OPENAI_API_KEY`.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let api_key =
            std::env::var("OPENAI_API_KEY").map_err(|_| anyhow!("OPENAI_API_KEY not set"))?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            url: config.url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            vision_model: config.vision_model.clone(),
            temperature: config.temperature,
            max_retries: config.max_retries,
        })
    }

    fn request_body(&self, prompt: &Prompt) -> Value {
        let model = match prompt.model {
            ModelKind::Text => &self.model,
            ModelKind::Vision => &self.vision_model,
        };
        let user_content = if prompt.images.is_empty() {
            Value::String(prompt.user_text())
        } else {
            let mut parts = vec![json!({"type": "text", "text": prompt.user_text()})];
            for image in &prompt.images {
                parts.push(json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/png;base64,{}", image)}
                }));
            }
            Value::Array(parts)
        };
        json!({
            "model": model,
            "temperature": self.temperature,
            "response_format": {"type": "json_object"},
            "messages": [
                {"role": "system", "content": prompt.system_text()},
                {"role": "user", "content": user_content},
            ],
        })
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, prompt: &Prompt) -> Result<Completion> {
        let body = self.request_body(prompt);
        debug!(signature = prompt.name(), "sending completion request");

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .http
                .post(format!("{}/chat/completions", self.url))
                .header("Authorization", format!("Bearer {}", self.api_key))
                .json(&body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_chat_response(&json);
                    }

                    if status.as_u16() == 429 || status.is_server_error() {
                        let body_text = response.text().await.unwrap_or_default();
                        last_err = Some(anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow!("Completion failed after retries")))
    }
}

/// Extract `choices[0].message.content` and parse it as the field object.
fn parse_chat_response(json: &Value) -> Result<Completion> {
    let content = json
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow!("Invalid OpenAI response: missing message content"))?;
    Completion::from_text(content)
}
