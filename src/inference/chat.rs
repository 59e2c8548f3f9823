//! `ChatCompletionsClient` — calls any OpenAI-compatible
//! `/v1/chat/completions` endpoint (OpenAI, Groq, Ollama in OpenAI mode,
//! LM Studio, vLLM …).
//!
//! All connection details come from [`InferenceConfig`]; nothing is
//! hardcoded.  The model ends a call by finishing its reply with
//! [`END_SESSION_MARKER`], which is stripped before the text is spoken.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{resolve_api_key, InferenceConfig};
use crate::inference::window::{ConversationWindow, Role, WindowMessage};
use crate::inference::{InferenceClient, InferenceContext, InferenceError, InferenceReply};
use crate::transcription::TranscriptEntry;

/// Appended by the model when the conversation should end.
pub const END_SESSION_MARKER: &str = "[end_session]";

const END_SESSION_INSTRUCTION: &str = "If the participants say goodbye or ask you to leave, \
     reply with a short farewell followed by [end_session].";

// ---------------------------------------------------------------------------
// Reply parsing
// ---------------------------------------------------------------------------

/// Turn raw model output into an [`InferenceReply`].
///
/// ```rust
/// use voice_bridge::inference::parse_reply;
///
/// let reply = parse_reply("Bye everyone! [end_session]");
/// assert_eq!(reply.spoken_text.as_deref(), Some("Bye everyone!"));
/// assert!(reply.end_session);
/// ```
pub fn parse_reply(content: &str) -> InferenceReply {
    // ASCII lowering keeps byte offsets valid for slicing `content`.
    let lowered = content.to_ascii_lowercase();
    let (text, end_session) = match lowered.find(END_SESSION_MARKER) {
        Some(pos) => {
            let mut text = String::with_capacity(content.len());
            text.push_str(&content[..pos]);
            text.push_str(&content[pos + END_SESSION_MARKER.len()..]);
            (text, true)
        }
        None => (content.to_string(), false),
    };

    let text = text.trim();
    InferenceReply {
        spoken_text: (!text.is_empty()).then(|| text.to_string()),
        end_session,
    }
}

fn transcript_line(entry: &TranscriptEntry) -> String {
    format!("{}: {}", entry.display_name, entry.text)
}

// ---------------------------------------------------------------------------
// ChatCompletionsClient
// ---------------------------------------------------------------------------

pub struct ChatCompletionsClient {
    client: reqwest::Client,
    config: InferenceConfig,
    api_key: Option<String>,
    window: Mutex<ConversationWindow>,
}

impl ChatCompletionsClient {
    /// Build a client from config.
    ///
    /// The HTTP client carries the per-request timeout from
    /// `config.timeout_secs`; a default client is used if the builder fails.
    pub fn from_config(config: &InferenceConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            client,
            config: config.clone(),
            api_key: resolve_api_key(config.api_key.as_deref(), "OPENAI_API_KEY"),
            window: Mutex::new(ConversationWindow::new(
                config.window_size,
                Duration::from_secs(config.reset_silence_secs),
            )),
        }
    }

    fn lock_window(&self) -> std::sync::MutexGuard<'_, ConversationWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Request body for one turn: system prompt, then the window, ending
    /// with the triggering line.
    fn build_body(&self, context: &InferenceContext) -> serde_json::Value {
        let mut window = self.lock_window().snapshot();
        let trigger = transcript_line(&context.trigger);
        let trigger_present = window
            .last()
            .is_some_and(|m| m.role == Role::User && m.content == trigger);
        if !trigger_present {
            window.push(WindowMessage {
                role: Role::User,
                content: trigger,
            });
        }

        let system = format!("{}\n{}", self.config.system_prompt, END_SESSION_INSTRUCTION);
        let mut messages = Vec::with_capacity(window.len() + 1);
        messages.push(serde_json::json!({ "role": "system", "content": system }));
        messages.extend(
            window
                .iter()
                .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content })),
        );

        serde_json::json!({
            "model":       self.config.model,
            "messages":    messages,
            "stream":      false,
            "temperature": self.config.temperature,
            "max_tokens":  self.config.max_tokens
        })
    }
}

#[async_trait]
impl InferenceClient for ChatCompletionsClient {
    fn record_transcript(&self, entry: &TranscriptEntry) {
        self.lock_window().push(Role::User, transcript_line(entry));
    }

    /// The `Authorization: Bearer …` header is attached only when an API key
    /// resolved, so local providers work without one.
    async fn run_inference(
        &self,
        context: InferenceContext,
    ) -> Result<InferenceReply, InferenceError> {
        let url = format!("{}/v1/chat/completions", self.config.base_url);
        let body = self.build_body(&context);

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(InferenceError::Request(format!("HTTP {status}: {detail}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| InferenceError::Parse(e.to_string()))?;

        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or(InferenceError::EmptyResponse)?;

        let reply = parse_reply(content);
        if let Some(text) = reply.usable_text() {
            self.lock_window().push(Role::Assistant, text);
        }
        log::debug!(
            "inference: reply for {} ({} history entries, end_session={})",
            context.trigger.speaker_id,
            context.history.len(),
            reply.end_session
        );
        Ok(reply)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
