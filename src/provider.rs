//! The boundary to whatever actually runs the model.
//!
//! The engine only ever talks to a [`Provider`]. Concrete vendor adapters live
//! outside this crate; [`MockProvider`] replays a script for tests and demos.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProviderError;
use crate::models::TokenUsage;

/// Per-call knobs forwarded to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderOptions {
    pub model: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub timeout: Option<Duration>,
    /// Vendor-specific settings.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl ProviderOptions {
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Raw model output for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderResponse {
    pub content: String,
    pub token_usage: Option<TokenUsage>,
    pub stop_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl ProviderResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHealth {
    pub healthy: bool,
    pub checked_at: DateTime<Utc>,
    pub response_time_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProviderHealth {
    pub fn healthy() -> Self {
        Self {
            healthy: true,
            checked_at: Utc::now(),
            response_time_ms: None,
            error: None,
        }
    }

    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            checked_at: Utc::now(),
            response_time_ms: None,
            error: Some(error.into()),
        }
    }
}

/// A model backend.
///
/// Implementations must be usable behind `Arc<dyn Provider>`. Session support
/// is optional; the default methods describe a stateless provider.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short identifier used in errors and metadata.
    fn name(&self) -> &str;

    /// Send one combined prompt and return the raw model text.
    async fn send_prompt(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError>;

    fn supports_sessions(&self) -> bool {
        false
    }

    /// Create a provider-side session primed with `context`.
    async fn create_session(
        &self,
        _context: &str,
        _options: &ProviderOptions,
    ) -> Result<String, ProviderError> {
        Err(ProviderError::new(self.name(), "sessions are not supported").non_retryable())
    }

    async fn destroy_session(&self, _session_id: &str) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn health(&self) -> ProviderHealth {
        ProviderHealth::healthy()
    }
}

/// One scripted step for [`MockProvider`].
#[derive(Debug, Clone)]
pub enum MockReply {
    Content(String),
    Failure { message: String, status: Option<u16> },
    /// Panic inside `send_prompt`, to exercise orchestration failure handling.
    Panic(String),
}

impl MockReply {
    pub fn content(text: impl Into<String>) -> Self {
        Self::Content(text.into())
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self::Failure {
            message: message.into(),
            status: None,
        }
    }

    pub fn failure_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Failure {
            message: message.into(),
            status: Some(status),
        }
    }
}

/// A prompt the mock received.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub session_id: Option<String>,
    pub prompt: String,
    pub options: ProviderOptions,
}

/// Provider that replays scripted replies in order.
///
/// Once the script runs out the fallback reply (if any) is returned forever.
#[derive(Debug)]
pub struct MockProvider {
    name: String,
    script: Mutex<VecDeque<MockReply>>,
    fallback: Option<MockReply>,
    calls: Mutex<Vec<RecordedCall>>,
    sessions: bool,
    fail_session_creation: bool,
    token_usage: Option<TokenUsage>,
    session_counter: AtomicUsize,
    destroyed: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(script: impl IntoIterator<Item = MockReply>) -> Self {
        Self {
            name: "mock".to_string(),
            script: Mutex::new(script.into_iter().collect()),
            fallback: None,
            calls: Mutex::new(Vec::new()),
            sessions: false,
            fail_session_creation: false,
            token_usage: None,
            session_counter: AtomicUsize::new(0),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    /// Shorthand for a script of plain text responses.
    pub fn with_responses<I, S>(responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(responses.into_iter().map(MockReply::content))
    }

    /// A provider that answers every call with `reply`.
    pub fn always(reply: MockReply) -> Self {
        Self::new(Vec::new()).with_fallback(reply)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_fallback(mut self, reply: MockReply) -> Self {
        self.fallback = Some(reply);
        self
    }

    pub fn with_sessions(mut self) -> Self {
        self.sessions = true;
        self
    }

    pub fn failing_session_creation(mut self) -> Self {
        self.sessions = true;
        self.fail_session_creation = true;
        self
    }

    /// Report this usage on every successful reply.
    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self) -> usize {
        lock(&self.calls).len()
    }

    pub fn prompts(&self) -> Vec<String> {
        lock(&self.calls).iter().map(|c| c.prompt.clone()).collect()
    }

    pub fn destroyed_sessions(&self) -> Vec<String> {
        lock(&self.destroyed).clone()
    }

    fn next_reply(&self) -> Option<MockReply> {
        lock(&self.script)
            .pop_front()
            .or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send_prompt(
        &self,
        session_id: Option<&str>,
        prompt: &str,
        options: &ProviderOptions,
    ) -> Result<ProviderResponse, ProviderError> {
        lock(&self.calls).push(RecordedCall {
            session_id: session_id.map(str::to_string),
            prompt: prompt.to_string(),
            options: options.clone(),
        });

        match self.next_reply() {
            Some(MockReply::Content(text)) => Ok(ProviderResponse {
                content: text,
                token_usage: self.token_usage,
                stop_reason: Some("stop".to_string()),
                metadata: Map::new(),
            }),
            Some(MockReply::Failure { message, status }) => {
                let err = ProviderError::new(&self.name, message);
                Err(match status {
                    Some(status) => err.with_status(status),
                    None => err,
                })
            }
            Some(MockReply::Panic(message)) => panic!("{message}"),
            None => Err(ProviderError::new(&self.name, "mock script exhausted").non_retryable()),
        }
    }

    fn supports_sessions(&self) -> bool {
        self.sessions
    }

    async fn create_session(
        &self,
        _context: &str,
        _options: &ProviderOptions,
    ) -> Result<String, ProviderError> {
        if !self.sessions {
            return Err(
                ProviderError::new(&self.name, "sessions are not supported").non_retryable(),
            );
        }
        if self.fail_session_creation {
            return Err(ProviderError::new(&self.name, "session quota exceeded").non_retryable());
        }
        let n = self.session_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("{}-session-{n}", self.name))
    }

    async fn destroy_session(&self, session_id: &str) -> Result<(), ProviderError> {
        lock(&self.destroyed).push(session_id.to_string());
        Ok(())
    }
}

/// Lock a mutex, recovering the data if a scripted panic poisoned it.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
