//! Session storage and the coordinator that creates or reuses sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::{PersuaderError, SessionError};
use crate::metrics::SessionMetrics;
use crate::provider::{Provider, ProviderOptions};
use crate::retry::{with_retry, RetryPolicy};

/// Everything remembered about one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub id: String,
    pub provider: String,
    pub context: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub metrics: SessionMetrics,
    /// Whether the provider knows this id. Local sessions only exist here.
    pub provider_managed: bool,
}

impl SessionData {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        context: impl Into<String>,
        provider_managed: bool,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            provider: provider.into(),
            context: context.into(),
            created_at: now,
            last_used_at: now,
            metrics: SessionMetrics::default(),
            provider_managed,
        }
    }

    pub fn touch(&mut self) {
        self.last_used_at = Utc::now();
    }
}

/// Storage for session data.
///
/// Each call is atomic on its own. Read-modify-write cycles spanning several
/// calls are not, so a session id must have a single writer at a time.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, session_id: &str) -> Result<Option<SessionData>, SessionError>;

    async fn set(&self, session: SessionData) -> Result<(), SessionError>;

    /// Remove a session, returning whether it existed.
    async fn delete(&self, session_id: &str) -> Result<bool, SessionError>;

    async fn ids(&self) -> Result<Vec<String>, SessionError>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Debug, Clone, Default)]
pub struct InMemorySessionStore {
    inner: Arc<Mutex<HashMap<String, SessionData>>>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get(&self, session_id: &str) -> Result<Option<SessionData>, SessionError> {
        Ok(self.inner.lock().await.get(session_id).cloned())
    }

    async fn set(&self, session: SessionData) -> Result<(), SessionError> {
        self.inner.lock().await.insert(session.id.clone(), session);
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, SessionError> {
        Ok(self.inner.lock().await.remove(session_id).is_some())
    }

    async fn ids(&self) -> Result<Vec<String>, SessionError> {
        let mut ids: Vec<String> = self.inner.lock().await.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

/// The session a pipeline run is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSession {
    pub id: String,
    pub provider_managed: bool,
}

impl ResolvedSession {
    /// The id to hand to the provider, if the provider knows it.
    pub fn provider_session_id(&self) -> Option<&str> {
        self.provider_managed.then_some(self.id.as_str())
    }
}

/// Creates, reuses and ends sessions on behalf of the pipeline.
#[derive(Clone)]
pub struct SessionCoordinator {
    provider: Arc<dyn Provider>,
    store: Arc<dyn SessionStore>,
    policy: RetryPolicy,
}

impl SessionCoordinator {
    pub fn new(
        provider: Arc<dyn Provider>,
        store: Arc<dyn SessionStore>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            store,
            policy,
        }
    }

    /// Reuse `requested` or create a fresh session.
    ///
    /// Providers without session support get a local id so metrics still have
    /// somewhere to live; that id is never sent to the provider.
    #[instrument(skip_all, fields(provider = self.provider.name(), requested = ?requested))]
    pub async fn resolve(
        &self,
        requested: Option<&str>,
        context: &str,
        options: &ProviderOptions,
    ) -> Result<ResolvedSession, SessionError> {
        if let Some(id) = requested {
            return self.reuse(id, context).await;
        }

        if !self.provider.supports_sessions() {
            let id = uuid::Uuid::new_v4().to_string();
            debug!(session_id = %id, "Provider is stateless, tracking a local session");
            self.store
                .set(SessionData::new(&id, self.provider.name(), context, false))
                .await?;
            return Ok(ResolvedSession {
                id,
                provider_managed: false,
            });
        }

        let outcome = with_retry(&self.policy, |attempt| async move {
            debug!(attempt, "Creating provider session");
            self.provider
                .create_session(context, options)
                .await
                .map_err(PersuaderError::from)
        })
        .await;

        let id = outcome
            .result
            .map_err(|err| SessionError::new(format!("failed to create session: {err}")))?;

        info!(session_id = %id, "Created provider session");
        self.store
            .set(SessionData::new(&id, self.provider.name(), context, true))
            .await?;
        Ok(ResolvedSession {
            id,
            provider_managed: true,
        })
    }

    async fn reuse(&self, id: &str, context: &str) -> Result<ResolvedSession, SessionError> {
        match self.store.get(id).await? {
            Some(mut existing) => {
                existing.touch();
                let provider_managed = existing.provider_managed;
                self.store.set(existing).await?;
                debug!(session_id = %id, "Reusing session");
                Ok(ResolvedSession {
                    id: id.to_string(),
                    provider_managed,
                })
            }
            None => {
                // A caller-supplied id the store has not seen yet belongs to the provider.
                let provider_managed = self.provider.supports_sessions();
                self.store
                    .set(SessionData::new(id, self.provider.name(), context, provider_managed))
                    .await?;
                debug!(session_id = %id, provider_managed, "Registered caller session");
                Ok(ResolvedSession {
                    id: id.to_string(),
                    provider_managed,
                })
            }
        }
    }

    /// Forget a session and release it on the provider side.
    pub async fn end(&self, session_id: &str) -> Result<bool, SessionError> {
        let existing = self.store.get(session_id).await?;
        let Some(session) = existing else {
            return Ok(false);
        };

        if session.provider_managed {
            if let Err(err) = self.provider.destroy_session(session_id).await {
                warn!(session_id, error = %err, "Provider failed to destroy session");
            }
        }
        self.store.delete(session_id).await
    }

    pub async fn get(&self, session_id: &str) -> Result<Option<SessionData>, SessionError> {
        self.store.get(session_id).await
    }
}
