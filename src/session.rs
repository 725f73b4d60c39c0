//! Session model and registry.
//!
//! A session is a stateful conversation context: its own mode, model,
//! config options, transcript, and tool registry, plus an injected
//! backend that does the actual model/tool reasoning (out of scope for
//! this crate). The registry owns every live session behind one lock and
//! exposes serialized operations; backends sit behind their own async
//! mutex so prompt execution never holds the registry lock across an
//! await.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::permission::ToolCallDescriptor;

/// Opaque session identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Prompt content. Only text blocks matter to this core; richer content
/// types pass through the backend untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
}

impl ContentBlock {
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }

    pub fn as_text(&self) -> &str {
        match self {
            ContentBlock::Text { text } => text,
        }
    }
}

/// Why a prompt stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    MaxTurnRequests,
    Refusal,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryPriority {
    High,
    Medium,
    Low,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanEntryStatus {
    Pending,
    InProgress,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEntry {
    pub content: String,
    pub priority: PlanEntryPriority,
    pub status: PlanEntryStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AvailableCommand {
    pub name: String,
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Observable lifecycle label of a prompt execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

/// One `session/update` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "sessionUpdate", rename_all = "snake_case")]
pub enum SessionUpdate {
    #[serde(rename_all = "camelCase")]
    AvailableCommandsUpdate {
        available_commands: Vec<AvailableCommand>,
    },
    Plan {
        entries: Vec<PlanEntry>,
    },
    #[serde(rename_all = "camelCase")]
    ToolCall {
        tool_call_id: String,
        title: String,
        kind: String,
        status: ToolCallStatus,
    },
    #[serde(rename_all = "camelCase")]
    ToolCallUpdate {
        tool_call_id: String,
        status: ToolCallStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
    },
    AgentMessageChunk {
        content: ContentBlock,
    },
    ExecutionStateUpdate {
        state: ExecutionState,
    },
    Retry {
        attempt: u32,
    },
}

/// A notification scoped to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionNotification {
    pub session_id: SessionId,
    pub update: SessionUpdate,
}

/// One turn of conversation, as stored in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub role: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// A tool registered with a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub kind: String,
}

/// Backend failure classification. Only transient failures are eligible
/// for the prompt engine's retry policy.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("transient upstream failure: {0}")]
    Transient(String),

    #[error("upstream failure: {0}")]
    Fatal(String),
}

/// A staged turn: everything the backend intends to do, computed without
/// invoking the model or any tool.
#[derive(Debug, Clone)]
pub struct TurnScript {
    pub available_commands: Vec<AvailableCommand>,
    pub plan: Vec<PlanEntry>,
    pub tool_call: ToolCallDescriptor,
}

/// What a turn produced once executed.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub tool_output: Value,
    pub chunks: Vec<String>,
    pub stop_reason: StopReason,
}

/// The per-session reasoning collaborator. Implementations own the LLM
/// completion/tool loop; this crate only drives them.
#[async_trait]
pub trait SessionBackend: Send {
    /// Stage the next turn. Must be side-effect free: the model and tools
    /// are not consulted until [`SessionBackend::execute`].
    fn stage(&mut self, prompt: &[ContentBlock]) -> TurnScript;

    /// Execute a staged turn. Long-running work must watch `cancel` and
    /// unwind promptly once it fires.
    async fn execute(
        &mut self,
        script: &TurnScript,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, BackendError>;

    /// Snapshot this backend for a forked session. Subsequent mutation of
    /// either copy must not be observable from the other.
    fn fork(&self) -> Box<dyn SessionBackend>;
}

/// Constructs the backend for a freshly created session.
pub type BackendFactory =
    Box<dyn Fn(&SessionState) -> Result<Box<dyn SessionBackend>, Error> + Send + Sync>;

/// Full state of one session.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: SessionId,
    pub cwd: PathBuf,
    pub parent_session_id: Option<SessionId>,
    pub mode: String,
    pub current_model: String,
    pub available_models: Vec<String>,
    pub config_options: BTreeMap<String, Value>,
    pub transcript: Vec<TranscriptEntry>,
    pub tools: Vec<ToolDescriptor>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionState {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Row returned by `session/list`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub cwd: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_session_id: Option<SessionId>,
    pub created_at: DateTime<Utc>,
}

/// One page of `session/list` results.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionPage {
    pub sessions: Vec<SessionSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportHeader<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    session_id: &'a SessionId,
    cwd: &'a PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_session_id: Option<&'a SessionId>,
    mode: &'a str,
    current_model: &'a str,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct ExportEntry<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    role: &'a str,
    text: &'a str,
    at: DateTime<Utc>,
}

/// Registry configuration.
#[derive(Clone)]
pub struct RegistryConfig {
    pub page_size: usize,
    pub session_ttl: chrono::Duration,
    pub default_mode: String,
    pub default_model: String,
    pub available_models: Vec<String>,
    pub initial_tools: Vec<ToolDescriptor>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            session_ttl: chrono::Duration::hours(8),
            default_mode: "default".into(),
            default_model: "default".into(),
            available_models: vec!["default".into()],
            initial_tools: Vec::new(),
        }
    }
}

struct SessionRecord {
    state: SessionState,
    backend: Arc<tokio::sync::Mutex<Box<dyn SessionBackend>>>,
}

struct RegistryState {
    sessions: HashMap<String, SessionRecord>,
    order: Vec<String>,
}

/// Owns every live session; all operations are serialized through one
/// lock.
pub struct SessionRegistry {
    config: RegistryConfig,
    factory: BackendFactory,
    state: Mutex<RegistryState>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig, factory: BackendFactory) -> Self {
        Self {
            config,
            factory,
            state: Mutex::new(RegistryState {
                sessions: HashMap::new(),
                order: Vec::new(),
            }),
        }
    }

    /// Allocate a fresh session rooted at `cwd`.
    pub fn new_session(&self, cwd: PathBuf) -> Result<SessionState, Error> {
        let now = Utc::now();
        let state = SessionState {
            id: SessionId::generate(),
            cwd,
            parent_session_id: None,
            mode: self.config.default_mode.clone(),
            current_model: self.config.default_model.clone(),
            available_models: self.config.available_models.clone(),
            config_options: BTreeMap::new(),
            transcript: Vec::new(),
            tools: self.config.initial_tools.clone(),
            created_at: now,
            expires_at: now + self.config.session_ttl,
        };

        let backend = (self.factory)(&state)
            .map_err(|e| Error::Internal(format!("session factory failed: {e}")))?;

        let mut registry = self.lock();
        registry.order.push(state.id.as_str().to_string());
        registry.sessions.insert(
            state.id.as_str().to_string(),
            SessionRecord {
                state: state.clone(),
                backend: Arc::new(tokio::sync::Mutex::new(backend)),
            },
        );
        tracing::info!(session_id = %state.id, "created session");
        Ok(state)
    }

    /// Look up a session for `session/load`. Expired sessions are
    /// logically invalid here even though the record still exists.
    pub fn load(&self, id: &SessionId) -> Result<SessionState, Error> {
        let registry = self.lock();
        let record = registry
            .sessions
            .get(id.as_str())
            .ok_or_else(|| Error::InvalidParams(format!("unknown session: {id}")))?;
        if record.state.is_expired(Utc::now()) {
            return Err(Error::InvalidParams(format!("session expired: {id}")));
        }
        Ok(record.state.clone())
    }

    /// Whether a session exists at all (expired or not).
    pub fn exists(&self, id: &SessionId) -> bool {
        self.lock().sessions.contains_key(id.as_str())
    }

    /// Page through sessions in creation order.
    pub fn list(&self, cursor: Option<&str>) -> Result<SessionPage, Error> {
        let registry = self.lock();
        let offset = match cursor {
            None => 0,
            Some(token) => token
                .parse::<usize>()
                .ok()
                .filter(|offset| *offset <= registry.order.len())
                .ok_or_else(|| Error::InvalidParams(format!("unrecognized cursor: {token}")))?,
        };

        let end = (offset + self.config.page_size).min(registry.order.len());
        let sessions = registry.order[offset..end]
            .iter()
            .filter_map(|id| registry.sessions.get(id))
            .map(|record| SessionSummary {
                session_id: record.state.id.clone(),
                cwd: record.state.cwd.clone(),
                parent_session_id: record.state.parent_session_id.clone(),
                created_at: record.state.created_at,
            })
            .collect();

        let next_cursor = (end < registry.order.len()).then(|| end.to_string());
        Ok(SessionPage {
            sessions,
            next_cursor,
        })
    }

    /// Fork a session: fresh id, parent link, snapshot copies of the
    /// transcript, tool registry, and backend state.
    pub async fn fork(&self, id: &SessionId, cwd: PathBuf) -> Result<SessionState, Error> {
        let (source_state, source_backend) = {
            let registry = self.lock();
            let record = registry
                .sessions
                .get(id.as_str())
                .ok_or_else(|| Error::InvalidParams(format!("unknown session: {id}")))?;
            (record.state.clone(), Arc::clone(&record.backend))
        };

        let forked_backend = source_backend.lock().await.fork();

        let now = Utc::now();
        let state = SessionState {
            id: SessionId::generate(),
            cwd,
            parent_session_id: Some(source_state.id.clone()),
            mode: source_state.mode,
            current_model: source_state.current_model,
            available_models: source_state.available_models,
            config_options: source_state.config_options,
            transcript: source_state.transcript,
            tools: source_state.tools,
            created_at: now,
            expires_at: now + self.config.session_ttl,
        };

        let mut registry = self.lock();
        registry.order.push(state.id.as_str().to_string());
        registry.sessions.insert(
            state.id.as_str().to_string(),
            SessionRecord {
                state: state.clone(),
                backend: Arc::new(tokio::sync::Mutex::new(forked_backend)),
            },
        );
        tracing::info!(session_id = %state.id, parent = %id, "forked session");
        Ok(state)
    }

    /// Remove a session. Idempotent: deleting an unknown id is not an
    /// error.
    pub fn delete(&self, id: &SessionId) -> bool {
        let mut registry = self.lock();
        let removed = registry.sessions.remove(id.as_str()).is_some();
        if removed {
            registry.order.retain(|existing| existing != id.as_str());
            tracing::info!(session_id = %id, "deleted session");
        }
        removed
    }

    /// Serialize a session's transcript as newline-delimited JSON,
    /// starting with a `{"type":"session"}` header record.
    pub fn export(&self, id: &SessionId) -> Result<String, Error> {
        let registry = self.lock();
        let record = registry
            .sessions
            .get(id.as_str())
            .ok_or_else(|| Error::InvalidParams(format!("unknown session: {id}")))?;

        let mut out = String::new();
        let header = ExportHeader {
            kind: "session",
            session_id: &record.state.id,
            cwd: &record.state.cwd,
            parent_session_id: record.state.parent_session_id.as_ref(),
            mode: &record.state.mode,
            current_model: &record.state.current_model,
            created_at: record.state.created_at,
        };
        out.push_str(
            &serde_json::to_string(&header)
                .map_err(|e| Error::Internal(format!("failed to encode export header: {e}")))?,
        );
        out.push('\n');

        for entry in &record.state.transcript {
            let line = ExportEntry {
                kind: "entry",
                role: &entry.role,
                text: &entry.text,
                at: entry.at,
            };
            out.push_str(
                &serde_json::to_string(&line)
                    .map_err(|e| Error::Internal(format!("failed to encode export entry: {e}")))?,
            );
            out.push('\n');
        }
        Ok(out)
    }

    pub fn set_mode(&self, id: &SessionId, mode: String) -> Result<(), Error> {
        self.with_record_mut(id, |record| {
            record.state.mode = mode;
            Ok(())
        })
    }

    pub fn set_model(&self, id: &SessionId, model: String) -> Result<(), Error> {
        self.with_record_mut(id, |record| {
            if !record.state.available_models.contains(&model) {
                return Err(Error::InvalidParams(format!("unknown model: {model}")));
            }
            record.state.current_model = model;
            Ok(())
        })
    }

    pub fn set_config_option(&self, id: &SessionId, key: String, value: Value) -> Result<(), Error> {
        self.with_record_mut(id, |record| {
            record.state.config_options.insert(key, value);
            Ok(())
        })
    }

    pub fn register_tool(&self, id: &SessionId, tool: ToolDescriptor) -> Result<(), Error> {
        self.with_record_mut(id, |record| {
            record.state.tools.push(tool);
            Ok(())
        })
    }

    /// Remove a tool by name. Returns whether it was present.
    pub fn unregister_tool(&self, id: &SessionId, name: &str) -> Result<bool, Error> {
        self.with_record_mut(id, |record| {
            let before = record.state.tools.len();
            record.state.tools.retain(|tool| tool.name != name);
            Ok(record.state.tools.len() != before)
        })
    }

    pub fn tools(&self, id: &SessionId) -> Result<Vec<ToolDescriptor>, Error> {
        self.with_record_mut(id, |record| Ok(record.state.tools.clone()))
    }

    pub fn transcript(&self, id: &SessionId) -> Result<Vec<TranscriptEntry>, Error> {
        self.with_record_mut(id, |record| Ok(record.state.transcript.clone()))
    }

    pub fn append_transcript(
        &self,
        id: &SessionId,
        entries: Vec<TranscriptEntry>,
    ) -> Result<(), Error> {
        self.with_record_mut(id, |record| {
            record.state.transcript.extend(entries);
            Ok(())
        })
    }

    /// The backend slot for a session; callers lock it for the duration
    /// of a turn.
    pub fn backend(
        &self,
        id: &SessionId,
    ) -> Result<Arc<tokio::sync::Mutex<Box<dyn SessionBackend>>>, Error> {
        let registry = self.lock();
        registry
            .sessions
            .get(id.as_str())
            .map(|record| Arc::clone(&record.backend))
            .ok_or_else(|| Error::InvalidParams(format!("unknown session: {id}")))
    }

    /// Drop every session (logout). Returns the ids that were cleared so
    /// the caller can also clear permission memory.
    pub fn clear(&self) -> Vec<SessionId> {
        let mut registry = self.lock();
        registry.order.clear();
        registry
            .sessions
            .drain()
            .map(|(id, _)| SessionId::new(id))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }

    fn with_record_mut<R>(
        &self,
        id: &SessionId,
        f: impl FnOnce(&mut SessionRecord) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut registry = self.lock();
        let record = registry
            .sessions
            .get_mut(id.as_str())
            .ok_or_else(|| Error::InvalidParams(format!("unknown session: {id}")))?;
        f(record)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
