//! Per-session prompt execution.
//!
//! At most one prompt runs per session. A prompt moves through
//! `queued → running → (retrying → running)* → {completed|failed|cancelled}`,
//! with permission evaluated before `running` ever starts. Denial,
//! cancellation, and timeout all settle the prompt without emitting any
//! session-update notifications; only the successful path produces the
//! fixed lifecycle sequence (commands → plan → tool-call →
//! tool-call-update → message chunks).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::permission::{PermissionPolicy, PermissionRequester};
use crate::rpc::RequestId;
use crate::session::{
    BackendError, ContentBlock, ExecutionState, SessionBackend, SessionId, SessionNotification,
    SessionRegistry, SessionUpdate, StopReason, ToolCallStatus, TranscriptEntry, TurnOutcome,
    TurnScript,
};

/// Channel item: a notification plus the ack the sender waits on. The ack
/// is what guarantees a session update reaches the client before the
/// prompt's own result does.
pub type NotificationItem = (SessionNotification, oneshot::Sender<()>);

/// Hands session notifications to the transport plumbing and waits for
/// each to be acknowledged.
#[derive(Clone)]
pub struct Notifier {
    tx: mpsc::UnboundedSender<NotificationItem>,
}

impl Notifier {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<NotificationItem>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub async fn send(&self, notification: SessionNotification) -> Result<(), Error> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send((notification, ack_tx))
            .map_err(|_| Error::EndOfStream)?;
        ack_rx.await.map_err(|_| Error::EndOfStream)
    }
}

/// `session/prompt` parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptRequest {
    pub session_id: SessionId,
    pub prompt: Vec<ContentBlock>,
}

/// `session/prompt` result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptResponse {
    pub stop_reason: StopReason,
}

/// `session/stop` result. The stop request succeeds either way; `stopped`
/// records whether a prompt was actually in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub stopped: bool,
}

/// Engine tunables.
#[derive(Debug, Clone)]
pub struct PromptConfig {
    /// Transient-failure retries before the prompt fails.
    pub max_retries: u32,
    /// First retry delay; doubles per attempt.
    pub retry_base_delay: Duration,
    /// Overall deadline for backend execution. `None` disables it.
    pub timeout: Option<Duration>,
    /// Emit `executionStateUpdate` notifications alongside the lifecycle
    /// sequence.
    pub report_execution_state: bool,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(50),
            timeout: None,
            report_execution_state: false,
        }
    }
}

struct ActivePrompt {
    token: CancellationToken,
    request_key: Option<String>,
}

#[derive(Default)]
struct EngineState {
    active: HashMap<String, ActivePrompt>,
    pre_cancelled: HashSet<String>,
}

/// Drives prompt execution for every session.
pub struct PromptEngine {
    config: PromptConfig,
    policy: Arc<PermissionPolicy>,
    state: Mutex<EngineState>,
}

impl PromptEngine {
    pub fn new(config: PromptConfig, policy: Arc<PermissionPolicy>) -> Self {
        Self {
            config,
            policy,
            state: Mutex::new(EngineState::default()),
        }
    }

    /// Run one prompt to completion.
    ///
    /// `wire_id` is the id of the JSON-RPC request that carried the
    /// prompt, when there is one; protocol-level cancellation matches on
    /// it in either int or string form.
    pub async fn prompt(
        &self,
        registry: &SessionRegistry,
        notifier: &Notifier,
        requester: &dyn PermissionRequester,
        request: PromptRequest,
        wire_id: Option<&RequestId>,
    ) -> Result<PromptResponse, Error> {
        let backend = registry.backend(&request.session_id)?;

        let cancel = {
            let mut state = self.lock();
            if state.active.contains_key(request.session_id.as_str()) {
                return Err(Error::InvalidParams(format!(
                    "a prompt is already running for session {}",
                    request.session_id
                )));
            }

            // A cancel that raced ahead of us consumes itself now, and
            // only now: a later request with the same id starts clean.
            if let Some(id) = wire_id
                && state.pre_cancelled.remove(&id.canonical_key())
            {
                tracing::debug!(%id, "prompt consumed a pre-cancellation");
                return Ok(PromptResponse {
                    stop_reason: StopReason::Cancelled,
                });
            }

            let token = CancellationToken::new();
            state.active.insert(
                request.session_id.as_str().to_string(),
                ActivePrompt {
                    token: token.clone(),
                    request_key: wire_id.map(RequestId::canonical_key),
                },
            );
            token
        };

        let result = self
            .run_turn(registry, notifier, requester, &request, backend, &cancel)
            .await;

        self.lock().active.remove(request.session_id.as_str());
        result
    }

    /// Cancel the in-flight prompt for a session, if any. Idempotent.
    pub fn cancel_session(&self, session_id: &SessionId) -> bool {
        let state = self.lock();
        match state.active.get(session_id.as_str()) {
            Some(active) => {
                active.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Synchronous stop: returns its own result; the in-flight prompt
    /// then resolves as cancelled.
    pub fn stop(&self, session_id: &SessionId) -> StopResponse {
        StopResponse {
            stopped: self.cancel_session(session_id),
        }
    }

    /// Protocol-level cancel by request id. An int id and its textual
    /// form are equivalent here. When no matching request has been seen
    /// yet, the cancellation is stored and consumed exactly once by the
    /// next matching request.
    pub fn cancel_request(&self, id: &RequestId) {
        let key = id.canonical_key();
        let mut state = self.lock();
        for active in state.active.values() {
            if active.request_key.as_deref() == Some(key.as_str()) {
                active.token.cancel();
                return;
            }
        }
        tracing::debug!(%id, "storing pre-cancellation");
        state.pre_cancelled.insert(key);
    }

    /// Whether a stored pre-cancellation exists for this id.
    pub fn has_pre_cancellation(&self, id: &RequestId) -> bool {
        self.lock().pre_cancelled.contains(&id.canonical_key())
    }

    async fn run_turn(
        &self,
        registry: &SessionRegistry,
        notifier: &Notifier,
        requester: &dyn PermissionRequester,
        request: &PromptRequest,
        backend: Arc<tokio::sync::Mutex<Box<dyn SessionBackend>>>,
        cancel: &CancellationToken,
    ) -> Result<PromptResponse, Error> {
        let session_id = &request.session_id;

        // Staging is pure; the model/tool client is not consulted until
        // permission has been granted.
        let script: TurnScript = { backend.lock().await.stage(&request.prompt) };

        let verdict = self
            .policy
            .evaluate(session_id, &script.tool_call, requester)
            .await?;
        if !verdict.is_allowed() {
            tracing::info!(%session_id, "prompt denied by permission policy");
            return Ok(PromptResponse {
                stop_reason: StopReason::Cancelled,
            });
        }

        self.report_state(notifier, session_id, ExecutionState::Queued)
            .await?;
        self.report_state(notifier, session_id, ExecutionState::Running)
            .await?;

        let execute = self.execute_with_retries(notifier, session_id, &backend, &script, cancel);
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::info!(%session_id, "prompt cancelled during execution");
                return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
            }
            result = async {
                match self.config.timeout {
                    Some(limit) => match tokio::time::timeout(limit, execute).await {
                        Ok(result) => result,
                        Err(_) => Err(Error::Internal("prompt timed out".into())),
                    },
                    None => execute.await,
                }
            } => match result {
                // A backend error that races the cancel signal still
                // settles as cancelled: the caller observed cancellation.
                Err(_) if cancel.is_cancelled() => {
                    return Ok(PromptResponse { stop_reason: StopReason::Cancelled });
                }
                other => other?,
            },
        };

        self.emit_lifecycle(notifier, session_id, &script, &outcome, cancel)
            .await?;

        if cancel.is_cancelled() {
            return Ok(PromptResponse {
                stop_reason: StopReason::Cancelled,
            });
        }

        self.record_transcript(registry, request, &outcome)?;

        Ok(PromptResponse {
            stop_reason: outcome.stop_reason,
        })
    }

    async fn execute_with_retries(
        &self,
        notifier: &Notifier,
        session_id: &SessionId,
        backend: &Arc<tokio::sync::Mutex<Box<dyn SessionBackend>>>,
        script: &TurnScript,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, Error> {
        let mut attempt: u32 = 0;
        loop {
            let result = { backend.lock().await.execute(script, cancel).await };
            match result {
                Ok(outcome) => return Ok(outcome),
                Err(BackendError::Transient(reason)) if attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::warn!(%session_id, attempt, %reason, "transient failure, retrying");
                    self.report_state(notifier, session_id, ExecutionState::Retrying)
                        .await?;
                    notifier
                        .send(SessionNotification {
                            session_id: session_id.clone(),
                            update: SessionUpdate::Retry { attempt },
                        })
                        .await?;
                    tokio::time::sleep(self.config.retry_base_delay * 2u32.pow(attempt - 1)).await;
                    self.report_state(notifier, session_id, ExecutionState::Running)
                        .await?;
                }
                Err(BackendError::Transient(reason)) => {
                    return Err(Error::Internal(format!("retries exhausted: {reason}")));
                }
                Err(BackendError::Fatal(reason)) => {
                    return Err(Error::Internal(reason));
                }
            }
        }
    }

    /// The fixed notification sequence of a successful turn. Stops
    /// emitting (without error) the moment cancellation is observed.
    async fn emit_lifecycle(
        &self,
        notifier: &Notifier,
        session_id: &SessionId,
        script: &TurnScript,
        outcome: &TurnOutcome,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        let tool_call_id = format!("call:{}", Uuid::new_v4());

        let mut updates = vec![
            SessionUpdate::AvailableCommandsUpdate {
                available_commands: script.available_commands.clone(),
            },
            SessionUpdate::Plan {
                entries: script.plan.clone(),
            },
            SessionUpdate::ToolCall {
                tool_call_id: tool_call_id.clone(),
                title: script.tool_call.title.clone(),
                kind: script.tool_call.kind.clone(),
                status: ToolCallStatus::InProgress,
            },
            SessionUpdate::ToolCallUpdate {
                tool_call_id,
                status: ToolCallStatus::Completed,
                output: Some(outcome.tool_output.clone()),
            },
        ];
        updates.extend(outcome.chunks.iter().map(|chunk| {
            SessionUpdate::AgentMessageChunk {
                content: ContentBlock::text(chunk.clone()),
            }
        }));

        for update in updates {
            if cancel.is_cancelled() {
                return Ok(());
            }
            notifier
                .send(SessionNotification {
                    session_id: session_id.clone(),
                    update,
                })
                .await?;
        }

        self.report_state(notifier, session_id, ExecutionState::Completed)
            .await
    }

    fn record_transcript(
        &self,
        registry: &SessionRegistry,
        request: &PromptRequest,
        outcome: &TurnOutcome,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let mut entries: Vec<TranscriptEntry> = request
            .prompt
            .iter()
            .map(|block| TranscriptEntry {
                role: "user".into(),
                text: block.as_text().to_string(),
                at: now,
            })
            .collect();
        entries.extend(outcome.chunks.iter().map(|chunk| TranscriptEntry {
            role: "assistant".into(),
            text: chunk.clone(),
            at: now,
        }));
        registry.append_transcript(&request.session_id, entries)
    }

    async fn report_state(
        &self,
        notifier: &Notifier,
        session_id: &SessionId,
        state: ExecutionState,
    ) -> Result<(), Error> {
        if !self.config.report_execution_state {
            return Ok(());
        }
        notifier
            .send(SessionNotification {
                session_id: session_id.clone(),
                update: SessionUpdate::ExecutionStateUpdate { state },
            })
            .await
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
