//! Test harness for agora.
//!
//! Provides a deterministic in-process backend (the echo backend), canned
//! permission requesters, and a notification collector, so integration
//! tests can drive the runtime without a real model or transport.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agora::error::Error;
use agora::permission::{
    PermissionOutcome, PermissionRequestParams, PermissionRequester, ToolCallDescriptor,
};
use agora::prompt::Notifier;
use agora::session::{
    AvailableCommand, BackendError, BackendFactory, ContentBlock, PlanEntry, PlanEntryPriority,
    PlanEntryStatus, RegistryConfig, SessionBackend, SessionNotification, SessionRegistry,
    StopReason, TurnOutcome, TurnScript,
};
use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;

/// Install a fmt subscriber for test output. Safe to call repeatedly.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_test_writer()
        .try_init();
}

/// A deterministic backend: each executed turn appends the prompt to its
/// history and replies with the full history joined by commas. Forking
/// clones the accumulated history, so divergence between a session and
/// its fork is directly observable in the output.
#[derive(Clone)]
pub struct EchoBackend {
    history: Vec<String>,
    staged: Option<String>,
    /// Synthetic transient failures to emit before succeeding.
    pub transient_failures: u32,
    /// Extra latency per execution, observed under cancellation.
    pub delay: Option<Duration>,
    /// Never complete; only cancellation ends the turn.
    pub hang: bool,
    /// Raw input reported for the staged tool call. Fixed by default so
    /// every turn in a session shares one permission fingerprint.
    pub tool_input: serde_json::Value,
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            staged: None,
            transient_failures: 0,
            delay: None,
            hang: false,
            tool_input: json!({"command": "echo"}),
        }
    }
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transient_failures(n: u32) -> Self {
        Self {
            transient_failures: n,
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl SessionBackend for EchoBackend {
    fn stage(&mut self, prompt: &[ContentBlock]) -> TurnScript {
        let text = prompt
            .iter()
            .map(|block| block.as_text())
            .collect::<Vec<_>>()
            .join("\n");
        self.staged = Some(text);

        TurnScript {
            available_commands: vec![AvailableCommand {
                name: "echo".into(),
                description: "Echo the conversation so far".into(),
            }],
            plan: vec![PlanEntry {
                content: "echo the prompt".into(),
                priority: PlanEntryPriority::Medium,
                status: PlanEntryStatus::Pending,
            }],
            tool_call: ToolCallDescriptor {
                kind: "execute".into(),
                title: "echo".into(),
                locations: vec![],
                raw_input: self.tool_input.clone(),
            },
        }
    }

    async fn execute(
        &mut self,
        _script: &TurnScript,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, BackendError> {
        if self.hang {
            cancel.cancelled().await;
            return Err(BackendError::Fatal("cancelled".into()));
        }

        if let Some(delay) = self.delay {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BackendError::Fatal("cancelled".into())),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        if self.transient_failures > 0 {
            self.transient_failures -= 1;
            return Err(BackendError::Transient("synthetic upstream hiccup".into()));
        }

        if let Some(prompt) = self.staged.take() {
            self.history.push(prompt);
        }
        let joined = self.history.join(",");
        Ok(TurnOutcome {
            tool_output: json!({"echo": joined}),
            chunks: vec![joined],
            stop_reason: StopReason::EndTurn,
        })
    }

    fn fork(&self) -> Box<dyn SessionBackend> {
        Box::new(self.clone())
    }
}

/// Factory producing a fresh default echo backend per session.
pub fn echo_factory() -> BackendFactory {
    Box::new(|_| Ok(Box::new(EchoBackend::new())))
}

/// Factory cloning a preconfigured echo backend per session.
pub fn factory_of(backend: EchoBackend) -> BackendFactory {
    Box::new(move |_| Ok(Box::new(backend.clone())))
}

/// Registry with default config over echo backends.
pub fn echo_registry() -> SessionRegistry {
    SessionRegistry::new(RegistryConfig::default(), echo_factory())
}

/// Requester that always answers with a fixed outcome and records the
/// requests it saw.
pub struct StaticRequester {
    outcome: PermissionOutcome,
    seen: Mutex<Vec<PermissionRequestParams>>,
}

impl StaticRequester {
    pub fn selecting(option_id: &str) -> Self {
        Self {
            outcome: PermissionOutcome::Selected {
                option_id: option_id.into(),
            },
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn cancelling() -> Self {
        Self {
            outcome: PermissionOutcome::Cancelled,
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<PermissionRequestParams> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl PermissionRequester for StaticRequester {
    async fn request(&self, params: PermissionRequestParams) -> Result<PermissionOutcome, Error> {
        self.seen.lock().unwrap().push(params);
        Ok(self.outcome.clone())
    }
}

/// Requester whose bridge is unreachable.
pub struct FailingRequester;

#[async_trait]
impl PermissionRequester for FailingRequester {
    async fn request(&self, _params: PermissionRequestParams) -> Result<PermissionOutcome, Error> {
        Err(Error::PermissionTimeout)
    }
}

/// Drains a notifier channel, acking every notification and recording it
/// in arrival order.
#[derive(Clone)]
pub struct NotificationCollector {
    seen: Arc<Mutex<Vec<SessionNotification>>>,
}

impl NotificationCollector {
    /// Create a notifier wired to a background collector task.
    pub fn spawn() -> (Notifier, NotificationCollector) {
        let (notifier, mut rx) = Notifier::channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tokio::spawn(async move {
            while let Some((notification, ack)) = rx.recv().await {
                sink.lock().unwrap().push(notification);
                let _ = ack.send(());
            }
        });
        (notifier, NotificationCollector { seen })
    }

    pub fn collected(&self) -> Vec<SessionNotification> {
        self.seen.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
