//! Prompt execution: notification ordering, execution-state reporting,
//! retries, transcripts, and fork divergence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agora::Error;
use agora::permission::{OPTION_ALLOW_ONCE, PermissionMode, PermissionPolicy, PolicyConfig};
use agora::prompt::{Notifier, PromptConfig, PromptEngine, PromptRequest, PromptResponse};
use agora::session::{
    BackendFactory, ContentBlock, ExecutionState, RegistryConfig, SessionId, SessionRegistry,
    SessionUpdate, StopReason,
};
use agora_testlib::{EchoBackend, NotificationCollector, StaticRequester, echo_factory, factory_of};
use assert_matches::assert_matches;

#[derive(Clone)]
struct Harness {
    registry: Arc<SessionRegistry>,
    engine: Arc<PromptEngine>,
    notifier: Notifier,
    collector: NotificationCollector,
    requester: Arc<StaticRequester>,
}

fn harness_with(config: PromptConfig, factory: BackendFactory) -> Harness {
    agora_testlib::init_test_tracing();
    let registry = Arc::new(SessionRegistry::new(RegistryConfig::default(), factory));
    let policy = Arc::new(PermissionPolicy::new(PolicyConfig {
        mode: PermissionMode::Allow,
        fallback_allow_when_unavailable: false,
    }));
    let engine = Arc::new(PromptEngine::new(config, policy));
    let (notifier, collector) = NotificationCollector::spawn();
    Harness {
        registry,
        engine,
        notifier,
        collector,
        requester: Arc::new(StaticRequester::selecting(OPTION_ALLOW_ONCE)),
    }
}

fn harness() -> Harness {
    harness_with(PromptConfig::default(), echo_factory())
}

impl Harness {
    fn new_session(&self) -> SessionId {
        self.registry
            .new_session(PathBuf::from("/workspace"))
            .unwrap()
            .id
    }

    async fn prompt_text(
        &self,
        session: &SessionId,
        text: &str,
    ) -> Result<PromptResponse, Error> {
        self.engine
            .prompt(
                &self.registry,
                &self.notifier,
                self.requester.as_ref(),
                PromptRequest {
                    session_id: session.clone(),
                    prompt: vec![ContentBlock::text(text)],
                },
                None,
            )
            .await
    }
}

fn kind(update: &SessionUpdate) -> &'static str {
    match update {
        SessionUpdate::AvailableCommandsUpdate { .. } => "commands",
        SessionUpdate::Plan { .. } => "plan",
        SessionUpdate::ToolCall { .. } => "tool_call",
        SessionUpdate::ToolCallUpdate { .. } => "tool_call_update",
        SessionUpdate::AgentMessageChunk { .. } => "chunk",
        SessionUpdate::ExecutionStateUpdate { .. } => "state",
        SessionUpdate::Retry { .. } => "retry",
    }
}

#[tokio::test]
async fn successful_prompt_emits_the_fixed_lifecycle_order() {
    let harness = harness();
    let session = harness.new_session();

    let response = harness.prompt_text(&session, "hello").await.unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);

    // Every notification was acknowledged before the response returned,
    // so the full sequence is already visible here.
    let updates = harness.collector.collected();
    let kinds: Vec<&str> = updates.iter().map(|n| kind(&n.update)).collect();
    assert_eq!(
        kinds,
        ["commands", "plan", "tool_call", "tool_call_update", "chunk"]
    );

    assert_matches!(
        &updates[4].update,
        SessionUpdate::AgentMessageChunk { content } if content.as_text() == "hello"
    );
    for update in &updates {
        assert_eq!(update.session_id, session);
    }
}

#[tokio::test]
async fn execution_state_updates_bracket_the_lifecycle_when_enabled() {
    let harness = harness_with(
        PromptConfig {
            report_execution_state: true,
            ..PromptConfig::default()
        },
        echo_factory(),
    );
    let session = harness.new_session();

    harness.prompt_text(&session, "hello").await.unwrap();

    let updates = harness.collector.collected();
    let kinds: Vec<&str> = updates.iter().map(|n| kind(&n.update)).collect();
    assert_eq!(
        kinds,
        [
            "state", "state", "commands", "plan", "tool_call", "tool_call_update", "chunk",
            "state"
        ]
    );

    assert_matches!(
        updates[0].update,
        SessionUpdate::ExecutionStateUpdate { state: ExecutionState::Queued }
    );
    assert_matches!(
        updates[1].update,
        SessionUpdate::ExecutionStateUpdate { state: ExecutionState::Running }
    );
    assert_matches!(
        updates.last().unwrap().update,
        SessionUpdate::ExecutionStateUpdate { state: ExecutionState::Completed }
    );
}

#[tokio::test]
async fn retries_emit_exactly_one_update_per_attempt() {
    let harness = harness_with(
        PromptConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(10),
            ..PromptConfig::default()
        },
        factory_of(EchoBackend::with_transient_failures(2)),
    );
    let session = harness.new_session();

    let response = harness.prompt_text(&session, "hello").await.unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);

    let attempts: Vec<u32> = harness
        .collector
        .collected()
        .iter()
        .filter_map(|n| match n.update {
            SessionUpdate::Retry { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2]);
}

#[tokio::test]
async fn exhausted_retries_fail_with_an_internal_error() {
    let harness = harness_with(
        PromptConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(10),
            ..PromptConfig::default()
        },
        factory_of(EchoBackend::with_transient_failures(5)),
    );
    let session = harness.new_session();

    let error = harness.prompt_text(&session, "hello").await.unwrap_err();
    assert_matches!(error, Error::Internal(message) if message.contains("retries exhausted"));

    // Retry updates reflect attempts actually taken, not the configured
    // maximum, and no lifecycle notifications were emitted.
    let updates = harness.collector.collected();
    let attempts: Vec<u32> = updates
        .iter()
        .filter_map(|n| match n.update {
            SessionUpdate::Retry { attempt } => Some(attempt),
            _ => None,
        })
        .collect();
    assert_eq!(attempts, [1, 2]);
    assert!(updates.iter().all(|n| kind(&n.update) == "retry"));
}

#[tokio::test]
async fn prompts_accumulate_into_the_transcript() {
    let harness = harness();
    let session = harness.new_session();

    harness.prompt_text(&session, "alpha").await.unwrap();
    harness.prompt_text(&session, "gamma").await.unwrap();

    let transcript = harness.registry.transcript(&session).unwrap();
    let texts: Vec<(&str, &str)> = transcript
        .iter()
        .map(|entry| (entry.role.as_str(), entry.text.as_str()))
        .collect();
    assert_eq!(
        texts,
        [
            ("user", "alpha"),
            ("assistant", "alpha"),
            ("user", "gamma"),
            ("assistant", "alpha,gamma"),
        ]
    );
}

#[tokio::test]
async fn forked_sessions_diverge_without_cross_talk() {
    let harness = harness();
    let origin = harness.new_session();

    harness.prompt_text(&origin, "alpha").await.unwrap();
    let fork = harness
        .registry
        .fork(&origin, PathBuf::from("/workspace"))
        .await
        .unwrap()
        .id;

    harness.prompt_text(&origin, "gamma").await.unwrap();
    harness.prompt_text(&fork, "beta").await.unwrap();

    let origin_text = harness
        .registry
        .transcript(&origin)
        .unwrap()
        .iter()
        .map(|e| e.text.clone())
        .collect::<Vec<_>>()
        .join("\n");
    let fork_text = harness
        .registry
        .transcript(&fork)
        .unwrap()
        .iter()
        .map(|e| e.text.clone())
        .collect::<Vec<_>>()
        .join("\n");

    assert!(origin_text.contains("alpha,gamma"));
    assert!(!origin_text.contains("alpha,beta"));
    assert!(fork_text.contains("alpha,beta"));
    assert!(!fork_text.contains("gamma"));
}

#[tokio::test]
async fn a_second_concurrent_prompt_on_the_same_session_is_rejected() {
    let harness = harness_with(
        PromptConfig::default(),
        factory_of(EchoBackend::with_delay(Duration::from_millis(200))),
    );
    let session = harness.new_session();

    let first = {
        let harness = harness.clone();
        let session = session.clone();
        tokio::spawn(async move { harness.prompt_text(&session, "slow").await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = harness.prompt_text(&session, "eager").await;
    assert_matches!(second, Err(Error::InvalidParams(_)));

    // The original prompt is unaffected by the rejected one.
    let response = first.await.unwrap().unwrap();
    assert_eq!(response.stop_reason, StopReason::EndTurn);
}

#[tokio::test]
async fn prompting_an_unknown_session_is_invalid() {
    let harness = harness();
    let error = harness
        .prompt_text(&SessionId::new("ghost"), "hello")
        .await
        .unwrap_err();
    assert_matches!(error, Error::InvalidParams(_));
}
