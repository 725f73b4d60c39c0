//! Session registry behavior: creation, paging, TTL, fork isolation,
//! deletion, and export.

use std::path::PathBuf;
use std::time::Duration;

use agora::Error;
use agora::session::{RegistryConfig, SessionId, SessionRegistry, ToolDescriptor, TranscriptEntry};
use agora_testlib::echo_factory;
use assert_matches::assert_matches;
use chrono::Utc;

fn registry_with(config: RegistryConfig) -> SessionRegistry {
    SessionRegistry::new(config, echo_factory())
}

fn cwd() -> PathBuf {
    PathBuf::from("/workspace")
}

#[tokio::test]
async fn new_sessions_start_from_defaults() {
    let registry = registry_with(RegistryConfig::default());
    let state = registry.new_session(cwd()).unwrap();

    assert_eq!(state.mode, "default");
    assert_eq!(state.current_model, "default");
    assert!(state.parent_session_id.is_none());
    assert!(state.transcript.is_empty());
    assert!(registry.exists(&state.id));
}

#[tokio::test]
async fn list_pages_in_creation_order() {
    let registry = registry_with(RegistryConfig {
        page_size: 2,
        ..RegistryConfig::default()
    });

    let mut created = Vec::new();
    for _ in 0..5 {
        created.push(registry.new_session(cwd()).unwrap().id);
    }

    let first = registry.list(None).unwrap();
    assert_eq!(first.sessions.len(), 2);
    assert_eq!(first.sessions[0].session_id, created[0]);
    assert_eq!(first.sessions[1].session_id, created[1]);
    let cursor = first.next_cursor.expect("more pages remain");

    let second = registry.list(Some(&cursor)).unwrap();
    assert_eq!(second.sessions.len(), 2);
    assert_eq!(second.sessions[0].session_id, created[2]);
    let cursor = second.next_cursor.expect("one more page remains");

    let last = registry.list(Some(&cursor)).unwrap();
    assert_eq!(last.sessions.len(), 1);
    assert_eq!(last.sessions[0].session_id, created[4]);
    assert!(last.next_cursor.is_none());
}

#[tokio::test]
async fn unrecognized_cursors_fail_validation() {
    let registry = registry_with(RegistryConfig::default());
    registry.new_session(cwd()).unwrap();

    assert_matches!(registry.list(Some("bogus")), Err(Error::InvalidParams(_)));
    assert_matches!(registry.list(Some("-3")), Err(Error::InvalidParams(_)));
    assert_matches!(registry.list(Some("999")), Err(Error::InvalidParams(_)));
}

#[tokio::test]
async fn load_rejects_unknown_and_expired_sessions() {
    let registry = registry_with(RegistryConfig {
        session_ttl: chrono::Duration::milliseconds(50),
        ..RegistryConfig::default()
    });

    assert_matches!(
        registry.load(&SessionId::new("nope")),
        Err(Error::InvalidParams(_))
    );

    let state = registry.new_session(cwd()).unwrap();
    registry.load(&state.id).unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    assert_matches!(registry.load(&state.id), Err(Error::InvalidParams(_)));
    // Expiry makes the id logically invalid without deleting the record.
    assert!(registry.exists(&state.id));
}

#[tokio::test]
async fn fork_links_parent_and_isolates_tool_state() {
    let registry = registry_with(RegistryConfig {
        initial_tools: vec![
            ToolDescriptor {
                name: "grep".into(),
                kind: "search".into(),
            },
            ToolDescriptor {
                name: "edit".into(),
                kind: "edit".into(),
            },
        ],
        ..RegistryConfig::default()
    });

    let origin = registry.new_session(cwd()).unwrap();
    let fork = registry.fork(&origin.id, cwd()).await.unwrap();
    assert_eq!(fork.parent_session_id.as_ref(), Some(&origin.id));

    // Unregistering on either side must not be observable from the other.
    assert!(registry.unregister_tool(&fork.id, "grep").unwrap());
    let origin_tools = registry.tools(&origin.id).unwrap();
    assert!(origin_tools.iter().any(|tool| tool.name == "grep"));

    assert!(registry.unregister_tool(&origin.id, "edit").unwrap());
    let fork_tools = registry.tools(&fork.id).unwrap();
    assert!(fork_tools.iter().any(|tool| tool.name == "edit"));
    assert_eq!(fork_tools.len(), 1);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let registry = registry_with(RegistryConfig::default());
    let state = registry.new_session(cwd()).unwrap();

    assert!(registry.delete(&state.id));
    assert!(!registry.delete(&state.id));
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test]
async fn export_emits_a_session_header_then_one_record_per_entry() {
    let registry = registry_with(RegistryConfig::default());
    let state = registry.new_session(cwd()).unwrap();
    registry
        .append_transcript(
            &state.id,
            vec![
                TranscriptEntry {
                    role: "user".into(),
                    text: "hello".into(),
                    at: Utc::now(),
                },
                TranscriptEntry {
                    role: "assistant".into(),
                    text: "hello back".into(),
                    at: Utc::now(),
                },
            ],
        )
        .unwrap();

    let exported = registry.export(&state.id).unwrap();
    let lines: Vec<&str> = exported.lines().collect();
    assert_eq!(lines.len(), 3);

    let header: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
    assert_eq!(header["type"], "session");
    assert_eq!(header["sessionId"], state.id.as_str());

    let first: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
    assert_eq!(first["type"], "entry");
    assert_eq!(first["role"], "user");
    assert_eq!(first["text"], "hello");

    let second: serde_json::Value = serde_json::from_str(lines[2]).unwrap();
    assert_eq!(second["role"], "assistant");
}

#[tokio::test]
async fn set_model_validates_against_available_models() {
    let registry = registry_with(RegistryConfig {
        default_model: "base".into(),
        available_models: vec!["base".into(), "fast".into()],
        ..RegistryConfig::default()
    });
    let state = registry.new_session(cwd()).unwrap();

    registry.set_model(&state.id, "fast".into()).unwrap();
    assert_eq!(registry.load(&state.id).unwrap().current_model, "fast");

    assert_matches!(
        registry.set_model(&state.id, "imaginary".into()),
        Err(Error::InvalidParams(_))
    );
}

#[tokio::test]
async fn clear_drops_every_session() {
    let registry = registry_with(RegistryConfig::default());
    let a = registry.new_session(cwd()).unwrap();
    let b = registry.new_session(cwd()).unwrap();

    let mut cleared = registry.clear();
    cleared.sort_by(|x, y| x.as_str().cmp(y.as_str()));
    let mut expected = vec![a.id, b.id];
    expected.sort_by(|x, y| x.as_str().cmp(y.as_str()));
    assert_eq!(cleared, expected);
    assert_eq!(registry.session_count(), 0);
}
