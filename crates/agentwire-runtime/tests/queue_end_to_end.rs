#![cfg(unix)]
#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

//! Queue manager driving real subprocess transports.

mod common;

use std::sync::Arc;

use agentwire_core::AgentOptions;
use agentwire_core::config::{QueueConfig, TransportConfig};
use agentwire_core::ndjson::Message;
use agentwire_runtime::{
    MessageStatus, QueryError, QueryHandle, QueueManager, SubprocessTransportFactory,
};

use common::fake_agent;

fn manager(dir: &tempfile::TempDir) -> QueueManager {
    let options = AgentOptions {
        cli_path: Some(fake_agent(dir.path())),
        ..AgentOptions::default()
    };
    let factory = Arc::new(SubprocessTransportFactory::new(
        options,
        TransportConfig::default(),
    ));
    QueueManager::new(
        factory,
        QueueConfig {
            poll_interval_ms: 20,
            ..QueueConfig::default()
        },
    )
}

async fn reply_text(handle: &QueryHandle) -> String {
    let mut rx = handle.take_messages().unwrap();
    let mut text = String::new();
    while let Some(msg) = rx.recv().await {
        if let Message::Assistant(a) = msg {
            text.push_str(&a.text());
        }
    }
    text
}

#[tokio::test]
async fn prompts_are_answered_in_order() {
    let dir = tempfile::TempDir::new().unwrap();
    let m = manager(&dir);

    let mut handles = Vec::new();
    for prompt in ["one", "two", "three"] {
        handles.push(m.enqueue("e2e", prompt).await.unwrap());
    }
    for (handle, prompt) in handles.iter().zip(["one", "two", "three"]) {
        assert_eq!(reply_text(handle).await, format!("echo: {prompt}"));
        assert_eq!(handle.wait().await, Ok(()));
    }

    m.close().await.unwrap();
}

#[tokio::test]
async fn crashed_agent_is_restarted_for_next_prompt() {
    let dir = tempfile::TempDir::new().unwrap();
    let m = manager(&dir);

    let doomed = m.enqueue("e2e", "die").await.unwrap();
    let survivor = m.enqueue("e2e", "still here").await.unwrap();

    let err = doomed.wait().await.unwrap_err();
    assert!(
        matches!(err, QueryError::Transport(ref text) if text.contains("asked to die")),
        "{err:?}"
    );
    assert_eq!(reply_text(&survivor).await, "echo: still here");
    assert_eq!(survivor.wait().await, Ok(()));

    let doomed_entry = m.get_message("e2e", doomed.id()).await.unwrap();
    assert_eq!(doomed_entry.status, MessageStatus::Failed);
    m.close().await.unwrap();
}

#[tokio::test]
async fn close_terminates_idle_agents() {
    let dir = tempfile::TempDir::new().unwrap();
    let m = manager(&dir);

    m.enqueue("a", "x").await.unwrap().wait().await.unwrap();
    m.enqueue("b", "y").await.unwrap().wait().await.unwrap();
    assert_eq!(m.sessions().await, vec!["a", "b"]);

    m.close().await.unwrap();
    assert!(m.sessions().await.is_empty());
}
