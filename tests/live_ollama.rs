//! Live backend tests
//!
//! Need a running Ollama server with the configured model pulled.
//! Run with: cargo test --test live_ollama -- --ignored

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use gantry::agent::{Conversation, SessionConfig};
use gantry::core::{Config, Part};
use gantry::llm::{GenerateConfig, OllamaClient};
use gantry::Agent;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

fn conversation(config: &Config) -> Conversation {
    let client = OllamaClient::from_config(config).expect("client should build");
    Conversation::new(
        Arc::new(client),
        config.model.model.clone(),
        GenerateConfig::default(),
        Vec::new(),
        SessionConfig::from(config),
    )
}

#[tokio::test]
#[ignore]
async fn test_simple_question() {
    let config = Config::load();
    let chat = conversation(&config);

    let response = timeout(
        Duration::from_secs(120),
        chat.send_message(vec![Part::text("What is 2 + 2? Answer with the number only.")], "live#1"),
    )
    .await
    .expect("timed out")
    .expect("request failed");

    assert!(response.text().contains('4'));
    assert_eq!(chat.get_history(false).len(), 2);
}

#[tokio::test]
#[ignore]
async fn test_streamed_answer() {
    let config = Config::load();
    let chat = conversation(&config);

    let stream = chat
        .send_message_stream(
            vec![Part::text("Name one primary color.")],
            "live#2",
            CancellationToken::new(),
        )
        .await
        .expect("stream should open");
    let chunks = timeout(Duration::from_secs(120), stream.collect::<Vec<_>>()).await.expect("timed out");

    assert!(chunks.iter().all(|chunk| chunk.is_ok()));
    assert_eq!(chat.get_history(false).len(), 2);
}

#[tokio::test]
#[ignore]
async fn test_agent_runs_shell_tool() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("needle.txt"), "found me").unwrap();

    let mut agent = Agent::new(Config::load())
        .expect("agent should build")
        .with_workspace(dir.path());
    let answer = timeout(
        Duration::from_secs(300),
        agent.process(
            "Use the shell to print the contents of needle.txt, then tell me what it says.",
            CancellationToken::new(),
        ),
    )
    .await
    .expect("timed out")
    .expect("agent failed");

    assert!(answer.to_lowercase().contains("found me"));
}
