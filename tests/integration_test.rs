// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! End-to-end: engine → workspace lifecycle → streaming session, with a
//! scripted provider standing in for the model API.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use mux_config::Config;
use mux_core::{ChatEvent, Command, CommandResponse, Engine, ProviderFactory, RawToken};
use mux_model::{ScriptedProvider, StreamChunk};

async fn git(repo: &Path, args: &[&str]) {
    let out = tokio::process::Command::new("git")
        .args(args)
        .current_dir(repo)
        .output()
        .await
        .unwrap();
    assert!(out.status.success(), "git {args:?}: {out:?}");
}

async fn test_repo(dir: &Path) -> PathBuf {
    let repo = dir.join("proj");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "-b", "main"]).await;
    git(&repo, &["config", "user.email", "t@example.com"]).await;
    git(&repo, &["config", "user.name", "T"]).await;
    std::fs::write(repo.join("README.md"), "# proj\n").unwrap();
    git(&repo, &["add", "."]).await;
    git(&repo, &["commit", "-m", "init"]).await;
    repo
}

#[tokio::test]
async fn full_flow_create_send_stream() {
    let dir = tempfile::tempdir().unwrap();
    let repo = test_repo(dir.path()).await;

    let provider = Arc::new(ScriptedProvider::new(vec![vec![
        Ok(StreamChunk::TextDelta("hello ".into())),
        Ok(StreamChunk::TextDelta("from mux".into())),
        Ok(StreamChunk::Done),
    ]]));
    let factory: ProviderFactory = {
        let provider: Arc<dyn mux_model::ChatProvider> = provider.clone();
        Arc::new(move |_| Ok(Arc::clone(&provider)))
    };

    let raw = RawToken::generate();
    let token = raw.as_str().to_string();
    let engine = Engine::new(
        Config::default(),
        None,
        dir.path().join("sessions"),
        raw.into_stored(),
        Some(factory),
    );

    // Create a workspace backed by a real git worktree.
    let meta = match engine
        .dispatch(
            &token,
            Command::CreateWorkspace {
                project_path: repo.to_string_lossy().into_owned(),
                title: "Greeting".into(),
                runtime: Some(mux_config::RuntimeConfig::Local {
                    src_base_dir: Some(
                        dir.path().join("worktrees").to_string_lossy().into_owned(),
                    ),
                }),
            },
        )
        .await
        .unwrap()
    {
        CommandResponse::Workspace(meta) => meta,
        _ => panic!("expected workspace metadata"),
    };
    assert!(meta.name.starts_with("greeting-"));

    // Subscribe, send, and watch the stream complete.
    let mut receiver = match engine
        .dispatch(
            &token,
            Command::SubscribeChat {
                workspace_id: meta.workspace_id.clone(),
            },
        )
        .await
        .unwrap()
    {
        CommandResponse::ChatSubscription { receiver, history, .. } => {
            assert!(history.is_empty());
            receiver
        }
        _ => panic!("expected chat subscription"),
    };

    engine
        .dispatch(
            &token,
            Command::SendMessage {
                workspace_id: meta.workspace_id.clone(),
                text: "say hello".into(),
                options: Default::default(),
                synthetic: false,
            },
        )
        .await
        .unwrap();

    let mut text = String::new();
    loop {
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), receiver.recv())
            .await
            .expect("timed out")
            .expect("channel closed");
        match event {
            ChatEvent::StreamDelta { delta, .. } => text.push_str(&delta),
            ChatEvent::StreamEnd { message, .. } => {
                assert_eq!(message.text(), "hello from mux");
                break;
            }
            ChatEvent::Error { error_type, message } => {
                panic!("stream failed ({error_type}): {message}")
            }
            _ => {}
        }
    }
    assert_eq!(text, "hello from mux");

    // History persisted in order with sequences.
    let session = engine.session_for(&meta.workspace_id).unwrap();
    let history = session.get_history().await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].metadata.history_sequence, Some(1));
    assert_eq!(history[1].metadata.history_sequence, Some(2));
    assert_eq!(history[1].text(), "hello from mux");
}
