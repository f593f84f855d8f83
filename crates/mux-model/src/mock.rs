// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::error::{StreamError, StreamErrorKind};
use crate::provider::{ChatProvider, ChatRequest, ChunkStream, StreamChunk};

/// A pre-scripted provider. Each `stream_chat` call pops the next script
/// from the front of the queue, so tests can specify exact chunk sequences —
/// tool calls, usage, mid-stream errors — without network access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Script>>>,
    name: String,
    model: String,
    /// The requests seen by this provider, captured for assertions.
    pub requests: Arc<Mutex<Vec<ChatRequest>>>,
}

enum Script {
    /// Open the stream and yield these items.
    Chunks(Vec<Result<StreamChunk, StreamError>>),
    /// Fail the `stream_chat` call itself (connection-level failure).
    ConnectError(StreamError),
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<Result<StreamChunk, StreamError>>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts.into_iter().map(Script::Chunks).collect())),
            name: "scripted".into(),
            model: "scripted-model".into(),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// A provider that replies with a single text message then `Done`.
    pub fn text_reply(text: &str) -> Self {
        Self::new(vec![vec![
            Ok(StreamChunk::TextDelta(text.to_string())),
            Ok(StreamChunk::Done),
        ]])
    }

    /// Push a connection-level failure script (fails before any chunk).
    pub fn push_connect_error(&self, err: StreamError) {
        self.scripts.lock().unwrap().push(Script::ConnectError(err));
    }

    /// Push a chunk script to the end of the queue.
    pub fn push_script(&self, chunks: Vec<Result<StreamChunk, StreamError>>) {
        self.scripts.lock().unwrap().push(Script::Chunks(chunks));
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.requests.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ChatProvider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    async fn stream_chat(&self, req: ChatRequest) -> Result<ChunkStream, StreamError> {
        self.requests.lock().unwrap().push(req);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                Script::Chunks(vec![Ok(StreamChunk::Done)])
            } else {
                scripts.remove(0)
            }
        };
        match script {
            Script::ConnectError(e) => Err(e),
            Script::Chunks(chunks) => Ok(Box::pin(stream::iter(chunks))),
        }
    }
}

/// Shorthand for a scripted network error item.
pub fn network_error(msg: &str) -> StreamError {
    StreamError::new(
        StreamErrorKind::Network {
            raw: msg.to_string(),
        },
        msg,
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
