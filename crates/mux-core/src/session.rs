// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace orchestrator.
//!
//! One session per active workspace: it owns the message queue, the retry
//! scheduler, and the stream driver; transforms history for the provider;
//! resolves the tool set; and keeps the stream state machine honest:
//!
//! ```text
//! idle ──send──▶ streaming ──stream-end──▶ idle
//! streaming ──stop──▶ interrupted ──send──▶ streaming
//! streaming ──error (retryable)──▶ retrying ──timer──▶ streaming
//! streaming ──error (non-retryable)──▶ failed ──send──▶ streaming
//! retrying ──cancel/disable──▶ idle
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, warn};

use mux_config::{
    AiDefaults, AiSettings, Experiments, RuntimeConfig, SessionMode, ThinkingLevel,
    ToolPolicyConfig,
};
use mux_model::{
    parse_model_string, persists_response_ids, supports_cache_markers, ChatProvider, Message,
    ModelRef, Part, ProviderOptions, Role, StreamError,
};
use mux_store::{HistoryStore, PartialStore};
use mux_tools::{
    discover_subagents, resolve_tools, ResolveParams, Tool, ToolCtx, ToolPolicy,
};

use crate::events::{ChatEvent, StreamState};
use crate::prompts::{system_prompt, PromptContext};
use crate::retry::RetryManager;
use crate::stream_manager::{
    StartStreamParams, StopOptions, StreamManager, StreamOutcome, StreamStartError,
};
use crate::task_tool::TaskTool;
use crate::transform::{transform_history, TransformOptions};

pub type ProviderFactory =
    Arc<dyn Fn(&ModelRef) -> std::result::Result<Arc<dyn ChatProvider>, StreamError> + Send + Sync>;

/// Static facts a session is built from.
#[derive(Clone)]
pub struct SessionConfig {
    pub workspace_id: String,
    pub workspace_name: String,
    pub workspace_path: PathBuf,
    pub project_name: String,
    pub project_path: PathBuf,
    pub runtime: Option<RuntimeConfig>,
    pub defaults: AiDefaults,
    pub experiments: Experiments,
    pub ai: AiSettings,
    pub secrets: HashMap<String, String>,
}

/// Per-send options; anything unset falls back to workspace/process
/// defaults.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SendOptions {
    /// Resubmit: drop this message and everything after it first.
    pub edit_message_id: Option<String>,
    pub model: Option<String>,
    pub mode: Option<SessionMode>,
    pub thinking_level: Option<ThinkingLevel>,
    pub tool_policy: Option<ToolPolicyConfig>,
    pub additional_instructions: Option<String>,
    /// `(path, content, media_type)` file attachments.
    pub attachments: Vec<(String, String, String)>,
    /// `(url, media_type)` images.
    pub images: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub text: String,
    pub options: SendOptions,
    pub synthetic: bool,
}

pub struct AgentSession {
    cfg: SessionConfig,
    history: Arc<HistoryStore>,
    partials: Arc<PartialStore>,
    stream: Arc<StreamManager>,
    retry: RetryManager,
    provider_factory: ProviderFactory,
    mcp_tools: Vec<Arc<dyn Tool>>,
    state_tx: watch::Sender<StreamState>,
    queue: Mutex<VecDeque<QueuedMessage>>,
    /// Queued messages moved back into a user-visible slot on interrupt.
    draft: Mutex<Vec<QueuedMessage>>,
    /// Options of the last real send, reused by resume.
    last_send: Mutex<Option<SendOptions>>,
    /// External file edits to surface on the next turn.
    file_change_notices: Mutex<Vec<String>>,
    lost_response_ids: Mutex<HashSet<String>>,
}

impl AgentSession {
    pub fn new(
        cfg: SessionConfig,
        history: Arc<HistoryStore>,
        partials: Arc<PartialStore>,
        provider_factory: ProviderFactory,
        mcp_tools: Vec<Arc<dyn Tool>>,
    ) -> Arc<Self> {
        let stream = StreamManager::new(cfg.workspace_id.clone(), Arc::clone(&history), Arc::clone(&partials));
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        let retry = RetryManager::new(
            cfg.defaults.retry_base_ms,
            cfg.defaults.retry_cap_ms,
            stream.event_sender(),
            retry_tx,
        );
        if !cfg.defaults.auto_retry {
            retry.set_enabled(false);
        }
        let (state_tx, _) = watch::channel(StreamState::Idle);

        let session = Arc::new(Self {
            cfg,
            history,
            partials,
            stream,
            retry,
            provider_factory,
            mcp_tools,
            state_tx,
            queue: Mutex::new(VecDeque::new()),
            draft: Mutex::new(Vec::new()),
            last_send: Mutex::new(None),
            file_change_notices: Mutex::new(Vec::new()),
            lost_response_ids: Mutex::new(HashSet::new()),
        });
        Self::spawn_retry_listener(Arc::downgrade(&session), retry_rx);
        session
    }

    fn spawn_retry_listener(
        session: Weak<AgentSession>,
        mut retry_rx: mpsc::UnboundedReceiver<u32>,
    ) {
        tokio::spawn(async move {
            while let Some(attempt) = retry_rx.recv().await {
                let Some(session) = session.upgrade() else {
                    return;
                };
                debug!(attempt, workspace = %session.cfg.workspace_id, "auto-retry firing");
                if let Err(e) = session.resume_stream().await {
                    warn!(workspace = %session.cfg.workspace_id, error = %e, "auto-retry resume failed");
                }
            }
        });
    }

    // ── Introspection ────────────────────────────────────────────────────────

    pub fn workspace_id(&self) -> &str {
        &self.cfg.workspace_id
    }

    pub fn is_streaming(&self) -> bool {
        self.stream.is_active()
    }

    pub fn stream_state(&self) -> StreamState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    /// Subscribe to chat events, with the current stream's replay prefix.
    pub fn subscribe_chat(&self) -> (Vec<ChatEvent>, broadcast::Receiver<ChatEvent>) {
        // Subscribe first so nothing falls between snapshot and live feed.
        let rx = self.stream.subscribe();
        (self.stream.replay(), rx)
    }

    pub fn queued_messages(&self) -> Vec<QueuedMessage> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }

    pub fn clear_queue(&self) {
        self.queue.lock().unwrap().clear();
    }

    /// Drain the draft slot filled by a user-initiated interrupt.
    pub fn take_draft(&self) -> Vec<QueuedMessage> {
        std::mem::take(&mut self.draft.lock().unwrap())
    }

    pub fn retry_manager(&self) -> &RetryManager {
        &self.retry
    }

    /// Record an external file edit for the next provider turn.
    pub fn note_file_change(&self, path: impl Into<String>) {
        self.file_change_notices.lock().unwrap().push(path.into());
    }

    /// Mark a provider response id as invalidated.
    pub fn note_lost_response_id(&self, id: impl Into<String>) {
        self.lost_response_ids.lock().unwrap().insert(id.into());
    }

    // ── Send path ────────────────────────────────────────────────────────────

    /// Send a user message. While a stream is active (and this is not an
    /// edit), the message queues and is sent in FIFO order after stream end.
    pub async fn send_message(
        self: &Arc<Self>,
        text: &str,
        options: SendOptions,
        synthetic: bool,
    ) -> Result<()> {
        if options.edit_message_id.is_none() && self.stream.is_active() {
            self.queue.lock().unwrap().push_back(QueuedMessage {
                text: text.to_string(),
                options,
                synthetic,
            });
            return Ok(());
        }

        if let Some(edit_id) = &options.edit_message_id {
            if self.stream.is_active() {
                self.stream.stop_stream(StopOptions {
                    soft: false,
                    abandon_partial: true,
                });
                self.wait_idle(Duration::from_secs(5)).await;
            }
            let removed = self
                .history
                .truncate_from(&self.cfg.workspace_id, edit_id)
                .await?;
            if !removed.is_empty() {
                self.emit(ChatEvent::Delete {
                    history_sequences: removed,
                });
            }
        }

        // A lingering partial from an earlier crash/abort joins history
        // before the new turn.
        self.partials
            .commit_to_history(&self.cfg.workspace_id, &self.history)
            .await?;

        let mut parts: Vec<Part> = Vec::new();
        if !text.is_empty() {
            parts.push(Part::text(text));
        }
        for (path, content, media_type) in &options.attachments {
            parts.push(Part::FileAttachment {
                path: path.clone(),
                content: content.clone(),
                media_type: media_type.clone(),
            });
        }
        for (url, media_type) in &options.images {
            parts.push(Part::Image {
                url: url.clone(),
                media_type: media_type.clone(),
            });
        }
        if parts.is_empty() {
            bail!("cannot send an empty message");
        }
        let mut user = Message::new(Role::User, parts);
        user.metadata.mode = Some(self.resolve_mode(&options));
        self.history.append(&self.cfg.workspace_id, user).await?;

        *self.last_send.lock().unwrap() = Some(options.clone());
        self.open_stream(&options, synthetic).await
    }

    /// Re-open the provider stream over the committed history — used to
    /// continue after an interruption or transient failure without a new
    /// user message.
    pub async fn resume_stream(self: &Arc<Self>) -> Result<()> {
        if self.stream.is_active() {
            bail!("stream_already_active");
        }
        self.partials
            .commit_to_history(&self.cfg.workspace_id, &self.history)
            .await?;
        let options = self.last_send.lock().unwrap().clone().unwrap_or_default();
        self.open_stream(&options, false).await
    }

    /// Stop the in-flight stream. A user-initiated interrupt moves queued
    /// messages back into the draft slot rather than dropping them.
    pub fn interrupt_stream(&self, abandon_partial: bool, user_initiated: bool) {
        self.retry.cancel();
        let stopped = self.stream.stop_stream(StopOptions {
            soft: false,
            abandon_partial,
        });
        if stopped && user_initiated {
            let mut queue = self.queue.lock().unwrap();
            if !queue.is_empty() {
                self.draft.lock().unwrap().extend(queue.drain(..));
            }
        }
    }

    // ── History surgery ──────────────────────────────────────────────────────

    /// Delete the trailing fraction of history. Refused mid-stream.
    pub async fn truncate_history(&self, fraction: f64) -> Result<Vec<u64>> {
        if self.stream.is_active() {
            bail!("cannot truncate history while a stream is active");
        }
        let removed = self
            .history
            .truncate(&self.cfg.workspace_id, fraction)
            .await?;
        if !removed.is_empty() {
            self.emit(ChatEvent::Delete {
                history_sequences: removed.clone(),
            });
        }
        Ok(removed)
    }

    /// Replace the whole history with one summary message. Refused
    /// mid-stream unless the summary is a compaction product.
    pub async fn replace_history(&self, summary: Message) -> Result<Message> {
        if self.stream.is_active() && !summary.metadata.compacted {
            bail!("cannot replace history while a stream is active");
        }
        let removed = self.history.clear(&self.cfg.workspace_id).await?;
        if !removed.is_empty() {
            self.emit(ChatEvent::Delete {
                history_sequences: removed,
            });
        }
        let appended = self.history.append(&self.cfg.workspace_id, summary).await?;
        Ok(appended)
    }

    pub async fn get_history(&self) -> Result<Vec<Message>> {
        self.history.get_history(&self.cfg.workspace_id).await
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn emit(&self, event: ChatEvent) {
        let _ = self.stream.event_sender().send(event);
    }

    fn resolve_model_string(&self, options: &SendOptions) -> String {
        options
            .model
            .clone()
            .or_else(|| self.cfg.ai.model.clone())
            .unwrap_or_else(|| self.cfg.defaults.model.clone())
    }

    fn resolve_mode(&self, options: &SendOptions) -> SessionMode {
        options
            .mode
            .or(self.cfg.ai.mode)
            .unwrap_or_default()
    }

    async fn wait_idle(&self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.stream.is_active() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Detect a plan→exec transition and load the plan content for the
    /// transform pipeline.
    fn mode_transition_plan(&self, history: &[Message], mode: SessionMode) -> Option<String> {
        if mode != SessionMode::Exec {
            return None;
        }
        let previous_mode = history
            .iter()
            .rev()
            // Skip the user message just appended for this turn.
            .filter(|m| m.role == Role::Assistant || m.metadata.mode.is_some())
            .filter(|m| m.role == Role::Assistant)
            .find_map(|m| m.metadata.mode)?;
        if previous_mode != SessionMode::Plan {
            return None;
        }
        std::fs::read_to_string(self.cfg.workspace_path.join(".mux").join("plan.md")).ok()
    }

    /// Attachments for the turn after a compaction summary: the plan file,
    /// when present.
    fn post_compaction_attachments(&self, history: &[Message]) -> Vec<(String, String)> {
        let last_assistant_compacted = history
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant)
            .map(|m| m.metadata.compacted)
            .unwrap_or(false);
        if !last_assistant_compacted {
            return Vec::new();
        }
        let plan = self.cfg.workspace_path.join(".mux").join("plan.md");
        match std::fs::read_to_string(&plan) {
            Ok(content) => vec![(".mux/plan.md".to_string(), content)],
            Err(_) => Vec::new(),
        }
    }

    fn open_stream<'a>(
        self: &'a Arc<Self>,
        options: &'a SendOptions,
        synthetic: bool,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move { self.open_stream_inner(options, synthetic).await })
    }

    async fn open_stream_inner(
        self: &Arc<Self>,
        options: &SendOptions,
        synthetic: bool,
    ) -> Result<()> {
        let model_string = self.resolve_model_string(options);
        let model = parse_model_string(&model_string).map_err(|e| anyhow::anyhow!(e))?;
        let mode = self.resolve_mode(options);
        let provider = (self.provider_factory)(&model).map_err(|e| anyhow::anyhow!(e))?;

        let runtime = mux_runtime::runtime_for(self.cfg.runtime.as_ref())
            .context("workspace runtime unavailable")?;

        let history = self.history.get_history(&self.cfg.workspace_id).await?;

        // Transform passes (§ message pipeline) over the committed history.
        let transform_opts = TransformOptions {
            mode_transition_plan: self.mode_transition_plan(&history, mode),
            file_change_notices: std::mem::take(&mut *self.file_change_notices.lock().unwrap()),
            post_compaction_attachments: self.post_compaction_attachments(&history),
            lost_response_ids: self.lost_response_ids.lock().unwrap().clone(),
        };
        let transformed = transform_history(&history, &model, &transform_opts);

        // System prompt from workspace facts + project instructions.
        let mut prompt_ctx = PromptContext {
            workspace_name: self.cfg.workspace_name.clone(),
            workspace_path: self.cfg.workspace_path.to_string_lossy().into_owned(),
            project_name: self.cfg.project_name.clone(),
            agents_md: None,
            mcp_tool_names: self.mcp_tools.iter().map(|t| t.name().to_string()).collect(),
            additional_instructions: options.additional_instructions.clone(),
        };
        prompt_ctx.load_agents_md(&self.cfg.workspace_path);
        let system = system_prompt(mode, &prompt_ctx);
        let system_tokens = (system.len() / 4) as u32;

        // Tool set for this (model, mode, workspace, runtime) tuple.
        let policy = options
            .tool_policy
            .clone()
            .or_else(|| self.cfg.ai.tool_policy.clone())
            .map(|c| ToolPolicy::from_config(&c))
            .unwrap_or_default();
        let task_tool: Arc<dyn Tool> = Arc::new(TaskTool::new(
            Arc::clone(&provider),
            discover_subagents(&self.cfg.workspace_path),
        ));
        let tools = resolve_tools(ResolveParams {
            mode,
            experiments: self.cfg.experiments,
            web_search_api_key: self
                .cfg
                .defaults
                .web_search_api_key_env
                .as_deref()
                .and_then(|var| std::env::var(var).ok()),
            mcp_tools: self.mcp_tools.clone(),
            extra_tools: vec![task_tool],
            policy,
        });

        // Reserve the assistant slot in history before streaming.
        let placeholder = self
            .history
            .append(
                &self.cfg.workspace_id,
                Message::new(Role::Assistant, Vec::new()),
            )
            .await?;
        let history_sequence = placeholder
            .metadata
            .history_sequence
            .context("placeholder was not sequenced")?;

        let (dummy_cancel_tx, dummy_cancel) = watch::channel(false);
        // Held by the params only; the stream manager installs its own.
        drop(dummy_cancel_tx);
        let tool_ctx = ToolCtx {
            runtime,
            workspace_path: self.cfg.workspace_path.clone(),
            mode,
            secrets: self.cfg.secrets.clone(),
            cancel: dummy_cancel,
        };

        let provider_options = ProviderOptions {
            thinking_level: options.thinking_level.or(self.cfg.ai.thinking_level),
            previous_response_id: if persists_response_ids(&model) {
                transformed.previous_response_id
            } else {
                None
            },
            cache_markers: supports_cache_markers(&model),
        };

        let params = StartStreamParams {
            provider,
            cache_markers: provider_options.cache_markers,
            model,
            model_string,
            wire_messages: transformed.wire,
            system_message: system,
            system_message_tokens: system_tokens,
            message_id: placeholder.id.clone(),
            history_sequence,
            tools,
            tool_ctx,
            mode: Some(mode),
            max_output_tokens: self
                .cfg
                .ai
                .max_output_tokens
                .or(self.cfg.defaults.max_output_tokens),
            provider_options,
        };

        let outcome_rx = match self.stream.start_stream(params) {
            Ok(rx) => rx,
            Err(StreamStartError::StreamAlreadyActive) => bail!("stream_already_active"),
        };
        let _ = self.state_tx.send(StreamState::Streaming);

        let session = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = outcome_rx.await;
            session.handle_outcome(outcome, synthetic).await;
        });
        Ok(())
    }

    async fn handle_outcome(
        self: &Arc<Self>,
        outcome: std::result::Result<StreamOutcome, tokio::sync::oneshot::error::RecvError>,
        synthetic: bool,
    ) {
        match outcome {
            Ok(StreamOutcome::Completed(_message)) => {
                self.retry.handle_stream_success();
                let _ = self.state_tx.send(StreamState::Idle);
                self.send_queued_messages().await;
            }
            Ok(StreamOutcome::Aborted { .. }) => {
                let _ = self.state_tx.send(StreamState::Interrupted);
            }
            Ok(StreamOutcome::Failed(error)) => {
                let will_retry =
                    !synthetic && error.kind.is_retryable() && self.retry.is_enabled();
                if will_retry {
                    let _ = self.state_tx.send(StreamState::Retrying);
                    self.retry.handle_stream_failure(&error.kind);
                } else {
                    // Synthetic sends never touch retry intent; real
                    // non-retryable failures abandon first, then surface.
                    if !synthetic {
                        self.retry.handle_stream_failure(&error.kind);
                    }
                    self.emit(ChatEvent::Error {
                        error_type: error.kind.event_type().to_string(),
                        message: error.message.clone(),
                    });
                    let _ = self.state_tx.send(StreamState::Failed);
                }
            }
            Err(_) => {
                warn!(workspace = %self.cfg.workspace_id, "stream driver dropped without outcome");
                let _ = self.state_tx.send(StreamState::Failed);
            }
        }
    }

    /// Drain the queue in FIFO order; each entry keeps its synthetic flag.
    /// Boxed: the send → outcome → drain chain would otherwise form an
    /// infinitely recursive future type.
    async fn send_queued_messages(self: &Arc<Self>) {
        let next = self.queue.lock().unwrap().pop_front();
        if let Some(queued) = next {
            let session = Arc::clone(self);
            let send: std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<()>> + Send>,
            > = Box::pin(async move {
                session
                    .send_message(&queued.text, queued.options.clone(), queued.synthetic)
                    .await
            });
            if let Err(e) = send.await {
                warn!(workspace = %self.cfg.workspace_id, error = %e, "queued send failed");
            }
        }
    }

    /// Cancel in-flight work and wait for it to settle.
    pub async fn dispose(&self) {
        self.retry.cancel();
        self.stream.stop_stream(StopOptions {
            soft: false,
            abandon_partial: false,
        });
        self.wait_idle(Duration::from_secs(5)).await;
    }
}
