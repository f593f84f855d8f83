// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-workspace stream driver.
//!
//! Owns the single in-flight provider stream for one workspace: it turns
//! provider chunks into ordered chat events, aggregates them into the
//! assistant message, keeps the partial file fresh, executes tool calls in
//! the order their input completes, feeds results into the next provider
//! turn, and settles the history on end, abort, or error.
//!
//! History is never corrupted by a failure: whatever was streamed is
//! committed with `partial: true`, error metadata set, and the continue
//! sentinel appended.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::{debug, warn};

use mux_config::SessionMode;
use mux_model::{
    apply_cache_markers, validate_provider_shape, ChatProvider, ChatRequest, Message, ModelRef,
    Part, ProviderOptions, StreamChunk, StreamError, ToolCallState, ToolSchema, WireBlock,
    WireMessage, CONTINUE_SENTINEL,
};
use mux_store::{HistoryStore, PartialStore};
use mux_tools::{Tool, ToolCtx, ToolResult};

use crate::events::ChatEvent;

/// Upper bound on provider turns inside one stream; a runaway tool loop
/// ends the stream rather than looping forever.
const MAX_TOOL_ROUNDS: u32 = 32;

/// Partial rewrites within this window coalesce.
const PARTIAL_WRITE_INTERVAL: Duration = Duration::from_millis(200);

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq)]
pub enum StreamStartError {
    #[error("stream_already_active")]
    StreamAlreadyActive,
}

/// How the stream finished, delivered to the session that started it.
#[derive(Debug)]
pub enum StreamOutcome {
    Completed(Message),
    Aborted { abandon_partial: bool },
    Failed(StreamError),
}

pub struct StartStreamParams {
    pub provider: Arc<dyn ChatProvider>,
    pub model: ModelRef,
    pub model_string: String,
    pub wire_messages: Vec<WireMessage>,
    pub system_message: String,
    pub system_message_tokens: u32,
    /// Id of the assistant placeholder already appended to history.
    pub message_id: String,
    pub history_sequence: u64,
    pub tools: Vec<Arc<dyn Tool>>,
    /// Tool context template; the manager swaps in the stream's cancel
    /// signal per call.
    pub tool_ctx: ToolCtx,
    pub mode: Option<SessionMode>,
    pub max_output_tokens: Option<u32>,
    pub provider_options: ProviderOptions,
    /// Apply prompt-cache markers at request construction.
    pub cache_markers: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StopOptions {
    /// Soft stop lets a running tool call finish before aborting.
    pub soft: bool,
    /// Drop the streamed content instead of committing it.
    pub abandon_partial: bool,
}

struct ActiveStream {
    message_id: String,
    cancel: watch::Sender<bool>,
    abandon_partial: Arc<AtomicBool>,
    soft: Arc<AtomicBool>,
}

pub struct StreamManager {
    workspace_id: String,
    history: Arc<HistoryStore>,
    partials: Arc<PartialStore>,
    events: broadcast::Sender<ChatEvent>,
    active: Mutex<Option<ActiveStream>>,
    /// Events since the current stream's start, for late-subscriber replay.
    recorded: Mutex<Vec<ChatEvent>>,
}

impl StreamManager {
    pub fn new(
        workspace_id: impl Into<String>,
        history: Arc<HistoryStore>,
        partials: Arc<PartialStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Arc::new(Self {
            workspace_id: workspace_id.into(),
            history,
            partials,
            events,
            active: Mutex::new(None),
            recorded: Mutex::new(Vec::new()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    pub fn event_sender(&self) -> broadcast::Sender<ChatEvent> {
        self.events.clone()
    }

    /// Recorded events since the current stream's start, in order.
    pub fn replay(&self) -> Vec<ChatEvent> {
        self.recorded.lock().unwrap().clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    /// Start the stream. Fails without side effects when one is already in
    /// flight. The returned receiver resolves with the stream's outcome.
    pub fn start_stream(
        self: &Arc<Self>,
        params: StartStreamParams,
    ) -> Result<oneshot::Receiver<StreamOutcome>, StreamStartError> {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let abandon = Arc::new(AtomicBool::new(false));
        let soft = Arc::new(AtomicBool::new(false));
        {
            let mut active = self.active.lock().unwrap();
            if active.is_some() {
                return Err(StreamStartError::StreamAlreadyActive);
            }
            *active = Some(ActiveStream {
                message_id: params.message_id.clone(),
                cancel: cancel_tx,
                abandon_partial: Arc::clone(&abandon),
                soft: Arc::clone(&soft),
            });
            self.recorded.lock().unwrap().clear();
        }

        self.emit(ChatEvent::StreamStart {
            workspace_id: self.workspace_id.clone(),
            message_id: params.message_id.clone(),
            model: params.model_string.clone(),
            history_sequence: params.history_sequence,
            start_time: chrono::Utc::now(),
            mode: params.mode,
        });

        let (outcome_tx, outcome_rx) = oneshot::channel();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager
                .drive(params, cancel_rx, Arc::clone(&abandon), soft)
                .await;
            *manager.active.lock().unwrap() = None;
            let _ = outcome_tx.send(outcome);
        });
        Ok(outcome_rx)
    }

    /// Cancel the in-flight stream. Returns false when nothing is active.
    pub fn stop_stream(&self, opts: StopOptions) -> bool {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(stream) => {
                stream
                    .abandon_partial
                    .store(opts.abandon_partial, Ordering::SeqCst);
                stream.soft.store(opts.soft, Ordering::SeqCst);
                let _ = stream.cancel.send(true);
                true
            }
            None => false,
        }
    }

    pub fn active_message_id(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap()
            .as_ref()
            .map(|a| a.message_id.clone())
    }

    fn emit(&self, event: ChatEvent) {
        self.recorded.lock().unwrap().push(event.clone());
        let _ = self.events.send(event);
    }

    // ── The driver ───────────────────────────────────────────────────────────

    async fn drive(
        &self,
        params: StartStreamParams,
        mut cancel: watch::Receiver<bool>,
        abandon: Arc<AtomicBool>,
        soft: Arc<AtomicBool>,
    ) -> StreamOutcome {
        let mut message = Message::assistant_placeholder(&params.message_id);
        message.metadata.history_sequence = Some(params.history_sequence);
        message.metadata.model = Some(params.model_string.clone());
        message.metadata.mode = params.mode;
        message.metadata.system_message_tokens = Some(params.system_message_tokens);
        message.metadata.partial = true;

        let schemas: Vec<ToolSchema> = params
            .tools
            .iter()
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description(),
                input_schema: t.input_schema(),
                cache_control: false,
            })
            .collect();
        let tool_index: HashMap<String, Arc<dyn Tool>> = params
            .tools
            .iter()
            .map(|t| (t.name().to_string(), Arc::clone(t)))
            .collect();

        let mut tool_ctx = params.tool_ctx.clone();
        tool_ctx.cancel = cancel.clone();

        let mut wire = params.wire_messages.clone();
        let mut throttle = PartialThrottle::new();
        let mut rounds = 0u32;
        // Index of the first part produced by the current provider turn.
        let mut turn_start = 0usize;

        loop {
            rounds += 1;
            if rounds > MAX_TOOL_ROUNDS {
                warn!(
                    workspace = %self.workspace_id,
                    "tool-round budget exhausted; ending stream"
                );
                return self.finish_completed(message, &mut throttle).await;
            }

            let mut req = ChatRequest {
                system: params.system_message.clone(),
                messages: wire.clone(),
                tools: schemas.clone(),
                max_output_tokens: params.max_output_tokens,
                options: ProviderOptions {
                    previous_response_id: params.options_previous_response_id(&message),
                    ..params.provider_options.clone()
                },
            };
            if params.cache_markers {
                apply_cache_markers(&mut req);
            }
            for problem in validate_provider_shape(&req.system, &req.messages) {
                // Providers are often lenient; log and send anyway.
                warn!(workspace = %self.workspace_id, %problem, "request shape warning");
            }

            let stream = tokio::select! {
                biased;
                _ = cancel.changed() => None,
                result = params.provider.stream_chat(req) => Some(result),
            };
            let mut stream = match stream {
                None => {
                    return self
                        .finish_aborted(message, abandon.load(Ordering::SeqCst), &mut throttle)
                        .await;
                }
                Some(Err(e)) => return self.finish_failed(message, e, &mut throttle).await,
                Some(Ok(s)) => s,
            };

            // Raw input fragments per tool call, for interruption snapshots.
            let mut input_bufs: HashMap<String, String> = HashMap::new();
            let mut executed_tool_call = false;

            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.changed() => None,
                    chunk = stream.next() => Some(chunk),
                };
                let chunk = match chunk {
                    // Cancelled while waiting on the provider.
                    None => {
                        self.snapshot_interrupted_inputs(&mut message, &input_bufs);
                        return self
                            .finish_aborted(message, abandon.load(Ordering::SeqCst), &mut throttle)
                            .await;
                    }
                    Some(None) => break, // provider stream ended without Done
                    Some(Some(Err(e))) => {
                        self.snapshot_interrupted_inputs(&mut message, &input_bufs);
                        return self.finish_failed(message, e, &mut throttle).await;
                    }
                    Some(Some(Ok(c))) => c,
                };

                match chunk {
                    StreamChunk::TextDelta(delta) => {
                        append_text(&mut message, &delta);
                        self.emit(ChatEvent::StreamDelta {
                            message_id: message.id.clone(),
                            delta,
                        });
                        self.write_partial(&message, &mut throttle, false);
                    }
                    StreamChunk::ReasoningDelta(delta) => {
                        append_reasoning(&mut message, &delta);
                        self.emit(ChatEvent::ReasoningDelta {
                            message_id: message.id.clone(),
                            delta,
                        });
                        self.write_partial(&message, &mut throttle, false);
                    }
                    StreamChunk::ReasoningEnd => {
                        self.emit(ChatEvent::ReasoningEnd {
                            message_id: message.id.clone(),
                        });
                    }
                    StreamChunk::ToolCallStart {
                        tool_call_id,
                        tool_name,
                    } => {
                        message.parts.push(Part::ToolCall {
                            tool_name: tool_name.clone(),
                            tool_call_id: tool_call_id.clone(),
                            input: serde_json::json!({}),
                            state: ToolCallState::Streaming,
                            output: None,
                        });
                        input_bufs.insert(tool_call_id.clone(), String::new());
                        self.emit(ChatEvent::ToolCallStart {
                            message_id: message.id.clone(),
                            tool_call_id,
                            tool_name,
                        });
                        self.write_partial(&message, &mut throttle, false);
                    }
                    StreamChunk::ToolCallDelta {
                        tool_call_id,
                        partial_input,
                    } => {
                        if let Some(buf) = input_bufs.get_mut(&tool_call_id) {
                            buf.push_str(&partial_input);
                        }
                        self.emit(ChatEvent::ToolCallDelta {
                            message_id: message.id.clone(),
                            tool_call_id,
                            partial_input,
                        });
                        self.write_partial(&message, &mut throttle, false);
                    }
                    StreamChunk::ToolCallEnd {
                        tool_call_id,
                        input,
                    } => {
                        input_bufs.remove(&tool_call_id);
                        set_tool_state(
                            &mut message,
                            &tool_call_id,
                            ToolCallState::Available,
                            Some(input.clone()),
                            None,
                        );
                        self.write_partial(&message, &mut throttle, true);

                        // Execute now — tool calls run in the order their
                        // input completes, never earlier.
                        let tool = tool_index.get(&tool_name_of(&message, &tool_call_id));
                        let result = match tool {
                            Some(tool) => {
                                let exec = tool.execute(&tool_ctx, input);
                                if soft.load(Ordering::SeqCst) {
                                    // Soft stop: let the call finish.
                                    exec.await
                                } else {
                                    tokio::select! {
                                        biased;
                                        _ = cancel.changed() => ToolResult::interrupted(),
                                        result = exec => result,
                                    }
                                }
                            }
                            None => ToolResult::err(format!(
                                "unknown tool: {}",
                                tool_name_of(&message, &tool_call_id)
                            )),
                        };

                        let interrupted = result.output.get("interrupted").is_some()
                            && *cancel.borrow();
                        let state = if interrupted {
                            ToolCallState::Interrupted
                        } else {
                            ToolCallState::Completed
                        };
                        set_tool_state(
                            &mut message,
                            &tool_call_id,
                            state,
                            None,
                            Some(result.output.clone()),
                        );
                        executed_tool_call = true;
                        self.emit(ChatEvent::ToolCallEnd {
                            message_id: message.id.clone(),
                            tool_call_id,
                            result: result.output,
                            is_error: result.is_error,
                        });
                        self.write_partial(&message, &mut throttle, true);

                        if interrupted {
                            return self
                                .finish_aborted(
                                    message,
                                    abandon.load(Ordering::SeqCst),
                                    &mut throttle,
                                )
                                .await;
                        }
                    }
                    StreamChunk::Usage(usage) => {
                        message.metadata.usage = Some(usage);
                        self.emit(ChatEvent::UsageDelta {
                            message_id: message.id.clone(),
                            usage,
                        });
                    }
                    StreamChunk::ResponseId(id) => {
                        message.metadata.response_id = Some(id);
                    }
                    StreamChunk::Done => break,
                }
            }

            if !executed_tool_call {
                return self.finish_completed(message, &mut throttle).await;
            }

            // Feed this turn's tool results back as the next provider turn.
            let (assistant_blocks, result_blocks) = wire_turn(&message.parts[turn_start..]);
            if !assistant_blocks.is_empty() {
                wire.push(WireMessage::new(
                    mux_model::Role::Assistant,
                    assistant_blocks,
                ));
            }
            if !result_blocks.is_empty() {
                wire.push(WireMessage::new(mux_model::Role::User, result_blocks));
            }
            turn_start = message.parts.len();
        }
    }

    // ── Stream settlement ────────────────────────────────────────────────────

    async fn finish_completed(
        &self,
        mut message: Message,
        throttle: &mut PartialThrottle,
    ) -> StreamOutcome {
        message.metadata.partial = false;
        // The most recent partial must be durable before stream-end.
        self.write_partial(&message, throttle, true);
        match self.history.update_message(&self.workspace_id, message).await {
            Ok(persisted) => {
                if let Err(e) = self.partials.delete(&self.workspace_id) {
                    warn!(workspace = %self.workspace_id, error = %e, "partial cleanup failed");
                }
                self.emit(ChatEvent::StreamEnd {
                    message_id: persisted.id.clone(),
                    message: persisted.clone(),
                });
                StreamOutcome::Completed(persisted)
            }
            Err(e) => {
                let err = StreamError::new(
                    mux_model::StreamErrorKind::Unknown { raw: e.to_string() },
                    format!("persisting assistant message failed: {e}"),
                );
                self.emit(ChatEvent::Error {
                    error_type: "unknown".into(),
                    message: err.message.clone(),
                });
                StreamOutcome::Failed(err)
            }
        }
    }

    async fn finish_aborted(
        &self,
        mut message: Message,
        abandon_partial: bool,
        throttle: &mut PartialThrottle,
    ) -> StreamOutcome {
        mark_unfinished_interrupted(&mut message);
        message.metadata.partial = true;
        message.metadata.error = Some("Interrupted by user".to_string());
        message.metadata.error_type = Some("interrupted".to_string());
        message.append_to_last_text(CONTINUE_SENTINEL);

        if abandon_partial {
            // Streamed content is dropped; the placeholder keeps only the
            // interruption markers.
            if let Err(e) = self.partials.delete(&self.workspace_id) {
                warn!(workspace = %self.workspace_id, error = %e, "partial delete failed");
            }
            let mut empty = Message::assistant_placeholder(&message.id);
            empty.metadata = message.metadata.clone();
            if let Err(e) = self.history.update_message(&self.workspace_id, empty).await {
                warn!(workspace = %self.workspace_id, error = %e, "placeholder update failed");
            }
        } else {
            self.write_partial(&message, throttle, true);
            if let Err(e) = self
                .partials
                .commit_to_history(&self.workspace_id, &self.history)
                .await
            {
                warn!(workspace = %self.workspace_id, error = %e, "partial commit failed");
            }
        }

        self.emit(ChatEvent::StreamAbort {
            message_id: message.id.clone(),
            abandon_partial,
        });
        StreamOutcome::Aborted { abandon_partial }
    }

    async fn finish_failed(
        &self,
        mut message: Message,
        error: StreamError,
        throttle: &mut PartialThrottle,
    ) -> StreamOutcome {
        debug!(workspace = %self.workspace_id, error = %error, "stream failed");
        mark_unfinished_interrupted(&mut message);
        message.metadata.partial = true;
        message.metadata.error = Some(error.message.clone());
        message.metadata.error_type = Some(error.kind.event_type().to_string());
        message.append_to_last_text(CONTINUE_SENTINEL);

        self.write_partial(&message, throttle, true);
        if let Err(e) = self
            .partials
            .commit_to_history(&self.workspace_id, &self.history)
            .await
        {
            warn!(workspace = %self.workspace_id, error = %e, "partial commit failed");
        }
        // The user-visible error event is the session's call: retryable
        // failures surface as retry events instead.
        StreamOutcome::Failed(error)
    }

    fn snapshot_interrupted_inputs(
        &self,
        message: &mut Message,
        input_bufs: &HashMap<String, String>,
    ) {
        for (id, buf) in input_bufs {
            if !buf.is_empty() {
                set_tool_state(
                    message,
                    id,
                    ToolCallState::Streaming,
                    Some(serde_json::Value::String(buf.clone())),
                    None,
                );
            }
        }
    }

    fn write_partial(&self, message: &Message, throttle: &mut PartialThrottle, force: bool) {
        if !force && !throttle.due() {
            return;
        }
        throttle.mark();
        if let Err(e) = self.partials.write(&self.workspace_id, message) {
            warn!(workspace = %self.workspace_id, error = %e, "partial write failed");
        }
    }
}

impl StartStreamParams {
    fn options_previous_response_id(&self, message: &Message) -> Option<String> {
        // A response id captured mid-stream supersedes the one resolved
        // from history (multi-turn tool loops within one stream).
        message
            .metadata
            .response_id
            .clone()
            .or_else(|| self.provider_options.previous_response_id.clone())
    }
}

struct PartialThrottle {
    last: Option<Instant>,
}

impl PartialThrottle {
    fn new() -> Self {
        Self { last: None }
    }

    fn due(&self) -> bool {
        match self.last {
            None => true,
            Some(last) => last.elapsed() >= PARTIAL_WRITE_INTERVAL,
        }
    }

    fn mark(&mut self) {
        self.last = Some(Instant::now());
    }
}

// ── Message aggregation helpers ──────────────────────────────────────────────

fn append_text(message: &mut Message, delta: &str) {
    match message.parts.last_mut() {
        Some(Part::Text { text }) => text.push_str(delta),
        _ => message.parts.push(Part::text(delta)),
    }
}

fn append_reasoning(message: &mut Message, delta: &str) {
    match message.parts.last_mut() {
        Some(Part::Reasoning { text }) => text.push_str(delta),
        _ => message.parts.push(Part::Reasoning {
            text: delta.to_string(),
        }),
    }
}

fn tool_name_of(message: &Message, id: &str) -> String {
    message
        .parts
        .iter()
        .find_map(|p| match p {
            Part::ToolCall {
                tool_name,
                tool_call_id,
                ..
            } if tool_call_id == id => Some(tool_name.clone()),
            _ => None,
        })
        .unwrap_or_default()
}

fn set_tool_state(
    message: &mut Message,
    id: &str,
    new_state: ToolCallState,
    new_input: Option<serde_json::Value>,
    new_output: Option<serde_json::Value>,
) {
    for p in &mut message.parts {
        if let Part::ToolCall {
            tool_call_id,
            input,
            state,
            output,
            ..
        } = p
        {
            if tool_call_id == id {
                *state = new_state;
                if let Some(i) = new_input {
                    *input = i;
                }
                if let Some(o) = new_output {
                    *output = Some(o);
                }
                return;
            }
        }
    }
}

/// Streaming/available tool calls become `interrupted` when the stream is
/// cut; they were never executed.
fn mark_unfinished_interrupted(message: &mut Message) {
    for p in &mut message.parts {
        if let Part::ToolCall { state, .. } = p {
            if matches!(state, ToolCallState::Streaming | ToolCallState::Available) {
                *state = ToolCallState::Interrupted;
            }
        }
    }
}

/// Split one provider turn's parts into (assistant blocks, tool results)
/// for the next request.
fn wire_turn(parts: &[Part]) -> (Vec<WireBlock>, Vec<WireBlock>) {
    let mut blocks = Vec::new();
    let mut results = Vec::new();
    for p in parts {
        match p {
            Part::Text { text } if !text.is_empty() => blocks.push(WireBlock::Text {
                text: text.clone(),
                cache_control: false,
            }),
            Part::Reasoning { text } if !text.is_empty() => {
                blocks.push(WireBlock::Reasoning { text: text.clone() })
            }
            Part::ToolCall {
                tool_name,
                tool_call_id,
                input,
                state: ToolCallState::Completed,
                output: Some(output),
            } => {
                blocks.push(WireBlock::ToolUse {
                    id: tool_call_id.clone(),
                    name: tool_name.clone(),
                    input: input.clone(),
                });
                results.push(WireBlock::ToolResult {
                    tool_use_id: tool_call_id.clone(),
                    content: output.to_string(),
                    is_error: output.get("error").is_some(),
                    cache_control: false,
                });
            }
            _ => {}
        }
    }
    (blocks, results)
}
