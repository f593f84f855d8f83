// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Process-wide supervisor.
//!
//! The engine owns the AgentSession map and the workspace lifecycle
//! (create/fork/rename/delete with name generation and init hooks), routes
//! the typed command surface behind a bearer token, and publishes the
//! process-wide metadata channel. Ownership is strictly one-way:
//! Engine → Session → StreamManager; sessions never call back in.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use mux_config::{Config, ProjectConfig, RuntimeConfig, WorkspaceEntry};
use mux_model::{ChatProvider, Message, ModelRef, OpenAiCompatProvider, StreamError, StreamErrorKind};
use mux_runtime::{runtime_for, CreateWorkspaceRequest, ExecOptions, ForkWorkspaceRequest, Runtime, RuntimeError};
use mux_store::{HistoryStore, InitStateManager, PartialStore};

use crate::auth::StoredToken;
use crate::events::{ChatEvent, WorkspaceMetadata, WorkspaceMetadataEvent};
use crate::names::{generate_workspace_name, sanitize_stem, MAX_NAME_RETRIES};
use crate::session::{AgentSession, ProviderFactory, SendOptions, SessionConfig};

const METADATA_CHANNEL_CAPACITY: usize = 256;

/// The closed set of operations exposed to external callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "camelCase")]
pub enum Command {
    SendMessage {
        workspace_id: String,
        text: String,
        #[serde(default)]
        options: SendOptions,
        #[serde(default)]
        synthetic: bool,
    },
    ResumeStream {
        workspace_id: String,
    },
    InterruptStream {
        workspace_id: String,
        #[serde(default)]
        abandon_partial: bool,
    },
    TruncateHistory {
        workspace_id: String,
        fraction: f64,
    },
    ReplaceHistory {
        workspace_id: String,
        summary: Message,
    },
    ExecuteBash {
        workspace_id: String,
        script: String,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    CreateWorkspace {
        project_path: String,
        title: String,
        #[serde(default)]
        runtime: Option<RuntimeConfig>,
    },
    ForkWorkspace {
        project_path: String,
        source_name: String,
        title: String,
    },
    RenameWorkspace {
        project_path: String,
        old_name: String,
        new_name: String,
    },
    DeleteWorkspace {
        project_path: String,
        name: String,
        #[serde(default)]
        force: bool,
    },
    ListWorkspaces,
    ListBranches {
        project_path: String,
    },
    SubscribeChat {
        workspace_id: String,
    },
    SubscribeMetadata,
}

/// Typed responses; subscriptions carry live receivers and are only
/// meaningful in-process.
#[derive(Debug)]
pub enum CommandResponse {
    Ok,
    Workspace(WorkspaceMetadata),
    Workspaces(Vec<WorkspaceMetadata>),
    Branches(Vec<String>),
    Removed(Vec<u64>),
    Exec {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },
    ChatSubscription {
        history: Vec<Message>,
        replay: Vec<ChatEvent>,
        receiver: broadcast::Receiver<ChatEvent>,
    },
    MetadataSubscription {
        snapshot: Vec<WorkspaceMetadata>,
        receiver: broadcast::Receiver<WorkspaceMetadataEvent>,
    },
}

pub struct Engine {
    config: Mutex<Config>,
    config_path: Option<PathBuf>,
    history: Arc<HistoryStore>,
    partials: Arc<PartialStore>,
    init_mgr: Arc<InitStateManager>,
    sessions: Mutex<HashMap<String, Arc<AgentSession>>>,
    metadata_tx: broadcast::Sender<WorkspaceMetadataEvent>,
    token: StoredToken,
    provider_factory: ProviderFactory,
}

impl Engine {
    pub fn new(
        config: Config,
        config_path: Option<PathBuf>,
        sessions_root: PathBuf,
        token: StoredToken,
        provider_factory: Option<ProviderFactory>,
    ) -> Arc<Self> {
        let (metadata_tx, _) = broadcast::channel(METADATA_CHANNEL_CAPACITY);
        let provider_factory =
            provider_factory.unwrap_or_else(|| default_provider_factory(&config));
        Arc::new(Self {
            config: Mutex::new(config),
            config_path,
            history: Arc::new(HistoryStore::new(sessions_root.clone())),
            partials: Arc::new(PartialStore::new(sessions_root)),
            init_mgr: Arc::new(InitStateManager::new()),
            sessions: Mutex::new(HashMap::new()),
            metadata_tx,
            token,
            provider_factory,
        })
    }

    pub fn init_state_manager(&self) -> Arc<InitStateManager> {
        Arc::clone(&self.init_mgr)
    }

    /// Route one command. Every call is gated by the shared bearer token.
    pub async fn dispatch(
        self: &Arc<Self>,
        token: &str,
        command: Command,
    ) -> Result<CommandResponse> {
        if !self.token.verify(token) {
            bail!("unauthorized: invalid bearer token");
        }
        debug!(?command, "dispatching command");
        match command {
            Command::SendMessage {
                workspace_id,
                text,
                options,
                synthetic,
            } => {
                let session = self.session_for(&workspace_id)?;
                session.send_message(&text, options, synthetic).await?;
                Ok(CommandResponse::Ok)
            }
            Command::ResumeStream { workspace_id } => {
                let session = self.session_for(&workspace_id)?;
                session.resume_stream().await?;
                Ok(CommandResponse::Ok)
            }
            Command::InterruptStream {
                workspace_id,
                abandon_partial,
            } => {
                let session = self.session_for(&workspace_id)?;
                session.interrupt_stream(abandon_partial, true);
                Ok(CommandResponse::Ok)
            }
            Command::TruncateHistory {
                workspace_id,
                fraction,
            } => {
                let session = self.session_for(&workspace_id)?;
                Ok(CommandResponse::Removed(
                    session.truncate_history(fraction).await?,
                ))
            }
            Command::ReplaceHistory {
                workspace_id,
                summary,
            } => {
                let session = self.session_for(&workspace_id)?;
                session.replace_history(summary).await?;
                Ok(CommandResponse::Ok)
            }
            Command::ExecuteBash {
                workspace_id,
                script,
                timeout_secs,
            } => self.execute_bash(&workspace_id, &script, timeout_secs).await,
            Command::CreateWorkspace {
                project_path,
                title,
                runtime,
            } => {
                let meta = self.create_workspace(&project_path, &title, runtime).await?;
                Ok(CommandResponse::Workspace(meta))
            }
            Command::ForkWorkspace {
                project_path,
                source_name,
                title,
            } => {
                let meta = self
                    .fork_workspace(&project_path, &source_name, &title)
                    .await?;
                Ok(CommandResponse::Workspace(meta))
            }
            Command::RenameWorkspace {
                project_path,
                old_name,
                new_name,
            } => {
                let meta = self
                    .rename_workspace(&project_path, &old_name, &new_name)
                    .await?;
                Ok(CommandResponse::Workspace(meta))
            }
            Command::DeleteWorkspace {
                project_path,
                name,
                force,
            } => {
                self.delete_workspace(&project_path, &name, force).await?;
                Ok(CommandResponse::Ok)
            }
            Command::ListWorkspaces => Ok(CommandResponse::Workspaces(self.list_workspaces())),
            Command::ListBranches { project_path } => {
                let runtime = self.project_runtime(&project_path)?;
                let branches = runtime
                    .list_branches(Path::new(&project_path))
                    .await
                    .map_err(|e| anyhow::anyhow!(e))?;
                Ok(CommandResponse::Branches(branches))
            }
            Command::SubscribeChat { workspace_id } => {
                let session = self.session_for(&workspace_id)?;
                let history = session.get_history().await?;
                let (replay, receiver) = session.subscribe_chat();
                Ok(CommandResponse::ChatSubscription {
                    history,
                    replay,
                    receiver,
                })
            }
            Command::SubscribeMetadata => {
                // Subscribe before snapshotting: a change landing in the gap
                // shows up twice (snapshot + event), never zero times.
                let receiver = self.metadata_tx.subscribe();
                Ok(CommandResponse::MetadataSubscription {
                    snapshot: self.list_workspaces(),
                    receiver,
                })
            }
        }
    }

    // ── Workspace lifecycle ──────────────────────────────────────────────────

    /// Create a workspace: generate a suffixed name, make the worktree
    /// (retrying fresh suffixes on collision), persist the identity, and
    /// run the init hook in the background.
    pub async fn create_workspace(
        self: &Arc<Self>,
        project_path: &str,
        title: &str,
        runtime_config: Option<RuntimeConfig>,
    ) -> Result<WorkspaceMetadata> {
        let runtime = runtime_for(runtime_config.as_ref()).map_err(|e| anyhow::anyhow!(e))?;
        let (trunk, project_name) = {
            let mut config = self.config.lock().unwrap();
            let project = ensure_project(&mut config, project_path);
            (project.trunk().to_string(), project.display_name())
        };

        let stem = sanitize_stem(title);
        let mut attempt = 0u32;
        let (name, workspace_path) = loop {
            let name = generate_workspace_name(&stem);
            let req = CreateWorkspaceRequest {
                project_path: PathBuf::from(project_path),
                branch_name: name.clone(),
                directory_name: name.clone(),
                trunk_branch: trunk.clone(),
            };
            match runtime.create_workspace(&req).await {
                Ok(path) => break (name, path),
                Err(RuntimeError::WorkspaceExists) if attempt < MAX_NAME_RETRIES => {
                    attempt += 1;
                    debug!(attempt, "workspace name collision; retrying with fresh suffix");
                }
                Err(e) => return Err(anyhow::anyhow!(e)).context("creating workspace"),
            }
        };

        let entry = WorkspaceEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.clone(),
            path: workspace_path.to_string_lossy().into_owned(),
            created_at: chrono::Utc::now(),
            title: Some(title.to_string()),
            runtime: runtime_config,
            incompatible_runtime: false,
            ai: None,
        };
        let meta = self.persist_entry(project_path, &project_name, entry.clone())?;

        // Init hook runs in the background; its output is replayable.
        self.spawn_init(&entry.id, project_path, &workspace_path, runtime);
        Ok(meta)
    }

    /// Fork: new worktree at the source's HEAD, then copy the session files
    /// (chat history + partial) — the runtime never touches those.
    pub async fn fork_workspace(
        self: &Arc<Self>,
        project_path: &str,
        source_name: &str,
        title: &str,
    ) -> Result<WorkspaceMetadata> {
        let (source_entry, project_name) = {
            let config = self.config.lock().unwrap();
            let project = config
                .project(project_path)
                .with_context(|| format!("unknown project {project_path}"))?;
            let entry = project
                .workspaces
                .iter()
                .find(|w| w.name == source_name)
                .with_context(|| format!("unknown workspace {source_name}"))?
                .clone();
            (entry, project.display_name())
        };
        let runtime = runtime_for(source_entry.runtime.as_ref()).map_err(|e| anyhow::anyhow!(e))?;

        let stem = sanitize_stem(title);
        let mut attempt = 0u32;
        let (name, workspace_path) = loop {
            let name = generate_workspace_name(&stem);
            let req = ForkWorkspaceRequest {
                project_path: PathBuf::from(project_path),
                source_name: source_name.to_string(),
                new_name: name.clone(),
            };
            match runtime.fork_workspace(&req).await {
                Ok(path) => break (name, path),
                Err(RuntimeError::WorkspaceExists) if attempt < MAX_NAME_RETRIES => {
                    attempt += 1;
                }
                Err(e) => return Err(anyhow::anyhow!(e)).context("forking workspace"),
            }
        };

        let entry = WorkspaceEntry {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            path: workspace_path.to_string_lossy().into_owned(),
            created_at: chrono::Utc::now(),
            title: Some(title.to_string()),
            runtime: source_entry.runtime.clone(),
            incompatible_runtime: false,
            ai: source_entry.ai.clone(),
        };
        self.copy_session_files(&source_entry.id, &entry.id);
        let meta = self.persist_entry(project_path, &project_name, entry.clone())?;
        self.spawn_init(&entry.id, project_path, &workspace_path, runtime);
        Ok(meta)
    }

    pub async fn rename_workspace(
        self: &Arc<Self>,
        project_path: &str,
        old_name: &str,
        new_name: &str,
    ) -> Result<WorkspaceMetadata> {
        let (entry, project_name) = self.find_entry(project_path, old_name)?;
        if let Some(session) = self.sessions.lock().unwrap().get(&entry.id) {
            if session.is_streaming() {
                bail!("Cannot rename workspace while AI stream is active.");
            }
        }
        let runtime = runtime_for(entry.runtime.as_ref()).map_err(|e| anyhow::anyhow!(e))?;
        let renamed = runtime
            .rename_workspace(Path::new(project_path), old_name, new_name)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        let meta = {
            let mut config = self.config.lock().unwrap();
            let project = config
                .project_mut(project_path)
                .with_context(|| format!("unknown project {project_path}"))?;
            let project_entry = project
                .workspaces
                .iter_mut()
                .find(|w| w.id == entry.id)
                .context("workspace entry vanished")?;
            project_entry.name = new_name.to_string();
            project_entry.path = renamed.new_path.to_string_lossy().into_owned();
            let snapshot = project_entry.clone();
            self.save_config(&config)?;
            self.metadata_for(&snapshot, project_path, &project_name)
        };
        // The session's cached config is stale after a rename; drop it and
        // rebuild lazily on next use.
        self.sessions.lock().unwrap().remove(&entry.id);
        self.publish_metadata(&entry.id, Some(meta.clone()));
        Ok(meta)
    }

    pub async fn delete_workspace(
        self: &Arc<Self>,
        project_path: &str,
        name: &str,
        force: bool,
    ) -> Result<()> {
        let (entry, _project_name) = self.find_entry(project_path, name)?;
        let session = self.sessions.lock().unwrap().remove(&entry.id);
        if let Some(session) = session {
            session.dispose().await;
        }
        let runtime = runtime_for(entry.runtime.as_ref()).map_err(|e| anyhow::anyhow!(e))?;
        runtime
            .delete_workspace(Path::new(project_path), name, force)
            .await
            .map_err(|e| anyhow::anyhow!(e))?;

        {
            let mut config = self.config.lock().unwrap();
            if let Some(project) = config.project_mut(project_path) {
                project.workspaces.retain(|w| w.id != entry.id);
            }
            self.save_config(&config)?;
        }
        self.publish_metadata(&entry.id, None);
        Ok(())
    }

    pub fn list_workspaces(&self) -> Vec<WorkspaceMetadata> {
        let config = self.config.lock().unwrap();
        let mut out = Vec::new();
        for project in &config.projects {
            let project_name = project.display_name();
            for entry in &project.workspaces {
                out.push(self.metadata_for(entry, &project.path, &project_name));
            }
        }
        out
    }

    /// Fetch (or lazily create) the session for a workspace id.
    pub fn session_for(self: &Arc<Self>, workspace_id: &str) -> Result<Arc<AgentSession>> {
        if let Some(session) = self.sessions.lock().unwrap().get(workspace_id) {
            return Ok(Arc::clone(session));
        }
        let (entry, project) = self.find_entry_by_id(workspace_id)?;
        let secrets = mux_config::load_secrets(&project.display_name()).unwrap_or_default();
        let (defaults, experiments) = {
            let config = self.config.lock().unwrap();
            (config.defaults.clone(), config.experiments)
        };
        let session = AgentSession::new(
            SessionConfig {
                workspace_id: entry.id.clone(),
                workspace_name: entry.name.clone(),
                workspace_path: PathBuf::from(&entry.path),
                project_name: project.display_name(),
                project_path: PathBuf::from(&project.path),
                runtime: entry.runtime.clone(),
                defaults,
                experiments,
                ai: entry.ai.clone().unwrap_or_default(),
                secrets,
            },
            Arc::clone(&self.history),
            Arc::clone(&self.partials),
            Arc::clone(&self.provider_factory),
            Vec::new(),
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(workspace_id.to_string(), Arc::clone(&session));
        self.spawn_activity_watcher(&session, entry, project);
        Ok(session)
    }

    /// Publish a metadata event whenever the session's stream activity
    /// changes, so subscribers see streaming/idle transitions live.
    fn spawn_activity_watcher(
        self: &Arc<Self>,
        session: &Arc<AgentSession>,
        entry: WorkspaceEntry,
        project: ProjectConfig,
    ) {
        let mut state_rx = session.watch_state();
        let engine = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut last_completed: Option<chrono::DateTime<chrono::Utc>> = None;
            let mut previous = *state_rx.borrow();
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                let Some(engine) = engine.upgrade() else {
                    return;
                };
                if previous == crate::StreamState::Streaming
                    && state == crate::StreamState::Idle
                {
                    last_completed = Some(chrono::Utc::now());
                }
                previous = state;
                let mut meta =
                    engine.metadata_for(&entry, &project.path, &project.display_name());
                meta.streaming = matches!(
                    state,
                    crate::StreamState::Streaming | crate::StreamState::Retrying
                );
                meta.last_assistant_completed_at = last_completed;
                engine.publish_metadata(&entry.id, Some(meta));
            }
        });
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    async fn execute_bash(
        self: &Arc<Self>,
        workspace_id: &str,
        script: &str,
        timeout_secs: Option<u64>,
    ) -> Result<CommandResponse> {
        let (entry, project) = self.find_entry_by_id(workspace_id)?;
        let runtime = runtime_for(entry.runtime.as_ref()).map_err(|e| anyhow::anyhow!(e))?;
        let secrets = mux_config::load_secrets(&project.display_name()).unwrap_or_default();
        let result = runtime
            .execute_bash(
                script,
                ExecOptions {
                    cwd: Some(PathBuf::from(&entry.path)),
                    secrets,
                    timeout: timeout_secs.map(std::time::Duration::from_secs),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| anyhow::anyhow!(e))?;
        Ok(CommandResponse::Exec {
            exit_code: result.exit_code,
            stdout: result.stdout,
            stderr: result.stderr,
        })
    }

    fn project_runtime(&self, project_path: &str) -> Result<Arc<dyn Runtime>> {
        // Branch listing uses the runtime of any workspace in the project,
        // falling back to local.
        let config = self.config.lock().unwrap();
        let runtime_config = config
            .project(project_path)
            .and_then(|p| p.workspaces.first())
            .and_then(|w| w.runtime.clone());
        runtime_for(runtime_config.as_ref()).map_err(|e| anyhow::anyhow!(e))
    }

    fn find_entry(
        &self,
        project_path: &str,
        name: &str,
    ) -> Result<(WorkspaceEntry, String)> {
        let config = self.config.lock().unwrap();
        let project = config
            .project(project_path)
            .with_context(|| format!("unknown project {project_path}"))?;
        let entry = project
            .workspaces
            .iter()
            .find(|w| w.name == name)
            .with_context(|| format!("unknown workspace {name}"))?;
        Ok((entry.clone(), project.display_name()))
    }

    fn find_entry_by_id(&self, workspace_id: &str) -> Result<(WorkspaceEntry, ProjectConfig)> {
        let config = self.config.lock().unwrap();
        for project in &config.projects {
            if let Some(entry) = project.workspaces.iter().find(|w| w.id == workspace_id) {
                return Ok((entry.clone(), project.clone()));
            }
        }
        bail!("unknown workspace {workspace_id}")
    }

    fn persist_entry(
        &self,
        project_path: &str,
        project_name: &str,
        entry: WorkspaceEntry,
    ) -> Result<WorkspaceMetadata> {
        let meta = {
            let mut config = self.config.lock().unwrap();
            let project = ensure_project(&mut config, project_path);
            project.workspaces.push(entry.clone());
            self.save_config(&config)?;
            self.metadata_for(&entry, project_path, project_name)
        };
        self.publish_metadata(&entry.id, Some(meta.clone()));
        Ok(meta)
    }

    fn save_config(&self, config: &Config) -> Result<()> {
        if let Some(path) = &self.config_path {
            mux_config::save(config, Some(path))?;
        }
        Ok(())
    }

    fn metadata_for(
        &self,
        entry: &WorkspaceEntry,
        project_path: &str,
        project_name: &str,
    ) -> WorkspaceMetadata {
        let streaming = self
            .sessions
            .lock()
            .unwrap()
            .get(&entry.id)
            .map(|s| s.is_streaming())
            .unwrap_or(false);
        WorkspaceMetadata {
            workspace_id: entry.id.clone(),
            name: entry.name.clone(),
            title: entry
                .title
                .clone()
                .unwrap_or_else(|| entry.name.clone()),
            project_path: project_path.to_string(),
            project_name: project_name.to_string(),
            workspace_path: entry.path.clone(),
            created_at: entry.created_at,
            runtime: entry.runtime.clone(),
            incompatible_runtime: entry.incompatible_runtime
                || runtime_for(entry.runtime.as_ref()).is_err(),
            streaming,
            last_assistant_completed_at: None,
        }
    }

    fn publish_metadata(&self, workspace_id: &str, metadata: Option<WorkspaceMetadata>) {
        let _ = self.metadata_tx.send(WorkspaceMetadataEvent {
            workspace_id: workspace_id.to_string(),
            metadata,
        });
    }

    fn spawn_init(
        self: &Arc<Self>,
        workspace_id: &str,
        project_path: &str,
        workspace_path: &Path,
        runtime: Arc<dyn Runtime>,
    ) {
        let init_mgr = Arc::clone(&self.init_mgr);
        init_mgr.start_init(workspace_id, project_path);
        let sink_mgr = Arc::clone(&init_mgr);
        let ws_id = workspace_id.to_string();
        let sink_ws = ws_id.clone();
        let sink: mux_runtime::InitSink = Arc::new(move |line, is_stderr| {
            sink_mgr.append_output(&sink_ws, line, is_stderr);
        });
        let project = PathBuf::from(project_path);
        let workspace = workspace_path.to_path_buf();
        tokio::spawn(async move {
            let code = match runtime.init_workspace(&project, &workspace, sink).await {
                Ok(code) => code,
                Err(e) => {
                    warn!(workspace = %ws_id, error = %e, "init hook failed to run");
                    -1
                }
            };
            init_mgr.end_init(&ws_id, code);
        });
    }

    fn copy_session_files(&self, source_id: &str, new_id: &str) {
        for file in ["chat.jsonl", "partial.json"] {
            let src = self.history.chat_path(source_id).with_file_name(file);
            if !src.exists() {
                continue;
            }
            let dst = self.history.chat_path(new_id).with_file_name(file);
            if let Some(dir) = dst.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Err(e) = std::fs::copy(&src, &dst) {
                warn!(error = %e, "copying session file for fork failed");
            }
        }
    }
}

fn ensure_project<'a>(config: &'a mut Config, project_path: &str) -> &'a mut ProjectConfig {
    if config.project(project_path).is_none() {
        config.projects.push(ProjectConfig {
            path: project_path.to_string(),
            name: None,
            trunk_branch: None,
            workspaces: Vec::new(),
        });
    }
    config.project_mut(project_path).expect("just inserted")
}

/// Build providers from config: known hosted endpoints get default URLs,
/// everything else needs an explicit `base_url`. All of them speak the
/// OpenAI-compatible streaming wire.
pub fn default_provider_factory(config: &Config) -> ProviderFactory {
    let providers = config.providers.clone();
    Arc::new(move |model: &ModelRef| {
        let cfg = providers.get(&model.provider);
        if cfg.map(|c| c.disabled).unwrap_or(false) {
            return Err(StreamError::new(
                StreamErrorKind::ProviderDisabled,
                format!("provider {} is disabled", model.provider),
            ));
        }
        let base_url = cfg
            .and_then(|c| c.base_url.clone())
            .or_else(|| default_base_url(&model.provider).map(str::to_string))
            .ok_or_else(|| {
                StreamError::new(
                    StreamErrorKind::ProviderNotSupported,
                    format!(
                        "provider {} has no endpoint; set providers.{}.base_url",
                        model.provider, model.provider
                    ),
                )
            })?;
        let api_key = cfg.and_then(|c| c.resolve_api_key()).or_else(|| {
            std::env::var(format!("{}_API_KEY", model.provider.to_uppercase())).ok()
        });
        let local = base_url.contains("localhost") || base_url.contains("127.0.0.1");
        if api_key.is_none() && !local {
            return Err(StreamError::new(
                StreamErrorKind::Authentication {
                    auth_kind: mux_model::AuthErrorKind::ApiKeyMissing,
                    provider: model.provider.clone(),
                },
                format!("no API key configured for provider {}", model.provider),
            ));
        }
        let provider: Arc<dyn ChatProvider> = Arc::new(OpenAiCompatProvider::new(
            model.provider.clone(),
            model.model.clone(),
            &base_url,
            api_key,
        ));
        Ok(provider)
    })
}

fn default_base_url(provider: &str) -> Option<&'static str> {
    match provider {
        "openai" => Some("https://api.openai.com/v1"),
        "openrouter" => Some("https://openrouter.ai/api/v1"),
        "groq" => Some("https://api.groq.com/openai/v1"),
        _ => None,
    }
}
