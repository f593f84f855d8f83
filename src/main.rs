// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use mux_config::{RuntimeConfig, SessionMode};
use mux_core::{
    ChatEvent, Command, CommandResponse, Engine, RawToken, SendOptions, StoredToken,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config_path = cli.config.as_deref().map(PathBuf::from);
    let config = mux_config::load(config_path.as_deref())?;

    if let Commands::Token = cli.command {
        let raw = StoredToken::generate_and_save(&token_path())?;
        println!("{}", raw.as_str());
        eprintln!("Save this token; only its hash is stored on disk.");
        return Ok(());
    }
    if let Commands::ShowConfig = cli.command {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    }

    // One-shot commands run against an in-process engine. With no token
    // configured, an ephemeral one covers just this invocation.
    let (stored, token) = match cli.token {
        Some(token) => (StoredToken::load(&token_path())?, token),
        None => {
            let raw = RawToken::generate();
            let token = raw.as_str().to_string();
            (raw.into_stored(), token)
        }
    };
    let engine = Engine::new(
        config,
        Some(config_path.unwrap_or_else(mux_config::config_path)),
        mux_config::sessions_dir(),
        stored,
        None,
    );

    match cli.command {
        Commands::Token | Commands::ShowConfig => unreachable!("handled above"),
        Commands::Create {
            project,
            title,
            ssh,
        } => {
            let runtime = ssh.map(|host| RuntimeConfig::Ssh {
                host,
                port: None,
                user: None,
                identity_file: None,
            });
            let response = engine
                .dispatch(
                    &token,
                    Command::CreateWorkspace {
                        project_path: resolve_project(&project)?,
                        title,
                        runtime,
                    },
                )
                .await?;
            if let CommandResponse::Workspace(meta) = response {
                println!("{}  {}  {}", meta.workspace_id, meta.name, meta.workspace_path);
            }
        }
        Commands::Fork {
            project,
            source_name,
            title,
        } => {
            let response = engine
                .dispatch(
                    &token,
                    Command::ForkWorkspace {
                        project_path: resolve_project(&project)?,
                        source_name,
                        title,
                    },
                )
                .await?;
            if let CommandResponse::Workspace(meta) = response {
                println!("{}  {}  {}", meta.workspace_id, meta.name, meta.workspace_path);
            }
        }
        Commands::Rename {
            project,
            old_name,
            new_name,
        } => {
            engine
                .dispatch(
                    &token,
                    Command::RenameWorkspace {
                        project_path: resolve_project(&project)?,
                        old_name,
                        new_name,
                    },
                )
                .await?;
        }
        Commands::Delete {
            project,
            name,
            force,
        } => {
            engine
                .dispatch(
                    &token,
                    Command::DeleteWorkspace {
                        project_path: resolve_project(&project)?,
                        name,
                        force,
                    },
                )
                .await?;
        }
        Commands::List => {
            if let CommandResponse::Workspaces(list) =
                engine.dispatch(&token, Command::ListWorkspaces).await?
            {
                for ws in list {
                    println!(
                        "{}  {:<20}  {}  {}",
                        ws.workspace_id, ws.name, ws.project_name, ws.workspace_path
                    );
                }
            }
        }
        Commands::Branches { project } => {
            if let CommandResponse::Branches(branches) = engine
                .dispatch(
                    &token,
                    Command::ListBranches {
                        project_path: resolve_project(&project)?,
                    },
                )
                .await?
            {
                for branch in branches {
                    println!("{branch}");
                }
            }
        }
        Commands::Send {
            workspace_id,
            text,
            model,
            plan,
        } => {
            stream_send(&engine, &token, &workspace_id, &text, model, plan).await?;
        }
        Commands::Exec {
            workspace_id,
            script,
            timeout_secs,
        } => {
            if let CommandResponse::Exec {
                exit_code,
                stdout,
                stderr,
            } = engine
                .dispatch(
                    &token,
                    Command::ExecuteBash {
                        workspace_id,
                        script,
                        timeout_secs,
                    },
                )
                .await?
            {
                print!("{stdout}");
                eprint!("{stderr}");
                std::process::exit(exit_code);
            }
        }
    }
    Ok(())
}

/// Send one message and stream the assistant's reply to stdout until the
/// stream settles.
async fn stream_send(
    engine: &Arc<Engine>,
    token: &str,
    workspace_id: &str,
    text: &str,
    model: Option<String>,
    plan: bool,
) -> Result<()> {
    let response = engine
        .dispatch(
            token,
            Command::SubscribeChat {
                workspace_id: workspace_id.to_string(),
            },
        )
        .await?;
    let CommandResponse::ChatSubscription { mut receiver, .. } = response else {
        bail!("unexpected response to subscribeChat");
    };

    let options = SendOptions {
        model,
        mode: plan.then_some(SessionMode::Plan),
        ..Default::default()
    };
    engine
        .dispatch(
            token,
            Command::SendMessage {
                workspace_id: workspace_id.to_string(),
                text: text.to_string(),
                options,
                synthetic: false,
            },
        )
        .await?;

    use std::io::Write;
    loop {
        match receiver.recv().await {
            Ok(ChatEvent::StreamDelta { delta, .. }) => {
                print!("{delta}");
                std::io::stdout().flush().ok();
            }
            Ok(ChatEvent::ToolCallStart { tool_name, .. }) => {
                eprintln!("[tool: {tool_name}]");
            }
            Ok(ChatEvent::StreamEnd { .. }) => {
                println!();
                return Ok(());
            }
            Ok(ChatEvent::StreamAbort { .. }) => {
                eprintln!("[stream aborted]");
                return Ok(());
            }
            Ok(ChatEvent::Error {
                error_type,
                message,
            }) => bail!("stream failed ({error_type}): {message}"),
            Ok(_) => {}
            Err(e) => bail!("event channel closed: {e}"),
        }
    }
}

fn resolve_project(path: &str) -> Result<String> {
    let expanded = shell_expand(path);
    let canonical = std::fs::canonicalize(&expanded)
        .with_context(|| format!("project path not found: {path}"))?;
    Ok(canonical.to_string_lossy().into_owned())
}

fn shell_expand(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

fn token_path() -> PathBuf {
    mux_config::mux_home().join("token.json")
}

fn init_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_env("MUX_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default));
    let registry = tracing_subscriber::registry().with(filter);
    if let Ok(path) = std::env::var("MUX_LOG_FILE") {
        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(Path::new(&path))
        {
            registry
                .with(fmt::layer().with_writer(Arc::new(file)).with_ansi(false))
                .init();
            return;
        }
    }
    registry.with(fmt::layer().with_writer(std::io::stderr)).init();
}
