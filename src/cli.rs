// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

/// Multi-workspace AI coding agent host.
#[derive(Parser, Debug)]
#[command(name = "mux", version, about)]
pub struct Cli {
    /// Path to the config file (defaults to <mux home>/config.json)
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Bearer token for the command surface
    #[arg(long, global = true, env = "MUX_TOKEN")]
    pub token: Option<String>,

    /// Verbose logging to stderr (or set MUX_LOG)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Generate the API bearer token (shown once; only its hash is stored)
    Token,
    /// Print the effective configuration
    ShowConfig,
    /// Create a workspace for a project
    Create {
        /// Project repository path
        #[arg(long)]
        project: String,
        /// Workspace title (sanitized into the branch-safe name)
        title: String,
        /// Create on a remote host instead of locally
        #[arg(long)]
        ssh: Option<String>,
    },
    /// Fork an existing workspace at its current HEAD
    Fork {
        #[arg(long)]
        project: String,
        source_name: String,
        title: String,
    },
    /// Rename a workspace (directory + branch)
    Rename {
        #[arg(long)]
        project: String,
        old_name: String,
        new_name: String,
    },
    /// Delete a workspace worktree
    Delete {
        #[arg(long)]
        project: String,
        name: String,
        /// Delete even with uncommitted changes
        #[arg(long)]
        force: bool,
    },
    /// List all workspaces
    List,
    /// List branches of a project
    Branches {
        #[arg(long)]
        project: String,
    },
    /// Send a message to a workspace and stream the reply
    Send {
        workspace_id: String,
        text: String,
        /// Model as provider:model, e.g. openai:gpt-4.1
        #[arg(long)]
        model: Option<String>,
        /// Run this turn in plan mode
        #[arg(long)]
        plan: bool,
    },
    /// Run a bash script inside a workspace
    Exec {
        workspace_id: String,
        script: String,
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}
