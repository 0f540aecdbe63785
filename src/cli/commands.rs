//! CLI command definitions using clap.
//!
//! Defines the main CLI structure and subcommands:
//! - project: onboard and list projects
//! - protocol: create runs and drive them through their lifecycle
//! - step: run, QA or approve a single step
//! - events / jobs: inspect the audit log and the queue
//! - webhook: feed a CI callback to the reconciler
//! - worker: run the durable queue's worker pool

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use protoflow::domain::{JobStatus, ProtocolStatus, QaPolicy, StepStatus};
use protoflow::reconcile::CiProvider;

/// Protoflow - protocol and step orchestration
#[derive(Parser, Debug)]
#[command(name = "protoflow")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional config file path
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Check if verbose mode is enabled
    pub fn is_verbose(&self) -> bool {
        self.verbose
    }
}

/// Main subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Project management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },

    /// Protocol run lifecycle
    Protocol {
        #[command(subcommand)]
        command: ProtocolCommands,
    },

    /// Step actions
    Step {
        #[command(subcommand)]
        command: StepCommands,
    },

    /// Show the event log, oldest first
    Events {
        /// Protocol run id; all events when omitted
        protocol: Option<i64>,
    },

    /// List queue jobs
    Jobs {
        /// Filter by status (queued, started, finished, failed)
        #[arg(short, long)]
        status: Option<JobStatus>,
    },

    /// Apply a CI callback
    Webhook {
        #[arg(short, long, default_value = "generic")]
        provider: CiProvider,

        /// Branch or ref the callback is about
        #[arg(short, long, conflicts_with = "run_id", required_unless_present = "run_id")]
        branch: Option<String>,

        /// Protocol run id, when known
        #[arg(short, long)]
        run_id: Option<i64>,

        /// Raw provider status (success, failure, in_progress, ...)
        #[arg(short, long)]
        status: String,

        /// Step the callback is about
        #[arg(long)]
        step: Option<i64>,
    },

    /// Run the durable queue's worker pool until ctrl-c
    Worker {
        /// Number of workers; defaults to the configured count
        #[arg(short, long)]
        workers: Option<usize>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProjectCommands {
    /// Onboard a repository
    Add {
        name: String,

        /// Git URL or local path
        git_url: String,

        #[arg(short, long, default_value = "main")]
        base_branch: String,

        /// Default engine id for this project's steps
        #[arg(short, long)]
        engine: Option<String>,

        /// Default QA policy (skip, light, full)
        #[arg(short, long)]
        qa_policy: Option<QaPolicy>,
    },

    /// List projects
    List,
}

#[derive(Subcommand, Debug, Clone)]
pub enum ProtocolCommands {
    /// Open a protocol run
    Create {
        /// Project id
        project: i64,

        /// Protocol name; also the branch CI callbacks refer to
        name: String,

        /// Spec file (YAML or JSON)
        #[arg(short, long, conflicts_with = "root")]
        spec: Option<PathBuf>,

        /// Directory of NN-*.md step files
        #[arg(short, long)]
        root: Option<PathBuf>,

        #[arg(short, long)]
        description: Option<String>,

        /// Base branch; defaults to the project's
        #[arg(short, long)]
        base_branch: Option<String>,
    },

    /// List protocol runs
    List {
        /// Only runs of this project
        #[arg(short, long)]
        project: Option<i64>,
    },

    /// Show a protocol run and its steps
    Show { id: i64 },

    /// Plan the protocol and, with auto-advance, start it
    Start {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },

    /// Run the next step that is not completed
    Next {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },

    Pause {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },

    Resume {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },

    Cancel {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },

    /// Retry the latest failed or blocked step
    Retry {
        id: i64,
        #[arg(short, long)]
        expect: Option<ProtocolStatus>,
    },
}

#[derive(Subcommand, Debug, Clone)]
pub enum StepCommands {
    /// Execute a step
    Run {
        id: i64,
        #[arg(short, long)]
        expect: Option<StepStatus>,
    },

    /// Queue a QA evaluation
    Qa {
        id: i64,
        #[arg(short, long)]
        expect: Option<StepStatus>,
    },

    /// Accept a step awaiting QA
    Approve {
        id: i64,
        #[arg(short, long)]
        expect: Option<StepStatus>,
    },
}
