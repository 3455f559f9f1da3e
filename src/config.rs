//! Configuration for remote-jobs.
//!
//! Holds the clap structs for command line arguments and flags. Targets themselves live in the
//! registry file named by `--targets-file`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(version, author, about)]
pub struct Config {
    /// Target registry file
    #[arg(
        long,
        global = true,
        env = "REMOTE_JOBS_TARGETS",
        default_value = "targets.json"
    )]
    pub targets_file: PathBuf,

    /// Login user. Defaults to the target's own username.
    #[arg(long, short, global = true)]
    pub user: Option<String>,

    #[command(subcommand)]
    pub action: Action,
}

#[derive(Subcommand)]
pub enum Action {
    /// Manage known targets
    #[command(subcommand)]
    Targets(TargetsAction),

    /// Run a shell command on a target
    Run {
        /// Target name. Defaults to the registry's default target.
        #[arg(long, short)]
        target: Option<String>,
        /// Start the command detached and return immediately
        #[arg(long, short)]
        detach: bool,
        #[arg(required = true, trailing_var_arg = true)]
        command: Vec<String>,
    },

    /// Detect a target's operating system
    Os {
        #[arg(long, short)]
        target: Option<String>,
    },

    /// SHA-256 of a file on a target
    Hash {
        #[arg(long, short)]
        target: Option<String>,
        path: String,
    },

    /// Slurm accounting for jobs on a target
    Sacct {
        #[arg(long, short)]
        target: Option<String>,
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// List batch jobs spawned by a job, from its remote log files
    Submitted {
        #[arg(long, short)]
        target: Option<String>,
        job_id: String,
        #[arg(required = true)]
        logs: Vec<String>,
    },
}

#[derive(Subcommand)]
pub enum TargetsAction {
    /// Print every target
    List,

    /// Register a target
    Add {
        name: String,
        address: String,
        #[arg(long, short, default_value = "22")]
        port: u16,
        #[arg(long, default_value = "ssh")]
        protocol: String,
        #[arg(long)]
        username: Option<String>,
        /// Private key used to authenticate
        #[arg(long)]
        key_file: Option<PathBuf>,
        /// Also make it the default target
        #[arg(long)]
        default: bool,
    },

    /// Remove a target and forget its password
    Remove { name: String },

    /// Make a target the default
    Default { name: String },

    /// Register a target from a YAML or JSON descriptor file
    Import { path: PathBuf },
}
