//! remote-jobs: submit, monitor, and collect work on remote hosts over SSH.

// Serde helper module.
mod serde;
// Command line arguments and configuration.
pub mod config;
// Error handling.
pub mod error;
// How to describe and authenticate to hosts.
pub mod host;
// Remote jobs and their handlers.
pub mod job;
// Connection cache.
pub mod pool;
// Local task dispatch loop.
pub mod queue;
// Remote command and Slurm helpers.
pub mod remote;
// Remote shell sessions.
pub mod session;
// Persisted host registry.
pub mod targets;
// Steppable tasks.
pub mod task;

pub use config::{Action, Config, TargetsAction};
pub use error::RemoteError;
pub use host::{load_host, Credential, Host, MemorySecretStore, SecretStore};
pub use job::{
    Dispatcher, HandlerContext, HandlerRegistry, Job, JobRecord, JobStatus, JobUpdate, Processed,
    RetryPolicy, TaskHandler,
};
pub use pool::ConnectionPool;
pub use queue::{Command, Envelope, MsgType, StatusTable, TaskBuilders, TaskQueue};
pub use remote::{
    all_complete, all_done, all_failed, any_failed, any_running, argstring, fetch_logs,
    find_submitted_jobs, parse_sacct, remote_hash, sacct, shell_quote, SacctRecord,
    SUBMISSION_MARKER,
};
pub use session::{
    CommandOutput, Connection, Connector, Connectors, RemoteOs, SshConnection, SshConnector,
};
pub use targets::TargetRegistry;
pub use task::{execute, Step, Task, TaskCore, TaskSnapshot, TaskState};
