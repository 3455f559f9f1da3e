//! Remote shell sessions.
//!
//! `Connection` is what handlers and helpers talk to; `Connector` opens connections for one
//! protocol tag. `Connectors` maps tags to connectors and ships with OpenSSH registered as
//! `"ssh"`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use openssh::{KnownHosts, Session as SSHSession, SessionBuilder};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::RemoteError;
use crate::host::Host;
use crate::remote::shell_quote;

/// Probe that prints a vendor signature on both POSIX shells and `cmd.exe`.
const OS_PROBE: &str = "uname -s || ver";

/// Result of a command that was waited on. Streams are trimmed.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteOs {
    Linux,
    Windows,
    Unknown,
}

impl RemoteOs {
    /// Looks for vendor signatures in the output of `OS_PROBE`.
    pub fn detect(output: &str) -> Self {
        let output = output.to_lowercase();
        if output.contains("linux") {
            RemoteOs::Linux
        } else if output.contains("windows") || output.contains("microsoft") {
            RemoteOs::Windows
        } else {
            RemoteOs::Unknown
        }
    }
}

impl fmt::Display for RemoteOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RemoteOs::Linux => "linux",
            RemoteOs::Windows => "windows",
            RemoteOs::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// An open, authenticated session to one `Host`.
///
/// Commands issued through one connection run one at a time, in call order.
#[async_trait]
pub trait Connection: Send + Sync {
    fn host(&self) -> &Host;

    /// Runs `cmd` in the remote shell.
    ///
    /// With `wait_exit` the call returns once the exit status is known. Without it the command
    /// is detached on the remote side and `None` comes back immediately. A non-zero exit is
    /// reported through the output, except when the shell itself could not execute the
    /// command, which fails with `RemoteError::Path`.
    async fn run_command(
        &self,
        cmd: &str,
        wait_exit: bool,
    ) -> Result<Option<CommandOutput>, RemoteError>;

    async fn close(&self) -> Result<(), RemoteError>;

    /// Advisory liveness probe. Never fails.
    async fn is_active(&self) -> bool {
        match self.run_command("echo", true).await {
            Ok(_) => true,
            Err(e) => {
                warn!(host = %self.host(), error = %e, "connection is not active");
                false
            }
        }
    }

    /// Best-effort operating system detection. Never fails.
    async fn which_os(&self) -> RemoteOs {
        match self.run_command(OS_PROBE, true).await {
            Ok(Some(output)) => RemoteOs::detect(&output.stdout),
            Ok(None) => RemoteOs::Unknown,
            Err(e) => {
                warn!(host = %self.host(), error = %e, "could not probe remote OS");
                RemoteOs::Unknown
            }
        }
    }
}

/// Opens connections for one protocol tag.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        host: &Host,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<dyn Connection>, RemoteError>;
}

/// Protocol tag to connector map.
#[derive(Clone)]
pub struct Connectors {
    factories: HashMap<String, Arc<dyn Connector>>,
}

impl Connectors {
    /// A registry with nothing registered.
    pub fn empty() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registers `connector` for `protocol`, returning the one it replaces.
    pub fn register(
        &mut self,
        protocol: impl Into<String>,
        connector: Arc<dyn Connector>,
    ) -> Option<Arc<dyn Connector>> {
        self.factories.insert(protocol.into(), connector)
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn Connector>> {
        self.factories.get(protocol).cloned()
    }

    pub fn protocols(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for Connectors {
    fn default() -> Self {
        let mut connectors = Self::empty();
        connectors.register("ssh", Arc::new(SshConnector::default()));
        connectors
    }
}

/// OpenSSH connector using a multiplexed master connection.
///
/// Authentication goes through keys and the agent; a password handed to it is not forwarded.
#[derive(Debug, Clone)]
pub struct SshConnector {
    pub connect_timeout: Duration,
    pub strict_host_keys: bool,
}

impl Default for SshConnector {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            strict_host_keys: true,
        }
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        host: &Host,
        user: Option<&str>,
        _password: Option<&str>,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        if let Some(key) = &host.key_filename {
            if !key.is_file() {
                return Err(RemoteError::Config(format!(
                    "key file {} does not exist or is not a regular file",
                    key.display()
                )));
            }
        }

        let mut builder = SessionBuilder::default();
        builder
            .port(host.port)
            .connect_timeout(self.connect_timeout)
            .known_hosts_check(if self.strict_host_keys {
                KnownHosts::Strict
            } else {
                KnownHosts::Add
            });
        if let Some(user) = user {
            builder.user(user.to_string());
        }
        if let Some(key) = &host.key_filename {
            builder.keyfile(key);
        }

        let session = match builder.connect_mux(&host.address).await {
            Ok(session) => session,
            Err(e) => {
                let e = classify(e);
                warn!(host = %host, error = %e, "failed to connect");
                return Err(e);
            }
        };
        info!(host = %host, "connected");
        Ok(Arc::new(SshConnection {
            host: host.clone(),
            session: Mutex::new(Some(session)),
        }))
    }
}

pub struct SshConnection {
    host: Host,
    session: Mutex<Option<SSHSession>>,
}

#[async_trait]
impl Connection for SshConnection {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run_command(
        &self,
        cmd: &str,
        wait_exit: bool,
    ) -> Result<Option<CommandOutput>, RemoteError> {
        let guard = self.session.lock().await;
        let session = guard
            .as_ref()
            .ok_or_else(|| RemoteError::Transport(format!("{} connection is closed", self.host)))?;

        debug!(host = %self.host, cmd, wait_exit, "run");
        if !wait_exit {
            let detached = format!("nohup sh -c {} >/dev/null 2>&1 &", shell_quote(cmd));
            session.shell(detached).output().await.map_err(classify)?;
            return Ok(None);
        }

        let output = session.shell(cmd).output().await.map_err(classify)?;
        let output = CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            exit_code: output.status.code(),
        };
        check_executed(cmd, output).map(Some)
    }

    async fn close(&self) -> Result<(), RemoteError> {
        if let Some(session) = self.session.lock().await.take() {
            info!(host = %self.host, "terminating connection");
            session.close().await.map_err(classify)?;
        }
        Ok(())
    }
}

/// Separates "the shell could not run it" from "it ran and exited non-zero".
pub(crate) fn check_executed(cmd: &str, output: CommandOutput) -> Result<CommandOutput, RemoteError> {
    match output.exit_code {
        Some(126) | Some(127) => Err(RemoteError::Path(format!(
            "'{}': {}",
            cmd,
            if output.stderr.is_empty() {
                "command not found or not executable"
            } else {
                output.stderr.as_str()
            }
        ))),
        _ => Ok(output),
    }
}

fn classify(error: openssh::Error) -> RemoteError {
    let mut message = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    let transport = matches!(
        error,
        openssh::Error::Connect(_)
            | openssh::Error::Master(_)
            | openssh::Error::Disconnected
            | openssh::Error::RemoteProcessTerminated
    );
    classify_message(message, transport)
}

fn classify_message(message: String, transport: bool) -> RemoteError {
    let lower = message.to_lowercase();
    if lower.contains("host key verification failed")
        || lower.contains("remote host identification has changed")
    {
        RemoteError::HostKey(message)
    } else if lower.contains("permission denied") || lower.contains("too many authentication") {
        RemoteError::Auth(message)
    } else if lower.contains("timed out") || lower.contains("timeout") {
        RemoteError::Timeout(message)
    } else if transport
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("no route to host")
        || lower.contains("could not resolve hostname")
    {
        RemoteError::Transport(message)
    } else {
        RemoteError::Protocol(message)
    }
}
