//! In-memory connections and dispatchers for driving the library without a network.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use remote_jobs::{
    CommandOutput, Connection, Connector, Connectors, Dispatcher, Host, RemoteError,
};

/// Canned reply for commands starting with a given program name.
#[derive(Debug, Clone)]
pub enum Reply {
    Output(CommandOutput),
    Transport,
    Protocol,
    NotFound,
}

impl Reply {
    pub fn stdout(stdout: &str) -> Self {
        Reply::Output(CommandOutput {
            stdout: stdout.to_string(),
            stderr: String::new(),
            exit_code: Some(0),
        })
    }

    pub fn stderr(stderr: &str) -> Self {
        Reply::Output(CommandOutput {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
        })
    }
}

/// Replies shared by every connection a `MockConnector` opens.
#[derive(Clone, Default)]
pub struct Script(Arc<Mutex<HashMap<String, Reply>>>);

impl Script {
    pub fn on(&self, program: &str, reply: Reply) -> &Self {
        self.0.lock().unwrap().insert(program.to_string(), reply);
        self
    }

    fn reply(&self, cmd: &str) -> Reply {
        let program = cmd.split_whitespace().next().unwrap_or("");
        self.0
            .lock()
            .unwrap()
            .get(program)
            .cloned()
            .unwrap_or_else(|| Reply::stdout(""))
    }
}

pub struct MockConnection {
    host: Host,
    script: Script,
    pub commands: Mutex<Vec<(String, bool)>>,
    pub closed: AtomicBool,
}

impl MockConnection {
    pub fn executed(&self) -> Vec<String> {
        self.commands
            .lock()
            .unwrap()
            .iter()
            .map(|(cmd, _)| cmd.clone())
            .collect()
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn host(&self) -> &Host {
        &self.host
    }

    async fn run_command(
        &self,
        cmd: &str,
        wait_exit: bool,
    ) -> Result<Option<CommandOutput>, RemoteError> {
        self.commands
            .lock()
            .unwrap()
            .push((cmd.to_string(), wait_exit));
        let reply = match self.script.reply(cmd) {
            Reply::Output(output) => output,
            Reply::Transport => return Err(RemoteError::Transport("connection reset".into())),
            Reply::Protocol => return Err(RemoteError::Protocol("bad packet".into())),
            Reply::NotFound => return Err(RemoteError::Path(format!("{}: not found", cmd))),
        };
        Ok(wait_exit.then_some(reply))
    }

    async fn close(&self) -> Result<(), RemoteError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Opens `MockConnection`s, optionally failing the first few handshakes.
#[derive(Default)]
pub struct MockConnector {
    pub script: Script,
    pub connects: AtomicUsize,
    pub failures_left: AtomicUsize,
    pub last_password: Mutex<Option<String>>,
    pub opened: Mutex<Vec<Arc<MockConnection>>>,
    pub delays: Mutex<HashMap<String, Duration>>,
}

impl MockConnector {
    pub fn failing(times: usize) -> Self {
        let connector = Self::default();
        connector.failures_left.store(times, Ordering::SeqCst);
        connector
    }

    /// Stalls every handshake with `address` for `delay`.
    pub fn delay(&self, address: &str, delay: Duration) {
        self.delays
            .lock()
            .unwrap()
            .insert(address.to_string(), delay);
    }

    pub fn last_opened(&self) -> Arc<MockConnection> {
        Arc::clone(self.opened.lock().unwrap().last().expect("a connection"))
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(
        &self,
        host: &Host,
        _user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Arc<dyn Connection>, RemoteError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.delays.lock().unwrap().get(&host.address).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.last_password.lock().unwrap() = password.map(str::to_string);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(RemoteError::Auth(format!("{} rejected the password", host.address)));
        }
        let connection = Arc::new(MockConnection {
            host: host.clone(),
            script: self.script.clone(),
            commands: Mutex::new(vec![]),
            closed: AtomicBool::new(false),
        });
        self.opened.lock().unwrap().push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub fn mock_connectors(connector: Arc<MockConnector>) -> Connectors {
    let mut connectors = Connectors::empty();
    connectors.register("mock", connector);
    connectors
}

pub fn mock_host(name: &str) -> Host {
    Host::new(name, format!("{}.example.org", name)).with_protocol("mock")
}

/// Records every re-enqueued `(uid, event)` pair.
#[derive(Default)]
pub struct RecordingDispatcher {
    pub queued: Mutex<Vec<(String, String)>>,
}

impl RecordingDispatcher {
    pub fn queued(&self) -> Vec<(String, String)> {
        self.queued.lock().unwrap().clone()
    }
}

impl Dispatcher for RecordingDispatcher {
    fn enqueue(&self, uid: &str, event: &str) {
        self.queued
            .lock()
            .unwrap()
            .push((uid.to_string(), event.to_string()));
    }
}
