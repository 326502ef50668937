//! Control channel to the external ICMP pinger daemon.
//!
//! The pinger speaks a line-oriented text protocol over a local stream
//! socket. Commands are issued strictly one at a time: a new command goes
//! out only once the previous one was answered. Transient failures keep the
//! queue head and retry after ten seconds; a dropped socket reconnects on
//! the same schedule and resumes from the head.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Instant};
use tracing::{info, warn};

use crate::types::{CustomerId, HostSchemeId};

/// Delay before retrying a failed command or reconnecting, in milliseconds.
pub const PINGER_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Longest response line the pinger may send.
pub const MAXIMUM_LINE_LENGTH: usize = 512;

/// Resolves the configured pinger name: bare names live under `/tmp`, paths
/// are used verbatim.
pub fn resolve_socket_path(name: &str) -> PathBuf {
    if name.contains('/') {
        PathBuf::from(name)
    } else {
        Path::new("/tmp").join(name)
    }
}

#[derive(Debug)]
enum Command {
    Connect(PathBuf),
    AddHost {
        customer_id: CustomerId,
        host_scheme_id: HostSchemeId,
        host: String,
    },
    RemoveCustomer(CustomerId),
    MarkHostDefunct(HostSchemeId),
    GoActive,
    GoInactive,
}

/// Wire commands, queued in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WireCommand {
    Add(HostSchemeId, String),
    Remove(HostSchemeId),
    Defunct(HostSchemeId),
}

impl WireCommand {
    fn line(&self) -> String {
        match self {
            WireCommand::Add(id, host) => format!("A {id} {host}\n"),
            WireCommand::Remove(id) => format!("R {id}\n"),
            WireCommand::Defunct(id) => format!("D {id}\n"),
        }
    }
}

/// Handle to the ping controller task.
#[derive(Clone)]
pub struct PingController {
    tx: mpsc::UnboundedSender<Command>,
}

impl PingController {
    pub fn start(shutdown: watch::Receiver<()>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(PingTask::new().run(rx, shutdown));
        Self { tx }
    }

    /// Points the controller at the pinger socket and connects.
    pub fn connect(&self, socket_path: PathBuf) {
        let _ = self.tx.send(Command::Connect(socket_path));
    }

    /// Registers a host for ping testing, keyed by the owning customer.
    pub fn add_host(&self, customer_id: CustomerId, host_scheme_id: HostSchemeId, host: String) {
        let _ = self.tx.send(Command::AddHost {
            customer_id,
            host_scheme_id,
            host,
        });
    }

    /// Drops every host registered for the customer.
    pub fn remove_customer(&self, customer_id: CustomerId) {
        let _ = self.tx.send(Command::RemoveCustomer(customer_id));
    }

    /// Tells the pinger a host is known-dead.
    pub fn mark_host_defunct(&self, host_scheme_id: HostSchemeId) {
        let _ = self.tx.send(Command::MarkHostDefunct(host_scheme_id));
    }

    /// Re-issues every registered host to the pinger.
    pub fn go_active(&self) {
        let _ = self.tx.send(Command::GoActive);
    }

    /// Withdraws every registered host from the pinger.
    pub fn go_inactive(&self) {
        let _ = self.tx.send(Command::GoInactive);
    }
}

struct Connection {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

struct HostEntry {
    customer_id: CustomerId,
    host: String,
}

struct PingTask {
    hosts: HashMap<HostSchemeId, HostEntry>,
    hosts_by_customer: HashMap<CustomerId, BTreeSet<HostSchemeId>>,
    queue: VecDeque<WireCommand>,
    socket_path: Option<PathBuf>,
    connection: Option<Connection>,
    /// A command was written and its response is still outstanding.
    awaiting_response: bool,
    retry_at: Option<Instant>,
}

impl PingTask {
    fn new() -> Self {
        Self {
            hosts: HashMap::new(),
            hosts_by_customer: HashMap::new(),
            queue: VecDeque::new(),
            socket_path: None,
            connection: None,
            awaiting_response: false,
            retry_at: None,
        }
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>, mut shutdown: watch::Receiver<()>) {
        enum Wake {
            Shutdown,
            Command(Option<Command>),
            Line(Option<String>),
            Retry,
        }

        loop {
            let connected = self.connection.is_some();
            let retry_at = self.retry_at;

            let wake = tokio::select! {
                biased;
                _ = shutdown.changed() => Wake::Shutdown,
                command = rx.recv() => Wake::Command(command),
                line = read_response(&mut self.connection), if connected => Wake::Line(line),
                _ = conditional_sleep(retry_at), if retry_at.is_some() => Wake::Retry,
            };

            match wake {
                Wake::Shutdown => break,
                Wake::Command(None) => break,
                Wake::Command(Some(command)) => self.handle_command(command).await,
                Wake::Line(Some(line)) => self.handle_response(&line).await,
                Wake::Line(None) => self.drop_connection("pinger disconnected unexpectedly"),
                Wake::Retry => {
                    self.retry_at = None;
                    if self.connection.is_none() {
                        self.try_connect().await;
                    }
                    self.issue_next().await;
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect(path) => {
                self.socket_path = Some(path);
                self.try_connect().await;
                self.issue_next().await;
            }
            Command::AddHost {
                customer_id,
                host_scheme_id,
                host,
            } => {
                if self.hosts.contains_key(&host_scheme_id) {
                    return;
                }
                self.hosts.insert(
                    host_scheme_id,
                    HostEntry {
                        customer_id,
                        host: host.clone(),
                    },
                );
                self.hosts_by_customer
                    .entry(customer_id)
                    .or_default()
                    .insert(host_scheme_id);
                self.enqueue(WireCommand::Add(host_scheme_id, host)).await;
            }
            Command::RemoveCustomer(customer_id) => {
                let Some(host_scheme_ids) = self.hosts_by_customer.remove(&customer_id) else {
                    return;
                };
                for host_scheme_id in host_scheme_ids {
                    self.hosts.remove(&host_scheme_id);
                    self.enqueue(WireCommand::Remove(host_scheme_id)).await;
                }
            }
            Command::MarkHostDefunct(host_scheme_id) => {
                self.enqueue(WireCommand::Defunct(host_scheme_id)).await;
            }
            Command::GoActive => {
                let commands: Vec<WireCommand> = self
                    .hosts
                    .iter()
                    .map(|(&id, entry)| WireCommand::Add(id, entry.host.clone()))
                    .collect();
                for command in commands {
                    self.enqueue(command).await;
                }
            }
            Command::GoInactive => {
                let commands: Vec<WireCommand> =
                    self.hosts.keys().map(|&id| WireCommand::Remove(id)).collect();
                for command in commands {
                    self.enqueue(command).await;
                }
            }
        }
    }

    async fn handle_response(&mut self, line: &str) {
        let line = line.trim();
        if line == "OK" {
            self.queue.pop_front();
            self.awaiting_response = false;
            self.issue_next().await;
        } else if line.starts_with("NOPING") {
            // Advisory only; the queue is unaffected.
        } else if line.starts_with("ERROR") {
            warn!(
                command = self.head_line().trim(),
                response = line,
                "pinger rejected command, ignoring"
            );
            self.queue.pop_front();
            self.awaiting_response = false;
            self.issue_next().await;
        } else if line.starts_with("failed") {
            warn!(
                command = self.head_line().trim(),
                response = line,
                "pinger reported transient failure, will retry"
            );
            self.awaiting_response = false;
            self.schedule_retry();
        } else {
            warn!(response = line, "unrecognised pinger response, ignoring");
        }
    }

    fn head_line(&self) -> String {
        self.queue
            .front()
            .map(WireCommand::line)
            .unwrap_or_default()
    }

    async fn enqueue(&mut self, command: WireCommand) {
        self.queue.push_back(command);
        self.issue_next().await;
    }

    /// Writes the queue head when connected, nothing is outstanding, and no
    /// retry is pending.
    async fn issue_next(&mut self) {
        if self.awaiting_response || self.retry_at.is_some() || self.queue.is_empty() {
            return;
        }

        let Some(connection) = self.connection.as_mut() else {
            self.schedule_retry();
            return;
        };

        let line = match self.queue.front() {
            Some(command) => command.line(),
            None => return,
        };
        info!(command = line.trim(), "issuing pinger command");

        match connection.writer.write_all(line.as_bytes()).await {
            Ok(()) => self.awaiting_response = true,
            Err(error) => {
                self.drop_connection(&format!("pinger write failed: {error}"));
            }
        }
    }

    async fn try_connect(&mut self) {
        if self.connection.is_some() {
            return;
        }
        let Some(path) = self.socket_path.clone() else {
            return;
        };

        match UnixStream::connect(&path).await {
            Ok(stream) => {
                let (read_half, write_half) = stream.into_split();
                self.connection = Some(Connection {
                    lines: BufReader::new(read_half).lines(),
                    writer: write_half,
                });
                self.awaiting_response = false;
                info!(path = %path.display(), "connected to pinger");
            }
            Err(error) => {
                warn!(path = %path.display(), error = %error, "failed to connect to pinger");
                self.schedule_retry();
            }
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        warn!("{reason}");
        self.connection = None;
        self.awaiting_response = false;
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        if self.retry_at.is_none() {
            self.retry_at = Some(Instant::now() + PINGER_RETRY_DELAY);
        }
    }
}

/// Reads one response line; `None` means the peer closed the socket or sent
/// garbage beyond the protocol line limit. `next_line` keeps partial input
/// buffered across select cancellations.
async fn read_response(connection: &mut Option<Connection>) -> Option<String> {
    let connection = connection.as_mut()?;
    match connection.lines.next_line().await {
        Ok(Some(line)) if line.len() > MAXIMUM_LINE_LENGTH => None,
        Ok(Some(line)) => Some(line),
        Ok(None) => None,
        Err(_) => None,
    }
}

async fn conditional_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
