//! Best-effort syslog forwarding of raw reports.
//!
//! A [`Forwarder`] keeps one connection to a remote log collector and writes
//! each report as a single syslog line:
//!
//! ```text
//! <28>2024-01-01T12:00:00+01:00 host example.com[4242]: CSP report from Domain example.com : {...}
//! ```
//!
//! Delivery is not guaranteed. A failed write on a live connection gets one
//! reconnect and one retry; after that the message is dropped and logged.
//!
//! Ingestion never talks to the forwarder directly. It pushes onto a bounded
//! queue through a [`ForwarderSender`]; one consumer task owns the forwarder,
//! which caps outbound connections at one regardless of load.

use std::fmt;
use std::io;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Local, SecondsFormat};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Syslog facility `daemon`
const FACILITY_DAEMON: u8 = 3;

/// Syslog severity `warning`
const SEVERITY_WARNING: u8 = 4;

/// Priority sent with every message
pub const PRIORITY: u8 = (FACILITY_DAEMON << 3) | SEVERITY_WARNING;

/// Default capacity of the forwarding queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Network transport to the log collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Transport::Tcp),
            "udp" => Ok(Transport::Udp),
            other => Err(format!("unknown transport '{}', expected tcp or udp", other)),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// Configuration for the forwarder.
#[derive(Debug, Clone)]
pub struct ForwarderConfig {
    /// Collector address (host:port)
    pub address: String,

    pub transport: Transport,

    /// Bound on establishing a connection
    pub connect_timeout: Duration,

    /// Bound on writing one message
    pub write_timeout: Duration,
}

impl ForwarderConfig {
    pub fn new(address: impl Into<String>, transport: Transport) -> Self {
        Self {
            address: address.into(),
            transport,
            connect_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Errors from forwarding a message.
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("connection failed to {target}: {source}")]
    ConnectionFailed {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("write failed: {0}")]
    WriteFailed(#[from] io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("no connection to collector")]
    NoConnection,
}

/// Errors from queueing a message for forwarding.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("Forward queue is full")]
    Full,

    #[error("Forwarder has been closed")]
    Closed,
}

enum Connection {
    Tcp(TcpStream),
    Udp(UdpSocket),
}

impl Connection {
    async fn open(address: &str, transport: Transport) -> io::Result<Self> {
        match transport {
            Transport::Tcp => {
                let stream = TcpStream::connect(address).await?;
                let _ = stream.set_nodelay(true);
                Ok(Connection::Tcp(stream))
            }
            Transport::Udp => {
                let target = lookup_host(address).await?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing")
                })?;
                let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(target).await?;
                Ok(Connection::Udp(socket))
            }
        }
    }

    async fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self {
            Connection::Tcp(stream) => stream.write_all(bytes).await,
            Connection::Udp(socket) => socket.send(bytes).await.map(|_| ()),
        }
    }

    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        match self {
            Connection::Tcp(stream) => stream.local_addr(),
            Connection::Udp(socket) => socket.local_addr(),
        }
    }

    async fn close(self) {
        if let Connection::Tcp(mut stream) = self {
            let _ = stream.shutdown().await;
        }
    }
}

/// Counters for a forwarder's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwarderStats {
    pub sent: u64,
    pub dropped: u64,
    pub connects: u64,
    pub connect_failures: u64,
}

/// Persistent syslog client.
pub struct Forwarder {
    config: ForwarderConfig,
    hostname: String,
    pid: u32,
    connection: Option<Connection>,
    stats: ForwarderStats,
}

impl Forwarder {
    /// Create a forwarder. No connection is made until the first send.
    pub fn new(config: ForwarderConfig) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_default();

        Self {
            config,
            hostname,
            pid: std::process::id(),
            connection: None,
            stats: ForwarderStats::default(),
        }
    }

    pub fn stats(&self) -> ForwarderStats {
        self.stats
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Send one message tagged with `tag`.
    ///
    /// Connects first if needed. A write failure on an existing connection
    /// is followed by exactly one reconnect and one retry.
    pub async fn send(&mut self, tag: &str, message: &str) -> Result<(), ForwarderError> {
        if self.connection.is_some() {
            match self.write_message(tag, message).await {
                Ok(()) => {
                    self.stats.sent += 1;
                    return Ok(());
                }
                Err(e) => {
                    debug!(
                        target_addr = %self.config.address,
                        error = %e,
                        "Write to collector failed, reconnecting"
                    );
                }
            }
        }

        self.connect().await?;
        self.write_message(tag, message).await?;
        self.stats.sent += 1;
        Ok(())
    }

    /// Release the connection, if any.
    pub async fn close(&mut self) {
        if let Some(conn) = self.connection.take() {
            conn.close().await;
        }
    }

    async fn connect(&mut self) -> Result<(), ForwarderError> {
        self.close().await;

        let opened = timeout(
            self.config.connect_timeout,
            Connection::open(&self.config.address, self.config.transport),
        )
        .await;

        let conn = match opened {
            Ok(Ok(conn)) => conn,
            Ok(Err(source)) => {
                self.stats.connect_failures += 1;
                return Err(ForwarderError::ConnectionFailed {
                    target: self.config.address.clone(),
                    source,
                });
            }
            Err(_) => {
                self.stats.connect_failures += 1;
                return Err(ForwarderError::ConnectionFailed {
                    target: self.config.address.clone(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connection timed out"),
                });
            }
        };

        if self.hostname.is_empty() {
            if let Ok(addr) = conn.local_addr() {
                self.hostname = addr.to_string();
            }
        }

        self.stats.connects += 1;
        debug!(
            target_addr = %self.config.address,
            transport = %self.config.transport,
            "Connected to collector"
        );
        self.connection = Some(conn);
        Ok(())
    }

    /// Write once; a failed write discards the connection.
    async fn write_message(&mut self, tag: &str, message: &str) -> Result<(), ForwarderError> {
        let line = format_message(PRIORITY, Local::now(), &self.hostname, tag, self.pid, message);
        let conn = self
            .connection
            .as_mut()
            .ok_or(ForwarderError::NoConnection)?;

        let result = match timeout(self.config.write_timeout, conn.write(line.as_bytes())).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ForwarderError::WriteFailed(e)),
            Err(_) => Err(ForwarderError::Timeout),
        };

        if result.is_err() {
            if let Some(conn) = self.connection.take() {
                conn.close().await;
            }
        }
        result
    }
}

/// Format a syslog line: `<PRI>TIMESTAMP HOSTNAME TAG[PID]: MSG`, newline terminated.
pub fn format_message(
    priority: u8,
    timestamp: DateTime<Local>,
    hostname: &str,
    tag: &str,
    pid: u32,
    message: &str,
) -> String {
    let nl = if message.ends_with('\n') { "" } else { "\n" };
    format!(
        "<{}>{} {} {}[{}]: {}{}",
        priority,
        timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        hostname,
        tag,
        pid,
        message,
        nl
    )
}

/// One report waiting to be forwarded.
#[derive(Debug)]
struct ForwardRequest {
    domain: String,
    body: String,
}

/// Handle for queueing reports; cheap to clone.
#[derive(Clone, Debug)]
pub struct ForwarderSender {
    tx: mpsc::Sender<ForwardRequest>,
}

impl ForwarderSender {
    /// Queue a report without waiting.
    pub fn try_forward(&self, domain: &str, body: &str) -> Result<(), DispatchError> {
        let request = ForwardRequest {
            domain: domain.to_string(),
            body: body.to_string(),
        };
        self.tx.try_send(request).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::Full,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Spawn the consumer task owning `forwarder`.
///
/// The task ends, closing the connection, once every sender is dropped and
/// the queue has drained. It returns the final counters.
pub fn spawn_forwarder(
    forwarder: Forwarder,
    capacity: usize,
) -> (ForwarderSender, JoinHandle<ForwarderStats>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let handle = tokio::spawn(run_forwarder(forwarder, rx));
    (ForwarderSender { tx }, handle)
}

async fn run_forwarder(
    mut forwarder: Forwarder,
    mut rx: mpsc::Receiver<ForwardRequest>,
) -> ForwarderStats {
    info!(
        target_addr = %forwarder.config.address,
        transport = %forwarder.config.transport,
        "Forwarder started"
    );

    while let Some(request) = rx.recv().await {
        let message = format!("CSP report from Domain {} : {}", request.domain, request.body);
        if let Err(e) = forwarder.send(&request.domain, &message).await {
            forwarder.stats.dropped += 1;
            warn!(
                domain = %request.domain,
                error = %e,
                "Dropping report, collector unreachable"
            );
        }
    }

    forwarder.close().await;
    let stats = forwarder.stats();
    info!(
        sent = stats.sent,
        dropped = stats.dropped,
        connects = stats.connects,
        connect_failures = stats.connect_failures,
        "Forwarder stopped"
    );
    stats
}
