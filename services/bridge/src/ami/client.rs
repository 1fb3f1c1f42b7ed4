//! AMI session: TCP connect, login, a single reader task that distributes
//! packets, and the action correlator that matches responses to callers.
//!
//! The socket has exactly one reader. Writers serialise through a mutex on
//! the write half. Responses are routed to pending waiters by `ActionID`;
//! events flow into an mpsc channel drained by the event dispatcher; list
//! actions (`PJSIPShowEndpoints`) collect their event train by `ActionID`
//! until the completion event arrives.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::{AmiCredentials, AsteriskEnv};
use crate::store::Store;

use super::protocol::Packet;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const ACTION_TIMEOUT: Duration = Duration::from_secs(5);
/// A healthy session sees keepalive pongs well inside this window; total
/// silence for this long means the peer is gone.
pub const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(30);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

#[derive(Debug, thiserror::Error)]
pub enum AmiError {
    #[error("asterisk configuration incomplete: missing {0}")]
    ConfigIncomplete(String),

    #[error("dns resolution failed: {0}")]
    Dns(String),

    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    #[error("timed out connecting to asterisk")]
    ConnectTimeout,

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("no response from asterisk within the deadline")]
    ActionTimeout,

    /// `Response: Error` from the PBX; carries the `Message` header.
    #[error("{message}")]
    ActionRejected { message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("not connected to asterisk")]
    NotConnected,
}

type Waiter = oneshot::Sender<Result<Packet, AmiError>>;

struct Collector {
    complete_event: String,
    events: Vec<Packet>,
    done: oneshot::Sender<Result<Vec<Packet>, AmiError>>,
}

#[derive(Default)]
struct Routing {
    waiters: HashMap<String, Waiter>,
    collectors: HashMap<String, Collector>,
}

impl Routing {
    fn drain(&mut self) {
        for (_, waiter) in self.waiters.drain() {
            let _ = waiter.send(Err(AmiError::Transport("ami connection lost".into())));
        }
        for (_, collector) in self.collectors.drain() {
            let _ = collector
                .done
                .send(Err(AmiError::Transport("ami connection lost".into())));
        }
    }
}

/// An authenticated AMI session.
pub struct AmiClient {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    routing: Arc<Mutex<Routing>>,
    alive: Arc<AtomicBool>,
}

impl AmiClient {
    /// Connect, read the banner, log in, and start the reader task.
    ///
    /// Credentials are written byte-exact; see the protocol module. Events
    /// the session receives are forwarded into `event_tx`.
    pub async fn connect(
        creds: &AmiCredentials,
        event_tx: mpsc::Sender<Packet>,
    ) -> Result<Arc<Self>, AmiError> {
        let stream = match timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((creds.host.as_str(), creds.port)),
        )
        .await
        {
            Err(_) => return Err(AmiError::ConnectTimeout),
            Ok(Err(error)) => return Err(classify_connect_error(error)),
            Ok(Ok(stream)) => stream,
        };

        let (read_half, mut write_half) = stream.into_split();
        let mut reader = BufReader::new(read_half);

        // The server greets with a one-line banner before any packet.
        let mut banner = String::new();
        timeout(CONNECT_TIMEOUT, reader.read_line(&mut banner))
            .await
            .map_err(|_| AmiError::ConnectTimeout)?
            .map_err(|error| AmiError::Transport(error.to_string()))?;
        tracing::debug!(banner = banner.trim_end(), "ami banner");

        let mut login = Packet::action("Login");
        login.push("Username", &creds.username);
        login.push("Secret", &creds.secret);
        write_half
            .write_all(&login.serialize())
            .await
            .map_err(|error| AmiError::Transport(error.to_string()))?;

        let response = timeout(CONNECT_TIMEOUT, read_packet(&mut reader))
            .await
            .map_err(|_| AmiError::ConnectTimeout)?
            .map_err(|error| AmiError::Transport(error.to_string()))?
            .ok_or_else(|| AmiError::Protocol("connection closed during login".into()))?;

        if !response.is_success() {
            let message = response
                .message()
                .unwrap_or("login rejected")
                .to_string();
            return Err(if response.is_auth_failure() {
                AmiError::AuthFailed(message)
            } else {
                AmiError::Protocol(message)
            });
        }
        tracing::info!(host = %creds.host, port = creds.port, "ami login accepted");

        let client = Arc::new(Self {
            writer: tokio::sync::Mutex::new(write_half),
            routing: Arc::new(Mutex::new(Routing::default())),
            alive: Arc::new(AtomicBool::new(true)),
        });
        client.spawn_reader(reader, event_tx);
        Ok(client)
    }

    pub fn is_connected(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn new_action_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Send an action with a fresh `ActionID` and await the matching
    /// response.
    pub async fn send_action(
        &self,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<Packet, AmiError> {
        self.send_action_with_id(&Self::new_action_id(), action, params)
            .await
    }

    /// Like [`send_action`](Self::send_action) but with a caller-supplied
    /// `ActionID`, so the caller can register the id for event correlation
    /// before anything is on the wire.
    pub async fn send_action_with_id(
        &self,
        action_id: &str,
        action: &str,
        params: &[(&str, &str)],
    ) -> Result<Packet, AmiError> {
        if !self.is_connected() {
            return Err(AmiError::NotConnected);
        }

        let mut packet = Packet::action(action);
        for (key, value) in params {
            packet.push(key, value);
        }
        packet.push("ActionID", action_id);

        let (tx, rx) = oneshot::channel();
        self.routing
            .lock()
            .unwrap()
            .waiters
            .insert(action_id.to_string(), tx);

        if let Err(error) = self.write_packet(&packet).await {
            self.routing.lock().unwrap().waiters.remove(action_id);
            return Err(error);
        }

        let response = match timeout(ACTION_TIMEOUT, rx).await {
            Err(_) => {
                self.routing.lock().unwrap().waiters.remove(action_id);
                return Err(AmiError::ActionTimeout);
            }
            Ok(Err(_)) => return Err(AmiError::Transport("ami connection lost".into())),
            Ok(Ok(result)) => result?,
        };

        if response.is_success() {
            Ok(response)
        } else {
            Err(AmiError::ActionRejected {
                message: response
                    .message()
                    .unwrap_or("action rejected by asterisk")
                    .to_string(),
            })
        }
    }

    /// Send a list-style action and collect its event train until
    /// `complete_event` arrives.
    pub async fn send_action_collect(
        &self,
        action: &str,
        params: &[(&str, &str)],
        complete_event: &str,
    ) -> Result<Vec<Packet>, AmiError> {
        if !self.is_connected() {
            return Err(AmiError::NotConnected);
        }

        let action_id = Self::new_action_id();
        let mut packet = Packet::action(action);
        for (key, value) in params {
            packet.push(key, value);
        }
        packet.push("ActionID", &action_id);

        let (done_tx, done_rx) = oneshot::channel();
        self.routing.lock().unwrap().collectors.insert(
            action_id.clone(),
            Collector {
                complete_event: complete_event.to_string(),
                events: Vec::new(),
                done: done_tx,
            },
        );

        if let Err(error) = self.write_packet(&packet).await {
            self.routing.lock().unwrap().collectors.remove(&action_id);
            return Err(error);
        }

        match timeout(ACTION_TIMEOUT, done_rx).await {
            Err(_) => {
                self.routing.lock().unwrap().collectors.remove(&action_id);
                Err(AmiError::ActionTimeout)
            }
            Ok(Err(_)) => Err(AmiError::Transport("ami connection lost".into())),
            Ok(Ok(result)) => result,
        }
    }

    /// Dial leg A through the trunk; the dialplan context owns leg B and the
    /// bridge.
    pub async fn originate(
        &self,
        action_id: &str,
        request: &Originate,
    ) -> Result<Packet, AmiError> {
        let priority = request.priority.to_string();
        let timeout_ms = request.timeout_ms.to_string();
        let variable = request
            .variables
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join("|");

        let mut params: Vec<(&str, &str)> = vec![
            ("Channel", request.channel.as_str()),
            ("Context", request.context.as_str()),
            ("Exten", request.exten.as_str()),
            ("Priority", priority.as_str()),
            ("CallerID", request.caller_id.as_str()),
            ("Timeout", timeout_ms.as_str()),
            ("Async", "true"),
        ];
        if !variable.is_empty() {
            params.push(("Variable", variable.as_str()));
        }

        self.send_action_with_id(action_id, "Originate", &params)
            .await
    }

    pub async fn ping(&self) -> Result<Packet, AmiError> {
        self.send_action("Ping", &[]).await
    }

    /// PJSIP endpoint names known to the PBX (trunk introspection).
    pub async fn endpoint_names(&self) -> Result<Vec<String>, AmiError> {
        let events = self
            .send_action_collect("PJSIPShowEndpoints", &[], "EndpointListComplete")
            .await?;
        Ok(events
            .iter()
            .filter(|packet| packet.event_type() == Some("EndpointList"))
            .filter_map(|packet| packet.get("ObjectName"))
            .map(str::to_string)
            .collect())
    }

    /// Best-effort `Logoff`, then mark the session dead.
    pub async fn logoff(&self) {
        let _ = self.write_packet(&Packet::action("Logoff")).await;
        self.alive.store(false, Ordering::SeqCst);
    }

    async fn write_packet(&self, packet: &Packet) -> Result<(), AmiError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(&packet.serialize()).await.map_err(|error| {
            self.alive.store(false, Ordering::SeqCst);
            AmiError::Transport(error.to_string())
        })
    }

    fn spawn_reader(
        self: &Arc<Self>,
        mut reader: BufReader<OwnedReadHalf>,
        event_tx: mpsc::Sender<Packet>,
    ) {
        let routing = self.routing.clone();
        let alive = self.alive.clone();
        tokio::spawn(async move {
            loop {
                let packet = match timeout(HEARTBEAT_TIMEOUT, read_packet(&mut reader)).await {
                    Err(_) => {
                        tracing::warn!("ami heartbeat expired, dropping session");
                        break;
                    }
                    Ok(Err(error)) => {
                        tracing::warn!(%error, "ami socket error");
                        break;
                    }
                    Ok(Ok(None)) => {
                        tracing::info!("ami connection closed by peer");
                        break;
                    }
                    Ok(Ok(Some(packet))) => packet,
                };

                if packet.is_response() {
                    route_response(&routing, packet);
                } else if packet.is_event() {
                    if let Some(packet) = route_event(&routing, packet) {
                        if event_tx.send(packet).await.is_err() {
                            tracing::warn!("event channel closed, dropping session");
                            break;
                        }
                    }
                } else {
                    tracing::warn!(?packet, "malformed ami packet dropped");
                }
            }

            alive.store(false, Ordering::SeqCst);
            routing.lock().unwrap().drain();
        });
    }
}

/// Deliver a command response to its waiter. A response belonging to a list
/// collector is an acknowledgement unless it reports an error.
fn route_response(routing: &Arc<Mutex<Routing>>, packet: Packet) {
    let Some(action_id) = packet.action_id().map(str::to_string) else {
        tracing::warn!("ami response without ActionID dropped");
        return;
    };

    let mut routing = routing.lock().unwrap();
    if let Some(waiter) = routing.waiters.remove(&action_id) {
        let _ = waiter.send(Ok(packet));
    } else if routing.collectors.contains_key(&action_id) {
        // The acknowledgement of a list action; an error aborts the collection.
        if !packet.is_success() {
            if let Some(collector) = routing.collectors.remove(&action_id) {
                let _ = collector.done.send(Err(AmiError::ActionRejected {
                    message: packet
                        .message()
                        .unwrap_or("action rejected by asterisk")
                        .to_string(),
                }));
            }
        }
    } else {
        tracing::debug!(%action_id, "ami response for unknown action dropped");
    }
}

/// Route an event to a list collector when its `ActionID` matches one;
/// otherwise hand it back for the event channel.
fn route_event(routing: &Arc<Mutex<Routing>>, packet: Packet) -> Option<Packet> {
    let Some(action_id) = packet.action_id().map(str::to_string) else {
        return Some(packet);
    };

    let mut routing = routing.lock().unwrap();
    let Some(collector) = routing.collectors.get_mut(&action_id) else {
        return Some(packet);
    };

    let is_complete = packet.event_type() == Some(collector.complete_event.as_str());
    collector.events.push(packet);
    if is_complete {
        if let Some(collector) = routing.collectors.remove(&action_id) {
            let _ = collector.done.send(Ok(collector.events));
        }
    }
    None
}

async fn read_packet<R: AsyncBufRead + Unpin>(reader: &mut R) -> io::Result<Option<Packet>> {
    let mut packet = Packet::new();
    loop {
        let mut line = String::new();
        let read = reader.read_line(&mut line).await?;
        if read == 0 {
            return Ok(if packet.is_empty() { None } else { Some(packet) });
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            if packet.is_empty() {
                continue;
            }
            return Ok(Some(packet));
        }
        if !packet.push_line(line) {
            tracing::debug!(line, "unparsed ami line dropped");
        }
    }
}

fn classify_connect_error(error: io::Error) -> AmiError {
    match error.kind() {
        io::ErrorKind::ConnectionRefused => AmiError::ConnectionRefused(error.to_string()),
        io::ErrorKind::TimedOut => AmiError::ConnectTimeout,
        _ => {
            let text = error.to_string();
            if text.contains("lookup") || text.contains("resolve") {
                AmiError::Dns(text)
            } else {
                AmiError::Transport(text)
            }
        }
    }
}

/// Parameters for an `Originate` action.
#[derive(Debug, Clone)]
pub struct Originate {
    pub channel: String,
    pub context: String,
    pub exten: String,
    pub priority: u32,
    pub caller_id: String,
    pub timeout_ms: u32,
    pub variables: Vec<(String, String)>,
}

/// Holds the current AMI session and re-establishes it on demand.
///
/// Credentials come from the `asterisk_config` table row `default` when it
/// carries a host, otherwise from the environment. A dead session is
/// replaced on the next `ensure_connected`; in-flight actions on the old
/// session have already received a transport error from the reader teardown.
pub struct AmiManager {
    store: Arc<dyn Store>,
    env: AsteriskEnv,
    session: tokio::sync::Mutex<Option<Arc<AmiClient>>>,
    event_tx: mpsc::Sender<Packet>,
}

impl AmiManager {
    pub fn new(store: Arc<dyn Store>, env: AsteriskEnv, event_tx: mpsc::Sender<Packet>) -> Self {
        Self {
            store,
            env,
            session: tokio::sync::Mutex::new(None),
            event_tx,
        }
    }

    /// Resolve AMI credentials without touching the network.
    pub async fn credentials(&self) -> Result<AmiCredentials, AmiError> {
        match self.store.ami_config("default").await {
            Ok(Some(row)) => {
                if let Some(creds) = row.credentials() {
                    return Ok(creds);
                }
            }
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(%error, "asterisk_config lookup failed, falling back to env");
            }
        }
        self.env
            .credentials()
            .map_err(|missing| AmiError::ConfigIncomplete(missing.join(", ")))
    }

    pub async fn ensure_connected(&self) -> Result<Arc<AmiClient>, AmiError> {
        let mut session = self.session.lock().await;
        if let Some(client) = session.as_ref() {
            if client.is_connected() {
                return Ok(client.clone());
            }
        }

        let creds = self.credentials().await?;
        tracing::info!(host = %creds.host, port = creds.port, "establishing ami session");
        let client = AmiClient::connect(&creds, self.event_tx.clone()).await?;
        *session = Some(client.clone());
        Ok(client)
    }

    /// The current session, if one is alive. Never connects.
    pub async fn current(&self) -> Option<Arc<AmiClient>> {
        self.session
            .lock()
            .await
            .as_ref()
            .filter(|client| client.is_connected())
            .cloned()
    }

    /// Periodic `Ping` so an idle session keeps its heartbeat window open.
    pub fn spawn_keepalive(self: &Arc<Self>) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(KEEPALIVE_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Some(client) = manager.current().await {
                    if let Err(error) = client.ping().await {
                        tracing::warn!(%error, "ami keepalive ping failed");
                    }
                }
            }
        })
    }

    pub async fn shutdown(&self) {
        if let Some(client) = self.session.lock().await.take() {
            client.logoff().await;
        }
    }
}
