//! In-process test fixtures: a scripted AMI server on a loopback socket and
//! a fully wired service stack over the in-memory store. No Postgres, no
//! real PBX.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, Mutex};

use bridge::ami::{AmiManager, CorrelationIndex, EventDispatcher, Packet};
use bridge::config::AsteriskEnv;
use bridge::orchestrator::Orchestrator;
use bridge::store::{MemStore, Store};

pub const TEST_USERNAME: &str = "ami";
pub const TEST_SECRET: &str = " s3cret with spaces ";

#[derive(Clone, Copy)]
pub enum LoginOutcome {
    Accept,
    Reject,
}

#[derive(Clone)]
pub enum OriginateOutcome {
    Accept,
    Reject(String),
}

/// A loopback Asterisk Manager double. Accepts connections in a loop (so a
/// dropped session can be re-established), answers Login / Originate / Ping
/// / PJSIPShowEndpoints / Logoff, records every action it receives, and lets
/// the test inject asynchronous events into the current connection.
pub struct MockAmi {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Packet>>>,
    events: Arc<Mutex<Option<mpsc::UnboundedSender<Packet>>>>,
    abort: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl MockAmi {
    pub async fn spawn(login: LoginOutcome, originate: OriginateOutcome) -> Arc<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mock = Arc::new(Self {
            addr,
            received: Arc::new(Mutex::new(Vec::new())),
            events: Arc::new(Mutex::new(None)),
            abort: Arc::new(Mutex::new(None)),
        });

        let server = mock.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let (abort_tx, abort_rx) = oneshot::channel();
                *server.abort.lock().await = Some(abort_tx);
                server
                    .clone()
                    .handle_connection(stream, login, originate.clone(), abort_rx)
                    .await;
            }
        });

        mock
    }

    /// Every action packet received so far, in arrival order.
    pub async fn received(&self) -> Vec<Packet> {
        self.received.lock().await.clone()
    }

    pub async fn received_actions(&self) -> Vec<String> {
        self.received()
            .await
            .iter()
            .filter_map(|packet| packet.get("Action"))
            .map(str::to_string)
            .collect()
    }

    /// Inject an asynchronous event into the current connection.
    pub async fn send_event(&self, pairs: &[(&str, &str)]) {
        let mut packet = Packet::new();
        for (key, value) in pairs {
            packet.push(key, value);
        }
        if let Some(tx) = self.events.lock().await.as_ref() {
            let _ = tx.send(packet);
        }
    }

    /// Drop the current connection, simulating a dead PBX socket.
    pub async fn kill_connection(&self) {
        if let Some(abort) = self.abort.lock().await.take() {
            let _ = abort.send(());
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        login: LoginOutcome,
        originate: OriginateOutcome,
        mut abort_rx: oneshot::Receiver<()>,
    ) {
        let (read_half, mut write) = stream.into_split();
        let mut reader = BufReader::new(read_half);
        let _ = write.write_all(b"Asterisk Call Manager/5.0.2\r\n").await;

        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<Packet>();
        *self.events.lock().await = Some(event_tx);

        loop {
            tokio::select! {
                _ = &mut abort_rx => break,
                Some(event) = event_rx.recv() => {
                    if write.write_all(&event.serialize()).await.is_err() {
                        break;
                    }
                }
                packet = read_packet(&mut reader) => {
                    let Ok(Some(packet)) = packet else { break };
                    let action = packet.get("Action").unwrap_or("").to_string();
                    let action_id = packet.action_id().map(str::to_string);
                    self.received.lock().await.push(packet);

                    let mut response = Packet::new();
                    match action.as_str() {
                        "Login" => match login {
                            LoginOutcome::Accept => {
                                response.push("Response", "Success");
                                response.push("Message", "Authentication accepted");
                            }
                            LoginOutcome::Reject => {
                                response.push("Response", "Error");
                                response.push("Message", "Authentication failed");
                            }
                        },
                        "Originate" => match &originate {
                            OriginateOutcome::Accept => {
                                response.push("Response", "Success");
                                response.push("Message", "Originate successfully queued");
                            }
                            OriginateOutcome::Reject(message) => {
                                response.push("Response", "Error");
                                response.push("Message", message);
                            }
                        },
                        "Ping" => {
                            response.push("Response", "Success");
                            response.push("Ping", "Pong");
                        }
                        "PJSIPShowEndpoints" => {
                            response.push("Response", "Success");
                            response.push("EventList", "start");
                            response.push("Message", "A listing of Endpoints follows");
                        }
                        "Logoff" => {
                            response.push("Response", "Goodbye");
                            response.push("Message", "Thanks for all the fish.");
                        }
                        _ => {
                            response.push("Response", "Error");
                            response.push("Message", "Invalid/unknown command");
                        }
                    }
                    if let Some(action_id) = &action_id {
                        response.push("ActionID", action_id);
                    }
                    if write.write_all(&response.serialize()).await.is_err() {
                        break;
                    }

                    if action == "PJSIPShowEndpoints" {
                        for name in ["main-trunk", "backup-trunk"] {
                            let mut event = Packet::new();
                            event.push("Event", "EndpointList");
                            event.push("ObjectName", name);
                            if let Some(action_id) = &action_id {
                                event.push("ActionID", action_id);
                            }
                            let _ = write.write_all(&event.serialize()).await;
                        }
                        let mut complete = Packet::new();
                        complete.push("Event", "EndpointListComplete");
                        complete.push("EventList", "Complete");
                        if let Some(action_id) = &action_id {
                            complete.push("ActionID", action_id);
                        }
                        let _ = write.write_all(&complete.serialize()).await;
                    }

                    if action == "Logoff" {
                        break;
                    }
                }
            }
        }

        *self.events.lock().await = None;
    }
}

async fn read_packet<R: AsyncBufRead + Unpin>(
    reader: &mut R,
) -> std::io::Result<Option<Packet>> {
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
        packet.push_line(line);
    }
}

/// The service wired over the in-memory store against a mock PBX, with the
/// event dispatcher running.
pub struct Stack {
    pub orchestrator: Arc<Orchestrator>,
    pub store: Arc<MemStore>,
    pub ami: Arc<AmiManager>,
    pub index: Arc<CorrelationIndex>,
}

pub async fn stack_against(mock: &MockAmi) -> Stack {
    let store = Arc::new(MemStore::new());
    let store_dyn: Arc<dyn Store> = store.clone();
    let index = Arc::new(CorrelationIndex::new());

    let env = AsteriskEnv {
        host: Some("127.0.0.1".to_string()),
        port: Some(mock.addr.port()),
        username: Some(TEST_USERNAME.to_string()),
        secret: Some(TEST_SECRET.to_string()),
    };

    let (event_tx, event_rx) = mpsc::channel(64);
    let ami = Arc::new(AmiManager::new(store_dyn.clone(), env, event_tx));
    tokio::spawn(EventDispatcher::new(store_dyn.clone(), index.clone()).run(event_rx));

    let orchestrator = Arc::new(Orchestrator::new(
        store_dyn,
        ami.clone(),
        index.clone(),
        "main-trunk".to_string(),
    ));

    Stack {
        orchestrator,
        store,
        ami,
        index,
    }
}

/// Poll until `probe` returns `Some`, or panic after two seconds.
pub async fn eventually<T, F, Fut>(mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    for _ in 0..200 {
        if let Some(value) = probe().await {
            return value;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within deadline");
}

pub fn create_request(user_token: &str) -> dto::CreateOrderRequest {
    dto::CreateOrderRequest {
        from: "09140916320".to_string(),
        to: "09221609805".to_string(),
        user_token: user_token.to_string(),
        trunk: None,
    }
}
