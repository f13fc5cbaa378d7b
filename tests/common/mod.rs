#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use termrelay::auth::TokenAuth;
use termrelay::error::TerminalError;
use termrelay::multiplexer::tmux::Tmux;
use termrelay::rate_limit::RateLimiter;
use termrelay::sessions::backend::{
    BackendEvent, BackendInput, ProcessBackend, SpawnCommand, SpawnOptions, Spawned, Spawner,
    TerminalSize,
};
use termrelay::sessions::RegistrySettings;
use termrelay::shell::UserIdentity;
use termrelay::{app, AppState, Config, SessionRegistry};

pub const TOKEN: &str = "test-token-0123456789";
const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct EchoBackend {
    input: mpsc::Sender<BackendInput>,
    exited: Arc<AtomicBool>,
    stop: Arc<Notify>,
}

impl ProcessBackend for EchoBackend {
    fn pid(&self) -> u32 {
        1
    }
    fn input(&self) -> &mpsc::Sender<BackendInput> {
        &self.input
    }
    fn terminate(&self) {
        self.stop.notify_one();
    }
    fn kill(&self) {
        self.stop.notify_one();
    }
    fn has_exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }
}

/// Backend that echoes input bytes back as output and exits on SIGTERM.
pub struct EchoSpawner;

impl Spawner for EchoSpawner {
    fn spawn(&self, _command: &SpawnCommand, _options: &SpawnOptions) -> Result<Spawned, TerminalError> {
        let (input, mut input_rx) = mpsc::channel(64);
        let (event_tx, events) = mpsc::channel(64);
        let exited = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(Notify::new());
        let (task_exited, task_stop) = (Arc::clone(&exited), Arc::clone(&stop));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    request = input_rx.recv() => match request {
                        Some(BackendInput::Data(bytes)) => {
                            let _ = event_tx.send(BackendEvent::Output(bytes)).await;
                        }
                        Some(BackendInput::Resize { .. }) => {}
                        None => break,
                    },
                    () = task_stop.notified() => break,
                }
            }
            task_exited.store(true, Ordering::SeqCst);
            let _ = event_tx
                .send(BackendEvent::Exit {
                    code: None,
                    signal: Some(15),
                })
                .await;
        });
        Ok(Spawned {
            backend: Box::new(EchoBackend {
                input,
                exited,
                stop,
            }),
            events,
        })
    }
}

/// Backend that can never start.
pub struct FailingSpawner;

impl Spawner for FailingSpawner {
    fn spawn(&self, _command: &SpawnCommand, _options: &SpawnOptions) -> Result<Spawned, TerminalError> {
        Err(TerminalError::Spawn("no such shell".into()))
    }
}

pub fn settings(shell: &str) -> RegistrySettings {
    RegistrySettings {
        replay_capacity: 4096,
        max_terminals: 8,
        size: TerminalSize { cols: 80, rows: 24 },
        shell: shell.to_string(),
        working_dir: std::env::temp_dir().to_string_lossy().into_owned(),
        user: UserIdentity::current(),
    }
}

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: AppState,
}

/// Serve the app on an ephemeral port with tmux disabled.
pub async fn start_with(spawner: Arc<dyn Spawner>, shell: &str, max_attempts: u32) -> TestServer {
    let registry = SessionRegistry::new(spawner, Arc::new(Tmux::disabled()), settings(shell));
    let auth = Arc::new(TokenAuth::with_token(
        TOKEN.to_string(),
        Duration::from_secs(3600),
        true,
    ));
    let limiter = Arc::new(RateLimiter::new(
        max_attempts,
        Duration::from_secs(60),
        Duration::from_secs(300),
    ));
    let state = AppState::new(Config::default(), registry, auth, limiter);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = app(state.clone());
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
    });
    TestServer { addr, state }
}

pub async fn start() -> TestServer {
    start_with(Arc::new(EchoSpawner), "/bin/sh", 5).await
}

pub async fn connect(addr: SocketAddr, query: &str) -> Client {
    let url = format!("ws://{addr}/ws?{query}");
    let (client, _response) = tokio_tungstenite::connect_async(url.as_str()).await.unwrap();
    client
}

pub async fn send(client: &mut Client, msg: Value) {
    client
        .send(Message::Text(msg.to_string().into()))
        .await
        .unwrap();
}

pub async fn send_raw(client: &mut Client, text: &str) {
    client.send(Message::Text(text.to_string().into())).await.unwrap();
}

/// Next text frame as JSON. Panics on close or timeout.
pub async fn next_json(client: &mut Client) -> Value {
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .expect("websocket error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("unexpected close: {frame:?}"),
            _ => {}
        }
    }
}

/// Skip frames until one of type `ty` arrives.
pub async fn next_of_type(client: &mut Client, ty: &str) -> Value {
    loop {
        let msg = next_json(client).await;
        if msg["type"] == ty {
            return msg;
        }
    }
}

/// Collect `output` data for `terminal_id` until it contains `needle`.
pub async fn output_until(client: &mut Client, terminal_id: &str, needle: &str) -> String {
    let mut collected = String::new();
    while !collected.contains(needle) {
        let msg = next_json(client).await;
        if msg["type"] == "output" && msg["terminalId"] == terminal_id {
            collected.push_str(msg["data"].as_str().unwrap());
        }
    }
    collected
}

/// Read until the close frame. Returns its code and every text message seen
/// before it.
pub async fn expect_close(client: &mut Client) -> (u16, Vec<Value>) {
    let mut seen = Vec::new();
    loop {
        let frame = tokio::time::timeout(RECV_TIMEOUT, client.next())
            .await
            .expect("timed out waiting for close")
            .expect("connection ended without a close frame")
            .expect("websocket error");
        match frame {
            Message::Text(text) => seen.push(serde_json::from_str(text.as_str()).unwrap()),
            Message::Close(Some(frame)) => return (u16::from(frame.code), seen),
            Message::Close(None) => panic!("close frame without a code"),
            _ => {}
        }
    }
}
