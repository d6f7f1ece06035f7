//! Raw TCP endpoint for faults wiremock cannot express.
//!
//! Each accepted connection reads one HTTP request and then plays the next
//! [`Fault`] from the script, falling back to a plain response once the
//! script runs out. A server started with [`FaultServer::stalled`] does not
//! complete TCP handshakes until [`FaultServer::resume_accepting`] has
//! drained its accept queue, which makes client connect deadlines fire.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use bytes::Bytes;
use rand::Rng;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpSocket, TcpStream},
    sync::{watch, Notify},
    task::JoinHandle,
    time::timeout,
};
use tracing::debug;

use crate::http::ENDPOINT_PATH;

/// Upper bound on waiting for the accept queue to drain after resuming.
const RESUME_DRAIN_LIMIT: Duration = Duration::from_secs(5);

/// Behavior for one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Reply with a well-formed response carrying `status`.
    Respond(u16),
    /// Reply with random bytes that are not HTTP, then close.
    GarbageThenClose,
    /// Send a 200 status line promising a body, deliver half of it, close.
    TruncatedResponse,
    /// Close without writing anything.
    CloseWithoutResponse,
    /// Wait, then reply with `status`.
    Delayed(Duration, u16),
}

struct Shared {
    script: Mutex<VecDeque<Fault>>,
    bodies: Mutex<Vec<Bytes>>,
    requests: AtomicUsize,
    accepted: watch::Sender<usize>,
}

/// Scripted raw TCP endpoint.
pub struct FaultServer {
    addr: SocketAddr,
    shared: Arc<Shared>,
    resume: Arc<Notify>,
    fillers: Mutex<Vec<TcpStream>>,
    task: JoinHandle<()>,
}

impl FaultServer {
    /// Starts a server that accepts immediately and plays `script`.
    pub async fn start(script: Vec<Fault>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await.context("bind fault server")?;
        Ok(Self::spawn(listener, script, Vec::new(), None))
    }

    /// Starts a server whose accept queue is saturated, so new connections
    /// hang in the handshake until [`FaultServer::resume_accepting`].
    pub async fn stalled(script: Vec<Fault>) -> Result<Self> {
        let socket = TcpSocket::new_v4().context("create socket")?;
        socket.bind("127.0.0.1:0".parse()?).context("bind fault server")?;
        let listener = socket.listen(1).context("listen")?;
        let addr = listener.local_addr()?;

        let mut fillers = Vec::new();
        for _ in 0..16 {
            match timeout(Duration::from_millis(200), TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => fillers.push(stream),
                Ok(Err(_)) | Err(_) => break,
            }
        }
        debug!(fillers = fillers.len(), %addr, "accept queue saturated");

        let resume = Arc::new(Notify::new());
        Ok(Self::spawn(listener, script, fillers, Some(resume)))
    }

    fn spawn(
        listener: TcpListener,
        script: Vec<Fault>,
        fillers: Vec<TcpStream>,
        gate: Option<Arc<Notify>>,
    ) -> Self {
        let addr = listener.local_addr().unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
        let shared = Arc::new(Shared {
            script: Mutex::new(script.into()),
            bodies: Mutex::new(Vec::new()),
            requests: AtomicUsize::new(0),
            accepted: watch::channel(0).0,
        });
        let resume = gate.clone().unwrap_or_else(|| Arc::new(Notify::new()));

        let task = tokio::spawn({
            let shared = shared.clone();
            async move {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                while let Ok((stream, _)) = listener.accept().await {
                    shared.accepted.send_modify(|accepted| *accepted += 1);
                    tokio::spawn(handle(stream, shared.clone()));
                }
            }
        });

        Self { addr, shared, resume, fillers: Mutex::new(fillers), task }
    }

    /// Full URL of the endpoint.
    pub fn url(&self) -> String {
        format!("http://{}{}", self.addr, ENDPOINT_PATH)
    }

    /// Starts completing handshakes on a stalled server.
    ///
    /// Returns once the connections that filled the accept queue have been
    /// accepted, so a connect made afterwards is not dropped.
    pub async fn resume_accepting(&self) {
        let fillers = {
            let mut fillers = self.fillers.lock().unwrap_or_else(|e| e.into_inner());
            let count = fillers.len();
            fillers.clear();
            count
        };
        let mut accepted = self.shared.accepted.subscribe();
        self.resume.notify_one();

        let drained = timeout(RESUME_DRAIN_LIMIT, accepted.wait_for(|n| *n >= fillers)).await;
        if !matches!(drained, Ok(Ok(_))) {
            debug!(fillers, "accept queue not drained after resuming");
        }
    }

    /// Number of complete requests read.
    pub fn request_count(&self) -> usize {
        self.shared.requests.load(Ordering::SeqCst)
    }

    /// Request bodies read, in arrival order.
    pub fn received_bodies(&self) -> Vec<Bytes> {
        self.shared.bodies.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Drop for FaultServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle(mut stream: TcpStream, shared: Arc<Shared>) {
    let Some(body) = read_request(&mut stream).await else {
        return;
    };
    shared.bodies.lock().unwrap_or_else(|e| e.into_inner()).push(body);
    shared.requests.fetch_add(1, Ordering::SeqCst);

    let fault = shared
        .script
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .pop_front()
        .unwrap_or(Fault::Respond(200));
    debug!(?fault, "playing fault");

    let _ = play(&mut stream, fault).await;
}

async fn play(stream: &mut TcpStream, fault: Fault) -> std::io::Result<()> {
    match fault {
        Fault::Respond(status) => write_status(stream, status).await,
        Fault::Delayed(delay, status) => {
            tokio::time::sleep(delay).await;
            write_status(stream, status).await
        },
        Fault::GarbageThenClose => {
            let mut garbage = [0_u8; 64];
            rand::rng().fill(&mut garbage[..]);
            garbage[0] = 0;
            stream.write_all(&garbage).await?;
            stream.shutdown().await
        },
        Fault::TruncatedResponse => {
            let head = "HTTP/1.1 200 OK\r\nContent-Length: 100\r\nConnection: close\r\n\r\n";
            stream.write_all(head.as_bytes()).await?;
            stream.write_all(&[b'x'; 50]).await?;
            stream.shutdown().await
        },
        Fault::CloseWithoutResponse => stream.shutdown().await,
    }
}

async fn write_status(stream: &mut TcpStream, status: u16) -> std::io::Result<()> {
    let response =
        format!("HTTP/1.1 {status} Fault\r\nContent-Length: 0\r\nConnection: close\r\n\r\n");
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Reads one request and returns its body, or `None` if the peer went away.
async fn read_request(stream: &mut TcpStream) -> Option<Bytes> {
    let mut buffer = Vec::new();
    let mut chunk = [0_u8; 1024];

    let header_end = loop {
        if let Some(position) = find(&buffer, b"\r\n\r\n") {
            break position + 4;
        }
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    };

    let head = String::from_utf8_lossy(&buffer[..header_end]).to_ascii_lowercase();
    let content_length = head
        .lines()
        .find_map(|line| line.strip_prefix("content-length:"))
        .and_then(|value| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    while buffer.len() < header_end + content_length {
        let read = stream.read(&mut chunk).await.ok()?;
        if read == 0 {
            return None;
        }
        buffer.extend_from_slice(&chunk[..read]);
    }

    Some(Bytes::copy_from_slice(&buffer[header_end..header_end + content_length]))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
