//! Master controller: owns the job set, partitions it across slaves and
//! aggregates their reports.
//!
//! The control server speaks JSON text frames over WebSocket on two
//! endpoints:
//!
//! | Path       | Peer                    | Traffic                     |
//! |------------|-------------------------|-----------------------------|
//! | `/slave/`  | one connection per node | init/report up, init/stop down |
//! | `/master/` | the controller client   | stop up, aggregate report down |
//!
//! The server runs on its own OS thread so `start` returns immediately;
//! `stop` talks to it like any other client, which keeps the shutdown
//! path identical whether the controller is local or remote.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use futures::stream::SplitStream;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{error, info, warn};

use crate::analyse::AnalyseResult;
use crate::control::{ClientFrame, MasterFrame, ReportFrame, SlaveFrame};
use crate::errors::EngineError;
use crate::job::JobContainer;
use crate::settings::Settings;

/// Extra wait on top of the worker timeout before the controller gives
/// up on missing slave reports.
const REPORT_SLACK: Duration = Duration::from_secs(30);

type FrameSender = mpsc::UnboundedSender<Message>;

/// Shared server state; mutated by the connection tasks.
struct MasterState {
    expected: usize,
    worker_num: Option<usize>,
    jobs: Vec<JobContainer>,
    slaves: HashMap<String, FrameSender>,
    results: HashMap<String, AnalyseResult>,
    control: Option<FrameSender>,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

/// The controller. Dispatch descriptors, `start`, let the test run, then
/// `stop` to collect the aggregate.
pub struct Master {
    settings: Settings,
    worker_num: Option<usize>,
    jobs: Vec<JobContainer>,
    state: Option<Arc<Mutex<MasterState>>>,
    server: Option<ServerHandle>,
    result: Option<AnalyseResult>,
}

impl Master {
    pub fn new(settings: Settings, worker_num: Option<usize>) -> Self {
        Master {
            settings,
            worker_num,
            jobs: Vec::new(),
            state: None,
            server: None,
            result: None,
        }
    }

    /// Queues job descriptors for partitioning at start.
    pub fn dispatch(&mut self, containers: Vec<JobContainer>) {
        self.jobs.extend(containers);
    }

    /// The final aggregate once `stop` has collected it.
    pub fn result(&self) -> Option<&AnalyseResult> {
        self.result.as_ref()
    }

    /// Binds the control server on `MASTER_PORT` (0 picks an ephemeral
    /// port) and serves it from a dedicated thread. Returns the bound
    /// address.
    pub fn start(&mut self) -> Result<SocketAddr, EngineError> {
        if self.server.is_some() {
            return Err(EngineError::WrongStatus(
                "master is already running".to_string(),
            ));
        }
        let state = Arc::new(Mutex::new(MasterState {
            expected: self.settings.slaves.len(),
            worker_num: self.worker_num,
            jobs: self.jobs.clone(),
            slaves: HashMap::new(),
            results: HashMap::new(),
            control: None,
        }));
        self.state = Some(state.clone());

        let bind = format!("0.0.0.0:{}", self.settings.master_port);
        let (addr_tx, addr_rx) = std::sync::mpsc::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("master-control".to_string())
            .spawn(move || serve(bind, state, addr_tx, shutdown_rx))?;

        let addr = addr_rx
            .recv()
            .map_err(|_| EngineError::Transport("control server died during startup".to_string()))??;
        self.server = Some(ServerHandle {
            addr,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        });
        info!(%addr, slaves = self.settings.slaves.len(), "master started");
        Ok(addr)
    }

    /// Stops the test: sends the stop command over a transient client,
    /// awaits the aggregate report (bounded), stores it and shuts the
    /// server down.
    ///
    /// When a slave never reports, the wait expires and the aggregate
    /// covers the reports actually received.
    pub fn stop(&mut self) -> Result<AnalyseResult, EngineError> {
        let port = self
            .server
            .as_ref()
            .ok_or_else(|| EngineError::WrongStatus("master is not running".to_string()))?
            .addr
            .port();
        let deadline = self.report_deadline();

        // the transient client gets its own runtime on its own thread so
        // stop can be called from async and sync contexts alike
        let client = std::thread::spawn(move || -> Result<Option<String>, EngineError> {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(request_stop(port, deadline))
        });
        let received = client
            .join()
            .map_err(|_| EngineError::Transport("stop client thread panicked".to_string()))??;

        let aggregate = match received {
            Some(json) => AnalyseResult::from_json(&json)?,
            None => self.partial_aggregate(deadline)?,
        };
        self.result = Some(aggregate.clone());
        self.shutdown();
        Ok(aggregate)
    }

    fn report_deadline(&self) -> Duration {
        let base = if self.settings.worker_timeout > 0 {
            Duration::from_secs(self.settings.worker_timeout as u64)
        } else {
            Duration::ZERO
        };
        base + Duration::from_secs(self.settings.worker_check_interval.max(1)) + REPORT_SLACK
    }

    /// Best-effort merge over whatever reports were present when the
    /// wait expired.
    fn partial_aggregate(&self, deadline: Duration) -> Result<AnalyseResult, EngineError> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| EngineError::WrongStatus("master is not running".to_string()))?;
        let state = state.lock().unwrap();
        if let Some(aggregate) = state.results.get("master") {
            return Ok(aggregate.clone());
        }
        let results: Vec<AnalyseResult> = state.results.values().cloned().collect();
        if results.is_empty() {
            return Err(EngineError::ResultTimeout(deadline));
        }
        warn!(
            reports = results.len(),
            expected = state.expected,
            "aggregating a partial set of slave reports"
        );
        Ok(AnalyseResult::from_results("master", &results))
    }

    fn shutdown(&mut self) {
        if let Some(mut server) = self.server.take() {
            if let Some(shutdown) = server.shutdown.take() {
                let _ = shutdown.send(());
            }
            if let Some(thread) = server.thread.take() {
                let _ = thread.join();
            }
        }
        self.state = None;
    }
}

impl Drop for Master {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Server loop ───────────────────────────────────────────────────────────────

fn serve(
    bind: String,
    state: Arc<Mutex<MasterState>>,
    addr_tx: std::sync::mpsc::Sender<Result<SocketAddr, EngineError>>,
    shutdown_rx: oneshot::Receiver<()>,
) {
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = addr_tx.send(Err(EngineError::Io(e)));
            return;
        }
    };
    runtime.block_on(async move {
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = addr_tx.send(Err(EngineError::Io(e)));
                return;
            }
        };
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = addr_tx.send(Err(EngineError::Io(e)));
                return;
            }
        };
        let _ = addr_tx.send(Ok(addr));
        info!(%addr, "control server listening");

        let mut shutdown_rx = shutdown_rx;
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(stream, peer, state.clone()));
                    }
                    Err(e) => error!(error = %e, "accept failed"),
                },
                _ = &mut shutdown_rx => {
                    info!("control server shutting down");
                    break;
                }
            }
        }
    });
}

async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<Mutex<MasterState>>) {
    let mut path = String::new();
    let capture_path = |request: &Request, response: Response| {
        path = request.uri().path().to_string();
        Ok(response)
    };
    let socket = match accept_hdr_async(stream, capture_path).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(%peer, error = %e, "handshake failed");
            return;
        }
    };
    let outcome = if path.starts_with("/slave") {
        serve_slave(socket, state).await
    } else if path.starts_with("/master") {
        serve_control(socket, state).await
    } else {
        warn!(%peer, path = %path, "unknown endpoint");
        return;
    };
    if let Err(e) = outcome {
        warn!(%peer, error = %e, "control channel aborted");
    }
}

/// Splits a connection and pumps queued outbound frames from a channel,
/// so state-holding code can push frames without owning the sink.
fn outbound_pump(
    socket: WebSocketStream<TcpStream>,
) -> (
    FrameSender,
    SplitStream<WebSocketStream<TcpStream>>,
    tokio::task::JoinHandle<()>,
) {
    let (mut sink, stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });
    (tx, stream, writer)
}

/// Handles one slave connection: registration, then the final report.
async fn serve_slave(
    socket: WebSocketStream<TcpStream>,
    state: Arc<Mutex<MasterState>>,
) -> Result<(), EngineError> {
    let (tx, mut stream, writer) = outbound_pump(socket);
    let outcome = slave_loop(&mut stream, &tx, &state).await;
    writer.abort();
    outcome
}

async fn slave_loop(
    stream: &mut SplitStream<WebSocketStream<TcpStream>>,
    tx: &FrameSender,
    state: &Arc<Mutex<MasterState>>,
) -> Result<(), EngineError> {
    while let Some(message) = stream.next().await {
        let message = message.map_err(|e| EngineError::Transport(e.to_string()))?;
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => {
                return Err(EngineError::BadMessage(format!(
                    "non-text frame from slave: {:?}",
                    other
                )))
            }
        };
        let frame: SlaveFrame = serde_json::from_str(&text)
            .map_err(|e| EngineError::BadMessage(format!("frame from slave: {}", e)))?;
        match frame {
            SlaveFrame::Init { slave } => {
                info!(slave = %slave, "slave registered");
                let mut state = state.lock().unwrap();
                state.slaves.insert(slave, tx.clone());
                if state.slaves.len() >= state.expected {
                    dispatch_jobs(&mut state)?;
                }
            }
            SlaveFrame::Report { slave, result } => {
                let parsed = AnalyseResult::from_json(&result)?;
                info!(slave = %slave, total = parsed.total_request, "slave reported");
                let mut state = state.lock().unwrap();
                state.results.insert(slave, parsed);
                if state.results.len() >= state.expected {
                    publish_aggregate(&mut state);
                }
            }
        }
    }
    Ok(())
}

/// Partitions the job set round-robin and pushes an init frame to every
/// registered slave.
fn dispatch_jobs(state: &mut MasterState) -> Result<(), EngineError> {
    let group_count = state.slaves.len();
    let mut groups: Vec<Vec<JobContainer>> = vec![Vec::new(); group_count];
    for (index, job) in state.jobs.iter().enumerate() {
        groups[index % group_count].push(job.clone());
    }
    info!(slaves = group_count, jobs = state.jobs.len(), "dispatching job slices");
    for (group, sender) in groups.into_iter().zip(state.slaves.values()) {
        let frame = MasterFrame::Init {
            worker_num: state.worker_num,
            jobs: group,
        };
        let _ = sender.send(Message::Text(serde_json::to_string(&frame)?));
    }
    Ok(())
}

/// Merges every slave result and pushes the report to the controller.
fn publish_aggregate(state: &mut MasterState) {
    if state.results.contains_key("master") {
        return;
    }
    let results: Vec<AnalyseResult> = state.results.values().cloned().collect();
    let aggregate = AnalyseResult::from_results("master", &results);
    info!(
        total = aggregate.total_request,
        success = aggregate.success_request,
        qps = aggregate.qps,
        "aggregate computed"
    );
    state.results.insert("master".to_string(), aggregate.clone());
    if let Some(control) = &state.control {
        let frame = ReportFrame::Report {
            result: aggregate.to_json(),
        };
        let encoded = serde_json::to_string(&frame).unwrap_or_else(|_| "{}".to_string());
        let _ = control.send(Message::Text(encoded));
    } else {
        warn!("aggregate ready but no controller attached");
    }
}

/// Handles the controller client: a stop command in, the aggregate out.
async fn serve_control(
    socket: WebSocketStream<TcpStream>,
    state: Arc<Mutex<MasterState>>,
) -> Result<(), EngineError> {
    let (tx, mut stream, writer) = outbound_pump(socket);
    let outcome: Result<(), EngineError> = async {
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| EngineError::Transport(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => {
                    return Err(EngineError::BadMessage(format!(
                        "non-text frame from controller: {:?}",
                        other
                    )))
                }
            };
            let frame: ClientFrame = serde_json::from_str(&text)
                .map_err(|e| EngineError::BadMessage(format!("frame from controller: {}", e)))?;
            match frame {
                ClientFrame::Stop => {
                    info!("stop requested by controller");
                    let mut state = state.lock().unwrap();
                    state.control = Some(tx.clone());
                    let encoded = serde_json::to_string(&MasterFrame::Stop)?;
                    for sender in state.slaves.values() {
                        let _ = sender.send(Message::Text(encoded.clone()));
                    }
                }
            }
        }
        Ok(())
    }
    .await;
    writer.abort();
    outcome
}

// ── Transient stop client ─────────────────────────────────────────────────────

/// Connects to `/master/`, sends stop and waits for the aggregate report
/// until the deadline. `None` means the deadline expired or the channel
/// closed first.
async fn request_stop(port: u16, deadline: Duration) -> Result<Option<String>, EngineError> {
    let url = format!("ws://127.0.0.1:{}/master/", port);
    let (socket, _) = connect_async(url.as_str())
        .await
        .map_err(|e| EngineError::Transport(format!("connect {}: {}", url, e)))?;
    let (mut sink, mut stream) = socket.split();
    sink.send(Message::Text(serde_json::to_string(&ClientFrame::Stop)?))
        .await
        .map_err(|e| EngineError::Transport(e.to_string()))?;

    let report = tokio::time::timeout(deadline, async {
        while let Some(message) = stream.next().await {
            if let Ok(Message::Text(text)) = message {
                if let Ok(ReportFrame::Report { result }) =
                    serde_json::from_str::<ReportFrame>(&text)
                {
                    return Some(result);
                }
            }
        }
        None
    })
    .await;
    Ok(report.ok().flatten())
}
