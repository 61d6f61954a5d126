//! Slave node: one machine's worker manager plus its control channel.

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

use crate::analyse::AnalyseResult;
use crate::control::{MasterFrame, SlaveFrame};
use crate::errors::EngineError;
use crate::net::local_ip;
use crate::settings::Settings;
use crate::worker::WorkerManager;

/// A node: registers with the master, runs its slice of the job set and
/// reports the merged result.
pub struct Slave {
    settings: Settings,
    result: Option<AnalyseResult>,
}

impl Slave {
    pub fn new(settings: Settings) -> Self {
        Slave {
            settings,
            result: None,
        }
    }

    /// The node's merged result once a report has been delivered.
    pub fn result(&self) -> Option<&AnalyseResult> {
        self.result.as_ref()
    }

    /// Connects to the master and serves control commands until the stop
    /// report is delivered or the channel closes.
    ///
    /// Malformed frames abort the connection with `BadMessage`; the
    /// master is expected to observe the close.
    pub async fn run(&mut self) -> Result<(), EngineError> {
        let url = format!(
            "ws://{}:{}/slave/",
            self.settings.master, self.settings.master_port
        );
        let (socket, _) = connect_async(url.as_str())
            .await
            .map_err(|e| EngineError::Transport(format!("connect {}: {}", url, e)))?;
        info!(master = %url, "connected to master");
        let (mut sink, mut stream) = socket.split();

        let register = SlaveFrame::Init {
            slave: local_ip().to_string(),
        };
        sink.send(Message::Text(serde_json::to_string(&register)?))
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        let mut manager: Option<WorkerManager> = None;
        while let Some(message) = stream.next().await {
            let message = message.map_err(|e| EngineError::Transport(e.to_string()))?;
            let text = match message {
                Message::Text(text) => text,
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => continue,
                other => {
                    return Err(EngineError::BadMessage(format!(
                        "non-text frame from master: {:?}",
                        other
                    )))
                }
            };
            let frame: MasterFrame = serde_json::from_str(&text)
                .map_err(|e| EngineError::BadMessage(format!("frame from master: {}", e)))?;
            match frame {
                MasterFrame::Init { worker_num, jobs } => {
                    info!(jobs = jobs.len(), ?worker_num, "job slice received");
                    let mut workers = WorkerManager::new(worker_num, &self.settings);
                    for container in &jobs {
                        workers.dispatch(container)?;
                    }
                    workers.start()?;
                    manager = Some(workers);
                }
                MasterFrame::Stop => {
                    let Some(mut workers) = manager.take() else {
                        return Err(EngineError::BadMessage(
                            "stop received before init".to_string(),
                        ));
                    };
                    // gathering results blocks on the worker queue
                    let merged = tokio::task::spawn_blocking(move || workers.stop())
                        .await
                        .map_err(|e| {
                            EngineError::WorkerExecute(format!("stop task failed: {}", e))
                        })??;
                    let report = SlaveFrame::Report {
                        slave: local_ip().to_string(),
                        result: merged.to_json(),
                    };
                    sink.send(Message::Text(serde_json::to_string(&report)?))
                        .await
                        .map_err(|e| EngineError::Transport(e.to_string()))?;
                    info!(
                        total = merged.total_request,
                        success = merged.success_request,
                        "reported to master"
                    );
                    self.result = Some(merged);
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        if self.result.is_none() {
            warn!("control channel closed before a report was delivered");
        }
        Ok(())
    }
}
