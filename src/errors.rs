//! Error types for the load engine.
//!
//! Transport failures inside a running job loop never surface here; they
//! are absorbed into session records (400/500) so the loop keeps driving.
//! What does surface is misuse of the lifecycle, control-channel damage,
//! and transport failures outside a job loop (connecting to the master,
//! binding the control server).

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    /// A lifecycle operation was attempted in the wrong state.
    #[error("wrong status: {0}")]
    WrongStatus(String),

    /// Worker execution was entered from a thread that is not a worker
    /// thread.
    #[error("worker execute: {0}")]
    WorkerExecute(String),

    /// A malformed frame arrived on a control channel. The channel is
    /// aborted; recovery is the peer's problem.
    #[error("bad control message: {0}")]
    BadMessage(String),

    /// HTTP or WebSocket transport failed outside a job loop.
    #[error("transport error: {0}")]
    Transport(String),

    /// No results arrived within the bounded wait after stop.
    #[error("no results received within {0:?}")]
    ResultTimeout(Duration),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}
