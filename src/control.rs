//! Typed control-channel frames.
//!
//! Master and slaves exchange self-describing JSON text frames tagged by
//! `command`. Frames are split per direction so each side only parses
//! what it can legally receive; an undecodable frame aborts the channel.

use serde::{Deserialize, Serialize};

use crate::job::JobContainer;

/// Frames a slave sends to the master on `/slave/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum SlaveFrame {
    /// Registration; `slave` is the node's reported address.
    Init { slave: String },
    /// Final per-node result; `result` is AnalyseResult JSON.
    Report { slave: String, result: String },
}

/// Frames the master sends to a slave.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum MasterFrame {
    /// Job slice assignment plus the per-node worker count.
    Init {
        worker_num: Option<usize>,
        jobs: Vec<JobContainer>,
    },
    Stop,
}

/// Frames the controller client sends on `/master/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ClientFrame {
    Stop,
}

/// Frames the master pushes back to the controller client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ReportFrame {
    /// The final aggregate; `result` is AnalyseResult JSON.
    Report { result: String },
}
