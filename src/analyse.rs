//! Lifecycle and roll-up model shared by every measuring tier.
//!
//! Sessions, jobs and workers all move through the same strictly
//! monotonic lifecycle (`Init → Started → Stopped → Analysed`) and carry
//! the same three accumulators. `stop` cascades into children, `analyse`
//! rolls child counters upward, and the immutable [`AnalyseResult`]
//! snapshot is what crosses thread and node boundaries.
//!
//! The hierarchy is a tree owned by the parent; children never point
//! back, so the recursion in `stop`/`analyse` terminates by construction.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::clock::{uid, Stopwatch};
use crate::errors::EngineError;

// ── Status ────────────────────────────────────────────────────────────────────

/// Lifecycle states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoreStatus {
    Init,
    Started,
    Stopped,
    Analysed,
}

impl CoreStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CoreStatus::Init => "init",
            CoreStatus::Started => "started",
            CoreStatus::Stopped => "stopped",
            CoreStatus::Analysed => "analysed",
        }
    }
}

// ── Lifecycle core ────────────────────────────────────────────────────────────

/// State embedded in every analysable entity: identity, status, the
/// stopwatch and the three accumulators.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    id: String,
    status: CoreStatus,
    stopwatch: Stopwatch,
    total_request: u64,
    success_request: u64,
    latency_ms: u64,
}

impl Lifecycle {
    pub fn new(namespace: &str) -> Self {
        Self {
            id: uid(namespace),
            status: CoreStatus::Init,
            stopwatch: Stopwatch::new(),
            total_request: 0,
            success_request: 0,
            latency_ms: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn status(&self) -> CoreStatus {
        self.status
    }

    pub(crate) fn start(&mut self) -> Result<(), EngineError> {
        if self.status != CoreStatus::Init {
            return Err(EngineError::WrongStatus(format!(
                "{} can only start from init, not {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = CoreStatus::Started;
        self.stopwatch.start();
        Ok(())
    }

    pub(crate) fn stop(&mut self) -> Result<(), EngineError> {
        if self.status != CoreStatus::Started {
            return Err(EngineError::WrongStatus(format!(
                "{} can only stop from started, not {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = CoreStatus::Stopped;
        self.latency_ms = self.stopwatch.elapsed_ms();
        Ok(())
    }

    pub(crate) fn analyse(&mut self) -> Result<(), EngineError> {
        if self.status != CoreStatus::Stopped {
            return Err(EngineError::WrongStatus(format!(
                "{} can only analyse from stopped, not {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = CoreStatus::Analysed;
        Ok(())
    }

    pub(crate) fn add_counts(&mut self, total: u64, success: u64) {
        self.total_request += total;
        self.success_request += success;
    }

    pub(crate) fn raw_total(&self) -> u64 {
        self.total_request
    }

    pub(crate) fn raw_success(&self) -> u64 {
        self.success_request
    }

    pub(crate) fn raw_latency(&self) -> u64 {
        self.latency_ms
    }

    pub(crate) fn wall_start(&self) -> Option<u64> {
        self.stopwatch.start_time()
    }
}

// ── Analysable ────────────────────────────────────────────────────────────────

/// Child visitor used by the cascade operations.
pub type Visit<'a> = &'a mut dyn FnMut(&mut dyn Analysable) -> Result<(), EngineError>;

/// The lifecycle and roll-up contract implemented by every tier.
///
/// Implementors supply access to their [`Lifecycle`] and, when they own
/// children, a traversal over them; the state machine, the cascade and
/// the guarded accessors are provided.
pub trait Analysable {
    fn lifecycle(&self) -> &Lifecycle;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle;

    /// Visits each child in insertion order. Leaves keep the default.
    fn visit_children(&mut self, _visit: Visit) -> Result<(), EngineError> {
        Ok(())
    }

    fn id(&self) -> &str {
        self.lifecycle().id()
    }

    fn status(&self) -> CoreStatus {
        self.lifecycle().status()
    }

    fn start(&mut self) -> Result<(), EngineError> {
        self.lifecycle_mut().start()
    }

    /// Stops self, then cascades into every not-yet-stopped child.
    /// Latency is fixed to self's own elapsed wall time at this moment.
    fn stop(&mut self) -> Result<(), EngineError> {
        self.lifecycle_mut().stop()?;
        self.visit_children(&mut |child| {
            if child.status() != CoreStatus::Stopped {
                child.stop()
            } else {
                Ok(())
            }
        })
    }

    /// Analyses children recursively and folds their counters into self.
    /// A second call after completion is a no-op.
    fn analyse(&mut self) -> Result<(), EngineError> {
        if self.status() == CoreStatus::Analysed {
            return Ok(());
        }
        self.lifecycle_mut().analyse()?;
        let mut total = 0u64;
        let mut success = 0u64;
        self.visit_children(&mut |child| {
            child.analyse()?;
            total += child.lifecycle().raw_total();
            success += child.lifecycle().raw_success();
            Ok(())
        })?;
        self.lifecycle_mut().add_counts(total, success);
        Ok(())
    }

    fn total_request(&self) -> Result<u64, EngineError> {
        self.guard_analysed()?;
        Ok(self.lifecycle().raw_total())
    }

    fn success_request(&self) -> Result<u64, EngineError> {
        self.guard_analysed()?;
        Ok(self.lifecycle().raw_success())
    }

    fn latency(&self) -> Result<u64, EngineError> {
        self.guard_analysed()?;
        Ok(self.lifecycle().raw_latency())
    }

    fn qps(&self) -> Result<u64, EngineError> {
        Ok(self.success_request()? * 1000 / self.latency()?.max(1))
    }

    /// Wall-clock start in milliseconds since the epoch.
    fn start_time(&self) -> Result<u64, EngineError> {
        self.lifecycle().wall_start().ok_or_else(|| {
            EngineError::WrongStatus(format!("{} has not been started", self.id()))
        })
    }

    fn stop_time(&self) -> Result<u64, EngineError> {
        Ok(self.start_time()? + self.latency()?)
    }

    /// The immutable result snapshot; only available once analysed.
    fn snapshot(&self) -> Result<AnalyseResult, EngineError> {
        Ok(AnalyseResult {
            id: self.id().to_string(),
            total_request: self.total_request()?,
            success_request: self.success_request()?,
            latency: self.latency()?,
            qps: self.qps()?,
            start_time: self.start_time()?,
            stop_time: self.stop_time()?,
        })
    }

    #[doc(hidden)]
    fn guard_analysed(&self) -> Result<(), EngineError> {
        if self.status() != CoreStatus::Analysed {
            return Err(EngineError::WrongStatus(format!(
                "{} is not analysed yet",
                self.id()
            )));
        }
        Ok(())
    }
}

// ── Manager ───────────────────────────────────────────────────────────────────

/// Ordered container of children with a stable id of its own.
pub struct Manager<T> {
    id: String,
    items: Vec<T>,
}

impl<T> Manager<T> {
    pub fn new(namespace: &str) -> Self {
        Self {
            id: uid(namespace),
            items: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn add(&mut self, item: T) {
        self.items.push(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[T] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [T] {
        &mut self.items
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.items.iter_mut()
    }
}

// ── AnalyseResult ─────────────────────────────────────────────────────────────

/// Immutable statistics snapshot exchanged between tiers.
///
/// Times are milliseconds since the epoch; latency is the wall-clock
/// span in milliseconds. The JSON encoding is the flat object with
/// exactly these seven keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalyseResult {
    pub id: String,
    pub total_request: u64,
    pub success_request: u64,
    pub latency: u64,
    pub qps: u64,
    pub start_time: u64,
    pub stop_time: u64,
}

impl AnalyseResult {
    /// Decodes the seven-key JSON object; any missing key is an error.
    pub fn from_json(data: &str) -> Result<Self, EngineError> {
        serde_json::from_str(data)
            .map_err(|e| EngineError::BadMessage(format!("analyse result: {}", e)))
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Merges a set of results into one.
    ///
    /// Latency is the merged wall-clock span (`max(stop) - min(start)`),
    /// not a sum, so each merge layer's QPS stays aggregate successes per
    /// aggregate second.
    pub fn from_results(id: &str, results: &[AnalyseResult]) -> Self {
        assert!(!results.is_empty(), "from_results needs at least one result");
        let start_time = results.iter().map(|r| r.start_time).min().unwrap_or(0);
        let stop_time = results.iter().map(|r| r.stop_time).max().unwrap_or(0);
        let latency = stop_time.saturating_sub(start_time);
        let total_request = results.iter().map(|r| r.total_request).sum();
        let success_request: u64 = results.iter().map(|r| r.success_request).sum();
        Self {
            id: id.to_string(),
            total_request,
            success_request,
            latency,
            qps: success_request * 1000 / latency.max(1),
            start_time,
            stop_time,
        }
    }
}

fn format_epoch_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

impl fmt::Display for AnalyseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(128))?;
        writeln!(f, "Id: {}", self.id)?;
        writeln!(f, "Request: {}/{}", self.success_request, self.total_request)?;
        writeln!(f, "Latency: {} ms", self.latency)?;
        writeln!(f, "QPS: {}", self.qps)?;
        writeln!(f, "Start Time: {}", format_epoch_ms(self.start_time))?;
        writeln!(f, "Stop Time: {}", format_epoch_ms(self.stop_time))?;
        write!(f, "{}", "=".repeat(128))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
