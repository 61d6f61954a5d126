//! Per-request session records.

use crate::analyse::{Analysable, CoreStatus, Lifecycle, Visit};
use crate::errors::EngineError;
use crate::net::Protocol;

/// Record of a single request attempt.
pub struct Session {
    lifecycle: Lifecycle,
    protocol: Protocol,
    url: String,
    status_code: u16,
}

impl Session {
    /// Creates a session already in the started state; its clock runs
    /// until the manager closes it with a status code.
    fn open(protocol: Protocol, url: &str) -> Result<Self, EngineError> {
        let mut session = Session {
            lifecycle: Lifecycle::new("Session"),
            protocol,
            url: url.to_string(),
            status_code: 0,
        };
        Analysable::start(&mut session)?;
        Ok(session)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn status_code(&self) -> u16 {
        self.status_code
    }
}

impl Analysable for Session {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    /// One counted request; success iff the server answered 200.
    fn analyse(&mut self) -> Result<(), EngineError> {
        if self.status() == CoreStatus::Analysed {
            return Ok(());
        }
        self.lifecycle_mut().analyse()?;
        let success = if self.status_code == 200 { 1 } else { 0 };
        self.lifecycle_mut().add_counts(1, success);
        Ok(())
    }
}

/// Per-job session history with a single open slot.
///
/// Exactly one session may be open at a time; closing moves it into the
/// append-only history that `analyse` rolls up.
pub struct SessionManager {
    lifecycle: Lifecycle,
    open: Option<Session>,
    sessions: Vec<Session>,
}

impl SessionManager {
    pub fn new() -> Self {
        SessionManager {
            lifecycle: Lifecycle::new("SessionManager"),
            open: None,
            sessions: Vec::new(),
        }
    }

    /// Opens the next session.
    pub fn open(&mut self, protocol: Protocol, url: &str) -> Result<(), EngineError> {
        if self.open.is_some() {
            return Err(EngineError::WrongStatus(format!(
                "{} already has an open session",
                self.id()
            )));
        }
        self.open = Some(Session::open(protocol, url)?);
        Ok(())
    }

    /// Closes the open session with the given status code and appends it
    /// to the history. Closing with nothing open is a no-op, which makes
    /// a spurious double-close harmless.
    pub fn close(&mut self, status_code: u16) {
        if let Some(mut session) = self.open.take() {
            session.status_code = status_code;
            // The slot session is always in the started state.
            let _ = Analysable::stop(&mut session);
            self.sessions.push(session);
        }
    }

    pub fn has_open(&self) -> bool {
        self.open.is_some()
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl Analysable for SessionManager {
    fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle {
        &mut self.lifecycle
    }

    fn visit_children(&mut self, visit: Visit) -> Result<(), EngineError> {
        for session in &mut self.sessions {
            visit(session)?;
        }
        Ok(())
    }
}
