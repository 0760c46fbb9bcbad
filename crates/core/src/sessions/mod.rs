use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

pub mod orchestrator;
pub mod store;

pub use orchestrator::{SessionOrchestrator, StreamPipeline};
pub use store::{SessionStore, StoreError};

/// Lifecycle of one session. `Ended` and `Failed` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionState {
    Created,
    Admitted,
    Running,
    Stopping,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// Legal forward transitions; terminal states accept none
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, to),
            (Created, Admitted)
                | (Created, Failed)
                | (Admitted, Running)
                | (Admitted, Failed)
                | (Running, Stopping)
                | (Running, Ended)
                | (Running, Failed)
                | (Stopping, Ended)
                | (Stopping, Failed)
        )
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Created => "created",
            SessionState::Admitted => "admitted",
            SessionState::Running => "running",
            SessionState::Stopping => "stopping",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Closed set of reasons a session stops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
    ClientRequest,
    IdleTimeout,
    Shutdown,
    ProcessExit,
    WatchdogTimeout,
    UpstreamLost,
    Error,
}

impl Display for StopReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StopReason::ClientRequest => "client-request",
            StopReason::IdleTimeout => "idle-timeout",
            StopReason::Shutdown => "shutdown",
            StopReason::ProcessExit => "process-exit",
            StopReason::WatchdogTimeout => "watchdog-timeout",
            StopReason::UpstreamLost => "upstream-lost",
            StopReason::Error => "error",
        };
        write!(f, "{s}")
    }
}

/// Persisted view of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub service_ref: String,
    pub state: SessionState,
    pub created_at: i64,
    pub last_access: i64,
    pub updated_at: i64,
    pub correlation_id: String,
    /// Opaque request context (client ip, user agent, ...)
    pub context: HashMap<String, String>,
    pub stop_reason: Option<StopReason>,
    /// A timestamp-repair restart has already been spent
    pub repair_attempted: bool,
}

impl SessionRecord {
    pub fn new(id: &str, service_ref: &str, correlation_id: &str, now: i64) -> Self {
        Self {
            id: id.to_string(),
            service_ref: service_ref.to_string(),
            state: SessionState::Created,
            created_at: now,
            last_access: now,
            updated_at: now,
            correlation_id: correlation_id.to_string(),
            context: HashMap::new(),
            stop_reason: None,
            repair_attempted: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_no_transition() {
        for terminal in [SessionState::Ended, SessionState::Failed] {
            for to in [
                SessionState::Created,
                SessionState::Admitted,
                SessionState::Running,
                SessionState::Stopping,
                SessionState::Ended,
                SessionState::Failed,
            ] {
                assert!(!terminal.can_transition(to), "{terminal} -> {to}");
            }
        }
    }

    #[test]
    fn happy_paths_are_legal() {
        use SessionState::*;
        assert!(Created.can_transition(Admitted));
        assert!(Admitted.can_transition(Running));
        assert!(Running.can_transition(Stopping));
        assert!(Stopping.can_transition(Ended));
        assert!(Admitted.can_transition(Failed));
    }

    #[test]
    fn skipping_admission_is_illegal() {
        use SessionState::*;
        assert!(!Created.can_transition(Running));
        assert!(!Created.can_transition(Stopping));
    }
}
