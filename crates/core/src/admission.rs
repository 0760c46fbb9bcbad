use crate::metrics::Metrics;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use sysinfo::System;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    /// All tuner slots (or GPU slots) are in use
    #[error("no-capacity")]
    NoCapacity,
    /// Host is too loaded to take another session
    #[error("admission-rejected")]
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Upper bound on concurrent sessions (tuner slots)
    pub max_sessions: usize,
    /// Upper bound on concurrent hardware-encode sessions
    pub max_gpu_sessions: usize,
    /// Refuse new sessions above this CPU load percentage; 0 disables
    pub max_cpu_percent: f32,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_gpu_sessions: 2,
            max_cpu_percent: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Claim {
    gpu: bool,
}

/// Tuner-slot accounting in front of pipeline starts.
///
/// Fails fast instead of queueing; every successful acquire is paired with
/// exactly one release by the orchestrator, and releasing an unknown or
/// already-released session is a no-op.
pub struct Admission {
    cfg: AdmissionConfig,
    metrics: Arc<Metrics>,
    claims: Mutex<HashMap<String, Claim>>,
    system: Mutex<System>,
}

impl Admission {
    pub fn new(cfg: AdmissionConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            cfg,
            metrics,
            claims: Mutex::new(HashMap::new()),
            system: Mutex::new(System::new()),
        }
    }

    pub fn acquire(&self, session_id: &str, wants_gpu: bool) -> Result<(), AdmissionError> {
        if self.cfg.max_cpu_percent > 0.0 {
            let load = self.cpu_percent();
            if load >= self.cfg.max_cpu_percent {
                warn!(load = %load, session_id, "admission refused, host overloaded");
                self.metrics.admission_rejected.inc();
                return Err(AdmissionError::Rejected);
            }
        }

        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(session_id) {
            // Same session asking again holds its existing slot
            return Ok(());
        }
        if claims.len() >= self.cfg.max_sessions {
            self.metrics.admission_rejected.inc();
            return Err(AdmissionError::NoCapacity);
        }
        if wants_gpu {
            let gpu_in_use = claims.values().filter(|c| c.gpu).count();
            if gpu_in_use >= self.cfg.max_gpu_sessions {
                self.metrics.admission_rejected.inc();
                return Err(AdmissionError::NoCapacity);
            }
        }
        claims.insert(session_id.to_string(), Claim { gpu: wants_gpu });
        debug!(session_id, in_use = claims.len(), "tuner slot acquired");
        Ok(())
    }

    /// Idempotent; releasing an unknown session does nothing
    pub fn release(&self, session_id: &str) {
        let mut claims = self.claims.lock().unwrap();
        if claims.remove(session_id).is_some() {
            debug!(session_id, in_use = claims.len(), "tuner slot released");
        }
    }

    pub fn in_use(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    /// Sampled global CPU utilization in percent
    pub fn cpu_percent(&self) -> f32 {
        let mut sys = self.system.lock().unwrap();
        sys.refresh_cpu_usage();
        sys.global_cpu_usage()
    }
}
