use crate::decision::DecisionReason;
use crate::preflight::PreflightReason;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

pub mod adapter;
pub mod args;
pub mod probe;
pub mod redact;
pub mod ring;
pub mod watchdog;

pub use adapter::{ExitInfo, PipelineAdapter, PipelineConfig};
pub use args::{build_args, PipelinePlan};
pub use ring::LineRing;
pub use watchdog::{Watchdog, WatchdogConfig, WatchdogState};

/// How a pipeline start can fail
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid session id")]
    InvalidSessionId,
    /// An attached deadline leaves no room for preflight
    #[error("deadline too short for preflight")]
    DeadlineTooShort,
    #[error("preflight-error: {0}")]
    Preflight(PreflightReason),
    #[error("rejected: {0}")]
    Rejected(DecisionReason),
    #[error("encoder-not-verified: {0}")]
    EncoderNotVerified(String),
    #[error("hw-requested-unavailable")]
    HwRequestedUnavailable,
    #[error("recording path refused: {0}")]
    RecordingPath(String),
    #[error("upstream unavailable: {0}")]
    Upstream(String),
    #[error("start-failure: {0}")]
    StartFailure(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Label used on the reject counter
    pub fn reason_label(&self) -> String {
        match self {
            PipelineError::InvalidSessionId => "invalid-session-id".to_string(),
            PipelineError::DeadlineTooShort => "deadline-too-short".to_string(),
            PipelineError::Preflight(r) => format!("preflight-{r}"),
            PipelineError::Rejected(r) => r.to_string(),
            PipelineError::EncoderNotVerified(_) => "encoder-not-verified".to_string(),
            PipelineError::HwRequestedUnavailable => "hw-requested-unavailable".to_string(),
            PipelineError::RecordingPath(_) => "recording-path".to_string(),
            PipelineError::Upstream(_) => "upstream".to_string(),
            PipelineError::StartFailure(_) => "start-failure".to_string(),
            PipelineError::Internal(_) => "internal".to_string(),
        }
    }
}

/// Classification of an encoder exit, derived from code + stderr tail
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExitClass {
    /// Exit code zero
    Clean,
    NonMonotonicDts,
    InvalidDuration,
    UnsetTimestamps,
    CodecUnsupported,
    SourceUnavailable,
    ProbeFailed,
    /// Torn down by the watchdog
    WatchdogTimeout,
    Stalled,
    Fatal,
}

impl ExitClass {
    /// One timestamp-repair restart may be spent on these
    pub fn is_repairable(&self) -> bool {
        matches!(self, ExitClass::NonMonotonicDts | ExitClass::UnsetTimestamps)
    }
}

/// Map an exit to its class by scanning the stderr tail
pub fn classify_exit(exit_code: Option<i32>, stderr_tail: &[String]) -> ExitClass {
    if exit_code == Some(0) {
        return ExitClass::Clean;
    }
    let haystack = stderr_tail.join("\n").to_ascii_lowercase();

    if haystack.contains("non-monotonic dts")
        || haystack.contains("non-monotonically increasing dts")
    {
        ExitClass::NonMonotonicDts
    } else if haystack.contains("invalid duration") {
        ExitClass::InvalidDuration
    } else if haystack.contains("timestamps are unset") {
        ExitClass::UnsetTimestamps
    } else if haystack.contains("unknown encoder")
        || haystack.contains("encoder not found")
        || haystack.contains("unsupported codec")
    {
        ExitClass::CodecUnsupported
    } else if haystack.contains("connection refused")
        || haystack.contains("connection timed out")
        || haystack.contains("server returned 4")
        || haystack.contains("server returned 5")
        || haystack.contains("input/output error")
        || haystack.contains("no route to host")
    {
        ExitClass::SourceUnavailable
    } else {
        ExitClass::Fatal
    }
}

/// Health verdict for a run handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineHealth {
    pub healthy: bool,
    pub message: String,
    pub last_check: i64,
}

/// Per-start options passed alongside the spec
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Remaining time the caller is willing to wait
    pub deadline: Option<Duration>,
    /// Spend the session's one timestamp-repair attempt
    pub repair: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn clean_exit_classifies_clean() {
        assert_eq!(classify_exit(Some(0), &lines(&["anything"])), ExitClass::Clean);
    }

    #[test]
    fn dts_errors_are_repairable() {
        let class = classify_exit(
            Some(1),
            &lines(&["[mpegts @ 0x5] Non-monotonic DTS in output stream 0:0"]),
        );
        assert_eq!(class, ExitClass::NonMonotonicDts);
        assert!(class.is_repairable());

        let class = classify_exit(
            Some(1),
            &lines(&["Timestamps are unset in a packet for stream 0"]),
        );
        assert_eq!(class, ExitClass::UnsetTimestamps);
        assert!(class.is_repairable());
    }

    #[test]
    fn codec_and_source_errors_are_not_repairable() {
        let class = classify_exit(Some(1), &lines(&["Unknown encoder 'libfoo'"]));
        assert_eq!(class, ExitClass::CodecUnsupported);
        assert!(!class.is_repairable());

        let class = classify_exit(
            Some(1),
            &lines(&["[http @ 0x1] Connection refused", "exiting"]),
        );
        assert_eq!(class, ExitClass::SourceUnavailable);
    }

    #[test]
    fn unknown_failures_are_fatal() {
        assert_eq!(classify_exit(Some(137), &lines(&["killed"])), ExitClass::Fatal);
        assert_eq!(classify_exit(None, &[]), ExitClass::Fatal);
    }
}
