use super::store::{SessionStore, StoreError};
use super::{SessionRecord, SessionState, StopReason};
use crate::admission::{Admission, AdmissionError};
use crate::bus::{
    EventBus, EventPayload, TOPIC_PIPELINE_EXITED, TOPIC_SESSION_ENDED, TOPIC_SESSION_FAILED,
    TOPIC_SESSION_START, TOPIC_SESSION_STARTED, TOPIC_SESSION_STOP, TOPIC_SESSION_STOPPING,
};
use crate::clock::Clock;
use crate::pipeline::adapter::ExitInfo;
use crate::pipeline::{ExitClass, PipelineError, PipelineHealth, StartOptions};
use crate::stream::{valid_session_id, HwIntent, StreamSpec};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// What the orchestrator needs from the media pipeline
#[async_trait]
pub trait StreamPipeline: Send + Sync {
    async fn start(&self, spec: &StreamSpec, opts: StartOptions) -> Result<String, PipelineError>;
    async fn stop(&self, handle: &str) -> Result<(), PipelineError>;
    fn health(&self, handle: &str) -> PipelineHealth;
    fn exit_info(&self, handle: &str) -> Option<ExitInfo>;
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Admission(#[from] AdmissionError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

/// Owns the session lifecycle rules: admission before pipeline, exactly one
/// release per successful acquire, and one live run handle per running
/// session.
pub struct SessionOrchestrator {
    store: Arc<SessionStore>,
    bus: Arc<EventBus>,
    admission: Arc<Admission>,
    pipeline: Arc<dyn StreamPipeline>,
    clock: Arc<dyn Clock>,
    /// session id -> live run handle
    handles: Mutex<HashMap<String, String>>,
    /// Specs of running sessions, kept for the one repair restart
    specs: Mutex<HashMap<String, StreamSpec>>,
}

impl SessionOrchestrator {
    pub fn new(
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
        admission: Arc<Admission>,
        pipeline: Arc<dyn StreamPipeline>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            bus,
            admission,
            pipeline,
            clock,
            handles: Mutex::new(HashMap::new()),
            specs: Mutex::new(HashMap::new()),
        })
    }

    /// Create, admit and run one session
    pub async fn start_session(
        &self,
        spec: StreamSpec,
        context: HashMap<String, String>,
        correlation_id: Option<String>,
    ) -> Result<SessionRecord, OrchestratorError> {
        if !valid_session_id(&spec.session_id) {
            return Err(PipelineError::InvalidSessionId.into());
        }
        let correlation_id = correlation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let id = spec.session_id.clone();

        let mut record = SessionRecord::new(
            &id,
            &spec.source.identifier,
            &correlation_id,
            self.clock.now_unix(),
        );
        record.context = context;
        self.store.put(record)?;

        // Tuner admission before anything expensive
        let wants_gpu = spec.profile.hw_accel != HwIntent::Off;
        if let Err(e) = self.admission.acquire(&id, wants_gpu) {
            self.fail_session(&id, &correlation_id, &e.to_string());
            return Err(e.into());
        }
        if let Err(e) = self.store.transition(&id, SessionState::Admitted) {
            self.admission.release(&id);
            return Err(e.into());
        }

        match self.pipeline.start(&spec, StartOptions::default()).await {
            Ok(handle) => {
                self.handles.lock().unwrap().insert(id.clone(), handle);
                self.specs.lock().unwrap().insert(id.clone(), spec);
                let record = self.store.transition(&id, SessionState::Running)?;
                info!(session_id = %id, correlation_id = %correlation_id, "session running");
                self.bus.publish(
                    TOPIC_SESSION_STARTED,
                    EventPayload::SessionStarted {
                        session_id: id,
                        correlation_id,
                    },
                );
                Ok(record)
            }
            Err(e) => {
                self.admission.release(&id);
                self.fail_session(&id, &correlation_id, &e.reason_label());
                Err(e.into())
            }
        }
    }

    /// Stop a running session. Repeated stops return the same class of
    /// result without further side effects.
    pub async fn stop_session(
        &self,
        session_id: &str,
        reason: StopReason,
    ) -> Result<SessionRecord, OrchestratorError> {
        let record = self
            .store
            .get(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        if record.state != SessionState::Running {
            // Already stopping, finished or never ran
            return Ok(record);
        }
        let correlation_id = record.correlation_id.clone();

        self.store.transition(session_id, SessionState::Stopping)?;
        self.store
            .update(session_id, |r| r.stop_reason = Some(reason))?;
        self.bus.publish(
            TOPIC_SESSION_STOPPING,
            EventPayload::SessionStopping {
                session_id: session_id.to_string(),
                correlation_id: correlation_id.clone(),
            },
        );

        let handle = self.handles.lock().unwrap().get(session_id).cloned();
        if let Some(handle) = &handle {
            if let Err(e) = self.pipeline.stop(handle).await {
                warn!(session_id, handle = %handle, error = %e, "pipeline stop failed");
            }
        }

        let record = self.store.transition(session_id, SessionState::Ended)?;
        self.handles.lock().unwrap().remove(session_id);
        self.specs.lock().unwrap().remove(session_id);
        self.admission.release(session_id);
        info!(session_id, reason = %reason, "session ended");
        self.bus.publish(
            TOPIC_SESSION_ENDED,
            EventPayload::SessionEnded {
                session_id: session_id.to_string(),
                correlation_id,
                reason,
            },
        );
        Ok(record)
    }

    /// React to an encoder exit the pipeline reported.
    ///
    /// Deliberate stops are already in `Stopping` and ignored here. A
    /// repairable exit may spend the session's single repair restart;
    /// everything else ends or fails the session.
    pub async fn handle_exit(
        &self,
        session_id: &str,
        handle: &str,
        class: ExitClass,
    ) {
        // A fast-dying process can report its exit before start_session
        // finishes registering the handle; give registration a moment
        let deadline = std::time::Duration::from_secs(2);
        let poll = std::time::Duration::from_millis(50);
        let mut waited = std::time::Duration::ZERO;
        let record = loop {
            let Some(record) = self.store.get(session_id) else {
                return;
            };
            // Deliberate stops and settled sessions ignore exit notices
            if record.state == SessionState::Stopping || record.state.is_terminal() {
                return;
            }
            let registered = self
                .handles
                .lock()
                .unwrap()
                .get(session_id)
                .map(String::as_str)
                == Some(handle);
            if record.state == SessionState::Running && registered {
                break record;
            }
            if waited >= deadline {
                // Stale notice for a handle this session no longer owns
                return;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        };
        let correlation_id = record.correlation_id.clone();

        if class.is_repairable() && !record.repair_attempted {
            let spec = self.specs.lock().unwrap().get(session_id).cloned();
            if let Some(spec) = spec {
                info!(session_id, ?class, "restarting encoder with timestamp repair");
                if self
                    .store
                    .update(session_id, |r| r.repair_attempted = true)
                    .is_err()
                {
                    return;
                }
                match self
                    .pipeline
                    .start(&spec, StartOptions {
                        deadline: None,
                        repair: true,
                    })
                    .await
                {
                    Ok(new_handle) => {
                        self.handles
                            .lock()
                            .unwrap()
                            .insert(session_id.to_string(), new_handle);
                        return;
                    }
                    Err(e) => {
                        error!(session_id, error = %e, "repair restart failed");
                    }
                }
            }
        }

        self.handles.lock().unwrap().remove(session_id);
        self.specs.lock().unwrap().remove(session_id);

        if class == ExitClass::Clean {
            // Natural end of stream, e.g. a recording played to completion
            if let Err(e) = self.store.transition(session_id, SessionState::Ended) {
                warn!(session_id, error = %e, "could not end session");
                return;
            }
            let _ = self
                .store
                .update(session_id, |r| r.stop_reason = Some(StopReason::ProcessExit));
            self.admission.release(session_id);
            self.bus.publish(
                TOPIC_SESSION_ENDED,
                EventPayload::SessionEnded {
                    session_id: session_id.to_string(),
                    correlation_id,
                    reason: StopReason::ProcessExit,
                },
            );
            return;
        }

        if let Some(info) = self.pipeline.exit_info(handle) {
            warn!(
                session_id,
                exit_code = ?info.exit_code,
                last_stderr = %info.stderr_tail.last().cloned().unwrap_or_default(),
                "encoder post-mortem"
            );
        }
        let reason = match class {
            ExitClass::WatchdogTimeout => StopReason::WatchdogTimeout,
            ExitClass::Stalled => StopReason::WatchdogTimeout,
            ExitClass::SourceUnavailable => StopReason::UpstreamLost,
            _ => StopReason::Error,
        };
        let _ = self
            .store
            .update(session_id, |r| r.stop_reason = Some(reason));
        if self
            .store
            .transition(session_id, SessionState::Failed)
            .is_ok()
        {
            self.admission.release(session_id);
            warn!(session_id, ?class, "session failed");
            self.bus.publish(
                TOPIC_SESSION_FAILED,
                EventPayload::SessionFailed {
                    session_id: session_id.to_string(),
                    correlation_id,
                    reason: format!("{class:?}"),
                },
            );
        }
    }

    /// Mark a session as failed before it ever ran
    fn fail_session(&self, session_id: &str, correlation_id: &str, reason: &str) {
        let _ = self
            .store
            .update(session_id, |r| r.stop_reason = Some(StopReason::Error));
        if self
            .store
            .transition(session_id, SessionState::Failed)
            .is_err()
        {
            return;
        }
        self.bus.publish(
            TOPIC_SESSION_FAILED,
            EventPayload::SessionFailed {
                session_id: session_id.to_string(),
                correlation_id: correlation_id.to_string(),
                reason: reason.to_string(),
            },
        );
    }

    /// Consume control and exit events until cancelled
    pub async fn run(self: Arc<Self>, token: CancellationToken) {
        let mut start_sub = self.bus.subscribe(TOPIC_SESSION_START);
        let mut stop_sub = self.bus.subscribe(TOPIC_SESSION_STOP);
        let mut exit_sub = self.bus.subscribe(TOPIC_PIPELINE_EXITED);

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                Some(envelope) = start_sub.recv() => {
                    if let EventPayload::StartSession { spec, correlation_id, .. } = envelope.payload {
                        if let Err(e) = self
                            .start_session(*spec, HashMap::new(), Some(correlation_id))
                            .await
                        {
                            warn!(error = %e, "bus-driven start failed");
                        }
                    }
                }
                Some(envelope) = stop_sub.recv() => {
                    if let EventPayload::StopSession { session_id, reason, .. } = envelope.payload {
                        if let Err(e) = self.stop_session(&session_id, reason).await {
                            warn!(session_id = %session_id, error = %e, "bus-driven stop failed");
                        }
                    }
                }
                Some(envelope) = exit_sub.recv() => {
                    if let EventPayload::PipelineExited { session_id, handle, classification, .. } = envelope.payload {
                        self.handle_exit(&session_id, &handle, classification).await;
                    }
                }
                else => break,
            }
        }
        info!("session orchestrator stopped");
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Current run handle of a session, when it has one
    pub fn handle_of(&self, session_id: &str) -> Option<String> {
        self.handles.lock().unwrap().get(session_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::AdmissionConfig;
    use crate::clock::ManualClock;
    use crate::metrics::Metrics;
    use crate::stream::{Mode, OutputFormat, Profile, QualityProfile, Source, SourceKind};
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct MockPipeline {
        fail_start: AtomicBool,
        starts: AtomicU32,
        repairs: AtomicU32,
        stops: Mutex<Vec<String>>,
    }

    impl MockPipeline {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fail_start: AtomicBool::new(false),
                starts: AtomicU32::new(0),
                repairs: AtomicU32::new(0),
                stops: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl StreamPipeline for MockPipeline {
        async fn start(
            &self,
            spec: &StreamSpec,
            opts: StartOptions,
        ) -> Result<String, PipelineError> {
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(PipelineError::StartFailure("mock failure".to_string()));
            }
            let n = self.starts.fetch_add(1, Ordering::SeqCst);
            if opts.repair {
                self.repairs.fetch_add(1, Ordering::SeqCst);
            }
            Ok(format!("{}-{}", spec.session_id, 1000 + n))
        }

        async fn stop(&self, handle: &str) -> Result<(), PipelineError> {
            self.stops.lock().unwrap().push(handle.to_string());
            Ok(())
        }

        fn health(&self, _handle: &str) -> PipelineHealth {
            PipelineHealth {
                healthy: true,
                message: "running".to_string(),
                last_check: 0,
            }
        }

        fn exit_info(&self, _handle: &str) -> Option<ExitInfo> {
            None
        }
    }

    struct Fixture {
        orchestrator: Arc<SessionOrchestrator>,
        pipeline: Arc<MockPipeline>,
        admission: Arc<Admission>,
        store: Arc<SessionStore>,
        bus: Arc<EventBus>,
    }

    fn fixture(max_sessions: usize) -> Fixture {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(1_000));
        let metrics = Metrics::new().unwrap();
        let store = Arc::new(SessionStore::new(clock.clone()));
        let bus = Arc::new(EventBus::new(16, metrics.clone()));
        let admission = Arc::new(Admission::new(
            AdmissionConfig {
                max_sessions,
                max_gpu_sessions: max_sessions,
                max_cpu_percent: 0.0,
            },
            metrics,
        ));
        let pipeline = MockPipeline::new();
        let orchestrator = SessionOrchestrator::new(
            store.clone(),
            bus.clone(),
            admission.clone(),
            pipeline.clone(),
            clock,
        );
        Fixture {
            orchestrator,
            pipeline,
            admission,
            store,
            bus,
        }
    }

    fn spec(id: &str) -> StreamSpec {
        StreamSpec {
            session_id: id.to_string(),
            mode: Mode::Live,
            output_format: OutputFormat::HlsTs,
            quality: QualityProfile::Standard,
            source: Source {
                kind: SourceKind::Tuner,
                identifier: "1:0:19:2B66:3F3:1:C00000:0:0:0:".to_string(),
                tuner_slot: None,
            },
            profile: Profile::for_quality(QualityProfile::Standard),
            client: None,
            load: None,
        }
    }

    #[tokio::test]
    async fn start_walks_created_admitted_running() {
        let f = fixture(2);
        let mut started = f.bus.subscribe(TOPIC_SESSION_STARTED);

        let record = f
            .orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        assert_eq!(record.state, SessionState::Running);
        assert_eq!(f.admission.in_use(), 1);
        assert!(f.orchestrator.handle_of("s1").is_some());

        let envelope = started.try_recv().expect("started event");
        assert!(matches!(
            envelope.payload,
            EventPayload::SessionStarted { .. }
        ));
    }

    #[tokio::test]
    async fn pipeline_failure_fails_session_and_releases_admission() {
        let f = fixture(2);
        f.pipeline.fail_start.store(true, Ordering::SeqCst);
        let mut failed = f.bus.subscribe(TOPIC_SESSION_FAILED);

        let err = f
            .orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Pipeline(_)));

        assert_eq!(f.store.get("s1").unwrap().state, SessionState::Failed);
        assert_eq!(f.admission.in_use(), 0);
        assert!(f.orchestrator.handle_of("s1").is_none());
        assert!(failed.try_recv().is_some());
    }

    #[tokio::test]
    async fn admission_exhaustion_fails_fast() {
        let f = fixture(1);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let err = f
            .orchestrator
            .start_session(spec("s2"), HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Admission(AdmissionError::NoCapacity)
        ));
        assert_eq!(f.store.get("s2").unwrap().state, SessionState::Failed);
    }

    #[tokio::test]
    async fn duplicate_session_id_is_refused() {
        let f = fixture(4);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let err = f
            .orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Store(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn stop_walks_stopping_ended_and_is_idempotent() {
        let f = fixture(2);
        let mut ended = f.bus.subscribe(TOPIC_SESSION_ENDED);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();

        let record = f
            .orchestrator
            .stop_session("s1", StopReason::ClientRequest)
            .await
            .unwrap();
        assert_eq!(record.state, SessionState::Ended);
        assert_eq!(record.stop_reason, Some(StopReason::ClientRequest));
        assert_eq!(f.admission.in_use(), 0);
        assert_eq!(f.pipeline.stops.lock().unwrap().len(), 1);
        assert!(ended.try_recv().is_some());

        // Second stop: same result class, no extra pipeline stop, no event
        let again = f
            .orchestrator
            .stop_session("s1", StopReason::ClientRequest)
            .await
            .unwrap();
        assert_eq!(again.state, SessionState::Ended);
        assert_eq!(f.pipeline.stops.lock().unwrap().len(), 1);
        assert!(ended.try_recv().is_none());
    }

    #[tokio::test]
    async fn admission_balances_over_interleaved_lifecycles() {
        let f = fixture(3);
        for round in 0..10 {
            let id = format!("s{round}");
            f.orchestrator
                .start_session(spec(&id), HashMap::new(), None)
                .await
                .unwrap();
            f.orchestrator
                .stop_session(&id, StopReason::ClientRequest)
                .await
                .unwrap();
        }
        assert_eq!(f.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn repairable_exit_spends_exactly_one_repair() {
        let f = fixture(2);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let first = f.orchestrator.handle_of("s1").unwrap();

        f.orchestrator
            .handle_exit("s1", &first, ExitClass::NonMonotonicDts)
            .await;
        assert_eq!(f.store.get("s1").unwrap().state, SessionState::Running);
        assert_eq!(f.pipeline.repairs.load(Ordering::SeqCst), 1);
        let second = f.orchestrator.handle_of("s1").unwrap();
        assert_ne!(first, second);

        // Second repairable exit: the repair is spent, the session fails
        f.orchestrator
            .handle_exit("s1", &second, ExitClass::NonMonotonicDts)
            .await;
        assert_eq!(f.store.get("s1").unwrap().state, SessionState::Failed);
        assert_eq!(f.pipeline.repairs.load(Ordering::SeqCst), 1);
        assert_eq!(f.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn clean_exit_ends_the_session() {
        let f = fixture(2);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let handle = f.orchestrator.handle_of("s1").unwrap();

        f.orchestrator.handle_exit("s1", &handle, ExitClass::Clean).await;
        let record = f.store.get("s1").unwrap();
        assert_eq!(record.state, SessionState::Ended);
        assert_eq!(record.stop_reason, Some(StopReason::ProcessExit));
        assert_eq!(f.admission.in_use(), 0);
    }

    #[tokio::test]
    async fn watchdog_exit_fails_the_session() {
        let f = fixture(2);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let handle = f.orchestrator.handle_of("s1").unwrap();

        f.orchestrator
            .handle_exit("s1", &handle, ExitClass::WatchdogTimeout)
            .await;
        let record = f.store.get("s1").unwrap();
        assert_eq!(record.state, SessionState::Failed);
        assert_eq!(record.stop_reason, Some(StopReason::WatchdogTimeout));
    }

    #[tokio::test]
    async fn exit_after_stop_does_not_resurrect_the_session() {
        let f = fixture(2);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        let handle = f.orchestrator.handle_of("s1").unwrap();
        f.orchestrator
            .stop_session("s1", StopReason::ClientRequest)
            .await
            .unwrap();

        f.orchestrator.handle_exit("s1", &handle, ExitClass::Fatal).await;
        assert_eq!(f.store.get("s1").unwrap().state, SessionState::Ended);
    }

    #[tokio::test]
    async fn stale_handle_exit_is_ignored() {
        let f = fixture(2);
        f.orchestrator
            .start_session(spec("s1"), HashMap::new(), None)
            .await
            .unwrap();
        f.orchestrator
            .handle_exit("s1", "s1-99999", ExitClass::Fatal)
            .await;
        assert_eq!(f.store.get("s1").unwrap().state, SessionState::Running);
    }
}
