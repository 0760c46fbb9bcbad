use super::args::{build_args, PipelinePlan};
use super::probe::MediaProber;
use super::redact::cmd_repro;
use super::ring::LineRing;
use super::watchdog::{Watchdog, WatchdogConfig, WatchdogState};
use super::{classify_exit, ExitClass, PipelineError, PipelineHealth, StartOptions};
use crate::bus::{EventBus, EventPayload, TOPIC_PIPELINE_EXITED};
use crate::clock::Clock;
use crate::decision::{decide, hw_encoder_for, DecisionInput, DecisionReason, DeliveryPath, SourceInfo};
use crate::hls;
use crate::hwcaps::HwCaps;
use crate::metrics::Metrics;
use crate::preflight::{Preflight, PreflightConfig};
use crate::receiver::ReceiverClient;
use crate::recordings::RecordingPaths;
use crate::stream::{valid_session_id, SourceKind, StreamSpec};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

/// Least deadline a caller may attach and still get a preflight
const MIN_PREFLIGHT_DEADLINE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub hls_root: std::path::PathBuf,
    pub segment_seconds: u32,
    pub dvr_window_seconds: u32,
    pub preflight: PreflightConfig,
    pub probe_timeout: Duration,
    pub watchdog: WatchdogConfig,
    /// SIGTERM to SIGKILL escalation delay
    pub grace: Duration,
    /// Total stop deadline
    pub kill_timeout: Duration,
    pub gpu_busy_threshold: f32,
    pub hw_device: String,
    pub stderr_ring_capacity: usize,
    pub stderr_tail_lines: usize,
    pub ended_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            hls_root: std::path::PathBuf::from("/var/lib/tunergate/hls"),
            segment_seconds: 4,
            dvr_window_seconds: 120,
            preflight: PreflightConfig::default(),
            probe_timeout: Duration::from_secs(3),
            watchdog: WatchdogConfig::default(),
            grace: Duration::from_secs(2),
            kill_timeout: Duration::from_secs(10),
            gpu_busy_threshold: 85.0,
            hw_device: "/dev/dri/renderD128".to_string(),
            stderr_ring_capacity: 64 * 1024,
            stderr_tail_lines: 200,
            ended_capacity: 1_000,
        }
    }
}

struct LiveEntry {
    session_id: String,
    pid: u32,
    watchdog: Arc<Mutex<Watchdog>>,
    started_at: i64,
}

/// Post-mortem record kept after a process exits
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub handle: String,
    pub session_id: String,
    pub exit_code: Option<i32>,
    pub class: ExitClass,
    pub verdict: WatchdogState,
    pub stderr_tail: Vec<String>,
    pub ended_at: i64,
}

struct Tables {
    live: HashMap<String, LiveEntry>,
    ended: VecDeque<ExitInfo>,
}

/// Spawns, supervises and reaps the external encoder.
///
/// One live-table entry per running process; on exit the monitor moves the
/// entry into the capped ended table together with its diagnostics, in one
/// critical section.
pub struct PipelineAdapter {
    cfg: PipelineConfig,
    receiver: Arc<dyn ReceiverClient>,
    preflight: Preflight,
    prober: MediaProber,
    hwcaps: Arc<HwCaps>,
    recordings: Arc<RecordingPaths>,
    bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    metrics: Arc<Metrics>,
    tables: Arc<Mutex<Tables>>,
}

impl PipelineAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: PipelineConfig,
        receiver: Arc<dyn ReceiverClient>,
        preflight: Preflight,
        hwcaps: Arc<HwCaps>,
        recordings: Arc<RecordingPaths>,
        bus: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let prober = MediaProber::new(cfg.ffprobe_path.clone(), cfg.probe_timeout);
        Self {
            cfg,
            receiver,
            preflight,
            prober,
            hwcaps,
            recordings,
            bus,
            clock,
            metrics,
            tables: Arc::new(Mutex::new(Tables {
                live: HashMap::new(),
                ended: VecDeque::new(),
            })),
        }
    }

    /// Start the encoder for `spec`; returns the run handle
    pub async fn start(
        &self,
        spec: &StreamSpec,
        opts: StartOptions,
    ) -> Result<String, PipelineError> {
        if !valid_session_id(&spec.session_id) {
            return self.reject(PipelineError::InvalidSessionId);
        }
        if let Some(deadline) = opts.deadline {
            if deadline < MIN_PREFLIGHT_DEADLINE {
                return self.reject(PipelineError::DeadlineTooShort);
            }
        }

        let input_url = self.resolve_input(spec).await?;
        let probed = self.probe_source(spec, &input_url).await;

        // Plan
        let mut hardware = self.hwcaps.snapshot();
        hardware.gpu_utilization = spec.load.and_then(|l| l.gpu_percent);
        let decision_input = DecisionInput {
            source: probed.clone(),
            profile: spec.profile.clone(),
            client: spec.client.clone(),
            hardware,
            output_format: spec.output_format,
            gpu_busy_threshold: self.cfg.gpu_busy_threshold,
        };
        let decision = decide(&decision_input);
        if decision.path == DeliveryPath::Rejected {
            return self.reject(match decision.reason {
                DecisionReason::HwRequestedUnavailable => PipelineError::HwRequestedUnavailable,
                reason => PipelineError::Rejected(reason),
            });
        }
        // Refuse hardware plans whose encoder never passed verification
        if decision.path == DeliveryPath::TranscodeVaapi {
            let encoder = hw_encoder_for(&decision.video_codec).unwrap_or("h264_vaapi");
            if !self.hwcaps.is_verified(encoder) {
                return self.reject(PipelineError::EncoderNotVerified(encoder.to_string()));
            }
        }

        let session_dir = hls::session_dir(&self.cfg.hls_root, &spec.session_id);
        tokio::fs::create_dir_all(&session_dir)
            .await
            .map_err(|e| PipelineError::Internal(format!("create session dir: {e}")))?;

        let plan = PipelinePlan {
            session_id: spec.session_id.clone(),
            input_url,
            decision,
            profile: spec.profile.clone(),
            output_format: spec.output_format,
            session_dir,
            segment_seconds: self.cfg.segment_seconds,
            dvr_window_seconds: self.cfg.dvr_window_seconds,
            fps: probed.fps,
            repair: opts.repair,
            hw_device: self.cfg.hw_device.clone(),
        };
        // Dual-rendition sessions get a master playlist up front so players
        // can pick between the primary and the compatibility rendition
        if plan.decision.h264_fallback {
            let primary_kbps = plan.profile.max_rate_kbps.max(1_000) as u64;
            let alt_kbps = super::args::fallback_bitrate_kbps(plan.profile.max_rate_kbps) as u64;
            let primary = hls::RenditionRef {
                uri: hls::PRIMARY_PLAYLIST.to_string(),
                bandwidth: primary_kbps * 1_000,
                codecs: hls::codec_tag(&plan.decision.video_codec).to_string(),
                resolution: Some((probed.width, probed.height)),
            };
            let alt = hls::RenditionRef {
                uri: hls::ALT_PLAYLIST.to_string(),
                bandwidth: alt_kbps * 1_000,
                codecs: hls::codec_tag("h264").to_string(),
                resolution: Some((probed.width, probed.height)),
            };
            if let Err(e) = hls::write_master_playlist(&plan.session_dir, &primary, Some(&alt)) {
                return self.reject(PipelineError::Internal(format!(
                    "master playlist: {e}"
                )));
            }
        }

        let argv = build_args(&plan);

        info!(
            session_id = %spec.session_id,
            cmd_repro = %cmd_repro(&argv),
            repair = opts.repair,
            "spawning encoder"
        );

        let mut command = Command::new(&self.cfg.ffmpeg_path);
        command
            .args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        // New process group so teardown reaches every descendant
        command.process_group(0);

        let mut child = match command.spawn() {
            Ok(c) => c,
            Err(e) => {
                return self.reject(PipelineError::StartFailure(e.to_string()));
            }
        };
        let pid = match child.id() {
            Some(pid) => pid,
            None => {
                let _ = child.start_kill();
                return self.reject(PipelineError::StartFailure(
                    "process exited before registration".to_string(),
                ));
            }
        };

        let handle = format!("{}-{}", spec.session_id, pid);
        let watchdog = Arc::new(Mutex::new(Watchdog::new(
            self.cfg.watchdog.clone(),
            self.clock.clone(),
        )));
        let ring = Arc::new(Mutex::new(LineRing::new(self.cfg.stderr_ring_capacity)));

        {
            let mut tables = self.tables.lock().unwrap();
            // A recycled pid must not leave a stale post-mortem around
            tables.ended.retain(|e| e.handle != handle);
            tables.live.insert(
                handle.clone(),
                LiveEntry {
                    session_id: spec.session_id.clone(),
                    pid,
                    watchdog: watchdog.clone(),
                    started_at: self.clock.now_unix(),
                },
            );
        }
        self.metrics.live_processes.inc();
        self.metrics.pipeline_starts.inc();

        self.spawn_stderr_reader(&mut child, ring.clone(), watchdog.clone());
        self.spawn_monitor(child, handle.clone(), spec.session_id.clone(), pid, ring, watchdog);

        debug!(session_id = %spec.session_id, handle = %handle, pid, "encoder registered");
        Ok(handle)
    }

    /// Tear a run down; unknown handles succeed without side effects
    pub async fn stop(&self, handle: &str) -> Result<(), PipelineError> {
        let pid = {
            let tables = self.tables.lock().unwrap();
            match tables.live.get(handle) {
                Some(entry) => entry.pid,
                None => return Ok(()),
            }
        };

        info!(handle, pid, "stopping encoder process group");
        kill_group(pid, libc::SIGTERM);

        let poll = Duration::from_millis(100);
        let mut waited = Duration::ZERO;
        let mut killed = false;
        while waited < self.cfg.kill_timeout {
            if !self.is_live(handle) {
                return Ok(());
            }
            if !killed && waited >= self.cfg.grace {
                warn!(handle, pid, "grace expired, escalating to SIGKILL");
                kill_group(pid, libc::SIGKILL);
                killed = true;
            }
            tokio::time::sleep(poll).await;
            waited += poll;
        }
        if self.is_live(handle) {
            error!(handle, pid, "process survived the kill timeout");
            return Err(PipelineError::Internal(
                "process survived the kill timeout".to_string(),
            ));
        }
        Ok(())
    }

    pub fn health(&self, handle: &str) -> PipelineHealth {
        let now = self.clock.now_unix();
        let tables = self.tables.lock().unwrap();
        if let Some(entry) = tables.live.get(handle) {
            let state = entry.watchdog.lock().unwrap().state();
            let message = match state {
                WatchdogState::Starting => "starting".to_string(),
                _ => "running".to_string(),
            };
            return PipelineHealth {
                healthy: true,
                message,
                last_check: now,
            };
        }
        let message = match tables.ended.iter().find(|e| e.handle == handle) {
            Some(info) => match info.verdict {
                WatchdogState::TimedOut => "watchdog timeout".to_string(),
                WatchdogState::Stalled => "watchdog stall".to_string(),
                _ => "process exited".to_string(),
            },
            None => "process not found".to_string(),
        };
        PipelineHealth {
            healthy: false,
            message,
            last_check: now,
        }
    }

    /// Post-mortem for an exited run, if it is still in the ended table
    pub fn exit_info(&self, handle: &str) -> Option<ExitInfo> {
        let tables = self.tables.lock().unwrap();
        tables.ended.iter().find(|e| e.handle == handle).cloned()
    }

    pub fn live_count(&self) -> usize {
        self.tables.lock().unwrap().live.len()
    }

    /// Snapshot of live runs as (handle, session id, pid, started-at)
    pub fn live_runs(&self) -> Vec<(String, String, u32, i64)> {
        let tables = self.tables.lock().unwrap();
        tables
            .live
            .iter()
            .map(|(h, e)| (h.clone(), e.session_id.clone(), e.pid, e.started_at))
            .collect()
    }

    fn is_live(&self, handle: &str) -> bool {
        self.tables.lock().unwrap().live.contains_key(handle)
    }

    fn reject(&self, err: PipelineError) -> Result<String, PipelineError> {
        self.metrics
            .pipeline_rejects
            .with_label_values(&[&err.reason_label()])
            .inc();
        Err(err)
    }

    /// Resolve the spec's source into something the encoder can open
    async fn resolve_input(&self, spec: &StreamSpec) -> Result<String, PipelineError> {
        match spec.source.kind {
            SourceKind::Tuner => {
                if let Some(slot) = spec.source.tuner_slot {
                    if let Err(e) = self.receiver.tune_slot(slot).await {
                        warn!(slot, error = %e, "tune request failed, proceeding");
                    }
                }
                let raw = self
                    .receiver
                    .resolve_stream_url(&spec.source.identifier)
                    .await
                    .map_err(|e| PipelineError::Upstream(e.to_string()))?;
                let url = self
                    .preflight
                    .prepare_url(raw.as_str())
                    .map_err(|e| PipelineError::Preflight(e.reason))?;
                let ok = self
                    .preflight
                    .check_with_fallback(&url, &spec.source.identifier, None)
                    .await
                    .map_err(|e| {
                        self.metrics
                            .preflight_failures
                            .with_label_values(&[&e.reason.to_string()])
                            .inc();
                        PipelineError::Preflight(e.reason)
                    })?;
                Ok(ok.url.to_string())
            }
            SourceKind::Url => {
                let url = self
                    .preflight
                    .prepare_url(&spec.source.identifier)
                    .map_err(|e| PipelineError::Preflight(e.reason))?;
                let ok = self.preflight.check(&url).await.map_err(|e| {
                    self.metrics
                        .preflight_failures
                        .with_label_values(&[&e.reason.to_string()])
                        .inc();
                    PipelineError::Preflight(e.reason)
                })?;
                Ok(ok.url.to_string())
            }
            SourceKind::File => {
                let path = self
                    .recordings
                    .resolve_existing(&spec.source.identifier)
                    .map_err(|e| PipelineError::RecordingPath(e.to_string()))?;
                Ok(path.display().to_string())
            }
        }
    }

    /// Best-effort probe; failures fall back to conservative defaults
    async fn probe_source(&self, spec: &StreamSpec, input: &str) -> SourceInfo {
        let container = match spec.source.kind {
            SourceKind::File => container_from_extension(&spec.source.identifier),
            _ => "mpegts".to_string(),
        };
        match self.prober.probe(input).await {
            Ok(p) => SourceInfo {
                video_codec: p.codec.clone(),
                audio_codec: None,
                container,
                bitrate: None,
                width: p.width,
                height: p.height,
                fps: p.fps,
                interlaced: false,
                sample_aspect_ratio: p.sample_aspect_ratio,
            },
            Err(e) => {
                debug!(error = %e, "probe failed, assuming broadcast defaults");
                SourceInfo {
                    video_codec: "h264".to_string(),
                    audio_codec: None,
                    container,
                    bitrate: None,
                    width: 1920,
                    height: 1080,
                    fps: 25.0,
                    interlaced: false,
                    sample_aspect_ratio: (0, 0),
                }
            }
        }
    }

    fn spawn_stderr_reader(
        &self,
        child: &mut Child,
        ring: Arc<Mutex<LineRing>>,
        watchdog: Arc<Mutex<Watchdog>>,
    ) {
        let Some(stderr) = child.stderr.take() else {
            warn!("encoder spawned without a stderr pipe");
            return;
        };
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                ring.lock().unwrap().write_line(&line);
                watchdog.lock().unwrap().observe_line(&line);
            }
        });
    }

    /// Wait for exit, run the watchdog, and reap.
    ///
    /// The task ends only after the exit-wait completed and the live-table
    /// entry moved to the ended table.
    fn spawn_monitor(
        &self,
        mut child: Child,
        handle: String,
        session_id: String,
        pid: u32,
        ring: Arc<Mutex<LineRing>>,
        watchdog: Arc<Mutex<Watchdog>>,
    ) {
        let tables = self.tables.clone();
        let bus = self.bus.clone();
        let clock = self.clock.clone();
        let metrics = self.metrics.clone();
        let grace = self.cfg.grace;
        let tail_lines = self.cfg.stderr_tail_lines;
        let ended_capacity = self.cfg.ended_capacity;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut teardown_sent_at: Option<Duration> = None;

            let status = loop {
                tokio::select! {
                    status = child.wait() => break status,
                    _ = ticker.tick() => {
                        let state = watchdog.lock().unwrap().tick();
                        if state.wants_teardown() {
                            match teardown_sent_at {
                                None => {
                                    let kind = if state == WatchdogState::TimedOut { "timeout" } else { "stall" };
                                    warn!(handle = %handle, pid, kind, "watchdog tearing encoder down");
                                    metrics.watchdog_failures.with_label_values(&[kind]).inc();
                                    kill_group(pid, libc::SIGTERM);
                                    teardown_sent_at = Some(clock.monotonic());
                                }
                                Some(sent) if clock.monotonic().saturating_sub(sent) >= grace => {
                                    kill_group(pid, libc::SIGKILL);
                                }
                                Some(_) => {}
                            }
                        }
                    }
                }
            };

            let exit_code = status.as_ref().ok().and_then(|s| s.code());
            let verdict = watchdog.lock().unwrap().state();
            let stderr_tail = ring.lock().unwrap().tail(tail_lines);
            let class = match verdict {
                WatchdogState::TimedOut => ExitClass::WatchdogTimeout,
                WatchdogState::Stalled => ExitClass::Stalled,
                _ => classify_exit(exit_code, &stderr_tail),
            };
            let ended_at = clock.now_unix();

            // Remove from live and record diagnostics in one critical section
            {
                let mut tables = tables.lock().unwrap();
                tables.live.remove(&handle);
                tables.ended.push_back(ExitInfo {
                    handle: handle.clone(),
                    session_id: session_id.clone(),
                    exit_code,
                    class,
                    verdict,
                    stderr_tail,
                    ended_at,
                });
                while tables.ended.len() > ended_capacity {
                    tables.ended.pop_front();
                }
            }
            metrics.live_processes.dec();

            info!(
                target: "ffmpeg.exited",
                session_id = %session_id,
                handle = %handle,
                pid,
                exit_code,
                class = ?class,
                verdict = ?verdict,
                "encoder exited"
            );
            bus.publish(
                TOPIC_PIPELINE_EXITED,
                EventPayload::PipelineExited {
                    session_id,
                    handle,
                    exit_code,
                    classification: class,
                },
            );
        });
    }
}

#[async_trait::async_trait]
impl crate::sessions::StreamPipeline for PipelineAdapter {
    async fn start(
        &self,
        spec: &StreamSpec,
        opts: StartOptions,
    ) -> Result<String, PipelineError> {
        PipelineAdapter::start(self, spec, opts).await
    }

    async fn stop(&self, handle: &str) -> Result<(), PipelineError> {
        PipelineAdapter::stop(self, handle).await
    }

    fn health(&self, handle: &str) -> super::PipelineHealth {
        PipelineAdapter::health(self, handle)
    }

    fn exit_info(&self, handle: &str) -> Option<ExitInfo> {
        PipelineAdapter::exit_info(self, handle)
    }
}

/// Signal the whole process group; pgid equals the child pid because the
/// child was spawned as a group leader.
fn kill_group(pid: u32, signal: i32) {
    unsafe {
        libc::killpg(pid as i32, signal);
    }
}

fn container_from_extension(path: &str) -> String {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mkv" => "matroska".to_string(),
        "mp4" | "mov" | "m4v" => "mp4".to_string(),
        _ => "mpegts".to_string(),
    }
}
