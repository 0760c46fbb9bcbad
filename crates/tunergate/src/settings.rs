use serde::{Deserialize, Serialize};
use std::time::Duration;
use tunergate_core::admission::AdmissionConfig;
use tunergate_core::hwcaps::HwCapsConfig;
use tunergate_core::pipeline::{PipelineConfig, WatchdogConfig};
use tunergate_core::preflight::{Credentials, PreflightConfig};
use tunergate_core::receiver::ReceiverConfig;
use tunergate_core::recordings::{LifecyclePolicy, PathMapping};
use tunergate_core::urlpolicy::UrlPolicyConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Binding address for the HTTP server, e.g. `127.0.0.1:8089`
    pub listen_http: String,

    /// Directory HLS sessions are written to and served from
    pub output_dir: String,

    /// Upstream receiver connection
    pub receiver: ReceiverSettings,

    /// Encoder pipeline tuning
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Concurrency limits
    #[serde(default)]
    pub limits: LimitSettings,

    /// Circuit breaker around receiver calls
    #[serde(default)]
    pub breaker: BreakerSettings,

    /// Outbound URL policy
    #[serde(default)]
    pub outbound: UrlPolicyConfig,

    /// Receiver-to-local recording path mappings
    #[serde(default)]
    pub recordings: RecordingSettings,

    /// Per-subscriber event buffer size
    #[serde(default = "default_bus_capacity")]
    pub bus_capacity: usize,
}

fn default_bus_capacity() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReceiverSettings {
    /// Web interface base URL, e.g. `http://receiver.lan`
    pub base_url: String,
    /// Direct streaming port
    #[serde(default = "default_stream_port")]
    pub stream_port: u16,
    /// Relay port that gets the stricter preflight
    #[serde(default = "default_relay_port")]
    pub relay_port: u16,
    /// Optional credentials, injected only on [ReceiverSettings::auth_ports]
    pub username: Option<String>,
    pub password: Option<String>,
    #[serde(default = "default_auth_ports")]
    pub auth_ports: Vec<u16>,
    #[serde(default = "default_receiver_timeout")]
    pub timeout_secs: u64,
}

fn default_stream_port() -> u16 {
    8_001
}

fn default_relay_port() -> u16 {
    17_999
}

fn default_auth_ports() -> Vec<u16> {
    vec![80, 443]
}

fn default_receiver_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineSettings {
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
    pub segment_seconds: u32,
    pub dvr_window_seconds: u32,
    pub preflight_timeout_secs: u64,
    pub preflight_fallback: bool,
    pub probe_timeout_secs: u64,
    /// Watchdog: max time to the first progress heartbeat
    pub start_timeout_secs: u64,
    /// Watchdog: max gap between heartbeats
    pub stall_timeout_secs: u64,
    pub grace_secs: u64,
    pub kill_timeout_secs: u64,
    pub hw_device: String,
    /// Hardware encoders to verify at startup
    pub hw_encoders: Vec<String>,
    pub gpu_busy_threshold: f32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            segment_seconds: 4,
            dvr_window_seconds: 120,
            preflight_timeout_secs: 5,
            preflight_fallback: true,
            probe_timeout_secs: 3,
            start_timeout_secs: 15,
            stall_timeout_secs: 30,
            grace_secs: 2,
            kill_timeout_secs: 10,
            hw_device: "/dev/dri/renderD128".to_string(),
            hw_encoders: vec![
                "h264_vaapi".to_string(),
                "hevc_vaapi".to_string(),
                "av1_vaapi".to_string(),
            ],
            gpu_busy_threshold: 85.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitSettings {
    pub max_sessions: usize,
    pub max_gpu_sessions: usize,
    /// Refuse new sessions above this CPU load; 0 disables
    pub max_cpu_percent: f32,
    /// Hide sessions idle longer than this from listings; 0 disables
    pub idle_timeout_secs: i64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_sessions: 4,
            max_gpu_sessions: 2,
            max_cpu_percent: 0.0,
            idle_timeout_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub reset_timeout_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            reset_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    pub mappings: Vec<PathMapping>,
    pub stable_window_secs: u64,
    pub min_size_bytes: u64,
    pub extensions: Vec<String>,
}

impl Settings {
    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            base_url: self.receiver.base_url.clone(),
            stream_port: self.receiver.stream_port,
            timeout: Duration::from_secs(self.receiver.timeout_secs),
        }
    }

    pub fn preflight_config(&self) -> PreflightConfig {
        let credentials = match (&self.receiver.username, &self.receiver.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
            }),
            _ => None,
        };
        PreflightConfig {
            timeout: Duration::from_secs(self.pipeline.preflight_timeout_secs),
            relay_port: self.receiver.relay_port,
            direct_port: self.receiver.stream_port,
            credentials,
            auth_ports: self.receiver.auth_ports.clone(),
            fallback_enabled: self.pipeline.preflight_fallback,
            ..Default::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            ffmpeg_path: self.pipeline.ffmpeg_path.clone(),
            ffprobe_path: self.pipeline.ffprobe_path.clone(),
            hls_root: self.output_dir.clone().into(),
            segment_seconds: self.pipeline.segment_seconds,
            dvr_window_seconds: self.pipeline.dvr_window_seconds,
            preflight: self.preflight_config(),
            probe_timeout: Duration::from_secs(self.pipeline.probe_timeout_secs),
            watchdog: WatchdogConfig {
                start_timeout: Duration::from_secs(self.pipeline.start_timeout_secs),
                stall_timeout: Duration::from_secs(self.pipeline.stall_timeout_secs),
            },
            grace: Duration::from_secs(self.pipeline.grace_secs),
            kill_timeout: Duration::from_secs(self.pipeline.kill_timeout_secs),
            gpu_busy_threshold: self.pipeline.gpu_busy_threshold,
            hw_device: self.pipeline.hw_device.clone(),
            ..Default::default()
        }
    }

    pub fn hwcaps_config(&self) -> HwCapsConfig {
        HwCapsConfig {
            ffmpeg_path: self.pipeline.ffmpeg_path.clone(),
            device: self.pipeline.hw_device.clone(),
            candidates: self.pipeline.hw_encoders.clone(),
            timeout: Duration::from_secs(10),
        }
    }

    pub fn admission_config(&self) -> AdmissionConfig {
        AdmissionConfig {
            max_sessions: self.limits.max_sessions,
            max_gpu_sessions: self.limits.max_gpu_sessions,
            max_cpu_percent: self.limits.max_cpu_percent,
        }
    }

    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        let defaults = LifecyclePolicy::default();
        LifecyclePolicy {
            stable_window: if self.recordings.stable_window_secs > 0 {
                Duration::from_secs(self.recordings.stable_window_secs)
            } else {
                defaults.stable_window
            },
            min_size: if self.recordings.min_size_bytes > 0 {
                self.recordings.min_size_bytes
            } else {
                defaults.min_size
            },
            extensions: if self.recordings.extensions.is_empty() {
                defaults.extensions
            } else {
                self.recordings.extensions.clone()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_yaml_deserializes_with_defaults() {
        let yaml = r#"
listen_http: "127.0.0.1:8089"
output_dir: "/var/lib/tunergate/hls"
receiver:
  base_url: "http://receiver.lan"
"#;
        let settings: Settings = serde_yaml_from_str(yaml);
        assert_eq!(settings.receiver.stream_port, 8001);
        assert_eq!(settings.receiver.relay_port, 17999);
        assert_eq!(settings.pipeline.segment_seconds, 4);
        assert_eq!(settings.limits.max_sessions, 4);
        assert_eq!(settings.breaker.failure_threshold, 3);
        assert_eq!(settings.bus_capacity, 64);
        assert!(settings.preflight_config().credentials.is_none());
    }

    #[test]
    fn credentials_require_both_halves() {
        let mut settings: Settings = serde_yaml_from_str(
            r#"
listen_http: "127.0.0.1:8089"
output_dir: "/tmp/hls"
receiver:
  base_url: "http://receiver.lan"
  username: "root"
"#,
        );
        assert!(settings.preflight_config().credentials.is_none());
        settings.receiver.password = Some("pw".to_string());
        assert!(settings.preflight_config().credentials.is_some());
    }

    /// Parse YAML through the same config stack the binary uses
    fn serde_yaml_from_str(yaml: &str) -> Settings {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }
}
