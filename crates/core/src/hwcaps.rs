use crate::decision::HardwareState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HwCapsConfig {
    pub ffmpeg_path: String,
    /// Render node handed to the hardware device init
    pub device: String,
    /// Encoder names to verify, e.g. `h264_vaapi`
    pub candidates: Vec<String>,
    /// Per-candidate verification deadline
    pub timeout: Duration,
}

impl Default for HwCapsConfig {
    fn default() -> Self {
        Self {
            ffmpeg_path: "ffmpeg".to_string(),
            device: "/dev/dri/renderD128".to_string(),
            candidates: vec![
                "h264_vaapi".to_string(),
                "hevc_vaapi".to_string(),
                "av1_vaapi".to_string(),
            ],
            timeout: Duration::from_secs(10),
        }
    }
}

/// One-shot hardware encoder verification.
///
/// Each candidate encoder gets a 0.2 second synthetic encode; exit code 0
/// marks it verified. The result is immutable for the process lifetime and
/// the adapter refuses hardware plans whose encoder is not in the set.
pub struct HwCaps {
    cfg: HwCapsConfig,
    state: OnceCell<HardwareState>,
}

impl HwCaps {
    pub fn new(cfg: HwCapsConfig) -> Self {
        Self {
            cfg,
            state: OnceCell::new(),
        }
    }

    /// Run verification once; later calls return the cached result
    pub async fn init(&self) -> &HardwareState {
        self.state
            .get_or_init(|| async {
                let mut verified = BTreeSet::new();
                for enc in &self.cfg.candidates {
                    if self.verify_encoder(enc).await {
                        info!(encoder = %enc, "hardware encoder verified");
                        verified.insert(enc.clone());
                    } else {
                        warn!(encoder = %enc, "hardware encoder failed verification");
                    }
                }
                HardwareState {
                    ready: !verified.is_empty(),
                    verified_encoders: verified,
                    gpu_utilization: None,
                }
            })
            .await
    }

    /// Current state; a default (not ready) snapshot before init ran
    pub fn snapshot(&self) -> HardwareState {
        self.state.get().cloned().unwrap_or_default()
    }

    pub fn is_verified(&self, encoder: &str) -> bool {
        self.state
            .get()
            .map(|s| s.verified_encoders.contains(encoder))
            .unwrap_or(false)
    }

    async fn verify_encoder(&self, encoder: &str) -> bool {
        let result = tokio::time::timeout(
            self.cfg.timeout,
            Command::new(&self.cfg.ffmpeg_path)
                .args([
                    "-hide_banner",
                    "-v",
                    "error",
                    "-init_hw_device",
                ])
                .arg(format!("vaapi=va:{}", self.cfg.device))
                .args([
                    "-filter_hw_device",
                    "va",
                    "-f",
                    "lavfi",
                    "-i",
                    "testsrc=duration=0.2:size=1280x720:rate=25",
                    "-vf",
                    "format=nv12,hwupload",
                    "-frames:v",
                    "5",
                    "-c:v",
                ])
                .arg(encoder)
                .args(["-f", "null", "-"])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) => status.success(),
            Ok(Err(e)) => {
                warn!(encoder, error = %e, "failed to spawn verification encode");
                false
            }
            Err(_) => {
                warn!(encoder, "verification encode timed out");
                false
            }
        }
    }
}
