use anyhow::{bail, Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// Geometry and timing of the input's first video stream
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub codec: String,
    pub width: u32,
    pub height: u32,
    /// (num, den); (0, 0) when the prober reported none
    pub sample_aspect_ratio: (u32, u32),
    pub fps: f32,
}

impl ProbeResult {
    pub fn needs_square_pixels(&self) -> bool {
        let (num, den) = self.sample_aspect_ratio;
        num != 0 && den != 0 && num != den
    }
}

/// Thin wrapper over the external prober binary
pub struct MediaProber {
    ffprobe_path: String,
    timeout: Duration,
}

impl MediaProber {
    pub fn new(ffprobe_path: impl Into<String>, timeout: Duration) -> Self {
        Self {
            ffprobe_path: ffprobe_path.into(),
            // Probing is best-effort, keep it within a small budget
            timeout: timeout.clamp(Duration::from_millis(1500), Duration::from_secs(4)),
        }
    }

    pub async fn probe(&self, input: &str) -> Result<ProbeResult> {
        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.ffprobe_path)
                .args([
                    "-v",
                    "error",
                    "-select_streams",
                    "v:0",
                    "-show_entries",
                    "stream=codec_name,width,height,sample_aspect_ratio,r_frame_rate",
                    "-of",
                    "default=noprint_wrappers=1:nokey=1",
                    input,
                ])
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .context("probe timed out")?
        .context("failed to run prober")?;

        if !output.status.success() {
            bail!("prober exited with {:?}", output.status.code());
        }
        let text = String::from_utf8_lossy(&output.stdout);
        let parsed = parse_probe_output(&text)?;
        debug!(
            codec = parsed.codec,
            width = parsed.width,
            height = parsed.height,
            fps = parsed.fps,
            "probed input"
        );
        Ok(parsed)
    }
}

/// Values arrive one per line in the order requested:
/// codec, width, height, sample aspect ratio, frame rate
pub fn parse_probe_output(text: &str) -> Result<ProbeResult> {
    let mut lines = text.lines().map(|l| l.trim()).filter(|l| !l.is_empty());

    let codec = lines.next().context("missing codec")?.to_string();
    let width: u32 = lines
        .next()
        .context("missing width")?
        .parse()
        .context("bad width")?;
    let height: u32 = lines
        .next()
        .context("missing height")?
        .parse()
        .context("bad height")?;
    let sar = lines.next().map(parse_ratio).unwrap_or((0, 0));
    let fps = lines.next().map(parse_frame_rate).unwrap_or(0.0);

    Ok(ProbeResult {
        codec,
        width,
        height,
        sample_aspect_ratio: sar,
        fps,
    })
}

fn parse_ratio(s: &str) -> (u32, u32) {
    match s.split_once(':') {
        Some((num, den)) => match (num.parse(), den.parse()) {
            (Ok(n), Ok(d)) => (n, d),
            _ => (0, 0),
        },
        None => (0, 0),
    }
}

fn parse_frame_rate(s: &str) -> f32 {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f32 = num.parse().unwrap_or(0.0);
            let den: f32 = den.parse().unwrap_or(1.0);
            if den > 0.0 {
                num / den
            } else {
                0.0
            }
        }
        None => s.parse().unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_typical_prober_output() {
        let text = "h264\n1920\n1080\n1:1\n25/1\n";
        let r = parse_probe_output(text).unwrap();
        assert_eq!(r.codec, "h264");
        assert_eq!((r.width, r.height), (1920, 1080));
        assert_eq!(r.sample_aspect_ratio, (1, 1));
        assert_eq!(r.fps, 25.0);
        assert!(!r.needs_square_pixels());
    }

    #[test]
    fn anamorphic_sar_is_detected() {
        let text = "mpeg2video\n720\n576\n64:45\n25/1\n";
        let r = parse_probe_output(text).unwrap();
        assert_eq!(r.sample_aspect_ratio, (64, 45));
        assert!(r.needs_square_pixels());
    }

    #[test]
    fn fractional_frame_rates_parse() {
        let text = "h264\n1280\n720\n1:1\n30000/1001\n";
        let r = parse_probe_output(text).unwrap();
        assert!((r.fps - 29.97).abs() < 0.01);
    }

    #[test]
    fn unknown_sar_reads_as_absent() {
        let text = "h264\n1280\n720\nN/A\n50/1\n";
        let r = parse_probe_output(text).unwrap();
        assert_eq!(r.sample_aspect_ratio, (0, 0));
        assert!(!r.needs_square_pixels());
    }

    #[test]
    fn truncated_output_is_an_error() {
        assert!(parse_probe_output("h264\n1920\n").is_err());
        assert!(parse_probe_output("").is_err());
    }
}
