use serde::{Deserialize, Serialize};

/// What a session is playing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    Live,
    Recording,
}

/// Output container family for the HLS egress
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    HlsTs,
    HlsFmp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum QualityProfile {
    Low,
    Standard,
    High,
    Passthrough,
}

/// Hardware acceleration intent carried by a profile
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HwIntent {
    Off,
    Auto,
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    Tuner,
    File,
    Url,
}

/// Where the input comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub kind: SourceKind,
    /// Service reference, local path or URL depending on [SourceKind]
    pub identifier: String,
    /// Receiver tuner slot, when the caller pinned one
    pub tuner_slot: Option<u32>,
}

/// Encoding profile attached to a stream request.
///
/// Never mutated by planning; the engine and the argv builder read it and
/// derive their own state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    pub transcode_video: bool,
    /// Target video codec when transcoding ("h264", "hevc", "av1")
    pub video_codec: String,
    pub preset: String,
    pub crf: u8,
    pub max_rate_kbps: u32,
    pub buf_size_kbps: u32,
    pub audio_bitrate_kbps: u32,
    pub deinterlace: bool,
    pub hw_accel: HwIntent,
}

impl Profile {
    pub fn for_quality(q: QualityProfile) -> Self {
        match q {
            QualityProfile::Low => Self {
                name: "low".to_string(),
                transcode_video: true,
                video_codec: "h264".to_string(),
                preset: "veryfast".to_string(),
                crf: 28,
                max_rate_kbps: 1_800,
                buf_size_kbps: 3_600,
                audio_bitrate_kbps: 96,
                deinterlace: true,
                hw_accel: HwIntent::Auto,
            },
            QualityProfile::Standard => Self {
                name: "standard".to_string(),
                transcode_video: false,
                video_codec: "h264".to_string(),
                preset: "veryfast".to_string(),
                crf: 23,
                max_rate_kbps: 5_000,
                buf_size_kbps: 10_000,
                audio_bitrate_kbps: 128,
                deinterlace: true,
                hw_accel: HwIntent::Auto,
            },
            QualityProfile::High => Self {
                name: "high".to_string(),
                transcode_video: true,
                video_codec: "hevc".to_string(),
                preset: "fast".to_string(),
                crf: 21,
                max_rate_kbps: 12_000,
                buf_size_kbps: 24_000,
                audio_bitrate_kbps: 192,
                deinterlace: true,
                hw_accel: HwIntent::Auto,
            },
            QualityProfile::Passthrough => Self {
                name: "passthrough".to_string(),
                transcode_video: false,
                video_codec: "copy".to_string(),
                preset: "veryfast".to_string(),
                crf: 0,
                max_rate_kbps: 0,
                buf_size_kbps: 0,
                audio_bitrate_kbps: 0,
                deinterlace: false,
                hw_accel: HwIntent::Off,
            },
        }
    }
}

/// Client-declared playback capabilities
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientCaps {
    /// Codecs the player can decode (video and audio)
    pub codecs: Vec<String>,
    /// Container families the player accepts
    pub containers: Vec<String>,
    /// Peak sustainable bandwidth, bits per second
    pub max_bandwidth: Option<u64>,
}

/// Host utilization sample taken at request time
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct HostLoad {
    pub cpu_percent: f32,
    pub gpu_percent: Option<f32>,
}

/// A fully described stream request, input of the pipeline adapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamSpec {
    pub session_id: String,
    pub mode: Mode,
    pub output_format: OutputFormat,
    pub quality: QualityProfile,
    pub source: Source,
    pub profile: Profile,
    pub client: Option<ClientCaps>,
    pub load: Option<HostLoad>,
}

/// Session ids are path and log safe: 1..=100 of `[A-Za-z0-9_-]`
pub fn valid_session_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 100
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_whitelist() {
        assert!(valid_session_id("abc-123_X"));
        assert!(valid_session_id(&"a".repeat(100)));
        assert!(!valid_session_id(""));
        assert!(!valid_session_id(&"a".repeat(101)));
        assert!(!valid_session_id("a/b"));
        assert!(!valid_session_id("a b"));
        assert!(!valid_session_id("ä"));
    }

    #[test]
    fn quality_profiles_have_sane_shapes() {
        let p = Profile::for_quality(QualityProfile::Passthrough);
        assert!(!p.transcode_video);
        assert_eq!(p.hw_accel, HwIntent::Off);

        let hi = Profile::for_quality(QualityProfile::High);
        assert!(hi.transcode_video);
        assert!(hi.max_rate_kbps > Profile::for_quality(QualityProfile::Low).max_rate_kbps);
    }
}
