use crate::stream::{ClientCaps, HwIntent, OutputFormat, Profile};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::{Display, Formatter};

/// Normalized description of the input as probed (or assumed)
#[derive(Debug, Clone, PartialEq)]
pub struct SourceInfo {
    pub video_codec: String,
    pub audio_codec: Option<String>,
    pub container: String,
    pub bitrate: Option<u64>,
    pub width: u32,
    pub height: u32,
    pub fps: f32,
    pub interlaced: bool,
    /// Sample aspect ratio; (0, 0) when unknown
    pub sample_aspect_ratio: (u32, u32),
}

impl SourceInfo {
    /// Anamorphic sources need a scale filter to reach square pixels
    pub fn needs_square_pixels(&self) -> bool {
        let (num, den) = self.sample_aspect_ratio;
        num != 0 && den != 0 && num != den
    }
}

/// Snapshot of server hardware encoding state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HardwareState {
    pub ready: bool,
    /// Encoder names that passed the synthetic-encode verification
    pub verified_encoders: BTreeSet<String>,
    /// Current GPU utilization in percent, when sampled
    pub gpu_utilization: Option<f32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DecisionInput {
    pub source: SourceInfo,
    pub profile: Profile,
    pub client: Option<ClientCaps>,
    pub hardware: HardwareState,
    pub output_format: OutputFormat,
    /// GPU utilization above this refuses new hardware sessions
    pub gpu_busy_threshold: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryPath {
    Direct,
    Remux,
    TranscodeCpu,
    TranscodeVaapi,
    Rejected,
}

/// Closed set of reasons a plan can carry; exactly one per decision
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DecisionReason {
    ClientCompatible,
    RemuxAudio,
    RemuxContainer,
    CpuFallbackNoHw,
    CpuPolicyGpuSaturated,
    HwVerified,
    HwRequestedUnavailable,
    UnsupportedInput,
    ProfileRequestedCpu,
    ProfileRequestedVaapi,
}

impl Display for DecisionReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionReason::ClientCompatible => "client-compatible",
            DecisionReason::RemuxAudio => "remux-audio",
            DecisionReason::RemuxContainer => "remux-container",
            DecisionReason::CpuFallbackNoHw => "cpu-fallback-no-hw",
            DecisionReason::CpuPolicyGpuSaturated => "cpu-policy-gpu-saturated",
            DecisionReason::HwVerified => "hw-verified",
            DecisionReason::HwRequestedUnavailable => "hw-requested-unavailable",
            DecisionReason::UnsupportedInput => "unsupported-input",
            DecisionReason::ProfileRequestedCpu => "profile-requested-cpu",
            DecisionReason::ProfileRequestedVaapi => "profile-requested-vaapi",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Container {
    MpegTs,
    Fmp4,
}

/// The plan: how the pipeline will deliver this stream
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub path: DeliveryPath,
    pub video_codec: String,
    pub container: Container,
    pub reason: DecisionReason,
    /// Filters the argv builder must apply on transcode paths
    pub deinterlace: bool,
    pub square_pixels: bool,
    /// AV1 requested without a verified AV1 encoder: the adapter adds an
    /// H.264 rendition next to the primary output
    pub h264_fallback: bool,
}

impl Decision {
    fn rejected(reason: DecisionReason, output_format: OutputFormat) -> Self {
        Self {
            path: DeliveryPath::Rejected,
            video_codec: String::new(),
            container: container_for(output_format),
            reason,
            deinterlace: false,
            square_pixels: false,
            h264_fallback: false,
        }
    }
}

/// Collapse codec aliases to canonical names; `None` for unknown codecs
pub fn normalize_codec(codec: &str) -> Option<&'static str> {
    match codec.to_ascii_lowercase().as_str() {
        "h264" | "avc" | "avc1" => Some("h264"),
        "hevc" | "h265" | "hvc1" | "hev1" => Some("hevc"),
        "mpeg2video" | "mpeg2" => Some("mpeg2video"),
        "av1" | "av01" => Some("av1"),
        "vp9" => Some("vp9"),
        "aac" | "mp4a" => Some("aac"),
        "ac3" | "ac-3" | "eac3" => Some("ac3"),
        "mp2" | "mp3" => Some("mp2"),
        "opus" => Some("opus"),
        _ => None,
    }
}

/// VAAPI encoder name for a canonical video codec
pub fn hw_encoder_for(codec: &str) -> Option<&'static str> {
    match codec {
        "h264" => Some("h264_vaapi"),
        "hevc" => Some("hevc_vaapi"),
        "av1" => Some("av1_vaapi"),
        "mpeg2video" => Some("mpeg2_vaapi"),
        _ => None,
    }
}

fn container_for(format: OutputFormat) -> Container {
    match format {
        OutputFormat::HlsTs => Container::MpegTs,
        OutputFormat::HlsFmp4 => Container::Fmp4,
    }
}

fn known_container(container: &str) -> bool {
    matches!(
        container.to_ascii_lowercase().as_str(),
        "mpegts" | "ts" | "mp4" | "mov" | "matroska" | "mkv" | "hls"
    )
}

/// Input container already matches the requested output family
fn container_matches(container: &str, format: OutputFormat) -> bool {
    let c = container.to_ascii_lowercase();
    match format {
        OutputFormat::HlsTs => matches!(c.as_str(), "mpegts" | "ts" | "hls"),
        OutputFormat::HlsFmp4 => matches!(c.as_str(), "mp4" | "mov"),
    }
}

fn client_supports(client: &Option<ClientCaps>, codec: &str) -> bool {
    match client {
        // Without declared caps the client is assumed to accept the input
        None => true,
        Some(caps) => caps
            .codecs
            .iter()
            .any(|c| normalize_codec(c) == Some(codec) || c.eq_ignore_ascii_case(codec)),
    }
}

fn bitrate_within_budget(source: &SourceInfo, client: &Option<ClientCaps>) -> bool {
    match (source.bitrate, client.as_ref().and_then(|c| c.max_bandwidth)) {
        (Some(rate), Some(budget)) => rate <= budget,
        _ => true,
    }
}

/// Plan delivery for one request. Pure: same input, same output, and the
/// input is never mutated.
pub fn decide(input: &DecisionInput) -> Decision {
    let out_container = container_for(input.output_format);

    // 1. Reject inputs nothing downstream could handle
    let codec = match normalize_codec(&input.source.video_codec) {
        Some(c) => c,
        None => return Decision::rejected(DecisionReason::UnsupportedInput, input.output_format),
    };
    if !known_container(&input.source.container) {
        return Decision::rejected(DecisionReason::UnsupportedInput, input.output_format);
    }

    let needs_deinterlace = input.source.interlaced && input.profile.deinterlace;
    let needs_square = input.source.needs_square_pixels();
    let filter_required = needs_deinterlace || needs_square;
    let pinned = input.profile.transcode_video || input.profile.hw_accel == HwIntent::Force;

    // 2./3. Copy paths, unless the profile pins a transcode
    if !pinned && client_supports(&input.client, codec) && !filter_required {
        let audio_ok = match input
            .source
            .audio_codec
            .as_deref()
            .and_then(normalize_codec)
        {
            Some(audio) => client_supports(&input.client, audio),
            None => true,
        };
        let container_ok = container_matches(&input.source.container, input.output_format);

        if bitrate_within_budget(&input.source, &input.client) {
            if audio_ok && container_ok {
                return Decision {
                    path: DeliveryPath::Direct,
                    video_codec: codec.to_string(),
                    container: out_container,
                    reason: DecisionReason::ClientCompatible,
                    deinterlace: false,
                    square_pixels: false,
                    h264_fallback: false,
                };
            }
            // Container or audio is the only incompatibility: repackage,
            // keep the video bitstream untouched
            let reason = if audio_ok {
                DecisionReason::RemuxContainer
            } else {
                DecisionReason::RemuxAudio
            };
            return Decision {
                path: DeliveryPath::Remux,
                video_codec: codec.to_string(),
                container: out_container,
                reason,
                deinterlace: false,
                square_pixels: false,
                h264_fallback: false,
            };
        }
    }

    // 4. Transcode branch
    let target = match input.profile.video_codec.as_str() {
        "" | "copy" => "h264".to_string(),
        c => normalize_codec(c).unwrap_or("h264").to_string(),
    };

    let hw = &input.hardware;
    let encoder = hw_encoder_for(&target);
    let hw_usable = hw.ready
        && encoder
            .map(|e| hw.verified_encoders.contains(e))
            .unwrap_or(false);
    let gpu_saturated = hw
        .gpu_utilization
        .map(|u| u >= input.gpu_busy_threshold)
        .unwrap_or(false);

    let (path, reason) = match input.profile.hw_accel {
        HwIntent::Force if !hw_usable => {
            return Decision::rejected(
                DecisionReason::HwRequestedUnavailable,
                input.output_format,
            );
        }
        HwIntent::Force if gpu_saturated => {
            (DeliveryPath::TranscodeCpu, DecisionReason::CpuPolicyGpuSaturated)
        }
        HwIntent::Force => (
            DeliveryPath::TranscodeVaapi,
            DecisionReason::ProfileRequestedVaapi,
        ),
        HwIntent::Auto if !hw_usable => {
            (DeliveryPath::TranscodeCpu, DecisionReason::CpuFallbackNoHw)
        }
        HwIntent::Auto if gpu_saturated => {
            (DeliveryPath::TranscodeCpu, DecisionReason::CpuPolicyGpuSaturated)
        }
        HwIntent::Auto => (DeliveryPath::TranscodeVaapi, DecisionReason::HwVerified),
        HwIntent::Off => (DeliveryPath::TranscodeCpu, DecisionReason::ProfileRequestedCpu),
    };

    // 5. AV1 without a verified AV1 encoder ships a compatibility rendition
    let h264_fallback = target == "av1"
        && !hw
            .verified_encoders
            .contains(hw_encoder_for("av1").unwrap_or_default());

    Decision {
        path,
        video_codec: target,
        container: out_container,
        reason,
        deinterlace: needs_deinterlace,
        square_pixels: needs_square,
        h264_fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::QualityProfile;

    fn source_h264_ts() -> SourceInfo {
        SourceInfo {
            video_codec: "h264".to_string(),
            audio_codec: Some("aac".to_string()),
            container: "mpegts".to_string(),
            bitrate: Some(8_000_000),
            width: 1920,
            height: 1080,
            fps: 25.0,
            interlaced: false,
            sample_aspect_ratio: (1, 1),
        }
    }

    fn base_input() -> DecisionInput {
        DecisionInput {
            source: source_h264_ts(),
            profile: Profile::for_quality(QualityProfile::Standard),
            client: Some(ClientCaps {
                codecs: vec!["h264".into(), "aac".into()],
                containers: vec!["mpegts".into()],
                max_bandwidth: None,
            }),
            hardware: HardwareState::default(),
            output_format: OutputFormat::HlsTs,
            gpu_busy_threshold: 85.0,
        }
    }

    #[test]
    fn compatible_input_goes_direct() {
        let input = base_input();
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::Direct);
        assert_eq!(d.reason, DecisionReason::ClientCompatible);
        assert_eq!(d.video_codec, "h264");
    }

    #[test]
    fn unknown_codec_is_rejected() {
        let mut input = base_input();
        input.source.video_codec = "wmv3".to_string();
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::Rejected);
        assert_eq!(d.reason, DecisionReason::UnsupportedInput);
    }

    #[test]
    fn unknown_container_is_rejected() {
        let mut input = base_input();
        input.source.container = "rm".to_string();
        assert_eq!(decide(&input).reason, DecisionReason::UnsupportedInput);
    }

    #[test]
    fn hevc_aliases_collapse() {
        for alias in ["hvc1", "hev1", "h265", "HEVC"] {
            let mut input = base_input();
            input.source.video_codec = alias.to_string();
            input.client = Some(ClientCaps {
                codecs: vec!["hevc".into(), "aac".into()],
                containers: vec![],
                max_bandwidth: None,
            });
            let d = decide(&input);
            assert_eq!(d.video_codec, "hevc", "{alias}");
            assert_eq!(d.path, DeliveryPath::Direct);
        }
    }

    #[test]
    fn container_mismatch_remuxes_without_reencode() {
        let mut input = base_input();
        input.source.container = "mkv".to_string();
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::Remux);
        assert_eq!(d.reason, DecisionReason::RemuxContainer);
        assert_eq!(d.video_codec, "h264");
    }

    #[test]
    fn unsupported_audio_remuxes_audio_only() {
        let mut input = base_input();
        input.source.audio_codec = Some("ac3".to_string());
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::Remux);
        assert_eq!(d.reason, DecisionReason::RemuxAudio);
    }

    #[test]
    fn deinterlace_requirement_forces_transcode() {
        let mut input = base_input();
        input.source.interlaced = true;
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::TranscodeCpu);
        assert!(d.deinterlace);
    }

    #[test]
    fn anamorphic_source_forces_transcode() {
        let mut input = base_input();
        input.source.sample_aspect_ratio = (64, 45);
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::TranscodeCpu);
        assert!(d.square_pixels);
    }

    #[test]
    fn verified_hardware_is_used_on_auto() {
        let mut input = base_input();
        input.profile.transcode_video = true;
        input.hardware = HardwareState {
            ready: true,
            verified_encoders: ["h264_vaapi".to_string()].into(),
            gpu_utilization: Some(10.0),
        };
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::TranscodeVaapi);
        assert_eq!(d.reason, DecisionReason::HwVerified);
    }

    #[test]
    fn saturated_gpu_falls_back_to_cpu() {
        let mut input = base_input();
        input.profile.transcode_video = true;
        input.hardware = HardwareState {
            ready: true,
            verified_encoders: ["h264_vaapi".to_string()].into(),
            gpu_utilization: Some(97.0),
        };
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::TranscodeCpu);
        assert_eq!(d.reason, DecisionReason::CpuPolicyGpuSaturated);
    }

    #[test]
    fn forced_hardware_without_encoders_is_rejected() {
        let mut input = base_input();
        input.profile.hw_accel = HwIntent::Force;
        input.hardware = HardwareState::default();
        let d = decide(&input);
        assert_eq!(d.path, DeliveryPath::Rejected);
        assert_eq!(d.reason, DecisionReason::HwRequestedUnavailable);
    }

    #[test]
    fn av1_without_verified_encoder_plans_fallback_rendition() {
        let mut input = base_input();
        input.profile.transcode_video = true;
        input.profile.video_codec = "av1".to_string();
        input.profile.hw_accel = HwIntent::Off;
        let d = decide(&input);
        assert_eq!(d.video_codec, "av1");
        assert!(d.h264_fallback);
    }

    #[test]
    fn bitrate_over_budget_leaves_the_copy_path() {
        let mut input = base_input();
        input.client.as_mut().unwrap().max_bandwidth = Some(2_000_000);
        let d = decide(&input);
        assert_ne!(d.path, DeliveryPath::Direct);
        assert_ne!(d.path, DeliveryPath::Remux);
    }

    #[test]
    fn decide_is_deterministic_and_does_not_mutate() {
        let input = base_input();
        let before = input.clone();
        let a = decide(&input);
        let b = decide(&input);
        assert_eq!(a, b);
        assert_eq!(input, before);
    }
}
