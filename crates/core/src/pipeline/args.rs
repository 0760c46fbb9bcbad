use crate::decision::{Decision, DeliveryPath};
use crate::hls;
use crate::stream::{OutputFormat, Profile};
use std::path::PathBuf;

/// Everything the argv builder needs to describe one encoder run
#[derive(Debug, Clone)]
pub struct PipelinePlan {
    pub session_id: String,
    pub input_url: String,
    pub decision: Decision,
    pub profile: Profile,
    pub output_format: OutputFormat,
    pub session_dir: PathBuf,
    pub segment_seconds: u32,
    pub dvr_window_seconds: u32,
    /// Input frame rate; falls back to 25 when unprobed
    pub fps: f32,
    /// Timestamp-repair attempt after a DTS/PTS failure
    pub repair: bool,
    pub hw_device: String,
}

impl PipelinePlan {
    pub fn gop(&self) -> u32 {
        let fps = if self.fps > 0.0 { self.fps } else { 25.0 };
        (fps.round() as u32 * self.segment_seconds.max(1)).max(1)
    }
}

/// Bitrate of the H.264 compatibility rendition: 80% of the primary,
/// floored at 1000 and capped at 5000 kbps
pub fn fallback_bitrate_kbps(primary_kbps: u32) -> u32 {
    ((primary_kbps as u64 * 8 / 10) as u32).clamp(1_000, 5_000)
}

fn cpu_encoder(codec: &str) -> &'static str {
    match codec {
        "hevc" => "libx265",
        "av1" => "libsvtav1",
        "mpeg2video" => "mpeg2video",
        _ => "libx264",
    }
}

fn vaapi_encoder(codec: &str) -> String {
    match codec {
        "hevc" => "hevc_vaapi".to_string(),
        "av1" => "av1_vaapi".to_string(),
        "mpeg2video" => "mpeg2_vaapi".to_string(),
        _ => "h264_vaapi".to_string(),
    }
}

/// Synthesize the encoder argv.
///
/// Ordering is load-bearing: hardware device init precedes the input URL,
/// the input precedes stream mapping, mapping precedes the codec/filter
/// chain, and output options precede the output path.
pub fn build_args(plan: &PipelinePlan) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-hide_banner".into(),
        "-loglevel".into(),
        "error".into(),
        "-nostdin".into(),
    ];

    if plan.repair {
        args.push("-fflags".into());
        args.push("+genpts".into());
    }

    let hw = plan.decision.path == DeliveryPath::TranscodeVaapi;
    if hw {
        args.push("-init_hw_device".into());
        args.push(format!("vaapi=va:{}", plan.hw_device));
        args.push("-filter_hw_device".into());
        args.push("va".into());
    }

    args.push("-i".into());
    args.push(plan.input_url.clone());

    push_primary_output(&mut args, plan, hw);

    if plan.decision.h264_fallback && plan.decision.path != DeliveryPath::Rejected {
        push_fallback_output(&mut args, plan);
    }

    args
}

fn push_primary_output(args: &mut Vec<String>, plan: &PipelinePlan, hw: bool) {
    args.push("-map".into());
    args.push("0:v:0".into());
    args.push("-map".into());
    args.push("0:a:0?".into());

    match plan.decision.path {
        DeliveryPath::Direct => {
            args.push("-c:v".into());
            args.push("copy".into());
            args.push("-c:a".into());
            args.push("copy".into());
        }
        DeliveryPath::Remux => {
            args.push("-c:v".into());
            args.push("copy".into());
            push_audio_transcode(args, plan.profile.audio_bitrate_kbps.max(96));
        }
        DeliveryPath::TranscodeCpu | DeliveryPath::TranscodeVaapi => {
            push_filters(args, plan, hw);
            args.push("-c:v".into());
            if hw {
                args.push(vaapi_encoder(&plan.decision.video_codec));
            } else {
                args.push(cpu_encoder(&plan.decision.video_codec).into());
                args.push("-preset".into());
                args.push(plan.profile.preset.clone());
                args.push("-crf".into());
                args.push(plan.profile.crf.to_string());
                args.push("-pix_fmt".into());
                args.push("yuv420p".into());
            }
            if plan.profile.max_rate_kbps > 0 {
                args.push("-maxrate".into());
                args.push(format!("{}k", plan.profile.max_rate_kbps));
                args.push("-bufsize".into());
                args.push(format!("{}k", plan.profile.buf_size_kbps.max(plan.profile.max_rate_kbps)));
            }
            push_gop(args, plan.gop());
            push_audio_transcode(args, plan.profile.audio_bitrate_kbps.max(96));
        }
        DeliveryPath::Rejected => {}
    }

    args.push("-progress".into());
    args.push("pipe:2".into());

    push_hls_output(args, plan, false);
}

fn push_fallback_output(args: &mut Vec<String>, plan: &PipelinePlan) {
    let rate = fallback_bitrate_kbps(plan.profile.max_rate_kbps);

    args.push("-map".into());
    args.push("0:v:0".into());
    args.push("-map".into());
    args.push("0:a:0?".into());

    args.push("-c:v".into());
    args.push("libx264".into());
    args.push("-preset".into());
    args.push("veryfast".into());
    args.push("-b:v".into());
    args.push(format!("{rate}k"));
    args.push("-maxrate".into());
    args.push(format!("{rate}k"));
    args.push("-bufsize".into());
    args.push(format!("{}k", rate * 2));
    args.push("-pix_fmt".into());
    args.push("yuv420p".into());
    push_gop(args, plan.gop());
    push_audio_transcode(args, 128);

    push_hls_output(args, plan, true);
}

fn push_filters(args: &mut Vec<String>, plan: &PipelinePlan, hw: bool) {
    let mut chain: Vec<String> = Vec::new();
    if plan.decision.square_pixels {
        chain.push("scale=iw*sar:ih".into());
        chain.push("setsar=1".into());
    }
    if hw {
        if plan.decision.deinterlace {
            chain.push("format=nv12".into());
            chain.push("hwupload".into());
            chain.push("deinterlace_vaapi".into());
        } else {
            chain.push("format=nv12".into());
            chain.push("hwupload".into());
        }
    } else if plan.decision.deinterlace {
        chain.push("yadif".into());
    }
    if !chain.is_empty() {
        args.push("-vf".into());
        args.push(chain.join(","));
    }
}

fn push_gop(args: &mut Vec<String>, gop: u32) {
    args.push("-g".into());
    args.push(gop.to_string());
    args.push("-keyint_min".into());
    args.push(gop.to_string());
    args.push("-sc_threshold".into());
    args.push("0".into());
}

fn push_audio_transcode(args: &mut Vec<String>, bitrate_kbps: u32) {
    args.push("-c:a".into());
    args.push("aac".into());
    args.push("-b:a".into());
    args.push(format!("{bitrate_kbps}k"));
    args.push("-ac".into());
    args.push("2".into());
}

fn push_hls_output(args: &mut Vec<String>, plan: &PipelinePlan, alt: bool) {
    let list_size = hls::hls_list_size(plan.dvr_window_seconds, plan.segment_seconds);
    let fmp4 = plan.output_format == OutputFormat::HlsFmp4;
    let prefix = if alt { "alt_" } else { "" };

    args.push("-f".into());
    args.push("hls".into());
    args.push("-hls_time".into());
    args.push(plan.segment_seconds.max(1).to_string());
    args.push("-hls_list_size".into());
    args.push(list_size.to_string());
    args.push("-hls_flags".into());
    args.push("delete_segments+append_list+independent_segments+program_date_time".into());
    args.push("-hls_segment_type".into());
    args.push(if fmp4 { "fmp4" } else { "mpegts" }.into());
    if fmp4 {
        args.push("-hls_fmp4_init_filename".into());
        args.push(format!("{prefix}init.mp4"));
    }
    args.push("-hls_segment_filename".into());
    let seg_ext = if fmp4 { "m4s" } else { "ts" };
    args.push(
        plan.session_dir
            .join(format!("{prefix}seg_%06d.{seg_ext}"))
            .display()
            .to_string(),
    );
    args.push(
        plan.session_dir
            .join(format!("{prefix}stream.m3u8"))
            .display()
            .to_string(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{Container, DecisionReason};
    use crate::stream::QualityProfile;

    fn decision(path: DeliveryPath) -> Decision {
        Decision {
            path,
            video_codec: "h264".to_string(),
            container: Container::MpegTs,
            reason: DecisionReason::ClientCompatible,
            deinterlace: false,
            square_pixels: false,
            h264_fallback: false,
        }
    }

    fn plan(path: DeliveryPath) -> PipelinePlan {
        PipelinePlan {
            session_id: "sess-1".to_string(),
            input_url: "http://receiver.lan:8001/1:0:19:2B66".to_string(),
            decision: decision(path),
            profile: Profile::for_quality(QualityProfile::Standard),
            output_format: OutputFormat::HlsTs,
            session_dir: PathBuf::from("/hls/sessions/sess-1"),
            segment_seconds: 4,
            dvr_window_seconds: 60,
            fps: 25.0,
            repair: false,
            hw_device: "/dev/dri/renderD128".to_string(),
        }
    }

    fn pos(args: &[String], needle: &str) -> usize {
        args.iter()
            .position(|a| a == needle)
            .unwrap_or_else(|| panic!("{needle} not in {args:?}"))
    }

    #[test]
    fn hw_init_precedes_input_precedes_map_precedes_output() {
        let mut p = plan(DeliveryPath::TranscodeVaapi);
        p.decision.video_codec = "hevc".to_string();
        let args = build_args(&p);

        let hw = pos(&args, "-init_hw_device");
        let input = pos(&args, "-i");
        let map = pos(&args, "-map");
        let codec = pos(&args, "-c:v");
        let hls = pos(&args, "-f");
        let out = pos(&args, "/hls/sessions/sess-1/stream.m3u8");

        assert!(hw < input);
        assert!(input < map);
        assert!(map < codec);
        assert!(codec < hls);
        assert!(hls < out);
        assert!(args.contains(&"hevc_vaapi".to_string()));
    }

    #[test]
    fn gop_is_fps_times_segment_seconds() {
        let p = plan(DeliveryPath::TranscodeCpu);
        assert_eq!(p.gop(), 100);
        let args = build_args(&p);
        let g = pos(&args, "-g");
        assert_eq!(args[g + 1], "100");
    }

    #[test]
    fn direct_path_copies_both_streams() {
        let args = build_args(&plan(DeliveryPath::Direct));
        let v = pos(&args, "-c:v");
        assert_eq!(args[v + 1], "copy");
        let a = pos(&args, "-c:a");
        assert_eq!(args[a + 1], "copy");
        assert!(!args.contains(&"-vf".to_string()));
    }

    #[test]
    fn remux_copies_video_and_reencodes_audio() {
        let args = build_args(&plan(DeliveryPath::Remux));
        let v = pos(&args, "-c:v");
        assert_eq!(args[v + 1], "copy");
        let a = pos(&args, "-c:a");
        assert_eq!(args[a + 1], "aac");
    }

    #[test]
    fn progress_pipe_is_always_requested() {
        for path in [
            DeliveryPath::Direct,
            DeliveryPath::Remux,
            DeliveryPath::TranscodeCpu,
        ] {
            let args = build_args(&plan(path));
            let p = pos(&args, "-progress");
            assert_eq!(args[p + 1], "pipe:2");
        }
    }

    #[test]
    fn list_size_honors_dvr_window_with_floor() {
        let mut p = plan(DeliveryPath::Direct);
        let args = build_args(&p);
        let i = pos(&args, "-hls_list_size");
        assert_eq!(args[i + 1], "15"); // ceil(60 / 4)

        p.dvr_window_seconds = 4;
        let args = build_args(&p);
        let i = pos(&args, "-hls_list_size");
        assert_eq!(args[i + 1], "3"); // floor of 3
    }

    #[test]
    fn av1_fallback_appends_complete_alt_output() {
        let mut p = plan(DeliveryPath::TranscodeCpu);
        p.decision.video_codec = "av1".to_string();
        p.decision.h264_fallback = true;
        p.output_format = OutputFormat::HlsFmp4;
        let args = build_args(&p);

        let alt_playlist = pos(&args, "/hls/sessions/sess-1/alt_stream.m3u8");
        let primary_playlist = pos(&args, "/hls/sessions/sess-1/stream.m3u8");
        assert!(primary_playlist < alt_playlist);
        assert!(args.contains(&"libsvtav1".to_string()));
        assert!(args.contains(&"libx264".to_string()));
        assert!(args.contains(&"alt_init.mp4".to_string()));
        assert!(args.iter().any(|a| a.contains("alt_seg_%06d.m4s")));

        // 80% of 5000, inside [1000, 5000]
        let b = pos(&args, "-b:v");
        assert_eq!(args[b + 1], "4000k");
    }

    #[test]
    fn fallback_bitrate_clamps() {
        assert_eq!(fallback_bitrate_kbps(500), 1_000);
        assert_eq!(fallback_bitrate_kbps(5_000), 4_000);
        assert_eq!(fallback_bitrate_kbps(20_000), 5_000);
    }

    #[test]
    fn repair_flag_injects_genpts_before_input() {
        let mut p = plan(DeliveryPath::Remux);
        p.repair = true;
        let args = build_args(&p);
        let fflags = pos(&args, "-fflags");
        assert_eq!(args[fflags + 1], "+genpts");
        assert!(fflags < pos(&args, "-i"));
    }

    #[test]
    fn deinterlace_and_sar_filters_compose() {
        let mut p = plan(DeliveryPath::TranscodeCpu);
        p.decision.deinterlace = true;
        p.decision.square_pixels = true;
        let args = build_args(&p);
        let vf = pos(&args, "-vf");
        assert_eq!(args[vf + 1], "scale=iw*sar:ih,setsar=1,yadif");
    }
}
