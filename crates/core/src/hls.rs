use anyhow::{Context, Result};
use m3u8_rs::{MasterPlaylist, Resolution, VariantStream};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

pub const MASTER_PLAYLIST: &str = "master.m3u8";
pub const PRIMARY_PLAYLIST: &str = "stream.m3u8";
pub const ALT_PLAYLIST: &str = "alt_stream.m3u8";

/// Output directory for one session's HLS artifacts
pub fn session_dir(hls_root: &Path, session_id: &str) -> PathBuf {
    hls_root.join("sessions").join(session_id)
}

/// Rolling playlist length: enough segments to cover the DVR window,
/// never fewer than three
pub fn hls_list_size(dvr_window_seconds: u32, segment_seconds: u32) -> u32 {
    let seg = segment_seconds.max(1);
    dvr_window_seconds.div_ceil(seg).max(3)
}

/// One rendition reference inside the master playlist
#[derive(Debug, Clone)]
pub struct RenditionRef {
    pub uri: String,
    /// Peak bandwidth in bits per second
    pub bandwidth: u64,
    pub codecs: String,
    pub resolution: Option<(u32, u32)>,
}

/// Write `master.m3u8` pointing at the media playlists the encoder
/// produces. Only dual-rendition sessions need one; single-rendition
/// sessions serve `stream.m3u8` directly.
pub fn write_master_playlist(
    dir: &Path,
    primary: &RenditionRef,
    alt: Option<&RenditionRef>,
) -> Result<PathBuf> {
    let mut variants = vec![variant_for(primary)];
    if let Some(alt) = alt {
        variants.push(variant_for(alt));
    }

    let master = MasterPlaylist {
        version: Some(6),
        variants,
        independent_segments: true,
        ..Default::default()
    };

    let path = dir.join(MASTER_PLAYLIST);
    let file = File::create(&path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    master
        .write_to(&mut writer)
        .context("failed to write master playlist")?;
    Ok(path)
}

/// RFC 6381 codec tag for the master playlist's STREAM-INF lines
pub fn codec_tag(codec: &str) -> &'static str {
    match codec {
        "h264" => "avc1.64001f",
        "hevc" => "hvc1.1.6.L120.90",
        "av1" => "av01.0.08M.08",
        "mpeg2video" => "mp2v.61",
        _ => "",
    }
}

fn variant_for(r: &RenditionRef) -> VariantStream {
    VariantStream {
        uri: r.uri.clone(),
        bandwidth: r.bandwidth,
        codecs: Some(r.codecs.clone()),
        resolution: r.resolution.map(|(w, h)| Resolution {
            width: w as u64,
            height: h as u64,
        }),
        ..Default::default()
    }
}
