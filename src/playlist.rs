//! M3U8 playlist parsing (spec §4.2). Recognizes the RFC 8216 subset listed
//! in spec §6: `#EXTM3U`, `#EXT-X-VERSION`, `#EXT-X-TARGETDURATION`,
//! `#EXT-X-ENDLIST`, `#EXT-X-PLAYLIST-TYPE`, `#EXT-X-KEY`, `#EXTINF`,
//! `#EXT-X-STREAM-INF`, `#EXT-X-MEDIA-SEQUENCE`.

use crate::error::PlaylistError;
use crate::model::{EncryptionMethod, EncryptionSpec, Plan, Segment};
use reqwest::Url;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Variant {
    pub resolution: Option<(u32, u32)>,
    pub bandwidth: u64,
    pub codec: Option<String>,
    pub absolute_uri: Url,
}

#[derive(Debug, Clone)]
pub struct MediaPlaylist {
    pub segments: Vec<Segment>,
    pub total_duration: f64,
    pub is_live: bool,
    pub encryption: EncryptionSpec,
    pub sequence_base: u64,
}

impl MediaPlaylist {
    /// Freeze this parsed playlist into an immutable [`Plan`] ready for
    /// `TaskManager::submit` (spec §3: "Plan... Immutable once task is
    /// admitted").
    pub fn into_plan(self, display_name: String, output_path: PathBuf) -> Plan {
        Plan {
            display_name,
            segments: self.segments,
            encryption: self.encryption,
            total_duration_secs: Some(self.total_duration),
            is_live: self.is_live,
            output_path,
            sequence_base: self.sequence_base,
        }
    }
}

#[derive(Debug, Clone)]
pub enum Playlist {
    /// Sorted by bandwidth ascending (spec §4.2).
    Master(Vec<Variant>),
    Media(MediaPlaylist),
}

/// Parse M3U8 `text`, resolving relative URIs against `base_uri`.
pub fn parse(text: &str, base_uri: &Url) -> Result<Playlist, PlaylistError> {
    let first_nonempty = text.lines().map(str::trim).find(|l| !l.is_empty());
    if first_nonempty != Some("#EXTM3U") {
        return Err(PlaylistError::NotAPlaylist);
    }

    let mut variants = Vec::new();
    let mut pending_stream_inf: Option<(u64, Option<(u32, u32)>, Option<String>)> = None;

    let mut segments = Vec::new();
    let mut total_duration = 0.0f64;
    let mut is_live = true;
    let mut sequence_base: u64 = 0;
    let mut current_encryption: Option<EncryptionSpec> = None;
    let mut segment_index: usize = 0;
    let mut pending_duration: Option<f64> = None;

    for raw_line in text.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            let bandwidth = attr(rest, "BANDWIDTH")
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0);
            let resolution = attr(rest, "RESOLUTION").and_then(|v| {
                let mut parts = v.split('x');
                let w = parts.next()?.parse().ok()?;
                let h = parts.next()?.parse().ok()?;
                Some((w, h))
            });
            let codec = attr_quoted(rest, "CODECS");
            pending_stream_inf = Some((bandwidth, resolution, codec));
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            if let Ok(seq) = rest.trim().parse::<u64>() {
                sequence_base = seq;
                segment_index = 0;
            }
            continue;
        }

        if line.starts_with("#EXT-X-ENDLIST") {
            is_live = false;
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-PLAYLIST-TYPE:") {
            if rest.trim().eq_ignore_ascii_case("VOD") {
                is_live = false;
            }
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            current_encryption = Some(parse_key(rest, base_uri)?);
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            let dur_str = rest.split(',').next().unwrap_or("0");
            pending_duration = dur_str.trim().parse::<f64>().ok();
            continue;
        }

        if line.starts_with('#') {
            continue; // unrecognized directive, ignored
        }

        // A URI line: either a variant (after #EXT-X-STREAM-INF) or a
        // segment (after #EXTINF).
        if let Some((bandwidth, resolution, codec)) = pending_stream_inf.take() {
            let absolute_uri = base_uri
                .join(line)
                .map_err(|e| PlaylistError::InvalidUri(e.to_string()))?;
            variants.push(Variant {
                resolution,
                bandwidth,
                codec,
                absolute_uri,
            });
            continue;
        }

        let absolute_uri = base_uri
            .join(line)
            .map_err(|e| PlaylistError::InvalidUri(e.to_string()))?;
        let mut segment = Segment::new(segment_index, absolute_uri.to_string());
        if let Some(d) = pending_duration.take() {
            total_duration += d;
        }
        segment.attempt = 0;
        segments.push(segment);
        segment_index += 1;
    }

    if !variants.is_empty() {
        variants.sort_by_key(|v| v.bandwidth);
        return Ok(Playlist::Master(variants));
    }

    // A media playlist with no segments is a valid boundary case (spec §8:
    // "Zero-segment media playlist -> task Completes immediately with an
    // empty output"), not a parse error — only a missing `#EXTM3U` header
    // makes a playlist unparseable.
    Ok(Playlist::Media(MediaPlaylist {
        segments,
        total_duration,
        is_live,
        encryption: current_encryption.unwrap_or_else(EncryptionSpec::none),
        sequence_base,
    }))
}

fn attr<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    for part in split_attrs(line) {
        if let Some(v) = part.strip_prefix(key).and_then(|r| r.strip_prefix('=')) {
            return Some(v.trim_matches('"'));
        }
    }
    None
}

fn attr_quoted(line: &str, key: &str) -> Option<String> {
    attr(line, key).map(|s| s.to_string())
}

/// Split an attribute-list line on commas that aren't inside quotes (so
/// `CODECS="avc1.4d401f,mp4a.40.2"` survives intact).
fn split_attrs(line: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (i, c) in line.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(line[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(line[start..].trim());
    parts
}

fn parse_key(rest: &str, base_uri: &Url) -> Result<EncryptionSpec, PlaylistError> {
    let method = attr(rest, "METHOD").unwrap_or("NONE").to_string();
    if method.eq_ignore_ascii_case("NONE") {
        return Ok(EncryptionSpec::none());
    }
    if !method.eq_ignore_ascii_case("AES-128") {
        return Err(PlaylistError::UnsupportedMethod(method));
    }

    let key_uri = attr(rest, "URI")
        .ok_or_else(|| PlaylistError::InvalidUri("missing URI on #EXT-X-KEY".to_string()))?;
    let resolved = base_uri
        .join(key_uri)
        .map_err(|e| PlaylistError::InvalidUri(e.to_string()))?;

    let explicit_iv = match attr(rest, "IV") {
        Some(iv_str) => Some(parse_iv(iv_str)?),
        None => None,
    };

    Ok(EncryptionSpec {
        method: EncryptionMethod::Aes128Cbc,
        key_uri: Some(resolved.to_string()),
        explicit_iv,
    })
}

fn parse_iv(iv_str: &str) -> Result<[u8; 16], PlaylistError> {
    let hex_str = iv_str.trim_start_matches("0x").trim_start_matches("0X");
    if hex_str.len() != 32 {
        return Err(PlaylistError::InvalidIv(iv_str.to_string()));
    }
    let bytes = hex::decode(hex_str).map_err(|_| PlaylistError::InvalidIv(iv_str.to_string()))?;
    let mut iv = [0u8; 16];
    iv.copy_from_slice(&bytes);
    Ok(iv)
}
