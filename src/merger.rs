//! Concatenate staged segments into the final output file (spec §4.5).
//! Prefers an external transcoder (ffmpeg) to remux into a clean container
//! when one is reachable on `PATH`; falls back to raw binary concatenation
//! otherwise.

use crate::error::MergeError;
use std::path::{Path, PathBuf};
use std::time::Duration;

const MISMATCH_TOLERANCE: f64 = 0.01;

/// Locate a usable transcoder: an explicit override wins, otherwise
/// `ffmpeg` is looked up on `PATH` (spec §4.5: "if reachable").
fn locate_transcoder(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        return None;
    }
    which::which("ffmpeg").ok()
}

/// Merge `segment_paths` (in order) into `output_path`.
///
/// Missing segment files are tolerated up to `MISMATCH_TOLERANCE` of the
/// total count (spec §4.5 "best-effort on missing files"); beyond that the
/// merge is rejected rather than producing a silently truncated output.
pub async fn merge(
    segment_paths: &[PathBuf],
    output_path: &Path,
    prefer_transcoder: bool,
    ffmpeg_override: Option<&Path>,
    timeout: Duration,
) -> Result<(), MergeError> {
    let mut present = Vec::with_capacity(segment_paths.len());
    let mut missing = 0usize;
    for path in segment_paths {
        if tokio::fs::metadata(path).await.is_ok() {
            present.push(path.clone());
        } else {
            missing += 1;
            tracing::warn!(path = %path.display(), "segment file missing at merge time");
        }
    }

    let total = segment_paths.len().max(1);
    let mismatch_ratio = missing as f64 / total as f64;
    if mismatch_ratio > MISMATCH_TOLERANCE {
        return Err(MergeError::SegmentCountMismatch {
            plan: segment_paths.len(),
            on_disk: present.len(),
        });
    }

    if let Some(parent) = output_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| MergeError::ConcatFailed(e.to_string()))?;
    }

    if prefer_transcoder {
        if let Some(ffmpeg) = locate_transcoder(ffmpeg_override) {
            match remux_with_transcoder(&ffmpeg, &present, output_path, timeout).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(error = %e, "transcoder remux failed, falling back to binary concatenation");
                }
            }
        }
    }

    // Fallback path (spec §4.5 step 2): binary-concat into a `.ts` file,
    // then if the requested extension is `.mp4` and a transcoder is
    // reachable, attempt a post-hoc remux; otherwise keep the `.ts` and
    // rename it to the requested path.
    let wants_mp4 = output_path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("mp4"))
        .unwrap_or(false);

    if !wants_mp4 {
        return concatenate_segments(&present, output_path).await;
    }

    let ts_path = output_path.with_extension("ts");
    concatenate_segments(&present, &ts_path).await?;

    if let Some(ffmpeg) = locate_transcoder(ffmpeg_override) {
        match remux_with_transcoder(&ffmpeg, std::slice::from_ref(&ts_path), output_path, timeout)
            .await
        {
            Ok(()) => {
                let _ = tokio::fs::remove_file(&ts_path).await;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(error = %e, "post-hoc mp4 remux failed, keeping .ts output");
            }
        }
    }

    tokio::fs::rename(&ts_path, output_path)
        .await
        .map_err(|e| MergeError::ConcatFailed(e.to_string()))
}

/// Binary concatenation: MPEG-TS segments are concatenable byte streams,
/// so this alone produces a playable (if unrefined) output file.
async fn concatenate_segments(segment_paths: &[PathBuf], output_path: &Path) -> Result<(), MergeError> {
    let mut output = tokio::fs::File::create(output_path)
        .await
        .map_err(|e| MergeError::ConcatFailed(e.to_string()))?;
    for path in segment_paths {
        let mut input = tokio::fs::File::open(path)
            .await
            .map_err(|e| MergeError::ConcatFailed(e.to_string()))?;
        tokio::io::copy(&mut input, &mut output)
            .await
            .map_err(|e| MergeError::ConcatFailed(e.to_string()))?;
    }
    Ok(())
}

/// Remux via ffmpeg by feeding it a concat-demuxer list, avoiding a second
/// full read/write pass over an intermediate concatenated file.
async fn remux_with_transcoder(
    ffmpeg: &Path,
    segment_paths: &[PathBuf],
    output_path: &Path,
    timeout: Duration,
) -> Result<(), MergeError> {
    let list_path = output_path.with_extension("concat.txt");
    let list_contents = segment_paths
        .iter()
        .map(|p| format!("file '{}'", p.display().to_string().replace('\'', "'\\''")))
        .collect::<Vec<_>>()
        .join("\n");
    tokio::fs::write(&list_path, list_contents)
        .await
        .map_err(|e| MergeError::TranscoderFailed(e.to_string()))?;

    let mut command = tokio::process::Command::new(ffmpeg);
    command
        .arg("-f")
        .arg("concat")
        .arg("-safe")
        .arg("0")
        .arg("-i")
        .arg(&list_path)
        .arg("-c")
        .arg("copy")
        .arg("-movflags")
        .arg("+faststart")
        .arg("-y")
        .arg(output_path);

    let result = tokio::time::timeout(timeout, command.output()).await;
    let _ = tokio::fs::remove_file(&list_path).await;

    let output = match result {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(MergeError::TranscoderFailed(e.to_string())),
        Err(_) => return Err(MergeError::TranscoderFailed(format!("timed out after {timeout:?}"))),
    };

    if output.status.success() {
        Ok(())
    } else {
        Err(MergeError::TranscoderFailed(
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn binary_concatenation_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (name, body) in [("a.ts", "AAA"), ("b.ts", "BBB")] {
            let path = dir.path().join(name);
            tokio::fs::write(&path, body).await.unwrap();
            paths.push(path);
        }
        let output = dir.path().join("out.ts");

        merge(&paths, &output, false, None, Duration::from_secs(5))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(contents, "AAABBB");
    }

    #[tokio::test]
    async fn missing_file_beyond_tolerance_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("a.ts");
        tokio::fs::write(&present, "AAA").await.unwrap();
        let missing = dir.path().join("b.ts");
        let output = dir.path().join("out.ts");

        let err = merge(
            &[present, missing],
            &output,
            false,
            None,
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MergeError::SegmentCountMismatch { .. }));
    }

    #[tokio::test]
    async fn explicit_transcoder_override_that_does_not_exist_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.ts");
        tokio::fs::write(&a, "AAA").await.unwrap();
        let output = dir.path().join("out.ts");
        let bogus = dir.path().join("not-ffmpeg");

        merge(&[a], &output, true, Some(&bogus), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(output.exists());
    }

    #[tokio::test]
    async fn mp4_target_without_transcoder_keeps_ts_content_renamed() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for (name, body) in [("a.ts", "AAA"), ("b.ts", "BBB")] {
            let path = dir.path().join(name);
            tokio::fs::write(&path, body).await.unwrap();
            paths.push(path);
        }
        let output = dir.path().join("out.mp4");

        // No transcoder configured (bogus override) — falls back to
        // binary concatenation renamed onto the requested `.mp4` path.
        let bogus = dir.path().join("not-ffmpeg");
        merge(&paths, &output, true, Some(&bogus), Duration::from_secs(5))
            .await
            .unwrap();

        assert!(output.exists());
        assert!(!dir.path().join("out.ts").exists());
        let contents = tokio::fs::read_to_string(&output).await.unwrap();
        assert_eq!(contents, "AAABBB");
    }
}
