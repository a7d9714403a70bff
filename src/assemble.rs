//! Merging section clips into the final video.
//!
//! Assembly runs strictly after every section work unit has finished, on the
//! main thread. Clips are concatenated in storyboard order with ffmpeg's
//! concat demuxer; stream copy is tried first and a re-encode is the
//! fallback when the clips' parameters do not line up.

use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Seam between the assembler and the ffmpeg/ffprobe binaries.
pub trait MediaTool: Sync {
    /// Duration of a media file in seconds.
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64>;
    /// Concatenate `clips` in order into `output`.
    fn merge(&self, clips: &[PathBuf], output: &Path) -> PipelineResult<()>;
}

/// What the assembler produced, serialized alongside the output file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssemblyReport {
    pub output: PathBuf,
    pub sections_merged: usize,
    pub duration_seconds: f64,
}

/// Merge the ordered clips into `output` and report what was merged.
///
/// Zero clips is `NoArtifacts`; no output file is written in that case.
pub fn assemble(
    tool: &dyn MediaTool,
    clips: &[PathBuf],
    output: &Path,
) -> PipelineResult<AssemblyReport> {
    if clips.is_empty() {
        return Err(PipelineError::NoArtifacts);
    }

    let mut duration_seconds = 0.0;
    for clip in clips {
        match tool.probe_duration(clip) {
            Ok(duration) => duration_seconds += duration,
            Err(err) => {
                tracing::warn!(clip = %clip.display(), error = %err, "probe failed");
            }
        }
    }

    tool.merge(clips, output)?;
    tracing::info!(
        output = %output.display(),
        sections = clips.len(),
        duration_seconds,
        "assembly complete"
    );
    Ok(AssemblyReport {
        output: output.to_path_buf(),
        sections_merged: clips.len(),
        duration_seconds,
    })
}

/// ffmpeg and ffprobe located on PATH.
#[derive(Debug, Clone)]
pub struct FfmpegTool {
    ffmpeg: PathBuf,
    ffprobe: PathBuf,
}

impl FfmpegTool {
    pub fn discover() -> Result<Self> {
        Ok(Self {
            ffmpeg: which::which("ffmpeg").context("locate ffmpeg on PATH")?,
            ffprobe: which::which("ffprobe").context("locate ffprobe on PATH")?,
        })
    }

    fn run_merge(&self, list_path: &Path, output: &Path, reencode: bool) -> Result<()> {
        let mut command = Command::new(&self.ffmpeg);
        command
            .arg("-y")
            .arg("-f")
            .arg("concat")
            .arg("-safe")
            .arg("0")
            .arg("-i")
            .arg(list_path);
        if reencode {
            command
                .arg("-c:v")
                .arg("libx264")
                .arg("-pix_fmt")
                .arg("yuv420p")
                .arg("-c:a")
                .arg("aac");
        } else {
            command.arg("-c").arg("copy");
        }
        command.arg(output);

        let result = command.output().context("run ffmpeg")?;
        if !result.status.success() {
            return Err(anyhow!(
                "ffmpeg exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr)
            ));
        }
        Ok(())
    }
}

impl MediaTool for FfmpegTool {
    fn probe_duration(&self, path: &Path) -> PipelineResult<f64> {
        let result = Command::new(&self.ffprobe)
            .arg("-v")
            .arg("error")
            .arg("-show_entries")
            .arg("format=duration")
            .arg("-of")
            .arg("json")
            .arg(path)
            .output()
            .context("run ffprobe")
            .map_err(PipelineError::Other)?;
        if !result.status.success() {
            return Err(PipelineError::Other(anyhow!(
                "ffprobe exited with {}: {}",
                result.status,
                String::from_utf8_lossy(&result.stderr)
            )));
        }
        let value: serde_json::Value = serde_json::from_slice(&result.stdout)
            .context("parse ffprobe JSON")
            .map_err(PipelineError::Other)?;
        let duration = value
            .get("format")
            .and_then(|format| format.get("duration"))
            .and_then(|duration| duration.as_str())
            .and_then(|duration| duration.parse::<f64>().ok())
            .ok_or_else(|| {
                PipelineError::Other(anyhow!(
                    "ffprobe output missing format.duration for {}",
                    path.display()
                ))
            })?;
        Ok(duration)
    }

    fn merge(&self, clips: &[PathBuf], output: &Path) -> PipelineResult<()> {
        let list_dir = output.parent().unwrap_or_else(|| Path::new("."));
        let list_path = list_dir.join("concat_list.txt");
        fs::write(&list_path, concat_list(clips))
            .with_context(|| format!("write {}", list_path.display()))
            .map_err(PipelineError::Other)?;

        let merged = self.run_merge(&list_path, output, false).or_else(|err| {
            tracing::warn!(error = %err, "stream-copy merge failed, re-encoding");
            self.run_merge(&list_path, output, true)
        });
        let _ = fs::remove_file(&list_path);
        merged.map_err(PipelineError::Other)
    }
}

/// Concat-demuxer list body. Single quotes in paths use the demuxer's
/// close-escape-reopen form.
fn concat_list(clips: &[PathBuf]) -> String {
    let mut body = String::new();
    for clip in clips {
        let escaped = clip.display().to_string().replace('\'', r"'\''");
        body.push_str(&format!("file '{escaped}'\n"));
    }
    body
}
