//! Driving the scene renderer subprocess.
//!
//! The renderer is an external program (manim by default) invoked once per
//! generated scene file. The subprocess is polled rather than waited on so a
//! cancelled run can kill in-flight renders promptly. All renderer stdout
//! and stderr goes to a per-attempt log file; on failure the log tail is
//! folded into the error detail so the regeneration prompt can quote it.

use crate::cancel::CancelToken;
use crate::error::{PipelineError, PipelineResult};
use anyhow::{anyhow, Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const LOG_TAIL_CHARS: usize = 2000;

/// One render invocation: a scene file plus where its output should land.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub section_id: String,
    pub scene_class: String,
    pub code_path: PathBuf,
    /// Renderer output tree; the produced clip is searched for under here.
    pub media_dir: PathBuf,
    pub log_path: PathBuf,
}

/// Seam between section work units and the real renderer subprocess.
pub trait Render: Sync {
    fn render(&self, job: &RenderJob, cancel: &CancelToken) -> PipelineResult<PathBuf>;
}

/// Renderer command resolved at startup.
#[derive(Debug, Clone)]
pub struct ManimRenderer {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ManimRenderer {
    /// Resolve the renderer command: an override string is split shell-style
    /// into program plus leading arguments, otherwise `manim` is looked up
    /// on PATH.
    pub fn resolve(override_command: Option<&str>) -> Result<Self> {
        if let Some(command) = override_command {
            let mut words =
                shell_words::split(command).context("parse renderer override")?;
            if words.is_empty() {
                return Err(anyhow!("renderer override is empty"));
            }
            let program = PathBuf::from(words.remove(0));
            return Ok(Self {
                program,
                leading_args: words,
            });
        }
        let program = which::which("manim").context("locate manim on PATH")?;
        Ok(Self {
            program,
            leading_args: vec!["-ql".to_string()],
        })
    }

    pub fn from_env() -> Result<Self> {
        let override_command = std::env::var("CLIPWRIGHT_RENDERER").ok();
        Self::resolve(override_command.as_deref())
    }
}

impl Render for ManimRenderer {
    fn render(&self, job: &RenderJob, cancel: &CancelToken) -> PipelineResult<PathBuf> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        fs::create_dir_all(&job.media_dir)
            .with_context(|| format!("create media dir {}", job.media_dir.display()))
            .map_err(PipelineError::Other)?;
        let log = File::create(&job.log_path)
            .with_context(|| format!("create render log {}", job.log_path.display()))
            .map_err(PipelineError::Other)?;
        let log_err = log
            .try_clone()
            .context("clone render log handle")
            .map_err(PipelineError::Other)?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.leading_args)
            .arg("--media_dir")
            .arg(&job.media_dir)
            .arg(&job.code_path)
            .arg(&job.scene_class)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err));

        tracing::info!(
            section_id = %job.section_id,
            scene_class = %job.scene_class,
            program = %self.program.display(),
            "render start"
        );
        let mut child = command
            .spawn()
            .with_context(|| format!("spawn renderer {}", self.program.display()))
            .map_err(PipelineError::Other)?;

        let status = loop {
            if cancel.is_cancelled() {
                // Best effort; the process may have exited already.
                let _ = child.kill();
                let _ = child.wait();
                return Err(PipelineError::Cancelled);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => std::thread::sleep(POLL_INTERVAL),
                Err(err) => {
                    return Err(PipelineError::render(
                        &job.section_id,
                        format!("wait for renderer: {err}"),
                    ))
                }
            }
        };

        if !status.success() {
            return Err(PipelineError::render(
                &job.section_id,
                format!("renderer exited with {status}: {}", log_tail(&job.log_path)),
            ));
        }

        match find_scene_clip(&job.media_dir, &job.scene_class) {
            Some(clip) => {
                tracing::info!(section_id = %job.section_id, clip = %clip.display(), "render done");
                Ok(clip)
            }
            None => Err(PipelineError::render(
                &job.section_id,
                format!(
                    "renderer succeeded but produced no {}.mp4 under {}",
                    job.scene_class,
                    job.media_dir.display()
                ),
            )),
        }
    }
}

/// Last chunk of the render log, for error details.
fn log_tail(path: &Path) -> String {
    let Ok(text) = fs::read_to_string(path) else {
        return "(render log unreadable)".to_string();
    };
    let text = text.trim();
    if text.len() <= LOG_TAIL_CHARS {
        return text.to_string();
    }
    let mut start = text.len() - LOG_TAIL_CHARS;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

/// Recursively search the media tree for the clip named after the scene class.
pub fn find_scene_clip(media_dir: &Path, scene_class: &str) -> Option<PathBuf> {
    let target = format!("{scene_class}.mp4");
    let mut stack = vec![media_dir.to_path_buf()];
    let mut found: Option<PathBuf> = None;
    while let Some(dir) = stack.pop() {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                stack.push(path);
            } else if path.file_name().and_then(|name| name.to_str()) == Some(&target) {
                match &found {
                    Some(existing) if existing.as_path() <= path.as_path() => {}
                    _ => found = Some(path),
                }
            }
        }
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_splits_override_shell_style() {
        let renderer =
            ManimRenderer::resolve(Some("python3 -m manim -ql")).expect("resolve");
        assert_eq!(renderer.program, PathBuf::from("python3"));
        assert_eq!(renderer.leading_args, vec!["-m", "manim", "-ql"]);
    }

    #[test]
    fn resolve_rejects_empty_override() {
        assert!(ManimRenderer::resolve(Some("  ")).is_err());
    }

    #[test]
    fn finds_clip_in_nested_media_tree() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("videos").join("scene").join("480p15");
        fs::create_dir_all(&nested).expect("mkdirs");
        fs::write(nested.join("Section0IntroScene.mp4"), b"x").expect("write");
        fs::write(nested.join("OtherScene.mp4"), b"x").expect("write");

        let clip =
            find_scene_clip(dir.path(), "Section0IntroScene").expect("clip found");
        assert!(clip.ends_with("Section0IntroScene.mp4"));
        assert!(find_scene_clip(dir.path(), "MissingScene").is_none());
    }

    #[test]
    fn cancelled_before_spawn_short_circuits() {
        let renderer = ManimRenderer::resolve(Some("true")).expect("resolve");
        let dir = tempfile::tempdir().expect("tempdir");
        let job = RenderJob {
            section_id: "section_0_intro".to_string(),
            scene_class: "Section0IntroScene".to_string(),
            code_path: dir.path().join("section_0_intro_attempt_1.py"),
            media_dir: dir.path().join("media"),
            log_path: dir.path().join("render.log"),
        };
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = renderer.render(&job, &cancel).unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }

    #[test]
    fn log_tail_keeps_the_end() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("render.log");
        let body = format!("{}THE END", "x".repeat(LOG_TAIL_CHARS * 2));
        fs::write(&path, body).expect("write log");
        let tail = log_tail(&path);
        assert!(tail.starts_with("..."));
        assert!(tail.ends_with("THE END"));
    }
}
