//! Typed failure taxonomy for the pipeline.
//!
//! Transient backend errors are absorbed inside the invoker's retry loop and
//! only surface here as `BackendExhausted`. Content errors (malformed stage
//! output, render failures) are explicit variants so the orchestrator can
//! decide between regeneration and abort instead of string-matching.

use std::path::PathBuf;

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    /// Every retry of a backend call failed; carries the last underlying error.
    #[error("backend {backend} exhausted after {attempts} attempts: {last_error}")]
    BackendExhausted {
        backend: String,
        attempts: u32,
        last_error: String,
    },

    /// A stage's parsed output violated its schema even after corrective retries.
    #[error("malformed {stage} output: {detail}")]
    MalformedOutput { stage: &'static str, detail: String },

    /// The renderer subprocess failed or produced no media file.
    #[error("render failure for {section_id}: {detail}")]
    RenderFailure { section_id: String, detail: String },

    /// A referenced attachment does not exist on disk. Never retried.
    #[error("missing asset: {}", .0.display())]
    MissingAsset(PathBuf),

    /// Zero sections matched at assembly time; no output file is written.
    #[error("no section clips matched; nothing to assemble")]
    NoArtifacts,

    /// The run was cancelled before completion.
    #[error("run cancelled")]
    Cancelled,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn malformed(stage: &'static str, detail: impl Into<String>) -> Self {
        Self::MalformedOutput {
            stage,
            detail: detail.into(),
        }
    }

    pub fn render(section_id: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::RenderFailure {
            section_id: section_id.into(),
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_prefixes_are_stable() {
        let err = PipelineError::BackendExhausted {
            backend: "claude".to_string(),
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert!(err.to_string().contains("exhausted after 3 attempts"));

        assert!(PipelineError::malformed("outline", "missing sections")
            .to_string()
            .contains("malformed outline output"));
        assert!(PipelineError::render("section_2_code_setup", "exit 1")
            .to_string()
            .contains("section_2_code_setup"));
        assert!(PipelineError::NoArtifacts
            .to_string()
            .contains("nothing to assemble"));
    }

    #[test]
    fn other_preserves_source() {
        let base = std::io::Error::other("boom");
        let err = PipelineError::Other(anyhow::Error::new(base));
        assert!(err.to_string().contains("boom"));
    }
}
