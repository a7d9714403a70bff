//! Per-section generate/render work unit.
//!
//! Each section moves through a small state machine: code is generated,
//! written to disk, and rendered; a render failure queues a regeneration
//! whose prompt carries the failure note, up to the regeneration bound.
//! A section that exhausts its bound is dropped from the run; the rest of
//! the pipeline continues without it.

use crate::backend::{Generate, GenerationRequest};
use crate::cancel::CancelToken;
use crate::error::{PipelineError, PipelineResult};
use crate::prompts;
use crate::reconcile::scene_class_name;
use crate::render::{Render, RenderJob};
use crate::storyboard::Section;
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::PathBuf;

/// Where a section is in its generate/render cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionState {
    Pending,
    CodeGenerated { attempt: u32 },
    RenderAttempted { attempt: u32 },
    Validated,
    RegenerateQueued { attempt: u32 },
    Exhausted,
}

impl fmt::Display for SectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::CodeGenerated { attempt } => write!(f, "code_generated({attempt})"),
            Self::RenderAttempted { attempt } => write!(f, "render_attempted({attempt})"),
            Self::Validated => write!(f, "validated"),
            Self::RegenerateQueued { attempt } => write!(f, "regenerate_queued({attempt})"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Terminal result of one section work unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SectionOutcome {
    Rendered { clip: PathBuf },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionReport {
    pub section_id: String,
    pub attempts: u32,
    pub outcome: SectionOutcome,
}

impl SectionReport {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SectionOutcome::Rendered { .. })
    }
}

/// Immutable inputs shared by one section's attempts.
pub struct SectionContext<'a> {
    pub backend_id: &'a str,
    pub max_tokens: u32,
    pub max_regenerate_tries: u32,
    /// Generated scene files and render logs land here.
    pub code_dir: PathBuf,
    /// Renderer output tree for this run.
    pub media_dir: PathBuf,
}

/// Run one section to a terminal state.
///
/// Render failures are retried with a failure note in the next prompt;
/// backend exhaustion is terminal for the section since the invoker already
/// retried the call. Only cancellation propagates as an error.
pub fn run_section(
    invoker: &dyn Generate,
    renderer: &dyn Render,
    context: &SectionContext<'_>,
    section: &Section,
    cancel: &CancelToken,
) -> PipelineResult<SectionReport> {
    let scene_class = scene_class_name(&section.id);
    let mut state = SectionState::Pending;
    let mut feedback: Option<String> = None;
    tracing::debug!(section_id = %section.id, state = %state, "section state");

    for attempt in 1..=context.max_regenerate_tries {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let note = match feedback.as_deref() {
            Some(detail) => {
                prompts::regenerate_note(attempt, context.max_regenerate_tries, detail)
            }
            None => String::new(),
        };
        let prompt = prompts::section_code_prompt(section, &scene_class, &note);
        let generation = match invoker.generate(&GenerationRequest {
            backend_id: context.backend_id.to_string(),
            prompt,
            attachments: Vec::new(),
            max_tokens: context.max_tokens,
        }) {
            Ok(generation) => generation,
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(err) => {
                tracing::warn!(section_id = %section.id, error = %err, "section dropped");
                return Ok(SectionReport {
                    section_id: section.id.clone(),
                    attempts: attempt,
                    outcome: SectionOutcome::Failed {
                        reason: err.to_string(),
                    },
                });
            }
        };

        let code = extract_code(&generation.content);
        let code_path = context
            .code_dir
            .join(format!("{}_attempt_{attempt}.py", section.id));
        fs::write(&code_path, code)
            .with_context(|| format!("write scene file {}", code_path.display()))
            .map_err(PipelineError::Other)?;
        state = SectionState::CodeGenerated { attempt };
        tracing::debug!(section_id = %section.id, state = %state, "section state");

        let job = RenderJob {
            section_id: section.id.clone(),
            scene_class: scene_class.clone(),
            code_path,
            media_dir: context.media_dir.clone(),
            log_path: context
                .code_dir
                .join(format!("{}_attempt_{attempt}.log", section.id)),
        };
        state = SectionState::RenderAttempted { attempt };
        tracing::debug!(section_id = %section.id, state = %state, "section state");

        match renderer.render(&job, cancel) {
            Ok(clip) => {
                state = SectionState::Validated;
                tracing::info!(
                    section_id = %section.id,
                    state = %state,
                    attempts = attempt,
                    "section complete"
                );
                return Ok(SectionReport {
                    section_id: section.id.clone(),
                    attempts: attempt,
                    outcome: SectionOutcome::Rendered { clip },
                });
            }
            Err(PipelineError::Cancelled) => return Err(PipelineError::Cancelled),
            Err(PipelineError::RenderFailure { detail, .. }) => {
                if attempt < context.max_regenerate_tries {
                    state = SectionState::RegenerateQueued { attempt };
                    tracing::warn!(
                        section_id = %section.id,
                        state = %state,
                        detail = %detail,
                        "render failed, regenerating"
                    );
                    feedback = Some(detail);
                } else {
                    feedback = Some(detail);
                }
            }
            Err(err) => return Err(err),
        }
    }

    state = SectionState::Exhausted;
    let reason = feedback.unwrap_or_else(|| "no render attempts made".to_string());
    tracing::warn!(
        section_id = %section.id,
        state = %state,
        attempts = context.max_regenerate_tries,
        reason = %reason,
        "section exhausted"
    );
    Ok(SectionReport {
        section_id: section.id.clone(),
        attempts: context.max_regenerate_tries,
        outcome: SectionOutcome::Failed { reason },
    })
}

/// Strip a markdown code fence from generated scene code, if present.
pub fn extract_code(text: &str) -> &str {
    let text = text.trim();
    for fence in ["```python", "```py", "```"] {
        if let Some(start) = text.find(fence) {
            let start = start + fence.len();
            if let Some(end) = text[start..].find("```") {
                return text[start..start + end].trim();
            }
        }
    }
    text
}
