//! Run orchestration: stages, section fan-out, reconciliation, assembly.
//!
//! The pipeline is a short synchronous spine. Outline and storyboard run
//! sequentially on the caller's thread; section work units fan out across a
//! bounded pool of scoped threads; reconciliation and assembly run strictly
//! after the pool drains. A failed section drops out of the final video,
//! only an empty result aborts the run.

use crate::assemble::{assemble, AssemblyReport, MediaTool};
use crate::backend::{Attachment, Generate};
use crate::cancel::CancelToken;
use crate::config::RunConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::outline::{validate_outline, Outline};
use crate::prompts;
use crate::reconcile::{discover_clips, reconcile};
use crate::render::Render;
use crate::section::{run_section, SectionContext, SectionReport};
use crate::stage::{parse_json_stage, run_stage, StageSpec};
use crate::storyboard::{
    apply_placement, parse_asset_keywords, validate_storyboard, PlacementSection, Storyboard,
};
use crate::usage::{UsageLedger, UsageTotals};
use anyhow::{anyhow, Context};
use serde::Serialize;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Final accounting for one run.
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub topic: String,
    pub output: PathBuf,
    pub sections_total: usize,
    pub sections_rendered: usize,
    pub duration_seconds: f64,
    pub cancelled: bool,
    pub sections: Vec<SectionReport>,
    pub usage: UsageTotals,
}

pub struct Pipeline<'a> {
    config: RunConfig,
    invoker: &'a dyn Generate,
    renderer: &'a dyn Render,
    media_tool: &'a dyn MediaTool,
    ledger: Arc<UsageLedger>,
    cancel: CancelToken,
}

impl<'a> Pipeline<'a> {
    pub fn new(
        config: RunConfig,
        invoker: &'a dyn Generate,
        renderer: &'a dyn Render,
        media_tool: &'a dyn MediaTool,
        ledger: Arc<UsageLedger>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            config,
            invoker,
            renderer,
            media_tool,
            ledger,
            cancel,
        }
    }

    /// Drive a topic end to end and return the run report.
    pub fn run(&self, topic: &str) -> PipelineResult<RunReport> {
        let slug = sanitize_topic(topic);
        let run_dir = self.config.output_dir.join(&slug);
        let code_dir = run_dir.join("code");
        let media_dir = run_dir.join("media");
        for dir in [&run_dir, &code_dir, &media_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("create {}", dir.display()))
                .map_err(PipelineError::Other)?;
        }
        tracing::info!(topic, run_dir = %run_dir.display(), "run start");

        let attachments = self.reference_attachments()?;
        let outline = self.outline_stage(topic, &attachments)?;
        write_json(&run_dir.join("outline.json"), &outline)?;

        let mut storyboard = self.storyboard_stage(&outline, &attachments)?;
        if self.config.place_assets {
            self.asset_stages(&mut storyboard)?;
        }
        write_json(&run_dir.join("storyboard.json"), &storyboard)?;

        let reports = self.run_sections(&storyboard, &code_dir, &media_dir)?;
        let cancelled = self.cancel.is_cancelled();
        if cancelled && !self.config.best_effort {
            return Err(PipelineError::Cancelled);
        }

        let clips = discover_clips(&run_dir)?;
        let mapping = reconcile(&storyboard.sections, &clips);
        tracing::info!(
            matched = mapping.len(),
            total = storyboard.sections.len(),
            "clips reconciled"
        );
        let ordered: Vec<PathBuf> = storyboard
            .sections
            .iter()
            .filter_map(|section| mapping.get(&section.id).cloned())
            .collect();

        let output = run_dir.join(format!("{slug}.mp4"));
        let assembly: AssemblyReport = assemble(self.media_tool, &ordered, &output)?;

        let usage = self.ledger.snapshot();
        write_json(&run_dir.join("usage.json"), &usage)?;

        let report = RunReport {
            topic: topic.to_string(),
            output: assembly.output,
            sections_total: storyboard.sections.len(),
            sections_rendered: reports.iter().filter(|r| r.succeeded()).count(),
            duration_seconds: assembly.duration_seconds,
            cancelled,
            sections: reports,
            usage,
        };
        tracing::info!(
            rendered = report.sections_rendered,
            total = report.sections_total,
            output = %report.output.display(),
            "run complete"
        );
        Ok(report)
    }

    fn stage_spec(&self, stage: &'static str) -> StageSpec<'_> {
        StageSpec {
            backend_id: &self.config.backend_id,
            stage,
            stage_retries: self.config.limits.stage_retries,
            max_tokens: self.config.max_tokens,
        }
    }

    fn reference_attachments(&self) -> PipelineResult<Vec<Attachment>> {
        let Some(image) = &self.config.reference_image else {
            return Ok(Vec::new());
        };
        if !image.is_file() {
            return Err(PipelineError::MissingAsset(image.clone()));
        }
        Ok(vec![Attachment::Image(image.clone())])
    }

    fn outline_stage(
        &self,
        topic: &str,
        attachments: &[Attachment],
    ) -> PipelineResult<Outline> {
        let has_image = !attachments.is_empty();
        let outcome = run_stage(
            self.invoker,
            &self.stage_spec("outline"),
            attachments,
            |feedback| {
                prompts::outline_prompt(
                    topic,
                    self.config.duration_minutes,
                    has_image,
                    feedback,
                )
            },
            |text| {
                let outline: Outline = parse_json_stage(text)?;
                match validate_outline(&outline) {
                    None => Ok(outline),
                    Some(errors) => Err(errors),
                }
            },
        )?;
        Ok(outcome.value)
    }

    fn storyboard_stage(
        &self,
        outline: &Outline,
        attachments: &[Attachment],
    ) -> PipelineResult<Storyboard> {
        let outline_json = serde_json::to_string_pretty(outline)
            .context("serialize outline")
            .map_err(PipelineError::Other)?;
        let has_image = !attachments.is_empty();
        let outcome = run_stage(
            self.invoker,
            &self.stage_spec("storyboard"),
            attachments,
            |feedback| prompts::storyboard_prompt(&outline_json, has_image, feedback),
            |text| {
                let storyboard: Storyboard = parse_json_stage(text)?;
                match validate_storyboard(&storyboard, outline) {
                    None => Ok(storyboard),
                    Some(errors) => Err(errors),
                }
            },
        )?;
        Ok(outcome.value)
    }

    /// Select visual asset keywords, then let the backend weave them into
    /// the opening and closing sections' animations.
    fn asset_stages(&self, storyboard: &mut Storyboard) -> PipelineResult<()> {
        let storyboard_json = serde_json::to_string_pretty(storyboard)
            .context("serialize storyboard")
            .map_err(PipelineError::Other)?;
        let keywords = run_stage(
            self.invoker,
            &self.stage_spec("asset_select"),
            &[],
            |feedback| prompts::asset_select_prompt(&storyboard_json, feedback),
            parse_asset_keywords,
        )?
        .value;
        if keywords.is_empty() {
            tracing::info!("no asset keywords selected, skipping placement");
            return Ok(());
        }
        let asset_list = keywords.iter().cloned().collect::<Vec<_>>().join("\n");

        let edge_sections = edge_placements(storyboard);
        let animations_json = serde_json::to_string_pretty(&edge_sections)
            .context("serialize edge sections")
            .map_err(PipelineError::Other)?;
        let placements = run_stage(
            self.invoker,
            &self.stage_spec("asset_place"),
            &[],
            |feedback| prompts::asset_place_prompt(&asset_list, &animations_json, feedback),
            |text| {
                let placements: Vec<PlacementSection> = parse_json_stage(text)?;
                let mut trial = storyboard.clone();
                match apply_placement(&mut trial, &placements) {
                    None => Ok(placements),
                    Some(errors) => Err(errors),
                }
            },
        )?
        .value;
        // Validated against a clone above, so this cannot report errors.
        if let Some(errors) = apply_placement(storyboard, &placements) {
            return Err(PipelineError::malformed("asset_place", errors.join("; ")));
        }
        Ok(())
    }

    fn run_sections(
        &self,
        storyboard: &Storyboard,
        code_dir: &std::path::Path,
        media_dir: &std::path::Path,
    ) -> PipelineResult<Vec<SectionReport>> {
        let sections = &storyboard.sections;
        let worker_count = self.config.concurrency.clamp(1, sections.len().max(1));
        let cursor = AtomicUsize::new(0);
        let reports: Mutex<Vec<(usize, SectionReport)>> = Mutex::new(Vec::new());
        let context = SectionContext {
            backend_id: &self.config.backend_id,
            max_tokens: self.config.max_tokens,
            max_regenerate_tries: self.config.limits.max_regenerate_tries,
            code_dir: code_dir.to_path_buf(),
            media_dir: media_dir.to_path_buf(),
        };

        tracing::info!(workers = worker_count, sections = sections.len(), "section fan-out");
        let worker_results: Vec<PipelineResult<()>> = std::thread::scope(|scope| {
            let mut handles = Vec::new();
            for _ in 0..worker_count {
                handles.push(scope.spawn(|| -> PipelineResult<()> {
                    loop {
                        let index = cursor.fetch_add(1, Ordering::SeqCst);
                        if index >= sections.len() {
                            return Ok(());
                        }
                        if self.cancel.is_cancelled() {
                            return Err(PipelineError::Cancelled);
                        }
                        let report = run_section(
                            self.invoker,
                            self.renderer,
                            &context,
                            &sections[index],
                            &self.cancel,
                        )?;
                        reports
                            .lock()
                            .map_err(|_| {
                                PipelineError::Other(anyhow!("section report lock poisoned"))
                            })?
                            .push((index, report));
                    }
                }));
            }
            handles
                .into_iter()
                .map(|handle| {
                    handle
                        .join()
                        .unwrap_or_else(|_| Err(PipelineError::Other(anyhow!("worker panicked"))))
                })
                .collect()
        });

        for result in worker_results {
            match result {
                Ok(()) => {}
                Err(PipelineError::Cancelled) if self.config.best_effort => {}
                Err(err) => return Err(err),
            }
        }

        let mut reports = reports
            .into_inner()
            .map_err(|_| PipelineError::Other(anyhow!("section report lock poisoned")))?;
        reports.sort_by_key(|(index, _)| *index);
        Ok(reports.into_iter().map(|(_, report)| report).collect())
    }
}

/// The first and last sections' current animations, as the placement prompt
/// presents them.
fn edge_placements(storyboard: &Storyboard) -> Vec<PlacementSection> {
    let mut edges = Vec::new();
    if let Some(first) = storyboard.sections.first() {
        edges.push(PlacementSection {
            section_index: 0,
            section_id: first.id.clone(),
            animations: first.animations.clone(),
        });
    }
    if storyboard.sections.len() > 1 {
        let last_index = storyboard.sections.len() - 1;
        let last = &storyboard.sections[last_index];
        edges.push(PlacementSection {
            section_index: last_index,
            section_id: last.id.clone(),
            animations: last.animations.clone(),
        });
    }
    edges
}

fn write_json<T: Serialize>(path: &std::path::Path, value: &T) -> PipelineResult<()> {
    let body = serde_json::to_string_pretty(value)
        .context("serialize JSON artifact")
        .map_err(PipelineError::Other)?;
    fs::write(path, body)
        .with_context(|| format!("write {}", path.display()))
        .map_err(PipelineError::Other)
}

/// Filesystem-safe slug for the run directory and output file.
pub fn sanitize_topic(topic: &str) -> String {
    let mut slug = String::new();
    let mut gap = false;
    for ch in topic.chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            gap = false;
        } else if !slug.is_empty() && !gap {
            slug.push('_');
            gap = true;
        }
    }
    let slug = slug.trim_end_matches('_').to_string();
    if slug.is_empty() {
        "video".to_string()
    } else {
        slug
    }
}
