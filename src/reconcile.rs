//! Binding logical section ids to produced clip files.
//!
//! Renderers are loose about output naming, so each section id expands into
//! an ordered list of acceptable filenames. Matching is a pure function of
//! the id set and the discovered filenames: candidate priority is fixed,
//! discovery order is irrelevant, and the first match for an id wins.

use crate::storyboard::{Section, Storyboard};
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Scene class name derived from a section id: title-case each underscore
/// segment, concatenate, append `Scene`.
///
/// `section_0_intro` becomes `Section0IntroScene`.
pub fn scene_class_name(section_id: &str) -> String {
    let mut name = String::new();
    for segment in section_id.split('_') {
        let mut chars = segment.chars();
        if let Some(first) = chars.next() {
            name.extend(first.to_uppercase());
            name.push_str(chars.as_str());
        }
    }
    name.push_str("Scene");
    name
}

/// Ordered filename candidates for a section id, highest priority first.
pub fn filename_candidates(section_id: &str) -> Vec<String> {
    vec![
        format!("{section_id}.mp4"),
        format!("{section_id}_optimized.mp4"),
        format!("{}.mp4", scene_class_name(section_id)),
    ]
}

/// Recursively discover clip files under a run directory.
pub fn discover_clips(root: &Path) -> Result<Vec<PathBuf>> {
    let mut clips = Vec::new();
    collect_clips(root, &mut clips)?;
    Ok(clips)
}

fn collect_clips(dir: &Path, clips: &mut Vec<PathBuf>) -> Result<()> {
    if !dir.is_dir() {
        return Ok(());
    }
    let entries =
        fs::read_dir(dir).with_context(|| format!("read dir {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        let path = entry.path();
        if path.is_dir() {
            collect_clips(&path, clips)?;
        } else if path.extension().and_then(|ext| ext.to_str()) == Some("mp4") {
            clips.push(path);
        }
    }
    Ok(())
}

/// Map each section id to at most one discovered clip.
///
/// Duplicate basenames across directories resolve to the lexicographically
/// smallest path, so any permutation of `clips` yields the same mapping.
/// First-match-wins: once an id is bound, later candidates are ignored.
pub fn reconcile(sections: &[Section], clips: &[PathBuf]) -> BTreeMap<String, PathBuf> {
    let mut by_name: BTreeMap<String, PathBuf> = BTreeMap::new();
    for clip in clips {
        let Some(name) = clip.file_name().and_then(|name| name.to_str()) else {
            continue;
        };
        match by_name.get(name) {
            Some(existing) if existing.as_path() <= clip.as_path() => {}
            _ => {
                by_name.insert(name.to_string(), clip.clone());
            }
        }
    }

    let mut mapping = BTreeMap::new();
    for section in sections {
        if mapping.contains_key(&section.id) {
            continue;
        }
        for candidate in filename_candidates(&section.id) {
            let Some(path) = by_name.get(&candidate) else {
                continue;
            };
            if mapping.contains_key(&section.id) {
                tracing::debug!(
                    section_id = %section.id,
                    clip = %path.display(),
                    "ignoring lower priority clip for already-bound section"
                );
            } else {
                tracing::debug!(section_id = %section.id, clip = %path.display(), "matched clip");
                mapping.insert(section.id.clone(), path.clone());
            }
        }
    }
    mapping
}

/// Clips for an existing run directory, ordered by its storyboard.
#[derive(Debug)]
pub struct RunClips {
    pub ordered: Vec<PathBuf>,
    pub matched: usize,
    pub total: usize,
}

/// Re-run reconciliation over a run directory: read its `storyboard.json`,
/// discover clips, and return them in storyboard order. Sections without a
/// matching clip are skipped, never reordered around.
pub fn reconcile_run_dir(run_dir: &Path) -> Result<RunClips> {
    let storyboard_path = run_dir.join("storyboard.json");
    let bytes = fs::read(&storyboard_path)
        .with_context(|| format!("read {}", storyboard_path.display()))?;
    let storyboard: Storyboard =
        serde_json::from_slice(&bytes).context("parse storyboard.json")?;

    let clips = discover_clips(run_dir)?;
    let mapping = reconcile(&storyboard.sections, &clips);
    let ordered = storyboard
        .sections
        .iter()
        .filter_map(|section| mapping.get(&section.id).cloned())
        .collect();
    Ok(RunClips {
        ordered,
        matched: mapping.len(),
        total: storyboard.sections.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn section(id: &str) -> Section {
        Section {
            id: id.to_string(),
            title: id.to_string(),
            lecture_lines: vec!["line".to_string()],
            animations: vec!["anim".to_string()],
        }
    }

    #[test]
    fn scene_class_names_title_case_segments() {
        assert_eq!(scene_class_name("section_0_intro"), "Section0IntroScene");
        assert_eq!(
            scene_class_name("section_4_iteration_2"),
            "Section4Iteration2Scene"
        );
    }

    #[test]
    fn candidates_are_ordered_exact_first() {
        let candidates = filename_candidates("section_0_intro");
        assert_eq!(
            candidates,
            vec![
                "section_0_intro.mp4",
                "section_0_intro_optimized.mp4",
                "Section0IntroScene.mp4"
            ]
        );
    }

    #[test]
    fn matches_by_candidate_priority() {
        let sections = vec![section("section_0_intro")];
        let clips = vec![
            PathBuf::from("media/Section0IntroScene.mp4"),
            PathBuf::from("media/section_0_intro.mp4"),
        ];
        let mapping = reconcile(&sections, &clips);
        assert_eq!(
            mapping["section_0_intro"],
            PathBuf::from("media/section_0_intro.mp4")
        );
    }

    #[test]
    fn mapping_is_permutation_invariant() {
        let sections = vec![
            section("section_0_intro"),
            section("section_1_core"),
            section("section_2_full_code"),
        ];
        let mut clips = vec![
            PathBuf::from("a/section_1_core.mp4"),
            PathBuf::from("b/Section0IntroScene.mp4"),
            PathBuf::from("c/section_2_full_code_optimized.mp4"),
            PathBuf::from("d/section_1_core.mp4"),
        ];
        let forward = reconcile(&sections, &clips);
        clips.reverse();
        let reversed = reconcile(&sections, &clips);
        assert_eq!(forward, reversed);
        // Duplicate basename resolves to the smallest path either way.
        assert_eq!(forward["section_1_core"], PathBuf::from("a/section_1_core.mp4"));
    }

    #[test]
    fn unmatched_sections_are_simply_absent() {
        let sections = vec![section("section_0_intro"), section("section_6_not_found")];
        let clips = vec![PathBuf::from("section_0_intro.mp4")];
        let mapping = reconcile(&sections, &clips);
        assert_eq!(mapping.len(), 1);
        assert!(!mapping.contains_key("section_6_not_found"));
    }

    #[test]
    fn run_dir_merge_order_follows_the_storyboard() {
        let dir = tempfile::tempdir().expect("tempdir");
        // section_10 sorts before section_2 lexicographically; the
        // storyboard order must win.
        let storyboard = Storyboard {
            sections: vec![
                section("section_2_core"),
                section("section_10_summary"),
            ],
        };
        let body = serde_json::to_string_pretty(&storyboard).expect("serialize");
        fs::write(dir.path().join("storyboard.json"), body).expect("write storyboard");
        let media = dir.path().join("media").join("videos");
        fs::create_dir_all(&media).expect("mkdirs");
        fs::write(media.join("section_10_summary.mp4"), b"x").expect("write clip");
        fs::write(media.join("section_2_core.mp4"), b"x").expect("write clip");

        let run = reconcile_run_dir(dir.path()).expect("reconcile run dir");
        assert_eq!(run.matched, 2);
        assert_eq!(run.total, 2);
        assert!(run.ordered[0].ends_with("section_2_core.mp4"));
        assert!(run.ordered[1].ends_with("section_10_summary.mp4"));
    }

    #[test]
    fn run_dir_reports_missing_sections() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storyboard = Storyboard {
            sections: vec![section("section_0_intro"), section("section_1_core")],
        };
        let body = serde_json::to_string_pretty(&storyboard).expect("serialize");
        fs::write(dir.path().join("storyboard.json"), body).expect("write storyboard");
        fs::write(dir.path().join("Section1CoreScene.mp4"), b"x").expect("write clip");

        let run = reconcile_run_dir(dir.path()).expect("reconcile run dir");
        assert_eq!(run.matched, 1);
        assert_eq!(run.total, 2);
        assert_eq!(run.ordered.len(), 1);
        assert!(run.ordered[0].ends_with("Section1CoreScene.mp4"));
    }

    #[test]
    fn run_dir_without_storyboard_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = reconcile_run_dir(dir.path()).unwrap_err();
        assert!(err.to_string().contains("storyboard.json"));
    }

    #[test]
    fn discovers_clips_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("videos").join("480p15");
        fs::create_dir_all(&nested).expect("mkdirs");
        fs::write(nested.join("Section0IntroScene.mp4"), b"x").expect("write clip");
        fs::write(dir.path().join("notes.txt"), b"x").expect("write other");

        let clips = discover_clips(dir.path()).expect("discover");
        assert_eq!(clips.len(), 1);
        assert!(clips[0].ends_with("Section0IntroScene.mp4"));
    }
}
