//! Storyboard schema, line policies, and asset selection/placement.
//!
//! The storyboard owns the final section list. Once it validates, section
//! ids are frozen: every later stage joins on them and nothing may rename
//! or renumber a section.

use crate::outline::Outline;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

pub const MAX_LECTURE_LINES: usize = 5;
pub const MAX_LINE_CHARS: usize = 120;
pub const MAX_ASSET_KEYWORDS: usize = 4;

/// One independently renderable unit of the final video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Section {
    pub id: String,
    pub title: String,
    pub lecture_lines: Vec<String>,
    pub animations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Storyboard {
    pub sections: Vec<Section>,
}

/// Asset placement rewrite for one section, as returned by the placement
/// stage. Only the animation strings are allowed to differ.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PlacementSection {
    pub section_index: usize,
    pub section_id: String,
    pub animations: Vec<String>,
}

/// Validate the storyboard against the outline it was expanded from.
///
/// The id sequence must match the outline exactly: the storyboard may not
/// add, drop, rename, or reorder sections.
pub fn validate_storyboard(storyboard: &Storyboard, outline: &Outline) -> Option<Vec<String>> {
    let mut errors = Vec::new();

    if storyboard.sections.len() != outline.sections.len() {
        errors.push(format!(
            "storyboard has {} sections, outline has {}",
            storyboard.sections.len(),
            outline.sections.len()
        ));
    }
    for (expected, got) in outline.sections.iter().zip(&storyboard.sections) {
        if expected.id != got.id {
            errors.push(format!(
                "section id mismatch: outline {} vs storyboard {}",
                expected.id, got.id
            ));
        }
    }

    for section in &storyboard.sections {
        if section.lecture_lines.is_empty() {
            errors.push(format!("section {} has no lecture lines", section.id));
        }
        if section.lecture_lines.len() > MAX_LECTURE_LINES {
            errors.push(format!(
                "section {} has {} lecture lines (max {MAX_LECTURE_LINES})",
                section.id,
                section.lecture_lines.len()
            ));
        }
        for (idx, line) in section.lecture_lines.iter().enumerate() {
            if line.chars().count() > MAX_LINE_CHARS {
                errors.push(format!(
                    "section {} line {idx} exceeds {MAX_LINE_CHARS} chars",
                    section.id
                ));
            }
        }
        if section.animations.is_empty() {
            errors.push(format!("section {} has no animations", section.id));
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}

/// Parse asset-selection output: one lowercase single-word keyword per line.
///
/// The prompt is responsible for rejecting abstract concepts; parsing only
/// enforces the shape and the count bound.
pub fn parse_asset_keywords(text: &str) -> Result<BTreeSet<String>, Vec<String>> {
    let word = regex::Regex::new(r"^[a-z]+$").expect("keyword regex");
    let mut errors = Vec::new();
    let mut keywords = BTreeSet::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if word.is_match(line) {
            keywords.insert(line.to_string());
        } else {
            errors.push(format!(
                "keyword {line:?} is not a single lowercase word"
            ));
        }
    }
    if keywords.len() > MAX_ASSET_KEYWORDS {
        errors.push(format!(
            "{} keywords exceed the limit of {MAX_ASSET_KEYWORDS}",
            keywords.len()
        ));
    }
    if errors.is_empty() {
        Ok(keywords)
    } else {
        Err(errors)
    }
}

/// Apply asset placement to the storyboard, enforcing its invariants:
/// only the animation strings of the first and last sections may change.
pub fn apply_placement(
    storyboard: &mut Storyboard,
    placements: &[PlacementSection],
) -> Option<Vec<String>> {
    let mut errors = Vec::new();
    let last_index = storyboard.sections.len().saturating_sub(1);

    for placement in placements {
        if placement.section_index != 0 && placement.section_index != last_index {
            errors.push(format!(
                "placement touches section_index {} (only 0 and {last_index} allowed)",
                placement.section_index
            ));
            continue;
        }
        let Some(section) = storyboard.sections.get(placement.section_index) else {
            errors.push(format!(
                "placement section_index {} out of range",
                placement.section_index
            ));
            continue;
        };
        if section.id != placement.section_id {
            errors.push(format!(
                "placement id {} does not match section {} at index {}",
                placement.section_id, section.id, placement.section_index
            ));
            continue;
        }
        if placement.animations.is_empty() {
            errors.push(format!(
                "placement for {} has no animations",
                placement.section_id
            ));
        }
    }

    if !errors.is_empty() {
        return Some(errors);
    }
    for placement in placements {
        storyboard.sections[placement.section_index].animations = placement.animations.clone();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outline::OutlineSection;

    fn outline_with_ids(ids: &[&str]) -> Outline {
        Outline {
            topic: "t".to_string(),
            target_audience: "a".to_string(),
            data_case_definition: "d".to_string(),
            algorithm_components: Vec::new(),
            sections: ids
                .iter()
                .map(|id| OutlineSection {
                    id: id.to_string(),
                    title: id.to_string(),
                    content: "c".to_string(),
                    visual_suggestion: None,
                    code_mapping: None,
                })
                .collect(),
        }
    }

    fn storyboard_with_ids(ids: &[&str]) -> Storyboard {
        Storyboard {
            sections: ids
                .iter()
                .map(|id| Section {
                    id: id.to_string(),
                    title: id.to_string(),
                    lecture_lines: vec!["line".to_string()],
                    animations: vec!["show".to_string()],
                })
                .collect(),
        }
    }

    #[test]
    fn accepts_matching_storyboard() {
        let ids = ["section_0_intro", "section_1_core", "section_2_full_code"];
        let outline = outline_with_ids(&ids);
        let storyboard = storyboard_with_ids(&ids);
        assert!(validate_storyboard(&storyboard, &outline).is_none());
    }

    #[test]
    fn rejects_renamed_section_id() {
        let outline = outline_with_ids(&["section_0_intro", "section_1_core"]);
        let storyboard = storyboard_with_ids(&["section_0_intro", "section_1_renamed"]);
        let errors = validate_storyboard(&storyboard, &outline).expect("errors");
        assert!(errors.iter().any(|e| e.contains("id mismatch")));
    }

    #[test]
    fn rejects_too_many_lecture_lines() {
        let outline = outline_with_ids(&["section_0_intro"]);
        let mut storyboard = storyboard_with_ids(&["section_0_intro"]);
        storyboard.sections[0].lecture_lines =
            (0..=MAX_LECTURE_LINES).map(|i| format!("line {i}")).collect();
        let errors = validate_storyboard(&storyboard, &outline).expect("errors");
        assert!(errors.iter().any(|e| e.contains("lecture lines")));
    }

    #[test]
    fn rejects_overlong_line() {
        let outline = outline_with_ids(&["section_0_intro"]);
        let mut storyboard = storyboard_with_ids(&["section_0_intro"]);
        storyboard.sections[0].lecture_lines = vec!["x".repeat(MAX_LINE_CHARS + 1)];
        let errors = validate_storyboard(&storyboard, &outline).expect("errors");
        assert!(errors.iter().any(|e| e.contains("exceeds")));
    }

    #[test]
    fn parses_keyword_lines() {
        let keywords = parse_asset_keywords("dog\n\nbook\n").expect("keywords");
        assert_eq!(
            keywords.into_iter().collect::<Vec<_>>(),
            vec!["book".to_string(), "dog".to_string()]
        );
    }

    #[test]
    fn rejects_multiword_keywords() {
        let errors = parse_asset_keywords("big dog").unwrap_err();
        assert!(errors[0].contains("single lowercase word"));
    }

    #[test]
    fn rejects_too_many_keywords() {
        let errors = parse_asset_keywords("a\nb\nc\nd\ne").unwrap_err();
        assert!(errors.iter().any(|e| e.contains("limit")));
    }

    #[test]
    fn placement_rewrites_only_first_and_last_animations() {
        let ids = ["section_0_intro", "section_1_core", "section_2_full_code"];
        let mut storyboard = storyboard_with_ids(&ids);
        let placements = vec![PlacementSection {
            section_index: 0,
            section_id: "section_0_intro".to_string(),
            animations: vec!["show [Asset: dog]".to_string()],
        }];
        assert!(apply_placement(&mut storyboard, &placements).is_none());
        assert_eq!(storyboard.sections[0].animations[0], "show [Asset: dog]");
        assert_eq!(storyboard.sections[1].animations[0], "show");
    }

    #[test]
    fn placement_rejects_middle_sections() {
        let ids = ["section_0_intro", "section_1_core", "section_2_full_code"];
        let mut storyboard = storyboard_with_ids(&ids);
        let before = storyboard.sections[1].animations.clone();
        let placements = vec![PlacementSection {
            section_index: 1,
            section_id: "section_1_core".to_string(),
            animations: vec!["sneaky [Asset: dog]".to_string()],
        }];
        let errors = apply_placement(&mut storyboard, &placements).expect("errors");
        assert!(errors[0].contains("only 0 and 2"));
        assert_eq!(storyboard.sections[1].animations, before);
    }

    #[test]
    fn placement_rejects_mismatched_id() {
        let ids = ["section_0_intro", "section_1_full_code"];
        let mut storyboard = storyboard_with_ids(&ids);
        let placements = vec![PlacementSection {
            section_index: 0,
            section_id: "section_1_full_code".to_string(),
            animations: vec!["x".to_string()],
        }];
        let errors = apply_placement(&mut storyboard, &placements).expect("errors");
        assert!(errors[0].contains("does not match"));
    }
}
