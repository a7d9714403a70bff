//! Outline schema and validation.
//!
//! The outline is created once by the first stage and never mutated after
//! the storyboard stage begins. Section ids assigned here are the join key
//! for every later stage and must stay stable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Top-level plan for the whole video.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outline {
    pub topic: String,
    pub target_audience: String,
    pub data_case_definition: String,
    #[serde(default)]
    pub algorithm_components: Vec<String>,
    pub sections: Vec<OutlineSection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlineSection {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub visual_suggestion: Option<String>,
    #[serde(default)]
    pub code_mapping: Option<String>,
}

impl OutlineSection {
    /// "None", empty, and absent code mappings all mean "no code here".
    pub fn has_code(&self) -> bool {
        self.code_mapping
            .as_deref()
            .is_some_and(|code| !code.trim().is_empty() && code.trim() != "None")
    }
}

/// Validate the outline schema, returning all violations at once so the
/// retry prompt can name every problem.
pub fn validate_outline(outline: &Outline) -> Option<Vec<String>> {
    let mut errors = Vec::new();

    if outline.topic.trim().is_empty() {
        errors.push("topic is empty".to_string());
    }
    if outline.sections.len() < 3 {
        errors.push(format!(
            "expected at least 3 sections (intro, summary, full code), got {}",
            outline.sections.len()
        ));
    }

    let mut seen = BTreeSet::new();
    for (idx, section) in outline.sections.iter().enumerate() {
        if section.id.trim().is_empty() {
            errors.push(format!("sections[{idx}] has an empty id"));
            continue;
        }
        if !seen.insert(section.id.as_str()) {
            errors.push(format!("duplicate section id {}", section.id));
        }
        if !section.id.starts_with("section_") {
            errors.push(format!(
                "section id {} must start with \"section_\"",
                section.id
            ));
        }
        if section.title.trim().is_empty() {
            errors.push(format!("section {} has an empty title", section.id));
        }
    }

    if let Some(first) = outline.sections.first() {
        if !first.id.starts_with("section_0") {
            errors.push(format!(
                "first section id {} must carry the intro role (section_0_*)",
                first.id
            ));
        }
        if first.has_code() {
            errors.push("intro section must not contain code".to_string());
        }
    }
    if outline.sections.len() >= 3 {
        let summary = &outline.sections[outline.sections.len() - 2];
        if summary.has_code() {
            errors.push(format!(
                "summary section {} must not contain code",
                summary.id
            ));
        }
        let full_code = &outline.sections[outline.sections.len() - 1];
        if !full_code.has_code() {
            errors.push(format!(
                "final section {} must carry the full source code",
                full_code.id
            ));
        }
    }

    if errors.is_empty() {
        None
    } else {
        Some(errors)
    }
}
