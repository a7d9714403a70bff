//! Prompt template assembly.
//!
//! Templates live under `prompts/` and are embedded at compile time; this
//! module only substitutes placeholders. The generation wording is content,
//! not logic, so nothing here is load-bearing beyond the placeholder names.

use crate::storyboard::{Section, MAX_ASSET_KEYWORDS, MAX_LECTURE_LINES, MAX_LINE_CHARS};

const OUTLINE: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/outline.md"));
const STORYBOARD: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/storyboard.md"));
const ASSET_SELECT: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/asset_select.md"));
const ASSET_PLACE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/asset_place.md"));
const SECTION_CODE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/prompts/section_code.md"));
const REGENERATE_NOTE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/regenerate_note.md"
));

const REFERENCE_IMAGE_NOTE: &str = "A reference image is attached; follow its \
visual style when suggesting layouts and data-structure drawings.";

/// Corrective context block inserted when a stage's previous response
/// failed validation.
fn feedback_block(feedback: Option<&str>) -> String {
    match feedback {
        Some(detail) => format!(
            "\n## Previous Response Error\n\nYour previous response was invalid. \
             Fix these problems and respond again:\n{detail}\n"
        ),
        None => String::new(),
    }
}

pub fn outline_prompt(
    topic: &str,
    duration_minutes: u32,
    has_reference_image: bool,
    feedback: Option<&str>,
) -> String {
    OUTLINE
        .replace("{topic}", topic)
        .replace("{duration_minutes}", &duration_minutes.to_string())
        .replace(
            "{reference_image_note}",
            if has_reference_image {
                REFERENCE_IMAGE_NOTE
            } else {
                ""
            },
        )
        .replace("{feedback}", &feedback_block(feedback))
}

pub fn storyboard_prompt(
    outline_json: &str,
    has_reference_image: bool,
    feedback: Option<&str>,
) -> String {
    STORYBOARD
        .replace("{outline_json}", outline_json)
        .replace("{max_lecture_lines}", &MAX_LECTURE_LINES.to_string())
        .replace("{max_line_chars}", &MAX_LINE_CHARS.to_string())
        .replace(
            "{reference_image_note}",
            if has_reference_image {
                REFERENCE_IMAGE_NOTE
            } else {
                ""
            },
        )
        .replace("{feedback}", &feedback_block(feedback))
}

pub fn asset_select_prompt(storyboard_json: &str, feedback: Option<&str>) -> String {
    ASSET_SELECT
        .replace("{max_keywords}", &MAX_ASSET_KEYWORDS.to_string())
        .replace("{storyboard_json}", storyboard_json)
        .replace("{feedback}", &feedback_block(feedback))
}

pub fn asset_place_prompt(
    asset_list: &str,
    animations_json: &str,
    feedback: Option<&str>,
) -> String {
    ASSET_PLACE
        .replace("{asset_list}", asset_list)
        .replace("{animations_json}", animations_json)
        .replace("{feedback}", &feedback_block(feedback))
}

pub fn section_code_prompt(section: &Section, scene_class: &str, regenerate_note: &str) -> String {
    SECTION_CODE
        .replace("{regenerate_note}", regenerate_note)
        .replace("{section_title}", &section.title)
        .replace("{lecture_lines}", &section.lecture_lines.join(" | "))
        .replace("{animations}", &section.animations.join("; "))
        .replace("{scene_class}", scene_class)
}

/// Failure note embedded in the prompt from the second attempt on.
pub fn regenerate_note(attempt: u32, max_tries: u32, feedback: &str) -> String {
    REGENERATE_NOTE
        .replace("{attempt}", &attempt.to_string())
        .replace("{max_tries}", &max_tries.to_string())
        .replace("{feedback}", feedback)
}
