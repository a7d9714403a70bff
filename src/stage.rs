//! Stage execution with bounded validation retries.
//!
//! Each pipeline stage is a triple: build a prompt, invoke a backend, parse
//! and validate the result. A schema violation does not blindly re-run the
//! call; the violations are fed back into the next prompt as corrective
//! context, up to a small bound, after which the run fails with
//! `MalformedOutput`.

use crate::backend::{Attachment, Generate, GenerationRequest};
use crate::error::{PipelineError, PipelineResult};

/// Parsed and validated stage result plus call metadata.
#[derive(Debug)]
pub struct StageOutcome<T> {
    pub value: T,
    pub raw: String,
    pub calls: u32,
}

/// Which stage runs, against which backend, with which bounds.
#[derive(Debug, Clone)]
pub struct StageSpec<'a> {
    pub backend_id: &'a str,
    pub stage: &'static str,
    /// Extra calls allowed after the first when output fails validation.
    pub stage_retries: u32,
    pub max_tokens: u32,
}

/// Run one stage. `build_prompt` receives the previous attempt's validation
/// failure (if any); `parse` returns either the validated value or the list
/// of violations to feed back.
pub fn run_stage<T>(
    invoker: &dyn Generate,
    spec: &StageSpec<'_>,
    attachments: &[Attachment],
    mut build_prompt: impl FnMut(Option<&str>) -> String,
    parse: impl Fn(&str) -> Result<T, Vec<String>>,
) -> PipelineResult<StageOutcome<T>> {
    let stage = spec.stage;
    let max_calls = 1 + spec.stage_retries;
    let mut feedback: Option<String> = None;

    for call in 1..=max_calls {
        if call > 1 {
            tracing::info!(stage, call, max_calls, "stage retry with corrective feedback");
        }
        let prompt = build_prompt(feedback.as_deref());
        let request = GenerationRequest {
            backend_id: spec.backend_id.to_string(),
            prompt,
            attachments: attachments.to_vec(),
            max_tokens: spec.max_tokens,
        };
        let generation = invoker.generate(&request)?;
        match parse(&generation.content) {
            Ok(value) => {
                if call > 1 {
                    tracing::info!(stage, call, "stage retry succeeded");
                }
                return Ok(StageOutcome {
                    value,
                    raw: generation.content,
                    calls: call,
                });
            }
            Err(errors) => {
                let detail = errors.join("; ");
                tracing::warn!(stage, call, detail = %detail, "stage output failed validation");
                feedback = Some(detail);
            }
        }
    }

    Err(PipelineError::MalformedOutput {
        stage,
        detail: feedback.unwrap_or_else(|| "no attempts made".to_string()),
    })
}

/// Extract JSON from text that might carry markdown code fences.
pub fn extract_json(text: &str) -> &str {
    let text = text.trim();

    if let Some(start) = text.find("```json") {
        let start = start + 7;
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    if let Some(start) = text.find("```") {
        let start = start + 3;
        // Skip language identifier if present
        let start = text[start..]
            .find('\n')
            .map(|i| start + i + 1)
            .unwrap_or(start);
        if let Some(end) = text[start..].find("```") {
            return text[start..start + end].trim();
        }
    }

    text
}

/// Parse a JSON document of type `T`, reporting parse errors as validation
/// violations so they flow into the corrective retry prompt.
pub fn parse_json_stage<T: serde::de::DeserializeOwned>(text: &str) -> Result<T, Vec<String>> {
    let json_text = extract_json(text);
    serde_json::from_str(json_text).map_err(|err| {
        let snippet: String = json_text.chars().take(200).collect();
        vec![format!(
            "response failed to parse as JSON: {err} (first 200 chars: {snippet})"
        )]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Generation;
    use crate::usage::UsageCounts;
    use std::sync::Mutex;

    struct ScriptedBackend {
        responses: Mutex<Vec<String>>,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<&str>) -> Self {
            let mut responses: Vec<String> =
                responses.into_iter().map(str::to_string).collect();
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    impl Generate for ScriptedBackend {
        fn generate(&self, _request: &GenerationRequest) -> PipelineResult<Generation> {
            let mut responses = self.responses.lock().expect("lock");
            let content = responses.pop().expect("script exhausted");
            Ok(Generation {
                content,
                usage: UsageCounts::default(),
            })
        }
    }

    fn parse_number(text: &str) -> Result<u64, Vec<String>> {
        text.trim()
            .parse()
            .map_err(|err| vec![format!("not a number: {err}")])
    }

    fn spec() -> StageSpec<'static> {
        StageSpec {
            backend_id: "claude",
            stage: "outline",
            stage_retries: 3,
            max_tokens: 1000,
        }
    }

    #[test]
    fn succeeds_after_corrective_retries() {
        let backend = ScriptedBackend::new(vec!["nope", "still nope", "42"]);
        let mut prompts = Vec::new();
        let outcome = run_stage(
            &backend,
            &spec(),
            &[],
            |feedback| {
                prompts.push(feedback.map(str::to_string));
                format!("prompt: {}", feedback.unwrap_or("first"))
            },
            parse_number,
        )
        .expect("third call validates");
        assert_eq!(outcome.value, 42);
        assert_eq!(outcome.calls, 3);
        // The second and third prompts carried the previous violation.
        assert_eq!(prompts[0], None);
        assert!(prompts[1].as_deref().unwrap().contains("not a number"));
        assert!(prompts[2].as_deref().unwrap().contains("not a number"));
    }

    #[test]
    fn fails_with_malformed_output_past_bound() {
        let backend = ScriptedBackend::new(vec!["a", "b", "c", "d"]);
        let err = run_stage(
            &backend,
            &spec(),
            &[],
            |_| "prompt".to_string(),
            parse_number,
        )
        .unwrap_err();
        match err {
            PipelineError::MalformedOutput { stage, detail } => {
                assert_eq!(stage, "outline");
                assert!(detail.contains("not a number"));
            }
            other => panic!("expected MalformedOutput, got {other:?}"),
        }
    }

    #[test]
    fn extract_json_handles_fences() {
        assert_eq!(extract_json(r#"{"a": 1}"#), r#"{"a": 1}"#);
        assert_eq!(
            extract_json("Here:\n```json\n{\"a\": 1}\n```\n"),
            r#"{"a": 1}"#
        );
        assert_eq!(extract_json("```\n{\"a\": 1}\n```"), r#"{"a": 1}"#);
    }
}
