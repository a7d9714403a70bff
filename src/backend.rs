//! Resilient invocation of generation backends.
//!
//! Every backend speaks the OpenAI-compatible chat-completions shape; what
//! differs per call is the payload (text only, or text plus image/video
//! attachments encoded as data URLs). All backoff math lives in one retry
//! combinator so no backend grows its own retry ladder.

use crate::config::BackendProfile;
use crate::error::{PipelineError, PipelineResult};
use crate::usage::{UsageCounts, UsageLedger};
use anyhow::{anyhow, Context};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

static CORRELATION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Binary payload attached to a generation request.
#[derive(Debug, Clone)]
pub enum Attachment {
    Image(PathBuf),
    Video(PathBuf),
}

/// One generation call: which backend, what text, what attachments.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub backend_id: String,
    pub prompt: String,
    pub attachments: Vec<Attachment>,
    pub max_tokens: u32,
}

/// Successful generation result.
#[derive(Debug, Clone)]
pub struct Generation {
    pub content: String,
    pub usage: UsageCounts,
}

/// Seam between the pipeline and the real HTTP invoker, so tests can drive
/// the orchestrator with scripted responses.
pub trait Generate: Sync {
    fn generate(&self, request: &GenerationRequest) -> PipelineResult<Generation>;
}

/// Backoff parameters for one class of operation.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub jitter_ceiling: Duration,
}

impl RetryPolicy {
    pub fn for_backend_calls(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::from_millis(200),
            jitter_ceiling: Duration::from_millis(200),
        }
    }

    /// Pre-jitter delay after a failed attempt. Monotonically non-decreasing
    /// in the attempt number.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }

    fn jitter(&self) -> Duration {
        let ceiling_ms = self.jitter_ceiling.as_millis() as u64;
        if ceiling_ms == 0 {
            return Duration::ZERO;
        }
        let mut bytes = [0u8; 8];
        if getrandom::fill(&mut bytes).is_err() {
            return Duration::ZERO;
        }
        Duration::from_millis(u64::from_le_bytes(bytes) % (ceiling_ms + 1))
    }
}

/// Run `op` until it succeeds or the policy's attempt bound is exhausted.
///
/// The attempt counter starts at 1. Transient failures are reported as
/// strings by `op`; only the last one survives in the `BackendExhausted`
/// error.
pub fn with_retry<T>(
    policy: &RetryPolicy,
    backend_id: &str,
    mut op: impl FnMut(u32) -> Result<T, String>,
) -> PipelineResult<T> {
    let mut attempt = 1;
    loop {
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(last_error) => {
                if attempt >= policy.max_retries {
                    return Err(PipelineError::BackendExhausted {
                        backend: backend_id.to_string(),
                        attempts: attempt,
                        last_error,
                    });
                }
                let delay = policy.backoff_delay(attempt) + policy.jitter();
                tracing::warn!(
                    backend = backend_id,
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "backend call failed, retrying"
                );
                std::thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

/// Retry `op` and record token usage in the ledger only when an attempt
/// succeeds. Exhausted retries leave the ledger untouched.
pub fn complete_with_accounting(
    policy: &RetryPolicy,
    ledger: &UsageLedger,
    backend_id: &str,
    op: impl FnMut(u32) -> Result<Generation, String>,
) -> PipelineResult<Generation> {
    let generation = with_retry(policy, backend_id, op)?;
    ledger.record(generation.usage);
    Ok(generation)
}

/// Unique id attached to every backend attempt for tracing.
pub fn correlation_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let seq = CORRELATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("cw{millis}-{seq}")
}

/// HTTP invoker over the configured backend profiles.
pub struct HttpInvoker {
    profiles: BTreeMap<String, BackendProfile>,
    agent: ureq::Agent,
    policy: RetryPolicy,
    ledger: Arc<UsageLedger>,
}

impl HttpInvoker {
    pub fn new(
        profiles: BTreeMap<String, BackendProfile>,
        policy: RetryPolicy,
        ledger: Arc<UsageLedger>,
    ) -> Self {
        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(300)))
            .build()
            .new_agent();
        Self {
            profiles,
            agent,
            policy,
            ledger,
        }
    }

    fn call_once(
        &self,
        profile: &BackendProfile,
        body: &Value,
        correlation: &str,
    ) -> Result<Generation, String> {
        let url = format!(
            "{}/chat/completions",
            profile.base_url.trim_end_matches('/')
        );
        let mut response = self
            .agent
            .post(&url)
            .header("Authorization", &format!("Bearer {}", profile.api_key))
            .header("X-Correlation-Id", correlation)
            .send_json(body)
            .map_err(|err| format!("request failed: {err}"))?;
        let value: Value = response
            .body_mut()
            .read_json()
            .map_err(|err| format!("response body unreadable: {err}"))?;
        parse_chat_response(&value)
    }
}

impl Generate for HttpInvoker {
    fn generate(&self, request: &GenerationRequest) -> PipelineResult<Generation> {
        let profile = self.profiles.get(&request.backend_id).ok_or_else(|| {
            PipelineError::Other(anyhow!("unknown backend {}", request.backend_id))
        })?;
        // Attachments are resolved before the retry loop: a missing file
        // cannot be fixed by retrying.
        let content = build_content_parts(&request.prompt, &request.attachments)?;
        let body = json!({
            "model": profile.model,
            "messages": [{"role": "user", "content": content}],
            "max_tokens": request.max_tokens,
        });

        let generation = complete_with_accounting(
            &self.policy,
            &self.ledger,
            &request.backend_id,
            |attempt| {
                let correlation = correlation_id();
                tracing::debug!(
                    backend = %request.backend_id,
                    attempt,
                    correlation = %correlation,
                    prompt_bytes = request.prompt.len(),
                    "backend attempt"
                );
                self.call_once(profile, &body, &correlation)
            },
        )?;

        tracing::info!(
            backend = %request.backend_id,
            prompt_bytes = request.prompt.len(),
            response_bytes = generation.content.len(),
            total_tokens = generation.usage.total_tokens,
            "backend call complete"
        );
        Ok(generation)
    }
}

/// Build the chat-completions content array: text first, then each
/// attachment as a base64 data URL.
fn build_content_parts(prompt: &str, attachments: &[Attachment]) -> PipelineResult<Vec<Value>> {
    let mut parts = vec![json!({"type": "text", "text": prompt})];
    for attachment in attachments {
        let (path, mime) = match attachment {
            Attachment::Image(path) => (path, image_mime(path)),
            Attachment::Video(path) => (path, "video/mp4"),
        };
        if !path.is_file() {
            return Err(PipelineError::MissingAsset(path.clone()));
        }
        let bytes = fs::read(path)
            .with_context(|| format!("read attachment {}", path.display()))
            .map_err(PipelineError::Other)?;
        let data_url = format!("data:{mime};base64,{}", STANDARD.encode(bytes));
        parts.push(json!({
            "type": "image_url",
            "image_url": {"url": data_url, "detail": "high"},
            "media_type": mime,
        }));
    }
    Ok(parts)
}

fn image_mime(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "image/png",
    }
}

/// Extract the assistant text and token usage from a chat response.
fn parse_chat_response(value: &Value) -> Result<Generation, String> {
    let content = value
        .get("choices")
        .and_then(|choices| choices.get(0))
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|content| content.as_str())
        .ok_or_else(|| "response missing choices[0].message.content".to_string())?;
    let usage = value
        .get("usage")
        .and_then(|usage| serde_json::from_value::<UsageCounts>(usage.clone()).ok())
        .unwrap_or_default();
    Ok(Generation {
        content: content.trim().to_string(),
        usage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            jitter_ceiling: Duration::ZERO,
        }
    }

    #[test]
    fn backoff_is_monotonic_and_at_least_base() {
        let policy = RetryPolicy::for_backend_calls(5);
        let mut previous = Duration::ZERO;
        for attempt in 1..=5 {
            let delay = policy.backoff_delay(attempt);
            assert!(delay >= previous, "delay must not decrease");
            assert!(delay >= policy.base_delay * 2u32.pow(attempt));
            previous = delay;
        }
    }

    #[test]
    fn retry_stops_at_bound_and_keeps_last_error() {
        let mut calls = 0;
        let result: PipelineResult<()> = with_retry(&fast_policy(3), "claude", |attempt| {
            calls += 1;
            Err(format!("boom {attempt}"))
        });
        assert_eq!(calls, 3);
        match result {
            Err(PipelineError::BackendExhausted {
                backend,
                attempts,
                last_error,
            }) => {
                assert_eq!(backend, "claude");
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "boom 3");
            }
            other => panic!("expected BackendExhausted, got {other:?}"),
        }
    }

    #[test]
    fn retry_returns_first_success() {
        let result = with_retry(&fast_policy(3), "claude", |attempt| {
            if attempt < 3 {
                Err("transient".to_string())
            } else {
                Ok(attempt)
            }
        })
        .expect("success on third attempt");
        assert_eq!(result, 3);
    }

    #[test]
    fn exhausted_retries_leave_the_ledger_untouched() {
        let ledger = UsageLedger::new();
        let result = complete_with_accounting(&fast_policy(3), &ledger, "claude", |attempt| {
            Err(format!("boom {attempt}"))
        });
        assert!(matches!(
            result,
            Err(PipelineError::BackendExhausted { attempts: 3, .. })
        ));
        let totals = ledger.snapshot();
        assert_eq!(totals.calls, 0);
        assert_eq!(totals.prompt_tokens, 0);
        assert_eq!(totals.completion_tokens, 0);
        assert_eq!(totals.total_tokens, 0);
    }

    #[test]
    fn success_after_failures_records_usage_once() {
        let ledger = UsageLedger::new();
        let generation = complete_with_accounting(&fast_policy(3), &ledger, "claude", |attempt| {
            if attempt < 3 {
                Err("transient".to_string())
            } else {
                Ok(Generation {
                    content: "ok".to_string(),
                    usage: UsageCounts {
                        prompt_tokens: 10,
                        completion_tokens: 4,
                        total_tokens: 14,
                    },
                })
            }
        })
        .expect("third attempt succeeds");
        assert_eq!(generation.content, "ok");
        let totals = ledger.snapshot();
        assert_eq!(totals.calls, 1);
        assert_eq!(totals.prompt_tokens, 10);
        assert_eq!(totals.completion_tokens, 4);
        assert_eq!(totals.total_tokens, 14);
    }

    #[test]
    fn correlation_ids_are_unique() {
        let a = correlation_id();
        let b = correlation_id();
        assert!(a.starts_with("cw"));
        assert_ne!(a, b);
    }

    #[test]
    fn content_parts_encode_attachments_as_data_urls() {
        let dir = tempfile::tempdir().expect("tempdir");
        let image = dir.path().join("ref.png");
        fs::write(&image, b"fakepng").expect("write image");

        let parts =
            build_content_parts("describe this", &[Attachment::Image(image)]).expect("parts");
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["text"], "describe this");
        let url = parts[1]["image_url"]["url"].as_str().expect("url");
        assert!(url.starts_with("data:image/png;base64,"));
    }

    #[test]
    fn missing_attachment_is_not_retried() {
        let err = build_content_parts(
            "p",
            &[Attachment::Video(PathBuf::from("/nonexistent/clip.mp4"))],
        )
        .unwrap_err();
        assert!(matches!(err, PipelineError::MissingAsset(_)));
    }

    #[test]
    fn parses_chat_response_with_usage() {
        let value = json!({
            "choices": [{"message": {"content": "  hello  "}}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 2, "total_tokens": 5}
        });
        let generation = parse_chat_response(&value).expect("generation");
        assert_eq!(generation.content, "hello");
        assert_eq!(generation.usage.total_tokens, 5);
    }

    #[test]
    fn rejects_response_without_content() {
        let err = parse_chat_response(&json!({"choices": []})).unwrap_err();
        assert!(err.contains("choices[0].message.content"));
    }
}
