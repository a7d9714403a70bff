//! Backend profiles and run configuration.
//!
//! All configuration is resolved once at startup into immutable values that
//! are passed into every component. There is no ambient lookup deeper in the
//! call stack; environment variables are read here and nowhere else.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const BACKENDS_SCHEMA_VERSION: u32 = 1;

const BACKENDS_FILE_NAME: &str = "backends.json";

/// One configured generation backend: an OpenAI-compatible chat endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendProfile {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct BackendsFile {
    schema_version: u32,
    backends: BTreeMap<String, BackendProfile>,
}

/// Retry and regeneration bounds, immutable for the run's lifetime.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Attempts per backend call inside the invoker's backoff loop.
    pub max_call_retries: u32,
    /// Generate/render cycles per section before the section is dropped.
    pub max_regenerate_tries: u32,
    /// Extra stage calls allowed when a stage's output fails validation.
    pub stage_retries: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_call_retries: 3,
            max_regenerate_tries: 3,
            stage_retries: 3,
        }
    }
}

/// Immutable configuration for one run, injected into every component.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub output_dir: PathBuf,
    pub backend_id: String,
    pub limits: Limits,
    /// Section work units running at once after the storyboard stage.
    pub concurrency: usize,
    pub reference_image: Option<PathBuf>,
    /// Run the asset selection/placement stages.
    pub place_assets: bool,
    /// Assemble whatever completed when the run is cancelled.
    pub best_effort: bool,
    /// Target video length fed into the outline prompt.
    pub duration_minutes: u32,
    pub max_tokens: u32,
}

/// Load backend profiles, preferring an explicit path, then the working
/// directory, then the user config directory.
pub fn load_backends(explicit: Option<&Path>) -> Result<BTreeMap<String, BackendProfile>> {
    let path = resolve_backends_path(explicit)?;
    let bytes =
        fs::read(&path).with_context(|| format!("read backends {}", path.display()))?;
    let file: BackendsFile =
        serde_json::from_slice(&bytes).context("parse backends JSON")?;
    if file.schema_version != BACKENDS_SCHEMA_VERSION {
        return Err(anyhow!(
            "unsupported backends schema_version {}",
            file.schema_version
        ));
    }
    let mut backends = file.backends;
    for (id, profile) in &mut backends {
        apply_env_overrides(id, profile);
    }
    validate_backends(&backends)?;
    Ok(backends)
}

fn resolve_backends_path(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        return Ok(path.to_path_buf());
    }
    let local = PathBuf::from(BACKENDS_FILE_NAME);
    if local.is_file() {
        return Ok(local);
    }
    if let Some(config_dir) = dirs::config_dir() {
        let user = config_dir.join("clipwright").join(BACKENDS_FILE_NAME);
        if user.is_file() {
            return Ok(user);
        }
    }
    Err(anyhow!(
        "no {BACKENDS_FILE_NAME} found; pass --backends or place one in the \
         working directory or the user config directory"
    ))
}

/// Environment variables override file values, keyed by the uppercased
/// backend id: `CLIPWRIGHT_<ID>_BASE_URL`, `_API_KEY`, `_MODEL`.
fn apply_env_overrides(id: &str, profile: &mut BackendProfile) {
    let prefix = format!("CLIPWRIGHT_{}", id.to_uppercase().replace('-', "_"));
    if let Ok(value) = env::var(format!("{prefix}_BASE_URL")) {
        profile.base_url = value;
    }
    if let Ok(value) = env::var(format!("{prefix}_API_KEY")) {
        profile.api_key = value;
    }
    if let Ok(value) = env::var(format!("{prefix}_MODEL")) {
        profile.model = value;
    }
}

fn validate_backends(backends: &BTreeMap<String, BackendProfile>) -> Result<()> {
    if backends.is_empty() {
        return Err(anyhow!("backends file defines no backends"));
    }
    for (id, profile) in backends {
        if id.trim().is_empty() {
            return Err(anyhow!("backend id must be non-empty"));
        }
        if profile.base_url.trim().is_empty() {
            return Err(anyhow!("backend {id}: base_url must be non-empty"));
        }
        if profile.model.trim().is_empty() {
            return Err(anyhow!("backend {id}: model must be non-empty"));
        }
    }
    Ok(())
}

/// Render a pretty JSON stub for new installations.
pub fn backends_stub() -> String {
    let mut backends = BTreeMap::new();
    backends.insert(
        "claude".to_string(),
        BackendProfile {
            base_url: "https://api.example.com/v1".to_string(),
            api_key: "sk-...".to_string(),
            model: "claude-sonnet".to_string(),
        },
    );
    let file = BackendsFile {
        schema_version: BACKENDS_SCHEMA_VERSION,
        backends,
    };
    serde_json::to_string_pretty(&file).expect("serialize backends stub")
}
