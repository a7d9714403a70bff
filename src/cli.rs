//! CLI argument parsing for the video pipeline.
//!
//! The CLI is intentionally thin: it resolves configuration and wires the
//! pipeline without embedding policy, so the same core logic can be driven
//! from tests with scripted collaborators.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "clipwright",
    version,
    about = "Topic-to-video generation pipeline for algorithm explainers",
    after_help = "Commands:\n  run <TOPIC>          Generate a full video for a topic\n  merge                Re-merge a run directory (or explicit clips)\n  probe <FILE>         Print a media file's duration\n  init                 Write a starter backends.json\n\nExamples:\n  clipwright init\n  clipwright run \"Binary Search\" --output-dir runs\n  clipwright run \"Dijkstra\" --backend claude --concurrency 4 --place-assets\n  clipwright merge --run-dir runs/binary_search\n  clipwright merge intro.mp4 outro.mp4 --out merged.mp4\n  clipwright probe runs/binary_search/binary_search.mp4",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

/// Top-level commands.
#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Merge(MergeArgs),
    Probe(ProbeArgs),
    Init(InitArgs),
}

/// Run command inputs for one topic.
#[derive(Parser, Debug)]
#[command(about = "Generate a video for a topic end to end")]
pub struct RunArgs {
    /// Topic to teach, e.g. "Binary Search"
    #[arg(value_name = "TOPIC")]
    pub topic: String,

    /// Directory that run artifacts are written under
    #[arg(long, value_name = "DIR", default_value = "runs")]
    pub output_dir: PathBuf,

    /// Backend id from backends.json
    #[arg(long, value_name = "ID", default_value = "claude")]
    pub backend: String,

    /// Explicit path to backends.json
    #[arg(long, value_name = "PATH")]
    pub backends: Option<PathBuf>,

    /// Section work units rendered at once
    #[arg(long, value_name = "N", default_value_t = 4)]
    pub concurrency: usize,

    /// Target video length fed into the outline prompt
    #[arg(long, value_name = "MIN", default_value_t = 5)]
    pub duration_minutes: u32,

    /// Token cap per backend call
    #[arg(long, value_name = "N", default_value_t = 8192)]
    pub max_tokens: u32,

    /// Style reference image attached to outline and storyboard prompts
    #[arg(long, value_name = "PATH")]
    pub reference_image: Option<PathBuf>,

    /// Select visual asset keywords and place them in the opening and
    /// closing sections
    #[arg(long)]
    pub place_assets: bool,

    /// On cancellation, assemble whatever sections completed
    #[arg(long)]
    pub best_effort: bool,

    /// Cancel the run after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// Attempts per backend call inside the backoff loop
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_call_retries: u32,

    /// Generate/render cycles per section before it is dropped
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub max_regenerate_tries: u32,

    /// Extra stage calls allowed when output fails validation
    #[arg(long, value_name = "N", default_value_t = 3)]
    pub stage_retries: u32,
}

/// Merge command inputs: re-merge a run directory in storyboard order, or
/// concatenate explicitly listed clips.
#[derive(Parser, Debug)]
#[command(about = "Re-merge a run directory, or concatenate explicit clips")]
pub struct MergeArgs {
    /// Run directory containing storyboard.json and rendered clips;
    /// clips are matched to sections and merged in storyboard order
    #[arg(
        long,
        value_name = "DIR",
        conflicts_with = "clips",
        required_unless_present = "clips"
    )]
    pub run_dir: Option<PathBuf>,

    /// Explicit clips to concatenate, in argument order
    #[arg(value_name = "CLIP", conflicts_with = "run_dir")]
    pub clips: Vec<PathBuf>,

    /// Output video path; defaults to <run-dir>/<name>.mp4 with --run-dir
    #[arg(long, value_name = "PATH", required_unless_present = "run_dir")]
    pub out: Option<PathBuf>,
}

/// Probe command inputs.
#[derive(Parser, Debug)]
#[command(about = "Print a media file's duration in seconds")]
pub struct ProbeArgs {
    /// Media file to probe
    #[arg(value_name = "FILE")]
    pub file: PathBuf,
}

/// Init command inputs for bootstrapping configuration.
#[derive(Parser, Debug)]
#[command(about = "Write a starter backends.json")]
pub struct InitArgs {
    /// Where to write the file
    #[arg(long, value_name = "PATH", default_value = "backends.json")]
    pub out: PathBuf,

    /// Overwrite an existing file
    #[arg(long)]
    pub force: bool,
}
