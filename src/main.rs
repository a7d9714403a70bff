use anyhow::{anyhow, Context, Result};
use clap::Parser;
use clipwright::assemble::{assemble, FfmpegTool, MediaTool};
use clipwright::backend::{HttpInvoker, RetryPolicy};
use clipwright::cancel::CancelToken;
use clipwright::cli::{Command, InitArgs, MergeArgs, ProbeArgs, RootArgs, RunArgs};
use clipwright::config::{backends_stub, load_backends, Limits, RunConfig};
use clipwright::pipeline::Pipeline;
use clipwright::reconcile::reconcile_run_dir;
use clipwright::render::ManimRenderer;
use clipwright::usage::UsageLedger;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = RootArgs::parse();
    match args.command {
        Command::Run(args) => cmd_run(args),
        Command::Merge(args) => cmd_merge(args),
        Command::Probe(args) => cmd_probe(args),
        Command::Init(args) => cmd_init(args),
    }
}

fn cmd_run(args: RunArgs) -> Result<()> {
    let backends = load_backends(args.backends.as_deref())?;
    if !backends.contains_key(&args.backend) {
        let known: Vec<&str> = backends.keys().map(String::as_str).collect();
        return Err(anyhow!(
            "unknown backend {} (configured: {})",
            args.backend,
            known.join(", ")
        ));
    }

    let config = RunConfig {
        output_dir: args.output_dir,
        backend_id: args.backend,
        limits: Limits {
            max_call_retries: args.max_call_retries,
            max_regenerate_tries: args.max_regenerate_tries,
            stage_retries: args.stage_retries,
        },
        concurrency: args.concurrency,
        reference_image: args.reference_image,
        place_assets: args.place_assets,
        best_effort: args.best_effort,
        duration_minutes: args.duration_minutes,
        max_tokens: args.max_tokens,
    };

    let ledger = Arc::new(UsageLedger::new());
    let invoker = HttpInvoker::new(
        backends,
        RetryPolicy::for_backend_calls(config.limits.max_call_retries),
        Arc::clone(&ledger),
    );
    let renderer = ManimRenderer::from_env()?;
    let media_tool = FfmpegTool::discover()?;

    let cancel = CancelToken::new();
    if let Some(secs) = args.timeout {
        let timeout_cancel = cancel.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(secs));
            tracing::warn!(timeout_secs = secs, "timeout reached, cancelling run");
            timeout_cancel.cancel();
        });
    }

    let pipeline = Pipeline::new(config, &invoker, &renderer, &media_tool, ledger, cancel);
    let report = pipeline.run(&args.topic)?;

    println!("Wrote {}", report.output.display());
    println!(
        "Sections: {}/{} rendered{}",
        report.sections_rendered,
        report.sections_total,
        if report.cancelled { " (cancelled)" } else { "" }
    );
    println!("Duration: {:.1}s", report.duration_seconds);
    println!(
        "Backend usage: {} calls, {} tokens",
        report.usage.calls, report.usage.total_tokens
    );
    Ok(())
}

fn cmd_merge(args: MergeArgs) -> Result<()> {
    let tool = FfmpegTool::discover()?;
    let report = if let Some(run_dir) = &args.run_dir {
        let run = reconcile_run_dir(run_dir)?;
        println!("Matched {} of {} sections", run.matched, run.total);
        let out = match args.out {
            Some(out) => out,
            None => {
                let name = run_dir
                    .file_name()
                    .and_then(|name| name.to_str())
                    .ok_or_else(|| anyhow!("cannot derive an output name from {}", run_dir.display()))?;
                run_dir.join(format!("{name}.mp4"))
            }
        };
        assemble(&tool, &run.ordered, &out)?
    } else {
        let out = args
            .out
            .ok_or_else(|| anyhow!("--out is required with explicit clips"))?;
        assemble(&tool, &args.clips, &out)?
    };
    println!(
        "Wrote {} ({} clips, {:.1}s)",
        report.output.display(),
        report.sections_merged,
        report.duration_seconds
    );
    Ok(())
}

fn cmd_probe(args: ProbeArgs) -> Result<()> {
    let tool = FfmpegTool::discover()?;
    let duration = tool.probe_duration(&args.file)?;
    println!("{duration:.3} seconds");
    println!("{:.2} minutes", duration / 60.0);
    Ok(())
}

fn cmd_init(args: InitArgs) -> Result<()> {
    if args.out.exists() && !args.force {
        return Err(anyhow!(
            "{} already exists; pass --force to overwrite",
            args.out.display()
        ));
    }
    std::fs::write(&args.out, backends_stub())
        .with_context(|| format!("write {}", args.out.display()))?;
    println!("Wrote {}", args.out.display());
    println!("Fill in base_url, api_key, and model for each backend.");
    Ok(())
}
