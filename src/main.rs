use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use quorum::agent::{AgentRuntime, known_agents};
use quorum::cli::{Cli, Command, split_csv};
use quorum::config::{CouncilConfig, parse_config};
use quorum::error::Result;
use quorum::events::{EventBus, EventSink};
use quorum::pipeline::{CodebaseOptions, ReviewPipeline, ReviewRequest};
use quorum::retry::sanitize_error_message;
use quorum::review::{ResultStatus, new_review_id};

/// Log targets suppressed from the console output regardless of level.
const DENIED_LOG_TARGETS: &[&str] = &["hyper", "h2", "mio", "want", "tower"];

fn init_logging() {
    let deny_list = tracing_subscriber::filter::filter_fn(|metadata| {
        !DENIED_LOG_TARGETS.iter().any(|target| {
            metadata.target() == *target
                || (metadata.target().starts_with(target)
                    && metadata.target()[target.len()..].starts_with("::"))
        })
    });
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(deny_list)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("error: {}", sanitize_error_message(&e.to_string()));
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match &cli.command {
        Command::Agents => {
            println!("{}", serde_json::to_string_pretty(&known_agents())?);
            return Ok(0);
        }
        Command::ValidateConfig { path } => {
            let verdict = match std::fs::read_to_string(path)
                .map_err(quorum::error::Error::from)
                .and_then(|content| parse_config(&content))
                .and_then(|mut config| {
                    config.validate()?;
                    Ok(())
                }) {
                Ok(()) => serde_json::json!({ "valid": true }),
                Err(e) => serde_json::json!({
                    "valid": false,
                    "error": sanitize_error_message(&e.to_string()),
                }),
            };
            println!("{verdict}");
            return Ok(0);
        }
        _ => {}
    }

    let mut config = CouncilConfig::load(cli.config.as_deref())?;
    if let Some(mode) = &cli.mode {
        config.review.analysis_mode = mode.parse()?;
    }

    let request = ReviewRequest {
        code: None,
        checks: cli.checks.as_deref().map(split_csv).unwrap_or_default(),
        extra_instructions: cli.extra.clone(),
        language: cli.language.clone(),
    };

    let runtime = AgentRuntime::new();
    let pipeline = ReviewPipeline::new(runtime.clone(), config);
    let bus = EventBus::new();

    // Caller cancellation: on ctrl-c, stop every outstanding agent handle
    // (graceful, then forceful) and refuse further spawns.
    let cancel_runtime = runtime.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, stopping all agents");
            cancel_runtime.shutdown().await;
        }
    });

    let review_id = new_review_id();
    let publisher = bus.create(&review_id);
    let mut events = bus.subscribe(&review_id)?;
    println!("{}", serde_json::json!({ "reviewId": review_id }));

    // Events go to stdout as JSON lines; the result or error event is last.
    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match serde_json::to_string(&event) {
                Ok(line) => println!("{line}"),
                Err(e) => tracing::warn!(error = %e, "failed to serialize event"),
            }
        }
    });

    let outcome = match cli.command {
        Command::Diff { repo, base } => {
            pipeline.review_diff(&review_id, &repo, &base, &request, publisher.as_ref()).await
        }
        Command::Files { paths } => {
            pipeline.review_files(&review_id, &paths, &request, publisher.as_ref()).await
        }
        Command::Codebase { dir, batch_size, extensions } => {
            let options = CodebaseOptions {
                batch_size,
                extensions: extensions.as_deref().map(split_csv),
            };
            pipeline.review_codebase(&review_id, &dir, &options, &request, publisher.as_ref()).await
        }
        Command::Agents | Command::ValidateConfig { .. } => unreachable!("handled above"),
    };

    let exit_code = match &outcome {
        Ok(result) if result.status == ResultStatus::Failed => 1,
        Ok(_) => 0,
        Err(e) => {
            publisher.error(&sanitize_error_message(&e.to_string()));
            1
        }
    };

    runtime.shutdown().await;
    drop(publisher);
    let _ = printer.await;
    bus.remove(&review_id);
    Ok(exit_code)
}
