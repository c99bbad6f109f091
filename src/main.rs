use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use mention_router::channels::{TelegramTransport, Transport};
use mention_router::config::{AppConfig, DEFAULT_CONFIG_PATH};
use mention_router::evals::generate_evals;
use mention_router::llm::{LlmMatchEvaluator, MatchEvaluator, create_provider, create_tracer};
use mention_router::pipeline::rules::SenderFilter;
use mention_router::pipeline::{Classifier, FeedbackTracker, Router, normalize, resolve_routes};
use mention_router::store::{StatsStore, stats};

#[derive(Debug, Parser)]
#[command(name = "mention-router", version, about = "Forward Telegram mentions and learn from reactions")]
struct Cli {
    /// Path to the YAML config file.
    #[arg(long, global = true, env = "CONFIG_PATH", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Watch chats and route matches (default).
    Run,
    /// Write evaluation datasets from judged forwards.
    GenerateEvals {
        /// Suffix of the dataset directories.
        #[arg(long)]
        suffix: String,
    },
    /// Upgrade the stats file to the current schema and exit.
    MigrateStats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    let _log_guard = init_tracing(&config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config, &cli.config).await,
        Command::GenerateEvals { suffix } => evals(&config, &suffix),
        Command::MigrateStats => migrate_stats(&config),
    }
}

/// Stderr logging, plus a daily-rotated file when `log_dir` is set.
fn init_tracing(config: &AppConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| {
        EnvFilter::try_new(format!("{},reqwest=warn,hyper=warn", config.log_level))
    })?;

    let (file_layer, guard) = match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mention-router.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false),
        )
        .with(file_layer)
        .init();

    Ok(guard)
}

async fn run(config: AppConfig, config_path: &Path) -> anyhow::Result<()> {
    let instances = normalize(&config.instances)?;
    let bot_token = config.require_bot_token()?.clone();

    eprintln!("📨 Mention Router v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Config: {}", config_path.display());
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Instances: {}", instances.len());

    let transport = Arc::new(TelegramTransport::new(
        bot_token,
        config.telegram.poll_timeout_secs,
        config.folder_chats.clone(),
        Some(config.session_path()),
    ));
    transport.check_connection().await?;

    let routes = resolve_routes(instances, transport.as_ref()).await?;

    let evaluator = match create_provider(&config.openai)? {
        Some(provider) => {
            eprintln!("   LLM: {}", config.openai.model);
            Some(Arc::new(LlmMatchEvaluator::new(provider)) as Arc<dyn MatchEvaluator>)
        }
        None => {
            eprintln!("   LLM: disabled (no OpenAI API key)");
            for route in routes.iter().filter(|r| r.instance.has_llm_gate()) {
                tracing::warn!(
                    instance = %route.name(),
                    "Instance has prompts but no LLM is configured; it will never forward on prompts"
                );
            }
            None
        }
    };
    let tracer = create_tracer(&config.langfuse);

    let classifier = Classifier::new(
        SenderFilter::new(&config.ignore_usernames, &config.ignore_user_ids),
        evaluator,
        tracer,
        config.openai.timeout(),
    );
    let tracker = FeedbackTracker::load(config.forwards_path())?;
    let stats = StatsStore::open(config.stats_path(), config.flush_interval())?;
    eprintln!("   Pending forwards: {}\n", tracker.len());

    let events = transport.subscribe().await?;
    let mut router = Router::new(
        routes,
        classifier,
        tracker,
        stats,
        transport as Arc<dyn Transport>,
        config.retention(),
    );

    router
        .run(events, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for Ctrl-C: {e}");
                std::future::pending::<()>().await;
            }
        })
        .await?;

    Ok(())
}

fn evals(config: &AppConfig, suffix: &str) -> anyhow::Result<()> {
    let instances = normalize(&config.instances)?;
    let tracker = FeedbackTracker::load(config.forwards_path())?;
    let stats = stats::load(&config.stats_path())?;

    let summaries = generate_evals(&instances, &tracker, &stats, &config.evals_dir(), suffix)?;
    if summaries.is_empty() {
        println!("No instance has both true_positive_entity and false_positive_entity set.");
        return Ok(());
    }

    for summary in summaries {
        let precision = summary
            .precision
            .map(|p| format!("{:.1}%", p * 100.0))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{} / {}: {} positive, {} negative, precision {} -> {}",
            summary.instance,
            summary.prompt,
            summary.positives,
            summary.negatives,
            precision,
            summary.dir.display()
        );
    }
    Ok(())
}

fn migrate_stats(config: &AppConfig) -> anyhow::Result<()> {
    let mut store = StatsStore::open(config.stats_path(), config.flush_interval())?;
    store.rewrite()?;
    println!(
        "Stats at {} are at schema v{}",
        store.path().display(),
        store.stats().version
    );
    Ok(())
}
