//! CLI subcommand handlers.

use crate::{Commands, ConfigAction};
use ragprobe_core::artifacts::ArtifactStore;
use ragprobe_core::config::{load_config, EvalConfig};
use ragprobe_core::events::{EventSink, ModuleStatus, ProgressEvent};
use ragprobe_core::judge::JudgeCapability;
use ragprobe_core::pipeline::{PipelineOrchestrator, PipelineOutcome, RunOptions};
use ragprobe_core::retrieval::HttpRetrievalClient;
use ragprobe_core::types::{QuestionCategory, SummaryReport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands, workspace: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            questions,
            resume,
            no_judge,
            workers,
            delay_ms,
            json,
        } => handle_run(workspace, questions, resume, no_judge, workers, delay_ms, json).await,
        Commands::Evaluate {
            retrieval,
            no_judge,
            json,
        } => handle_evaluate(workspace, retrieval, no_judge, json).await,
        Commands::Summary => handle_summary(workspace),
        Commands::Runs => handle_runs(workspace),
        Commands::Categories => handle_categories(),
        Commands::Config { action } => handle_config(action, workspace),
    }
}

/// Load the layered configuration and root a relative data dir at the
/// workspace.
fn load_workspace_config(workspace: &Path) -> anyhow::Result<EvalConfig> {
    let mut config = load_config(Some(workspace), None)
        .map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?;
    if config.storage.data_dir.is_relative() {
        config.storage.data_dir = workspace.join(&config.storage.data_dir);
    }
    Ok(config)
}

/// Surface configuration warnings. Called after CLI overrides are applied so
/// the warnings describe the settings the run will actually use.
fn warn_config_issues(config: &EvalConfig) {
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }
}

async fn handle_run(
    workspace: &Path,
    questions: Option<PathBuf>,
    resume: Option<PathBuf>,
    no_judge: bool,
    workers: Option<usize>,
    delay_ms: Option<u64>,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = load_workspace_config(workspace)?;
    if no_judge {
        config.judge.enabled = false;
    }
    if let Some(workers) = workers {
        config.retrieval.workers = workers;
    }
    if let Some(delay_ms) = delay_ms {
        config.retrieval.request_delay_ms = delay_ms;
    }
    warn_config_issues(&config);

    let options = RunOptions {
        questions_file: questions,
        resume_from: resume,
        ..Default::default()
    };
    let outcome = execute_pipeline(config, options, json).await?;
    if !json {
        match &outcome.summary {
            Some(summary) => print_summary(summary),
            None => println!("Run finished without an evaluation summary."),
        }
    }
    Ok(())
}

async fn handle_evaluate(
    workspace: &Path,
    retrieval: Option<PathBuf>,
    no_judge: bool,
    json: bool,
) -> anyhow::Result<()> {
    let mut config = load_workspace_config(workspace)?;
    if no_judge {
        config.judge.enabled = false;
    }
    warn_config_issues(&config);

    let store = ArtifactStore::from_config(&config.storage);
    let artifact = match retrieval {
        Some(path) => path,
        None => store
            .latest_retrieval()
            .map_err(|e| anyhow::anyhow!("Failed to scan runs: {}", e))?
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "No retrieval artifact found under {}; run `ragprobe run` first",
                    store.data_dir().display()
                )
            })?,
    };
    if !json {
        println!("Evaluating {}", artifact.display());
    }

    let options = RunOptions {
        retrieval_artifact: Some(artifact),
        ..Default::default()
    };
    let outcome = execute_pipeline(config, options, json).await?;
    if !json {
        if let Some(summary) = &outcome.summary {
            print_summary(summary);
        }
    }
    Ok(())
}

/// Wire up the orchestrator, stream its events, and return the outcome.
async fn execute_pipeline(
    config: EvalConfig,
    options: RunOptions,
    json: bool,
) -> anyhow::Result<PipelineOutcome> {
    let store = ArtifactStore::from_config(&config.storage);
    let client = Arc::new(
        HttpRetrievalClient::from_config(&config.retrieval)
            .map_err(|e| anyhow::anyhow!("Failed to build retrieval client: {}", e))?,
    );
    let judge = JudgeCapability::resolve(&config.judge);
    if let Some(reason) = judge.unavailable_reason() {
        tracing::warn!("Judge unavailable ({}); scoring is structural only", reason);
    }

    let orchestrator = PipelineOrchestrator::new(config, store, client, judge);
    let (sink, rx) = EventSink::channel();
    let printer = spawn_event_printer(rx, json);
    let result = orchestrator.run(options, &sink).await;
    drop(sink);
    let _ = printer.await;
    result.map_err(|e| anyhow::anyhow!(e))
}

fn spawn_event_printer(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    json: bool,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if json {
                match serde_json::to_string(&event) {
                    Ok(line) => println!("{}", line),
                    Err(e) => tracing::warn!("Failed to serialize event: {}", e),
                }
                continue;
            }
            print_event(&event);
        }
    })
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Start {
            total_questions, ..
        } => {
            println!("Retrieving answers for {} questions...", total_questions);
        }
        ProgressEvent::Progress {
            current,
            total,
            succeeded,
            ..
        } => {
            let state = if *succeeded { "ok" } else { "failed" };
            println!("  [{}/{}] {}", current, total, state);
        }
        ProgressEvent::CategoryComplete {
            category,
            completed,
            failed,
        } => {
            println!(
                "  {} done: {} completed, {} failed",
                category, completed, failed
            );
        }
        ProgressEvent::ModuleProgress {
            module,
            status,
            data,
        } => match status {
            ModuleStatus::Start => println!("{}...", module),
            ModuleStatus::Complete => println!("{} complete", module),
            ModuleStatus::Skipped => {
                let reason = data
                    .as_ref()
                    .and_then(|d| d["reason"].as_str())
                    .unwrap_or("skipped");
                println!("{} skipped: {}", module, reason);
            }
            ModuleStatus::Progress => {}
        },
        ProgressEvent::Complete { artifacts, .. } => {
            println!("Artifacts written to {}", artifacts.run_dir.display());
        }
        ProgressEvent::Error { message } => {
            eprintln!("Pipeline failed: {}", message);
        }
    }
}

fn handle_summary(workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let store = ArtifactStore::from_config(&config.storage);
    match store
        .latest_summary()
        .map_err(|e| anyhow::anyhow!("Failed to scan runs: {}", e))?
    {
        Some((entry, summary)) => {
            println!("Latest run: {}", entry.name);
            print_summary(&summary);
        }
        None => println!(
            "No run summaries found under {}.",
            store.data_dir().display()
        ),
    }
    Ok(())
}

fn handle_runs(workspace: &Path) -> anyhow::Result<()> {
    let config = load_workspace_config(workspace)?;
    let store = ArtifactStore::from_config(&config.storage);
    let runs = store
        .list_runs()
        .map_err(|e| anyhow::anyhow!("Failed to scan runs: {}", e))?;
    if runs.is_empty() {
        println!("No runs recorded under {}.", store.data_dir().display());
        return Ok(());
    }
    println!("Persisted runs ({}):", runs.len());
    for entry in &runs {
        let state = if entry.has_summary {
            "evaluated"
        } else {
            "retrieval only"
        };
        println!("  {} ({})", entry.name, state);
    }
    Ok(())
}

fn handle_categories() -> anyhow::Result<()> {
    println!("Question categories:");
    for category in QuestionCategory::all() {
        println!("  {}  {}", category.code(), category.title());
        println!("      {}", category.description());
    }
    Ok(())
}

fn handle_config(action: ConfigAction, workspace: &Path) -> anyhow::Result<()> {
    match action {
        ConfigAction::Init => {
            let config_dir = workspace.join(".ragprobe");
            std::fs::create_dir_all(&config_dir)?;

            let config_path = config_dir.join("config.toml");
            if config_path.exists() {
                println!(
                    "Configuration file already exists at: {}",
                    config_path.display()
                );
                return Ok(());
            }

            let default_config = EvalConfig::default();
            let toml_str = toml::to_string_pretty(&default_config)?;
            std::fs::write(&config_path, &toml_str)?;
            println!(
                "Created default configuration at: {}",
                config_path.display()
            );
            Ok(())
        }
        ConfigAction::Show => {
            let config = load_workspace_config(workspace)?;
            let toml_str = toml::to_string_pretty(&config)?;
            println!("{}", toml_str);
            Ok(())
        }
    }
}

fn print_summary(summary: &SummaryReport) {
    println!();
    println!(
        "Run {} ({})",
        summary.run_id,
        summary.created_at.format("%Y-%m-%d %H:%M UTC")
    );
    println!(
        "  Questions: {} total, {} completed, {} failed",
        summary.total_questions, summary.completed, summary.failed
    );
    if summary.not_found_answers > 0 {
        println!("  Not-found answers: {}", summary.not_found_answers);
    }
    println!(
        "  Chapter accuracy: {}",
        fmt_pct(summary.accuracy_percentage())
    );
    println!("  Chapter recall: {}", fmt_pct(summary.recall_percentage()));
    println!("  Hybrid score: {}", fmt_pct(summary.hybrid_percentage()));
    if summary.ragas_available {
        println!(
            "  Judge: relevancy {}, quality {}, faithfulness {}",
            fmt_score(summary.relevancy_avg),
            fmt_score(summary.quality_avg),
            fmt_score(summary.faithfulness_avg)
        );
    } else if let Some(reason) = &summary.ragas_unavailable_reason {
        println!("  Judge: unavailable ({})", reason);
    }
    if !summary.recall_at_k.is_empty() {
        let parts: Vec<String> = summary
            .recall_at_k
            .iter()
            .map(|(k, v)| format!("@{} {:.1}%", k, v * 100.0))
            .collect();
        println!("  Recall: {}", parts.join(", "));
    }
    if let (Some(p50), Some(p95)) = (summary.latency_p50_ms, summary.latency_p95_ms) {
        println!("  Latency: p50 {}ms, p95 {}ms", p50, p95);
    }
    if !summary.per_category.is_empty() {
        println!("  Per category:");
        for (category, stats) in &summary.per_category {
            println!(
                "    {} ({}): {}/{} completed, accuracy {}, hybrid {}",
                category,
                category.title(),
                stats.completed,
                stats.questions,
                fmt_score(stats.accuracy_avg),
                fmt_score(stats.hybrid_avg)
            );
        }
    }
    let dist = &summary.score_distribution;
    if dist.total() > 0 {
        println!(
            "  Relevancy buckets: {} excellent, {} good, {} fair, {} poor",
            dist.excellent, dist.good, dist.fair, dist.poor
        );
    }
    println!(
        "  Generalization: {}{}",
        summary.generalization.level,
        summary
            .generalization
            .score
            .map(|s| format!(" (balance {:.2})", s))
            .unwrap_or_default()
    );
    if !summary.suggestions.is_empty() {
        println!("  Suggestions:");
        for suggestion in &summary.suggestions {
            println!(
                "    - [{}] {}",
                suggestion.category, suggestion.suggestion_text
            );
        }
    }
}

fn fmt_pct(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.1}%", v))
        .unwrap_or_else(|| "n/a".to_string())
}

fn fmt_score(value: Option<f64>) -> String {
    value
        .map(|v| format!("{:.2}", v))
        .unwrap_or_else(|| "n/a".to_string())
}
