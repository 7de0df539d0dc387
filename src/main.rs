use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;
use tracing::warn;

use inbox_sync::{Error, analytics};
use inbox_sync::channels::{ImapConfig, ImapSource};
use inbox_sync::config::{EnrichmentKind, SinkKind, SyncConfig};
use inbox_sync::pipeline::types::{EnrichmentHooks, NoEnrichment, RowReader, Sink};
use inbox_sync::pipeline::{Categorizer, PipelineRunner, RuleBasedEnrichment, RunSummary};
use inbox_sync::sinks::{JsonlSink, SheetsConfig, SheetsSink};
use inbox_sync::store::StateStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SyncConfig::from_env().context("Invalid sync configuration")?;

    let categorizer = match &config.rules_file {
        Some(path) => Categorizer::from_file(path)
            .with_context(|| format!("Failed to load rules from {}", path.display()))?,
        None => Categorizer::default_rules(),
    };

    let state = StateStore::load(&config.state_file)
        .await
        .map_err(Error::StateCorruption)?;

    let source = Arc::new(ImapSource::new(ImapConfig::from_env()?));

    // The same backend serves rows back to the analytics report.
    let (sink, rows): (Arc<dyn Sink>, Arc<dyn RowReader>) = match config.sink {
        SinkKind::Sheets => {
            let sheets = Arc::new(SheetsSink::new(SheetsConfig::from_env()?));
            (sheets.clone(), sheets)
        }
        SinkKind::Jsonl => {
            let jsonl = Arc::new(JsonlSink::new(&config.jsonl_path));
            (jsonl.clone(), jsonl)
        }
    };

    let hooks: Arc<dyn EnrichmentHooks> = match config.enrichment {
        EnrichmentKind::Rules => Arc::new(RuleBasedEnrichment::new()),
        EnrichmentKind::None => Arc::new(NoEnrichment),
    };

    eprintln!("📬 inbox-sync v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   State: {}", state.path().display());
    eprintln!("   Sink: {}", sink.name());
    eprintln!("   Folders: {}", config.run.folders.join(", "));
    eprintln!("   Rules: {} categories", categorizer.rules().len());
    for rule in categorizer.rules() {
        eprintln!("     {} (importance {})", rule.category(), rule.importance());
    }
    let stats = state.stats();
    eprintln!(
        "   Ledger: {} processed so far, last run {}",
        stats.total_processed,
        stats
            .last_run
            .map(|t| t.to_rfc3339())
            .unwrap_or_else(|| "never".into())
    );

    let mut runner = PipelineRunner::new(source, sink, hooks, categorizer, state, config.run);

    // Ctrl-C stops the run between items; the ledger is still saved.
    let shutdown = runner.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing current message");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    match runner.run().await {
        Ok(summary) => {
            print_summary(&summary);
            if config.analytics {
                report_analytics(&*rows, &runner, &config.analytics_dir).await;
            }
            Ok(())
        }
        Err(Error::StatePersist { source, unrecorded }) => {
            eprintln!("Error: state was not saved: {source}");
            eprintln!("   These messages are in the sink and may be missing from the ledger:");
            for id in &unrecorded {
                eprintln!("   - {id}");
            }
            Err(Error::StatePersist { source, unrecorded }.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Analytics never fails the run; problems are logged and skipped.
async fn report_analytics(rows: &dyn RowReader, runner: &PipelineRunner, dir: &Path) {
    let report = match analytics::generate(rows, runner.state().stats()).await {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Analytics report skipped");
            return;
        }
    };
    eprintln!();
    eprint!("{}", report.render());
    match analytics::write_report(&report, dir).await {
        Ok(path) => eprintln!("   Report: {}", path.display()),
        Err(e) => warn!(error = %e, "Analytics report not written"),
    }
}

fn print_summary(summary: &RunSummary) {
    eprintln!();
    eprintln!("   Fetched:   {}", summary.fetched);
    eprintln!("   Succeeded: {}", summary.succeeded);
    eprintln!("   Failed:    {}", summary.failed);
    eprintln!("   Skipped:   {}", summary.skipped);
    if summary.cancelled {
        eprintln!("   Cancelled: {} not attempted", summary.not_attempted);
    }
    for (category, count) in &summary.by_category {
        eprintln!("     {category}: {count}");
    }
    for record in summary.records.iter().filter(|r| r.last_error.is_some()) {
        eprintln!(
            "   ✗ {} ({}): {}",
            record.message_id,
            record.category,
            record.last_error.as_deref().unwrap_or_default()
        );
    }
    if !summary.mark_read_failures.is_empty() {
        eprintln!(
            "   {} message(s) stayed unread after commit",
            summary.mark_read_failures.len()
        );
    }
}
