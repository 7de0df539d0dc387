//! Run orchestration: fetch → dedupe → categorize → schedule → per-item
//! enrich/commit/ack → persist.
//!
//! **Core invariant: a message id reaches the state ledger only after its
//! sink commit is confirmed, and is marked read only after that commit.**
//!
//! Per-item failures are recorded and the batch continues. Fetch and persist
//! failures abort the run.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AuthError, EnrichmentError, Error, Result, SinkError, SourceError, StateError};
use crate::pipeline::rules::Categorizer;
use crate::pipeline::scheduler::PriorityScheduler;
use crate::pipeline::types::{
    CategorizedMessage, Enrichment, EnrichmentHooks, ItemStatus, Message, MessageSource,
    ProcessingRecord, RowRef, SHEET_HEADERS, SheetRow, Sink,
};
use crate::store::StateStore;

/// Time bounds for every external call a run makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub fetch: Duration,
    pub commit: Duration,
    pub enrich: Duration,
    pub mark_read: Duration,
    pub persist: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            fetch: Duration::from_secs(120),
            commit: Duration::from_secs(30),
            enrich: Duration::from_secs(10),
            mark_read: Duration::from_secs(30),
            persist: Duration::from_secs(15),
        }
    }
}

/// Per-run knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub max_results: usize,
    pub folders: Vec<String>,
    pub timeouts: Timeouts,
    /// Total commit attempts per item for errors known not to have landed.
    pub commit_attempts: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_results: 10,
            folders: vec!["INBOX".into()],
            timeouts: Timeouts::default(),
            commit_attempts: 1,
        }
    }
}

/// What one run did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    /// Correlates this run's log lines.
    pub run_id: Uuid,
    pub fetched: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Already in the ledger (or repeated within the batch).
    pub skipped: usize,
    /// Left untouched because the run was cancelled.
    pub not_attempted: usize,
    /// Successful items per category.
    pub by_category: BTreeMap<String, usize>,
    pub mark_read_failures: Vec<String>,
    pub cancelled: bool,
    /// One record per attempted item, in processing order.
    pub records: Vec<ProcessingRecord>,
}

/// Drives a single batch run against a source, a sink and the state ledger.
pub struct PipelineRunner {
    source: Arc<dyn MessageSource>,
    sink: Arc<dyn Sink>,
    hooks: Arc<dyn EnrichmentHooks>,
    categorizer: Categorizer,
    scheduler: PriorityScheduler,
    state: StateStore,
    config: RunConfig,
    shutdown: Arc<AtomicBool>,
}

impl PipelineRunner {
    pub fn new(
        source: Arc<dyn MessageSource>,
        sink: Arc<dyn Sink>,
        hooks: Arc<dyn EnrichmentHooks>,
        categorizer: Categorizer,
        state: StateStore,
        config: RunConfig,
    ) -> Self {
        Self {
            source,
            sink,
            hooks,
            categorizer,
            scheduler: PriorityScheduler,
            state,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag. Checked between items only.
    pub fn with_shutdown(mut self, shutdown: Arc<AtomicBool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Handle that cancels the run when set.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Execute one full run.
    pub async fn run(&mut self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        info!(
            %run_id,
            source = self.source.name(),
            sink = self.sink.name(),
            max_results = self.config.max_results,
            folders = ?self.config.folders,
            "Starting sync run"
        );

        let fetched = self.fetch().await?;
        let mut summary = RunSummary {
            run_id,
            fetched: fetched.len(),
            ..Default::default()
        };

        let fresh = self.dedupe(fetched, &mut summary);
        let categorized = self.categorizer.classify_all(fresh);
        let ordered = self.scheduler.schedule(categorized);
        info!(
            fetched = summary.fetched,
            new = ordered.len(),
            skipped = summary.skipped,
            "Batch ready"
        );

        if !ordered.is_empty() {
            self.ensure_header().await;
        }

        let mut committed: Vec<String> = Vec::new();
        let total = ordered.len();
        for (index, item) in ordered.into_iter().enumerate() {
            if self.shutdown.load(Ordering::SeqCst) {
                summary.cancelled = true;
                summary.not_attempted = total - index;
                warn!(
                    remaining = summary.not_attempted,
                    "Run cancelled, leaving remaining messages unread"
                );
                break;
            }

            let record = self.process_item(&item, &mut summary).await;
            match record.status {
                ItemStatus::Success => {
                    summary.succeeded += 1;
                    *summary.by_category.entry(record.category.clone()).or_default() += 1;
                    committed.push(record.message_id.clone());
                }
                _ => summary.failed += 1,
            }
            summary.records.push(record);
        }

        self.persist(committed).await?;

        info!(
            %run_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            not_attempted = summary.not_attempted,
            "Sync run complete"
        );
        Ok(summary)
    }

    async fn fetch(&self) -> Result<Vec<Message>> {
        let limit = self.config.timeouts.fetch;
        let fetched = timeout(
            limit,
            self.source
                .fetch_unread(self.config.max_results, &self.config.folders),
        )
        .await;

        match fetched {
            Ok(Ok(messages)) => Ok(messages),
            Ok(Err(SourceError::Auth(reason))) => {
                error!(
                    source = self.source.name(),
                    reason = %reason,
                    "Source rejected credentials"
                );
                Err(Error::Auth(AuthError {
                    service: self.source.name().to_string(),
                    reason,
                }))
            }
            Ok(Err(e)) => {
                error!(source = self.source.name(), error = %e, "Fetch failed, aborting run");
                Err(Error::SourceFetch(e))
            }
            Err(_) => {
                error!(
                    source = self.source.name(),
                    timeout = ?limit,
                    "Fetch timed out, aborting run"
                );
                Err(Error::SourceFetch(SourceError::Timeout(limit)))
            }
        }
    }

    /// Drop ids already in the ledger and repeats within the batch.
    fn dedupe(&self, fetched: Vec<Message>, summary: &mut RunSummary) -> Vec<Message> {
        let mut seen = HashSet::new();
        fetched
            .into_iter()
            .filter(|message| {
                if self.state.contains(&message.id) {
                    debug!(id = %message.id, "Already processed, skipping");
                    summary.skipped += 1;
                    false
                } else if !seen.insert(message.id.clone()) {
                    debug!(id = %message.id, "Duplicate id in batch, skipping");
                    summary.skipped += 1;
                    false
                } else {
                    true
                }
            })
            .collect()
    }

    async fn ensure_header(&self) {
        match timeout(
            self.config.timeouts.commit,
            self.sink.ensure_header_row(SHEET_HEADERS),
        )
        .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(sink = self.sink.name(), error = %e, "Could not ensure header row"),
            Err(_) => warn!(sink = self.sink.name(), "Header row check timed out"),
        }
    }

    async fn process_item(
        &mut self,
        item: &CategorizedMessage,
        summary: &mut RunSummary,
    ) -> ProcessingRecord {
        let mut record = ProcessingRecord::pending(item);
        info!(
            id = %item.message.id,
            category = %item.result.category,
            importance = item.result.importance.get(),
            "Processing message"
        );

        record.transition(ItemStatus::Enriching);
        let enrichment = self.enrich(item, &mut record.warnings).await;

        record.transition(ItemStatus::Committing);
        let row = SheetRow::build(item, &enrichment);
        match self.commit(&row, &mut record).await {
            Ok(row_ref) => {
                info!(id = %record.message_id, row = %row_ref, "Row committed");
                record.row_ref = Some(row_ref);
                record.transition(ItemStatus::Success);

                if let Err(reason) = self.mark_read(&record.message_id).await {
                    warn!(
                        id = %record.message_id,
                        error = %reason,
                        "Mark-read failed after commit, message stays unread"
                    );
                    record.warnings.push(format!("mark_read: {reason}"));
                    summary.mark_read_failures.push(record.message_id.clone());
                }

                self.state.record_success(&record);
            }
            Err(e) => {
                error!(
                    id = %record.message_id,
                    attempts = record.attempts,
                    error = %e,
                    "Sink commit failed, leaving message unread"
                );
                record.last_error = Some(e.to_string());
                record.transition(ItemStatus::Failed);
            }
        }
        record
    }

    async fn enrich(&self, item: &CategorizedMessage, warnings: &mut Vec<String>) -> Enrichment {
        let message = &item.message;
        let hooks = &self.hooks;

        let summary = self
            .bounded(message, "summarize", hooks.summarize(message), warnings)
            .await;
        let sentiment = self
            .bounded(message, "analyze_sentiment", hooks.analyze_sentiment(message), warnings)
            .await;
        let actions = self
            .bounded(
                message,
                "extract_action_items",
                hooks.extract_action_items(message),
                warnings,
            )
            .await;
        let attachments = self
            .bounded(
                message,
                "describe_attachments",
                hooks.describe_attachments(message),
                warnings,
            )
            .await;
        let event = self
            .bounded(
                message,
                "detect_event",
                hooks.detect_event(message, &item.result),
                warnings,
            )
            .await;

        Enrichment {
            summary,
            sentiment,
            actions,
            attachments,
            event,
        }
    }

    /// Run one hook under the enrichment timeout, degrading to the default.
    async fn bounded<T: Default>(
        &self,
        message: &Message,
        hook: &str,
        fut: impl Future<Output = std::result::Result<T, EnrichmentError>>,
        warnings: &mut Vec<String>,
    ) -> T {
        let limit = self.config.timeouts.enrich;
        let err = match timeout(limit, fut).await {
            Ok(Ok(value)) => return value,
            Ok(Err(e)) => e,
            Err(_) => EnrichmentError::Timeout {
                hook: hook.to_string(),
                timeout: limit,
            },
        };
        warn!(id = %message.id, hook, error = %err, "Enrichment degraded to default");
        warnings.push(err.to_string());
        T::default()
    }

    async fn commit(
        &self,
        row: &SheetRow,
        record: &mut ProcessingRecord,
    ) -> std::result::Result<RowRef, SinkError> {
        let limit = self.config.timeouts.commit;
        let max_attempts = self.config.commit_attempts.max(1);

        loop {
            record.attempts += 1;
            let err = match timeout(limit, self.sink.append_row(row)).await {
                Ok(Ok(row_ref)) => return Ok(row_ref),
                Ok(Err(e)) => e,
                // The row may have landed; never retry.
                Err(_) => return Err(SinkError::Timeout(limit)),
            };

            if !err.is_retryable() || record.attempts >= max_attempts {
                return Err(err);
            }
            warn!(
                id = %record.message_id,
                attempt = record.attempts,
                error = %err,
                "Commit failed before reaching the sink, retrying"
            );
            record.transition(ItemStatus::Committing);
        }
    }

    async fn mark_read(&self, id: &str) -> std::result::Result<(), SourceError> {
        let limit = self.config.timeouts.mark_read;
        match timeout(limit, self.source.mark_read(id)).await {
            Ok(result) => result,
            Err(_) => Err(SourceError::Timeout(limit)),
        }
    }

    async fn persist(&mut self, committed: Vec<String>) -> Result<()> {
        let limit = self.config.timeouts.persist;
        let outcome = match timeout(limit, self.state.persist()).await {
            Ok(result) => result,
            Err(_) => Err(StateError::Timeout(limit)),
        };

        outcome.map_err(|source| {
            error!(
                error = %source,
                unrecorded = ?committed,
                "State persist failed; rows are in the sink but may be missing from the ledger"
            );
            Error::StatePersist {
                source,
                unrecorded: committed,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;

    use crate::pipeline::types::{
        AttachmentSummary, CategoryResult, EventHint, NoEnrichment, Sentiment,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    fn msg(id: &str, sender: &str, subject: &str) -> Message {
        Message {
            id: id.into(),
            sender: sender.into(),
            subject: subject.into(),
            timestamp: Utc::now(),
            body: String::new(),
            size: 0,
            attachments: vec![],
            folder: Some("INBOX".into()),
        }
    }

    fn plain(id: &str) -> Message {
        msg(id, "friend@example.org", "hello")
    }

    // ── Mocks ───────────────────────────────────────────────────────

    struct MockSource {
        messages: Vec<Message>,
        fetch_error: Mutex<Option<SourceError>>,
        /// Never answer a fetch.
        stall_fetch: bool,
        mark_fail: HashSet<String>,
        log: Log,
    }

    impl MockSource {
        fn new(messages: Vec<Message>, log: Log) -> Self {
            Self {
                messages,
                fetch_error: Mutex::new(None),
                stall_fetch: false,
                mark_fail: HashSet::new(),
                log,
            }
        }

        fn failing(error: SourceError, log: Log) -> Self {
            let source = Self::new(vec![], log);
            *source.fetch_error.lock().unwrap() = Some(error);
            source
        }
    }

    #[async_trait]
    impl MessageSource for MockSource {
        fn name(&self) -> &str {
            "mock"
        }

        async fn fetch_unread(
            &self,
            max_results: usize,
            _folders: &[String],
        ) -> std::result::Result<Vec<Message>, SourceError> {
            if self.stall_fetch {
                std::future::pending::<()>().await;
            }
            if let Some(e) = self.fetch_error.lock().unwrap().take() {
                return Err(e);
            }
            Ok(self.messages.iter().take(max_results).cloned().collect())
        }

        async fn mark_read(&self, id: &str) -> std::result::Result<(), SourceError> {
            self.log.lock().unwrap().push(format!("read:{id}"));
            if self.mark_fail.contains(id) {
                return Err(SourceError::Protocol("STORE failed".into()));
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockSink {
        rows: Mutex<Vec<SheetRow>>,
        fail: HashSet<String>,
        /// Retryable failures to return before succeeding, per id.
        flaky: Mutex<HashMap<String, u32>>,
        slow: HashSet<String>,
        headers: Mutex<u32>,
        cancel_after_first: Option<Arc<AtomicBool>>,
        log: Log,
    }

    impl MockSink {
        fn with_log(log: Log) -> Self {
            Self {
                log,
                ..Default::default()
            }
        }

        fn committed_ids(&self) -> Vec<String> {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.message_id.clone())
                .collect()
        }
    }

    #[async_trait]
    impl Sink for MockSink {
        fn name(&self) -> &str {
            "mock"
        }

        async fn ensure_header_row(&self, schema: &[&str]) -> std::result::Result<(), SinkError> {
            assert_eq!(schema, SHEET_HEADERS);
            *self.headers.lock().unwrap() += 1;
            Ok(())
        }

        async fn append_row(&self, row: &SheetRow) -> std::result::Result<RowRef, SinkError> {
            let id = row.message_id.clone();
            if self.slow.contains(&id) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            if self.fail.contains(&id) {
                return Err(SinkError::Rejected {
                    status: 400,
                    body: "invalid range".into(),
                });
            }
            if let Some(left) = self.flaky.lock().unwrap().get_mut(&id)
                && *left > 0
            {
                *left -= 1;
                return Err(SinkError::Request("connection refused".into()));
            }

            self.log.lock().unwrap().push(format!("commit:{id}"));
            let mut rows = self.rows.lock().unwrap();
            rows.push(row.clone());
            if let Some(flag) = &self.cancel_after_first {
                flag.store(true, Ordering::SeqCst);
            }
            Ok(RowRef(format!("Emails!A{}:P{}", rows.len() + 1, rows.len() + 1)))
        }
    }

    struct BrokenHooks;

    #[async_trait]
    impl EnrichmentHooks for BrokenHooks {
        async fn summarize(&self, _m: &Message) -> std::result::Result<String, EnrichmentError> {
            Err(EnrichmentError::Failed {
                hook: "summarize".into(),
                reason: "model unavailable".into(),
            })
        }

        async fn analyze_sentiment(
            &self,
            _m: &Message,
        ) -> std::result::Result<Sentiment, EnrichmentError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(Sentiment {
                label: "urgent".into(),
                urgency: 1.0,
            })
        }

        async fn describe_attachments(
            &self,
            _m: &Message,
        ) -> std::result::Result<AttachmentSummary, EnrichmentError> {
            Ok(AttachmentSummary {
                names: vec!["a.pdf".into()],
                count: 1,
            })
        }

        async fn detect_event(
            &self,
            _m: &Message,
            _r: &CategoryResult,
        ) -> std::result::Result<Option<EventHint>, EnrichmentError> {
            Ok(None)
        }
    }

    fn fast_config() -> RunConfig {
        RunConfig {
            max_results: 50,
            timeouts: Timeouts {
                fetch: Duration::from_secs(5),
                commit: Duration::from_millis(100),
                enrich: Duration::from_millis(100),
                mark_read: Duration::from_secs(5),
                persist: Duration::from_secs(5),
            },
            ..Default::default()
        }
    }

    async fn runner_with(
        dir: &tempfile::TempDir,
        source: Arc<MockSource>,
        sink: Arc<MockSink>,
        hooks: Arc<dyn EnrichmentHooks>,
        config: RunConfig,
    ) -> PipelineRunner {
        let state = StateStore::load(dir.path().join("state.json")).await.unwrap();
        PipelineRunner::new(
            source,
            sink,
            hooks,
            Categorizer::default_rules(),
            state,
            config,
        )
    }

    fn new_log() -> Log {
        Arc::new(Mutex::new(Vec::new()))
    }

    // ── Tests ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn partial_failure_is_isolated() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let ids = ["m1", "m2", "m3", "m4", "m5"];
        let source = Arc::new(MockSource::new(ids.iter().map(|i| plain(i)).collect(), log.clone()));
        let mut sink = MockSink::with_log(log.clone());
        sink.fail.insert("m2".into());
        let sink = Arc::new(sink);

        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.succeeded, 4);
        assert_eq!(summary.failed, 1);
        assert_eq!(runner.state().stats().total_processed, 4);
        assert!(!runner.state().contains("m2"));
        assert!(!log.lock().unwrap().contains(&"read:m2".to_string()));

        let failed = summary
            .records
            .iter()
            .find(|r| r.message_id == "m2")
            .unwrap();
        assert_eq!(failed.status, ItemStatus::Failed);
        assert!(failed.last_error.as_deref().unwrap().contains("400"));

        let reloaded = StateStore::load(dir.path().join("state.json")).await.unwrap();
        assert_eq!(reloaded.stats().total_processed, 4);
    }

    #[tokio::test]
    async fn failed_item_is_committed_on_next_run() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let messages: Vec<Message> = ["m1", "m2", "m3", "m4", "m5"]
            .iter()
            .map(|i| plain(i))
            .collect();

        let mut sink = MockSink::with_log(log.clone());
        sink.fail.insert("m2".into());
        let source = Arc::new(MockSource::new(messages.clone(), log.clone()));
        let mut runner =
            runner_with(&dir, source, Arc::new(sink), Arc::new(NoEnrichment), fast_config()).await;
        assert_eq!(runner.run().await.unwrap().failed, 1);

        // m2 is still unread; the sink has recovered.
        let sink = Arc::new(MockSink::with_log(log.clone()));
        let source = Arc::new(MockSource::new(messages, log.clone()));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(sink.committed_ids(), vec!["m2"]);
        assert!(log.lock().unwrap().contains(&"read:m2".to_string()));

        let reloaded = StateStore::load(dir.path().join("state.json")).await.unwrap();
        assert!(reloaded.contains("m2"));
        assert_eq!(reloaded.stats().total_processed, 5);
    }

    #[tokio::test]
    async fn second_run_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let messages: Vec<Message> = (0..4).map(|i| plain(&format!("m{i}"))).collect();

        let sink = Arc::new(MockSink::with_log(log.clone()));
        let source = Arc::new(MockSource::new(messages.clone(), log.clone()));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        runner.run().await.unwrap();
        assert_eq!(sink.committed_ids().len(), 4);

        // Same batch again, e.g. mark-read never took effect.
        let source = Arc::new(MockSource::new(messages, log.clone()));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.skipped, 4);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(sink.committed_ids().len(), 4);
        assert_eq!(runner.state().stats().total_processed, 4);
    }

    #[tokio::test]
    async fn previously_processed_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();

        let mut state = StateStore::load(dir.path().join("state.json")).await.unwrap();
        for id in ["m0", "m4", "m9"] {
            let item = CategorizedMessage {
                message: plain(id),
                result: Categorizer::default_rules().classify(&plain(id)),
            };
            let mut record = ProcessingRecord::pending(&item);
            record.status = ItemStatus::Success;
            state.record_success(&record);
        }
        state.persist().await.unwrap();

        let messages = (0..10).map(|i| plain(&format!("m{i}"))).collect();
        let source = Arc::new(MockSource::new(messages, log.clone()));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.skipped, 3);
        assert_eq!(summary.succeeded, 7);
        assert_eq!(sink.committed_ids().len(), 7);
        assert!(!sink.committed_ids().contains(&"m4".to_string()));
        assert_eq!(runner.state().stats().total_processed, 10);
    }

    #[tokio::test]
    async fn duplicate_ids_in_batch_commit_once() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(
            vec![plain("a"), plain("b"), plain("a")],
            log.clone(),
        ));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(sink.committed_ids(), vec!["a", "b"]);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn commits_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(
            vec![
                msg("promo", "news@shop.example", "Weekly Deals and Tips"),
                msg("bank", "alerts@bank.example", "Transaction alert"),
                msg("other", "friend@example.org", "lunch?"),
            ],
            log.clone(),
        ));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(sink.committed_ids(), vec!["bank", "promo", "other"]);
        assert_eq!(summary.records[0].category, "Banking");
        assert_eq!(summary.records[0].importance.get(), 5);
        assert_eq!(summary.by_category.get("Banking"), Some(&1));
    }

    #[tokio::test]
    async fn mark_read_follows_commit() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![plain("x"), plain("y")], log.clone()));
        let sink = Arc::new(MockSink::with_log(log.clone()));
        let mut runner =
            runner_with(&dir, source, sink, Arc::new(NoEnrichment), fast_config()).await;
        runner.run().await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["commit:x", "read:x", "commit:y", "read:y"]
        );
    }

    #[tokio::test]
    async fn fetch_failure_is_fatal_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::failing(
            SourceError::Protocol("SELECT failed".into()),
            log.clone(),
        ));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::SourceFetch(_)));
        assert!(sink.committed_ids().is_empty());
        assert_eq!(*sink.headers.lock().unwrap(), 0);
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn stalled_fetch_times_out_and_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let mut source = MockSource::new(vec![plain("s1")], log.clone());
        source.stall_fetch = true;
        let sink = Arc::new(MockSink::with_log(log.clone()));

        let config = RunConfig {
            timeouts: Timeouts {
                fetch: Duration::from_millis(50),
                ..fast_config().timeouts
            },
            ..fast_config()
        };
        let mut runner =
            runner_with(&dir, Arc::new(source), sink.clone(), Arc::new(NoEnrichment), config)
                .await;

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::SourceFetch(SourceError::Timeout(_))));
        assert!(sink.committed_ids().is_empty());
        assert_eq!(*sink.headers.lock().unwrap(), 0);
        assert!(log.lock().unwrap().is_empty());
        assert!(!dir.path().join("state.json").exists());
    }

    #[tokio::test]
    async fn source_auth_failure_surfaces_as_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::failing(
            SourceError::Auth("LOGIN rejected".into()),
            log.clone(),
        ));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink, Arc::new(NoEnrichment), fast_config()).await;

        let err = runner.run().await.unwrap_err();
        assert!(matches!(err, Error::Auth(AuthError { ref service, .. }) if service == "mock"));
    }

    #[tokio::test]
    async fn broken_enrichment_degrades_but_commits() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![plain("e1")], log.clone()));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(BrokenHooks), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        let row = sink.rows.lock().unwrap()[0].clone();
        assert_eq!(row.summary, "");
        assert_eq!(row.sentiment, "neutral");
        assert_eq!(row.attachment_count, 1);
        // One failed hook, one timed-out hook.
        assert_eq!(summary.records[0].warnings.len(), 2);
    }

    #[tokio::test]
    async fn retryable_commit_error_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![plain("r1")], log.clone()));
        let sink = MockSink::with_log(log);
        sink.flaky.lock().unwrap().insert("r1".into(), 1);
        let sink = Arc::new(sink);

        let config = RunConfig {
            commit_attempts: 3,
            ..fast_config()
        };
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), config).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.records[0].attempts, 2);
        assert_eq!(sink.committed_ids(), vec!["r1"]);
    }

    #[tokio::test]
    async fn retryable_error_without_budget_fails() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![plain("r1")], log.clone()));
        let sink = MockSink::with_log(log);
        sink.flaky.lock().unwrap().insert("r1".into(), 1);
        let sink = Arc::new(sink);

        let mut runner =
            runner_with(&dir, source, sink, Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.records[0].attempts, 1);
    }

    #[tokio::test]
    async fn commit_timeout_fails_without_retry() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![plain("slow"), plain("ok")], log.clone()));
        let mut sink = MockSink::with_log(log.clone());
        sink.slow.insert("slow".into());
        let sink = Arc::new(sink);

        let config = RunConfig {
            commit_attempts: 5,
            ..fast_config()
        };
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), config).await;
        let summary = runner.run().await.unwrap();

        let slow = &summary.records[0];
        assert_eq!(slow.message_id, "slow");
        assert_eq!(slow.status, ItemStatus::Failed);
        assert_eq!(slow.attempts, 1);
        assert!(!runner.state().contains("slow"));
        assert!(!log.lock().unwrap().contains(&"read:slow".to_string()));
        assert!(runner.state().contains("ok"));
    }

    #[tokio::test]
    async fn mark_read_failure_still_records() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let mut source = MockSource::new(vec![plain("k")], log.clone());
        source.mark_fail.insert("k".into());
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, Arc::new(source), sink, Arc::new(NoEnrichment), fast_config())
                .await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.mark_read_failures, vec!["k"]);
        assert!(runner.state().contains("k"));
    }

    #[tokio::test]
    async fn cancellation_stops_between_items_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let flag = Arc::new(AtomicBool::new(false));
        let source = Arc::new(MockSource::new(
            vec![plain("c1"), plain("c2"), plain("c3")],
            log.clone(),
        ));
        let mut sink = MockSink::with_log(log);
        sink.cancel_after_first = Some(flag.clone());
        let sink = Arc::new(sink);

        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config())
                .await
                .with_shutdown(flag);
        let summary = runner.run().await.unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.not_attempted, 2);
        assert_eq!(sink.committed_ids(), vec!["c1"]);

        let reloaded = StateStore::load(dir.path().join("state.json")).await.unwrap();
        assert!(reloaded.contains("c1"));
    }

    #[tokio::test]
    async fn persist_failure_lists_unrecorded_ids() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        // Block the temp file path so the atomic write fails.
        std::fs::create_dir(dir.path().join("state.json.tmp")).unwrap();

        let source = Arc::new(MockSource::new(vec![plain("p1"), plain("p2")], log.clone()));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink, Arc::new(NoEnrichment), fast_config()).await;

        match runner.run().await {
            Err(Error::StatePersist { unrecorded, .. }) => {
                assert_eq!(unrecorded, vec!["p1", "p2"]);
            }
            other => panic!("expected persist failure, got {other:?}"),
        }
        assert!(!dir.path().join("state.json").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn persist_timeout_is_fatal_and_write_still_finishes() {
        use std::io::Read;

        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        // A FIFO on the temp path blocks the write until someone reads it.
        let tmp = dir.path().join("state.json.tmp");
        let made = std::process::Command::new("mkfifo").arg(&tmp).status().unwrap();
        assert!(made.success());

        let source = Arc::new(MockSource::new(vec![plain("t1")], log.clone()));
        let sink = Arc::new(MockSink::with_log(log));
        let config = RunConfig {
            timeouts: Timeouts {
                persist: Duration::from_millis(100),
                ..fast_config().timeouts
            },
            ..fast_config()
        };
        let mut runner = runner_with(&dir, source, sink, Arc::new(NoEnrichment), config).await;

        match runner.run().await {
            Err(Error::StatePersist {
                source: StateError::Timeout(_),
                unrecorded,
            }) => assert_eq!(unrecorded, vec!["t1"]),
            other => panic!("expected persist timeout, got {other:?}"),
        }
        assert!(runner.state().stats().last_run.is_none());

        // Unblock the abandoned writer; it runs to the end without leaving a temp file.
        let mut drained = Vec::new();
        std::fs::File::open(&tmp)
            .unwrap()
            .read_to_end(&mut drained)
            .unwrap();
        for _ in 0..100 {
            if !tmp.exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn empty_batch_skips_header_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let log = new_log();
        let source = Arc::new(MockSource::new(vec![], log.clone()));
        let sink = Arc::new(MockSink::with_log(log));
        let mut runner =
            runner_with(&dir, source, sink.clone(), Arc::new(NoEnrichment), fast_config()).await;
        let summary = runner.run().await.unwrap();

        assert_eq!(summary.fetched, 0);
        assert_eq!(*sink.headers.lock().unwrap(), 0);
        assert!(runner.state().stats().last_run.is_some());
    }
}
