//! Reporting over every row the sink holds, plus the ledger totals.
//!
//! The report is rebuilt from the sink on each call, so it covers all runs,
//! not just the latest one.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use crate::error::AnalyticsError;
use crate::pipeline::types::{RowReader, SheetRow};
use crate::store::StateStats;

/// Number of senders listed in a report.
pub const TOP_SENDERS: usize = 10;

/// File name the JSON report is written under.
pub const REPORT_FILE: &str = "analytics_report.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SenderCount {
    pub sender: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AttachmentTotals {
    pub with_attachments: usize,
    pub without_attachments: usize,
    pub total_attachments: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActionTotals {
    pub with_actions: usize,
    pub without_actions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub earliest: NaiveDate,
    pub latest: NaiveDate,
    pub days_span: i64,
}

/// Aggregate view of everything committed so far.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsReport {
    pub generated_at: DateTime<Utc>,
    pub total_rows: usize,
    pub ledger: StateStats,
    pub by_category: BTreeMap<String, usize>,
    /// Keyed by score, highest first when rendered.
    pub by_importance: BTreeMap<u8, usize>,
    pub top_senders: Vec<SenderCount>,
    pub attachments: AttachmentTotals,
    pub actions: ActionTotals,
    /// `None` when no row carries a readable date.
    pub date_range: Option<DateRange>,
    /// Rows per day (UTC), keyed `YYYY-MM-DD`.
    pub daily_volume: BTreeMap<String, usize>,
}

impl AnalyticsReport {
    pub fn build(rows: &[SheetRow], ledger: StateStats, generated_at: DateTime<Utc>) -> Self {
        let mut by_category = BTreeMap::new();
        let mut by_importance = BTreeMap::new();
        let mut senders: HashMap<&str, usize> = HashMap::new();
        let mut attachments = AttachmentTotals::default();
        let mut actions = ActionTotals::default();
        let mut days: BTreeMap<NaiveDate, usize> = BTreeMap::new();

        for row in rows {
            *by_category.entry(row.category.clone()).or_default() += 1;
            *by_importance.entry(row.importance).or_default() += 1;
            *senders.entry(row.from.as_str()).or_default() += 1;

            if row.has_attachments {
                attachments.with_attachments += 1;
            } else {
                attachments.without_attachments += 1;
            }
            attachments.total_attachments += row.attachment_count;

            if row.action_items.trim().is_empty() {
                actions.without_actions += 1;
            } else {
                actions.with_actions += 1;
            }

            if let Some(day) = row_day(row) {
                *days.entry(day).or_default() += 1;
            }
        }

        let mut top_senders: Vec<SenderCount> = senders
            .into_iter()
            .map(|(sender, count)| SenderCount {
                sender: sender.to_string(),
                count,
            })
            .collect();
        top_senders.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.sender.cmp(&b.sender)));
        top_senders.truncate(TOP_SENDERS);

        let date_range = match (days.keys().next(), days.keys().next_back()) {
            (Some(&earliest), Some(&latest)) => Some(DateRange {
                earliest,
                latest,
                days_span: (latest - earliest).num_days(),
            }),
            _ => None,
        };

        Self {
            generated_at,
            total_rows: rows.len(),
            ledger,
            by_category,
            by_importance,
            top_senders,
            attachments,
            actions,
            date_range,
            daily_volume: days
                .into_iter()
                .map(|(day, count)| (day.format("%Y-%m-%d").to_string(), count))
                .collect(),
        }
    }

    /// Human-readable summary for the console.
    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "Rows: {} (ledger: {})",
            self.total_rows, self.ledger.total_processed
        );
        if let Some(range) = &self.date_range {
            let _ = writeln!(
                out,
                "Dates: {} to {} ({} days)",
                range.earliest, range.latest, range.days_span
            );
        }

        let mut categories: Vec<_> = self.by_category.iter().collect();
        categories.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let _ = writeln!(out, "By category:");
        for (category, count) in categories {
            let _ = writeln!(out, "  {category}: {count}");
        }

        let _ = writeln!(out, "By importance:");
        for (score, count) in self.by_importance.iter().rev() {
            let _ = writeln!(out, "  {score}/5: {count}");
        }

        let _ = writeln!(out, "Top senders:");
        for (rank, sender) in self.top_senders.iter().enumerate() {
            let _ = writeln!(out, "  {}. {}: {}", rank + 1, sender.sender, sender.count);
        }

        let _ = writeln!(
            out,
            "Attachments: {} with, {} without, {} total",
            self.attachments.with_attachments,
            self.attachments.without_attachments,
            self.attachments.total_attachments
        );
        let _ = writeln!(
            out,
            "Action items: {} with, {} without",
            self.actions.with_actions, self.actions.without_actions
        );

        // Last week of activity only.
        let skip = self.daily_volume.len().saturating_sub(7);
        let _ = writeln!(out, "Daily volume:");
        for (day, count) in self.daily_volume.iter().skip(skip) {
            let _ = writeln!(out, "  {day}: {count}");
        }
        out
    }
}

/// Calendar day (UTC) of a row's RFC 3339 date cell.
fn row_day(row: &SheetRow) -> Option<NaiveDate> {
    DateTime::parse_from_rfc3339(row.date.trim())
        .ok()
        .map(|d| d.with_timezone(&Utc).date_naive())
}

/// Read every committed row and build a report.
pub async fn generate(
    reader: &dyn RowReader,
    ledger: StateStats,
) -> Result<AnalyticsReport, AnalyticsError> {
    let rows = reader.read_rows().await?;
    let report = AnalyticsReport::build(&rows, ledger, Utc::now());
    info!(
        rows = report.total_rows,
        categories = report.by_category.len(),
        "Analytics report built"
    );
    Ok(report)
}

/// Write the report as pretty JSON into `dir`, returning the file path.
pub async fn write_report(
    report: &AnalyticsReport,
    dir: &Path,
) -> Result<PathBuf, AnalyticsError> {
    let path = dir.join(REPORT_FILE);
    let write_failed = |e: std::io::Error| AnalyticsError::Write {
        path: path.clone(),
        reason: e.to_string(),
    };

    tokio::fs::create_dir_all(dir).await.map_err(write_failed)?;
    let mut bytes = serde_json::to_vec_pretty(report)?;
    bytes.push(b'\n');
    tokio::fs::write(&path, bytes).await.map_err(write_failed)?;

    info!(path = %path.display(), "Analytics report written");
    Ok(path)
}
