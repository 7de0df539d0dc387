//! Shared types for the sync pipeline.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EnrichmentError, SinkError, SourceError};

// ── Inbound message ─────────────────────────────────────────────────

/// A fetched mail message. Immutable once fetched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Source-assigned identifier, unique across folders.
    pub id: String,
    /// Sender address (may be empty for malformed mail).
    pub sender: String,
    /// Subject line (may be empty).
    pub subject: String,
    /// When the message was sent.
    pub timestamp: DateTime<Utc>,
    /// Plain-text body.
    pub body: String,
    /// Raw message size in bytes.
    pub size: usize,
    /// Attachment metadata, if the source exposes it.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentMeta>,
    /// Folder the message was fetched from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder: Option<String>,
}

/// Name, type and size of one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub name: String,
    pub content_type: String,
    pub size: usize,
}

impl Message {
    /// Domain part of the sender address, lowercased.
    ///
    /// Handles `Name <user@host>` as well as a bare address.
    pub fn sender_domain(&self) -> Option<String> {
        let addr = match (self.sender.rfind('<'), self.sender.rfind('>')) {
            (Some(start), Some(end)) if end > start => &self.sender[start + 1..end],
            _ => self.sender.as_str(),
        };
        let (_, domain) = addr.trim().rsplit_once('@')?;
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        if domain.is_empty() { None } else { Some(domain) }
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Importance score, always in `1..=5`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Importance(u8);

impl Importance {
    pub const MIN: Importance = Importance(1);
    pub const MAX: Importance = Importance(5);

    /// Raw score.
    pub fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Importance {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        if (Self::MIN.0..=Self::MAX.0).contains(&value) {
            Ok(Self(value))
        } else {
            Err(format!("importance must be between 1 and 5, got {value}"))
        }
    }
}

impl From<Importance> for u8 {
    fn from(value: Importance) -> Self {
        value.0
    }
}

impl std::fmt::Display for Importance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category label plus importance for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryResult {
    pub category: String,
    pub importance: Importance,
}

/// A message paired with its classification, in fetch order.
#[derive(Debug, Clone)]
pub struct CategorizedMessage {
    pub message: Message,
    pub result: CategoryResult,
}

// ── Enrichment ──────────────────────────────────────────────────────

/// Sentiment label and urgency in `0.0..=1.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sentiment {
    pub label: String,
    pub urgency: f32,
}

impl Default for Sentiment {
    fn default() -> Self {
        Self {
            label: "neutral".into(),
            urgency: 0.5,
        }
    }
}

/// Action items found in a message, plus the first due date if any.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionItems {
    pub items: Vec<String>,
    pub due_date: Option<chrono::NaiveDate>,
}

/// Row-ready attachment summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub names: Vec<String>,
    pub count: usize,
}

/// A meeting or deadline that looks like it belongs on a calendar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventHint {
    pub title: String,
    pub date: Option<chrono::NaiveDate>,
}

/// Everything the enrichment hooks produced for one message.
///
/// Each field falls back to its default when its hook fails.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub summary: String,
    pub sentiment: Sentiment,
    pub actions: ActionItems,
    pub attachments: AttachmentSummary,
    pub event: Option<EventHint>,
}

// ── Processing record ───────────────────────────────────────────────

/// Per-item status within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Enriching,
    Committing,
    Success,
    Failed,
}

impl ItemStatus {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ItemStatus) -> bool {
        use ItemStatus::*;

        matches!(
            (self, target),
            (Pending, Enriching) | (Enriching, Committing) |
            (Committing, Success) | (Committing, Failed) |
            // A retried commit stays in Committing
            (Committing, Committing)
        )
    }
}

impl std::fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Enriching => "enriching",
            Self::Committing => "committing",
            Self::Success => "success",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// Outcome of one message within one run.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessingRecord {
    pub message_id: String,
    pub category: String,
    pub importance: Importance,
    pub status: ItemStatus,
    /// Number of sink commit attempts made this run.
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Non-fatal problems (degraded hooks, mark-read failure).
    pub warnings: Vec<String>,
    /// Where the sink put the row, on success.
    pub row_ref: Option<RowRef>,
}

impl ProcessingRecord {
    /// Fresh pending record for a categorized message.
    pub fn pending(item: &CategorizedMessage) -> Self {
        Self {
            message_id: item.message.id.clone(),
            category: item.result.category.clone(),
            importance: item.result.importance,
            status: ItemStatus::Pending,
            attempts: 0,
            last_error: None,
            warnings: Vec::new(),
            row_ref: None,
        }
    }

    /// Move to `target`, ignoring transitions the state machine forbids.
    pub fn transition(&mut self, target: ItemStatus) -> bool {
        if self.status.can_transition_to(target) {
            self.status = target;
            true
        } else {
            tracing::warn!(
                id = %self.message_id,
                from = %self.status,
                to = %target,
                "Rejected invalid item transition"
            );
            false
        }
    }
}

// ── Sink row ────────────────────────────────────────────────────────

/// Reference to a committed row (e.g. `Emails!A12:P12`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowRef(pub String);

impl std::fmt::Display for RowRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Column headers, in row order.
pub const SHEET_HEADERS: &[&str] = &[
    "Message ID",
    "From",
    "Subject",
    "Date",
    "Category",
    "Importance",
    "Summary",
    "Content",
    "Action Items",
    "Due Date",
    "Has Attachments",
    "Attachment Names",
    "Attachment Count",
    "Sentiment",
    "Urgency",
    "Event Detected",
];

/// Spreadsheet cells cap out at 50k characters; keep well clear of it.
const MAX_CONTENT_CHARS: usize = 40_000;

/// One sink row, built from a message, its classification and enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SheetRow {
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub date: String,
    pub category: String,
    pub importance: u8,
    pub summary: String,
    pub content: String,
    pub action_items: String,
    pub due_date: String,
    pub has_attachments: bool,
    pub attachment_names: String,
    pub attachment_count: usize,
    pub sentiment: String,
    pub urgency: f32,
    pub event_detected: bool,
}

impl SheetRow {
    pub fn build(item: &CategorizedMessage, enrichment: &Enrichment) -> Self {
        let message = &item.message;
        Self {
            message_id: message.id.clone(),
            from: message.sender.clone(),
            subject: message.subject.clone(),
            date: message.timestamp.to_rfc3339(),
            category: item.result.category.clone(),
            importance: item.result.importance.get(),
            summary: enrichment.summary.clone(),
            content: message.body.chars().take(MAX_CONTENT_CHARS).collect(),
            action_items: enrichment.actions.items.join("; "),
            due_date: enrichment
                .actions
                .due_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_default(),
            has_attachments: enrichment.attachments.count > 0,
            attachment_names: enrichment.attachments.names.join(", "),
            attachment_count: enrichment.attachments.count,
            sentiment: enrichment.sentiment.label.clone(),
            urgency: enrichment.sentiment.urgency,
            event_detected: enrichment.event.is_some(),
        }
    }

    /// Cell values in [`SHEET_HEADERS`] order.
    pub fn to_cells(&self) -> Vec<String> {
        let yes_no = |b: bool| if b { "Yes" } else { "No" }.to_string();
        vec![
            self.message_id.clone(),
            self.from.clone(),
            self.subject.clone(),
            self.date.clone(),
            self.category.clone(),
            self.importance.to_string(),
            self.summary.clone(),
            self.content.clone(),
            self.action_items.clone(),
            self.due_date.clone(),
            yes_no(self.has_attachments),
            self.attachment_names.clone(),
            self.attachment_count.to_string(),
            self.sentiment.clone(),
            format!("{:.2}", self.urgency),
            yes_no(self.event_detected),
        ]
    }

    /// Rebuild a row from cells read back from a sheet.
    ///
    /// Missing trailing cells and unparseable numbers fall back to defaults;
    /// an unreadable importance counts as the baseline score of 2.
    pub fn from_cells(cells: &[String]) -> Self {
        let text = |i: usize| cells.get(i).map(|c| c.trim().to_string()).unwrap_or_default();
        let yes = |i: usize| cells.get(i).is_some_and(|c| c.trim().eq_ignore_ascii_case("yes"));
        Self {
            message_id: text(0),
            from: text(1),
            subject: text(2),
            date: text(3),
            category: text(4),
            importance: text(5).parse().unwrap_or(2),
            summary: text(6),
            content: text(7),
            action_items: text(8),
            due_date: text(9),
            has_attachments: yes(10),
            attachment_names: text(11),
            attachment_count: text(12).parse().unwrap_or(0),
            sentiment: text(13),
            urgency: text(14).parse().unwrap_or(0.0),
            event_detected: yes(15),
        }
    }
}

// ── Collaborator traits ─────────────────────────────────────────────

/// Where unread mail comes from. Pure I/O, no business logic.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Source name for logging (e.g. "imap").
    fn name(&self) -> &str;

    /// Fetch up to `max_results` unread messages across `folders`, in source order.
    ///
    /// Must not change the read state of anything it returns.
    async fn fetch_unread(
        &self,
        max_results: usize,
        folders: &[String],
    ) -> Result<Vec<Message>, SourceError>;

    /// Mark one previously fetched message as read.
    async fn mark_read(&self, id: &str) -> Result<(), SourceError>;
}

/// Tabular destination receiving one row per processed message.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Sink name for logging (e.g. "sheets").
    fn name(&self) -> &str;

    /// Write the header row if the sink has none yet.
    async fn ensure_header_row(&self, schema: &[&str]) -> Result<(), SinkError>;

    /// Append one row. Success means the row is durably in the sink.
    async fn append_row(&self, row: &SheetRow) -> Result<RowRef, SinkError>;
}

/// Read access to rows a sink already holds, for reporting.
#[async_trait]
pub trait RowReader: Send + Sync {
    /// Every committed row, header excluded, in sink order.
    async fn read_rows(&self) -> Result<Vec<SheetRow>, SinkError>;
}

/// Best-effort per-message augmentation.
///
/// Every hook is optional: the default implementations return empty values,
/// so an implementor only overrides what it supports.
#[async_trait]
pub trait EnrichmentHooks: Send + Sync {
    async fn summarize(&self, _message: &Message) -> Result<String, EnrichmentError> {
        Ok(String::new())
    }

    async fn analyze_sentiment(&self, _message: &Message) -> Result<Sentiment, EnrichmentError> {
        Ok(Sentiment::default())
    }

    async fn extract_action_items(
        &self,
        _message: &Message,
    ) -> Result<ActionItems, EnrichmentError> {
        Ok(ActionItems::default())
    }

    async fn describe_attachments(
        &self,
        _message: &Message,
    ) -> Result<AttachmentSummary, EnrichmentError> {
        Ok(AttachmentSummary::default())
    }

    async fn detect_event(
        &self,
        _message: &Message,
        _result: &CategoryResult,
    ) -> Result<Option<EventHint>, EnrichmentError> {
        Ok(None)
    }
}

/// Hooks that produce nothing; every row gets default enrichment values.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

impl EnrichmentHooks for NoEnrichment {}
