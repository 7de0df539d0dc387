//! Google Sheets sink over the `spreadsheets.values` REST API.
//!
//! The OAuth bearer token is supplied by the environment; obtaining and
//! refreshing it is somebody else's job.

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::{Lookup, optional, process_env, required};
use crate::error::{ConfigError, SinkError};
use crate::pipeline::types::{RowReader, RowRef, SHEET_HEADERS, SheetRow, Sink};

const API_BASE: &str = "https://sheets.googleapis.com/v4/spreadsheets";

/// Spreadsheet target and credentials.
#[derive(Debug, Clone)]
pub struct SheetsConfig {
    pub spreadsheet_id: String,
    pub sheet_name: String,
    pub access_token: SecretString,
    /// Values API root; overridable for proxies and emulators.
    pub api_base: String,
}

impl SheetsConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(&process_env)
    }

    pub fn from_lookup(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        Ok(Self {
            spreadsheet_id: required(lookup, "SHEETS_SPREADSHEET_ID")?,
            sheet_name: optional(lookup, "SHEETS_SHEET_NAME").unwrap_or_else(|| "Emails".into()),
            access_token: SecretString::from(required(lookup, "SHEETS_ACCESS_TOKEN")?),
            api_base: optional(lookup, "SHEETS_API_BASE").unwrap_or_else(|| API_BASE.into()),
        })
    }
}

/// Appends one row per message to a sheet.
pub struct SheetsSink {
    config: SheetsConfig,
    client: reqwest::Client,
}

impl SheetsSink {
    pub fn new(config: SheetsConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    /// Last column letter for the row schema (`P` for 16 columns).
    fn last_column() -> char {
        column_letter(SHEET_HEADERS.len())
    }

    fn range(&self, cells: &str) -> String {
        format!("{}!{cells}", quote_sheet(&self.config.sheet_name))
    }

    /// `.../{spreadsheet}/values/{range}{suffix}` with the range percent-encoded.
    fn values_url(&self, range: &str, suffix: &str) -> Result<Url, SinkError> {
        let base = &self.config.api_base;
        let mut url = Url::parse(base).map_err(|e| SinkError::Request(e.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| SinkError::Request(format!("invalid API base {base}")))?
            .push(&self.config.spreadsheet_id)
            .push("values")
            .push(&format!("{range}{suffix}"));
        Ok(url)
    }

    /// Send with bearer auth. Any non-2xx status becomes `Rejected`.
    async fn send(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SinkError> {
        let resp = request
            .bearer_auth(self.config.access_token.expose_secret())
            .send()
            .await
            .map_err(send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(rejected(status, body));
        }
        Ok(resp)
    }

    async fn send_json(&self, request: reqwest::RequestBuilder) -> Result<Value, SinkError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| SinkError::Response(e.to_string()))
    }
}

#[async_trait]
impl Sink for SheetsSink {
    fn name(&self) -> &str {
        "sheets"
    }

    async fn ensure_header_row(&self, schema: &[&str]) -> Result<(), SinkError> {
        let range = self.range(&format!("A1:{}1", Self::last_column()));
        let current = self
            .send_json(self.client.get(self.values_url(&range, "")?))
            .await?;

        if has_values(&current) {
            debug!(sheet = %self.config.sheet_name, "Header row present");
            return Ok(());
        }

        let mut url = self.values_url(&range, "")?;
        url.query_pairs_mut().append_pair("valueInputOption", "RAW");
        let body = serde_json::json!({ "values": [schema] });
        self.send(self.client.put(url).json(&body)).await?;

        info!(sheet = %self.config.sheet_name, "Header row written");
        Ok(())
    }

    async fn append_row(&self, row: &SheetRow) -> Result<RowRef, SinkError> {
        let range = self.range(&format!("A:{}", Self::last_column()));
        let mut url = self.values_url(&range, ":append")?;
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let body = serde_json::json!({ "values": [row.to_cells()] });
        let resp = self.send(self.client.post(url).json(&body)).await?;

        // A 2xx means the row is in the sheet, whatever the body says.
        let row_ref = match resp.json::<Value>().await {
            Ok(body) => updated_range(&body),
            Err(e) => {
                warn!(
                    id = %row.message_id,
                    error = %e,
                    "Append accepted but response unreadable"
                );
                None
            }
        };
        Ok(row_ref.unwrap_or(RowRef(range)))
    }
}

#[async_trait]
impl RowReader for SheetsSink {
    async fn read_rows(&self) -> Result<Vec<SheetRow>, SinkError> {
        let range = self.range(&format!("A2:{}", Self::last_column()));
        let resp = self
            .send_json(self.client.get(self.values_url(&range, "")?))
            .await?;
        let rows = rows_from_values(&resp);
        debug!(sheet = %self.config.sheet_name, rows = rows.len(), "Read rows back");
        Ok(rows)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

/// Spreadsheet column letter for a 1-based index (1 → A).
pub fn column_letter(mut index: usize) -> char {
    // The schema never exceeds 26 columns.
    index = index.clamp(1, 26);
    (b'A' + (index - 1) as u8) as char
}

/// Quote a sheet name for A1 notation.
pub fn quote_sheet(name: &str) -> String {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        name.to_string()
    } else {
        format!("'{}'", name.replace('\'', "''"))
    }
}

fn has_values(resp: &Value) -> bool {
    resp.get("values")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(Value::as_array)
        .is_some_and(|cells| !cells.is_empty())
}

fn updated_range(resp: &Value) -> Option<RowRef> {
    resp.pointer("/updates/updatedRange")
        .and_then(Value::as_str)
        .map(|s| RowRef(s.to_string()))
}

/// Rows of a `values.get` response. Blank rows are dropped.
fn rows_from_values(resp: &Value) -> Vec<SheetRow> {
    let Some(rows) = resp.get("values").and_then(Value::as_array) else {
        return Vec::new();
    };
    rows.iter()
        .filter_map(Value::as_array)
        .map(|cells| {
            cells
                .iter()
                .map(|c| c.as_str().map_or_else(|| c.to_string(), str::to_string))
                .collect::<Vec<_>>()
        })
        .filter(|cells| cells.iter().any(|c| !c.trim().is_empty()))
        .map(|cells| SheetRow::from_cells(&cells))
        .collect()
}

/// Connection failures never reached the API; anything else may have.
fn send_error(e: reqwest::Error) -> SinkError {
    if e.is_connect() || e.is_builder() {
        SinkError::Request(e.to_string())
    } else {
        SinkError::Io(std::io::Error::other(e))
    }
}

fn rejected(status: StatusCode, body: String) -> SinkError {
    SinkError::Rejected {
        status: status.as_u16(),
        body: body.chars().take(500).collect(),
    }
}
