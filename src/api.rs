//! Request and response modeling for the spreadsheet operation set.
//!
//! The remote service exposes a fixed set of operations over rectangular
//! cell ranges. That set is closed by design: [`SheetsRequest`] has one
//! variant per operation, and every middleware layer matches on it
//! exhaustively, so adding an operation means adding a variant and updating
//! each layer. There is no reflective or dynamic wrapping.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, SheetsError};

/// A rectangular block of cell values. Rows may be ragged; a missing
/// trailing cell is simply absent rather than `null`.
pub type CellGrid = Vec<Vec<Value>>;

/// A block of values tied to the range it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRange {
    pub range: String,
    pub values: CellGrid,
}

impl ValueRange {
    pub fn new(range: impl Into<String>, values: CellGrid) -> Self {
        Self {
            range: range.into(),
            values,
        }
    }
}

/// Outcome of a single write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSummary {
    pub spreadsheet_id: String,
    pub updated_range: String,
    pub updated_rows: usize,
    pub updated_columns: usize,
    pub updated_cells: usize,
}

impl UpdateSummary {
    /// Build a summary for `values` written at `range`.
    pub fn for_values(spreadsheet_id: &str, range: &str, values: &CellGrid) -> Self {
        Self {
            spreadsheet_id: spreadsheet_id.to_string(),
            updated_range: range.to_string(),
            updated_rows: values.len(),
            updated_columns: values.iter().map(Vec::len).max().unwrap_or(0),
            updated_cells: values.iter().map(Vec::len).sum(),
        }
    }
}

/// Outcome of an append. `table_range` is the range of the table the rows
/// were appended to, as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendSummary {
    pub spreadsheet_id: String,
    pub table_range: String,
    pub updates: UpdateSummary,
}

/// Outcome of a clear.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedRange {
    pub spreadsheet_id: String,
    pub cleared_range: String,
}

/// Aggregate outcome of a batch write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchUpdateSummary {
    pub spreadsheet_id: String,
    pub total_updated_cells: usize,
    pub responses: Vec<UpdateSummary>,
}

/// Spreadsheet-level properties returned by a metadata fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadsheetMetadata {
    pub spreadsheet_id: String,
    pub title: String,
    pub sheets: Vec<SheetProperties>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetProperties {
    pub sheet_id: u64,
    pub title: String,
    pub row_count: usize,
    pub column_count: usize,
}

/// Operation label, used for per-method metrics and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Method {
    Read,
    Write,
    Append,
    Clear,
    BatchRead,
    BatchWrite,
    BatchClear,
    GetMetadata,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Read => "read",
            Method::Write => "write",
            Method::Append => "append",
            Method::Clear => "clear",
            Method::BatchRead => "batch_read",
            Method::BatchWrite => "batch_write",
            Method::BatchClear => "batch_clear",
            Method::GetMetadata => "get_metadata",
        }
    }

    /// Whether retrying the operation cannot change the final state.
    ///
    /// `write` overwrites a fixed range and is effectively idempotent per
    /// range. `append` is NOT idempotent: retrying a timed-out append can
    /// duplicate rows. That risk is accepted and documented, not corrected.
    pub fn is_idempotent(&self) -> bool {
        !matches!(self, Method::Append)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical call against the remote service.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetsRequest {
    Read {
        spreadsheet_id: String,
        range: String,
    },
    Write {
        spreadsheet_id: String,
        range: String,
        values: CellGrid,
    },
    Append {
        spreadsheet_id: String,
        range: String,
        values: CellGrid,
    },
    Clear {
        spreadsheet_id: String,
        range: String,
    },
    BatchRead {
        spreadsheet_id: String,
        ranges: Vec<String>,
    },
    BatchWrite {
        spreadsheet_id: String,
        entries: Vec<ValueRange>,
    },
    BatchClear {
        spreadsheet_id: String,
        ranges: Vec<String>,
    },
    GetMetadata {
        spreadsheet_id: String,
    },
}

impl SheetsRequest {
    pub fn method(&self) -> Method {
        match self {
            SheetsRequest::Read { .. } => Method::Read,
            SheetsRequest::Write { .. } => Method::Write,
            SheetsRequest::Append { .. } => Method::Append,
            SheetsRequest::Clear { .. } => Method::Clear,
            SheetsRequest::BatchRead { .. } => Method::BatchRead,
            SheetsRequest::BatchWrite { .. } => Method::BatchWrite,
            SheetsRequest::BatchClear { .. } => Method::BatchClear,
            SheetsRequest::GetMetadata { .. } => Method::GetMetadata,
        }
    }

    pub fn spreadsheet_id(&self) -> &str {
        match self {
            SheetsRequest::Read { spreadsheet_id, .. }
            | SheetsRequest::Write { spreadsheet_id, .. }
            | SheetsRequest::Append { spreadsheet_id, .. }
            | SheetsRequest::Clear { spreadsheet_id, .. }
            | SheetsRequest::BatchRead { spreadsheet_id, .. }
            | SheetsRequest::BatchWrite { spreadsheet_id, .. }
            | SheetsRequest::BatchClear { spreadsheet_id, .. }
            | SheetsRequest::GetMetadata { spreadsheet_id } => spreadsheet_id,
        }
    }

    /// Synchronous precondition check, run before the request enters the
    /// middleware stack. A violation is raised immediately and never
    /// retried.
    pub fn validate(&self) -> Result<()> {
        if self.spreadsheet_id().is_empty() {
            return Err(SheetsError::InvalidRequest(
                "spreadsheet id must not be empty".to_string(),
            ));
        }
        match self {
            SheetsRequest::Read { range, .. }
            | SheetsRequest::Write { range, .. }
            | SheetsRequest::Append { range, .. }
            | SheetsRequest::Clear { range, .. } => validate_range(range),
            SheetsRequest::BatchRead { ranges, .. } | SheetsRequest::BatchClear { ranges, .. } => {
                ranges.iter().try_for_each(|r| validate_range(r))
            }
            SheetsRequest::BatchWrite { entries, .. } => {
                entries.iter().try_for_each(|e| validate_range(&e.range))
            }
            SheetsRequest::GetMetadata { .. } => Ok(()),
        }
    }
}

/// Response payloads, one variant per request variant.
#[derive(Debug, Clone, PartialEq)]
pub enum SheetsResponse {
    Values(ValueRange),
    Updated(UpdateSummary),
    Appended(AppendSummary),
    Cleared(ClearedRange),
    BatchValues(Vec<ValueRange>),
    BatchUpdated(BatchUpdateSummary),
    BatchCleared(Vec<ClearedRange>),
    Metadata(SpreadsheetMetadata),
}

impl SheetsResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            SheetsResponse::Values(_) => "values",
            SheetsResponse::Updated(_) => "updated",
            SheetsResponse::Appended(_) => "appended",
            SheetsResponse::Cleared(_) => "cleared",
            SheetsResponse::BatchValues(_) => "batch_values",
            SheetsResponse::BatchUpdated(_) => "batch_updated",
            SheetsResponse::BatchCleared(_) => "batch_cleared",
            SheetsResponse::Metadata(_) => "metadata",
        }
    }
}

/// Minimal well-formedness check for range notation: non-empty, and when a
/// sheet qualifier is present (`Sheet1!A1:B2`) both halves are non-empty.
/// Full notation parsing belongs to the transport, not this layer.
fn validate_range(range: &str) -> Result<()> {
    if range.is_empty() {
        return Err(SheetsError::InvalidRange("empty range".to_string()));
    }
    if let Some((sheet, cells)) = range.split_once('!') {
        if sheet.is_empty() || cells.is_empty() {
            return Err(SheetsError::InvalidRange(range.to_string()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid() -> CellGrid {
        vec![vec![json!("a"), json!("b")], vec![json!(1)]]
    }

    #[test]
    fn update_summary_counts_cells() {
        let summary = UpdateSummary::for_values("s1", "A1:B2", &grid());
        assert_eq!(summary.updated_rows, 2);
        assert_eq!(summary.updated_columns, 2);
        assert_eq!(summary.updated_cells, 3);
    }

    #[test]
    fn method_idempotency() {
        assert!(Method::Read.is_idempotent());
        assert!(Method::Clear.is_idempotent());
        assert!(Method::Write.is_idempotent());
        assert!(!Method::Append.is_idempotent());
    }

    #[test]
    fn validate_rejects_empty_spreadsheet_id() {
        let req = SheetsRequest::Read {
            spreadsheet_id: String::new(),
            range: "A1:B2".to_string(),
        };
        assert!(matches!(
            req.validate(),
            Err(SheetsError::InvalidRequest(_))
        ));
    }

    #[test]
    fn validate_rejects_malformed_ranges() {
        for bad in ["", "!A1:B2", "Sheet1!"] {
            let req = SheetsRequest::Clear {
                spreadsheet_id: "s1".to_string(),
                range: bad.to_string(),
            };
            assert!(
                matches!(req.validate(), Err(SheetsError::InvalidRange(_))),
                "expected rejection for {bad:?}"
            );
        }
    }

    #[test]
    fn validate_accepts_sheet_qualified_ranges() {
        let req = SheetsRequest::Read {
            spreadsheet_id: "s1".to_string(),
            range: "Budget!A1:C10".to_string(),
        };
        assert!(req.validate().is_ok());
    }
}
