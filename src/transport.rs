//! Transport seam: the backend trait, its service adapter, and an
//! in-memory backend.
//!
//! A backend performs the actual remote calls. This crate never speaks
//! HTTP itself; it decorates whatever implements [`SheetsBackend`].
//! Backend failures are raw [`TransportError`]s — classification happens
//! in the retry engine, not here.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tower::Service;

use crate::api::{
    AppendSummary, BatchUpdateSummary, CellGrid, ClearedRange, SheetProperties, SheetsRequest,
    SheetsResponse, SpreadsheetMetadata, UpdateSummary, ValueRange,
};
use crate::error::{Result, SheetsError, TransportError, TransportResult};

/// The fixed operation set a transport must provide.
#[async_trait]
pub trait SheetsBackend: Send + Sync {
    async fn read(&self, spreadsheet_id: &str, range: &str) -> TransportResult<ValueRange>;

    async fn write(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> TransportResult<UpdateSummary>;

    async fn append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> TransportResult<AppendSummary>;

    async fn clear(&self, spreadsheet_id: &str, range: &str) -> TransportResult<ClearedRange>;

    async fn batch_read(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
    ) -> TransportResult<Vec<ValueRange>>;

    async fn batch_write(
        &self,
        spreadsheet_id: &str,
        entries: Vec<ValueRange>,
    ) -> TransportResult<BatchUpdateSummary>;

    async fn batch_clear(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
    ) -> TransportResult<Vec<ClearedRange>>;

    async fn get_metadata(&self, spreadsheet_id: &str) -> TransportResult<SpreadsheetMetadata>;
}

/// Adapts a [`SheetsBackend`] into the innermost Tower service of the
/// stack.
#[derive(Clone)]
pub struct BackendService {
    backend: Arc<dyn SheetsBackend>,
}

impl BackendService {
    pub fn new(backend: Arc<dyn SheetsBackend>) -> Self {
        Self { backend }
    }
}

impl Service<SheetsRequest> for BackendService {
    type Response = SheetsResponse;
    type Error = SheetsError;
    type Future = BoxFuture<'static, Result<SheetsResponse>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<()>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: SheetsRequest) -> Self::Future {
        let backend = self.backend.clone();
        Box::pin(async move {
            let resp = match req {
                SheetsRequest::Read {
                    spreadsheet_id,
                    range,
                } => backend
                    .read(&spreadsheet_id, &range)
                    .await
                    .map(SheetsResponse::Values),
                SheetsRequest::Write {
                    spreadsheet_id,
                    range,
                    values,
                } => backend
                    .write(&spreadsheet_id, &range, values)
                    .await
                    .map(SheetsResponse::Updated),
                SheetsRequest::Append {
                    spreadsheet_id,
                    range,
                    values,
                } => backend
                    .append(&spreadsheet_id, &range, values)
                    .await
                    .map(SheetsResponse::Appended),
                SheetsRequest::Clear {
                    spreadsheet_id,
                    range,
                } => backend
                    .clear(&spreadsheet_id, &range)
                    .await
                    .map(SheetsResponse::Cleared),
                SheetsRequest::BatchRead {
                    spreadsheet_id,
                    ranges,
                } => backend
                    .batch_read(&spreadsheet_id, &ranges)
                    .await
                    .map(SheetsResponse::BatchValues),
                SheetsRequest::BatchWrite {
                    spreadsheet_id,
                    entries,
                } => backend
                    .batch_write(&spreadsheet_id, entries)
                    .await
                    .map(SheetsResponse::BatchUpdated),
                SheetsRequest::BatchClear {
                    spreadsheet_id,
                    ranges,
                } => backend
                    .batch_clear(&spreadsheet_id, &ranges)
                    .await
                    .map(SheetsResponse::BatchCleared),
                SheetsRequest::GetMetadata { spreadsheet_id } => backend
                    .get_metadata(&spreadsheet_id)
                    .await
                    .map(SheetsResponse::Metadata),
            };
            resp.map_err(SheetsError::from)
        })
    }
}

#[derive(Debug, Default)]
struct SpreadsheetState {
    title: String,
    grids: HashMap<String, CellGrid>,
}

/// In-memory backend for tests and offline use. Grids are stored per
/// requested range key; `append` extends the grid under its range,
/// `clear` empties it but keeps the key.
#[derive(Debug, Default)]
pub struct InMemorySheets {
    inner: StdMutex<HashMap<String, SpreadsheetState>>,
}

impl InMemorySheets {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a spreadsheet. Operations against unknown ids fail with
    /// a 404, like the remote service.
    pub fn with_spreadsheet(self, spreadsheet_id: impl Into<String>, title: impl Into<String>) -> Self {
        self.inner.lock().expect("sheets lock poisoned").insert(
            spreadsheet_id.into(),
            SpreadsheetState {
                title: title.into(),
                grids: HashMap::new(),
            },
        );
        self
    }

    fn with_state<R>(
        &self,
        spreadsheet_id: &str,
        f: impl FnOnce(&mut SpreadsheetState) -> R,
    ) -> TransportResult<R> {
        let mut inner = self.inner.lock().expect("sheets lock poisoned");
        match inner.get_mut(spreadsheet_id) {
            Some(state) => Ok(f(state)),
            None => Err(TransportError::status(
                404,
                format!("spreadsheet {spreadsheet_id} not found"),
            )),
        }
    }
}

#[async_trait]
impl SheetsBackend for InMemorySheets {
    async fn read(&self, spreadsheet_id: &str, range: &str) -> TransportResult<ValueRange> {
        self.with_state(spreadsheet_id, |state| {
            ValueRange::new(range, state.grids.get(range).cloned().unwrap_or_default())
        })
    }

    async fn write(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> TransportResult<UpdateSummary> {
        self.with_state(spreadsheet_id, |state| {
            let summary = UpdateSummary::for_values(spreadsheet_id, range, &values);
            state.grids.insert(range.to_string(), values);
            summary
        })
    }

    async fn append(
        &self,
        spreadsheet_id: &str,
        range: &str,
        values: CellGrid,
    ) -> TransportResult<AppendSummary> {
        self.with_state(spreadsheet_id, |state| {
            let summary = UpdateSummary::for_values(spreadsheet_id, range, &values);
            state
                .grids
                .entry(range.to_string())
                .or_default()
                .extend(values);
            AppendSummary {
                spreadsheet_id: spreadsheet_id.to_string(),
                table_range: range.to_string(),
                updates: summary,
            }
        })
    }

    async fn clear(&self, spreadsheet_id: &str, range: &str) -> TransportResult<ClearedRange> {
        self.with_state(spreadsheet_id, |state| {
            if let Some(grid) = state.grids.get_mut(range) {
                grid.clear();
            }
            ClearedRange {
                spreadsheet_id: spreadsheet_id.to_string(),
                cleared_range: range.to_string(),
            }
        })
    }

    async fn batch_read(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
    ) -> TransportResult<Vec<ValueRange>> {
        self.with_state(spreadsheet_id, |state| {
            ranges
                .iter()
                .map(|r| ValueRange::new(r, state.grids.get(r).cloned().unwrap_or_default()))
                .collect()
        })
    }

    async fn batch_write(
        &self,
        spreadsheet_id: &str,
        entries: Vec<ValueRange>,
    ) -> TransportResult<BatchUpdateSummary> {
        self.with_state(spreadsheet_id, |state| {
            let responses: Vec<UpdateSummary> = entries
                .into_iter()
                .map(|entry| {
                    let summary =
                        UpdateSummary::for_values(spreadsheet_id, &entry.range, &entry.values);
                    state.grids.insert(entry.range, entry.values);
                    summary
                })
                .collect();
            BatchUpdateSummary {
                spreadsheet_id: spreadsheet_id.to_string(),
                total_updated_cells: responses.iter().map(|r| r.updated_cells).sum(),
                responses,
            }
        })
    }

    async fn batch_clear(
        &self,
        spreadsheet_id: &str,
        ranges: &[String],
    ) -> TransportResult<Vec<ClearedRange>> {
        self.with_state(spreadsheet_id, |state| {
            ranges
                .iter()
                .map(|r| {
                    if let Some(grid) = state.grids.get_mut(r) {
                        grid.clear();
                    }
                    ClearedRange {
                        spreadsheet_id: spreadsheet_id.to_string(),
                        cleared_range: r.clone(),
                    }
                })
                .collect()
        })
    }

    async fn get_metadata(&self, spreadsheet_id: &str) -> TransportResult<SpreadsheetMetadata> {
        self.with_state(spreadsheet_id, |state| {
            let sheet_names: BTreeSet<String> = state
                .grids
                .keys()
                .map(|range| match range.split_once('!') {
                    Some((sheet, _)) => sheet.to_string(),
                    None => "Sheet1".to_string(),
                })
                .collect();
            let names = if sheet_names.is_empty() {
                BTreeSet::from(["Sheet1".to_string()])
            } else {
                sheet_names
            };
            SpreadsheetMetadata {
                spreadsheet_id: spreadsheet_id.to_string(),
                title: state.title.clone(),
                sheets: names
                    .into_iter()
                    .enumerate()
                    .map(|(i, title)| SheetProperties {
                        sheet_id: i as u64,
                        title,
                        row_count: 1000,
                        column_count: 26,
                    })
                    .collect(),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn backend() -> InMemorySheets {
        InMemorySheets::new().with_spreadsheet("s1", "Budget")
    }

    #[tokio::test]
    async fn unknown_spreadsheet_is_a_404() {
        let sheets = backend();
        let err = sheets.read("nope", "A1").await.unwrap_err();
        assert!(matches!(err, TransportError::Status { code: 404, .. }));
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let sheets = backend();
        let summary = sheets
            .write("s1", "Sheet1!A1:B1", vec![vec![json!(1), json!(2)]])
            .await
            .unwrap();
        assert_eq!(summary.updated_cells, 2);
        let values = sheets.read("s1", "Sheet1!A1:B1").await.unwrap();
        assert_eq!(values.values, vec![vec![json!(1), json!(2)]]);
    }

    #[tokio::test]
    async fn read_of_untouched_range_is_empty() {
        let sheets = backend();
        let values = sheets.read("s1", "Z100").await.unwrap();
        assert!(values.values.is_empty());
    }

    #[tokio::test]
    async fn append_accumulates_rows() {
        let sheets = backend();
        sheets
            .append("s1", "Log!A1", vec![vec![json!("first")]])
            .await
            .unwrap();
        let summary = sheets
            .append("s1", "Log!A1", vec![vec![json!("second")]])
            .await
            .unwrap();
        assert_eq!(summary.updates.updated_rows, 1);
        let values = sheets.read("s1", "Log!A1").await.unwrap();
        assert_eq!(values.values.len(), 2);
    }

    #[tokio::test]
    async fn clear_empties_but_keeps_the_range() {
        let sheets = backend();
        sheets
            .write("s1", "A1:B1", vec![vec![json!("x")]])
            .await
            .unwrap();
        sheets.clear("s1", "A1:B1").await.unwrap();
        let values = sheets.read("s1", "A1:B1").await.unwrap();
        assert!(values.values.is_empty());
    }

    #[tokio::test]
    async fn metadata_lists_sheets_from_ranges() {
        let sheets = backend();
        sheets
            .write("s1", "Budget!A1", vec![vec![json!(1)]])
            .await
            .unwrap();
        sheets
            .write("s1", "Log!A1", vec![vec![json!(2)]])
            .await
            .unwrap();
        let metadata = sheets.get_metadata("s1").await.unwrap();
        assert_eq!(metadata.title, "Budget");
        let titles: Vec<&str> = metadata.sheets.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["Budget", "Log"]);
    }

    #[tokio::test]
    async fn batch_write_totals_cells() {
        let sheets = backend();
        let summary = sheets
            .batch_write(
                "s1",
                vec![
                    ValueRange::new("A1", vec![vec![json!(1)]]),
                    ValueRange::new("B1", vec![vec![json!(2), json!(3)]]),
                ],
            )
            .await
            .unwrap();
        assert_eq!(summary.total_updated_cells, 3);
        assert_eq!(summary.responses.len(), 2);
    }
}
