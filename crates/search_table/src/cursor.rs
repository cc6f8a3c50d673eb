//! Lazy, page-at-a-time cursor over query results.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::connection::ClientHandle;
use crate::error::{ConnectorError, Result};
use crate::gateway::{Document, QueryRequest};
use crate::metrics::ConnectorMetrics;
use crate::row::{decode_row, ColumnSpec, Row};

/// Position of a [`ScanCursor`] in its fetch cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Nothing fetched yet.
    Idle,
    /// A page request is in flight.
    Fetching,
    /// Buffered rows are available.
    HasBuffer,
    /// The last page was short; no further fetches.
    Exhausted,
    Closed,
}

/// Streams rows for one table and filter, fetching a page whenever the
/// buffer runs dry.
///
/// Not shareable between tasks without external synchronization; every
/// method takes `&mut self`.
pub struct ScanCursor {
    client: Option<ClientHandle>,
    collection: String,
    filter: String,
    columns: Vec<ColumnSpec>,
    page_size: usize,
    max_refills_per_poll: usize,
    offset: usize,
    buffer: Vec<Document>,
    position: usize,
    last_page_len: Option<usize>,
    state: CursorState,
    pages_fetched: u64,
    rows_returned: u64,
    metrics: Arc<ConnectorMetrics>,
}

impl ScanCursor {
    pub(crate) fn new(
        client: ClientHandle,
        collection: String,
        filter: &str,
        columns: Vec<ColumnSpec>,
        page_size: usize,
        max_refills_per_poll: usize,
        metrics: Arc<ConnectorMetrics>,
    ) -> Self {
        Self {
            client: Some(client),
            collection,
            filter: filter.to_string(),
            columns,
            page_size: page_size.max(1),
            max_refills_per_poll: max_refills_per_poll.max(1),
            offset: 0,
            buffer: Vec::new(),
            position: 0,
            last_page_len: None,
            state: CursorState::Idle,
            pages_fetched: 0,
            rows_returned: 0,
            metrics,
        }
    }

    /// Whether another row is available, fetching pages as needed.
    ///
    /// A failed fetch closes the cursor and surfaces as
    /// [`ConnectorError::Scan`]; it is not retried. Every fetch either
    /// buffers rows or ends the scan, so one call fetches at most once;
    /// `max_refills_per_poll` caps the loop should that ever change.
    pub async fn has_next(&mut self) -> Result<bool> {
        if self.state == CursorState::Closed {
            return Err(ConnectorError::CursorClosed);
        }

        let mut refills = 0;
        loop {
            if self.position < self.buffer.len() {
                self.state = CursorState::HasBuffer;
                return Ok(true);
            }
            if self
                .last_page_len
                .is_some_and(|len| len < self.page_size)
            {
                self.state = CursorState::Exhausted;
                self.buffer.clear();
                self.position = 0;
                return Ok(false);
            }
            if refills == self.max_refills_per_poll {
                return Err(ConnectorError::Scan(format!(
                    "no rows after {refills} page fetches on '{}'",
                    self.collection
                )));
            }
            self.fetch_page().await?;
            refills += 1;
        }
    }

    /// Decodes the next buffered row. Call [`has_next`](Self::has_next)
    /// first; without a buffered row this fails with a scan error.
    ///
    /// A row that does not decode closes the cursor.
    pub fn next(&mut self) -> Result<Row> {
        if self.state == CursorState::Closed {
            return Err(ConnectorError::CursorClosed);
        }
        let Some(document) = self.buffer.get(self.position) else {
            return Err(ConnectorError::Scan(
                "next() called without a buffered row".to_string(),
            ));
        };
        let row = match decode_row(document, &self.columns) {
            Ok(row) => row,
            Err(err) => {
                self.metrics.record_scan_failure();
                warn!(
                    collection = %self.collection,
                    row = self.rows_returned,
                    error = %err,
                    "undecodable row; closing cursor"
                );
                self.close();
                return Err(err);
            }
        };
        self.position += 1;
        self.rows_returned += 1;
        Ok(row)
    }

    /// Drops the client reference and buffered rows. Idempotent.
    pub fn close(&mut self) {
        if self.state != CursorState::Closed {
            debug!(
                collection = %self.collection,
                rows = self.rows_returned,
                pages = self.pages_fetched,
                "closed scan cursor"
            );
        }
        self.client = None;
        self.buffer = Vec::new();
        self.position = 0;
        self.state = CursorState::Closed;
    }

    /// Drains the remaining rows and closes the cursor.
    pub async fn collect_rows(mut self) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        while self.has_next().await? {
            rows.push(self.next()?);
        }
        self.close();
        Ok(rows)
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn rows_returned(&self) -> u64 {
        self.rows_returned
    }

    pub fn pages_fetched(&self) -> u64 {
        self.pages_fetched
    }

    async fn fetch_page(&mut self) -> Result<()> {
        self.state = CursorState::Fetching;
        let request = QueryRequest {
            filter: self.filter.clone(),
            offset: self.offset,
            rows: self.page_size,
            fields: self.columns.iter().map(|c| c.name.clone()).collect(),
        };

        let fetched = match &self.client {
            Some(client) => match client.gateway() {
                Ok(gateway) => gateway
                    .query(&self.collection, &request)
                    .await
                    .map_err(|err| format!("{err:#}")),
                Err(err) => Err(err.to_string()),
            },
            None => Err("cursor has no client".to_string()),
        };
        let page = match fetched {
            Ok(page) => page,
            Err(message) => {
                self.metrics.record_scan_failure();
                warn!(
                    collection = %self.collection,
                    offset = self.offset,
                    error = %message,
                    "scan page fetch failed; closing cursor"
                );
                self.close();
                return Err(ConnectorError::Scan(format!(
                    "page fetch at offset {} on '{}' failed: {message}",
                    request.offset, self.collection
                )));
            }
        };

        let rows = page.docs.len();
        self.pages_fetched += 1;
        self.metrics.record_scan_page(rows as u64);
        debug!(
            collection = %self.collection,
            offset = self.offset,
            rows,
            num_found = page.num_found,
            "fetched scan page"
        );
        self.offset += rows;
        self.last_page_len = Some(rows);
        self.buffer = page.docs;
        self.position = 0;
        self.state = if rows > 0 {
            CursorState::HasBuffer
        } else {
            CursorState::Exhausted
        };
        Ok(())
    }
}
