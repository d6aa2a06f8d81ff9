//! Mock [`ApiClient`] implementation for unit and integration tests.
//!
//! Uses a builder pattern to script pages (including mid-stream failures)
//! per operation type and canned responses for point operations. Scripted
//! outcomes are consumed in order, so tests can model a provider that fails
//! on its third page and a replacement that takes over.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::json;

use crate::cancel::CancelToken;
use crate::model::{Cursor, CursorPrimary, NormalizedRecord, RecordStatus};

use super::api::{
    ApiClient, Page, PageRequest, ProviderError, ProviderErrorKind, ProviderRequest,
    ProviderResponse,
};
use super::registry::ReplayWindow;

type PageOutcome = Result<Page, ProviderError>;

pub struct MockProvider {
    name: String,
    replay_window: ReplayWindow,
    /// Scripted page outcomes keyed by operation type, consumed in order.
    pages: Mutex<HashMap<String, Vec<PageOutcome>>>,
    page_calls: AtomicUsize,
    responses: Mutex<HashMap<String, Result<ProviderResponse, ProviderError>>>,
    /// Addresses passed to `fetch_page`, for gap-scan assertions.
    seen_addresses: Mutex<Vec<String>>,
}

impl MockProvider {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            replay_window: ReplayWindow::default(),
            pages: Mutex::new(HashMap::new()),
            page_calls: AtomicUsize::new(0),
            responses: Mutex::new(HashMap::new()),
            seen_addresses: Mutex::new(Vec::new()),
        }
    }

    pub fn with_replay_window(mut self, window: ReplayWindow) -> Self {
        self.replay_window = window;
        self
    }

    /// Script the next page outcome for an operation type.
    pub fn push_page(&self, operation_type: &str, outcome: PageOutcome) {
        self.pages
            .lock()
            .expect("mock lock")
            .entry(operation_type.to_string())
            .or_default()
            .push(outcome);
    }

    /// Can a canned response for a point operation, keyed by operation name.
    pub fn set_response(&self, operation: &str, response: Result<ProviderResponse, ProviderError>) {
        self.responses
            .lock()
            .expect("mock lock")
            .insert(operation.to_string(), response);
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn seen_addresses(&self) -> Vec<String> {
        self.seen_addresses.lock().expect("mock lock").clone()
    }

    fn err(&self, operation: &str, kind: ProviderErrorKind, message: &str) -> ProviderError {
        ProviderError::new(&self.name, operation, kind, message)
    }
}

/// Build a minimal normalized record for scripted pages.
pub fn mock_record(external_id: &str, operation_type: &str, timestamp_ms: i64) -> NormalizedRecord {
    NormalizedRecord {
        external_id: external_id.to_string(),
        provider_name: "mock".to_string(),
        timestamp_ms,
        status: RecordStatus::Success,
        from: None,
        to: None,
        movements: Vec::new(),
        fees: Vec::new(),
        operation_type: operation_type.to_string(),
        transaction_hash: Some(external_id.to_string()),
        block_height: None,
        source_address: None,
        transaction_type_hint: None,
        extensions: serde_json::Value::Null,
    }
}

/// A scripted page of records with a block-number cursor.
pub fn mock_page(
    operation_type: &str,
    ids: &[&str],
    next_block: u64,
    is_complete: bool,
) -> Page {
    let normalized: Vec<NormalizedRecord> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| mock_record(id, operation_type, 1_700_000_000_000 + i as i64))
        .collect();
    let raw = ids.iter().map(|id| json!({"tx": id})).collect();
    let mut cursor = Cursor::new(CursorPrimary::block_number(next_block), "mock");
    cursor.is_complete = is_complete;
    cursor.total_fetched = ids.len() as u64;
    Page {
        raw,
        normalized,
        next_cursor: cursor,
        is_complete,
    }
}

#[async_trait]
impl ApiClient for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch_page(
        &self,
        request: &PageRequest,
        _cancel: &CancelToken,
    ) -> Result<Page, ProviderError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        self.seen_addresses
            .lock()
            .expect("mock lock")
            .push(request.address.clone());

        let mut pages = self.pages.lock().expect("mock lock");
        let queue = pages.get_mut(&request.operation_type);
        match queue {
            Some(queue) if !queue.is_empty() => queue.remove(0),
            _ => {
                // Unscripted operations behave as an empty, complete stream
                // (the provider knows nothing about this address).
                let mut cursor = request
                    .cursor
                    .clone()
                    .unwrap_or_else(|| Cursor::new(CursorPrimary::block_number(0), &self.name));
                cursor.is_complete = true;
                Ok(Page {
                    raw: Vec::new(),
                    normalized: Vec::new(),
                    next_cursor: cursor,
                    is_complete: true,
                })
            }
        }
    }

    async fn execute(
        &self,
        request: &ProviderRequest,
        _cancel: &CancelToken,
    ) -> Result<ProviderResponse, ProviderError> {
        let responses = self.responses.lock().expect("mock lock");
        match responses.get(request.operation_name()) {
            Some(outcome) => outcome.clone(),
            None => Err(self.err(
                request.operation_name(),
                ProviderErrorKind::NotSupported,
                "no scripted response",
            )),
        }
    }

    fn apply_replay_window(&self, cursor: &Cursor) -> Cursor {
        let mut adjusted = cursor.clone();
        match cursor.primary.kind {
            crate::model::CursorKind::BlockNumber => {
                if let Some(block) = cursor.primary.as_u64() {
                    adjusted.primary =
                        CursorPrimary::block_number(block.saturating_sub(self.replay_window.blocks));
                }
            }
            crate::model::CursorKind::Timestamp => {
                if let Some(ts) = cursor.primary.as_i64() {
                    adjusted.primary =
                        CursorPrimary::timestamp(ts.saturating_sub(self.replay_window.millis));
                }
            }
            _ => {}
        }
        adjusted
    }
}
