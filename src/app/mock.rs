//! In-memory stand-ins for the backend and title source, recording every call.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use uuid::Uuid;

use crate::model::{now_micros, Bookmark, BookmarkId, NewBookmark};
use crate::resolver::ResolveError;
use crate::scrape::PageTitleSource;
use crate::storage::{BackendError, BookmarkBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    FetchAll,
    Insert(NewBookmark),
    Delete(BookmarkId),
    PageTitle(String),
}

#[derive(Default)]
pub struct MockBackend {
    rows: Mutex<Vec<Bookmark>>,
    calls: Mutex<Vec<MockCall>>,
    insert_error: Mutex<Option<String>>,
    delete_error: Mutex<Option<String>>,
    delete_gate: Option<Arc<Notify>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(self, rows: Vec<Bookmark>) -> Self {
        *self.rows.lock() = rows;
        self
    }

    pub fn with_insert_error(self, message: &str) -> Self {
        *self.insert_error.lock() = Some(message.to_string());
        self
    }

    pub fn with_delete_error(self, message: &str) -> Self {
        *self.delete_error.lock() = Some(message.to_string());
        self
    }

    /// Deletes wait until the returned handle is notified.
    pub fn with_delete_gate(mut self) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        self.delete_gate = Some(Arc::clone(&gate));
        (self, gate)
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }

    pub fn rows(&self) -> Vec<Bookmark> {
        self.rows.lock().clone()
    }

    pub fn push_row(&self, row: Bookmark) {
        self.rows.lock().insert(0, row);
    }

    fn record(&self, call: MockCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl BookmarkBackend for MockBackend {
    async fn fetch_all(&self) -> Result<Vec<Bookmark>, BackendError> {
        self.record(MockCall::FetchAll);
        Ok(self.rows())
    }

    async fn insert(&self, bookmark: NewBookmark) -> Result<Bookmark, BackendError> {
        self.record(MockCall::Insert(bookmark.clone()));
        if let Some(message) = self.insert_error.lock().take() {
            return Err(BackendError::Storage(anyhow::anyhow!(message)));
        }
        let row = Bookmark {
            id: Uuid::new_v4(),
            title: bookmark.title,
            url: bookmark.url,
            created_at: now_micros(),
        };
        self.push_row(row.clone());
        Ok(row)
    }

    async fn delete(&self, id: BookmarkId) -> Result<bool, BackendError> {
        self.record(MockCall::Delete(id));
        if let Some(gate) = &self.delete_gate {
            gate.notified().await;
        }
        if let Some(message) = self.delete_error.lock().take() {
            return Err(BackendError::Storage(anyhow::anyhow!(message)));
        }
        let mut rows = self.rows.lock();
        let before = rows.len();
        rows.retain(|row| row.id != id);
        Ok(rows.len() != before)
    }
}

pub struct MockTitles {
    answer: Result<Option<String>, ResolveError>,
    calls: Mutex<Vec<MockCall>>,
}

impl MockTitles {
    pub fn answering(answer: Result<Option<String>, ResolveError>) -> Self {
        Self {
            answer,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl PageTitleSource for MockTitles {
    async fn page_title(&self, url: &str) -> Result<Option<String>, ResolveError> {
        self.calls.lock().push(MockCall::PageTitle(url.to_string()));
        self.answer.clone()
    }
}
