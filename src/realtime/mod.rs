use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Bookmark, BookmarkId};

pub const BOOKMARKS_TABLE: &str = "bookmarks";

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// Row-level change as delivered by the feed, before any validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawChange {
    pub event_type: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

impl RawChange {
    pub fn insert(bookmark: &Bookmark) -> Self {
        Self {
            event_type: ChangeKind::Insert.to_string(),
            table: BOOKMARKS_TABLE.to_string(),
            new: serde_json::to_value(bookmark).ok(),
            old: None,
        }
    }

    pub fn delete(id: BookmarkId) -> Self {
        Self {
            event_type: ChangeKind::Delete.to_string(),
            table: BOOKMARKS_TABLE.to_string(),
            new: None,
            old: Some(serde_json::json!({ "id": id })),
        }
    }

    pub fn parse(&self) -> Result<ChangeEvent, EventError> {
        let Ok(kind) = ChangeKind::from_str(&self.event_type) else {
            return Ok(ChangeEvent::Ignored(self.event_type.clone()));
        };
        match kind {
            ChangeKind::Insert => {
                let row = self.new.as_ref().ok_or(EventError::MissingRow(kind))?;
                row_id(row)?;
                let bookmark: Bookmark = serde_json::from_value(row.clone())
                    .map_err(|err| EventError::Decode(err.to_string()))?;
                Ok(ChangeEvent::Insert(bookmark))
            }
            ChangeKind::Delete => {
                let row = self.old.as_ref().ok_or(EventError::MissingRow(kind))?;
                Ok(ChangeEvent::Delete { id: row_id(row)? })
            }
            ChangeKind::Update => Ok(ChangeEvent::Ignored(self.event_type.clone())),
        }
    }
}

fn row_id(row: &Value) -> Result<BookmarkId, EventError> {
    let raw = row
        .get("id")
        .and_then(Value::as_str)
        .ok_or(EventError::MissingId)?;
    BookmarkId::parse_str(raw).map_err(|_| EventError::InvalidId(raw.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Insert(Bookmark),
    Delete { id: BookmarkId },
    Ignored(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventError {
    #[error("change payload has no row id")]
    MissingId,
    #[error("change payload id {0:?} is not a bookmark id")]
    InvalidId(String),
    #[error("{0} change carries no row")]
    MissingRow(ChangeKind),
    #[error("undecodable bookmark row: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("subscriber fell behind and missed {0} changes")]
    Lagged(u64),
}

/// In-process fan-out for row changes. Transports (the SQLite change-log pump,
/// tests) publish into it; sessions subscribe to it.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

struct FeedInner {
    sender: broadcast::Sender<RawChange>,
    subscribers: Mutex<HashMap<u64, String>>,
    next_id: AtomicU64,
}

impl ChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(FeedInner {
                sender,
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns how many subscriptions saw the change.
    pub fn publish(&self, change: RawChange) -> usize {
        self.inner.sender.send(change).unwrap_or(0)
    }

    pub fn subscribe(&self, table: &str) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().insert(id, table.to_string());
        tracing::debug!(subscription = id, table, "subscribed to change feed");
        Subscription {
            id,
            table: table.to_string(),
            receiver: self.inner.sender.subscribe(),
            feed: Arc::downgrade(&self.inner),
        }
    }

    pub fn active_subscriptions(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

/// A live subscription scoped to one table. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    table: String,
    receiver: broadcast::Receiver<RawChange>,
    feed: Weak<FeedInner>,
}

impl Subscription {
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Next change for this subscription's table. `None` once the feed is gone.
    pub async fn recv(&mut self) -> Option<Result<RawChange, ChannelError>> {
        loop {
            match self.receiver.recv().await {
                Ok(change) if change.table == self.table => return Some(Ok(change)),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    return Some(Err(ChannelError::Lagged(missed)))
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(feed) = self.feed.upgrade() {
            feed.subscribers.lock().remove(&self.id);
        }
        tracing::debug!(subscription = self.id, table = %self.table, "unsubscribed from change feed");
    }
}
