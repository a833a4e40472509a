use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::model::{Bookmark, BookmarkId, NewBookmark};
use crate::scrape::{PageTitleSource, UNTITLED_BOOKMARK};
use crate::storage::{BackendError, BookmarkBackend};
use crate::store::BookmarkStore;
use crate::validate::{validate_url, UrlError, INVALID_URL_ON_SUBMIT};

/// Generation counter raised after every successful mutation. Anything that
/// renders from a snapshot watches it and refetches.
#[derive(Clone)]
pub struct Revalidator {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for Revalidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Revalidator {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }

    pub fn notify(&self) {
        self.tx.send_modify(|generation| *generation += 1);
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }

    pub fn generation(&self) -> u64 {
        *self.tx.borrow()
    }
}

#[derive(Debug, Error)]
pub enum MutationError {
    #[error("{}", INVALID_URL_ON_SUBMIT)]
    InvalidUrl(#[source] UrlError),
    #[error("saving bookmark failed: {0}")]
    Backend(#[from] BackendError),
}

#[derive(Debug)]
pub struct DeleteOutcome {
    pub id: BookmarkId,
    pub result: Result<bool, String>,
}

#[derive(Clone)]
pub struct MutationSubmitter {
    backend: Arc<dyn BookmarkBackend>,
    titles: Arc<dyn PageTitleSource>,
    revalidator: Revalidator,
    completions: mpsc::UnboundedSender<DeleteOutcome>,
}

impl MutationSubmitter {
    pub fn new(
        backend: Arc<dyn BookmarkBackend>,
        titles: Arc<dyn PageTitleSource>,
        revalidator: Revalidator,
    ) -> (Self, mpsc::UnboundedReceiver<DeleteOutcome>) {
        let (completions, rx) = mpsc::unbounded_channel();
        (
            Self {
                backend,
                titles,
                revalidator,
                completions,
            },
            rx,
        )
    }

    pub fn revalidator(&self) -> &Revalidator {
        &self.revalidator
    }

    /// Saves a bookmark. The store is not touched; the new row arrives through
    /// the change feed or the next snapshot.
    pub async fn create(&self, title: Option<&str>, url: &str) -> Result<Bookmark, MutationError> {
        validate_url(url).map_err(MutationError::InvalidUrl)?;
        let title = match title.filter(|title| !title.trim().is_empty()) {
            Some(title) => title.to_string(),
            None => self.fallback_title(url).await,
        };

        let created = self
            .backend
            .insert(NewBookmark {
                title,
                url: url.to_string(),
            })
            .await
            .map_err(|err| {
                tracing::error!(%url, error = %err, "creating bookmark failed");
                MutationError::Backend(err)
            })?;
        tracing::info!(id = %created.id, title = %created.title, "bookmark created");
        self.revalidator.notify();
        Ok(created)
    }

    async fn fallback_title(&self, url: &str) -> String {
        match self.titles.page_title(url).await {
            Ok(Some(title)) => title,
            Ok(None) => UNTITLED_BOOKMARK.to_string(),
            Err(err) => {
                tracing::warn!(%url, error = %err, "scraping title failed, using placeholder");
                UNTITLED_BOOKMARK.to_string()
            }
        }
    }

    /// Removes the row from `store` immediately and deletes it on the backend
    /// in the background. The answer comes back on the completions queue.
    pub fn delete(&self, store: &mut BookmarkStore, id: BookmarkId) -> JoinHandle<()> {
        let was_visible = store.begin_delete(id);
        tracing::debug!(%id, was_visible, "optimistic delete");

        let backend = Arc::clone(&self.backend);
        let revalidator = self.revalidator.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = match backend.delete(id).await {
                Ok(removed) => {
                    if !removed {
                        tracing::debug!(%id, "backend had no such bookmark");
                    }
                    revalidator.notify();
                    Ok(removed)
                }
                Err(err) => {
                    tracing::error!(%id, error = %err, "deleting bookmark failed");
                    Err(err.to_string())
                }
            };
            let _ = completions.send(DeleteOutcome { id, result });
        })
    }
}

pub fn complete_delete(store: &mut BookmarkStore, outcome: DeleteOutcome) -> Option<String> {
    match outcome.result {
        Ok(_) => {
            store.finish_delete(outcome.id, Ok(()));
            None
        }
        Err(reason) => {
            store.finish_delete(outcome.id, Err(reason.clone()));
            Some(reason)
        }
    }
}
