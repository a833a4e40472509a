use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::config::DbConfig;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::config::{ConfigPaths, StorageOptions};
use crate::model::{format_created_at, now_micros, parse_created_at, Bookmark, BookmarkId, NewBookmark};

mod changes;
mod schema;

pub use changes::{ChangeLogPump, LoggedChange};

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("storage failure: {0:#}")]
    Storage(#[from] anyhow::Error),
    #[error("storage task did not complete: {0}")]
    TaskJoin(String),
}

/// The persistent store the client reconciles against.
#[async_trait]
pub trait BookmarkBackend: Send + Sync {
    /// Every bookmark, newest first.
    async fn fetch_all(&self) -> Result<Vec<Bookmark>, BackendError>;

    async fn insert(&self, bookmark: NewBookmark) -> Result<Bookmark, BackendError>;

    /// Returns whether a row was removed. Deleting an unknown id is not an error.
    async fn delete(&self, id: BookmarkId) -> Result<bool, BackendError>;
}

#[derive(Clone)]
pub struct StorageHandle {
    db_path: Arc<PathBuf>,
    options: Arc<StorageOptions>,
}

impl StorageHandle {
    pub fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&*self.db_path)
            .with_context(|| format!("opening database {}", self.db_path.display()))?;
        prepare_connection(&conn, &self.options)?;
        Ok(conn)
    }

    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.connect()?;
        f(&conn)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }

    pub fn fetch_bookmarks(&self) -> Result<Vec<Bookmark>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, url, created_at
                 FROM bookmarks
                 ORDER BY created_at DESC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("querying bookmarks")?;
            rows.into_iter()
                .map(|(id, title, url, created_at)| decode_row(&id, title, url, &created_at))
                .collect()
        })
    }

    pub fn fetch_bookmark(&self, id: BookmarkId) -> Result<Option<Bookmark>> {
        self.with_connection(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, title, url, created_at FROM bookmarks WHERE id = ?1",
                    params![id.to_string()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, String>(3)?,
                        ))
                    },
                )
                .optional()
                .context("querying bookmark by id")?;
            row.map(|(id, title, url, created_at)| decode_row(&id, title, url, &created_at))
                .transpose()
        })
    }

    pub fn insert_bookmark(&self, new: &NewBookmark) -> Result<Bookmark> {
        let bookmark = Bookmark {
            id: Uuid::new_v4(),
            title: new.title.clone(),
            url: new.url.clone(),
            created_at: now_micros(),
        };
        self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO bookmarks (id, title, url, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![
                    bookmark.id.to_string(),
                    bookmark.title,
                    bookmark.url,
                    format_created_at(bookmark.created_at)
                ],
            )
            .context("inserting bookmark")?;
            Ok(())
        })?;
        tracing::debug!(id = %bookmark.id, url = %bookmark.url, "bookmark stored");
        Ok(bookmark)
    }

    pub fn delete_bookmark(&self, id: BookmarkId) -> Result<bool> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM bookmarks WHERE id = ?1",
                    params![id.to_string()],
                )
                .context("deleting bookmark")?;
            Ok(removed > 0)
        })
    }

    pub fn latest_change_seq(&self) -> Result<i64> {
        self.with_connection(|conn| {
            let seq: Option<i64> = conn
                .query_row("SELECT MAX(seq) FROM bookmark_changes", [], |row| row.get(0))
                .context("reading change log position")?;
            Ok(seq.unwrap_or(0))
        })
    }

    pub fn changes_since(&self, seq: i64, limit: usize) -> Result<Vec<LoggedChange>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT seq, event_type, record
                 FROM bookmark_changes
                 WHERE seq > ?1
                 ORDER BY seq
                 LIMIT ?2",
            )?;
            let changes = stmt
                .query_map(params![seq, limit as i64], |row| {
                    Ok(LoggedChange {
                        seq: row.get(0)?,
                        event_type: row.get(1)?,
                        record: row.get(2)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()
                .context("reading change log")?;
            Ok(changes)
        })
    }

    /// Drops change-log entries logged more than `retention_secs` ago.
    pub fn prune_changes(&self, retention_secs: i64) -> Result<usize> {
        self.with_connection(|conn| {
            let removed = conn
                .execute(
                    "DELETE FROM bookmark_changes
                     WHERE logged_at <= CAST(strftime('%s', 'now') AS INTEGER) - ?1",
                    params![retention_secs],
                )
                .context("pruning change log")?;
            Ok(removed)
        })
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T, BackendError>
    where
        F: FnOnce(StorageHandle) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let handle = self.clone();
        tokio::task::spawn_blocking(move || f(handle))
            .await
            .map_err(|err| BackendError::TaskJoin(err.to_string()))?
            .map_err(BackendError::from)
    }
}

#[async_trait]
impl BookmarkBackend for StorageHandle {
    async fn fetch_all(&self) -> Result<Vec<Bookmark>, BackendError> {
        self.blocking(|storage| storage.fetch_bookmarks()).await
    }

    async fn insert(&self, bookmark: NewBookmark) -> Result<Bookmark, BackendError> {
        self.blocking(move |storage| storage.insert_bookmark(&bookmark))
            .await
    }

    async fn delete(&self, id: BookmarkId) -> Result<bool, BackendError> {
        self.blocking(move |storage| storage.delete_bookmark(id)).await
    }
}

fn decode_row(id: &str, title: String, url: String, created_at: &str) -> Result<Bookmark> {
    let id = Uuid::parse_str(id).with_context(|| format!("bookmark id {id:?} is not a uuid"))?;
    let created_at = parse_created_at(created_at)
        .with_context(|| format!("bookmark {id} has unreadable created_at {created_at:?}"))?;
    Ok(Bookmark {
        id,
        title,
        url,
        created_at,
    })
}

pub fn init(paths: &ConfigPaths, storage: &StorageOptions) -> Result<StorageHandle> {
    let db_path = if storage.database_path.as_os_str().is_empty() {
        paths.database_path.clone()
    } else {
        storage.database_path.clone()
    };
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating data directory {}", parent.display()))?;
    }
    let conn = Connection::open(&db_path)
        .with_context(|| format!("opening database {}", db_path.display()))?;
    prepare_connection(&conn, storage)?;
    schema::apply(&conn)?;
    tracing::info!(path = %db_path.display(), "bookmark database ready");
    Ok(StorageHandle {
        db_path: Arc::new(db_path),
        options: Arc::new(storage.clone()),
    })
}

fn prepare_connection(conn: &Connection, storage: &StorageOptions) -> Result<()> {
    conn.set_db_config(DbConfig::SQLITE_DBCONFIG_ENABLE_FKEY, true)
        .context("enabling foreign keys")?;
    conn.pragma_update(None, "journal_mode", "WAL")
        .context("setting journal_mode=WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")
        .context("setting synchronous=NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        storage.wal_autocheckpoint.to_string(),
    )
    .context("setting wal_autocheckpoint")?;
    conn.busy_timeout(std::time::Duration::from_millis(storage.busy_timeout_ms))
        .context("setting busy timeout")?;
    Ok(())
}
