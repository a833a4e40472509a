use anyhow::{Context, Result};
use rusqlite::Connection;

pub fn apply(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS bookmarks (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            url TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS bookmarks_created_at
            ON bookmarks (created_at DESC);

        CREATE TABLE IF NOT EXISTS bookmark_changes (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            event_type TEXT NOT NULL,
            record TEXT NOT NULL,
            logged_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );

        CREATE TRIGGER IF NOT EXISTS bookmarks_ai AFTER INSERT ON bookmarks BEGIN
            INSERT INTO bookmark_changes (event_type, record)
            VALUES ('INSERT', json_object(
                'id', new.id,
                'title', new.title,
                'url', new.url,
                'created_at', new.created_at
            ));
        END;

        CREATE TRIGGER IF NOT EXISTS bookmarks_au AFTER UPDATE ON bookmarks BEGIN
            INSERT INTO bookmark_changes (event_type, record)
            VALUES ('UPDATE', json_object(
                'id', new.id,
                'title', new.title,
                'url', new.url,
                'created_at', new.created_at
            ));
        END;

        CREATE TRIGGER IF NOT EXISTS bookmarks_ad AFTER DELETE ON bookmarks BEGIN
            INSERT INTO bookmark_changes (event_type, record)
            VALUES ('DELETE', json_object('id', old.id));
        END;
        "#,
    )
    .context("applying schema migrations")?;
    Ok(())
}
