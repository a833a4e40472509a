use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::StorageHandle;
use crate::realtime::{ChangeFeed, ChangeKind, RawChange, BOOKMARKS_TABLE};

const BATCH: usize = 256;

/// One row of the `bookmark_changes` log written by the table triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedChange {
    pub seq: i64,
    pub event_type: String,
    pub record: String,
}

impl LoggedChange {
    pub fn to_raw(&self) -> Result<RawChange> {
        let record: Value = serde_json::from_str(&self.record)
            .with_context(|| format!("decoding change log entry {}", self.seq))?;
        let (new, old) = match self.event_type.parse::<ChangeKind>() {
            Ok(ChangeKind::Delete) => (None, Some(record)),
            _ => (Some(record), None),
        };
        Ok(RawChange {
            event_type: self.event_type.clone(),
            table: BOOKMARKS_TABLE.to_string(),
            new,
            old,
        })
    }
}

/// Tails the change log and republishes every new entry on a [`ChangeFeed`].
/// Writes from any process sharing the database file show up here.
pub struct ChangeLogPump {
    storage: StorageHandle,
    feed: ChangeFeed,
    last_seq: i64,
    interval: Duration,
    retention_secs: i64,
}

impl ChangeLogPump {
    /// Starts from the current end of the log; history is the snapshot's job.
    pub fn new(
        storage: StorageHandle,
        feed: ChangeFeed,
        interval: Duration,
        retention_hours: u64,
    ) -> Result<Self> {
        let last_seq = storage.latest_change_seq()?;
        Ok(Self {
            storage,
            feed,
            last_seq,
            interval,
            retention_secs: (retention_hours as i64).saturating_mul(3_600),
        })
    }

    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    /// Publishes everything logged since the last poll. Returns how many
    /// entries were forwarded.
    pub fn poll_once(&mut self) -> Result<usize> {
        let mut forwarded = 0;
        loop {
            let batch = self.storage.changes_since(self.last_seq, BATCH)?;
            let fetched = batch.len();
            for entry in batch {
                self.last_seq = entry.seq;
                match entry.to_raw() {
                    Ok(change) => {
                        self.feed.publish(change);
                        forwarded += 1;
                    }
                    Err(err) => {
                        tracing::warn!(seq = entry.seq, error = %err, "skipping unreadable change log entry")
                    }
                }
            }
            if fetched < BATCH {
                return Ok(forwarded);
            }
        }
    }

    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut ticks: u64 = 0;
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                ticks = ticks.wrapping_add(1);
                let prune = self.retention_secs > 0 && ticks % 1_000 == 1;
                let outcome = tokio::task::spawn_blocking(move || {
                    let polled = self.poll_once();
                    if prune {
                        if let Err(err) = self.storage.prune_changes(self.retention_secs) {
                            tracing::warn!(error = %err, "failed to prune change log");
                        }
                    }
                    (self, polled)
                })
                .await;
                match outcome {
                    Ok((pump, polled)) => {
                        self = pump;
                        match polled {
                            Ok(0) => {}
                            Ok(count) => tracing::trace!(count, seq = self.last_seq, "forwarded changes"),
                            Err(err) => tracing::warn!(error = %err, "change log poll failed"),
                        }
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "change log pump task failed");
                        break;
                    }
                }
            }
            tracing::debug!("change log pump stopped");
        })
    }
}
