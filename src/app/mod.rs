use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};

use crate::model::{Bookmark, BookmarkId};
use crate::realtime::{ChangeFeed, ChannelError, RawChange, Subscription, BOOKMARKS_TABLE};
use crate::scrape::PageTitleSource;
use crate::search::SearchState;
use crate::storage::{BackendError, BookmarkBackend};
use crate::store::{BookmarkStore, MergeStats, Notification};

mod actions;
#[cfg(test)]
pub(crate) mod mock;

pub use actions::{complete_delete, DeleteOutcome, MutationError, MutationSubmitter, Revalidator};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Notification(Notification),
    DeleteConfirmed { id: BookmarkId },
    DeleteFailed { id: BookmarkId, reason: String },
    SnapshotMerged(MergeStats),
    /// The debounced search query settled on a new value.
    ViewChanged,
    /// The change feed went away; no more realtime updates will arrive.
    ChannelClosed,
}

enum Wake {
    Change(Option<Result<RawChange, ChannelError>>),
    Deleted(DeleteOutcome),
    Revalidate,
    Snapshot(SnapshotReply),
    SearchDeadline,
}

struct SnapshotReply {
    request: u64,
    result: Result<Vec<Bookmark>, BackendError>,
}

/// One mounted bookmark list. Everything that changes the view goes through
/// `&mut self`, driven from a single task by `next_event`.
pub struct Session {
    store: BookmarkStore,
    search: SearchState,
    subscription: Option<Subscription>,
    backend: Arc<dyn BookmarkBackend>,
    submitter: MutationSubmitter,
    completions: mpsc::UnboundedReceiver<DeleteOutcome>,
    revalidate: watch::Receiver<u64>,
    snapshots_tx: mpsc::UnboundedSender<SnapshotReply>,
    snapshots_rx: mpsc::UnboundedReceiver<SnapshotReply>,
    refresh_in_flight: bool,
    requests: u64,
    reconcile: Option<(u64, HashSet<BookmarkId>)>,
}

impl Session {
    /// Subscribes to the feed, then loads the initial snapshot. Changes that
    /// land in between are buffered by the subscription and applied on top.
    pub async fn mount(
        feed: &ChangeFeed,
        backend: Arc<dyn BookmarkBackend>,
        titles: Arc<dyn PageTitleSource>,
        search_window: Duration,
    ) -> Result<Self, BackendError> {
        let subscription = feed.subscribe(BOOKMARKS_TABLE);
        let snapshot = backend.fetch_all().await?;
        tracing::info!(rows = snapshot.len(), "bookmark list mounted");

        let revalidator = Revalidator::new();
        let revalidate = revalidator.subscribe();
        let (submitter, completions) =
            MutationSubmitter::new(Arc::clone(&backend), titles, revalidator);
        let (snapshots_tx, snapshots_rx) = mpsc::unbounded_channel();

        Ok(Self {
            store: BookmarkStore::from_snapshot(snapshot),
            search: SearchState::new(search_window),
            subscription: Some(subscription),
            backend,
            submitter,
            completions,
            revalidate,
            snapshots_tx,
            snapshots_rx,
            refresh_in_flight: false,
            requests: 0,
            reconcile: None,
        })
    }

    pub fn store(&self) -> &BookmarkStore {
        &self.store
    }

    pub fn search(&self) -> &SearchState {
        &self.search
    }

    pub fn submitter(&self) -> &MutationSubmitter {
        &self.submitter
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }

    pub fn visible(&mut self) -> &[Arc<Bookmark>] {
        self.search.view(&self.store)
    }

    pub fn set_query(&mut self, raw: impl Into<String>) {
        self.search.set_query(raw, Instant::now());
    }

    pub fn flush_query(&mut self) -> bool {
        self.search.flush()
    }

    pub fn delete(&mut self, id: BookmarkId) {
        self.submitter.delete(&mut self.store, id);
    }

    pub fn restore_failed_delete(&mut self, id: BookmarkId) -> bool {
        self.store.restore_failed_delete(id)
    }

    pub fn refresh(&mut self) {
        if self.refresh_in_flight {
            return;
        }
        self.spawn_fetch();
    }

    fn spawn_fetch(&mut self) -> u64 {
        self.refresh_in_flight = true;
        self.requests += 1;
        let request = self.requests;
        let backend = Arc::clone(&self.backend);
        let snapshots = self.snapshots_tx.clone();
        tokio::spawn(async move {
            let result = backend.fetch_all().await;
            let _ = snapshots.send(SnapshotReply { request, result });
        });
        request
    }

    /// Waits for the next input and applies it. Returns `None` only when no
    /// input source is left.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let wake = self.wait().await?;
            if let Some(event) = self.handle(wake) {
                return Some(event);
            }
        }
    }

    async fn wait(&mut self) -> Option<Wake> {
        let deadline = self.search.deadline().map(tokio::time::Instant::from_std);
        let subscription = &mut self.subscription;
        tokio::select! {
            change = recv_change(subscription) => Some(Wake::Change(change)),
            Some(outcome) = self.completions.recv() => Some(Wake::Deleted(outcome)),
            Ok(()) = self.revalidate.changed() => Some(Wake::Revalidate),
            Some(snapshot) = self.snapshots_rx.recv() => Some(Wake::Snapshot(snapshot)),
            _ = sleep_until(deadline), if deadline.is_some() => Some(Wake::SearchDeadline),
            else => None,
        }
    }

    fn handle(&mut self, wake: Wake) -> Option<SessionEvent> {
        match wake {
            Wake::Change(Some(Ok(change))) => self
                .store
                .apply_change(&change)
                .map(SessionEvent::Notification),
            // Missed deletes never reach a plain merge, so this fetch is
            // reconciled against the rows held when it was issued.
            Wake::Change(Some(Err(ChannelError::Lagged(missed)))) => {
                tracing::warn!(missed, "change feed lagged, reconciling with a fresh snapshot");
                let baseline = self.store.ids();
                let request = self.spawn_fetch();
                self.reconcile = Some((request, baseline));
                None
            }
            Wake::Change(None) => {
                tracing::warn!("change feed closed, realtime updates stopped");
                self.subscription = None;
                Some(SessionEvent::ChannelClosed)
            }
            Wake::Deleted(outcome) => {
                let id = outcome.id;
                match complete_delete(&mut self.store, outcome) {
                    Some(reason) => Some(SessionEvent::DeleteFailed { id, reason }),
                    None => Some(SessionEvent::DeleteConfirmed { id }),
                }
            }
            Wake::Revalidate => {
                self.refresh();
                None
            }
            Wake::Snapshot(SnapshotReply { request, result }) => {
                self.refresh_in_flight = false;
                let baseline = match self.reconcile.take() {
                    Some((pending, baseline)) if pending == request => Some(baseline),
                    other => {
                        self.reconcile = other;
                        None
                    }
                };
                match result {
                    Ok(snapshot) => {
                        let stats = match baseline {
                            Some(baseline) => self.store.reconcile_snapshot(snapshot, &baseline),
                            None => self.store.merge_snapshot(snapshot),
                        };
                        tracing::debug!(?stats, "snapshot merged");
                        Some(SessionEvent::SnapshotMerged(stats))
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            reconciling = baseline.is_some(),
                            "snapshot refresh failed"
                        );
                        None
                    }
                }
            }
            Wake::SearchDeadline => self
                .search
                .poll(Instant::now())
                .then_some(SessionEvent::ViewChanged),
        }
    }

    pub fn unmount(self) {
        tracing::info!(rows = self.store.len(), "bookmark list unmounted");
    }
}

async fn recv_change(
    subscription: &mut Option<Subscription>,
) -> Option<Result<RawChange, ChannelError>> {
    match subscription {
        Some(subscription) => subscription.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::mock::{MockBackend, MockTitles};
    use assert_matches::assert_matches;
    use time::macros::datetime;
    use uuid::Uuid;

    fn row(title: &str, day: u8) -> Bookmark {
        Bookmark {
            id: Uuid::new_v4(),
            title: title.into(),
            url: format!("https://{}.example", title.to_lowercase()),
            created_at: datetime!(2024-06-01 0:00 UTC)
                .replace_day(day)
                .expect("valid day"),
        }
    }

    async fn mount(
        feed: &ChangeFeed,
        backend: Arc<MockBackend>,
    ) -> anyhow::Result<Session> {
        let titles = Arc::new(MockTitles::answering(Ok(None)));
        Ok(Session::mount(feed, backend, titles, Duration::from_millis(50)).await?)
    }

    async fn next(session: &mut Session) -> anyhow::Result<SessionEvent> {
        let event = tokio::time::timeout(Duration::from_secs(5), session.next_event()).await?;
        event.ok_or_else(|| anyhow::anyhow!("session ran out of inputs"))
    }

    #[tokio::test]
    async fn realtime_insert_shows_up_newest_first() -> anyhow::Result<()> {
        let old = row("Old", 1);
        let feed = ChangeFeed::new(16);
        let mut session = mount(&feed, Arc::new(MockBackend::new().with_rows(vec![old.clone()]))).await?;

        let new = row("New", 2);
        feed.publish(RawChange::insert(&new));
        assert_eq!(
            next(&mut session).await?,
            SessionEvent::Notification(Notification::Added {
                id: new.id,
                title: "New".into()
            })
        );
        let titles: Vec<_> = session.visible().iter().map(|row| row.title.clone()).collect();
        assert_eq!(titles, ["New", "Old"]);
        Ok(())
    }

    /// Publishes a change while the snapshot query is running, then answers
    /// with rows that predate it.
    struct RacingBackend {
        inner: MockBackend,
        feed: ChangeFeed,
        racing: Bookmark,
    }

    #[async_trait::async_trait]
    impl BookmarkBackend for RacingBackend {
        async fn fetch_all(&self) -> Result<Vec<Bookmark>, BackendError> {
            self.feed.publish(RawChange::insert(&self.racing));
            self.inner.fetch_all().await
        }

        async fn insert(&self, bookmark: crate::model::NewBookmark) -> Result<Bookmark, BackendError> {
            self.inner.insert(bookmark).await
        }

        async fn delete(&self, id: BookmarkId) -> Result<bool, BackendError> {
            self.inner.delete(id).await
        }
    }

    #[tokio::test]
    async fn changes_between_subscribe_and_snapshot_are_kept() -> anyhow::Result<()> {
        let early = row("Early", 3);
        let feed = ChangeFeed::new(16);
        let backend = Arc::new(RacingBackend {
            inner: MockBackend::new().with_rows(vec![row("Stored", 1)]),
            feed: feed.clone(),
            racing: early.clone(),
        });
        let titles = Arc::new(MockTitles::answering(Ok(None)));
        let mut session = Session::mount(&feed, backend, titles, Duration::from_millis(50)).await?;
        assert!(!session.store().contains(early.id));

        assert_matches!(next(&mut session).await?, SessionEvent::Notification(_));
        assert!(session.store().contains(early.id));
        assert_eq!(session.store().len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn local_delete_then_realtime_delete_converges() -> anyhow::Result<()> {
        let (a, b) = (row("Alpha", 1), row("Beta", 2));
        let backend = Arc::new(MockBackend::new().with_rows(vec![b.clone(), a.clone()]));
        let feed = ChangeFeed::new(16);
        let mut session = mount(&feed, backend).await?;

        session.delete(a.id);
        assert_eq!(session.visible().len(), 1);
        feed.publish(RawChange::delete(a.id));

        let mut saw_confirm = false;
        let mut saw_notice = false;
        while !(saw_confirm && saw_notice) {
            match next(&mut session).await? {
                SessionEvent::DeleteConfirmed { id } if id == a.id => saw_confirm = true,
                SessionEvent::Notification(Notification::Deleted { id }) if id == a.id => {
                    saw_notice = true
                }
                SessionEvent::SnapshotMerged(stats) => assert_eq!(stats.inserted, 0),
                other => panic!("unexpected event {other:?}"),
            }
        }
        let ids: Vec<_> = session.visible().iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![b.id]);
        Ok(())
    }

    #[tokio::test]
    async fn failed_delete_is_reported_and_row_stays_hidden() -> anyhow::Result<()> {
        let a = row("Alpha", 1);
        let backend = Arc::new(
            MockBackend::new()
                .with_rows(vec![a.clone()])
                .with_delete_error("permission denied"),
        );
        let feed = ChangeFeed::new(16);
        let mut session = mount(&feed, backend).await?;

        session.delete(a.id);
        assert_matches!(
            next(&mut session).await?,
            SessionEvent::DeleteFailed { id, reason } if id == a.id && reason.contains("permission denied")
        );
        assert!(session.visible().is_empty());
        assert!(session.restore_failed_delete(a.id));
        assert_eq!(session.visible().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn create_triggers_snapshot_refresh() -> anyhow::Result<()> {
        let backend = Arc::new(MockBackend::new());
        let feed = ChangeFeed::new(16);
        let mut session = mount(&feed, backend).await?;

        let created = session
            .submitter()
            .clone()
            .create(Some("Docs"), "https://docs.rs")
            .await?;
        assert!(!session.store().contains(created.id));

        assert_eq!(
            next(&mut session).await?,
            SessionEvent::SnapshotMerged(MergeStats {
                inserted: 1,
                ..MergeStats::default()
            })
        );
        assert!(session.store().contains(created.id));
        Ok(())
    }

    #[tokio::test]
    async fn search_settles_after_window() -> anyhow::Result<()> {
        let backend = Arc::new(MockBackend::new().with_rows(vec![row("Rust", 2), row("Go", 1)]));
        let feed = ChangeFeed::new(16);
        let mut session = mount(&feed, backend).await?;

        session.set_query("go");
        assert_eq!(session.visible().len(), 2);
        assert_eq!(next(&mut session).await?, SessionEvent::ViewChanged);
        assert_eq!(session.search().debounced_query(), "go");
        let titles: Vec<_> = session.visible().iter().map(|row| row.title.clone()).collect();
        assert_eq!(titles, ["Go"]);
        Ok(())
    }

    #[tokio::test]
    async fn lagged_feed_recovers_through_snapshot() -> anyhow::Result<()> {
        let backend = Arc::new(MockBackend::new());
        let feed = ChangeFeed::new(1);
        let mut session = mount(&feed, backend.clone()).await?;

        let missed = row("Missed", 4);
        backend.push_row(missed.clone());
        feed.publish(RawChange::delete(Uuid::new_v4()));
        feed.publish(RawChange::delete(Uuid::new_v4()));
        feed.publish(RawChange::delete(Uuid::new_v4()));

        loop {
            if let SessionEvent::SnapshotMerged(_) = next(&mut session).await? {
                break;
            }
        }
        assert!(session.store().contains(missed.id));
        Ok(())
    }

    #[tokio::test]
    async fn lagged_feed_drops_rows_deleted_meanwhile() -> anyhow::Result<()> {
        let (gone, kept) = (row("Gone", 1), row("Kept", 2));
        let backend = Arc::new(MockBackend::new().with_rows(vec![kept.clone(), gone.clone()]));
        let feed = ChangeFeed::new(1);
        let mut session = mount(&feed, backend.clone()).await?;
        assert_eq!(session.store().len(), 2);

        backend.delete(gone.id).await?;
        feed.publish(RawChange::delete(gone.id));
        feed.publish(RawChange::delete(Uuid::new_v4()));
        feed.publish(RawChange::delete(Uuid::new_v4()));

        let stats = loop {
            if let SessionEvent::SnapshotMerged(stats) = next(&mut session).await? {
                break stats;
            }
        };
        assert_eq!(stats.removed, 1);
        let ids: Vec<_> = session.visible().iter().map(|row| row.id).collect();
        assert_eq!(ids, vec![kept.id]);
        Ok(())
    }

    #[tokio::test]
    async fn unmount_releases_subscription() -> anyhow::Result<()> {
        let feed = ChangeFeed::new(16);
        let session = mount(&feed, Arc::new(MockBackend::new())).await?;
        assert_eq!(feed.active_subscriptions(), 1);
        session.unmount();
        assert_eq!(feed.active_subscriptions(), 0);
        Ok(())
    }
}
