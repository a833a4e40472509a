use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::debounce::Debounce;
use crate::model::Bookmark;
use crate::store::BookmarkStore;

pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(200);

/// Filters rows by a case-insensitive substring of title or url and orders
/// them newest first. Rows with equal timestamps keep their input order.
pub fn filter_and_sort<'a, I>(rows: I, query: &str) -> Vec<Arc<Bookmark>>
where
    I: IntoIterator<Item = &'a Arc<Bookmark>>,
{
    let needle = query.to_lowercase();
    let mut matched: Vec<Arc<Bookmark>> = rows
        .into_iter()
        .filter(|row| row.matches_lowercase(&needle))
        .cloned()
        .collect();
    matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    matched
}

#[derive(Debug)]
struct CachedView {
    revision: u64,
    query: String,
    rows: Vec<Arc<Bookmark>>,
}

#[derive(Debug)]
pub struct SearchState {
    raw: String,
    debounced: String,
    debounce: Debounce<String>,
    cache: Option<CachedView>,
}

impl Default for SearchState {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_DEBOUNCE)
    }
}

impl SearchState {
    pub fn new(window: Duration) -> Self {
        Self {
            raw: String::new(),
            debounced: String::new(),
            debounce: Debounce::new(window),
            cache: None,
        }
    }

    pub fn raw_query(&self) -> &str {
        &self.raw
    }

    pub fn debounced_query(&self) -> &str {
        &self.debounced
    }

    pub fn set_query(&mut self, raw: impl Into<String>, now: Instant) {
        self.raw = raw.into();
        self.debounce.push(self.raw.clone(), now);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debounce.deadline()
    }

    /// Promotes the raw query once the input has been idle long enough.
    /// Returns true when the debounced query changed.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.debounce.poll(now) {
            Some(query) => self.promote(query),
            None => false,
        }
    }

    pub fn flush(&mut self) -> bool {
        match self.debounce.flush() {
            Some(query) => self.promote(query),
            None => false,
        }
    }

    /// Rows to render. Recomputed only when the store's revision or the
    /// debounced query moved since the last call.
    pub fn view(&mut self, store: &BookmarkStore) -> &[Arc<Bookmark>] {
        let fresh = matches!(
            &self.cache,
            Some(cached) if cached.revision == store.revision() && cached.query == self.debounced
        );
        if !fresh {
            self.cache = Some(CachedView {
                revision: store.revision(),
                query: self.debounced.clone(),
                rows: store.visible(&self.debounced),
            });
        }
        self.cache
            .as_ref()
            .map(|cached| cached.rows.as_slice())
            .unwrap_or_default()
    }

    fn promote(&mut self, query: String) -> bool {
        if query == self.debounced {
            return false;
        }
        tracing::trace!(%query, "search query settled");
        self.debounced = query;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::ChangeEvent;
    use time::macros::datetime;
    use time::OffsetDateTime;
    use uuid::Uuid;

    fn row(title: &str, url: &str, created_at: OffsetDateTime) -> Arc<Bookmark> {
        Arc::new(Bookmark {
            id: Uuid::new_v4(),
            title: title.into(),
            url: url.into(),
            created_at,
        })
    }

    #[test]
    fn query_matches_url_case_insensitively() {
        let rust = row("Rust Book", "rust-lang.org", datetime!(2024-01-01 0:00 UTC));
        let go = row("Go Guide", "go.dev", datetime!(2024-01-02 0:00 UTC));
        let rows = vec![rust, go.clone()];

        let result = filter_and_sort(&rows, "go");
        assert_eq!(result.len(), 1);
        assert!(Arc::ptr_eq(&result[0], &go));
        assert_eq!(filter_and_sort(&rows, "GO.DEV").len(), 1);
        assert_eq!(filter_and_sort(&rows, "").len(), 2);
    }

    #[test]
    fn newest_first_with_stable_ties() {
        let t1 = row("one", "https://one.example", datetime!(2024-01-01 0:00 UTC));
        let t2 = row("two", "https://two.example", datetime!(2024-01-02 0:00 UTC));
        let t3 = row("three", "https://three.example", datetime!(2024-01-03 0:00 UTC));
        let tie = row("tie", "https://tie.example", datetime!(2024-01-02 0:00 UTC));

        let titles: Vec<_> = filter_and_sort(&[t2.clone(), t1.clone(), t3.clone()], "")
            .iter()
            .map(|row| row.title.clone())
            .collect();
        assert_eq!(titles, ["three", "two", "one"]);

        let tied: Vec<_> = filter_and_sort(&[tie.clone(), t2.clone()], "")
            .iter()
            .map(|row| row.title.clone())
            .collect();
        assert_eq!(tied, ["tie", "two"]);
    }

    #[test]
    fn debounced_query_lags_raw_query() {
        let start = Instant::now();
        let mut search = SearchState::default();
        search.set_query("r", start);
        search.set_query("ru", start + Duration::from_millis(100));
        assert_eq!(search.raw_query(), "ru");
        assert_eq!(search.debounced_query(), "");

        assert!(!search.poll(start + Duration::from_millis(250)));
        assert!(search.poll(start + Duration::from_millis(300)));
        assert_eq!(search.debounced_query(), "ru");
    }

    #[test]
    fn flush_promotes_immediately() {
        let mut search = SearchState::default();
        search.set_query("go", Instant::now());
        assert!(search.flush());
        assert_eq!(search.debounced_query(), "go");
        assert!(!search.flush());
    }

    #[test]
    fn view_is_reused_until_store_or_query_changes() {
        let mut store = BookmarkStore::new();
        let first = Bookmark {
            id: Uuid::new_v4(),
            title: "Rust Book".into(),
            url: "https://doc.rust-lang.org/book".into(),
            created_at: datetime!(2024-01-01 0:00 UTC),
        };
        store.apply_event(ChangeEvent::Insert(first.clone()));
        let mut search = SearchState::default();

        let before = search.view(&store).to_vec();
        let again = search.view(&store).to_vec();
        assert!(Arc::ptr_eq(&before[0], &again[0]));

        search.set_query("python", Instant::now());
        search.flush();
        assert!(search.view(&store).is_empty());

        store.apply_event(ChangeEvent::Insert(Bookmark {
            id: Uuid::new_v4(),
            title: "Python docs".into(),
            url: "https://docs.python.org".into(),
            created_at: datetime!(2024-02-01 0:00 UTC),
        }));
        assert_eq!(search.view(&store).len(), 1);
    }
}
