use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::Args;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use unicode_width::{UnicodeWidthChar, UnicodeWidthStr};
use uuid::Uuid;

use crate::app::{MutationError, MutationSubmitter, Revalidator, Session, SessionEvent};
use crate::config::AppConfig;
use crate::model::Bookmark;
use crate::realtime::ChangeFeed;
use crate::resolver::{HttpTitleService, TitleResolver, TitleService, TitleUpdate};
use crate::scrape::{PageScraper, PageTitleSource};
use crate::storage::{BookmarkBackend, ChangeLogPump, StorageHandle};
use crate::store::BookmarkStore;
use crate::validate::{validate_url, INVALID_URL_MESSAGE};

const TITLE_COLUMNS: usize = 40;

#[derive(Args, Debug, Clone)]
pub struct AddArgs {
    /// Address to save
    pub url: String,
    /// Title to store; fetched from the page when omitted
    #[arg(long)]
    pub title: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    /// Bookmark identifier
    pub id: Uuid,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ListArgs {
    /// Only show bookmarks whose title or address contains this text
    pub query: Option<String>,
    /// Limit the number of results printed
    #[arg(long, default_value_t = 50)]
    pub limit: usize,
}

#[derive(Args, Debug, Clone, Default)]
pub struct WatchArgs {
    /// Initial search text
    #[arg(long)]
    pub query: Option<String>,
}

#[derive(Args, Debug, Clone)]
pub struct CheckUrlArgs {
    pub url: String,
}

#[derive(Args, Debug, Clone)]
pub struct TitleArgs {
    pub url: String,
}

/// Long-lived collaborators shared by every command.
pub struct Services {
    pub config: Arc<AppConfig>,
    pub storage: StorageHandle,
    pub scraper: Arc<PageScraper>,
    pub titles: Arc<dyn TitleService>,
}

impl Services {
    pub fn new(config: Arc<AppConfig>, storage: StorageHandle) -> Result<Self> {
        let scraper = Arc::new(PageScraper::new(&config.resolver)?);
        let titles: Arc<dyn TitleService> = match config.resolver.endpoint_url() {
            Some(endpoint) => {
                tracing::debug!(%endpoint, "using remote title service");
                Arc::new(HttpTitleService::from_options(&config.resolver, endpoint)?)
            }
            None => scraper.clone(),
        };
        Ok(Self {
            config,
            storage,
            scraper,
            titles,
        })
    }
}

pub async fn add(
    storage: &StorageHandle,
    titles: Arc<dyn PageTitleSource>,
    args: AddArgs,
) -> Result<String> {
    let (submitter, _completions) =
        MutationSubmitter::new(Arc::new(storage.clone()), titles, Revalidator::new());
    match submitter.create(args.title.as_deref(), &args.url).await {
        Ok(bookmark) => Ok(format!("Saved {}  {}\n", bookmark.id, bookmark.title)),
        Err(err @ MutationError::InvalidUrl(_)) => bail!("{err}"),
        Err(err) => Err(err).context("saving bookmark"),
    }
}

pub async fn delete(storage: &StorageHandle, args: DeleteArgs) -> Result<String> {
    let removed = storage
        .delete(args.id)
        .await
        .context("deleting bookmark")?;
    if removed {
        Ok(format!("Deleted {}\n", args.id))
    } else {
        Ok(format!("No bookmark with id {}\n", args.id))
    }
}

pub async fn list(storage: &StorageHandle, args: ListArgs) -> Result<String> {
    let snapshot = storage.fetch_all().await.context("loading bookmarks")?;
    let store = BookmarkStore::from_snapshot(snapshot);
    let rows = store.visible(args.query.as_deref().unwrap_or_default());
    let shown = rows.len().min(args.limit);
    Ok(format_rows(&rows[..shown]))
}

pub fn check_url(args: &CheckUrlArgs) -> Result<String> {
    match validate_url(&args.url) {
        Ok(url) => Ok(format!("valid: {url}\n")),
        Err(err) => {
            tracing::debug!(url = %args.url, error = %err, "rejected address");
            bail!("{INVALID_URL_MESSAGE} ({err})")
        }
    }
}

pub async fn title(service: Arc<dyn TitleService>, args: TitleArgs) -> Result<String> {
    if let Err(err) = validate_url(&args.url) {
        bail!("{INVALID_URL_MESSAGE} ({err})");
    }
    let cancel = CancellationToken::new();
    let request = service.resolve(&args.url, cancel.clone());
    tokio::pin!(request);
    let title = tokio::select! {
        result = &mut request => result?,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            bail!("interrupted");
        }
    };
    Ok(format!("{title}\n"))
}

/// One line typed into `watch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchCommand {
    Query(String),
    Url(String),
    Title(String),
    Save,
    Delete(String),
    Restore(String),
    Quit,
    Help,
}

pub fn parse_watch_command(line: &str) -> Option<WatchCommand> {
    let line = line.trim_end_matches(['\r', '\n']);
    let (head, rest) = match line.split_once(' ') {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };
    match head {
        "/" => Some(WatchCommand::Query(rest.to_string())),
        _ if head.starts_with('/') => Some(WatchCommand::Query(line[1..].to_string())),
        "+" | "url" => Some(WatchCommand::Url(rest.to_string())),
        "t" | "title" => Some(WatchCommand::Title(rest.to_string())),
        "s" | "save" => Some(WatchCommand::Save),
        "-" | "del" if !rest.is_empty() => Some(WatchCommand::Delete(rest.to_string())),
        "r" | "restore" if !rest.is_empty() => Some(WatchCommand::Restore(rest.to_string())),
        "q" | "quit" => Some(WatchCommand::Quit),
        "?" | "help" => Some(WatchCommand::Help),
        _ => None,
    }
}

const WATCH_HELP: &str = "\
/text        filter by title or address (empty clears)
+ <url>      start a new bookmark; the title is looked up after a pause
t <title>    type the title yourself
s            save the new bookmark
- <id>       delete by id or id prefix
r <id>       put back a bookmark whose delete failed
q            quit
";

pub async fn watch(services: &Services, args: WatchArgs) -> Result<()> {
    let realtime = &services.config.realtime;
    let feed = ChangeFeed::new(realtime.channel_capacity);
    let shutdown = CancellationToken::new();
    let pump = ChangeLogPump::new(
        services.storage.clone(),
        feed.clone(),
        realtime.poll_interval(),
        realtime.retention_hours,
    )?
    .spawn(shutdown.clone());

    let backend: Arc<dyn BookmarkBackend> = Arc::new(services.storage.clone());
    let mut session = Session::mount(
        &feed,
        backend,
        services.scraper.clone(),
        services.config.search.debounce(),
    )
    .await
    .context("loading bookmarks")?;
    let mut form = TitleResolver::new(services.titles.clone(), services.config.resolver.debounce());

    if let Some(query) = args.query {
        session.set_query(query);
        session.flush_query();
    }
    print!("{}", format_rows(session.visible()));
    eprintln!("type ? for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let form_deadline = form.deadline().map(tokio::time::Instant::from_std);
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                match parse_watch_command(&line) {
                    Some(WatchCommand::Quit) => break,
                    Some(command) => handle_watch_command(&mut session, &mut form, command),
                    None if line.trim().is_empty() => {}
                    None => eprintln!("unknown command, type ? for help"),
                }
            }
            event = session.next_event() => {
                let Some(event) = event else { break };
                report_event(&mut session, event);
            }
            outcome = form.next_outcome() => {
                if let Some(outcome) = outcome {
                    match form.apply(outcome) {
                        TitleUpdate::Applied(title) => eprintln!("title: {title}"),
                        TitleUpdate::Failed => eprintln!("{}", form.title_error().unwrap_or_default()),
                        TitleUpdate::Stale | TitleUpdate::Cancelled => {}
                    }
                }
            }
            _ = sleep_until(form_deadline), if form_deadline.is_some() => {
                if form.poll(Instant::now()) {
                    eprintln!("fetching title...");
                }
            }
        }
    }

    form.reset();
    shutdown.cancel();
    session.unmount();
    if let Err(err) = pump.await {
        tracing::warn!(error = %err, "change log pump did not shut down cleanly");
    }
    Ok(())
}

fn handle_watch_command(session: &mut Session, form: &mut TitleResolver, command: WatchCommand) {
    match command {
        WatchCommand::Query(query) => session.set_query(query),
        WatchCommand::Url(url) => {
            form.set_url(url, Instant::now());
            if let Some(message) = form.url_error() {
                eprintln!("{message}");
            }
        }
        WatchCommand::Title(title) => {
            if !form.set_title(title) {
                eprintln!("title is locked while the address is invalid or a lookup is running");
            }
        }
        WatchCommand::Save => {
            if !form.check_submit() {
                eprintln!("{}", form.url_error().unwrap_or_default());
                return;
            }
            if form.is_loading() {
                eprintln!("still fetching the title");
                return;
            }
            let submitter = session.submitter().clone();
            let url = form.url().to_string();
            let title = form.title().to_string();
            form.reset();
            tokio::spawn(async move {
                match submitter.create(Some(&title), &url).await {
                    Ok(bookmark) => eprintln!("saved {}", bookmark.title),
                    Err(err) => eprintln!("{err}"),
                }
            });
        }
        WatchCommand::Delete(prefix) => match resolve_id(session.store(), &prefix) {
            Ok(id) => session.delete(id),
            Err(message) => eprintln!("{message}"),
        },
        WatchCommand::Restore(prefix) => {
            let restored = Uuid::parse_str(&prefix)
                .ok()
                .or_else(|| {
                    let failed = session.store().failed_deletes();
                    let mut matches = failed.iter().filter(|(id, _)| id.to_string().starts_with(&prefix));
                    match (matches.next(), matches.next()) {
                        (Some((id, _)), None) => Some(*id),
                        _ => None,
                    }
                })
                .map(|id| session.restore_failed_delete(id))
                .unwrap_or(false);
            if restored {
                print!("{}", format_rows(session.visible()));
            } else {
                eprintln!("no failed delete matches {prefix}");
            }
        }
        WatchCommand::Help => eprint!("{WATCH_HELP}"),
        WatchCommand::Quit => {}
    }
}

fn report_event(session: &mut Session, event: SessionEvent) {
    match event {
        SessionEvent::Notification(notification) => {
            eprintln!("{}", notification.message());
            print!("{}", format_rows(session.visible()));
        }
        SessionEvent::DeleteFailed { id, reason } => {
            eprintln!("could not delete {id}: {reason} (r {id} to put it back)");
        }
        SessionEvent::DeleteConfirmed { .. } => {}
        SessionEvent::SnapshotMerged(stats) => {
            if stats.inserted > 0 || stats.removed > 0 {
                print!("{}", format_rows(session.visible()));
            }
        }
        SessionEvent::ViewChanged => print!("{}", format_rows(session.visible())),
        SessionEvent::ChannelClosed => eprintln!("live updates stopped"),
    }
}

fn resolve_id(store: &BookmarkStore, prefix: &str) -> Result<Uuid, String> {
    if let Ok(id) = Uuid::parse_str(prefix) {
        return Ok(id);
    }
    let mut matches = store
        .rows()
        .map(|row| row.id)
        .filter(|id| id.to_string().starts_with(prefix));
    match (matches.next(), matches.next()) {
        (Some(id), None) => Ok(id),
        (Some(_), Some(_)) => Err(format!("id prefix {prefix} is ambiguous")),
        (None, _) => Err(format!("no bookmark matches {prefix}")),
    }
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn format_rows(rows: &[Arc<Bookmark>]) -> String {
    if rows.is_empty() {
        return "No bookmarks.\n".to_string();
    }
    let mut out = String::new();
    for row in rows {
        let id = row.id.simple().to_string();
        let short_id = &id[..8];
        let title = fit_width(&row.title, TITLE_COLUMNS);
        let pad = TITLE_COLUMNS.saturating_sub(title.width());
        let _ = writeln!(
            &mut out,
            "{short_id}  {title}{:pad$}  {}",
            "",
            row.url,
            pad = pad
        );
    }
    out
}

/// Truncates to at most `columns` display cells, marking the cut with `…`.
fn fit_width(text: &str, columns: usize) -> String {
    if text.width() <= columns {
        return text.to_string();
    }
    let budget = columns.saturating_sub(1);
    let mut used = 0;
    let mut out = String::new();
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(ch);
    }
    out.push('…');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::mock::MockTitles;
    use crate::model::NewBookmark;
    use crate::storage::tests::init_storage;

    type TestResult<T = ()> = Result<T>;

    #[test]
    fn fit_width_counts_display_cells() {
        assert_eq!(fit_width("short", 10), "short");
        assert_eq!(fit_width("abcdefghijk", 5), "abcd…");
        let wide = fit_width("日本語のタイトル", 7);
        assert_eq!(wide, "日本語…");
        assert!(wide.width() <= 7);
    }

    #[test]
    fn watch_commands_parse() {
        assert_eq!(parse_watch_command("/rust"), Some(WatchCommand::Query("rust".into())));
        assert_eq!(parse_watch_command("/"), Some(WatchCommand::Query(String::new())));
        assert_eq!(
            parse_watch_command("+ https://docs.rs"),
            Some(WatchCommand::Url("https://docs.rs".into()))
        );
        assert_eq!(parse_watch_command("t My Docs"), Some(WatchCommand::Title("My Docs".into())));
        assert_eq!(parse_watch_command("- 1a2b"), Some(WatchCommand::Delete("1a2b".into())));
        assert_eq!(parse_watch_command("-"), None);
        assert_eq!(parse_watch_command("q"), Some(WatchCommand::Quit));
        assert_eq!(parse_watch_command("bogus"), None);
    }

    #[tokio::test]
    async fn cli_list_filters_and_orders() -> TestResult {
        let (_temp, storage) = init_storage()?;
        storage.insert_bookmark(&NewBookmark {
            title: "Rust Book".into(),
            url: "https://rust-lang.org".into(),
        })?;
        std::thread::sleep(std::time::Duration::from_millis(2));
        storage.insert_bookmark(&NewBookmark {
            title: "Go Guide".into(),
            url: "https://go.dev".into(),
        })?;

        let all = list(&storage, ListArgs { query: None, limit: 10 }).await?;
        let rust_at = all.find("Rust Book").expect("rust listed");
        let go_at = all.find("Go Guide").expect("go listed");
        assert!(go_at < rust_at, "newest first:\n{all}");

        let filtered = list(&storage, ListArgs { query: Some("GO".into()), limit: 10 }).await?;
        assert!(filtered.contains("Go Guide"));
        assert!(!filtered.contains("Rust Book"));
        Ok(())
    }

    #[tokio::test]
    async fn cli_add_fetches_title_and_delete_removes() -> TestResult {
        let (_temp, storage) = init_storage()?;
        let titles = Arc::new(MockTitles::answering(Ok(Some("Docs.rs".into()))));

        let output = add(
            &storage,
            titles,
            AddArgs {
                url: "https://docs.rs".into(),
                title: None,
            },
        )
        .await?;
        assert!(output.contains("Docs.rs"));

        let saved = storage.fetch_bookmarks()?;
        assert_eq!(saved.len(), 1);
        let deleted = delete(&storage, DeleteArgs { id: saved[0].id }).await?;
        assert!(deleted.starts_with("Deleted"));
        let again = delete(&storage, DeleteArgs { id: saved[0].id }).await?;
        assert!(again.starts_with("No bookmark"));
        Ok(())
    }

    #[tokio::test]
    async fn cli_add_rejects_invalid_address() -> TestResult {
        let (_temp, storage) = init_storage()?;
        let titles = Arc::new(MockTitles::answering(Ok(None)));
        let err = add(
            &storage,
            titles,
            AddArgs {
                url: "ftp://example.com".into(),
                title: Some("x".into()),
            },
        )
        .await
        .expect_err("ftp rejected");
        assert!(err.to_string().contains("Enter a valid URL before saving."));
        assert!(storage.fetch_bookmarks()?.is_empty());
        Ok(())
    }

    #[test]
    fn cli_check_url_reports_reason() {
        assert!(check_url(&CheckUrlArgs { url: "http://a.bb".into() }).is_ok());
        let err = check_url(&CheckUrlArgs { url: "http://example.c".into() })
            .expect_err("short tld");
        assert!(err.to_string().starts_with(INVALID_URL_MESSAGE));
    }

    #[test]
    fn resolve_id_accepts_unique_prefix() {
        let row = Bookmark {
            id: Uuid::new_v4(),
            title: "x".into(),
            url: "https://x.example".into(),
            created_at: crate::model::now_micros(),
        };
        let store = BookmarkStore::from_snapshot(vec![row.clone()]);
        let prefix = &row.id.to_string()[..6];
        assert_eq!(resolve_id(&store, prefix), Ok(row.id));
        assert!(resolve_id(&store, "zzzz").is_err());
    }
}
