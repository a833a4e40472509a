use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::ResolverOptions;
use crate::debounce::Debounce;
use crate::validate::{is_valid_url, INVALID_URL_MESSAGE, INVALID_URL_ON_SUBMIT};

pub const TITLE_FETCH_FAILED: &str = "Unable to fetch title from this URL.";
pub const MIN_RESOLVE_DEBOUNCE: Duration = Duration::from_millis(500);
pub const DEFAULT_RESOLVE_DEBOUNCE: Duration = Duration::from_millis(600);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("title request was cancelled")]
    Cancelled,
    #[error("title request failed: {0}")]
    Http(String),
    #[error("title service answered with status {0}")]
    Status(u16),
    #[error("title service response was not understood: {0}")]
    Decode(String),
}

impl ResolveError {
    pub fn http(err: reqwest::Error) -> Self {
        ResolveError::Http(err.to_string())
    }
}

#[async_trait]
pub trait TitleService: Send + Sync {
    async fn resolve(&self, url: &str, cancel: CancellationToken) -> Result<String, ResolveError>;
}

#[derive(Debug, Deserialize)]
struct TitleResponse {
    title: String,
}

/// Client for a remote title endpoint answering `GET {endpoint}?url=...` with
/// `{"title": "..."}`.
#[derive(Clone)]
pub struct HttpTitleService {
    client: reqwest::Client,
    endpoint: Url,
}

impl HttpTitleService {
    pub fn new(client: reqwest::Client, endpoint: Url) -> Self {
        Self { client, endpoint }
    }

    pub fn from_options(options: &ResolverOptions, endpoint: Url) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(options.timeout_secs))
            .build()
            .context("building title service http client")?;
        Ok(Self::new(client, endpoint))
    }

    fn request_url(&self, target: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("url", target);
        url
    }
}

#[async_trait]
impl TitleService for HttpTitleService {
    async fn resolve(&self, url: &str, cancel: CancellationToken) -> Result<String, ResolveError> {
        let request = self.client.get(self.request_url(url));
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            response = request.send() => response.map_err(ResolveError::http)?,
        };
        if !response.status().is_success() {
            return Err(ResolveError::Status(response.status().as_u16()));
        }
        let body = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ResolveError::Cancelled),
            body = response.json::<TitleResponse>() => body,
        };
        body.map(|body| body.title)
            .map_err(|err| ResolveError::Decode(err.to_string()))
    }
}

#[derive(Debug)]
pub struct ResolveOutcome {
    pub generation: u64,
    pub url: String,
    pub result: Result<String, ResolveError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TitleUpdate {
    Applied(String),
    Failed,
    Stale,
    Cancelled,
}

struct InFlight {
    generation: u64,
    url: String,
    cancel: CancellationToken,
}

/// Title half of the add-bookmark form. Owns the debounce window and at most
/// one outstanding request; anything that comes back for an older generation
/// is dropped.
pub struct TitleResolver {
    service: Arc<dyn TitleService>,
    debounce: Debounce<String>,
    url: String,
    title: String,
    url_error: Option<&'static str>,
    title_error: Option<&'static str>,
    in_flight: Option<InFlight>,
    generation: u64,
    outcomes_tx: mpsc::UnboundedSender<ResolveOutcome>,
    outcomes_rx: mpsc::UnboundedReceiver<ResolveOutcome>,
}

impl TitleResolver {
    pub fn new(service: Arc<dyn TitleService>, window: Duration) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            service,
            debounce: Debounce::new(window.max(MIN_RESOLVE_DEBOUNCE)),
            url: String::new(),
            title: String::new(),
            url_error: None,
            title_error: None,
            in_flight: None,
            generation: 0,
            outcomes_tx,
            outcomes_rx,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn title(&self) -> &str {
        &self.title
    }

    pub fn url_error(&self) -> Option<&'static str> {
        self.url_error
    }

    pub fn title_error(&self) -> Option<&'static str> {
        self.title_error
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn title_editable(&self) -> bool {
        !self.is_loading() && self.url_error.is_none()
    }

    pub fn can_submit(&self) -> bool {
        !self.is_loading() && self.url_error.is_none() && is_valid_url(&self.url)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.debounce.deadline()
    }

    /// Records a URL edit. Clears the title, supersedes any outstanding
    /// request and restarts the quiet window when the URL is valid.
    pub fn set_url(&mut self, url: impl Into<String>, now: Instant) {
        self.url = url.into();
        self.title.clear();
        self.title_error = None;
        self.cancel_in_flight();

        if self.url.is_empty() {
            self.url_error = None;
            self.debounce.cancel();
        } else if is_valid_url(&self.url) {
            self.url_error = None;
            self.debounce.push(self.url.clone(), now);
        } else {
            self.url_error = Some(INVALID_URL_MESSAGE);
            self.debounce.cancel();
        }
    }

    /// Manual title entry. Ignored while a request is in flight.
    pub fn set_title(&mut self, title: impl Into<String>) -> bool {
        if !self.title_editable() {
            return false;
        }
        self.title = title.into();
        true
    }

    /// Starts a request once the URL has been quiet for the debounce window.
    /// Must be called from within a tokio runtime.
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.debounce.poll(now) {
            Some(url) => {
                self.start(url);
                true
            }
            None => false,
        }
    }

    fn start(&mut self, url: String) {
        self.cancel_in_flight();
        self.generation += 1;
        let generation = self.generation;
        let cancel = CancellationToken::new();
        self.title.clear();
        self.title_error = None;
        self.in_flight = Some(InFlight {
            generation,
            url: url.clone(),
            cancel: cancel.clone(),
        });
        tracing::debug!(generation, %url, "resolving title");

        let service = Arc::clone(&self.service);
        let outcomes = self.outcomes_tx.clone();
        tokio::spawn(async move {
            let result = service.resolve(&url, cancel.clone()).await;
            let result = if cancel.is_cancelled() {
                Err(ResolveError::Cancelled)
            } else {
                result
            };
            let _ = outcomes.send(ResolveOutcome {
                generation,
                url,
                result,
            });
        });
    }

    fn cancel_in_flight(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            tracing::debug!(generation = in_flight.generation, url = %in_flight.url, "cancelling title request");
            in_flight.cancel.cancel();
        }
    }

    pub fn apply(&mut self, outcome: ResolveOutcome) -> TitleUpdate {
        let current = self
            .in_flight
            .as_ref()
            .map(|in_flight| in_flight.generation == outcome.generation)
            .unwrap_or(false);
        if !current {
            tracing::trace!(generation = outcome.generation, url = %outcome.url, "dropping stale title");
            return TitleUpdate::Stale;
        }
        self.in_flight = None;
        match outcome.result {
            Ok(title) => {
                self.title = title.clone();
                TitleUpdate::Applied(title)
            }
            Err(ResolveError::Cancelled) => TitleUpdate::Cancelled,
            Err(err) => {
                tracing::warn!(url = %outcome.url, error = %err, "title resolution failed");
                self.title.clear();
                self.title_error = Some(TITLE_FETCH_FAILED);
                TitleUpdate::Failed
            }
        }
    }

    pub fn drain(&mut self) -> Vec<TitleUpdate> {
        let mut updates = Vec::new();
        while let Ok(outcome) = self.outcomes_rx.try_recv() {
            updates.push(self.apply(outcome));
        }
        updates
    }

    /// Waits for the next finished request. Pending forever when nothing is
    /// outstanding, so it can sit in a `select!`.
    pub async fn next_outcome(&mut self) -> Option<ResolveOutcome> {
        self.outcomes_rx.recv().await
    }

    pub fn check_submit(&mut self) -> bool {
        if is_valid_url(&self.url) {
            return true;
        }
        self.url_error = Some(INVALID_URL_ON_SUBMIT);
        false
    }

    pub fn reset(&mut self) {
        self.cancel_in_flight();
        self.debounce.cancel();
        self.url.clear();
        self.title.clear();
        self.url_error = None;
        self.title_error = None;
    }
}

impl Drop for TitleResolver {
    fn drop(&mut self) {
        self.cancel_in_flight();
    }
}
