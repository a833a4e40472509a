use std::time::{Duration, Instant};

/// Holds the latest value pushed into it until `window` has passed without a
/// newer push. Callers drive it with `poll`, passing the current instant.
#[derive(Debug, Clone)]
pub struct Debounce<T> {
    window: Duration,
    pending: Option<Pending<T>>,
}

#[derive(Debug, Clone)]
struct Pending<T> {
    value: T,
    since: Instant,
}

impl<T> Debounce<T> {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            pending: None,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Replaces any pending value and restarts the quiet period.
    pub fn push(&mut self, value: T, now: Instant) {
        self.pending = Some(Pending { value, since: now });
    }

    pub fn is_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// When the pending value becomes ready, if there is one.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending
            .as_ref()
            .map(|pending| pending.since + self.window)
    }

    pub fn poll(&mut self, now: Instant) -> Option<T> {
        let ready = self
            .pending
            .as_ref()
            .map(|pending| now.saturating_duration_since(pending.since) >= self.window)
            .unwrap_or(false);
        if !ready {
            return None;
        }
        self.pending.take().map(|pending| pending.value)
    }

    /// Releases the pending value without waiting out the window.
    pub fn flush(&mut self) -> Option<T> {
        self.pending.take().map(|pending| pending.value)
    }

    pub fn cancel(&mut self) -> Option<T> {
        self.flush()
    }
}
