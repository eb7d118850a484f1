//! Debounced search-as-you-type.
//!
//! Every keystroke restarts a timer; only the query that survives the delay
//! runs. A result that arrives after a newer input is dropped, so the
//! published results always belong to the latest text.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::SyncResult;

/// Default search-as-you-type delay in milliseconds.
pub const DEFAULT_SEARCH_DEBOUNCE_MS: u64 = 500;

/// Default search-as-you-type delay.
pub const DEFAULT_SEARCH_DEBOUNCE: Duration = Duration::from_millis(DEFAULT_SEARCH_DEBOUNCE_MS);

type SearchFn<T> = dyn Fn(String) -> BoxFuture<'static, SyncResult<Vec<T>>> + Send + Sync;

/// The latest published search outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchResults<T> {
    /// Text the results belong to.
    pub query: String,
    pub items: Vec<T>,
    /// User-facing error when the search failed.
    pub error: Option<String>,
}

impl<T> Default for SearchResults<T> {
    fn default() -> Self {
        Self {
            query: String::new(),
            items: Vec::new(),
            error: None,
        }
    }
}

struct Pending {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A search box that waits for typing to pause before querying.
pub struct DebouncedSearch<T> {
    delay: Duration,
    search: Arc<SearchFn<T>>,
    results: Arc<watch::Sender<SearchResults<T>>>,
    generation: Arc<AtomicU64>,
    pending: Mutex<Option<Pending>>,
}

impl<T> DebouncedSearch<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Wrap a search function.
    pub fn new<F, Fut>(delay: Duration, search: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SyncResult<Vec<T>>> + Send + 'static,
    {
        let (results, _) = watch::channel(SearchResults::default());
        Self {
            delay,
            search: Arc::new(move |text| Box::pin(search(text))),
            results: Arc::new(results),
            generation: Arc::new(AtomicU64::new(0)),
            pending: Mutex::new(None),
        }
    }

    /// Feed the current text of the search box.
    ///
    /// Cancels any search still waiting or running. Blank text clears the
    /// results without querying.
    pub fn input(&self, text: &str) {
        let text = text.trim().to_string();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.cancel_pending();

        if text.is_empty() {
            self.results.send_replace(SearchResults::default());
            return;
        }

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let delay = self.delay;
        let search = Arc::clone(&self.search);
        let results = Arc::clone(&self.results);
        let latest = Arc::clone(&self.generation);

        let handle = tokio::spawn(async move {
            tokio::select! {
                () = token.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }
            let outcome = tokio::select! {
                () = token.cancelled() => return,
                outcome = search(text.clone()) => outcome,
            };
            if token.is_cancelled() || latest.load(Ordering::SeqCst) != generation {
                debug!(query = %text, "Dropping superseded search results");
                return;
            }
            let published = match outcome {
                Ok(items) => SearchResults {
                    query: text,
                    items,
                    error: None,
                },
                Err(e) => SearchResults {
                    query: text,
                    items: Vec::new(),
                    error: Some(e.user_message()),
                },
            };
            results.send_replace(published);
        });

        if let Ok(mut pending) = self.pending.lock() {
            *pending = Some(Pending { cancel, handle });
        }
    }

    /// Receiver for published results.
    #[must_use]
    pub fn results(&self) -> watch::Receiver<SearchResults<T>> {
        self.results.subscribe()
    }

    /// The most recently published results.
    #[must_use]
    pub fn current(&self) -> SearchResults<T> {
        self.results.borrow().clone()
    }

    /// Stop any waiting or running search.
    pub fn cancel(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_pending();
    }

    fn cancel_pending(&self) {
        let previous = self.pending.lock().ok().and_then(|mut pending| pending.take());
        if let Some(previous) = previous {
            previous.cancel.cancel();
            previous.handle.abort();
        }
    }
}

impl<T> Drop for DebouncedSearch<T> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock()
            && let Some(previous) = pending.take()
        {
            previous.cancel.cancel();
            previous.handle.abort();
        }
    }
}
