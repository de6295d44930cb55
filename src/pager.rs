//! Paginated list loader with a per-page cache and background prefetch.
//!
//! Every network fetch runs as a spawned task behind a shared future, so
//! concurrent requests for one page join the same fetch and a fetch keeps
//! going (and fills the cache) even when the caller stops waiting for it.

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::FetchError;

/// List endpoint payload: `{items, total}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PageResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
}

/// Anything that serves fixed-size pages of a list.
#[async_trait]
pub trait PageSource<T>: Send + Sync {
    async fn fetch_page(&self, page: u32, page_size: u32) -> Result<PageResponse<T>, FetchError>;
}

/// One cached page. Replaced wholesale, never merged.
#[derive(Debug, PartialEq)]
pub struct Page<T> {
    pub index: u32,
    pub items: Vec<T>,
    pub total: u64,
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("failed to load page {page}: {source}")]
    Fetch {
        page: u32,
        source: Arc<FetchError>,
    },
    #[error("page loader is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagerConfig {
    pub page_size: u32,
    /// Upper bound on cached pages; `None` keeps every page for the life of the view.
    pub max_cached_pages: Option<usize>,
}

impl Default for PagerConfig {
    fn default() -> Self {
        Self {
            page_size: 20,
            max_cached_pages: None,
        }
    }
}

/// Smallest cache bound that holds the current page plus a full prefetch window.
pub const MIN_BOUNDED_CACHE: usize = 4;

/// Pages worth warming around `page`: the previous one and the next two.
/// Indices below 1, and past `total_pages` when it is known, are skipped.
pub fn prefetch_window(page: u32, total_pages: Option<u32>) -> Vec<u32> {
    let candidates = [page.checked_sub(1), page.checked_add(1), page.checked_add(2)];
    candidates
        .into_iter()
        .flatten()
        .filter(|p| *p >= 1)
        .filter(|p| total_pages.map_or(true, |last| *p <= last))
        .collect()
}

/// Navigation bounds for callers; the loader itself does not validate indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pagination {
    pub page: u32,
    pub page_size: u32,
    pub total: u64,
}

impl Pagination {
    pub fn total_pages(&self) -> u32 {
        total_pages(self.total, self.page_size)
    }

    pub fn can_go_previous(&self) -> bool {
        self.page > 1
    }

    pub fn can_go_next(&self) -> bool {
        self.page < self.total_pages()
    }

    /// Clamp a requested index into `1..=total_pages` (page 1 for an empty list).
    pub fn clamp(&self, page: u32) -> u32 {
        page.clamp(1, self.total_pages().max(1))
    }
}

fn total_pages(total: u64, page_size: u32) -> u32 {
    if page_size == 0 {
        return 0;
    }
    let pages = total.div_ceil(u64::from(page_size));
    u32::try_from(pages).unwrap_or(u32::MAX)
}

type FetchOutcome<T> = Result<Arc<Page<T>>, LoadError>;
type PendingFetch<T> = Shared<BoxFuture<'static, FetchOutcome<T>>>;

enum Lookup<T> {
    Hit(Arc<Page<T>>),
    Pending(PendingFetch<T>),
}

struct Entry<T> {
    page: Arc<Page<T>>,
    last_used: u64,
}

struct LoaderState<T> {
    pages: HashMap<u32, Entry<T>>,
    in_flight: HashMap<u32, PendingFetch<T>>,
    current: Option<u32>,
    total: Option<u64>,
    /// Bumped on refresh; fetches from an older generation are not cached.
    generation: u64,
    clock: u64,
    background: Vec<JoinHandle<()>>,
    closed: bool,
}

impl<T> LoaderState<T> {
    fn new() -> Self {
        Self {
            pages: HashMap::new(),
            in_flight: HashMap::new(),
            current: None,
            total: None,
            generation: 0,
            clock: 0,
            background: Vec::new(),
            closed: false,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn evict(&mut self, limit: Option<usize>) {
        let Some(limit) = limit else {
            return;
        };
        while self.pages.len() > limit {
            let victim = self
                .pages
                .iter()
                .filter(|(index, _)| Some(**index) != self.current)
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(index, _)| *index);
            match victim {
                Some(index) => {
                    self.pages.remove(&index);
                    debug!(page = index, "evicted page from cache");
                }
                None => break,
            }
        }
    }
}

struct LoaderInner<T> {
    source: Arc<dyn PageSource<T>>,
    config: PagerConfig,
    state: Mutex<LoaderState<T>>,
}

impl<T: Send + Sync + 'static> LoaderInner<T> {
    fn lock(&self) -> MutexGuard<'_, LoaderState<T>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn complete(
        &self,
        page: u32,
        generation: u64,
        outcome: Result<PageResponse<T>, FetchError>,
    ) -> FetchOutcome<T> {
        let mut state = self.lock();
        let current_generation = state.generation == generation;
        if current_generation {
            state.in_flight.remove(&page);
        }
        match outcome {
            Ok(response) => {
                let total = response.total;
                let loaded = Arc::new(Page {
                    index: page,
                    items: response.items,
                    total,
                });
                if current_generation && !state.closed {
                    state.total = Some(total);
                    let last_used = state.tick();
                    state.pages.insert(
                        page,
                        Entry {
                            page: Arc::clone(&loaded),
                            last_used,
                        },
                    );
                    state.evict(self.config.max_cached_pages);
                    debug!(page, items = loaded.items.len(), total, "page cached");
                } else {
                    debug!(page, "discarding page from a superseded fetch");
                }
                Ok(loaded)
            }
            Err(err) => {
                warn!(%err, page, "page fetch failed");
                Err(LoadError::Fetch {
                    page,
                    source: Arc::new(err),
                })
            }
        }
    }
}

/// Serves list pages from cache and keeps a small window around the current
/// page warm. Owned by one list view; dropping it cancels background fetches.
pub struct PageLoader<T> {
    inner: Arc<LoaderInner<T>>,
}

impl<T: Send + Sync + 'static> PageLoader<T> {
    pub fn new(source: Arc<dyn PageSource<T>>, config: PagerConfig) -> Self {
        Self {
            inner: Arc::new(LoaderInner {
                source,
                config,
                state: Mutex::new(LoaderState::new()),
            }),
        }
    }

    pub fn page_size(&self) -> u32 {
        self.inner.config.page_size
    }

    /// Synchronous cache lookup; never touches the network.
    pub fn cached(&self, page: u32) -> Option<Arc<Page<T>>> {
        let mut state = self.inner.lock();
        let last_used = state.tick();
        let entry = state.pages.get_mut(&page)?;
        entry.last_used = last_used;
        Some(Arc::clone(&entry.page))
    }

    pub fn is_loading(&self, page: u32) -> bool {
        self.inner.lock().in_flight.contains_key(&page)
    }

    pub fn cached_pages(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.inner.lock().pages.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    pub fn current_page(&self) -> Option<u32> {
        self.inner.lock().current
    }

    /// Total item count from the most recent successful fetch.
    pub fn total(&self) -> Option<u64> {
        self.inner.lock().total
    }

    pub fn total_pages(&self) -> Option<u32> {
        self.total().map(|total| total_pages(total, self.page_size()))
    }

    pub fn pagination(&self) -> Option<Pagination> {
        let state = self.inner.lock();
        Some(Pagination {
            page: state.current?,
            page_size: self.inner.config.page_size,
            total: state.total?,
        })
    }

    /// Return `page` from cache, or join/start its fetch and wait for it.
    pub async fn load(&self, page: u32) -> Result<Arc<Page<T>>, LoadError> {
        match self.lookup(page)? {
            Lookup::Hit(cached) => Ok(cached),
            Lookup::Pending(fetch) => fetch.await,
        }
    }

    /// Make `page` the current page, warm its neighbours and load it.
    pub async fn navigate(&self, page: u32) -> Result<Arc<Page<T>>, LoadError> {
        self.inner.lock().current = Some(page);
        let lookup = self.lookup(page)?;
        let prefetched = self.total().is_some();
        if prefetched {
            self.prefetch(page);
        }
        let result = match lookup {
            Lookup::Hit(cached) => Ok(cached),
            Lookup::Pending(fetch) => fetch.await,
        };
        if !prefetched {
            self.prefetch(page);
        }
        result
    }

    /// Start background fetches for window pages that are neither cached nor
    /// in flight. Returns the pages that were started.
    pub fn prefetch(&self, page: u32) -> Vec<u32> {
        let window = prefetch_window(page, self.total_pages());
        if let Some(limit) = self.inner.config.max_cached_pages {
            // Prefetched pages would evict each other before they are used.
            if limit <= window.len() {
                debug!(page, limit, "cache bound too small for prefetch; skipping");
                return Vec::new();
            }
        }
        let mut started = Vec::new();
        for candidate in window {
            let missing = {
                let state = self.inner.lock();
                !state.closed
                    && !state.pages.contains_key(&candidate)
                    && !state.in_flight.contains_key(&candidate)
            };
            if missing && matches!(self.lookup(candidate), Ok(Lookup::Pending(_))) {
                started.push(candidate);
            }
        }
        if !started.is_empty() {
            debug!(page, ?started, "prefetching neighbouring pages");
        }
        started
    }

    /// Drop every cached page and forget in-flight fetches; their results will
    /// not be cached. Reloads the current page when there is one.
    pub async fn refresh(&self) -> Result<Option<Arc<Page<T>>>, LoadError> {
        let current = {
            let mut state = self.inner.lock();
            state.generation += 1;
            state.pages.clear();
            state.in_flight.clear();
            state.current
        };
        debug!(?current, "page cache invalidated");
        match current {
            Some(page) => self.navigate(page).await.map(Some),
            None => Ok(None),
        }
    }

    /// Cancel all background fetches. The loader refuses further loads.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        state.in_flight.clear();
        for handle in state.background.drain(..) {
            handle.abort();
        }
        debug!("page loader closed");
    }

    fn lookup(&self, page: u32) -> Result<Lookup<T>, LoadError> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(LoadError::Closed);
        }
        let last_used = state.tick();
        if let Some(entry) = state.pages.get_mut(&page) {
            entry.last_used = last_used;
            return Ok(Lookup::Hit(Arc::clone(&entry.page)));
        }
        if let Some(fetch) = state.in_flight.get(&page) {
            return Ok(Lookup::Pending(fetch.clone()));
        }

        let generation = state.generation;
        let page_size = self.inner.config.page_size;
        let inner = Arc::clone(&self.inner);
        let fetch: PendingFetch<T> = async move {
            debug!(page, page_size, "fetching page");
            let outcome = inner.source.fetch_page(page, page_size).await;
            inner.complete(page, generation, outcome)
        }
        .boxed()
        .shared();

        state.in_flight.insert(page, fetch.clone());
        state.background.retain(|handle| !handle.is_finished());
        let driver = fetch.clone();
        state.background.push(tokio::spawn(async move {
            let _ = driver.await;
        }));
        Ok(Lookup::Pending(fetch))
    }
}

impl<T> Drop for PageLoader<T> {
    fn drop(&mut self) {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.closed = true;
        state.in_flight.clear();
        for handle in state.background.drain(..) {
            handle.abort();
        }
    }
}
