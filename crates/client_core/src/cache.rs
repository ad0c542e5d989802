//! Keyed query cache with stale times, in-flight request sharing, polling
//! and invalidating mutations.
//!
//! Values are stored as JSON so one cache can hold every resource type; typed
//! accessors deserialize on the way out.

use std::{collections::HashMap, fmt, future::Future, sync::Arc, time::Duration};

use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    error::{ClientError, Result},
    ClientEvent, Toast,
};

/// Ordered key segments: the resource name followed by its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    pub fn resource(name: &str) -> Self {
        Self(vec![name.to_string()])
    }

    pub fn with(mut self, segment: impl fmt::Display) -> Self {
        self.0.push(segment.to_string());
        self
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", self.0.join(", "))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryOptions {
    /// How long a cached value is served without refetching.
    pub stale_time: Duration,
    /// Fixed polling interval for live resources.
    pub refetch_interval: Option<Duration>,
}

impl QueryOptions {
    pub const MESSAGES: Self = Self::stale(Duration::from_secs(60));
    pub const TEMPLATES: Self = Self::stale(Duration::from_secs(5 * 60));
    pub const CAMPAIGNS: Self = Self::stale(Duration::from_secs(2 * 60));
    pub const PREFERENCES: Self = Self::stale(Duration::from_secs(10 * 60));
    pub const BRANCHES: Self = Self::stale(Duration::from_secs(5 * 60));
    pub const LIVE: Self = Self::polling(Duration::from_secs(30));

    pub const fn stale(stale_time: Duration) -> Self {
        Self {
            stale_time,
            refetch_interval: None,
        }
    }

    pub const fn polling(interval: Duration) -> Self {
        Self {
            stale_time: Duration::ZERO,
            refetch_interval: Some(interval),
        }
    }
}

/// Latest outcome of a polled query. Data survives a failed refetch.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
    pub data: Option<T>,
    pub error: Option<Arc<ClientError>>,
    pub updated_at: Option<Instant>,
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            updated_at: None,
        }
    }
}

impl<T> QueryState<T> {
    pub fn is_loading(&self) -> bool {
        self.data.is_none() && self.error.is_none()
    }
}

/// Invalidations and notifications attached to a mutation.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub error_title: String,
    pub invalidates: Vec<QueryKey>,
    pub success_toast: Option<Toast>,
}

impl Mutation {
    pub fn new(error_title: impl Into<String>) -> Self {
        Self {
            error_title: error_title.into(),
            invalidates: Vec::new(),
            success_toast: None,
        }
    }

    pub fn invalidate(mut self, key: QueryKey) -> Self {
        self.invalidates.push(key);
        self
    }

    pub fn on_success(mut self, title: &str, description: &str) -> Self {
        self.success_toast = Some(Toast::new(title, description));
        self
    }
}

type SharedFetch = Shared<BoxFuture<'static, Result<Arc<Value>, Arc<ClientError>>>>;

struct Entry {
    value: Arc<Value>,
    fetched_at: Instant,
}

struct InFlight {
    id: u64,
    future: SharedFetch,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<QueryKey, Entry>,
    in_flight: HashMap<QueryKey, InFlight>,
    next_fetch_id: u64,
}

#[derive(Clone)]
pub struct QueryCache {
    state: Arc<Mutex<CacheState>>,
    events: broadcast::Sender<ClientEvent>,
}

impl QueryCache {
    pub fn new(events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState::default())),
            events,
        }
    }

    /// Serves a fresh cached value, joins a running request for the same key,
    /// or starts one.
    pub async fn fetch<T, F, Fut>(&self, key: &QueryKey, options: QueryOptions, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let value = self.load(key, Some(options.stale_time), fetcher).await?;
        Ok(T::deserialize(value.as_ref())?)
    }

    /// Like [`fetch`](Self::fetch) but ignores freshness. Still shares a
    /// request that is already running.
    pub async fn refetch<T, F, Fut>(&self, key: &QueryKey, fetcher: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let value = self.load(key, None, fetcher).await?;
        Ok(T::deserialize(value.as_ref())?)
    }

    pub fn events(&self) -> &broadcast::Sender<ClientEvent> {
        &self.events
    }

    pub fn get_cached<T: DeserializeOwned>(&self, key: &QueryKey) -> Option<T> {
        let value = self.state.lock().entries.get(key)?.value.clone();
        T::deserialize(value.as_ref()).ok()
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        self.state.lock().entries.contains_key(key)
    }

    /// Drops every entry under `prefix`. Requests still running for those
    /// keys complete for their callers but are not stored.
    pub fn invalidate(&self, prefix: &QueryKey) {
        let mut state = self.state.lock();
        let before = state.entries.len() + state.in_flight.len();
        state.entries.retain(|key, _| !key.starts_with(prefix));
        state.in_flight.retain(|key, _| !key.starts_with(prefix));
        let dropped = before - state.entries.len() - state.in_flight.len();
        debug!(key = %prefix, dropped, "invalidated queries");
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.in_flight.clear();
    }

    /// Runs a mutation. Success invalidates the listed keys; failure raises a
    /// destructive toast. Nothing is retried.
    pub async fn mutate<T, Fut>(&self, mutation: Mutation, action: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match action.await {
            Ok(value) => {
                for key in &mutation.invalidates {
                    self.invalidate(key);
                }
                if let Some(toast) = mutation.success_toast {
                    let _ = self.events.send(ClientEvent::Toast(toast));
                }
                Ok(value)
            }
            Err(err) => {
                warn!(title = %mutation.error_title, "mutation failed: {err}");
                let _ = self.events.send(ClientEvent::Toast(Toast::destructive(
                    &mutation.error_title,
                    &err.user_message(),
                )));
                Err(err)
            }
        }
    }

    /// Refetches `key` every `interval` until the handle is dropped,
    /// publishing each outcome.
    pub fn poll<T, F, Fut>(
        &self,
        key: QueryKey,
        interval: Duration,
        fetcher: F,
    ) -> (PollHandle, watch::Receiver<QueryState<T>>)
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (tx, rx) = watch::channel(QueryState::default());
        let cache = self.clone();
        let fetcher = Arc::new(fetcher);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let fetcher = Arc::clone(&fetcher);
                let result = cache.refetch(&key, move || (*fetcher)()).await;
                tx.send_modify(|state| {
                    match result {
                        Ok(data) => {
                            state.data = Some(data);
                            state.error = None;
                        }
                        Err(err) => {
                            debug!(key = %key, "poll failed: {err}");
                            state.error = Some(Arc::new(err));
                        }
                    }
                    state.updated_at = Some(Instant::now());
                });
                if tx.is_closed() {
                    break;
                }
            }
        });
        (PollHandle::new(task), rx)
    }

    async fn load<T, F, Fut>(
        &self,
        key: &QueryKey,
        stale_time: Option<Duration>,
        fetcher: F,
    ) -> Result<Arc<Value>>
    where
        T: Serialize + Send + 'static,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let (id, future) = {
            let mut state = self.state.lock();
            if let (Some(stale_time), Some(entry)) = (stale_time, state.entries.get(key)) {
                if entry.fetched_at.elapsed() < stale_time {
                    return Ok(Arc::clone(&entry.value));
                }
            }
            let running = state
                .in_flight
                .get(key)
                .map(|running| (running.id, running.future.clone()));
            match running {
                Some(running) => running,
                None => {
                    let id = state.next_fetch_id;
                    state.next_fetch_id += 1;
                    let future: SharedFetch = run_fetch(fetcher).boxed().shared();
                    state.in_flight.insert(
                        key.clone(),
                        InFlight {
                            id,
                            future: future.clone(),
                        },
                    );
                    (id, future)
                }
            }
        };

        let result = future.await;

        let mut state = self.state.lock();
        if state.in_flight.get(key).is_some_and(|running| running.id == id) {
            state.in_flight.remove(key);
            if let Ok(value) = &result {
                state.entries.insert(
                    key.clone(),
                    Entry {
                        value: Arc::clone(value),
                        fetched_at: Instant::now(),
                    },
                );
            }
        }
        result.map_err(ClientError::Shared)
    }
}

async fn run_fetch<T, F, Fut>(fetcher: F) -> Result<Arc<Value>, Arc<ClientError>>
where
    T: Serialize,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let value = fetcher().await.map_err(Arc::new)?;
    let value = serde_json::to_value(value).map_err(|err| Arc::new(ClientError::from(err)))?;
    Ok(Arc::new(value))
}

/// Stops the polling task when dropped.
pub struct PollHandle {
    task: JoinHandle<()>,
}

impl PollHandle {
    pub(crate) fn new(task: JoinHandle<()>) -> Self {
        Self { task }
    }

    /// Same as dropping the handle.
    pub fn stop(self) {
        self.task.abort();
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
#[path = "tests/cache_tests.rs"]
mod tests;
