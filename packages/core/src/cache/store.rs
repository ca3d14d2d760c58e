//! Query Cache Service
//!
//! Process-wide, memory-resident cache of gateway reads, keyed by [`CacheKey`].
//! One explicitly constructed [`CacheService`] is shared (cheaply cloned) by
//! every reader and by the mutation coordinator; there is no global instance,
//! so each test builds its own.
//!
//! # Architecture
//!
//! - **Synchronous critical sections**: all entry changes happen under one
//!   `std::sync::Mutex`, never across an `.await`
//! - **Tickets**: every read registers a ticket and a cancel channel; a read
//!   whose ticket was canceled or superseded never writes
//! - **Staleness**: entries go stale when invalidated or after `stale_time`;
//!   stale entries are refetched on the next read, or right away when they are
//!   observed and `refetch_on_invalidate` is set
//! - **Observers**: each entry owns a `watch` channel carrying its
//!   [`QueryState`]; changes are also broadcast as [`CacheEvent`]s
//! - **Holds**: a mutation in flight holds the keys it patched; reads of a
//!   held key wait for the hold to be released and never write while it lasts
//!
//! # Examples
//!
//! ```rust
//! use cmdshelf_core::cache::{CacheKey, CacheService, CachedValue};
//! use cmdshelf_core::config::CacheConfig;
//! use cmdshelf_core::models::EntityKind;
//!
//! let cache = CacheService::new(CacheConfig::default()).unwrap();
//! let key = CacheKey::list(EntityKind::Command);
//! assert!(cache.get(&key).is_none());
//! assert!(cache.is_stale(&key));
//! ```

use crate::cache::{CacheEvent, CacheEventKind, CacheKey, QueryError};
use crate::config::{CacheConfig, ConfigError};
use crate::gateway::GatewayError;
use crate::models::{Command, Entity, EntityKind, WorkflowStep};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

/// Deferred gateway read that (re)populates one cache entry
pub type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<CachedValue, GatewayError>> + Send + Sync>;

/// Value stored under a cache key
#[derive(Debug, Clone, PartialEq)]
pub enum CachedValue {
    Entity(Entity),
    List(Vec<Entity>),
    StepsWithCommands(Vec<(WorkflowStep, Command)>),
    Count(i64),
    Names(Vec<String>),
}

impl CachedValue {
    /// Whether this value holds the entity `(kind, id)`
    pub fn contains(&self, kind: EntityKind, id: i64) -> bool {
        match self {
            CachedValue::Entity(entity) => entity.is(kind, id),
            CachedValue::List(items) => items.iter().any(|item| item.is(kind, id)),
            CachedValue::StepsWithCommands(pairs) => pairs.iter().any(|(step, command)| {
                (kind == EntityKind::WorkflowStep && step.id == id)
                    || (kind == EntityKind::Command && command.id == id)
            }),
            CachedValue::Count(_) | CachedValue::Names(_) => false,
        }
    }

    /// Apply `f` to every copy of `(kind, id)` in place, keeping element order
    ///
    /// Returns whether anything matched.
    pub fn update_entity(
        &mut self,
        kind: EntityKind,
        id: i64,
        f: &mut dyn FnMut(&mut Entity),
    ) -> bool {
        match self {
            CachedValue::Entity(entity) if entity.is(kind, id) => {
                f(entity);
                true
            }
            CachedValue::List(items) => {
                let mut matched = false;
                for item in items.iter_mut().filter(|item| item.is(kind, id)) {
                    f(item);
                    matched = true;
                }
                matched
            }
            CachedValue::StepsWithCommands(pairs) => {
                let mut matched = false;
                for (step, command) in pairs.iter_mut() {
                    if kind == EntityKind::WorkflowStep && step.id == id {
                        matched |= update_typed(step, f);
                    }
                    if kind == EntityKind::Command && command.id == id {
                        matched |= update_typed(command, f);
                    }
                }
                matched
            }
            _ => false,
        }
    }

    /// Drop `(kind, id)` from a list value; returns whether anything was removed
    pub fn remove_entity(&mut self, kind: EntityKind, id: i64) -> bool {
        match self {
            CachedValue::List(items) => {
                let before = items.len();
                items.retain(|item| !item.is(kind, id));
                items.len() != before
            }
            CachedValue::StepsWithCommands(pairs) => {
                let before = pairs.len();
                pairs.retain(|(step, command)| {
                    !((kind == EntityKind::WorkflowStep && step.id == id)
                        || (kind == EntityKind::Command && command.id == id))
                });
                pairs.len() != before
            }
            _ => false,
        }
    }

    pub fn shape(&self) -> &'static str {
        match self {
            CachedValue::Entity(_) => "an entity",
            CachedValue::List(_) => "an entity list",
            CachedValue::StepsWithCommands(_) => "a populated step list",
            CachedValue::Count(_) => "a count",
            CachedValue::Names(_) => "a name list",
        }
    }
}

fn update_typed<T>(value: &mut T, f: &mut dyn FnMut(&mut Entity)) -> bool
where
    T: Clone + Into<Entity> + TryFrom<Entity, Error = Entity>,
{
    let mut entity: Entity = value.clone().into();
    f(&mut entity);
    match T::try_from(entity) {
        Ok(updated) => {
            *value = updated;
            true
        }
        Err(_) => false,
    }
}

/// Lifecycle of a cached read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
    /// Nothing has been read yet
    Idle,
    /// First read in flight, no data yet
    Loading,
    /// Data present
    Success,
    /// Last read failed and there is no data
    Error,
}

/// Observable state of one cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState {
    pub status: QueryStatus,
    pub data: Option<CachedValue>,
    pub error: Option<GatewayError>,
    pub is_fetching: bool,
    pub is_stale: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

impl QueryState {
    fn idle() -> Self {
        Self {
            status: QueryStatus::Idle,
            data: None,
            error: None,
            is_fetching: false,
            is_stale: true,
            updated_at: None,
        }
    }
}

struct InFlight {
    ticket: u64,
    cancel: oneshot::Sender<()>,
}

struct CacheEntry {
    value: Option<CachedValue>,
    error: Option<GatewayError>,
    stale: bool,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
    last_access: Instant,
    in_flight: Option<InFlight>,
    fetcher: Option<Fetcher>,
    observers: watch::Sender<QueryState>,
}

impl CacheEntry {
    fn new() -> Self {
        let (observers, _) = watch::channel(QueryState::idle());
        Self {
            value: None,
            error: None,
            stale: false,
            fetched_at: None,
            updated_at: None,
            last_access: Instant::now(),
            in_flight: None,
            fetcher: None,
            observers,
        }
    }

    fn is_stale(&self, stale_time: std::time::Duration) -> bool {
        self.stale
            || self.value.is_none()
            || self
                .fetched_at
                .map_or(true, |fetched| fetched.elapsed() >= stale_time)
    }

    fn state(&self, stale_time: std::time::Duration) -> QueryState {
        let status = match (&self.value, &self.error, &self.in_flight) {
            (Some(_), _, _) => QueryStatus::Success,
            (None, _, Some(_)) => QueryStatus::Loading,
            (None, Some(_), None) => QueryStatus::Error,
            (None, None, None) => QueryStatus::Idle,
        };
        QueryState {
            status,
            data: self.value.clone(),
            error: self.error.clone(),
            is_fetching: self.in_flight.is_some(),
            is_stale: self.is_stale(stale_time),
            updated_at: self.updated_at,
        }
    }

    fn is_observed(&self) -> bool {
        self.observers.receiver_count() > 0
    }
}

/// Saved state of one entry, enough to restore it exactly
#[derive(Debug, Clone, PartialEq)]
struct EntrySnapshot {
    value: Option<CachedValue>,
    error: Option<GatewayError>,
    stale: bool,
    fetched_at: Option<Instant>,
    updated_at: Option<DateTime<Utc>>,
}

/// Saved entries taken before an optimistic write
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    entries: Vec<(CacheKey, Option<EntrySnapshot>)>,
}

impl Snapshot {
    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.entries.iter().map(|(key, _)| key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Keys a mutation in flight keeps reads away from
#[derive(Debug, Clone)]
struct Hold {
    kind: EntityKind,
    keys: Vec<CacheKey>,
}

impl Hold {
    fn covers(&self, key: &CacheKey) -> bool {
        key.list_kind() == Some(self.kind) || self.keys.contains(key)
    }
}

/// Releases a read hold when dropped
///
/// Settling a mutation releases its hold inside the settling transaction;
/// the guard only matters when a mutation is abandoned mid-flight.
pub struct ReadHold {
    cache: CacheService,
    id: u64,
}

impl ReadHold {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for ReadHold {
    fn drop(&mut self) {
        self.cache.release_hold(self.id);
    }
}

impl std::fmt::Debug for ReadHold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadHold").field("id", &self.id).finish()
    }
}

/// Statistics about the cache (for debugging/monitoring)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of entries, with or without data
    pub entries: usize,
    /// Entries holding data
    pub populated: usize,
    /// Entries currently considered stale
    pub stale: usize,
    /// Reads in flight
    pub fetching: usize,
    /// Mutations holding keys against reads
    pub holds: usize,
    /// Entries with at least one live observer
    pub observed: usize,
}

/// Locked view of the cache handed to synchronous critical sections
pub struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    next_ticket: u64,
    stale_time: std::time::Duration,
    refetch_on_invalidate: bool,
    events: Vec<CacheEvent>,
    refetch: Vec<(CacheKey, Fetcher)>,
    holds: HashMap<u64, Hold>,
    next_hold: u64,
    released: bool,
}

impl CacheState {
    fn emit(&mut self, kind: CacheEventKind, key: &CacheKey) {
        self.events.push(CacheEvent::new(kind, key.clone()));
    }

    fn publish(&self, key: &CacheKey) {
        if let Some(entry) = self.entries.get(key) {
            entry.observers.send_replace(entry.state(self.stale_time));
        }
    }

    fn entry_mut(&mut self, key: &CacheKey) -> &mut CacheEntry {
        self.entries.entry(key.clone()).or_insert_with(CacheEntry::new)
    }

    pub fn get(&self, key: &CacheKey) -> Option<&CachedValue> {
        self.entries.get(key).and_then(|entry| entry.value.as_ref())
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.entries
            .get(key)
            .map_or(true, |entry| entry.is_stale(self.stale_time))
    }

    /// Keys of entries matching `predicate`, in key order
    pub fn keys_where(&self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .keys()
            .filter(|key| predicate(key))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// Keys of entries whose value holds `(kind, id)`
    pub fn keys_containing(&self, kind: EntityKind, id: i64) -> Vec<CacheKey> {
        let mut keys: Vec<CacheKey> = self
            .entries
            .iter()
            .filter(|(_, entry)| {
                entry
                    .value
                    .as_ref()
                    .is_some_and(|value| value.contains(kind, id))
            })
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    /// Find any cached copy of `(kind, id)`, preferring the detail entry
    pub fn find_entity(&self, kind: EntityKind, id: i64) -> Option<Entity> {
        if let Some(CachedValue::Entity(entity)) = self.get(&CacheKey::detail(kind, id)) {
            return Some(entity.clone());
        }
        self.entries.values().find_map(|entry| match &entry.value {
            Some(CachedValue::List(items)) => items.iter().find(|item| item.is(kind, id)).cloned(),
            _ => None,
        })
    }

    /// Write a value without touching staleness
    pub fn set(&mut self, key: &CacheKey, value: CachedValue) {
        let entry = self.entry_mut(key);
        entry.value = Some(value);
        entry.error = None;
        entry.updated_at = Some(Utc::now());
        self.emit(CacheEventKind::Updated, key);
        self.publish(key);
    }

    /// Modify an existing value in place; returns what `f` returned, or
    /// `false` when the key holds no value
    pub fn update(&mut self, key: &CacheKey, f: impl FnOnce(&mut CachedValue) -> bool) -> bool {
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(value) = entry.value.as_mut() else {
            return false;
        };
        if !f(value) {
            return false;
        }
        entry.updated_at = Some(Utc::now());
        self.emit(CacheEventKind::Updated, key);
        self.publish(key);
        true
    }

    /// Mark matching entries stale; returns the keys touched
    pub fn invalidate_where(&mut self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let keys = self.keys_where(predicate);
        for key in &keys {
            if let Some(entry) = self.entries.get_mut(key) {
                entry.stale = true;
                if self.refetch_on_invalidate && entry.is_observed() {
                    if let Some(fetcher) = entry.fetcher.clone() {
                        self.refetch.push((key.clone(), fetcher));
                    }
                }
            }
            self.emit(CacheEventKind::Invalidated, key);
            self.publish(key);
        }
        keys
    }

    /// Drop matching entries' data; observed entries stay registered without a value
    pub fn remove_where(&mut self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let keys = self.keys_where(predicate);
        for key in &keys {
            self.cancel_key(key);
            let observed = self.entries.get(key).is_some_and(CacheEntry::is_observed);
            if observed {
                if let Some(entry) = self.entries.get_mut(key) {
                    entry.value = None;
                    entry.error = None;
                    entry.stale = true;
                    entry.fetched_at = None;
                    entry.updated_at = None;
                }
                self.publish(key);
            } else {
                self.entries.remove(key);
            }
            self.emit(CacheEventKind::Removed, key);
        }
        keys
    }

    fn cancel_key(&mut self, key: &CacheKey) -> bool {
        let Some(in_flight) = self.entries.get_mut(key).and_then(|entry| entry.in_flight.take())
        else {
            return false;
        };
        // The reader may already be gone
        let _ = in_flight.cancel.send(());
        self.emit(CacheEventKind::Cancelled, key);
        self.publish(key);
        true
    }

    /// Cancel in-flight reads on matching keys; returns the keys canceled
    pub fn cancel_where(&mut self, predicate: impl Fn(&CacheKey) -> bool) -> Vec<CacheKey> {
        let keys = self.keys_where(|key| predicate(key));
        keys.into_iter().filter(|key| self.cancel_key(key)).collect()
    }

    /// Hold every list of `kind` and each of `keys` against reads; returns the
    /// hold id to pass to [`CacheState::release_hold`]
    pub fn hold(&mut self, kind: EntityKind, keys: Vec<CacheKey>) -> u64 {
        self.next_hold += 1;
        self.holds.insert(self.next_hold, Hold { kind, keys });
        self.next_hold
    }

    /// Drop a hold, letting waiting reads start; returns `false` when it was
    /// already released
    pub fn release_hold(&mut self, id: u64) -> bool {
        if self.holds.remove(&id).is_none() {
            return false;
        }
        self.released = true;
        true
    }

    /// Whether a mutation in flight holds `key`
    pub fn is_held(&self, key: &CacheKey) -> bool {
        self.holds.values().any(|hold| hold.covers(key))
    }

    /// Save the current state of `keys` (missing keys are recorded as absent)
    pub fn snapshot<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> Snapshot {
        let mut entries: Vec<(CacheKey, Option<EntrySnapshot>)> = Vec::new();
        for key in keys {
            if entries.iter().any(|(saved, _)| saved == key) {
                continue;
            }
            let saved = self.entries.get(key).map(|entry| EntrySnapshot {
                value: entry.value.clone(),
                error: entry.error.clone(),
                stale: entry.stale,
                fetched_at: entry.fetched_at,
                updated_at: entry.updated_at,
            });
            entries.push((key.clone(), saved));
        }
        Snapshot { entries }
    }

    /// Put every saved entry back exactly as it was
    pub fn restore(&mut self, snapshot: &Snapshot) {
        for (key, saved) in &snapshot.entries {
            match saved {
                Some(saved) => {
                    let entry = self.entry_mut(key);
                    entry.value = saved.value.clone();
                    entry.error = saved.error.clone();
                    entry.stale = saved.stale;
                    entry.fetched_at = saved.fetched_at;
                    entry.updated_at = saved.updated_at;
                }
                None => {
                    if let Some(entry) = self.entries.get_mut(key) {
                        entry.value = None;
                        entry.error = None;
                        entry.fetched_at = None;
                        entry.updated_at = None;
                    }
                }
            }
            self.emit(CacheEventKind::RolledBack, key);
            self.publish(key);
        }
    }

    /// Register a read on `key`, superseding any read already in flight
    pub fn begin_fetch(
        &mut self,
        key: &CacheKey,
        fetcher: Option<Fetcher>,
    ) -> (u64, oneshot::Receiver<()>) {
        // A newer read supersedes the one in flight
        self.cancel_key(key);

        self.next_ticket += 1;
        let ticket = self.next_ticket;
        let (cancel, cancelled) = oneshot::channel();

        let entry = self.entry_mut(key);
        entry.in_flight = Some(InFlight { ticket, cancel });
        entry.last_access = Instant::now();
        if let Some(fetcher) = fetcher {
            entry.fetcher = Some(fetcher);
        }
        self.publish(key);
        (ticket, cancelled)
    }

    /// Settle a read; returns `false` (writing nothing) when the ticket is no
    /// longer current or a mutation holds the key
    pub fn complete_fetch(
        &mut self,
        key: &CacheKey,
        ticket: u64,
        result: Result<CachedValue, GatewayError>,
    ) -> bool {
        let held = self.is_held(key);
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        if entry.in_flight.as_ref().map(|f| f.ticket) != Some(ticket) {
            return false;
        }
        entry.in_flight = None;
        if held {
            self.emit(CacheEventKind::Cancelled, key);
            self.publish(key);
            return false;
        }

        let kind = match result {
            Ok(value) => {
                entry.value = Some(value);
                entry.error = None;
                entry.stale = false;
                entry.fetched_at = Some(Instant::now());
                entry.updated_at = Some(Utc::now());
                CacheEventKind::Fetched
            }
            Err(error) => {
                entry.error = Some(error);
                CacheEventKind::FetchFailed
            }
        };
        self.emit(kind, key);
        self.publish(key);
        true
    }

    fn collect_garbage(&mut self, gc_time: std::time::Duration) -> usize {
        let expired = self.keys_where(|_| true);
        let mut removed = 0;
        for key in expired {
            let collectable = self.entries.get(&key).is_some_and(|entry| {
                !entry.is_observed()
                    && entry.in_flight.is_none()
                    && entry.last_access.elapsed() >= gc_time
            });
            if collectable {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            populated: self.entries.values().filter(|e| e.value.is_some()).count(),
            stale: self
                .entries
                .values()
                .filter(|e| e.is_stale(self.stale_time))
                .count(),
            fetching: self.entries.values().filter(|e| e.in_flight.is_some()).count(),
            observed: self.entries.values().filter(|e| e.is_observed()).count(),
            holds: self.holds.len(),
        }
    }
}

struct Inner {
    state: Mutex<CacheState>,
    events: broadcast::Sender<CacheEvent>,
    /// Bumped whenever a hold is released
    releases: watch::Sender<u64>,
    config: CacheConfig,
}

/// Shared handle to the query cache
#[derive(Clone)]
pub struct CacheService {
    inner: Arc<Inner>,
}

impl Default for CacheService {
    fn default() -> Self {
        Self::build(CacheConfig::default())
    }
}

impl CacheService {
    /// Build a cache after checking `config`
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: CacheConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity);
        let state = CacheState {
            entries: HashMap::new(),
            next_ticket: 0,
            stale_time: config.stale_time,
            refetch_on_invalidate: config.refetch_on_invalidate,
            events: Vec::new(),
            refetch: Vec::new(),
            holds: HashMap::new(),
            next_hold: 0,
            released: false,
        };
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                events,
                releases: watch::channel(0).0,
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` atomically with respect to every other cache operation
    ///
    /// Events raised inside are broadcast, and background refetches spawned,
    /// only after the lock is released.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut CacheState) -> R) -> R {
        let (result, events, refetch, released) = {
            let mut state = self.lock();
            let result = f(&mut state);
            let events = std::mem::take(&mut state.events);
            let refetch = std::mem::take(&mut state.refetch);
            let released = std::mem::take(&mut state.released);
            (result, events, refetch, released)
        };

        for event in events {
            // No subscribers is fine
            let _ = self.inner.events.send(event);
        }
        if released {
            self.inner.releases.send_modify(|count| *count += 1);
        }
        if !refetch.is_empty() {
            self.spawn_refetches(refetch);
        }
        result
    }

    fn spawn_refetches(&self, refetch: Vec<(CacheKey, Fetcher)>) -> bool {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::debug!(
                "No runtime available, {} refetch(es) deferred to next read",
                refetch.len()
            );
            return false;
        };
        for (key, fetcher) in refetch {
            handle.spawn(refetch_task(self.clone(), key, fetcher));
        }
        true
    }

    pub fn get(&self, key: &CacheKey) -> Option<CachedValue> {
        self.transaction(|state| state.get(key).cloned())
    }

    /// Value for `key` only if it is still fresh
    pub fn get_fresh(&self, key: &CacheKey) -> Option<CachedValue> {
        self.transaction(|state| {
            if state.is_stale(key) {
                None
            } else {
                state.get(key).cloned()
            }
        })
    }

    pub fn is_stale(&self, key: &CacheKey) -> bool {
        self.transaction(|state| state.is_stale(key))
    }

    pub fn is_fetching(&self, key: &CacheKey) -> bool {
        self.transaction(|state| {
            state
                .entries
                .get(key)
                .is_some_and(|entry| entry.in_flight.is_some())
        })
    }

    pub fn state(&self, key: &CacheKey) -> QueryState {
        self.transaction(|state| {
            state
                .entries
                .get(key)
                .map_or_else(QueryState::idle, |entry| entry.state(state.stale_time))
        })
    }

    /// Watch one entry; the receiver sees every state change
    pub fn subscribe(&self, key: &CacheKey) -> watch::Receiver<QueryState> {
        self.transaction(|state| {
            let stale_time = state.stale_time;
            let entry = state.entry_mut(key);
            entry.last_access = Instant::now();
            entry.observers.send_replace(entry.state(stale_time));
            entry.observers.subscribe()
        })
    }

    /// Watch one entry and register the fetcher that refreshes it
    pub fn observe(&self, key: &CacheKey, fetcher: Fetcher) -> watch::Receiver<QueryState> {
        self.transaction(|state| {
            let stale_time = state.stale_time;
            let entry = state.entry_mut(key);
            entry.fetcher = Some(fetcher);
            entry.last_access = Instant::now();
            entry.observers.send_replace(entry.state(stale_time));
            entry.observers.subscribe()
        })
    }

    /// Spawn a background read of `key` when it is stale and idle
    ///
    /// Returns whether a read was scheduled.
    pub fn prefetch(&self, key: &CacheKey) -> bool {
        let fetcher = self.transaction(|state| {
            let stale = state.is_stale(key);
            let entry = state.entries.get(key)?;
            if !stale || entry.in_flight.is_some() {
                return None;
            }
            entry.fetcher.clone()
        });
        match fetcher {
            Some(fetcher) => self.spawn_refetches(vec![(key.clone(), fetcher)]),
            None => false,
        }
    }

    /// Cancel the read on `key` unless another observer still watches it
    pub fn release(&self, key: &CacheKey) -> bool {
        self.transaction(|state| {
            let shared = state
                .entries
                .get(key)
                .is_some_and(|entry| entry.observers.receiver_count() > 1);
            !shared && state.cancel_key(key)
        })
    }

    /// Stream of cache change notifications
    pub fn events(&self) -> BroadcastStream<CacheEvent> {
        BroadcastStream::new(self.inner.events.subscribe())
    }

    /// Raw broadcast receiver, for callers that prefer `recv().await`
    pub fn event_receiver(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Write a value directly; reserved for the mutation coordinator and tests
    pub fn set(&self, key: &CacheKey, value: CachedValue) {
        self.transaction(|state| state.set(key, value))
    }

    /// Mark one entry stale
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        !self
            .transaction(|state| state.invalidate_where(|candidate| candidate == key))
            .is_empty()
    }

    /// Drop one entry's data
    pub fn remove(&self, key: &CacheKey) -> bool {
        !self
            .transaction(|state| state.remove_where(|candidate| candidate == key))
            .is_empty()
    }

    /// Cancel the read in flight on `key`, if any
    pub fn cancel(&self, key: &CacheKey) -> bool {
        self.transaction(|state| state.cancel_key(key))
    }

    pub fn snapshot(&self, keys: &[CacheKey]) -> Snapshot {
        self.transaction(|state| state.snapshot(keys))
    }

    pub fn restore(&self, snapshot: &Snapshot) {
        self.transaction(|state| state.restore(snapshot))
    }

    /// Hold every list of `kind` and each of `keys` against reads until the
    /// returned guard is dropped
    pub fn hold(&self, kind: EntityKind, keys: Vec<CacheKey>) -> ReadHold {
        let id = self.transaction(|state| state.hold(kind, keys));
        self.adopt_hold(id)
    }

    /// Guard a hold taken inside a transaction with [`CacheState::hold`]
    pub fn adopt_hold(&self, id: u64) -> ReadHold {
        ReadHold {
            cache: self.clone(),
            id,
        }
    }

    pub fn release_hold(&self, id: u64) -> bool {
        self.transaction(|state| state.release_hold(id))
    }

    pub fn is_held(&self, key: &CacheKey) -> bool {
        self.transaction(|state| state.is_held(key))
    }

    /// Start a read driven by the caller; pair with [`CacheService::complete_fetch`]
    pub fn begin_fetch(&self, key: &CacheKey) -> (u64, oneshot::Receiver<()>) {
        self.transaction(|state| state.begin_fetch(key, None))
    }

    /// Settle a read started with [`CacheService::begin_fetch`]; returns
    /// whether the result was written
    pub fn complete_fetch(
        &self,
        key: &CacheKey,
        ticket: u64,
        result: Result<CachedValue, GatewayError>,
    ) -> bool {
        self.transaction(|state| state.complete_fetch(key, ticket, result))
    }

    pub fn invalidate_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.transaction(|state| state.invalidate_where(|key| key.starts_with(prefix)))
    }

    pub fn remove_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.transaction(|state| state.remove_where(|key| key.starts_with(prefix)))
    }

    pub fn cancel_prefix(&self, prefix: &CacheKey) -> Vec<CacheKey> {
        self.transaction(|state| state.cancel_where(|key| key.starts_with(prefix)))
    }

    /// Every populated entry, for whole-cache comparisons
    pub fn dump(&self) -> BTreeMap<CacheKey, CachedValue> {
        self.transaction(|state| {
            state
                .entries
                .iter()
                .filter_map(|(key, entry)| entry.value.clone().map(|value| (key.clone(), value)))
                .collect()
        })
    }

    pub fn stats(&self) -> CacheStats {
        self.transaction(|state| state.stats())
    }

    /// Drop unobserved, idle entries untouched for longer than `gc_time`
    pub fn collect_garbage(&self) -> usize {
        let gc_time = self.inner.config.gc_time;
        self.transaction(|state| state.collect_garbage(gc_time))
    }

    /// Read `key` through `fetcher`, writing the result unless the read is
    /// canceled or superseded first
    ///
    /// A read of a held key waits until the hold is released, so it only
    /// ever sees the authority after the mutation settled. Transient gateway
    /// failures are retried up to `read_retry` times with exponential backoff.
    pub async fn fetch(&self, key: &CacheKey, fetcher: Fetcher) -> Result<CachedValue, QueryError> {
        let gc_time = self.inner.config.gc_time;
        let (ticket, mut cancelled) = loop {
            let mut releases = self.inner.releases.subscribe();
            let begun = self.transaction(|state| {
                if state.is_held(key) {
                    return None;
                }
                state.collect_garbage(gc_time);
                Some(state.begin_fetch(key, Some(fetcher.clone())))
            });
            match begun {
                Some(begun) => break begun,
                None => {
                    tracing::debug!("Read for {} waits for a mutation to settle", key);
                    // The sender lives as long as the cache
                    let _ = releases.changed().await;
                }
            }
        };

        let mut attempt: u32 = 0;
        let result = loop {
            let outcome = tokio::select! {
                result = fetcher() => result,
                _ = &mut cancelled => {
                    tracing::debug!("Read for {} canceled before it settled", key);
                    return Err(QueryError::cancelled(key));
                }
            };

            match outcome {
                Err(error) if error.is_transient() && attempt < self.inner.config.read_retry => {
                    tracing::debug!(
                        "Transient read failure on attempt {}/{} for {}: {}. Retrying...",
                        attempt + 1,
                        self.inner.config.read_retry + 1,
                        key,
                        error
                    );
                    let backoff = self.inner.config.retry_delay * (1u32 << attempt.min(16));
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = &mut cancelled => return Err(QueryError::cancelled(key)),
                    }
                    attempt += 1;
                }
                other => break other,
            }
        };

        let written = self.transaction(|state| state.complete_fetch(key, ticket, result.clone()));
        if !written {
            return Err(QueryError::cancelled(key));
        }
        result.map_err(|error| {
            tracing::warn!("Read for {} failed: {}", key, error);
            QueryError::Remote(error)
        })
    }
}

fn refetch_task(cache: CacheService, key: CacheKey, fetcher: Fetcher) -> BoxFuture<'static, ()> {
    Box::pin(async move {
        if let Err(error) = cache.fetch(&key, fetcher).await {
            tracing::debug!("Background refetch of {} did not settle: {}", key, error);
        }
    })
}

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;
