//! Query Service
//!
//! Consumer-facing reads. Every read returns a [`QueryHandle`] that watches
//! one cache entry: the current data plus loading, error and staleness status,
//! updated whenever the entry changes. Opening a handle on a stale entry
//! schedules a background read; dropping the last handle on an entry cancels
//! its pending read without writing anything.
//!
//! # Examples
//!
//! ```rust
//! use cmdshelf_core::cache::CacheService;
//! use cmdshelf_core::gateway::InMemoryGateway;
//! use cmdshelf_core::models::{Command, EntityKind, FilterScope};
//! use cmdshelf_core::services::QueryService;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let gateway = Arc::new(InMemoryGateway::new());
//! gateway.insert(Command::draft("status", "git status"));
//!
//! let queries = QueryService::new(CacheService::default(), gateway);
//! let mut commands = queries.list(EntityKind::Command, &FilterScope::root());
//! let listed = commands.settled().await.unwrap();
//! assert_eq!(listed.len(), 1);
//! # });
//! ```

use crate::cache::{
    CacheKey, CacheService, CachedValue, Fetcher, QueryError, QueryState, QueryStatus,
};
use crate::gateway::{CountQuery, EntityGateway, GatewayResult};
use crate::models::{
    Category, Command, Entity, EntityKind, FilterScope, Group, Workflow, WorkflowStep,
};
use futures::future::BoxFuture;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use tokio::sync::watch;

/// Typed view of a cached value
pub trait FromCached: Sized {
    /// Shape named in decode errors
    const SHAPE: &'static str;

    fn from_cached(value: &CachedValue) -> Option<Self>;
}

impl FromCached for Entity {
    const SHAPE: &'static str = "an entity";

    fn from_cached(value: &CachedValue) -> Option<Self> {
        match value {
            CachedValue::Entity(entity) => Some(entity.clone()),
            _ => None,
        }
    }
}

impl FromCached for Vec<Entity> {
    const SHAPE: &'static str = "an entity list";

    fn from_cached(value: &CachedValue) -> Option<Self> {
        match value {
            CachedValue::List(items) => Some(items.clone()),
            _ => None,
        }
    }
}

impl FromCached for i64 {
    const SHAPE: &'static str = "a count";

    fn from_cached(value: &CachedValue) -> Option<Self> {
        match value {
            CachedValue::Count(count) => Some(*count),
            _ => None,
        }
    }
}

impl FromCached for Vec<String> {
    const SHAPE: &'static str = "a name list";

    fn from_cached(value: &CachedValue) -> Option<Self> {
        match value {
            CachedValue::Names(names) => Some(names.clone()),
            _ => None,
        }
    }
}

impl FromCached for Vec<(WorkflowStep, Command)> {
    const SHAPE: &'static str = "a populated step list";

    fn from_cached(value: &CachedValue) -> Option<Self> {
        match value {
            CachedValue::StepsWithCommands(pairs) => Some(pairs.clone()),
            _ => None,
        }
    }
}

macro_rules! typed_records {
    ($($record:ident => $single:literal, $many:literal);* $(;)?) => {
        $(
            impl FromCached for $record {
                const SHAPE: &'static str = $single;

                fn from_cached(value: &CachedValue) -> Option<Self> {
                    match value {
                        CachedValue::Entity(entity) => $record::try_from(entity.clone()).ok(),
                        _ => None,
                    }
                }
            }

            impl FromCached for Vec<$record> {
                const SHAPE: &'static str = $many;

                fn from_cached(value: &CachedValue) -> Option<Self> {
                    match value {
                        CachedValue::List(items) => items
                            .iter()
                            .map(|item| $record::try_from(item.clone()).ok())
                            .collect(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

typed_records! {
    Category => "a category", "a category list";
    Command => "a command", "a command list";
    Group => "a group", "a group list";
    Workflow => "a workflow", "a workflow list";
    WorkflowStep => "a workflow step", "a workflow step list";
}

/// Live view of one cached read
pub struct QueryHandle<T> {
    cache: CacheService,
    key: CacheKey,
    fetcher: Fetcher,
    receiver: watch::Receiver<QueryState>,
    _data: PhantomData<fn() -> T>,
}

impl<T: FromCached> QueryHandle<T> {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Snapshot of the entry's current state
    pub fn state(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    pub fn status(&self) -> QueryStatus {
        self.receiver.borrow().status
    }

    pub fn is_stale(&self) -> bool {
        self.cache.is_stale(&self.key)
    }

    /// Current data, if any has been read
    pub fn data(&self) -> Option<T> {
        self.receiver.borrow().data.as_ref().and_then(T::from_cached)
    }

    /// Wait for the next state change; `false` once the entry is gone
    pub async fn changed(&mut self) -> bool {
        self.receiver.changed().await.is_ok()
    }

    /// Read from the gateway now, superseding any read in flight
    pub async fn refetch(&self) -> Result<T, QueryError> {
        let value = self.cache.fetch(&self.key, self.fetcher.clone()).await?;
        self.decode(&value)
    }

    /// Wait until the entry holds fresh data and return it
    ///
    /// Waits for a read already in flight; reads from the gateway itself when
    /// the entry is stale and idle. A read canceled by a mutation is retried
    /// once that mutation settles.
    pub async fn settled(&mut self) -> Result<T, QueryError> {
        loop {
            let state = self.receiver.borrow_and_update().clone();
            if state.is_fetching {
                if !self.changed().await {
                    return Err(QueryError::cancelled(&self.key));
                }
                continue;
            }
            if let Some(data) = state.data.as_ref().filter(|_| !self.is_stale()) {
                return self.decode(data);
            }
            match self.refetch().await {
                Err(error) if error.is_cancelled() => continue,
                other => return other,
            }
        }
    }

    fn decode(&self, value: &CachedValue) -> Result<T, QueryError> {
        T::from_cached(value).ok_or_else(|| QueryError::decode(&self.key, T::SHAPE))
    }
}

impl<T> Drop for QueryHandle<T> {
    fn drop(&mut self) {
        if self.cache.release(&self.key) {
            tracing::debug!("Handle for {} dropped, pending read canceled", self.key);
        }
    }
}

fn fetcher<F, Fut>(read: F) -> Fetcher
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = GatewayResult<CachedValue>> + Send + 'static,
{
    Arc::new(move || -> BoxFuture<'static, GatewayResult<CachedValue>> { Box::pin(read()) })
}

fn entity_list<T: Into<Entity>>(records: Vec<T>) -> CachedValue {
    CachedValue::List(records.into_iter().map(Into::into).collect())
}

/// Reads entities through the shared cache
#[derive(Clone)]
pub struct QueryService {
    cache: CacheService,
    gateway: Arc<dyn EntityGateway>,
}

impl QueryService {
    pub fn new(cache: CacheService, gateway: Arc<dyn EntityGateway>) -> Self {
        Self { cache, gateway }
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    /// Watch `key`, refreshed through `fetcher`
    pub fn watch<T: FromCached>(&self, key: CacheKey, fetcher: Fetcher) -> QueryHandle<T> {
        let receiver = self.cache.observe(&key, fetcher.clone());
        self.cache.prefetch(&key);
        QueryHandle {
            cache: self.cache.clone(),
            key,
            fetcher,
            receiver,
            _data: PhantomData,
        }
    }

    pub fn detail(&self, kind: EntityKind, id: i64) -> QueryHandle<Entity> {
        self.detail_as(kind, id)
    }

    pub fn list(&self, kind: EntityKind, filter: &FilterScope) -> QueryHandle<Vec<Entity>> {
        self.list_as(kind, filter)
    }

    pub(crate) fn detail_as<T: FromCached>(&self, kind: EntityKind, id: i64) -> QueryHandle<T> {
        let gateway = self.gateway.clone();
        self.watch(
            CacheKey::detail(kind, id),
            fetcher(move || {
                let gateway = gateway.clone();
                async move { gateway.get(kind, id).await.map(CachedValue::Entity) }
            }),
        )
    }

    pub(crate) fn list_as<T: FromCached>(
        &self,
        kind: EntityKind,
        filter: &FilterScope,
    ) -> QueryHandle<T> {
        let gateway = self.gateway.clone();
        let filter = *filter;
        self.watch(
            CacheKey::filtered_list(kind, &filter),
            fetcher(move || {
                let gateway = gateway.clone();
                async move { gateway.list(kind, &filter).await.map(CachedValue::List) }
            }),
        )
    }

    fn count(&self, key: CacheKey, query: CountQuery) -> QueryHandle<i64> {
        let gateway = self.gateway.clone();
        self.watch(
            key,
            fetcher(move || {
                let gateway = gateway.clone();
                async move { gateway.count(query).await.map(CachedValue::Count) }
            }),
        )
    }

    pub fn step_count(&self, workflow_id: i64) -> QueryHandle<i64> {
        self.count(
            CacheKey::step_count(workflow_id),
            CountQuery::WorkflowSteps(workflow_id),
        )
    }

    pub fn category_command_count(&self, category_id: i64) -> QueryHandle<i64> {
        self.count(
            CacheKey::category_command_count(category_id),
            CountQuery::CategoryCommands(category_id),
        )
    }

    pub fn category_workflow_count(&self, category_id: i64) -> QueryHandle<i64> {
        self.count(
            CacheKey::category_workflow_count(category_id),
            CountQuery::CategoryWorkflows(category_id),
        )
    }

    /// Steps of a workflow joined with their commands, in step order
    pub fn steps_with_commands(
        &self,
        workflow_id: i64,
        enabled_only: bool,
    ) -> QueryHandle<Vec<(WorkflowStep, Command)>> {
        let gateway = self.gateway.clone();
        self.watch(
            CacheKey::populated_steps(workflow_id, enabled_only.then_some(true)),
            fetcher(move || {
                let gateway = gateway.clone();
                async move {
                    gateway
                        .steps_with_commands(workflow_id, enabled_only)
                        .await
                        .map(CachedValue::StepsWithCommands)
                }
            }),
        )
    }

    /// A group and all of its descendants
    pub fn group_tree(&self, root_id: i64) -> QueryHandle<Vec<Group>> {
        let gateway = self.gateway.clone();
        self.watch(
            CacheKey::group_tree(root_id),
            fetcher(move || {
                let gateway = gateway.clone();
                async move { gateway.group_tree(root_id).await.map(entity_list) }
            }),
        )
    }

    /// Names from the root group down to `group_id`
    pub fn group_path(&self, group_id: i64) -> QueryHandle<Vec<String>> {
        let gateway = self.gateway.clone();
        self.watch(
            CacheKey::group_path(group_id),
            fetcher(move || {
                let gateway = gateway.clone();
                async move { gateway.group_path(group_id).await.map(CachedValue::Names) }
            }),
        )
    }

    /// Commands whose name, text or description contains `term`
    pub fn search_commands(&self, term: &str) -> QueryHandle<Vec<Command>> {
        let gateway = self.gateway.clone();
        let term = term.trim().to_string();
        self.watch(
            CacheKey::command_search(&term),
            fetcher(move || {
                let gateway = gateway.clone();
                let term = term.clone();
                async move { gateway.search_commands(&term).await.map(entity_list) }
            }),
        )
    }
}

#[cfg(test)]
#[path = "query_test.rs"]
mod query_test;
