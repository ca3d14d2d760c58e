//! Collection Client
//!
//! One entry point for consumers: typed reads and optimistic mutations per
//! entity kind, all sharing a single query cache.
//!
//! ```rust
//! use cmdshelf_core::config::CacheConfig;
//! use cmdshelf_core::gateway::InMemoryGateway;
//! use cmdshelf_core::models::{Command, FilterScope};
//! use cmdshelf_core::services::CollectionClient;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let client = CollectionClient::new(Arc::new(InMemoryGateway::new()), CacheConfig::default()).unwrap();
//! let id = client.commands().create(Command::draft("status", "git status")).await.unwrap();
//!
//! let mut root = client.commands().list(&FilterScope::root());
//! let listed = root.settled().await.unwrap();
//! assert_eq!(listed[0].id, id);
//! # });
//! ```

use crate::cache::CacheService;
use crate::config::{CacheConfig, ConfigError, OrderingConfig};
use crate::gateway::EntityGateway;
use crate::models::{
    Category, Command, EntityPatch, EntityRecord, FilterScope, Group, MoveRequest, Workflow,
    WorkflowStep,
};
use crate::ordering::ReorderEngine;
use crate::services::coordinator::MutationCoordinator;
use crate::services::error::MutationResult;
use crate::services::query::{FromCached, QueryHandle, QueryService};
use std::marker::PhantomData;
use std::sync::Arc;

/// Reads and mutations over every entity kind
#[derive(Clone)]
pub struct CollectionClient {
    queries: QueryService,
    coordinator: MutationCoordinator,
}

impl CollectionClient {
    pub fn new(gateway: Arc<dyn EntityGateway>, config: CacheConfig) -> Result<Self, ConfigError> {
        Ok(Self::with_cache(CacheService::new(config)?, gateway))
    }

    /// Build on an existing cache, e.g. one shared with other clients
    pub fn with_cache(cache: CacheService, gateway: Arc<dyn EntityGateway>) -> Self {
        Self {
            queries: QueryService::new(cache.clone(), gateway.clone()),
            coordinator: MutationCoordinator::new(cache, gateway),
        }
    }

    pub fn with_ordering(mut self, config: OrderingConfig) -> Result<Self, ConfigError> {
        self.coordinator = self.coordinator.with_engine(ReorderEngine::new(config)?);
        Ok(self)
    }

    pub fn cache(&self) -> &CacheService {
        self.queries.cache()
    }

    pub fn queries(&self) -> &QueryService {
        &self.queries
    }

    pub fn coordinator(&self) -> &MutationCoordinator {
        &self.coordinator
    }

    pub fn categories(&self) -> Records<'_, Category> {
        Records::new(self)
    }

    pub fn commands(&self) -> Records<'_, Command> {
        Records::new(self)
    }

    pub fn groups(&self) -> Records<'_, Group> {
        Records::new(self)
    }

    pub fn workflows(&self) -> Records<'_, Workflow> {
        Records::new(self)
    }

    pub fn workflow_steps(&self) -> Records<'_, WorkflowStep> {
        Records::new(self)
    }
}

/// Typed operations on one entity kind
pub struct Records<'a, R> {
    client: &'a CollectionClient,
    _record: PhantomData<R>,
}

impl<'a, R> Records<'a, R> {
    fn new(client: &'a CollectionClient) -> Self {
        Self {
            client,
            _record: PhantomData,
        }
    }
}

impl<R> Records<'_, R>
where
    R: EntityRecord + FromCached,
    Vec<R>: FromCached,
{
    pub fn get(&self, id: i64) -> QueryHandle<R> {
        self.client.queries.detail_as(R::KIND, id)
    }

    pub fn list(&self, filter: &FilterScope) -> QueryHandle<Vec<R>> {
        self.client.queries.list_as(R::KIND, filter)
    }

    /// Persist a draft; returns the id the authority assigned
    pub async fn create(&self, draft: R) -> MutationResult<i64> {
        self.client.coordinator.create(draft.into()).await
    }

    pub async fn update(&self, id: i64, patch: impl Into<EntityPatch>) -> MutationResult<()> {
        self.client
            .coordinator
            .update(R::KIND, id, patch.into())
            .await
    }

    pub async fn delete(&self, id: i64) -> MutationResult<()> {
        self.client.coordinator.delete(R::KIND, id).await
    }

    /// Place `id` between two siblings; returns the position it landed on
    pub async fn move_between(
        &self,
        id: i64,
        prev_id: Option<i64>,
        next_id: Option<i64>,
    ) -> MutationResult<f64> {
        self.client
            .coordinator
            .move_between(R::KIND, MoveRequest::between(id, prev_id, next_id))
            .await
    }

    pub async fn toggle_favorite(&self, id: i64) -> MutationResult<()> {
        self.client.coordinator.toggle_favorite(R::KIND, id).await
    }
}

impl Records<'_, Category> {
    pub fn command_count(&self, category_id: i64) -> QueryHandle<i64> {
        self.client.queries.category_command_count(category_id)
    }

    pub fn workflow_count(&self, category_id: i64) -> QueryHandle<i64> {
        self.client.queries.category_workflow_count(category_id)
    }
}

impl Records<'_, Command> {
    pub fn search(&self, term: &str) -> QueryHandle<Vec<Command>> {
        self.client.queries.search_commands(term)
    }
}

impl Records<'_, Group> {
    pub fn tree(&self, root_id: i64) -> QueryHandle<Vec<Group>> {
        self.client.queries.group_tree(root_id)
    }

    pub fn path(&self, group_id: i64) -> QueryHandle<Vec<String>> {
        self.client.queries.group_path(group_id)
    }
}

impl Records<'_, Workflow> {
    pub fn step_count(&self, workflow_id: i64) -> QueryHandle<i64> {
        self.client.queries.step_count(workflow_id)
    }

    pub fn steps_with_commands(
        &self,
        workflow_id: i64,
        enabled_only: bool,
    ) -> QueryHandle<Vec<(WorkflowStep, Command)>> {
        self.client
            .queries
            .steps_with_commands(workflow_id, enabled_only)
    }
}

impl Records<'_, WorkflowStep> {
    /// Steps of one workflow, in run order
    pub fn of_workflow(&self, workflow_id: i64) -> QueryHandle<Vec<WorkflowStep>> {
        self.list(&FilterScope::workflow(workflow_id))
    }

    pub async fn toggle_enabled(&self, step_id: i64) -> MutationResult<()> {
        self.client.coordinator.toggle_enabled(step_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::error::NOT_FOUND;
    use crate::gateway::{GatewayError, InMemoryGateway, Operation};
    use crate::models::{CommandPatch, EntityKind, WorkflowStepPatch};

    fn client() -> (CollectionClient, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        (
            CollectionClient::new(gateway.clone(), CacheConfig::default()).unwrap(),
            gateway,
        )
    }

    #[test]
    fn test_invalid_config_is_refused() {
        let gateway = Arc::new(InMemoryGateway::new());
        let retries = CacheConfig {
            read_retry: 10_000,
            ..Default::default()
        };
        assert!(matches!(
            CollectionClient::new(gateway.clone(), retries),
            Err(ConfigError::ReadRetryTooHigh(10_000))
        ));

        let client = CollectionClient::new(gateway, CacheConfig::default()).unwrap();
        let flat = OrderingConfig {
            gap: 0.0,
            ..Default::default()
        };
        assert!(matches!(
            client.with_ordering(flat),
            Err(ConfigError::InvalidGap(_))
        ));
    }

    #[tokio::test]
    async fn test_create_then_read_typed_record() {
        let (client, _gateway) = client();
        let id = client
            .commands()
            .create(Command::draft("build", "cargo build"))
            .await
            .unwrap();

        let command = client.commands().get(id).settled().await.unwrap();
        assert_eq!(command.command, "cargo build");
        assert_eq!(command.position, 1000.0);
    }

    #[tokio::test]
    async fn test_update_through_handle_reaches_authority() {
        let (client, gateway) = client();
        let id = gateway.insert(Command::draft("old", "ls"));

        client
            .commands()
            .update(
                id,
                CommandPatch {
                    name: Some("new".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let stored = gateway.entity(EntityKind::Command, id).unwrap();
        assert_eq!(stored.name(), "new");
    }

    #[tokio::test]
    async fn test_failed_delete_reports_remote_message() {
        let (client, gateway) = client();
        let id = gateway.insert(Category::draft("ops"));
        gateway.fail_next(Operation::Delete, GatewayError::not_found("category", id));

        let failure = client.categories().delete(id).await.unwrap_err();

        assert_eq!(failure.error.remote().map(|e| e.code.as_str()), Some(NOT_FOUND));
        assert!(gateway.entity(EntityKind::Category, id).is_some());
    }

    #[tokio::test]
    async fn test_step_helpers() {
        let (client, gateway) = client();
        let workflow = gateway.insert(Workflow::draft("ship"));
        let command = gateway.insert(Command::draft("test", "cargo test"));
        let step = client
            .workflow_steps()
            .create(WorkflowStep::draft(workflow, command))
            .await
            .unwrap();

        client.workflow_steps().toggle_enabled(step).await.unwrap();
        client
            .workflow_steps()
            .update(
                step,
                WorkflowStepPatch {
                    timeout_seconds: Some(Some(30)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let steps = client.workflow_steps().of_workflow(workflow).settled().await.unwrap();
        assert_eq!(steps.len(), 1);
        assert!(!steps[0].enabled);
        assert_eq!(steps[0].timeout_seconds, Some(30));
        assert_eq!(client.workflows().step_count(workflow).settled().await.unwrap(), 1);
    }
}
