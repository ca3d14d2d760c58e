//! Cache Coherence Tests
//!
//! End-to-end checks through `CollectionClient` against the in-memory
//! authority: optimistic writes, exact rollback, cascading invalidation and
//! read cancellation.

#[cfg(test)]
mod coherence_tests {
    use anyhow::Result;
    use cmdshelf_core::cache::{CacheEventKind, CacheKey, CachedValue};
    use cmdshelf_core::config::CacheConfig;
    use cmdshelf_core::gateway::error::{INTERNAL, NETWORK};
    use cmdshelf_core::gateway::{GatewayError, InMemoryGateway, Operation};
    use cmdshelf_core::models::{
        Category, Command, CommandPatch, EntityKind, FilterScope, Group, Workflow, WorkflowStep,
    };
    use cmdshelf_core::services::CollectionClient;
    use std::sync::Arc;
    use std::time::Duration;

    /// Helper to create a client over a fresh in-memory authority
    fn setup() -> (CollectionClient, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let client = CollectionClient::new(gateway.clone(), CacheConfig::default()).unwrap();
        (client, gateway)
    }

    fn command_at(id: i64, position: f64) -> Command {
        Command {
            id,
            name: format!("cmd-{id}"),
            command: "echo".to_string(),
            position,
            ..Default::default()
        }
    }

    fn list_ids(value: Option<CachedValue>) -> Vec<i64> {
        match value {
            Some(CachedValue::List(items)) => items.iter().map(|e| e.id()).collect(),
            other => panic!("expected a cached list, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_move_between_cached_neighbors() -> Result<()> {
        let (client, gateway) = setup();
        for (id, position) in [(3, 1.0), (5, 2.0), (7, 3.0)] {
            gateway.insert(command_at(id, position));
        }
        let root = CacheKey::filtered_list(EntityKind::Command, &FilterScope::root());
        client.commands().list(&FilterScope::root()).settled().await?;

        let position = client.commands().move_between(7, Some(3), Some(5)).await?;

        assert_eq!(position, 1.5);
        assert!(client.cache().is_stale(&root));
        assert_eq!(list_ids(client.cache().get(&root)), vec![3, 7, 5]);

        let refreshed = client.commands().list(&FilterScope::root()).settled().await?;
        assert_eq!(refreshed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![3, 7, 5]);
        Ok(())
    }

    #[tokio::test]
    async fn test_category_delete_cascades_to_filtered_lists() -> Result<()> {
        let (client, gateway) = setup();
        gateway.insert(Category {
            id: 8,
            name: "seed".to_string(),
            ..Default::default()
        });
        let id = client.categories().create(Category::draft("infra")).await?;
        assert_eq!(id, 9);

        let mut tagged = Command::draft("plan", "terraform plan");
        tagged.category_id = Some(id);
        client.commands().create(tagged).await?;

        let scope = FilterScope::category(id);
        client.categories().get(id).settled().await?;
        client.commands().list(&scope).settled().await?;
        client.groups().list(&scope).settled().await?;
        client.workflows().list(&scope).settled().await?;
        let other = FilterScope::category(8);
        client.commands().list(&other).settled().await?;

        client.categories().delete(id).await?;

        assert!(client
            .cache()
            .get(&CacheKey::detail(EntityKind::Category, id))
            .is_none());
        for kind in [EntityKind::Command, EntityKind::Group, EntityKind::Workflow] {
            assert!(client.cache().is_stale(&CacheKey::filtered_list(kind, &scope)));
        }
        assert!(!client
            .cache()
            .is_stale(&CacheKey::filtered_list(EntityKind::Command, &other)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_favorite_toggle_cancels_favorites_read() -> Result<()> {
        let (client, gateway) = setup();
        gateway.insert(command_at(4, 1000.0));
        gateway.set_latency(Operation::List, Duration::from_secs(1));

        let mut favorites = client.commands().list(&FilterScope::favorites());
        while !favorites.state().is_fetching {
            tokio::task::yield_now().await;
        }

        client.commands().toggle_favorite(4).await?;
        assert!(favorites.data().is_none());

        let listed = favorites.settled().await?;
        assert_eq!(listed.iter().map(|c| c.id).collect::<Vec<_>>(), vec![4]);
        assert!(gateway.calls(Operation::List) >= 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_mutations_leave_cache_unchanged() -> Result<()> {
        let (client, gateway) = setup();
        let group = gateway.insert(Group::draft("ops"));
        let mut nested = Command::draft("top", "htop");
        nested.group_id = Some(group);
        let nested = gateway.insert(nested);
        gateway.insert(command_at(20, 1000.0));
        gateway.insert(command_at(21, 2000.0));

        client.commands().list(&FilterScope::root()).settled().await?;
        client.commands().list(&FilterScope::parent(group)).settled().await?;
        client.commands().get(nested).settled().await?;
        client.groups().get(group).settled().await?;
        let before = client.cache().dump();

        let failure = GatewayError::new(INTERNAL, "backend unavailable");
        for operation in [
            Operation::Update,
            Operation::Delete,
            Operation::Move,
            Operation::ToggleFavorite,
        ] {
            gateway.fail_next(operation, failure.clone());
        }

        let rename = CommandPatch {
            name: Some("renamed".to_string()),
            ..Default::default()
        };
        assert!(client.commands().update(nested, rename).await.is_err());
        assert_eq!(client.cache().dump(), before);
        assert!(client.commands().delete(nested).await.is_err());
        assert_eq!(client.cache().dump(), before);
        assert!(client.commands().move_between(21, None, Some(20)).await.is_err());
        assert_eq!(client.cache().dump(), before);
        assert!(client.groups().toggle_favorite(group).await.is_err());
        assert_eq!(client.cache().dump(), before);
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_is_announced() -> Result<()> {
        let (client, gateway) = setup();
        gateway.insert(command_at(1, 1000.0));
        client.commands().get(1).settled().await?;
        let mut events = client.cache().event_receiver();
        gateway.fail_next(Operation::ToggleFavorite, GatewayError::new(NETWORK, "offline"));

        let failure = client.commands().toggle_favorite(1).await.unwrap_err();
        assert_eq!(failure.message(), "offline");

        let mut kinds = Vec::new();
        while let Ok(event) = events.try_recv() {
            kinds.push(event.kind);
        }
        assert!(kinds.contains(&CacheEventKind::Updated));
        assert!(kinds.contains(&CacheEventKind::RolledBack));
        Ok(())
    }

    #[tokio::test]
    async fn test_double_toggle_restores_favorite() -> Result<()> {
        let (client, gateway) = setup();
        gateway.insert(command_at(4, 1000.0));
        let root = CacheKey::filtered_list(EntityKind::Command, &FilterScope::root());

        for expected in [true, false] {
            client.commands().list(&FilterScope::root()).settled().await?;
            client.commands().toggle_favorite(4).await?;
            assert!(client.cache().is_stale(&root));

            let command = client.commands().get(4).settled().await?;
            assert_eq!(command.is_favorite, expected);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_workflow_delete_removes_step_lists() -> Result<()> {
        let (client, gateway) = setup();
        let workflow = gateway.insert(Workflow::draft("release"));
        let command = gateway.insert(Command::draft("tag", "git tag"));
        gateway.insert(WorkflowStep::draft(workflow, command));

        client.workflow_steps().of_workflow(workflow).settled().await?;
        client.workflows().step_count(workflow).settled().await?;
        client.workflows().list(&FilterScope::root()).settled().await?;
        let steps = CacheKey::filtered_list(EntityKind::WorkflowStep, &FilterScope::workflow(workflow));
        assert!(client.cache().get(&steps).is_some());

        client.workflows().delete(workflow).await?;

        assert!(client.cache().get(&steps).is_none());
        assert!(client.cache().get(&CacheKey::step_count(workflow)).is_none());
        let roots = CacheKey::filtered_list(EntityKind::Workflow, &FilterScope::root());
        assert!(list_ids(client.cache().get(&roots)).is_empty());
        assert!(gateway.entities(EntityKind::WorkflowStep).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_command_delete_drops_it_everywhere() -> Result<()> {
        let (client, gateway) = setup();
        gateway.insert(command_at(1, 1000.0));
        gateway.insert(command_at(2, 2000.0));
        let workflow = gateway.insert(Workflow::draft("w"));
        gateway.insert(WorkflowStep::draft(workflow, 2));

        client.commands().list(&FilterScope::root()).settled().await?;
        client.commands().get(2).settled().await?;
        client.workflow_steps().list(&FilterScope::command(2)).settled().await?;

        client.commands().delete(2).await?;

        let root = CacheKey::filtered_list(EntityKind::Command, &FilterScope::root());
        assert_eq!(list_ids(client.cache().get(&root)), vec![1]);
        assert!(client
            .cache()
            .get(&CacheKey::detail(EntityKind::Command, 2))
            .is_none());
        assert!(client
            .cache()
            .get(&CacheKey::filtered_list(EntityKind::WorkflowStep, &FilterScope::command(2)))
            .is_none());
        Ok(())
    }
}
