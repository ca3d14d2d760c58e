use super::*;
use crate::gateway::error::{NETWORK, NOT_FOUND};
use crate::gateway::{GatewayError, InMemoryGateway, Operation};
use crate::models::{CommandPatch, EntityPatch};
use crate::services::MutationCoordinator;
use std::time::Duration;

fn service() -> (QueryService, Arc<InMemoryGateway>) {
    let gateway = Arc::new(InMemoryGateway::new());
    let queries = QueryService::new(CacheService::default(), gateway.clone());
    (queries, gateway)
}

fn command(id: i64, name: &str, position: f64) -> Command {
    Command {
        id,
        name: name.into(),
        command: "ls".into(),
        position,
        ..Default::default()
    }
}

async fn wait_until_fetching<T: FromCached>(handle: &QueryHandle<T>) {
    while !handle.state().is_fetching {
        tokio::task::yield_now().await;
    }
}

#[tokio::test]
async fn test_settled_returns_list_in_display_order() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "b", 2000.0));
    gateway.insert(command(2, "a", 1000.0));

    let mut handle = queries.list(EntityKind::Command, &FilterScope::root());
    let listed = handle.settled().await.unwrap();

    assert_eq!(listed.iter().map(Entity::id).collect::<Vec<_>>(), vec![2, 1]);
    assert_eq!(handle.status(), QueryStatus::Success);
    assert!(!handle.is_stale());
}

#[tokio::test]
async fn test_fresh_entry_is_not_read_twice() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "a", 1000.0));

    let mut first = queries.detail(EntityKind::Command, 1);
    first.settled().await.unwrap();
    let mut second = queries.detail(EntityKind::Command, 1);
    let again = second.settled().await.unwrap();

    assert_eq!(again.name(), "a");
    assert_eq!(gateway.calls(Operation::Get), 1);
}

#[tokio::test]
async fn test_typed_reads_decode_records() {
    let (queries, gateway) = service();
    gateway.insert(command(5, "deploy", 1000.0));

    let mut detail: QueryHandle<Command> = queries.detail_as(EntityKind::Command, 5);
    let mut list: QueryHandle<Vec<Command>> =
        queries.list_as(EntityKind::Command, &FilterScope::root());

    assert_eq!(detail.settled().await.unwrap().name, "deploy");
    assert_eq!(list.settled().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_wrong_record_type_is_a_decode_error() {
    let (queries, gateway) = service();
    gateway.insert(command(5, "deploy", 1000.0));

    let mut handle: QueryHandle<Group> = queries.detail_as(EntityKind::Command, 5);
    let err = handle.settled().await.unwrap_err();

    assert!(matches!(err, QueryError::Decode { expected: "a group", .. }));
}

#[tokio::test]
async fn test_missing_entity_surfaces_remote_error() {
    let (queries, _gateway) = service();

    let mut handle = queries.detail(EntityKind::Workflow, 42);
    let err = handle.settled().await.unwrap_err();

    match err {
        QueryError::Remote(remote) => assert_eq!(remote.code, NOT_FOUND),
        other => panic!("expected a remote error, got {other:?}"),
    }
    assert_eq!(handle.status(), QueryStatus::Error);
    assert!(handle.data().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "a", 1000.0));
    gateway.fail_next(Operation::Get, GatewayError::new(NETWORK, "connection reset"));

    let mut handle = queries.detail(EntityKind::Command, 1);
    let entity = handle.settled().await.unwrap();

    assert_eq!(entity.id(), 1);
    assert!(gateway.calls(Operation::Get) >= 2);
}

#[tokio::test]
async fn test_handle_sees_optimistic_update_then_refetch() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "before", 1000.0));
    let coordinator = MutationCoordinator::new(queries.cache().clone(), gateway.clone());

    let mut handle = queries.list(EntityKind::Command, &FilterScope::root());
    handle.settled().await.unwrap();

    coordinator
        .update(
            EntityKind::Command,
            1,
            EntityPatch::from(CommandPatch {
                name: Some("after".into()),
                ..Default::default()
            }),
        )
        .await
        .unwrap();

    let current = handle.data().unwrap();
    assert_eq!(current[0].name(), "after");

    let settled = handle.settled().await.unwrap();
    assert_eq!(settled[0].name(), "after");
    assert!(gateway.calls(Operation::List) >= 2);
}

#[tokio::test(start_paused = true)]
async fn test_read_canceled_by_update_waits_for_commit() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "before", 1000.0));
    let coordinator = MutationCoordinator::new(queries.cache().clone(), gateway.clone());
    let root = CacheKey::filtered_list(EntityKind::Command, &FilterScope::root());

    let mut handle = queries.list(EntityKind::Command, &FilterScope::root());
    handle.settled().await.unwrap();
    queries.cache().invalidate(&root);
    gateway.set_latency(Operation::List, Duration::from_millis(50));
    gateway.set_latency(Operation::Update, Duration::from_millis(500));

    let rename = async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        coordinator
            .update(
                EntityKind::Command,
                1,
                EntityPatch::from(CommandPatch {
                    name: Some("after".into()),
                    ..Default::default()
                }),
            )
            .await
    };
    let midway = async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let cached = queries
            .cache()
            .get(&root)
            .and_then(|value| Vec::<Entity>::from_cached(&value));
        (cached, queries.cache().is_held(&root))
    };

    let (settled, renamed, (cached, held)) = tokio::join!(handle.settled(), rename, midway);

    renamed.unwrap();
    assert_eq!(cached.unwrap()[0].name(), "after");
    assert!(held);
    assert_eq!(settled.unwrap()[0].name(), "after");
    assert!(!queries.cache().is_held(&root));
}

#[tokio::test(start_paused = true)]
async fn test_dropping_last_handle_cancels_pending_read() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "a", 1000.0));
    gateway.set_latency(Operation::List, Duration::from_secs(5));
    let key = CacheKey::filtered_list(EntityKind::Command, &FilterScope::root());

    let handle = queries.list(EntityKind::Command, &FilterScope::root());
    wait_until_fetching(&handle).await;
    drop(handle);

    assert!(!queries.cache().is_fetching(&key));
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert!(queries.cache().get(&key).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_shared_entry_keeps_its_read() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "a", 1000.0));
    gateway.set_latency(Operation::List, Duration::from_secs(1));

    let first = queries.list(EntityKind::Command, &FilterScope::root());
    wait_until_fetching(&first).await;
    let mut second = queries.list(EntityKind::Command, &FilterScope::root());
    drop(first);

    assert!(second.state().is_fetching);
    assert_eq!(second.settled().await.unwrap().len(), 1);
    assert_eq!(gateway.calls(Operation::List), 1);
}

#[tokio::test]
async fn test_counts_and_group_reads() {
    let (queries, gateway) = service();
    let root = gateway.insert(Group::draft("infra"));
    let mut child = Group::draft("k8s");
    child.parent_group_id = Some(root);
    let child = gateway.insert(child);
    let category = gateway.insert(crate::models::Category::draft("ops"));
    let mut tagged = Command::draft("pods", "kubectl get pods");
    tagged.category_id = Some(category);
    gateway.insert(tagged);

    let tree = queries.group_tree(root).settled().await.unwrap();
    let path = queries.group_path(child).settled().await.unwrap();
    let commands = queries.category_command_count(category).settled().await.unwrap();
    let workflows = queries.category_workflow_count(category).settled().await.unwrap();

    assert_eq!(tree.iter().map(|g| g.id).collect::<Vec<_>>(), vec![root, child]);
    assert_eq!(path, vec!["infra".to_string(), "k8s".to_string()]);
    assert_eq!(commands, 1);
    assert_eq!(workflows, 0);
}

#[tokio::test]
async fn test_steps_with_commands_respects_enabled_filter() {
    let (queries, gateway) = service();
    let workflow = gateway.insert(Workflow::draft("release"));
    let build = gateway.insert(Command::draft("build", "cargo build"));
    let publish = gateway.insert(Command::draft("publish", "cargo publish"));
    let mut first = WorkflowStep::draft(workflow, build);
    first.position = 1000.0;
    gateway.insert(first);
    let mut second = WorkflowStep::draft(workflow, publish);
    second.position = 2000.0;
    second.enabled = false;
    gateway.insert(second);

    let all = queries.steps_with_commands(workflow, false).settled().await.unwrap();
    let enabled = queries.steps_with_commands(workflow, true).settled().await.unwrap();
    let count = queries.step_count(workflow).settled().await.unwrap();

    assert_eq!(
        all.iter().map(|(_, c)| c.name.as_str()).collect::<Vec<_>>(),
        vec!["build", "publish"]
    );
    assert_eq!(enabled.len(), 1);
    assert_eq!(enabled[0].1.id, build);
    assert_eq!(count, 2);
}

#[tokio::test]
async fn test_search_trims_the_term() {
    let (queries, gateway) = service();
    gateway.insert(command(1, "docker ps", 1000.0));
    gateway.insert(command(2, "git log", 2000.0));

    let mut handle = queries.search_commands("  docker ");
    let found = handle.settled().await.unwrap();

    assert_eq!(handle.key(), &CacheKey::command_search("docker"));
    assert_eq!(found.iter().map(|c| c.id).collect::<Vec<_>>(), vec![1]);
}
