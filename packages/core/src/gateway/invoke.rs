//! Invoke Adapter
//!
//! Maps each typed [`EntityGateway`] call onto the `(operationName,
//! argumentRecord)` request shape of the remote command backend. Argument
//! records are JSON objects with camelCase field names (`groupId`,
//! `favoritesOnly`, `prevId`, ...). `create_*` requests always carry `id: 0`.

use crate::gateway::{CountQuery, EntityGateway, GatewayError, GatewayResult};
use crate::models::{
    Command, Entity, EntityKind, EntityPatch, FilterScope, Group, MoveRequest, WorkflowStep,
    DRAFT_ID,
};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};

/// Transport that delivers one named request to the backend
#[async_trait]
pub trait Invoker: Send + Sync {
    async fn invoke(&self, operation: &str, args: Value) -> Result<Value, GatewayError>;
}

/// [`EntityGateway`] speaking the backend's operation vocabulary
pub struct InvokeGateway<I: Invoker> {
    invoker: I,
}

impl<I: Invoker> InvokeGateway<I> {
    pub fn new(invoker: I) -> Self {
        Self { invoker }
    }

    pub fn invoker(&self) -> &I {
        &self.invoker
    }

    async fn call<T: DeserializeOwned>(&self, operation: &str, args: Value) -> GatewayResult<T> {
        tracing::debug!(operation, "Invoking remote operation");
        let value = self.invoker.invoke(operation, args).await?;
        decode(operation, value)
    }

    async fn call_unit(&self, operation: &str, args: Value) -> GatewayResult<()> {
        tracing::debug!(operation, "Invoking remote operation");
        self.invoker.invoke(operation, args).await.map(|_| ())
    }
}

fn decode<T: DeserializeOwned>(operation: &str, value: Value) -> GatewayResult<T> {
    serde_json::from_value(value)
        .map_err(|e| GatewayError::decode(format!("Unexpected response to {}: {}", operation, e)))
}

/// Tag a bare record with its kind so it decodes as an [`Entity`]
fn tagged(kind: EntityKind, mut record: Value) -> GatewayResult<Entity> {
    if let Value::Object(fields) = &mut record {
        let tag = serde_json::to_value(kind)
            .map_err(|e| GatewayError::decode(e.to_string()))?;
        fields.insert("kind".to_string(), tag);
    }
    serde_json::from_value(record).map_err(|e| {
        GatewayError::decode(format!("Response is not a valid {}: {}", kind.singular(), e))
    })
}

/// Serialize a tagged value and drop its `kind` tag
fn untagged<T: serde::Serialize>(value: &T) -> GatewayResult<Map<String, Value>> {
    match serde_json::to_value(value) {
        Ok(Value::Object(mut fields)) => {
            fields.remove("kind");
            Ok(fields)
        }
        Ok(_) => Err(GatewayError::decode("Expected an object payload")),
        Err(e) => Err(GatewayError::decode(e.to_string())),
    }
}

fn get_operation(kind: EntityKind) -> String {
    format!("get_{}", kind.singular())
}

fn list_operation(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Category => "get_categories",
        EntityKind::Command => "get_commands",
        EntityKind::Group => "get_groups",
        EntityKind::Workflow => "get_workflows",
        EntityKind::WorkflowStep => "get_workflow_steps",
    }
}

/// Argument record for a list request; only the fields the backend
/// understands for `kind` are sent
fn list_args(kind: EntityKind, filter: &FilterScope) -> Value {
    match kind {
        EntityKind::Category => json!({}),
        EntityKind::Command => json!({
            "groupId": filter.parent_id,
            "categoryId": filter.category_id,
            "favoritesOnly": filter.favorites_only.unwrap_or(false),
        }),
        EntityKind::Group => json!({
            "parentGroupId": filter.parent_id,
            "categoryId": filter.category_id,
            "favoritesOnly": filter.favorites_only.unwrap_or(false),
        }),
        EntityKind::Workflow => json!({
            "categoryId": filter.category_id,
            "favoritesOnly": filter.favorites_only.unwrap_or(false),
        }),
        EntityKind::WorkflowStep => json!({
            "workflowId": filter.workflow_id,
            "commandId": filter.command_id,
            "enabledOnly": filter.enabled_only.unwrap_or(false),
        }),
    }
}

fn toggle_favorite_operation(kind: EntityKind) -> GatewayResult<&'static str> {
    match kind {
        EntityKind::Command => Ok("toggle_favorite"),
        EntityKind::Group => Ok("toggle_group_favorite"),
        EntityKind::Workflow => Ok("toggle_favorite_workflow"),
        EntityKind::Category | EntityKind::WorkflowStep => Err(GatewayError::invalid_data(
            "kind",
            format!("{} cannot be marked favorite", kind),
        )),
    }
}

#[async_trait]
impl<I: Invoker> EntityGateway for InvokeGateway<I> {
    async fn get(&self, kind: EntityKind, id: i64) -> GatewayResult<Entity> {
        let record: Value = self.call(&get_operation(kind), json!({ "id": id })).await?;
        tagged(kind, record)
    }

    async fn list(&self, kind: EntityKind, filter: &FilterScope) -> GatewayResult<Vec<Entity>> {
        let records: Vec<Value> = self.call(list_operation(kind), list_args(kind, filter)).await?;
        records
            .into_iter()
            .map(|record| tagged(kind, record))
            .collect()
    }

    async fn create(&self, entity: &Entity) -> GatewayResult<i64> {
        let mut args = untagged(entity)?;
        args.insert("id".to_string(), json!(DRAFT_ID));
        let operation = format!("create_{}", entity.kind().singular());
        self.call(&operation, Value::Object(args)).await
    }

    async fn update(&self, id: i64, patch: &EntityPatch) -> GatewayResult<()> {
        let mut args = untagged(patch)?;
        args.insert("id".to_string(), json!(id));
        let operation = format!("update_{}", patch.kind().singular());
        self.call_unit(&operation, Value::Object(args)).await
    }

    async fn delete(&self, kind: EntityKind, id: i64) -> GatewayResult<()> {
        let operation = format!("delete_{}", kind.singular());
        self.call_unit(&operation, json!({ "id": id })).await
    }

    async fn move_between(&self, kind: EntityKind, request: MoveRequest) -> GatewayResult<()> {
        let args = serde_json::to_value(request).map_err(|e| GatewayError::decode(e.to_string()))?;
        let operation = format!("move_{}_between", kind.singular());
        self.call_unit(&operation, args).await
    }

    async fn toggle_favorite(&self, kind: EntityKind, id: i64) -> GatewayResult<()> {
        let operation = toggle_favorite_operation(kind)?;
        self.call_unit(operation, json!({ "id": id })).await
    }

    async fn toggle_enabled(&self, step_id: i64) -> GatewayResult<()> {
        self.call_unit("toggle_workflow_step_enabled", json!({ "id": step_id }))
            .await
    }

    async fn count(&self, query: CountQuery) -> GatewayResult<i64> {
        match query {
            CountQuery::WorkflowSteps(id) => {
                self.call("get_workflow_step_count", json!({ "id": id })).await
            }
            CountQuery::CategoryCommands(id) => {
                self.call("get_category_command_count", json!({ "id": id }))
                    .await
            }
            CountQuery::CategoryWorkflows(id) => {
                self.call(
                    "get_workflow_count_for_category",
                    json!({ "categoryId": id }),
                )
                .await
            }
        }
    }

    async fn group_tree(&self, root_id: i64) -> GatewayResult<Vec<Group>> {
        self.call("get_group_tree", json!({ "rootId": root_id })).await
    }

    async fn group_path(&self, group_id: i64) -> GatewayResult<Vec<String>> {
        self.call("get_group_path", json!({ "rootId": group_id })).await
    }

    async fn steps_with_commands(
        &self,
        workflow_id: i64,
        enabled_only: bool,
    ) -> GatewayResult<Vec<(WorkflowStep, Command)>> {
        self.call(
            "get_workflow_steps_command_populated",
            json!({ "workflowId": workflow_id, "enabledOnly": enabled_only }),
        )
        .await
    }

    async fn search_commands(&self, term: &str) -> GatewayResult<Vec<Command>> {
        self.call("search_commands", json!({ "searchTerm": term })).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::error::NOT_FOUND;
    use crate::models::{Category, CommandPatch};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Records every request and answers from canned responses
    #[derive(Default)]
    struct RecordingInvoker {
        calls: Mutex<Vec<(String, Value)>>,
        responses: HashMap<&'static str, Result<Value, GatewayError>>,
    }

    impl RecordingInvoker {
        fn responding(operation: &'static str, response: Result<Value, GatewayError>) -> Self {
            let mut invoker = Self::default();
            invoker.responses.insert(operation, response);
            invoker
        }

        fn last_call(&self) -> (String, Value) {
            self.calls.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait]
    impl Invoker for RecordingInvoker {
        async fn invoke(&self, operation: &str, args: Value) -> Result<Value, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push((operation.to_string(), args));
            self.responses
                .get(operation)
                .cloned()
                .unwrap_or(Ok(Value::Null))
        }
    }

    #[tokio::test]
    async fn test_create_always_sends_draft_id() {
        let gateway =
            InvokeGateway::new(RecordingInvoker::responding("create_category", Ok(json!(9))));
        let mut category = Category::draft("Git");
        category.id = 42;

        let id = gateway.create(&Entity::from(category)).await.unwrap();

        assert_eq!(id, 9);
        let (operation, args) = gateway.invoker().last_call();
        assert_eq!(operation, "create_category");
        assert_eq!(args["id"], 0);
        assert_eq!(args["name"], "Git");
        assert!(args.get("kind").is_none());
    }

    #[tokio::test]
    async fn test_list_arguments_use_backend_field_names() {
        let gateway = InvokeGateway::new(RecordingInvoker::responding(
            "get_groups",
            Ok(json!([{ "id": 2, "name": "ops", "parentGroupId": 1, "position": 1000.0 }])),
        ));

        let groups = gateway
            .list(EntityKind::Group, &FilterScope::parent(1))
            .await
            .unwrap();

        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].kind(), EntityKind::Group);
        assert_eq!(groups[0].scope_parent(), Some(1));

        let (operation, args) = gateway.invoker().last_call();
        assert_eq!(operation, "get_groups");
        assert_eq!(args["parentGroupId"], 1);
        assert_eq!(args["favoritesOnly"], false);
        assert!(args["categoryId"].is_null());
    }

    #[tokio::test]
    async fn test_move_and_toggle_operation_names() {
        let gateway = InvokeGateway::new(RecordingInvoker::default());

        gateway
            .move_between(EntityKind::Command, MoveRequest::between(7, Some(3), Some(5)))
            .await
            .unwrap();
        let (operation, args) = gateway.invoker().last_call();
        assert_eq!(operation, "move_command_between");
        assert_eq!(args, json!({ "id": 7, "prevId": 3, "nextId": 5 }));

        gateway
            .move_between(EntityKind::WorkflowStep, MoveRequest::between(1, None, Some(2)))
            .await
            .unwrap();
        assert_eq!(gateway.invoker().last_call().0, "move_workflow_step_between");

        gateway.toggle_favorite(EntityKind::Group, 4).await.unwrap();
        assert_eq!(gateway.invoker().last_call().0, "toggle_group_favorite");

        let err = gateway
            .toggle_favorite(EntityKind::Category, 4)
            .await
            .unwrap_err();
        assert!(err.is_scope_violation());
    }

    #[tokio::test]
    async fn test_update_sends_only_touched_fields() {
        let gateway = InvokeGateway::new(RecordingInvoker::default());
        let patch = EntityPatch::from(CommandPatch {
            name: Some("renamed".into()),
            group_id: Some(None),
            ..Default::default()
        });

        gateway.update(7, &patch).await.unwrap();

        let (operation, args) = gateway.invoker().last_call();
        assert_eq!(operation, "update_command");
        assert_eq!(
            args,
            json!({ "id": 7, "name": "renamed", "groupId": null })
        );
    }

    #[tokio::test]
    async fn test_structured_errors_pass_through() {
        let gateway = InvokeGateway::new(RecordingInvoker::responding(
            "get_command",
            Err(GatewayError::not_found("commands", 3)),
        ));

        let err = gateway.get(EntityKind::Command, 3).await.unwrap_err();
        assert_eq!(err.code, NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_response_is_a_decode_error() {
        let gateway = InvokeGateway::new(RecordingInvoker::responding(
            "get_workflow_step_count",
            Ok(json!("many")),
        ));

        let err = gateway.count(CountQuery::WorkflowSteps(1)).await.unwrap_err();
        assert_eq!(err.code, crate::gateway::error::DECODE);
    }
}
