//! Filter Scopes
//!
//! A [`FilterScope`] identifies one sibling-ordering domain and one cached list
//! view. Before a filter takes part in a cache key it is normalized into a
//! [`NormalizedFilter`]: populated fields only, sorted by field name. Two
//! filters with the same populated fields therefore always produce the same
//! key, however they were assembled.
//!
//! Filters arrive from consumers either as the struct itself, as `(field,
//! value)` pairs in arbitrary order, or as a JSON object where `null` means
//! "not set".

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Fields that may appear in a filter
///
/// Variant order is the alphabetical order of the wire names, so the derived
/// `Ord` is the canonical field order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterField {
    CategoryId,
    CommandId,
    EnabledOnly,
    FavoritesOnly,
    ParentId,
    WorkflowId,
}

impl FilterField {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterField::CategoryId => "categoryId",
            FilterField::CommandId => "commandId",
            FilterField::EnabledOnly => "enabledOnly",
            FilterField::FavoritesOnly => "favoritesOnly",
            FilterField::ParentId => "parentId",
            FilterField::WorkflowId => "workflowId",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "categoryId" => Some(FilterField::CategoryId),
            "commandId" => Some(FilterField::CommandId),
            "enabledOnly" => Some(FilterField::EnabledOnly),
            "favoritesOnly" => Some(FilterField::FavoritesOnly),
            "parentId" => Some(FilterField::ParentId),
            "workflowId" => Some(FilterField::WorkflowId),
            _ => None,
        }
    }

    fn is_flag(&self) -> bool {
        matches!(self, FilterField::EnabledOnly | FilterField::FavoritesOnly)
    }
}

/// Value of one populated filter field
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    Id(i64),
    Flag(bool),
}

impl fmt::Display for FilterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterValue::Id(id) => write!(f, "{}", id),
            FilterValue::Flag(flag) => write!(f, "{}", flag),
        }
    }
}

/// Errors raised while assembling a filter from loose input
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FilterError {
    #[error("Unknown filter field: {0}")]
    UnknownField(String),

    #[error("Filter field '{field}' expects {expected}")]
    WrongValueType {
        field: &'static str,
        expected: &'static str,
    },
}

/// Structural filter over a list view
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilterScope {
    pub parent_id: Option<i64>,
    pub category_id: Option<i64>,
    pub favorites_only: Option<bool>,
    pub workflow_id: Option<i64>,
    pub command_id: Option<i64>,
    pub enabled_only: Option<bool>,
}

impl FilterScope {
    /// Filter with no populated field (the unscoped list)
    pub fn root() -> Self {
        Self::default()
    }

    pub fn parent(parent_id: i64) -> Self {
        Self {
            parent_id: Some(parent_id),
            ..Self::default()
        }
    }

    pub fn category(category_id: i64) -> Self {
        Self {
            category_id: Some(category_id),
            ..Self::default()
        }
    }

    pub fn favorites() -> Self {
        Self {
            favorites_only: Some(true),
            ..Self::default()
        }
    }

    pub fn workflow(workflow_id: i64) -> Self {
        Self {
            workflow_id: Some(workflow_id),
            ..Self::default()
        }
    }

    pub fn command(command_id: i64) -> Self {
        Self {
            command_id: Some(command_id),
            ..Self::default()
        }
    }

    /// Build a filter from `(field, value)` pairs in any order
    ///
    /// `None` values are treated as omitted. A field given twice keeps the
    /// last populated value.
    pub fn from_fields<I>(fields: I) -> Result<Self, FilterError>
    where
        I: IntoIterator<Item = (FilterField, Option<FilterValue>)>,
    {
        let mut scope = Self::default();
        for (field, value) in fields {
            if let Some(value) = value {
                scope.set(field, value)?;
            }
        }
        Ok(scope)
    }

    /// Build a filter from a JSON object; `null` and missing fields are equivalent
    pub fn from_json(value: &serde_json::Value) -> Result<Self, FilterError> {
        let Some(object) = value.as_object() else {
            return Ok(Self::default());
        };

        let mut pairs = Vec::with_capacity(object.len());
        for (name, raw) in object {
            let field =
                FilterField::parse(name).ok_or_else(|| FilterError::UnknownField(name.clone()))?;
            let value = match raw {
                serde_json::Value::Null => None,
                serde_json::Value::Bool(flag) => Some(FilterValue::Flag(*flag)),
                serde_json::Value::Number(n) => n.as_i64().map(FilterValue::Id),
                _ => None,
            };
            if value.is_none() && !raw.is_null() {
                return Err(Self::type_error(field));
            }
            pairs.push((field, value));
        }
        Self::from_fields(pairs)
    }

    fn type_error(field: FilterField) -> FilterError {
        FilterError::WrongValueType {
            field: field.as_str(),
            expected: if field.is_flag() { "a boolean" } else { "an integer id" },
        }
    }

    /// Set one field, checking the value type
    pub fn set(&mut self, field: FilterField, value: FilterValue) -> Result<(), FilterError> {
        match (field, value) {
            (FilterField::ParentId, FilterValue::Id(id)) => self.parent_id = Some(id),
            (FilterField::CategoryId, FilterValue::Id(id)) => self.category_id = Some(id),
            (FilterField::WorkflowId, FilterValue::Id(id)) => self.workflow_id = Some(id),
            (FilterField::CommandId, FilterValue::Id(id)) => self.command_id = Some(id),
            (FilterField::FavoritesOnly, FilterValue::Flag(flag)) => {
                self.favorites_only = Some(flag)
            }
            (FilterField::EnabledOnly, FilterValue::Flag(flag)) => self.enabled_only = Some(flag),
            (field, _) => return Err(Self::type_error(field)),
        }
        Ok(())
    }

    pub fn get(&self, field: FilterField) -> Option<FilterValue> {
        match field {
            FilterField::ParentId => self.parent_id.map(FilterValue::Id),
            FilterField::CategoryId => self.category_id.map(FilterValue::Id),
            FilterField::WorkflowId => self.workflow_id.map(FilterValue::Id),
            FilterField::CommandId => self.command_id.map(FilterValue::Id),
            FilterField::FavoritesOnly => self.favorites_only.map(FilterValue::Flag),
            FilterField::EnabledOnly => self.enabled_only.map(FilterValue::Flag),
        }
    }

    /// Copy of this filter with one field cleared
    pub fn without(mut self, field: FilterField) -> Self {
        match field {
            FilterField::ParentId => self.parent_id = None,
            FilterField::CategoryId => self.category_id = None,
            FilterField::WorkflowId => self.workflow_id = None,
            FilterField::CommandId => self.command_id = None,
            FilterField::FavoritesOnly => self.favorites_only = None,
            FilterField::EnabledOnly => self.enabled_only = None,
        }
        self
    }

    pub fn is_favorites_only(&self) -> bool {
        self.favorites_only == Some(true)
    }

    /// Canonical representation: populated fields sorted by name
    pub fn normalize(&self) -> NormalizedFilter {
        let mut fields: Vec<(FilterField, FilterValue)> = [
            FilterField::CategoryId,
            FilterField::CommandId,
            FilterField::EnabledOnly,
            FilterField::FavoritesOnly,
            FilterField::ParentId,
            FilterField::WorkflowId,
        ]
        .into_iter()
        .filter_map(|field| self.get(field).map(|value| (field, value)))
        .collect();
        fields.sort_by_key(|(field, _)| *field);
        NormalizedFilter(fields)
    }
}

/// Sorted, populated-only filter fields; the hashable form used in cache keys
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct NormalizedFilter(Vec<(FilterField, FilterValue)>);

impl NormalizedFilter {
    pub fn fields(&self) -> &[(FilterField, FilterValue)] {
        &self.0
    }

    pub fn get(&self, field: FilterField) -> Option<FilterValue> {
        self.0
            .iter()
            .find(|(candidate, _)| *candidate == field)
            .map(|(_, value)| *value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Rebuild the structural filter
    pub fn to_scope(&self) -> FilterScope {
        let mut scope = FilterScope::default();
        for (field, value) in &self.0 {
            // Values were type-checked on the way in
            let _ = scope.set(*field, *value);
        }
        scope
    }
}

impl fmt::Display for NormalizedFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (index, (field, value)) in self.0.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{}={}", field.as_str(), value)?;
        }
        f.write_str("}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_skips_absent_fields() {
        let scope = FilterScope {
            category_id: Some(2),
            ..Default::default()
        };
        assert_eq!(
            scope.normalize().fields(),
            &[(FilterField::CategoryId, FilterValue::Id(2))]
        );
    }

    #[test]
    fn test_field_order_does_not_matter() {
        let a = FilterScope::from_fields([
            (FilterField::ParentId, Some(FilterValue::Id(1))),
            (FilterField::FavoritesOnly, Some(FilterValue::Flag(true))),
        ])
        .unwrap();
        let b = FilterScope::from_fields([
            (FilterField::FavoritesOnly, Some(FilterValue::Flag(true))),
            (FilterField::CategoryId, None),
            (FilterField::ParentId, Some(FilterValue::Id(1))),
        ])
        .unwrap();

        assert_eq!(a.normalize(), b.normalize());
    }

    #[test]
    fn test_json_null_equals_missing() {
        let with_null = FilterScope::from_json(&json!({"parentId": 4, "categoryId": null})).unwrap();
        let without = FilterScope::from_json(&json!({"parentId": 4})).unwrap();
        assert_eq!(with_null.normalize(), without.normalize());
    }

    #[test]
    fn test_json_rejects_wrong_types() {
        let err = FilterScope::from_json(&json!({"favoritesOnly": 1})).unwrap_err();
        assert_eq!(
            err,
            FilterError::WrongValueType {
                field: "favoritesOnly",
                expected: "a boolean"
            }
        );

        let err = FilterScope::from_json(&json!({"groupName": "x"})).unwrap_err();
        assert!(matches!(err, FilterError::UnknownField(_)));
    }

    #[test]
    fn test_false_flag_is_a_populated_value() {
        let explicit = FilterScope {
            favorites_only: Some(false),
            ..Default::default()
        };
        assert_ne!(explicit.normalize(), FilterScope::root().normalize());
    }

    #[test]
    fn test_normalized_round_trips_to_scope() {
        let scope = FilterScope {
            workflow_id: Some(3),
            enabled_only: Some(true),
            ..Default::default()
        };
        assert_eq!(scope.normalize().to_scope(), scope);
        assert_eq!(scope.normalize().to_string(), "{enabledOnly=true,workflowId=3}");
    }
}
