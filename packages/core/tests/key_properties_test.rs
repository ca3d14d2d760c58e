//! Cache key properties
//!
//! Filtered list keys depend only on which filter fields are populated and
//! their values, never on the order they were supplied in.

use cmdshelf_core::cache::CacheKey;
use cmdshelf_core::models::{EntityKind, FilterField, FilterScope, FilterValue};
use proptest::prelude::*;
use serde_json::{Map, Value};

const FIELDS: [FilterField; 6] = [
    FilterField::CategoryId,
    FilterField::CommandId,
    FilterField::EnabledOnly,
    FilterField::FavoritesOnly,
    FilterField::ParentId,
    FilterField::WorkflowId,
];

fn kind() -> impl Strategy<Value = EntityKind> {
    prop::sample::select(EntityKind::ALL.to_vec())
}

/// One optional value per field, matching the field's type
fn populated() -> impl Strategy<Value = Vec<(FilterField, Option<FilterValue>)>> {
    let values: Vec<_> = FIELDS
        .iter()
        .map(|&field| {
            let value = if matches!(field, FilterField::EnabledOnly | FilterField::FavoritesOnly) {
                any::<bool>().prop_map(FilterValue::Flag).boxed()
            } else {
                (1i64..50).prop_map(FilterValue::Id).boxed()
            };
            prop::option::of(value).prop_map(move |value| (field, value))
        })
        .collect();
    values
}

fn to_json(pairs: &[(FilterField, Option<FilterValue>)]) -> Value {
    let mut object = Map::new();
    for (field, value) in pairs {
        let raw = match value {
            Some(FilterValue::Id(id)) => Value::from(*id),
            Some(FilterValue::Flag(flag)) => Value::from(*flag),
            None => Value::Null,
        };
        object.insert(field.as_str().to_string(), raw);
    }
    Value::Object(object)
}

proptest! {
    #[test]
    fn prop_key_ignores_field_order(
        kind in kind(),
        (pairs, shuffled) in populated().prop_flat_map(|pairs| {
            (Just(pairs.clone()), Just(pairs).prop_shuffle())
        }),
    ) {
        let a = FilterScope::from_fields(pairs).unwrap();
        let b = FilterScope::from_fields(shuffled).unwrap();

        prop_assert_eq!(CacheKey::filtered_list(kind, &a), CacheKey::filtered_list(kind, &b));
    }

    #[test]
    fn prop_json_nulls_match_omitted_fields(kind in kind(), pairs in populated()) {
        let with_nulls = FilterScope::from_json(&to_json(&pairs)).unwrap();
        let present: Vec<_> = pairs.iter().filter(|(_, value)| value.is_some()).cloned().collect();
        let without_nulls = FilterScope::from_json(&to_json(&present)).unwrap();

        prop_assert_eq!(
            CacheKey::filtered_list(kind, &with_nulls),
            CacheKey::filtered_list(kind, &without_nulls)
        );
    }

    #[test]
    fn prop_filtered_lists_stay_under_their_kind(kind in kind(), pairs in populated()) {
        let scope = FilterScope::from_fields(pairs).unwrap();
        let key = CacheKey::filtered_list(kind, &scope);

        prop_assert!(key.starts_with(&CacheKey::all(kind)) || kind == EntityKind::WorkflowStep);
        prop_assert_eq!(key.list_kind(), Some(kind));
        prop_assert_eq!(key.filter().map(|f| f.normalize()), Some(scope.normalize()));
    }
}
