//! Property tests for the stored value format and the migration chain

use checkpoint_store::serializer::{decode, encode};
use checkpoint_store::{
    FnMigration, JsonPlusSerializer, Migration, MigrationEngine, SerializerProtocol, StateValue,
    TypeRegistry,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Registry holding every object type name used inside `value`
fn registry_for(value: &StateValue) -> TypeRegistry {
    fn collect(value: &StateValue, names: &mut BTreeSet<String>) {
        match value {
            StateValue::List(items) | StateValue::Set(items) | StateValue::Tuple(items) => {
                items.iter().for_each(|item| collect(item, names));
            }
            StateValue::Map(map) => map.values().for_each(|item| collect(item, names)),
            StateValue::Object(obj) => {
                names.insert(obj.type_name.clone());
                obj.fields.values().for_each(|item| collect(item, names));
            }
            _ => {}
        }
    }

    let mut names = BTreeSet::new();
    collect(value, &mut names);
    names
        .into_iter()
        .fold(TypeRegistry::builder(), |builder, name| builder.register_opaque(name))
        .build()
}

fn key() -> impl Strategy<Value = String> {
    // includes the reserved marker keys
    prop_oneof![
        "[a-z]{1,6}",
        Just("type".to_string()),
        Just("_tuple".to_string()),
        Just("_set".to_string()),
        Just("_map".to_string()),
    ]
}

/// Tagged objects reserve `type` for their tag
fn field() -> impl Strategy<Value = String> {
    "[a-z]{1,6}".prop_filter("reserved tag field", |k| k != "type")
}

/// Object type names, including the names of the untagged value kinds
fn type_name() -> impl Strategy<Value = String> {
    prop_oneof![
        "[A-Za-z][A-Za-z0-9_]{0,10}",
        prop::sample::select(vec![
            "null", "bool", "int", "float", "str", "list", "set", "tuple", "map"
        ])
        .prop_map(str::to_string),
    ]
}

fn state_value() -> impl Strategy<Value = StateValue> {
    let leaf = prop_oneof![
        Just(StateValue::Null),
        any::<bool>().prop_map(StateValue::Bool),
        any::<i64>().prop_map(StateValue::Int),
        any::<f64>()
            .prop_filter("stored floats are finite", |f| f.is_finite())
            .prop_map(StateValue::Float),
        "[ -~]{0,12}".prop_map(StateValue::String),
    ];
    leaf.prop_recursive(4, 48, 6, |inner| {
        prop_oneof![
            prop::collection::vec(inner.clone(), 0..5).prop_map(StateValue::List),
            prop::collection::vec(inner.clone(), 0..5).prop_map(StateValue::tuple),
            prop::collection::vec(inner.clone(), 0..5).prop_map(StateValue::set),
            prop::collection::btree_map(key(), inner.clone(), 0..5).prop_map(StateValue::Map),
            (type_name(), prop::collection::btree_map(field(), inner, 0..4))
                .prop_map(|(name, fields)| StateValue::object(name, fields)),
        ]
    })
}

fn versioned_engine() -> MigrationEngine {
    let rename: Arc<dyn Migration> = Arc::new(FnMigration::new(
        "rename-text",
        0,
        |mut data: Value, type_name: &str| {
            if let Some(map) = data.as_object_mut() {
                if let Some(text) = map.remove("text") {
                    map.insert("content".to_string(), text);
                }
            }
            Ok((data, type_name.to_string()))
        },
    ));
    let retag: Arc<dyn Migration> = Arc::new(FnMigration::new(
        "retag",
        1,
        |data: Value, type_name: &str| {
            let renamed = if type_name == "map" { "state" } else { type_name };
            Ok((data, renamed.to_string()))
        },
    ));
    MigrationEngine::new(vec![rename, retag])
}

proptest! {
    #[test]
    fn prop_encode_decode_round_trip(value in state_value()) {
        let wire = encode(&value).unwrap();
        let decoded = decode(wire, &registry_for(&value)).unwrap();
        prop_assert_eq!(decoded, value);
    }

    #[test]
    fn prop_serializer_round_trip(value in state_value()) {
        let serializer = JsonPlusSerializer::new(registry_for(&value), MigrationEngine::none());
        let stored = serializer.dumps_typed(Some(&value)).unwrap();
        let loaded = serializer.loads_typed(&stored).unwrap();
        prop_assert!(!loaded.was_migrated);
        prop_assert_eq!(loaded.value, Some(value));
    }

    #[test]
    fn prop_migrating_current_data_is_noop(text in "[a-z ]{0,20}", extra in any::<i64>()) {
        let engine = versioned_engine();
        let data = json!({"text": text, "n": extra});

        let first = engine.migrate(data, "map", 0);
        prop_assert!(first.is_complete());
        prop_assert_eq!(first.to_version, engine.current_version());
        prop_assert_eq!(first.type_name.as_str(), "state");

        let second = engine.migrate(first.data.clone(), &first.type_name, engine.current_version());
        prop_assert!(!second.was_migrated);
        prop_assert_eq!(second.data, first.data);
        prop_assert_eq!(second.type_name, first.type_name);
    }
}
