//! Serialization protocol for stored values
//!
//! Values are stored as `(type_tag, payload)` pairs:
//!
//! | type tag  | payload                                               |
//! |-----------|-------------------------------------------------------|
//! | `"empty"` | none; the channel is versioned but holds no value     |
//! | `"json"`  | JSON [`Envelope`] `{type, tagged, schema_version, data}` |
//! | `"legacy"`| plain JSON written before envelopes existed           |
//!
//! Inside an envelope the data uses a self-describing tagging scheme so decoding
//! only needs the [`TypeRegistry`]:
//!
//! - tagged object: `{"type": "<name>", ...fields}`
//! - tuple: `{"_tuple": true, "items": [...]}`
//! - set: `{"_set": true, "items": [...]}`
//! - map whose keys collide with a marker: `{"_map": true, "entries": {...}}`
//! - everything else: plain JSON
//!
//! Reading runs the envelope through the [`MigrationEngine`] before
//! reconstructing the value. Legacy rows are decoded as plain JSON and enter the
//! chain at schema version 0.

use crate::error::{CheckpointError, DecodeError, Result};
use crate::migration::MigrationEngine;
use crate::value::{Fields, StateValue, TypeRegistry};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::sync::Arc;

pub const TYPE_EMPTY: &str = "empty";
pub const TYPE_JSON: &str = "json";
pub const TYPE_LEGACY: &str = "legacy";

const TAG_TYPE: &str = "type";
const TAG_TUPLE: &str = "_tuple";
const TAG_SET: &str = "_set";
const TAG_MAP: &str = "_map";
const RESERVED_KEYS: [&str; 4] = [TAG_TYPE, TAG_TUPLE, TAG_SET, TAG_MAP];

/// Envelope type names for untagged values, only consulted for envelopes
/// written without the `tagged` flag
const KIND_NAMES: [&str; 9] = [
    "null", "bool", "int", "float", "str", "list", "set", "tuple", "map",
];

/// Encode a value with the tagging scheme
pub fn encode(value: &StateValue) -> Result<Value> {
    Ok(match value {
        StateValue::Null => Value::Null,
        StateValue::Bool(b) => Value::Bool(*b),
        StateValue::Int(i) => Value::from(*i),
        StateValue::Float(f) => Value::Number(Number::from_f64(*f).ok_or_else(|| {
            CheckpointError::Invalid(format!("non-finite float {} cannot be stored", f))
        })?),
        StateValue::String(s) => Value::String(s.clone()),
        StateValue::List(items) => Value::Array(encode_items(items)?),
        StateValue::Set(items) => {
            if items.iter().enumerate().any(|(i, item)| items[..i].contains(item)) {
                return Err(CheckpointError::Invalid(
                    "set contains duplicate items; build it with StateValue::set".to_string(),
                ));
            }
            marked(TAG_SET, "items", Value::Array(encode_items(items)?))
        }
        StateValue::Tuple(items) => marked(TAG_TUPLE, "items", Value::Array(encode_items(items)?)),
        StateValue::Map(map) => {
            let entries = encode_fields(map)?;
            if map.keys().any(|k| RESERVED_KEYS.contains(&k.as_str())) {
                marked(TAG_MAP, "entries", Value::Object(entries))
            } else {
                Value::Object(entries)
            }
        }
        StateValue::Object(obj) => {
            if obj.fields.contains_key(TAG_TYPE) {
                return Err(CheckpointError::Invalid(format!(
                    "tagged object '{}' cannot have a field named '{}'",
                    obj.type_name, TAG_TYPE
                )));
            }
            let mut fields = encode_fields(&obj.fields)?;
            fields.insert(TAG_TYPE.to_string(), Value::String(obj.type_name.clone()));
            Value::Object(fields)
        }
    })
}

fn encode_items(items: &[StateValue]) -> Result<Vec<Value>> {
    items.iter().map(encode).collect()
}

fn encode_fields(fields: &Fields) -> Result<Map<String, Value>> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), encode(v)?)))
        .collect()
}

fn marked(tag: &str, key: &str, body: Value) -> Value {
    let mut map = Map::new();
    map.insert(tag.to_string(), Value::Bool(true));
    map.insert(key.to_string(), body);
    Value::Object(map)
}

/// Decode a tagged value, constructing objects through the registry
pub fn decode(
    value: Value,
    registry: &TypeRegistry,
) -> std::result::Result<StateValue, DecodeError> {
    match value {
        Value::Null => Ok(StateValue::Null),
        Value::Bool(b) => Ok(StateValue::Bool(b)),
        Value::Number(n) => Ok(match n.as_i64() {
            Some(i) => StateValue::Int(i),
            None => StateValue::Float(n.as_f64().ok_or_else(|| {
                DecodeError::new("number", format!("unrepresentable number {}", n))
            })?),
        }),
        Value::String(s) => Ok(StateValue::String(s)),
        Value::Array(items) => Ok(StateValue::List(decode_items(items, registry)?)),
        Value::Object(mut map) => {
            if let Some(Value::String(type_name)) = map.get(TAG_TYPE).cloned() {
                map.remove(TAG_TYPE);
                let fields = decode_fields(map, registry)?;
                return Ok(StateValue::Object(registry.construct(&type_name, fields)?));
            }
            if is_marked(&map, TAG_TUPLE) {
                let items = take_array(&mut map, TAG_TUPLE)?;
                return Ok(StateValue::Tuple(decode_items(items, registry)?));
            }
            if is_marked(&map, TAG_SET) {
                let items = take_array(&mut map, TAG_SET)?;
                return Ok(StateValue::set(decode_items(items, registry)?));
            }
            if is_marked(&map, TAG_MAP) {
                return match map.remove("entries") {
                    Some(Value::Object(entries)) => {
                        Ok(StateValue::Map(decode_fields(entries, registry)?))
                    }
                    _ => Err(DecodeError::new(TAG_MAP, "marker without 'entries' object")),
                };
            }
            Ok(StateValue::Map(decode_fields(map, registry)?))
        }
    }
}

fn is_marked(map: &Map<String, Value>, tag: &str) -> bool {
    matches!(map.get(tag), Some(Value::Bool(true)))
}

fn take_array(
    map: &mut Map<String, Value>,
    tag: &str,
) -> std::result::Result<Vec<Value>, DecodeError> {
    match map.remove("items") {
        Some(Value::Array(items)) => Ok(items),
        _ => Err(DecodeError::new(tag, "marker without 'items' array")),
    }
}

fn decode_items(
    items: Vec<Value>,
    registry: &TypeRegistry,
) -> std::result::Result<Vec<StateValue>, DecodeError> {
    items.into_iter().map(|v| decode(v, registry)).collect()
}

fn decode_fields(
    map: Map<String, Value>,
    registry: &TypeRegistry,
) -> std::result::Result<Fields, DecodeError> {
    map.into_iter()
        .map(|(k, v)| Ok((k, decode(v, registry)?)))
        .collect()
}

/// Outermost stored form of a value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub type_name: String,
    /// Whether `type_name` names a registered object rather than a value kind.
    /// Absent in envelopes written before the flag existed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tagged: Option<bool>,
    pub schema_version: u32,
    pub data: Value,
}

impl Envelope {
    /// Wrap a value; tagged objects keep their fields in `data` and their name in `type`
    pub fn wrap(value: &StateValue, schema_version: u32) -> Result<Self> {
        let (type_name, tagged, data) = match value {
            StateValue::Object(obj) => {
                let plain = StateValue::Map(obj.fields.clone());
                (obj.type_name.clone(), true, encode(&plain)?)
            }
            other => (other.kind().to_string(), false, encode(other)?),
        };
        Ok(Self {
            type_name,
            tagged: Some(tagged),
            schema_version,
            data,
        })
    }

    /// Rebuild the value from (possibly migrated) envelope contents
    pub fn unwrap(self, registry: &TypeRegistry) -> std::result::Result<StateValue, DecodeError> {
        let tagged = self
            .tagged
            .unwrap_or_else(|| !KIND_NAMES.contains(&self.type_name.as_str()));
        if !tagged {
            return decode(self.data, registry);
        }
        match decode(self.data, registry)? {
            StateValue::Map(fields) => {
                Ok(StateValue::Object(registry.construct(&self.type_name, fields)?))
            }
            other => Err(DecodeError::new(
                self.type_name,
                format!("tagged envelope data must be an object, found '{}'", other.kind()),
            )),
        }
    }
}

/// A stored `(type_tag, payload)` pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedPayload {
    pub type_tag: String,
    pub payload: Option<Vec<u8>>,
}

impl TypedPayload {
    pub fn new(type_tag: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self {
            type_tag: type_tag.into(),
            payload,
        }
    }

    /// Marker for a versioned channel without a value
    pub fn empty() -> Self {
        Self::new(TYPE_EMPTY, None)
    }

    /// Plain JSON in the pre-envelope format
    pub fn legacy(value: &Value) -> Result<Self> {
        Ok(Self::new(TYPE_LEGACY, Some(serde_json::to_vec(value)?)))
    }

    pub fn is_empty(&self) -> bool {
        self.type_tag == TYPE_EMPTY
    }
}

/// A decoded payload
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedValue {
    /// `None` for `"empty"` rows
    pub value: Option<StateValue>,
    /// The stored form was older than the current schema
    pub was_migrated: bool,
    pub from_version: u32,
    pub to_version: u32,
    pub failed_steps: Vec<crate::error::MigrationStepError>,
    /// Re-encoded payload at the current schema, present when a complete
    /// migration happened and the row can be written back
    pub upgraded: Option<TypedPayload>,
}

impl LoadedValue {
    fn absent() -> Self {
        Self {
            value: None,
            was_migrated: false,
            from_version: 0,
            to_version: 0,
            failed_steps: Vec::new(),
            upgraded: None,
        }
    }
}

/// Protocol for turning values into stored payloads and back
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value; `None` produces the `"empty"` marker
    fn dumps_typed(&self, value: Option<&StateValue>) -> Result<TypedPayload>;

    /// Deserialize and migrate a stored payload
    fn loads_typed(&self, payload: &TypedPayload) -> std::result::Result<LoadedValue, DecodeError>;
}

/// Default serializer: tagged JSON envelopes with schema migration on read
#[derive(Debug, Clone, Default)]
pub struct JsonPlusSerializer {
    registry: TypeRegistry,
    migrations: Arc<MigrationEngine>,
}

impl JsonPlusSerializer {
    pub fn new(registry: TypeRegistry, migrations: MigrationEngine) -> Self {
        Self {
            registry,
            migrations: Arc::new(migrations),
        }
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn schema_version(&self) -> u32 {
        self.migrations.current_version()
    }

    fn load_envelope(
        &self,
        envelope: Envelope,
        legacy: bool,
    ) -> std::result::Result<LoadedValue, DecodeError> {
        let outcome = self
            .migrations
            .migrate(envelope.data, &envelope.type_name, envelope.schema_version);
        let migrated = Envelope {
            type_name: outcome.type_name,
            tagged: envelope.tagged,
            schema_version: outcome.to_version,
            data: outcome.data,
        };
        let value = migrated.unwrap(&self.registry)?;
        let was_migrated = legacy || outcome.was_migrated;

        let upgraded = if was_migrated && outcome.failed_steps.is_empty() {
            self.dumps_typed(Some(&value)).ok()
        } else {
            None
        };

        Ok(LoadedValue {
            value: Some(value),
            was_migrated,
            from_version: outcome.from_version,
            to_version: outcome.to_version,
            failed_steps: outcome.failed_steps,
            upgraded,
        })
    }

    /// Plain JSON from before envelopes: no tags, schema version 0
    fn load_legacy(&self, raw: Value) -> std::result::Result<LoadedValue, DecodeError> {
        let plain = StateValue::from(raw);
        let envelope = Envelope::wrap(&plain, 0)
            .map_err(|e| DecodeError::new(TYPE_LEGACY, e.to_string()))?;
        self.load_envelope(envelope, true)
    }
}

impl SerializerProtocol for JsonPlusSerializer {
    fn dumps_typed(&self, value: Option<&StateValue>) -> Result<TypedPayload> {
        match value {
            None => Ok(TypedPayload::empty()),
            Some(value) => {
                let envelope = Envelope::wrap(value, self.schema_version())?;
                Ok(TypedPayload::new(TYPE_JSON, Some(serde_json::to_vec(&envelope)?)))
            }
        }
    }

    fn loads_typed(&self, payload: &TypedPayload) -> std::result::Result<LoadedValue, DecodeError> {
        let bytes = || {
            payload
                .payload
                .as_deref()
                .ok_or_else(|| DecodeError::new(payload.type_tag.clone(), "missing payload"))
        };

        match payload.type_tag.as_str() {
            TYPE_EMPTY => Ok(LoadedValue::absent()),
            TYPE_JSON => {
                let raw: Value = serde_json::from_slice(bytes()?)
                    .map_err(|e| DecodeError::new(TYPE_JSON, e.to_string()))?;
                match serde_json::from_value::<Envelope>(raw.clone()) {
                    Ok(envelope) => self.load_envelope(envelope, false),
                    // valid JSON without an envelope predates versioning
                    Err(_) => self.load_legacy(raw),
                }
            }
            TYPE_LEGACY => {
                let raw: Value = serde_json::from_slice(bytes()?)
                    .map_err(|e| DecodeError::new(TYPE_LEGACY, e.to_string()))?;
                self.load_legacy(raw)
            }
            other => Err(DecodeError::new(other, "unknown type tag")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{FnMigration, Migration};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .register_opaque("Message")
            .register_opaque("Send")
            .build()
    }

    fn message(content: &str) -> StateValue {
        StateValue::object(
            "Message",
            BTreeMap::from([
                ("content".to_string(), StateValue::from(content)),
                ("role".to_string(), StateValue::from("user")),
            ]),
        )
    }

    #[test]
    fn test_tuple_is_distinct_from_list() {
        let tuple = StateValue::tuple(vec![StateValue::from("a"), StateValue::Int(1)]);
        let wire = encode(&tuple).unwrap();
        assert_eq!(wire, json!({"_tuple": true, "items": ["a", 1]}));
        assert_eq!(decode(wire, &registry()).unwrap(), tuple);
    }

    #[test]
    fn test_nested_tagged_objects() {
        let send = StateValue::object(
            "Send",
            BTreeMap::from([
                ("node".to_string(), StateValue::from("agent")),
                ("arg".to_string(), StateValue::List(vec![message("hi")])),
            ]),
        );
        let wire = encode(&send).unwrap();
        assert_eq!(wire["type"], json!("Send"));
        assert_eq!(wire["arg"][0]["type"], json!("Message"));
        assert_eq!(decode(wire, &registry()).unwrap(), send);
    }

    #[test]
    fn test_map_with_reserved_key_is_escaped() {
        let map = StateValue::Map(BTreeMap::from([
            ("type".to_string(), StateValue::from("not-a-tag")),
            ("n".to_string(), StateValue::Int(1)),
        ]));
        let wire = encode(&map).unwrap();
        assert_eq!(wire["_map"], json!(true));
        assert_eq!(decode(wire, &TypeRegistry::empty()).unwrap(), map);
    }

    #[test]
    fn test_unknown_tagged_type_fails() {
        let err = decode(json!({"type": "Mystery", "x": 1}), &registry()).unwrap_err();
        assert_eq!(err.context, "Mystery");
    }

    #[test]
    fn test_object_named_like_a_kind_round_trips() {
        let registry = TypeRegistry::builder()
            .register_opaque("map")
            .register_opaque("list")
            .build();
        let serde = JsonPlusSerializer::new(registry, MigrationEngine::none());
        for name in ["map", "list"] {
            let object = StateValue::object(
                name,
                BTreeMap::from([("a".to_string(), StateValue::Int(1))]),
            );
            let payload = serde.dumps_typed(Some(&object)).unwrap();
            assert_eq!(serde.loads_typed(&payload).unwrap().value, Some(object));
        }

        let plain = StateValue::Map(BTreeMap::from([("a".to_string(), StateValue::Int(1))]));
        let payload = serde.dumps_typed(Some(&plain)).unwrap();
        assert_eq!(serde.loads_typed(&payload).unwrap().value, Some(plain));
    }

    #[test]
    fn test_envelope_without_tagged_flag_uses_kind_names() {
        let serde = JsonPlusSerializer::new(registry(), MigrationEngine::none());
        let untagged = json!({"type": "map", "schema_version": 0, "data": {"a": 1}});
        let tagged = json!({"type": "Message", "schema_version": 0, "data": {"content": "hi"}});

        let load = |raw: Value| {
            let payload = TypedPayload::new(TYPE_JSON, Some(serde_json::to_vec(&raw).unwrap()));
            serde.loads_typed(&payload).unwrap().value.unwrap()
        };
        assert_eq!(load(untagged).kind(), "map");
        assert_eq!(load(tagged).kind(), "Message");
    }

    #[test]
    fn test_set_with_duplicates_rejected() {
        let raw = StateValue::Set(vec![StateValue::Int(1), StateValue::Int(1)]);
        assert!(matches!(encode(&raw), Err(CheckpointError::Invalid(_))));

        let set = StateValue::set(vec![StateValue::Int(1), StateValue::Int(1), StateValue::Int(2)]);
        let wire = encode(&set).unwrap();
        assert_eq!(decode(wire, &registry()).unwrap(), set);
    }

    #[test]
    fn test_non_finite_float_rejected() {
        assert!(encode(&StateValue::Float(f64::NAN)).is_err());
    }

    #[test]
    fn test_dumps_empty_marker() {
        let serde = JsonPlusSerializer::new(registry(), MigrationEngine::none());
        let payload = serde.dumps_typed(None).unwrap();
        assert!(payload.is_empty());
        assert_eq!(serde.loads_typed(&payload).unwrap().value, None);
    }

    #[test]
    fn test_envelope_carries_schema_version() {
        let engine = MigrationEngine::with_current_version(vec![], 3);
        let serde = JsonPlusSerializer::new(registry(), engine);
        let payload = serde.dumps_typed(Some(&message("hello"))).unwrap();
        let envelope: Envelope =
            serde_json::from_slice(payload.payload.as_deref().unwrap()).unwrap();
        assert_eq!(envelope.type_name, "Message");
        assert_eq!(envelope.tagged, Some(true));
        assert_eq!(envelope.schema_version, 3);
        assert_eq!(envelope.data["content"], json!("hello"));

        let loaded = serde.loads_typed(&payload).unwrap();
        assert_eq!(loaded.value, Some(message("hello")));
        assert!(!loaded.was_migrated);
        assert!(loaded.upgraded.is_none());
    }

    #[test]
    fn test_legacy_payload_is_migrated() {
        let wrap_messages: Arc<dyn Migration> = Arc::new(FnMigration::new(
            "count_messages",
            0,
            |mut data: Value, type_name: &str| {
                let count = data["messages"].as_array().map(|m| m.len()).unwrap_or(0);
                data["message_count"] = json!(count);
                Ok((data, type_name.to_string()))
            },
        ));
        let serde = JsonPlusSerializer::new(registry(), MigrationEngine::new(vec![wrap_messages]));
        let payload = TypedPayload::legacy(&json!({"messages": []})).unwrap();

        let loaded = serde.loads_typed(&payload).unwrap();
        let value = loaded.value.unwrap();
        assert_eq!(value.as_map().unwrap()["messages"], StateValue::List(vec![]));
        assert_eq!(value.as_map().unwrap()["message_count"], StateValue::Int(0));
        assert!(loaded.was_migrated);
        assert_eq!((loaded.from_version, loaded.to_version), (0, 1));

        let upgraded = loaded.upgraded.unwrap();
        assert_eq!(upgraded.type_tag, TYPE_JSON);
        let again = serde.loads_typed(&upgraded).unwrap();
        assert_eq!(again.value, Some(value));
        assert!(!again.was_migrated);
    }

    #[test]
    fn test_json_without_envelope_falls_back_to_legacy() {
        let serde = JsonPlusSerializer::new(registry(), MigrationEngine::none());
        let payload = TypedPayload::new(TYPE_JSON, Some(br#"[1, 2]"#.to_vec()));
        let loaded = serde.loads_typed(&payload).unwrap();
        assert_eq!(loaded.value, Some(StateValue::List(vec![1.into(), 2.into()])));
        assert!(loaded.was_migrated);
    }

    #[test]
    fn test_garbage_is_decode_error() {
        let serde = JsonPlusSerializer::default();
        assert!(serde
            .loads_typed(&TypedPayload::new(TYPE_JSON, Some(b"\x00\x01".to_vec())))
            .is_err());
        assert!(serde
            .loads_typed(&TypedPayload::new("pickle", Some(b"x".to_vec())))
            .is_err());
        assert!(serde.loads_typed(&TypedPayload::new(TYPE_JSON, None)).is_err());
    }

    #[test]
    fn test_incomplete_migration_is_not_written_back() {
        let broken: Arc<dyn Migration> = Arc::new(FnMigration::new(
            "broken",
            0,
            |_data: Value, _type_name: &str| Err("nope".to_string()),
        ));
        let serde = JsonPlusSerializer::new(registry(), MigrationEngine::new(vec![broken]));
        let loaded = serde
            .loads_typed(&TypedPayload::legacy(&json!({"a": 1})).unwrap())
            .unwrap();
        assert!(loaded.value.is_some());
        assert_eq!(loaded.failed_steps.len(), 1);
        assert!(loaded.upgraded.is_none());
    }
}
