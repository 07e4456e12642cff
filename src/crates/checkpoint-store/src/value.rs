//! In-memory channel values
//!
//! [`StateValue`] is what the engine hands to the store and what it gets back.
//! Beyond plain JSON-like data it distinguishes tuples and sets from lists, and
//! carries tagged objects ([`TaggedObject`]) whose type name is resolved through
//! a [`TypeRegistry`] when decoding.
//!
//! The registry is a constructed-once table of factories, one per type name.
//! Rust types opt in by implementing [`Tagged`] and being registered:
//!
//! ```rust
//! use checkpoint_store::{DecodeError, StateValue, Tagged, TypeRegistry};
//! use std::collections::BTreeMap;
//!
//! struct Message { role: String, content: String }
//!
//! impl Tagged for Message {
//!     const TYPE_NAME: &'static str = "Message";
//!
//!     fn to_fields(&self) -> BTreeMap<String, StateValue> {
//!         BTreeMap::from([
//!             ("role".to_string(), StateValue::from(self.role.as_str())),
//!             ("content".to_string(), StateValue::from(self.content.as_str())),
//!         ])
//!     }
//!
//!     fn from_fields(fields: &BTreeMap<String, StateValue>) -> Result<Self, DecodeError> {
//!         Ok(Self {
//!             role: checkpoint_store::value::required_str(fields, Self::TYPE_NAME, "role")?,
//!             content: checkpoint_store::value::required_str(fields, Self::TYPE_NAME, "content")?,
//!         })
//!     }
//! }
//!
//! let registry = TypeRegistry::builder().register::<Message>().build();
//! assert!(registry.contains("Message"));
//! ```

use crate::error::DecodeError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// Field map of a tagged object
pub type Fields = BTreeMap<String, StateValue>;

/// A channel value
#[derive(Debug, Clone, PartialEq, Default)]
pub enum StateValue {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    List(Vec<StateValue>),
    /// Unordered collection without duplicates; insertion order is kept.
    /// Build it with [`StateValue::set`]: encoding rejects duplicate items.
    Set(Vec<StateValue>),
    /// Fixed-size heterogeneous sequence
    Tuple(Vec<StateValue>),
    Map(BTreeMap<String, StateValue>),
    Object(TaggedObject),
}

impl StateValue {
    /// Build a set, dropping duplicates
    pub fn set(items: impl IntoIterator<Item = StateValue>) -> Self {
        let mut unique: Vec<StateValue> = Vec::new();
        for item in items {
            if !unique.contains(&item) {
                unique.push(item);
            }
        }
        StateValue::Set(unique)
    }

    pub fn tuple(items: impl IntoIterator<Item = StateValue>) -> Self {
        StateValue::Tuple(items.into_iter().collect())
    }

    pub fn object(type_name: impl Into<String>, fields: Fields) -> Self {
        StateValue::Object(TaggedObject::new(type_name, fields))
    }

    /// Short name of the value's shape, used as the envelope type for untagged values
    pub fn kind(&self) -> &str {
        match self {
            StateValue::Null => "null",
            StateValue::Bool(_) => "bool",
            StateValue::Int(_) => "int",
            StateValue::Float(_) => "float",
            StateValue::String(_) => "str",
            StateValue::List(_) => "list",
            StateValue::Set(_) => "set",
            StateValue::Tuple(_) => "tuple",
            StateValue::Map(_) => "map",
            StateValue::Object(obj) => &obj.type_name,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, StateValue::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StateValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StateValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[StateValue]> {
        match self {
            StateValue::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, StateValue>> {
        match self {
            StateValue::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&TaggedObject> {
        match self {
            StateValue::Object(obj) => Some(obj),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for StateValue {
    /// Plain conversion: objects become maps, arrays become lists. No tag is interpreted.
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => StateValue::Null,
            serde_json::Value::Bool(b) => StateValue::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => StateValue::Int(i),
                None => StateValue::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => StateValue::String(s),
            serde_json::Value::Array(items) => {
                StateValue::List(items.into_iter().map(StateValue::from).collect())
            }
            serde_json::Value::Object(map) => StateValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, StateValue::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for StateValue {
    fn from(s: &str) -> Self {
        StateValue::String(s.to_string())
    }
}

impl From<String> for StateValue {
    fn from(s: String) -> Self {
        StateValue::String(s)
    }
}

impl From<i64> for StateValue {
    fn from(i: i64) -> Self {
        StateValue::Int(i)
    }
}

impl From<f64> for StateValue {
    fn from(f: f64) -> Self {
        StateValue::Float(f)
    }
}

impl From<bool> for StateValue {
    fn from(b: bool) -> Self {
        StateValue::Bool(b)
    }
}

impl From<Vec<StateValue>> for StateValue {
    fn from(items: Vec<StateValue>) -> Self {
        StateValue::List(items)
    }
}

impl From<TaggedObject> for StateValue {
    fn from(obj: TaggedObject) -> Self {
        StateValue::Object(obj)
    }
}

/// A value carrying its own type name
#[derive(Debug, Clone, PartialEq)]
pub struct TaggedObject {
    pub type_name: String,
    pub fields: Fields,
}

impl TaggedObject {
    pub fn new(type_name: impl Into<String>, fields: Fields) -> Self {
        Self {
            type_name: type_name.into(),
            fields,
        }
    }

    pub fn get(&self, field: &str) -> Option<&StateValue> {
        self.fields.get(field)
    }
}

/// Rust types that round-trip through a [`TaggedObject`]
pub trait Tagged: Sized {
    const TYPE_NAME: &'static str;

    fn to_fields(&self) -> Fields;

    fn from_fields(fields: &Fields) -> Result<Self, DecodeError>;

    fn to_value(&self) -> StateValue {
        StateValue::object(Self::TYPE_NAME, self.to_fields())
    }

    fn from_value(value: &StateValue) -> Result<Self, DecodeError> {
        match value {
            StateValue::Object(obj) if obj.type_name == Self::TYPE_NAME => {
                Self::from_fields(&obj.fields)
            }
            other => Err(DecodeError::new(
                Self::TYPE_NAME,
                format!("expected tagged object, found '{}'", other.kind()),
            )),
        }
    }
}

/// Read a required string field
pub fn required_str(fields: &Fields, type_name: &str, field: &str) -> Result<String, DecodeError> {
    fields
        .get(field)
        .and_then(StateValue::as_str)
        .map(str::to_string)
        .ok_or_else(|| DecodeError::new(type_name, format!("missing string field '{}'", field)))
}

/// Factory invoked when decoding a tagged object of a registered type
pub type Factory = Arc<dyn Fn(Fields) -> Result<TaggedObject, DecodeError> + Send + Sync>;

/// Type name → factory table
#[derive(Clone, Default)]
pub struct TypeRegistry {
    factories: Arc<HashMap<String, Factory>>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    /// Registry that knows no tagged types
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Reconstruct a tagged object through its registered factory
    pub fn construct(&self, type_name: &str, fields: Fields) -> Result<TaggedObject, DecodeError> {
        let factory = self.factories.get(type_name).ok_or_else(|| {
            DecodeError::new(type_name, "no factory registered for tagged type")
        })?;
        factory(fields)
    }
}

impl fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.type_names())
            .finish()
    }
}

/// Collects factories before the registry is frozen
#[derive(Default)]
pub struct TypeRegistryBuilder {
    factories: HashMap<String, Factory>,
}

impl TypeRegistryBuilder {
    /// Register a [`Tagged`] type; decoding validates fields through `T::from_fields`
    pub fn register<T: Tagged + 'static>(mut self) -> Self {
        let factory: Factory = Arc::new(|fields: Fields| {
            let typed = T::from_fields(&fields)?;
            Ok(TaggedObject::new(T::TYPE_NAME, typed.to_fields()))
        });
        self.factories.insert(T::TYPE_NAME.to_string(), factory);
        self
    }

    /// Register a type whose fields are accepted as stored
    pub fn register_opaque(mut self, type_name: impl Into<String>) -> Self {
        let name: String = type_name.into();
        let owned = name.clone();
        let factory: Factory = Arc::new(move |fields| Ok(TaggedObject::new(owned.clone(), fields)));
        self.factories.insert(name, factory);
        self
    }

    /// Register a custom factory
    pub fn register_fn<F>(mut self, type_name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(Fields) -> Result<TaggedObject, DecodeError> + Send + Sync + 'static,
    {
        self.factories.insert(type_name.into(), Arc::new(factory));
        self
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry {
            factories: Arc::new(self.factories),
        }
    }
}
