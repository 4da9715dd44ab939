// used for persistence of native columns and type tags
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};

// used for the datetime meta type
use chrono::NaiveDateTime;
// used for array and object payloads
use serde::Serialize;
use serde_json::{Map, Number, Value as Json};

// used to print out readable forms of a value
use std::fmt;
use std::sync::Arc;

use crate::entity::Entity;
use crate::error::{MetableError, Result};
use crate::reference::ReferenceResolver;

/// Layout used for datetime payloads, both ways.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

/// Separates the entity type from its id in a model reference payload.
pub const REFERENCE_SEPARATOR: char = '#';

/// The type tag persisted next to every encoded meta value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TypeTag {
    Bool,
    Int,
    Float,
    String,
    Null,
    Array,
    Object,
    DateTime,
    Model,
}

impl TypeTag {
    pub const ALL: [TypeTag; 9] = [
        TypeTag::Bool,
        TypeTag::Int,
        TypeTag::Float,
        TypeTag::String,
        TypeTag::Null,
        TypeTag::Array,
        TypeTag::Object,
        TypeTag::DateTime,
        TypeTag::Model,
    ];
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeTag::Bool => "boolean",
            TypeTag::Int => "integer",
            TypeTag::Float => "double",
            TypeTag::String => "string",
            TypeTag::Null => "null",
            TypeTag::Array => "array",
            TypeTag::Object => "object",
            TypeTag::DateTime => "datetime",
            TypeTag::Model => "model",
        }
    }
    // rows written by other tools may use the short or upper case spellings
    pub fn parse(tag: &str) -> Option<TypeTag> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "boolean" | "bool" => Some(TypeTag::Bool),
            "integer" | "int" => Some(TypeTag::Int),
            "double" | "float" => Some(TypeTag::Float),
            "string" => Some(TypeTag::String),
            "null" | "" => Some(TypeTag::Null),
            "array" => Some(TypeTag::Array),
            "object" => Some(TypeTag::Object),
            "datetime" => Some(TypeTag::DateTime),
            "model" => Some(TypeTag::Model),
            _ => None,
        }
    }
}
impl fmt::Display for TypeTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
impl ToSql for TypeTag {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}
impl FromSql for TypeTag {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(TypeTag::Null),
            _ => TypeTag::parse(value.as_str()?).ok_or(FromSqlError::InvalidType),
        }
    }
}

/// A dynamically typed attribute value, native or meta.
#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Json>),
    Object(Map<String, Json>),
    DateTime(NaiveDateTime),
    Model(Arc<Entity>),
}

impl Value {
    pub fn type_tag(&self) -> TypeTag {
        match self {
            Value::Null => TypeTag::Null,
            Value::Bool(_) => TypeTag::Bool,
            Value::Int(_) => TypeTag::Int,
            Value::Float(_) => TypeTag::Float,
            Value::String(_) => TypeTag::String,
            Value::Array(_) => TypeTag::Array,
            Value::Object(_) => TypeTag::Object,
            Value::DateTime(_) => TypeTag::DateTime,
            Value::Model(_) => TypeTag::Model,
        }
    }
    /// Structural snapshot of any serializable value. Maps become objects and
    /// sequences become arrays; the original type identity is not kept.
    pub fn object<T: Serialize>(value: &T) -> Result<Value> {
        Ok(Value::from_json(serde_json::to_value(value)?))
    }
    pub fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(a) => Value::Array(a),
            Json::Object(o) => Value::Object(o),
        }
    }
    pub fn to_json(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => Number::from_f64(*f).map(Json::Number).unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(a) => Json::Array(a.clone()),
            Value::Object(o) => Json::Object(o.clone()),
            Value::DateTime(d) => Json::String(d.format(DATETIME_FORMAT).to_string()),
            Value::Model(e) => Json::String(e.reference()),
        }
    }
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
    pub fn as_datetime(&self) -> Option<&NaiveDateTime> {
        match self {
            Value::DateTime(d) => Some(d),
            _ => None,
        }
    }
    pub fn as_model(&self) -> Option<&Arc<Entity>> {
        match self {
            Value::Model(e) => Some(e),
            _ => None,
        }
    }
    pub fn as_array(&self) -> Option<&[Json]> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
    pub fn as_object(&self) -> Option<&Map<String, Json>> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }
}

// Strict equality: the variants must agree, so Int(0) differs from String("0").
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::DateTime(a), Value::DateTime(b)) => a == b,
            (Value::Model(a), Value::Model(b)) => {
                Arc::ptr_eq(a, b)
                    || (a.type_name() == b.type_name() && a.id().is_some() && a.id() == b.id())
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(x) => write!(f, "{}", x),
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
            Value::DateTime(d) => write!(f, "{}", d.format(DATETIME_FORMAT)),
            Value::Model(e) => write!(f, "{}", e.reference()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}
impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}
impl From<i32> for Value {
    fn from(i: i32) -> Self { Value::Int(i64::from(i)) }
}
impl From<u32> for Value {
    fn from(i: u32) -> Self { Value::Int(i64::from(i)) }
}
impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::Float(f) }
}
impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::String(s.to_owned()) }
}
impl From<String> for Value {
    fn from(s: String) -> Self { Value::String(s) }
}
impl From<&String> for Value {
    fn from(s: &String) -> Self { Value::String(s.clone()) }
}
impl From<NaiveDateTime> for Value {
    fn from(d: NaiveDateTime) -> Self { Value::DateTime(d) }
}
impl From<Vec<Json>> for Value {
    fn from(a: Vec<Json>) -> Self { Value::Array(a) }
}
impl From<Map<String, Json>> for Value {
    fn from(o: Map<String, Json>) -> Self { Value::Object(o) }
}
impl From<Entity> for Value {
    fn from(e: Entity) -> Self { Value::Model(Arc::new(e)) }
}
impl From<Arc<Entity>> for Value {
    fn from(e: Arc<Entity>) -> Self { Value::Model(e) }
}
impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(o: Option<T>) -> Self {
        o.map(Into::into).unwrap_or(Value::Null)
    }
}

// Native columns hold plain values; structured ones are stored as JSON text.
impl ToSql for Value {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            Value::Null => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            Value::Bool(b) => ToSqlOutput::from(*b),
            Value::Int(i) => ToSqlOutput::from(*i),
            Value::Float(f) => ToSqlOutput::from(*f),
            Value::String(s) => ToSqlOutput::from(s.as_str()),
            Value::Array(_) | Value::Object(_) => ToSqlOutput::from(self.to_json().to_string()),
            Value::DateTime(d) => ToSqlOutput::from(d.format(DATETIME_FORMAT).to_string()),
            Value::Model(e) => match e.id() {
                Some(id) => ToSqlOutput::from(id),
                None => ToSqlOutput::Owned(rusqlite::types::Value::Null),
            },
        })
    }
}
impl FromSql for Value {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        Ok(match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Int(i),
            ValueRef::Real(f) => Value::Float(f),
            ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::String(String::from_utf8_lossy(b).into_owned()),
        })
    }
}

/// The `(type tag, payload)` pair a value is stored as.
pub type Encoded = (TypeTag, Option<String>);

/// Turns values into their persisted `(type tag, payload)` form and back.
///
/// Model references go through the supplied [`ReferenceResolver`] so that
/// repeated decodes of the same reference return the same instance.
pub trait ValueCodec: Send + Sync {
    fn encode(&self, value: &Value, refs: &ReferenceResolver) -> Result<Encoded>;
    fn decode(&self, tag: TypeTag, raw: Option<&str>, refs: &ReferenceResolver) -> Result<Value>;
}

/// Default codec: primitives as text, arrays and objects as JSON.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl ValueCodec for JsonCodec {
    fn encode(&self, value: &Value, refs: &ReferenceResolver) -> Result<Encoded> {
        let encoded = match value {
            Value::Null => (TypeTag::Null, None),
            Value::Bool(b) => (TypeTag::Bool, Some(if *b { "1" } else { "0" }.to_owned())),
            Value::Int(i) => (TypeTag::Int, Some(i.to_string())),
            Value::Float(f) => (TypeTag::Float, Some(f.to_string())),
            Value::String(s) => (TypeTag::String, Some(s.clone())),
            Value::Array(a) => (TypeTag::Array, Some(serde_json::to_string(a)?)),
            Value::Object(o) => (TypeTag::Object, Some(serde_json::to_string(o)?)),
            Value::DateTime(d) => (TypeTag::DateTime, Some(d.format(DATETIME_FORMAT).to_string())),
            Value::Model(e) => {
                refs.remember(e)?;
                (TypeTag::Model, Some(e.reference()))
            }
        };
        Ok(encoded)
    }

    fn decode(&self, tag: TypeTag, raw: Option<&str>, refs: &ReferenceResolver) -> Result<Value> {
        let Some(raw) = raw else {
            return Ok(Value::Null);
        };
        match tag {
            TypeTag::Null => Ok(Value::Null),
            TypeTag::Bool => Ok(Value::Bool(!matches!(raw.trim(), "" | "0" | "false"))),
            TypeTag::Int => raw
                .trim()
                .parse::<i64>()
                .map(Value::Int)
                .map_err(|e| MetableError::corrupt(format!("'{}' is not an integer: {}", raw, e))),
            TypeTag::Float => raw
                .trim()
                .parse::<f64>()
                .map(Value::Float)
                .map_err(|e| MetableError::corrupt(format!("'{}' is not a double: {}", raw, e))),
            TypeTag::String => Ok(Value::String(raw.to_owned())),
            TypeTag::Array | TypeTag::Object => Ok(Value::from_json(serde_json::from_str(raw)?)),
            TypeTag::DateTime => NaiveDateTime::parse_from_str(raw, DATETIME_FORMAT)
                .map(Value::DateTime)
                .map_err(|e| MetableError::corrupt(format!("'{}' is not a datetime: {}", raw, e))),
            TypeTag::Model => match raw.split_once(REFERENCE_SEPARATOR) {
                // the referenced entity had not been persisted when it was stored
                None => Ok(Value::from(refs.instantiate(raw)?)),
                Some((type_name, id)) => {
                    let id = id.parse::<i64>().map_err(|e| {
                        MetableError::corrupt(format!("'{}' is not a model reference: {}", raw, e))
                    })?;
                    Ok(Value::Model(refs.resolve(type_name, id)?))
                }
            },
        }
    }
}
