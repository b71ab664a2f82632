use crate::error::{Error, Result};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use indexmap::IndexMap;
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// The string a circular reference is replaced with when `remove_circular` is set.
pub const CIRCULAR_PLACEHOLDER: &str = "[Circular]";

/// A value that has no representation in the `Struct` wire form, like a date or a callback.
///
/// The converter refuses these unless `stringify` is set, in which case their [`Display`](fmt::Display)
/// form is used.
pub trait Opaque: fmt::Display + fmt::Debug + Send + Sync {
    /// The name used in the [`UnsupportedType`](Error::UnsupportedType) error.
    fn type_name(&self) -> &str;
}

impl Opaque for chrono::DateTime<chrono::Utc> {
    fn type_name(&self) -> &str {
        "date"
    }
}

/// An arbitrary, possibly cyclic, in-memory value to be logged.
#[derive(Clone, Debug)]
pub enum Dynamic {
    Undefined,
    Null,
    Number(f64),
    String(String),
    Bool(bool),
    Bytes(Vec<u8>),
    Object(ObjectRef),
    Array(Vec<Dynamic>),
    Opaque(Arc<dyn Opaque>),
}

/// A shared object with identity. Cloning an `ObjectRef` yields another handle to the same object,
/// which is what makes self references and cycles possible.
///
/// Properties keep their insertion order. Note that a cyclic graph keeps itself alive; call
/// [`clear`](ObjectRef::clear) on one of its members to break the cycle.
#[derive(Clone, Default)]
pub struct ObjectRef(Arc<RwLock<Vec<(String, Dynamic)>>>);

/// The protobuf `Value` message: exactly one of its kinds is set.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DynamicValue {
    NullValue(NullValue),
    NumberValue(f64),
    StringValue(String),
    BoolValue(bool),
    BlobValue(#[serde(with = "blob")] Vec<u8>),
    StructValue(StructObject),
    ListValue(ListValue),
}

/// The protobuf `NullValue` enum, which has the single value `NULL_VALUE = 0`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NullValue;

/// The protobuf `Struct` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StructObject {
    #[serde(default)]
    pub fields: IndexMap<String, DynamicValue>,
}

/// The protobuf `ListValue` message.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ListValue {
    #[serde(default)]
    pub values: Vec<DynamicValue>,
}

/// Options for the [`ObjectToStructConverter`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConversionOptions {
    /// Replace circular references with [`CIRCULAR_PLACEHOLDER`] instead of failing.
    pub remove_circular: bool,
    /// Convert values without a wire representation to their string form instead of failing.
    pub stringify: bool,
}

/// Converts [`ObjectRef`]s into [`StructObject`]s.
///
/// The converter tracks the objects on the current recursion path only, so an object that is
/// referenced twice from different branches is converted twice. Only an object that (indirectly)
/// contains itself is treated as circular.
#[derive(Debug, Default)]
pub struct ObjectToStructConverter {
    seen_objects: HashSet<usize>,
    remove_circular: bool,
    stringify: bool,
}

impl ObjectToStructConverter {
    pub fn new(options: ConversionOptions) -> Self {
        Self {
            seen_objects: HashSet::new(),
            remove_circular: options.remove_circular,
            stringify: options.stringify,
        }
    }

    /// Converts an object to a `Struct`, skipping properties whose value is [`Dynamic::Undefined`].
    ///
    /// # Errors
    ///
    /// [`Error::CircularReference`] when the object contains itself and `remove_circular` is off,
    /// [`Error::UnsupportedType`] for values without an encoding when `stringify` is off.
    pub fn convert(&mut self, obj: &ObjectRef) -> Result<StructObject> {
        let id = obj.id();
        self.seen_objects.insert(id);
        let converted = self.convert_fields(obj);
        self.seen_objects.remove(&id);
        converted
    }

    fn convert_fields(&mut self, obj: &ObjectRef) -> Result<StructObject> {
        let mut converted = StructObject::default();
        for (prop, value) in obj.entries() {
            if let Dynamic::Undefined = value {
                continue;
            }
            converted.fields.insert(prop, self.encode_value(&value)?);
        }
        Ok(converted)
    }

    /// Converts a single value to its tagged wire form.
    pub fn encode_value(&mut self, value: &Dynamic) -> Result<DynamicValue> {
        let converted = match value {
            Dynamic::Null => DynamicValue::NullValue(NullValue),
            Dynamic::Number(n) => DynamicValue::NumberValue(*n),
            Dynamic::String(s) => DynamicValue::StringValue(s.clone()),
            Dynamic::Bool(b) => DynamicValue::BoolValue(*b),
            Dynamic::Bytes(bytes) => DynamicValue::BlobValue(bytes.clone()),
            Dynamic::Object(obj) => {
                if self.seen_objects.contains(&obj.id()) {
                    if !self.remove_circular {
                        return Err(Error::CircularReference);
                    }
                    DynamicValue::StringValue(CIRCULAR_PLACEHOLDER.to_string())
                } else {
                    DynamicValue::StructValue(self.convert(obj)?)
                }
            }
            Dynamic::Array(items) => DynamicValue::ListValue(ListValue {
                values: items
                    .iter()
                    .map(|item| self.encode_value(item))
                    .collect::<Result<Vec<_>>>()?,
            }),
            Dynamic::Undefined | Dynamic::Opaque(_) => {
                if !self.stringify {
                    return Err(Error::UnsupportedType(value.type_name().to_string()));
                }
                DynamicValue::StringValue(value.to_string())
            }
        };
        Ok(converted)
    }
}

/// Converts `obj` to a `Struct` with a fresh converter.
pub fn obj_to_struct(obj: &ObjectRef, options: ConversionOptions) -> Result<StructObject> {
    ObjectToStructConverter::new(options).convert(obj)
}

/// Condenses a `Struct` into an object holding only the decoded values.
pub fn struct_to_obj(s: &StructObject) -> ObjectRef {
    let obj = ObjectRef::new();
    for (prop, value) in &s.fields {
        obj.insert(prop.clone(), decode_value(value));
    }
    obj
}

/// Decodes a single tagged value.
pub fn decode_value(value: &DynamicValue) -> Dynamic {
    match value {
        DynamicValue::StructValue(s) => Dynamic::Object(struct_to_obj(s)),
        DynamicValue::NullValue(_) => Dynamic::Null,
        DynamicValue::ListValue(list) => {
            Dynamic::Array(list.values.iter().map(decode_value).collect())
        }
        DynamicValue::NumberValue(n) => Dynamic::Number(*n),
        DynamicValue::StringValue(s) => Dynamic::String(s.clone()),
        DynamicValue::BoolValue(b) => Dynamic::Bool(*b),
        DynamicValue::BlobValue(bytes) => Dynamic::Bytes(bytes.clone()),
    }
}

impl StructObject {
    /// Parses the JSON wire form of a `Struct`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Decode`] for malformed input, including values carrying an unknown kind or
    /// more than one kind.
    pub fn from_json_str(s: &str) -> Result<Self> {
        serde_json::from_str(s).map_err(Error::Decode)
    }

    /// Same as [`from_json_str`](StructObject::from_json_str) for an already parsed document.
    pub fn from_json_value(value: serde_json::Value) -> Result<Self> {
        serde_json::from_value(value).map_err(Error::Decode)
    }
}

impl ObjectRef {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<(String, Dynamic)>> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<(String, Dynamic)>> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as *const () as usize
    }

    /// Sets a property. An existing property keeps its position and its old value is returned.
    pub fn insert<K, V>(&self, key: K, value: V) -> Option<Dynamic>
    where
        K: Into<String>,
        V: Into<Dynamic>,
    {
        let key = key.into();
        let value = value.into();
        let mut props = self.write();
        match props.iter_mut().find(|(k, _)| *k == key) {
            Some((_, existing)) => Some(std::mem::replace(existing, value)),
            None => {
                props.push((key, value));
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Dynamic> {
        self.read()
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }

    pub fn remove(&self, key: &str) -> Option<Dynamic> {
        let mut props = self.write();
        let pos = props.iter().position(|(k, _)| k == key)?;
        Some(props.remove(pos).1)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.read().iter().any(|(k, _)| k == key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn clear(&self) {
        self.write().clear()
    }

    pub fn keys(&self) -> Vec<String> {
        self.read().iter().map(|(k, _)| k.clone()).collect()
    }

    /// A snapshot of the properties in insertion order.
    pub fn entries(&self) -> Vec<(String, Dynamic)> {
        self.read().clone()
    }

    /// Whether both handles point to the same object.
    pub fn ptr_eq(&self, other: &ObjectRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Renders the object as JSON. Circular references become [`CIRCULAR_PLACEHOLDER`].
    pub fn to_json(&self) -> serde_json::Map<String, serde_json::Value> {
        let mut path = Vec::new();
        self.to_json_on_path(&mut path)
    }

    fn to_json_on_path(&self, path: &mut Vec<usize>) -> serde_json::Map<String, serde_json::Value> {
        path.push(self.id());
        let mut map = serde_json::Map::new();
        for (k, v) in self.entries() {
            if let Dynamic::Undefined = v {
                continue;
            }
            map.insert(k, v.to_json_on_path(path));
        }
        path.pop();
        map
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:#x}, {:?})", self.id(), self.keys())
    }
}

// Structural equality. Only meant for acyclic graphs.
impl PartialEq for ObjectRef {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        let (left, right) = (self.entries(), other.entries());
        left.len() == right.len()
            && left
                .iter()
                .all(|(k, v)| right.iter().any(|(rk, rv)| rk == k && rv == v))
    }
}

impl Dynamic {
    /// Wraps a value without a wire representation.
    pub fn opaque<T: Opaque + 'static>(value: T) -> Self {
        Dynamic::Opaque(Arc::new(value))
    }

    pub fn type_name(&self) -> &str {
        match self {
            Dynamic::Undefined => "undefined",
            Dynamic::Null => "null",
            Dynamic::Number(_) => "number",
            Dynamic::String(_) => "string",
            Dynamic::Bool(_) => "boolean",
            Dynamic::Bytes(_) => "bytes",
            Dynamic::Object(_) => "object",
            Dynamic::Array(_) => "array",
            Dynamic::Opaque(o) => o.type_name(),
        }
    }

    pub fn as_object(&self) -> Option<&ObjectRef> {
        match self {
            Dynamic::Object(obj) => Some(obj),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Dynamic::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Dynamic::Undefined)
    }

    /// Renders the value as JSON. Bytes become base64 strings, opaque values their string form and
    /// circular references [`CIRCULAR_PLACEHOLDER`].
    pub fn to_json(&self) -> serde_json::Value {
        let mut path = Vec::new();
        self.to_json_on_path(&mut path)
    }

    fn to_json_on_path(&self, path: &mut Vec<usize>) -> serde_json::Value {
        use serde_json::Value;

        match self {
            Dynamic::Undefined | Dynamic::Null => Value::Null,
            Dynamic::Number(n) => number_to_json(*n),
            Dynamic::String(s) => Value::String(s.clone()),
            Dynamic::Bool(b) => Value::Bool(*b),
            Dynamic::Bytes(bytes) => Value::String(STANDARD.encode(bytes)),
            Dynamic::Object(obj) if path.contains(&obj.id()) => {
                Value::String(CIRCULAR_PLACEHOLDER.to_string())
            }
            Dynamic::Object(obj) => Value::Object(obj.to_json_on_path(path)),
            Dynamic::Array(items) => {
                Value::Array(items.iter().map(|v| v.to_json_on_path(path)).collect())
            }
            Dynamic::Opaque(o) => Value::String(o.to_string()),
        }
    }
}

fn number_to_json(n: f64) -> serde_json::Value {
    if n.fract() == 0.0 && n.abs() < 9_007_199_254_740_992.0 {
        serde_json::Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null)
    }
}

// Mirrors how a script runtime renders values as strings, which is what `stringify` produces.
impl fmt::Display for Dynamic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dynamic::Undefined => f.write_str("undefined"),
            Dynamic::Null => f.write_str("null"),
            Dynamic::Number(n) if n.is_nan() => f.write_str("NaN"),
            Dynamic::Number(n) if n.is_infinite() => {
                f.write_str(if *n > 0.0 { "Infinity" } else { "-Infinity" })
            }
            Dynamic::Number(n) => write!(f, "{n}"),
            Dynamic::String(s) => f.write_str(s),
            Dynamic::Bool(b) => write!(f, "{b}"),
            Dynamic::Bytes(bytes) => f.write_str(&String::from_utf8_lossy(bytes)),
            Dynamic::Object(_) => f.write_str("[object Object]"),
            Dynamic::Array(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    match item {
                        Dynamic::Undefined | Dynamic::Null => {}
                        other => write!(f, "{other}")?,
                    }
                }
                Ok(())
            }
            Dynamic::Opaque(o) => write!(f, "{o}"),
        }
    }
}

impl PartialEq for Dynamic {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Dynamic::Undefined, Dynamic::Undefined) | (Dynamic::Null, Dynamic::Null) => true,
            (Dynamic::Number(a), Dynamic::Number(b)) => a == b,
            (Dynamic::String(a), Dynamic::String(b)) => a == b,
            (Dynamic::Bool(a), Dynamic::Bool(b)) => a == b,
            (Dynamic::Bytes(a), Dynamic::Bytes(b)) => a == b,
            (Dynamic::Object(a), Dynamic::Object(b)) => a == b,
            (Dynamic::Array(a), Dynamic::Array(b)) => a == b,
            (Dynamic::Opaque(a), Dynamic::Opaque(b)) => {
                a.type_name() == b.type_name() && a.to_string() == b.to_string()
            }
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Dynamic {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => Dynamic::Null,
            Value::Bool(b) => Dynamic::Bool(b),
            Value::Number(n) => Dynamic::Number(n.as_f64().unwrap_or(f64::NAN)),
            Value::String(s) => Dynamic::String(s),
            Value::Array(items) => Dynamic::Array(items.into_iter().map(Dynamic::from).collect()),
            Value::Object(map) => Dynamic::Object(ObjectRef::from(map)),
        }
    }
}

impl From<serde_json::Map<String, serde_json::Value>> for ObjectRef {
    fn from(map: serde_json::Map<String, serde_json::Value>) -> Self {
        let obj = ObjectRef::new();
        for (k, v) in map {
            obj.insert(k, v);
        }
        obj
    }
}

impl From<ObjectRef> for Dynamic {
    fn from(obj: ObjectRef) -> Self {
        Dynamic::Object(obj)
    }
}

impl From<Vec<Dynamic>> for Dynamic {
    fn from(items: Vec<Dynamic>) -> Self {
        Dynamic::Array(items)
    }
}

impl From<&str> for Dynamic {
    fn from(s: &str) -> Self {
        Dynamic::String(s.to_string())
    }
}

impl From<String> for Dynamic {
    fn from(s: String) -> Self {
        Dynamic::String(s)
    }
}

impl From<f64> for Dynamic {
    fn from(n: f64) -> Self {
        Dynamic::Number(n)
    }
}

impl From<i64> for Dynamic {
    fn from(n: i64) -> Self {
        Dynamic::Number(n as f64)
    }
}

impl From<bool> for Dynamic {
    fn from(b: bool) -> Self {
        Dynamic::Bool(b)
    }
}

impl<T: Into<Dynamic>> From<Option<T>> for Dynamic {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(Dynamic::Undefined)
    }
}

impl Serialize for NullValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_i32(0)
    }
}

impl<'de> Deserialize<'de> for NullValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NullValueVisitor;

        impl Visitor<'_> for NullValueVisitor {
            type Value = NullValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("0, null or \"NULL_VALUE\"")
            }

            fn visit_unit<E: de::Error>(self) -> std::result::Result<NullValue, E> {
                Ok(NullValue)
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<NullValue, E> {
                match v {
                    0 => Ok(NullValue),
                    _ => Err(E::invalid_value(de::Unexpected::Unsigned(v), &self)),
                }
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<NullValue, E> {
                match v {
                    0 => Ok(NullValue),
                    _ => Err(E::invalid_value(de::Unexpected::Signed(v), &self)),
                }
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<NullValue, E> {
                match v {
                    "NULL_VALUE" => Ok(NullValue),
                    _ => Err(E::invalid_value(de::Unexpected::Str(v), &self)),
                }
            }
        }

        deserializer.deserialize_any(NullValueVisitor)
    }
}

// Bytes travel as base64 in the JSON mapping of protobuf.
mod blob {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn object(props: Vec<(&str, Dynamic)>) -> ObjectRef {
        let obj = ObjectRef::new();
        for (k, v) in props {
            obj.insert(k, v);
        }
        obj
    }

    fn convert(obj: &ObjectRef, remove_circular: bool, stringify: bool) -> Result<StructObject> {
        obj_to_struct(
            obj,
            ConversionOptions {
                remove_circular,
                stringify,
            },
        )
    }

    #[test]
    fn converts_primitives_to_their_kinds() {
        let obj = object(vec![
            ("a_null", Dynamic::Null),
            ("a_number", 8.5.into()),
            ("a_string", "Hi".into()),
            ("a_bool", true.into()),
            ("a_blob", Dynamic::Bytes(b"hello".to_vec())),
        ]);

        let s = convert(&obj, false, false).unwrap();

        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            json!({
                "fields": {
                    "a_null": {"nullValue": 0},
                    "a_number": {"numberValue": 8.5},
                    "a_string": {"stringValue": "Hi"},
                    "a_bool": {"boolValue": true},
                    "a_blob": {"blobValue": "aGVsbG8="},
                }
            })
        );
    }

    #[test]
    fn converts_nested_objects_and_lists() {
        let inner = object(vec![("name", "Stephen".into())]);
        let obj = object(vec![
            ("person", inner.into()),
            ("tags", vec![Dynamic::from("a"), vec![Dynamic::from(1.0)].into()].into()),
        ]);

        let s = convert(&obj, false, false).unwrap();

        assert_eq!(
            serde_json::to_value(&s).unwrap(),
            json!({
                "fields": {
                    "person": {"structValue": {"fields": {"name": {"stringValue": "Stephen"}}}},
                    "tags": {"listValue": {"values": [
                        {"stringValue": "a"},
                        {"listValue": {"values": [{"numberValue": 1.0}]}},
                    ]}},
                }
            })
        );
    }

    #[test]
    fn undefined_properties_are_dropped() {
        let obj = object(vec![("a", Dynamic::Undefined)]);
        let s = convert(&obj, false, false).unwrap();
        assert!(s.fields.is_empty());
    }

    #[test]
    fn self_reference_is_an_error_by_default() {
        let obj = object(vec![("a", "b".into())]);
        obj.insert("me", obj.clone());

        let result = convert(&obj, false, false);
        obj.clear();

        assert!(matches!(result, Err(Error::CircularReference)));
    }

    #[test]
    fn self_reference_is_replaced_when_removing_circular() {
        let obj = object(vec![("a", "b".into())]);
        let child = object(vec![("parent", obj.clone().into())]);
        obj.insert("child", child);

        let result = convert(&obj, true, false);
        obj.clear();

        let decoded = struct_to_obj(&result.unwrap());
        let child = decoded.get("child").unwrap();
        assert_eq!(
            child.as_object().unwrap().get("parent"),
            Some(Dynamic::String(CIRCULAR_PLACEHOLDER.to_string()))
        );
        assert_eq!(decoded.get("a"), Some(Dynamic::from("b")));
    }

    #[test]
    fn shared_but_acyclic_objects_are_not_circular() {
        let shared = object(vec![("x", 1.0.into())]);
        let obj = object(vec![
            ("left", shared.clone().into()),
            ("right", shared.into()),
        ]);

        let s = convert(&obj, false, false).unwrap();

        assert_eq!(s.fields["left"], s.fields["right"]);
        assert!(matches!(s.fields["left"], DynamicValue::StructValue(_)));
    }

    #[test]
    fn unrecognized_types_are_an_error_by_default() {
        let date = chrono::DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let obj = object(vec![("when", Dynamic::opaque(date))]);

        match convert(&obj, false, false) {
            Err(Error::UnsupportedType(name)) => assert_eq!(name, "date"),
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn unrecognized_types_are_stringified_on_request() {
        let date = chrono::DateTime::parse_from_rfc3339("2021-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&chrono::Utc);
        let obj = object(vec![
            ("when", Dynamic::opaque(date)),
            ("list", vec![Dynamic::Undefined].into()),
        ]);

        let decoded = struct_to_obj(&convert(&obj, false, true).unwrap());

        assert_eq!(decoded.get("when"), Some(Dynamic::from(date.to_string())));
        assert_eq!(
            decoded.get("list"),
            Some(vec![Dynamic::from("undefined")].into())
        );
    }

    #[test]
    fn undefined_in_a_list_is_unsupported() {
        let obj = object(vec![("list", vec![Dynamic::Undefined].into())]);
        assert!(matches!(
            convert(&obj, false, false),
            Err(Error::UnsupportedType(name)) if name == "undefined"
        ));
    }

    #[test]
    fn json_values_survive_the_round_trip() {
        let input = json!({
            "message": "hello",
            "count": 3,
            "ratio": 0.25,
            "ok": false,
            "nothing": null,
            "nested": {"list": [1, "two", {"three": 3}], "empty": {}},
        });
        let original = ObjectRef::from(input.as_object().unwrap().clone());

        let decoded = struct_to_obj(&convert(&original, false, false).unwrap());

        assert_eq!(decoded, original);
        assert_eq!(serde_json::Value::Object(decoded.to_json()), input);
    }

    #[test]
    fn wire_form_parses_back() {
        let s = StructObject::from_json_str(
            r#"{"fields": {"n": {"nullValue": "NULL_VALUE"}, "b": {"blobValue": "aGk="}}}"#,
        )
        .unwrap();
        let decoded = struct_to_obj(&s);
        assert_eq!(decoded.get("n"), Some(Dynamic::Null));
        assert_eq!(decoded.get("b"), Some(Dynamic::Bytes(b"hi".to_vec())));
    }

    #[test]
    fn unknown_kinds_are_rejected() {
        let result = StructObject::from_json_str(r#"{"fields": {"x": {"dateValue": 1}}}"#);
        assert!(matches!(result, Err(Error::Decode(_))));
        let result = StructObject::from_json_value(
            serde_json::json!({"fields": {"x": {"boolValue": true, "stringValue": "y"}}}),
        );
        assert!(matches!(result, Err(Error::Decode(_))));
    }

    #[test]
    fn conversion_keeps_property_order() {
        let obj = object(vec![("zeta", 1.0.into()), ("alpha", 2.0.into()), ("mid", 3.0.into())]);
        let s = obj_to_struct(&obj, ConversionOptions::default()).unwrap();
        assert_eq!(
            s.fields.keys().collect::<Vec<_>>(),
            vec!["zeta", "alpha", "mid"]
        );
        assert_eq!(struct_to_obj(&s).keys(), obj.keys());
    }

    #[test]
    fn insert_keeps_the_position_of_existing_keys() {
        let obj = object(vec![("a", 1.0.into()), ("b", 2.0.into())]);
        assert_eq!(obj.insert("a", 3.0), Some(Dynamic::Number(1.0)));
        assert_eq!(obj.keys(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn display_follows_script_string_conversion() {
        assert_eq!(Dynamic::Number(3.0).to_string(), "3");
        assert_eq!(Dynamic::Number(f64::INFINITY).to_string(), "Infinity");
        assert_eq!(
            Dynamic::Array(vec![1.0.into(), Dynamic::Null, "x".into()]).to_string(),
            "1,,x"
        );
        assert_eq!(Dynamic::Object(ObjectRef::new()).to_string(), "[object Object]");
    }
}
