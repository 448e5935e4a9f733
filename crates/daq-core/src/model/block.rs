use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use super::meta::{MapMeta, VMeta};
use super::ordered::OrderedMap;
use super::{typeid, Alarm, TimeStamp};
use crate::error::{AppResult, DaqError};
use crate::tags;

// =============================================================================
// Attribute
// =============================================================================

/// A typed value with metadata, alarm and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeModel {
    /// Current value, always valid for `meta`.
    pub value: Value,
    /// Alarm state.
    pub alarm: Alarm,
    /// When `value` was last set.
    pub time_stamp: TimeStamp,
    /// Descriptor.
    pub meta: VMeta,
}

#[derive(Serialize)]
struct AttributeRef<'a> {
    typeid: &'static str,
    value: &'a Value,
    alarm: &'a Alarm,
    #[serde(rename = "timeStamp")]
    time_stamp: &'a TimeStamp,
    meta: &'a VMeta,
}

#[derive(Deserialize)]
struct AttributeRepr {
    typeid: String,
    value: Value,
    #[serde(default)]
    alarm: Alarm,
    #[serde(rename = "timeStamp", default)]
    time_stamp: TimeStamp,
    meta: VMeta,
}

impl AttributeModel {
    /// Attribute holding the default value of `meta`.
    pub fn new(meta: VMeta) -> Self {
        Self {
            value: meta.default_value(),
            alarm: Alarm::ok(),
            time_stamp: TimeStamp::now(),
            meta,
        }
    }

    /// Builder: initial value, validated against the meta.
    pub fn with_value(mut self, value: Value) -> AppResult<Self> {
        self.value = self.meta.validate(&value)?;
        Ok(self)
    }

    /// Validate and store a new value, stamping the time.
    pub fn set_value(&mut self, value: &Value) -> AppResult<()> {
        self.value = self.meta.validate(value)?;
        self.time_stamp = TimeStamp::now();
        Ok(())
    }

    /// Typeid derived from the meta kind.
    pub fn typeid(&self) -> &'static str {
        self.meta.attribute_typeid()
    }
}

impl Serialize for AttributeModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AttributeRef {
            typeid: self.typeid(),
            value: &self.value,
            alarm: &self.alarm,
            time_stamp: &self.time_stamp,
            meta: &self.meta,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for AttributeModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let repr = AttributeRepr::deserialize(deserializer)?;
        let expected = repr.meta.attribute_typeid();
        if repr.typeid != expected {
            return Err(D::Error::custom(format!(
                "attribute typeid {} does not match meta ({expected})",
                repr.typeid
            )));
        }
        Ok(Self {
            value: repr.value,
            alarm: repr.alarm,
            time_stamp: repr.time_stamp,
            meta: repr.meta,
        })
    }
}

// =============================================================================
// Method
// =============================================================================

/// An invocable operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid", rename = "daq:meta/Method:1.0")]
pub struct MethodModel {
    /// Parameter schema.
    #[serde(default)]
    pub takes: MapMeta,
    /// Values used for parameters the caller leaves out.
    #[serde(default)]
    pub defaults: Map<String, Value>,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Tag strings.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the method can currently be invoked.
    #[serde(default)]
    pub writeable: bool,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Return schema.
    #[serde(default)]
    pub returns: MapMeta,
}

impl MethodModel {
    /// Writeable method with no parameters and no return.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            takes: MapMeta::new(),
            defaults: Map::new(),
            description: description.into(),
            tags: Vec::new(),
            writeable: true,
            label: String::new(),
            returns: MapMeta::new(),
        }
    }

    /// Builder: parameter schema.
    pub fn with_takes(mut self, takes: MapMeta) -> Self {
        self.takes = takes;
        self
    }

    /// Builder: defaults.
    pub fn with_defaults(mut self, defaults: Map<String, Value>) -> Self {
        self.defaults = defaults;
        self
    }

    /// Builder: return schema.
    pub fn with_returns(mut self, returns: MapMeta) -> Self {
        self.returns = returns;
        self
    }

    /// Builder: append tags.
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// True if the single return value travels bare.
    pub fn is_return_unpacked(&self) -> bool {
        tags::is_method_return_unpacked(&self.tags)
    }

    /// Validate call parameters against `takes` and `defaults`.
    pub fn validate_params(&self, params: &Map<String, Value>) -> AppResult<Map<String, Value>> {
        self.takes.validate(params, &self.defaults)
    }
}

// =============================================================================
// Block
// =============================================================================

/// A block's own metadata record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid", rename = "daq:meta/BlockMeta:1.0")]
pub struct BlockMeta {
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Tag strings.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether the block accepts writes at all.
    #[serde(default)]
    pub writeable: bool,
    /// Display label.
    #[serde(default)]
    pub label: String,
    /// Field names in block order.
    #[serde(default)]
    pub fields: Vec<String>,
}

/// One entry in a block.
#[derive(Debug, Clone, PartialEq)]
pub enum Field {
    /// Typed value.
    Attribute(AttributeModel),
    /// Invocable operation.
    Method(MethodModel),
    /// Nested block.
    Block(Box<BlockModel>),
}

impl Field {
    /// Serialized typeid.
    pub fn typeid(&self) -> &'static str {
        match self {
            Field::Attribute(a) => a.typeid(),
            Field::Method(_) => typeid::METHOD,
            Field::Block(_) => typeid::BLOCK,
        }
    }

    /// True for methods.
    pub fn is_method(&self) -> bool {
        matches!(self, Field::Method(_))
    }

    /// True for attributes.
    pub fn is_attribute(&self) -> bool {
        matches!(self, Field::Attribute(_))
    }

    /// True for nested blocks.
    pub fn is_block(&self) -> bool {
        matches!(self, Field::Block(_))
    }

    /// Attribute view.
    pub fn as_attribute(&self) -> Option<&AttributeModel> {
        match self {
            Field::Attribute(a) => Some(a),
            _ => None,
        }
    }

    /// Mutable attribute view.
    pub fn as_attribute_mut(&mut self) -> Option<&mut AttributeModel> {
        match self {
            Field::Attribute(a) => Some(a),
            _ => None,
        }
    }

    /// Method view.
    pub fn as_method(&self) -> Option<&MethodModel> {
        match self {
            Field::Method(m) => Some(m),
            _ => None,
        }
    }

    /// Mutable method view.
    pub fn as_method_mut(&mut self) -> Option<&mut MethodModel> {
        match self {
            Field::Method(m) => Some(m),
            _ => None,
        }
    }

    /// Whether an external write or call is currently accepted.
    pub fn is_writeable(&self) -> bool {
        match self {
            Field::Attribute(a) => a.meta.writeable,
            Field::Method(m) => m.writeable,
            Field::Block(b) => b.meta.writeable,
        }
    }

    /// Serialized form.
    pub fn to_value(&self) -> AppResult<Value> {
        Ok(match self {
            Field::Attribute(a) => serde_json::to_value(a)?,
            Field::Method(m) => serde_json::to_value(m)?,
            Field::Block(b) => b.to_value()?,
        })
    }

    /// Parse a serialized field, dispatching on its typeid.
    pub fn from_value(value: &Value) -> AppResult<Self> {
        let id = value
            .get("typeid")
            .and_then(Value::as_str)
            .ok_or_else(|| DaqError::TypeMismatch(format!("field has no typeid: {value}")))?;
        match id {
            typeid::METHOD => Ok(Field::Method(serde_json::from_value(value.clone())?)),
            typeid::BLOCK => Ok(Field::Block(Box::new(BlockModel::from_value(value)?))),
            id if typeid::is_attribute(id) => {
                Ok(Field::Attribute(serde_json::from_value(value.clone())?))
            }
            other => Err(DaqError::TypeMismatch(format!("unknown field typeid {other}"))),
        }
    }
}

/// Ordered mapping of field name to [`Field`], plus the block's own meta.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockModel {
    /// Own metadata. `meta.fields` always lists the field names in order.
    pub meta: BlockMeta,
    fields: OrderedMap<Field>,
}

const RESERVED: [&str; 2] = ["meta", "typeid"];

impl BlockModel {
    /// Empty, writeable block.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            meta: BlockMeta {
                description: description.into(),
                tags: Vec::new(),
                writeable: true,
                label: String::new(),
                fields: Vec::new(),
            },
            fields: OrderedMap::new(),
        }
    }

    /// Append a new field.
    pub fn add_field(&mut self, name: impl Into<String>, field: Field) -> AppResult<()> {
        let name = name.into();
        if RESERVED.contains(&name.as_str()) {
            return Err(DaqError::BadValue(format!("'{name}' is a reserved field name")));
        }
        if self.fields.contains_key(&name) {
            return Err(DaqError::BadValue(format!("Field '{name}' already exists")));
        }
        self.meta.fields.push(name.clone());
        self.fields.insert(name, field);
        Ok(())
    }

    /// Replace an existing field in place, returning the old one.
    pub fn replace_field(&mut self, name: &str, field: Field) -> AppResult<Field> {
        let slot = self
            .fields
            .get_mut(name)
            .ok_or_else(|| DaqError::NoSuchPath(name.to_string()))?;
        Ok(std::mem::replace(slot, field))
    }

    /// Remove a field.
    pub fn remove_field(&mut self, name: &str) -> Option<Field> {
        let removed = self.fields.remove(name)?;
        self.meta.fields.retain(|f| f != name);
        Some(removed)
    }

    /// Field by name.
    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.get(name)
    }

    /// Mutable field by name.
    pub fn field_mut(&mut self, name: &str) -> Option<&mut Field> {
        self.fields.get_mut(name)
    }

    /// Fields in order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Field)> {
        self.fields.iter()
    }

    /// Attribute by name.
    pub fn attribute(&self, name: &str) -> Option<&AttributeModel> {
        self.field(name).and_then(Field::as_attribute)
    }

    /// Method by name.
    pub fn method(&self, name: &str) -> Option<&MethodModel> {
        self.field(name).and_then(Field::as_method)
    }

    /// Walk `path` through nested blocks to a field.
    pub fn resolve(&self, path: &[String]) -> Option<&Field> {
        let (first, rest) = path.split_first()?;
        let field = self.field(first)?;
        match (rest.is_empty(), field) {
            (true, f) => Some(f),
            (false, Field::Block(sub)) => sub.resolve(rest),
            _ => None,
        }
    }

    /// Mutable [`BlockModel::resolve`].
    pub fn resolve_mut(&mut self, path: &[String]) -> Option<&mut Field> {
        let (first, rest) = path.split_first()?;
        let field = self.field_mut(first)?;
        if rest.is_empty() {
            return Some(field);
        }
        match field {
            Field::Block(sub) => sub.resolve_mut(rest),
            _ => None,
        }
    }

    /// Serialize to the ordered nested mapping form.
    pub fn to_value(&self) -> AppResult<Value> {
        let mut map = Map::new();
        map.insert("typeid".into(), Value::from(typeid::BLOCK));
        map.insert("meta".into(), serde_json::to_value(&self.meta)?);
        for (name, field) in self.fields.iter() {
            map.insert(name.to_string(), field.to_value()?);
        }
        Ok(Value::Object(map))
    }

    /// Rebuild a block from its serialized form.
    pub fn from_value(value: &Value) -> AppResult<Self> {
        let map = value
            .as_object()
            .ok_or_else(|| DaqError::TypeMismatch("block must be a mapping".into()))?;
        match map.get("typeid").and_then(Value::as_str) {
            Some(typeid::BLOCK) => {}
            other => {
                return Err(DaqError::TypeMismatch(format!(
                    "expected block typeid, found {other:?}"
                )))
            }
        }
        let meta_value = map
            .get("meta")
            .ok_or_else(|| DaqError::TypeMismatch("block has no meta".into()))?;
        let mut block = BlockModel {
            meta: serde_json::from_value(meta_value.clone())?,
            fields: OrderedMap::new(),
        };
        block.meta.fields.clear();
        for (name, v) in map {
            if RESERVED.contains(&name.as_str()) {
                continue;
            }
            block.add_field(name.clone(), Field::from_value(v)?)?;
        }
        Ok(block)
    }
}

impl Serialize for BlockModel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for BlockModel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        BlockModel::from_value(&value).map_err(D::Error::custom)
    }
}
