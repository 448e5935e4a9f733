//! Type descriptors for attributes and method parameters.
//!
//! A [`VMeta`] describes one value: what kind it is, whether it may be
//! written from outside, and the display tags attached to it. A [`MapMeta`]
//! is an ordered record of named `VMeta`s, used for method `takes`/`returns`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::ordered::OrderedMap;
use super::typeid;
use crate::error::{AppResult, DaqError};

/// Numeric storage type of a number or number array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NumberType {
    Int8,
    Int16,
    Int32,
    Int64,
    Uint8,
    Uint16,
    Uint32,
    Uint64,
    Float32,
    Float64,
}

impl NumberType {
    fn is_integer(self) -> bool {
        !matches!(self, NumberType::Float32 | NumberType::Float64)
    }

    fn check(self, value: &Value) -> Option<Value> {
        let n = value.as_number()?;
        if !self.is_integer() {
            return n.as_f64().map(Value::from);
        }
        if let Some(i) = n.as_i64() {
            return Some(Value::from(i));
        }
        if let Some(u) = n.as_u64() {
            return Some(Value::from(u));
        }
        // Integral floats are accepted for integer types.
        let f = n.as_f64()?;
        (f.fract() == 0.0 && f.is_finite()).then(|| Value::from(f as i64))
    }
}

/// What a value is. Serialized as the `typeid` of its meta record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "typeid")]
pub enum MetaKind {
    /// Single number.
    #[serde(rename = "daq:meta/NumberMeta:1.0")]
    Number {
        /// Storage type.
        dtype: NumberType,
    },
    /// Free text.
    #[serde(rename = "daq:meta/StringMeta:1.0")]
    String,
    /// True/false.
    #[serde(rename = "daq:meta/BooleanMeta:1.0")]
    Boolean,
    /// One of a fixed list of strings.
    #[serde(rename = "daq:meta/ChoiceMeta:1.0")]
    Choice {
        /// Allowed values, in display order.
        choices: Vec<String>,
    },
    /// Array of numbers.
    #[serde(rename = "daq:meta/NumberArrayMeta:1.0")]
    NumberArray {
        /// Element storage type.
        dtype: NumberType,
    },
    /// Array of strings.
    #[serde(rename = "daq:meta/StringArrayMeta:1.0")]
    StringArray,
}

/// Descriptor of one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VMeta {
    /// Kind of value.
    #[serde(flatten)]
    pub kind: MetaKind,
    /// One-line description.
    #[serde(default)]
    pub description: String,
    /// Tag strings, see [`crate::tags`].
    #[serde(default)]
    pub tags: Vec<String>,
    /// Whether an external put is currently accepted.
    #[serde(default)]
    pub writeable: bool,
    /// Display label.
    #[serde(default)]
    pub label: String,
}

impl VMeta {
    /// Read-only meta of `kind`.
    pub fn new(kind: MetaKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            tags: Vec::new(),
            writeable: false,
            label: String::new(),
        }
    }

    /// Number meta of the given dtype.
    pub fn number(dtype: NumberType, description: impl Into<String>) -> Self {
        Self::new(MetaKind::Number { dtype }, description)
    }

    /// String meta.
    pub fn string(description: impl Into<String>) -> Self {
        Self::new(MetaKind::String, description)
    }

    /// Boolean meta.
    pub fn boolean(description: impl Into<String>) -> Self {
        Self::new(MetaKind::Boolean, description)
    }

    /// Choice meta over `choices`.
    pub fn choice<S: Into<String>>(
        choices: impl IntoIterator<Item = S>,
        description: impl Into<String>,
    ) -> Self {
        Self::new(
            MetaKind::Choice {
                choices: choices.into_iter().map(Into::into).collect(),
            },
            description,
        )
    }

    /// Builder: set writeable.
    pub fn writeable(mut self, writeable: bool) -> Self {
        self.writeable = writeable;
        self
    }

    /// Builder: append tags.
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Builder: set label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Typeid of an attribute holding a value of this meta.
    pub fn attribute_typeid(&self) -> &'static str {
        match self.kind {
            MetaKind::Number { .. } | MetaKind::String | MetaKind::Boolean => typeid::NT_SCALAR,
            MetaKind::Choice { .. } => typeid::NT_ENUM,
            MetaKind::NumberArray { .. } | MetaKind::StringArray => typeid::NT_SCALAR_ARRAY,
        }
    }

    /// Value a fresh attribute of this meta holds.
    pub fn default_value(&self) -> Value {
        match &self.kind {
            MetaKind::Number { dtype } if dtype.is_integer() => Value::from(0),
            MetaKind::Number { .. } => Value::from(0.0),
            MetaKind::String => Value::from(""),
            MetaKind::Boolean => Value::from(false),
            MetaKind::Choice { choices } => {
                Value::from(choices.first().cloned().unwrap_or_default())
            }
            MetaKind::NumberArray { .. } | MetaKind::StringArray => Value::Array(Vec::new()),
        }
    }

    /// Check `value` against this meta, returning its canonical form.
    /// `null` becomes the default value.
    pub fn validate(&self, value: &Value) -> AppResult<Value> {
        if value.is_null() {
            return Ok(self.default_value());
        }
        let mismatch = || {
            DaqError::TypeMismatch(format!("{value} is not a valid {}", self.kind_name()))
        };
        match &self.kind {
            MetaKind::Number { dtype } => dtype.check(value).ok_or_else(mismatch),
            MetaKind::String => value
                .as_str()
                .map(|s| Value::from(s.to_string()))
                .ok_or_else(mismatch),
            MetaKind::Boolean => value.as_bool().map(Value::from).ok_or_else(mismatch),
            MetaKind::Choice { choices } => match value.as_str() {
                Some(s) if choices.iter().any(|c| c == s) => Ok(Value::from(s)),
                _ => Err(DaqError::TypeMismatch(format!(
                    "{value} is not one of the choices {choices:?}"
                ))),
            },
            MetaKind::NumberArray { dtype } => {
                let items = value.as_array().ok_or_else(mismatch)?;
                items
                    .iter()
                    .map(|v| dtype.check(v).ok_or_else(mismatch))
                    .collect::<AppResult<Vec<_>>>()
                    .map(Value::Array)
            }
            MetaKind::StringArray => {
                let items = value.as_array().ok_or_else(mismatch)?;
                if items.iter().all(Value::is_string) {
                    Ok(value.clone())
                } else {
                    Err(mismatch())
                }
            }
        }
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            MetaKind::Number { .. } => "number",
            MetaKind::String => "string",
            MetaKind::Boolean => "boolean",
            MetaKind::Choice { .. } => "choice",
            MetaKind::NumberArray { .. } => "number array",
            MetaKind::StringArray => "string array",
        }
    }
}

/// Ordered record of named value descriptors.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "typeid", rename = "daq:meta/MapMeta:1.0")]
pub struct MapMeta {
    /// Element descriptors in declaration order.
    #[serde(default)]
    pub elements: OrderedMap<VMeta>,
    /// Names that must be supplied.
    #[serde(default)]
    pub required: Vec<String>,
}

impl MapMeta {
    /// Empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add an element.
    pub fn with_element(mut self, name: impl Into<String>, meta: VMeta, required: bool) -> Self {
        let name = name.into();
        if required && !self.required.contains(&name) {
            self.required.push(name.clone());
        }
        self.elements.insert(name, meta);
        self
    }

    /// Merge `other` into this record. Elements already present keep their
    /// position and take the newer descriptor.
    pub fn merge(&mut self, other: &MapMeta) {
        for (name, meta) in other.elements.iter() {
            self.elements.insert(name, meta.clone());
        }
        for name in &other.required {
            if !self.required.contains(name) {
                self.required.push(name.clone());
            }
        }
    }

    /// Validate a parameter record: unknown keys are rejected, `defaults`
    /// fill gaps, required keys must end up present, every value is checked
    /// against its element meta. Output follows element order.
    pub fn validate(&self, params: &Map<String, Value>, defaults: &Map<String, Value>) -> AppResult<Map<String, Value>> {
        if let Some(unknown) = params.keys().find(|k| !self.elements.contains_key(k)) {
            return Err(DaqError::BadValue(format!(
                "Unknown parameter '{unknown}', expected one of {:?}",
                self.elements.keys().collect::<Vec<_>>()
            )));
        }
        let mut out = Map::new();
        for (name, meta) in self.elements.iter() {
            let supplied = params.get(name).or_else(|| defaults.get(name));
            match supplied {
                Some(v) => {
                    out.insert(name.to_string(), meta.validate(v)?);
                }
                None if self.required.iter().any(|r| r == name) => {
                    return Err(DaqError::BadValue(format!(
                        "Required parameter '{name}' not supplied"
                    )));
                }
                None => {}
            }
        }
        Ok(out)
    }
}
