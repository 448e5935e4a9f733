//! The value tree.
//!
//! A block is an ordered mapping of field name to [`Field`]. Each field is an
//! attribute, a method, or a nested block. Every record serializes to a JSON
//! object whose first key is a `typeid`, which is how consumers tell a value
//! change from a shape change: if a field's `typeid` differs from what it was,
//! the field was retyped.
//!
//! ```text
//! BlockModel ("daq:block/Block:1.0")
//! ├── meta       BlockMeta   ("daq:meta/BlockMeta:1.0")
//! ├── state      Attribute   ("daq:nt/NTEnum:1.0")
//! ├── exposure   Attribute   ("daq:nt/NTScalar:1.0")
//! ├── configure  Method      ("daq:meta/Method:1.0")
//! └── stage      Block       (nested)
//! ```

mod block;
mod meta;
mod ordered;

pub use block::{AttributeModel, BlockMeta, BlockModel, Field, MethodModel};
pub use meta::{MapMeta, MetaKind, NumberType, VMeta};
pub use ordered::OrderedMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Type identifiers written into serialized records.
pub mod typeid {
    /// A block.
    pub const BLOCK: &str = "daq:block/Block:1.0";
    /// A block's own metadata record.
    pub const BLOCK_META: &str = "daq:meta/BlockMeta:1.0";
    /// A method.
    pub const METHOD: &str = "daq:meta/Method:1.0";
    /// Attribute holding a scalar.
    pub const NT_SCALAR: &str = "daq:nt/NTScalar:1.0";
    /// Attribute holding an array.
    pub const NT_SCALAR_ARRAY: &str = "daq:nt/NTScalarArray:1.0";
    /// Attribute holding a choice.
    pub const NT_ENUM: &str = "daq:nt/NTEnum:1.0";

    /// Records that are never the target of an external put.
    pub fn is_unputtable(typeid: &str) -> bool {
        typeid == METHOD || typeid == BLOCK_META
    }

    /// Attribute typeids.
    pub fn is_attribute(typeid: &str) -> bool {
        matches!(typeid, NT_SCALAR | NT_SCALAR_ARRAY | NT_ENUM)
    }
}

/// Alarm severity of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AlarmSeverity {
    /// Healthy.
    #[default]
    NoAlarm,
    /// Minor problem.
    Minor,
    /// Major problem.
    Major,
    /// Value cannot be trusted, e.g. hardware disconnected.
    Invalid,
}

/// Alarm attached to an attribute value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Alarm {
    /// Severity.
    pub severity: AlarmSeverity,
    /// Description of the problem.
    #[serde(default)]
    pub message: String,
}

impl Alarm {
    /// No alarm.
    pub fn ok() -> Self {
        Self::default()
    }

    /// Major alarm with a message.
    pub fn major(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Major,
            message: message.into(),
        }
    }

    /// Invalid alarm, used when the source of a value is disconnected.
    pub fn disconnected(message: impl Into<String>) -> Self {
        Self {
            severity: AlarmSeverity::Invalid,
            message: message.into(),
        }
    }
}

/// Time a value was last set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeStamp {
    /// Whole seconds since the Unix epoch.
    pub seconds_past_epoch: i64,
    /// Nanoseconds within the second.
    pub nanoseconds: u32,
    /// Free-form tag.
    pub user_tag: i32,
}

impl TimeStamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let now = Utc::now();
        Self {
            seconds_past_epoch: now.timestamp(),
            nanoseconds: now.timestamp_subsec_nanos(),
            user_tag: 0,
        }
    }
}
