//! Static class metadata consulted by the sync engine.
//!
//! Every attribute carries an explicit [`SyncMode`] and a [`ValueKind`]
//! normalization rule, both fixed when the class is declared:
//!
//! ```
//! use tether_core::mirror::{Attribute, MirrorClass, SyncMode, ValueKind};
//!
//! static SLIDER: MirrorClass = MirrorClass {
//!     name: "Slider",
//!     module: "app.widgets",
//!     base: None,
//!     attributes: &[
//!         Attribute::new("value", SyncMode::BothSides, ValueKind::Float),
//!         Attribute::new("step", SyncMode::Synced, ValueKind::Int { min: Some(1), max: None }),
//!         Attribute::new("scratch", SyncMode::Local, ValueKind::Any),
//!     ],
//!     css: "",
//! };
//!
//! assert_eq!(SLIDER.attribute("value").map(|a| a.sync), Some(SyncMode::BothSides));
//! ```

use serde::Serialize;
use serde_json::{Number, Value};

/// How an attribute participates in synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Never leaves the side it was set on
    Local,
    /// Host-originated changes propagate to the remote; remote-originated
    /// changes are applied but not echoed back
    Synced,
    /// Settable and validated on either side; the host's normalized value is
    /// authoritative and is always sent back after a change
    BothSides,
}

impl SyncMode {
    /// Whether mutations may cross the boundary at all.
    pub fn is_syncable(self) -> bool {
        !matches!(self, Self::Local)
    }
}

/// Normalization rule for attribute values.
#[derive(Debug, Clone, Copy)]
pub enum ValueKind {
    /// Any JSON value, unchanged
    Any,
    /// Truthiness of the value
    Bool,
    /// Integer; floats truncate toward zero; clamped to the optional range
    Int {
        /// Inclusive lower bound
        min: Option<i64>,
        /// Inclusive upper bound
        max: Option<i64>,
    },
    /// Finite float
    Float,
    /// String; `null` becomes empty
    Str,
    /// List of strings; a bare string becomes a one-item list
    StrList,
    /// Mirror id or `null`
    Ref,
    /// List of mirror ids
    RefList,
    /// Caller-supplied rule
    Custom(fn(Value) -> Result<Value, String>),
}

impl ValueKind {
    /// Normalize `value`, or explain why it is rejected.
    pub fn normalize(&self, value: Value) -> Result<Value, String> {
        match self {
            Self::Any => Ok(value),
            Self::Bool => Ok(Value::Bool(truthy(&value))),
            Self::Int { min, max } => {
                let n = match &value {
                    Value::Bool(b) => i64::from(*b),
                    Value::Number(n) => match n.as_i64() {
                        Some(i) => i,
                        None => match n.as_f64() {
                            Some(f) if f.is_finite() => f.trunc() as i64,
                            _ => return Err(format!("{n} is not a representable integer")),
                        },
                    },
                    other => return Err(format!("expected an integer, got {other}")),
                };
                let n = min.map_or(n, |lo| n.max(lo));
                let n = max.map_or(n, |hi| n.min(hi));
                Ok(Value::from(n))
            },
            Self::Float => {
                let f = match &value {
                    Value::Bool(b) => f64::from(u8::from(*b)),
                    Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
                    other => return Err(format!("expected a number, got {other}")),
                };
                Number::from_f64(f).map(Value::Number).ok_or_else(|| "not a finite number".to_string())
            },
            Self::Str => match value {
                Value::String(_) => Ok(value),
                Value::Null => Ok(Value::String(String::new())),
                other => Err(format!("expected a string, got {other}")),
            },
            Self::StrList | Self::RefList => match value {
                Value::String(s) if matches!(self, Self::StrList) => Ok(Value::Array(vec![Value::String(s)])),
                Value::Array(items) if items.iter().all(Value::is_string) => Ok(Value::Array(items)),
                other => Err(format!("expected a list of strings, got {other}")),
            },
            Self::Ref => match value {
                Value::String(_) | Value::Null => Ok(value),
                other => Err(format!("expected a mirror id or null, got {other}")),
            },
            Self::Custom(rule) => rule(value),
        }
    }

    /// Value an attribute of this kind starts with when no default is given.
    pub fn default_value(&self) -> Value {
        match self {
            Self::Any | Self::Ref | Self::Custom(_) => Value::Null,
            Self::Bool => Value::Bool(false),
            Self::Int { min, max } => {
                let n = min.map_or(0, |lo| lo.max(0));
                Value::from(max.map_or(n, |hi| n.min(hi)))
            },
            Self::Float => Value::from(0.0),
            Self::Str => Value::String(String::new()),
            Self::StrList | Self::RefList => Value::Array(Vec::new()),
        }
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// One declared attribute.
#[derive(Debug, Clone, Copy)]
pub struct Attribute {
    /// Attribute name
    pub name: &'static str,
    /// Sync classification
    pub sync: SyncMode,
    /// Normalization rule
    pub kind: ValueKind,
    /// Initial value; `None` uses [`ValueKind::default_value`]
    pub default: Option<fn() -> Value>,
}

impl Attribute {
    /// Attribute with the kind's default value.
    pub const fn new(name: &'static str, sync: SyncMode, kind: ValueKind) -> Self {
        Self { name, sync, kind, default: None }
    }

    /// Replace the initial value.
    pub const fn with_default(mut self, default: fn() -> Value) -> Self {
        self.default = Some(default);
        self
    }

    /// Initial value, already normalized. A default the rule rejects falls
    /// back to the kind's default.
    pub fn initial_value(&self) -> Value {
        match self.default {
            Some(make) => self.kind.normalize(make()).unwrap_or_else(|_| self.kind.default_value()),
            None => self.kind.default_value(),
        }
    }
}

/// Name of the attribute holding a mirror's parent id.
pub const PARENT_ATTRIBUTE: &str = "parent";

/// Name of the attribute holding a mirror's child ids.
pub const CHILDREN_ATTRIBUTE: &str = "children";

/// Declared class of mirror objects.
///
/// Declared as `static` items; the engine only ever holds `&'static`
/// references, so identity is pointer identity.
#[derive(Debug)]
pub struct MirrorClass {
    /// Class name, also the id prefix of its instances
    pub name: &'static str,
    /// Module that defines the class remotely
    pub module: &'static str,
    /// Base class whose attributes are inherited
    pub base: Option<&'static MirrorClass>,
    /// Attributes declared by this class (not including the base's)
    pub attributes: &'static [Attribute],
    /// Style text shipped with the module
    pub css: &'static str,
}

impl MirrorClass {
    /// Find an attribute on this class or its bases.
    pub fn attribute(&'static self, name: &str) -> Option<&'static Attribute> {
        let mut class = Some(self);
        while let Some(current) = class {
            if let Some(attr) = current.attributes.iter().find(|a| a.name == name) {
                return Some(attr);
            }
            class = current.base;
        }
        None
    }

    /// All attributes, base classes first.
    pub fn all_attributes(&'static self) -> Vec<&'static Attribute> {
        let mut chain = vec![self];
        while let Some(base) = chain.last().and_then(|c| c.base) {
            chain.push(base);
        }
        chain.iter().rev().flat_map(|class| class.attributes.iter()).collect()
    }

    /// `module.Class`, unique within a store.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.module, self.name)
    }

    /// Whether `self` is `other` or derives from it.
    pub fn is_subclass_of(&'static self, other: &'static MirrorClass) -> bool {
        let mut class = Some(self);
        while let Some(current) = class {
            if std::ptr::eq(current, other) {
                return true;
            }
            class = current.base;
        }
        false
    }
}
