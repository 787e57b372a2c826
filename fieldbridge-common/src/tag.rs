use serde::{Deserialize, Serialize};

/// Modbus register kinds addressable by a bridge.
///
/// This is the closed set of primary tables a device exposes. All
/// type-dependent behavior (value type, writability, read dispatch) is
/// derived from this enum so that a missing arm is a compile error rather
/// than a silently ignored string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    /// Holding registers (read/write, 16-bit)
    Holding,
    /// Input registers (read-only, 16-bit)
    Input,
    /// Coils (read/write, 1-bit)
    Coil,
    /// Discrete inputs (read-only, 1-bit)
    Discrete,
}

impl RegisterKind {
    /// All register kinds, in the order ranges are registered.
    pub const ALL: [RegisterKind; 4] = [
        RegisterKind::Holding,
        RegisterKind::Input,
        RegisterKind::Coil,
        RegisterKind::Discrete,
    ];

    /// Return the string name for this register kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterKind::Holding => "holding",
            RegisterKind::Input => "input",
            RegisterKind::Coil => "coil",
            RegisterKind::Discrete => "discrete",
        }
    }

    /// Semantic data type of values read from this register kind.
    pub fn data_type(&self) -> TagDataType {
        match self {
            RegisterKind::Holding | RegisterKind::Input => TagDataType::Integer,
            RegisterKind::Coil | RegisterKind::Discrete => TagDataType::Boolean,
        }
    }

    /// Whether single-point writes are supported for this kind.
    pub fn is_writable(&self) -> bool {
        matches!(self, RegisterKind::Holding | RegisterKind::Coil)
    }
}

impl std::fmt::Display for RegisterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Data type descriptor exposed to a supervisory address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagDataType {
    /// 16-bit register values, widened to a signed integer.
    Integer,
    /// Single-bit coil/discrete values.
    Boolean,
}

impl TagDataType {
    /// Descriptor string for mapping onto an external type system.
    pub fn as_str(&self) -> &'static str {
        match self {
            TagDataType::Integer => "Int32",
            TagDataType::Boolean => "Boolean",
        }
    }
}

/// A polled tag value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    /// Register value (holding/input registers).
    Integer(i32),
    /// Bit value (coils/discrete inputs).
    Boolean(bool),
}

impl From<u16> for TagValue {
    fn from(v: u16) -> Self {
        TagValue::Integer(i32::from(v))
    }
}

impl From<i32> for TagValue {
    fn from(v: i32) -> Self {
        TagValue::Integer(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Boolean(v)
    }
}

/// Quality of a cached tag value.
///
/// Every cached value carries the outcome of the most recent poll attempt
/// for its range. Consumers must treat anything other than [`Quality::Good`]
/// as "do not trust the value".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Quality {
    /// Value reflects a fresh, successful read.
    Good,
    /// Coarse invalidation after a connection-level error.
    Bad,
    /// Range was polled while the connection was not online.
    BadNotConnected,
    /// Read failed despite being connected (timeout, exception response).
    BadCommunicationError,
    /// Tag has never been polled.
    BadDataUnavailable,
}

impl Quality {
    pub fn is_good(&self) -> bool {
        matches!(self, Quality::Good)
    }

    /// Return the string name for this quality code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Good => "Good",
            Quality::Bad => "Bad",
            Quality::BadNotConnected => "BadNotConnected",
            Quality::BadCommunicationError => "BadCommunicationError",
            Quality::BadDataUnavailable => "BadDataUnavailable",
        }
    }
}

impl std::fmt::Display for Quality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Value and quality of a single tag, updated together.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TagReading {
    /// Last successfully read value, if any. Cleared on failed polls so
    /// stale data is never served alongside a bad quality.
    pub value: Option<TagValue>,

    /// Outcome of the most recent poll attempt covering this tag.
    pub quality: Quality,
}

impl TagReading {
    /// A fresh, good reading.
    pub fn good(value: impl Into<TagValue>) -> Self {
        Self {
            value: Some(value.into()),
            quality: Quality::Good,
        }
    }

    /// A failed reading with the given quality; drops any previous value.
    pub fn bad(quality: Quality) -> Self {
        Self {
            value: None,
            quality,
        }
    }

    /// Reading for a tag that has never been polled.
    pub fn unavailable() -> Self {
        Self::bad(Quality::BadDataUnavailable)
    }
}
