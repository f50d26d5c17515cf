use ferrite_support::error::{Error, Result};

/// Maximum element/byte count for raw and array values.
pub const MAX_SEQUENCE_LEN: usize = 254;

/// Wire tag byte identifying a `Value`'s variant. Values are not named in
/// the wire frame kinds (those are message kinds); this tag only appears
/// inline in a value's own encoding.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum ValueType {
    Empty = 0,
    Raw = 1,
    Bool = 2,
    I32 = 3,
    I64 = 4,
    F32 = 5,
    F64 = 6,
    I32Array = 7,
    I64Array = 8,
    F32Array = 9,
    F64Array = 10,
}

impl ValueType {
    pub fn from_tag(tag: u8) -> Option<ValueType> {
        Some(match tag {
            0 => ValueType::Empty,
            1 => ValueType::Raw,
            2 => ValueType::Bool,
            3 => ValueType::I32,
            4 => ValueType::I64,
            5 => ValueType::F32,
            6 => ValueType::F64,
            7 => ValueType::I32Array,
            8 => ValueType::I64Array,
            9 => ValueType::F32Array,
            10 => ValueType::F64Array,
            _ => return None,
        })
    }
}

/// A tagged union over the value kinds. Immutable once
/// constructed; `Storage::set_value` replaces the whole slot rather than
/// mutating in place.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Empty,
    Raw(Vec<u8>),
    Bool(bool),
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    I32Array(Vec<i32>),
    I64Array(Vec<i64>),
    F32Array(Vec<f32>),
    F64Array(Vec<f64>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Empty => ValueType::Empty,
            Value::Raw(_) => ValueType::Raw,
            Value::Bool(_) => ValueType::Bool,
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::I32Array(_) => ValueType::I32Array,
            Value::I64Array(_) => ValueType::I64Array,
            Value::F32Array(_) => ValueType::F32Array,
            Value::F64Array(_) => ValueType::F64Array,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Value::Empty)
    }

    /// Enforces the "raw or array size must fit in 8 bits" rule.
    pub fn check_len(&self) -> Result<()> {
        let len = match self {
            Value::Raw(v) => v.len(),
            Value::I32Array(v) => v.len(),
            Value::I64Array(v) => v.len(),
            Value::F32Array(v) => v.len(),
            Value::F64Array(v) => v.len(),
            _ => return Ok(()),
        };
        if len > MAX_SEQUENCE_LEN {
            return Err(Error::DataTooLarge);
        }
        Ok(())
    }
}
