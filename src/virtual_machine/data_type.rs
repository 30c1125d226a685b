//! Argument data types, native values and type constraints.
//!
//! Every encoded argument starts with a one-byte tag followed by a payload
//! whose width is determined by the tag:
//!
//! | Tag | Type | Payload |
//! |-----|------|---------|
//! | `0x00` | end of variable arguments | 0 |
//! | `0x01` | int32 | 4 |
//! | `0x02` | global variable pointer | 2 |
//! | `0x03` | local variable pointer | 2 |
//! | `0x04` | int8 | 1 |
//! | `0x05` | int16 | 2 |
//! | `0x06` | float32 | 4 |
//! | `0x09` | 8-byte string | 8 |
//! | `0x0E` | length-prefixed string | 1 + length |
//! | `> 0x1F` | inline string (tag is the first character) | 7 |
//!
//! Tags in the gaps are rejected with [`VMError::UnknownDataType`].

use crate::virtual_machine::errors::VMError;
use std::fmt;

/// Largest tag value that denotes a typed argument.
pub const DATA_TYPE_MAX: u8 = 31;

/// Width of an inline string payload (the tag byte is the eighth character).
pub const INLINE_STRING_PAYLOAD: usize = 7;

/// Storage width of a typed allocation.
pub const ALLOCATION_SIZE: usize = 4;

/// Decoded argument tag.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DataType {
    /// Terminates a variable argument list.
    End,
    /// Signed 32-bit integer.
    Int32,
    /// Absolute byte address of a global variable.
    GlobalVar,
    /// Index into the running thread's local slots.
    LocalVar,
    /// Signed 8-bit integer.
    Int8,
    /// Signed 16-bit integer.
    Int16,
    /// IEEE 754 single-precision float.
    Float32,
    /// Fixed 8-byte, NUL-padded string.
    String8,
    /// String prefixed with its one-byte length.
    VarString,
    /// Type-less string whose tag byte is its first character.
    InlineString(u8),
}

impl DataType {
    /// Classifies a raw tag byte read at `address`.
    pub fn from_tag(tag: u8, address: usize) -> Result<Self, VMError> {
        Ok(match tag {
            0x00 => DataType::End,
            0x01 => DataType::Int32,
            0x02 => DataType::GlobalVar,
            0x03 => DataType::LocalVar,
            0x04 => DataType::Int8,
            0x05 => DataType::Int16,
            0x06 => DataType::Float32,
            0x09 => DataType::String8,
            0x0E => DataType::VarString,
            t if t > DATA_TYPE_MAX => DataType::InlineString(t),
            _ => return Err(VMError::UnknownDataType { tag, address }),
        })
    }

    /// Returns the raw tag byte.
    pub const fn tag(&self) -> u8 {
        match self {
            DataType::End => 0x00,
            DataType::Int32 => 0x01,
            DataType::GlobalVar => 0x02,
            DataType::LocalVar => 0x03,
            DataType::Int8 => 0x04,
            DataType::Int16 => 0x05,
            DataType::Float32 => 0x06,
            DataType::String8 => 0x09,
            DataType::VarString => 0x0E,
            DataType::InlineString(t) => *t,
        }
    }

    /// Returns the fixed payload width, or `None` for length-prefixed strings.
    pub const fn payload_width(&self) -> Option<usize> {
        match self {
            DataType::End => Some(0),
            DataType::Int8 => Some(1),
            DataType::GlobalVar | DataType::LocalVar | DataType::Int16 => Some(2),
            DataType::Int32 | DataType::Float32 => Some(4),
            DataType::String8 => Some(8),
            DataType::InlineString(_) => Some(INLINE_STRING_PAYLOAD),
            DataType::VarString => None,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            DataType::End => "end",
            DataType::Int32 => "int32",
            DataType::GlobalVar => "global_var",
            DataType::LocalVar => "local_var",
            DataType::Int8 => "int8",
            DataType::Int16 => "int16",
            DataType::Float32 => "float32",
            DataType::String8 => "string",
            DataType::VarString => "vstring",
            DataType::InlineString(_) => "inline_string",
        }
    }

    pub const fn is_int(&self) -> bool {
        matches!(self, DataType::Int8 | DataType::Int16 | DataType::Int32)
    }

    pub const fn is_float(&self) -> bool {
        matches!(self, DataType::Float32)
    }

    pub const fn is_var(&self) -> bool {
        matches!(self, DataType::GlobalVar | DataType::LocalVar)
    }

    pub const fn is_string(&self) -> bool {
        matches!(
            self,
            DataType::String8 | DataType::VarString | DataType::InlineString(_)
        )
    }
}

/// A resolved native argument or variable value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    /// Integer of any encoded width, widened to 32 bits.
    Int(i32),
    /// Single-precision float.
    Float(f32),
    /// Decoded string without padding.
    Str(String),
}

impl Value {
    pub const fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
        }
    }

    /// Encodes the value the way a typed allocation stores it.
    ///
    /// Returns `None` for strings, which cannot be allocated.
    pub fn to_storage(&self) -> Option<(DataType, [u8; ALLOCATION_SIZE])> {
        match self {
            Value::Int(v) => Some((DataType::Int32, v.to_le_bytes())),
            Value::Float(v) => Some((DataType::Float32, v.to_le_bytes())),
            Value::Str(_) => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:.3}", v),
            Value::Str(s) => write!(f, "{:?}", s),
        }
    }
}

/// Declared constraint on one argument slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TypeConstraint {
    /// Accepts every data type.
    Any,
    /// int8, int16 or int32.
    Int,
    /// float32.
    Float,
    /// Any integer or float immediate.
    IntOrFloat,
    /// A global or local variable pointer.
    Var,
    /// An integer immediate or a variable pointer.
    IntOrVar,
    /// A float immediate or a variable pointer.
    FloatOrVar,
    /// 8-byte, length-prefixed or inline string.
    String,
    /// Exactly this data type.
    Exact(DataType),
}

impl TypeConstraint {
    /// Whether an argument tagged `data_type` satisfies this constraint.
    pub fn accepts(&self, data_type: DataType) -> bool {
        match self {
            TypeConstraint::Any => true,
            TypeConstraint::Int => data_type.is_int(),
            TypeConstraint::Float => data_type.is_float(),
            TypeConstraint::IntOrFloat => data_type.is_int() || data_type.is_float(),
            TypeConstraint::Var => data_type.is_var(),
            TypeConstraint::IntOrVar => data_type.is_int() || data_type.is_var(),
            TypeConstraint::FloatOrVar => data_type.is_float() || data_type.is_var(),
            TypeConstraint::String => data_type.is_string(),
            TypeConstraint::Exact(expected) => *expected == data_type,
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            TypeConstraint::Any => "any",
            TypeConstraint::Int => "int",
            TypeConstraint::Float => "float",
            TypeConstraint::IntOrFloat => "int_or_float",
            TypeConstraint::Var => "var",
            TypeConstraint::IntOrVar => "int_or_var",
            TypeConstraint::FloatOrVar => "float_or_var",
            TypeConstraint::String => "string",
            TypeConstraint::Exact(data_type) => data_type.name(),
        }
    }
}
