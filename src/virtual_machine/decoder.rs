//! Instruction decoding.
//!
//! An instruction is a 2-byte little-endian opcode followed by its arguments,
//! each a one-byte data type tag and a payload (see
//! [`data_type`](super::data_type)). The registry tells the decoder how many
//! arguments to read; a variadic slot reads arguments until an end marker,
//! which is kept as the slot's last argument.
//!
//! Decoding is a pure function of memory and registry: it never mutates
//! anything, so a decode failure leaves the engine untouched.

use crate::virtual_machine::data_type::DataType;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::{OPCODE_LEN, OpcodeId, undo_negation};
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::registry::{OpcodeDefinition, OpcodeRegistry, ParamKind};
use std::fmt;

/// One encoded argument: tag plus raw payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Argument {
    pub data_type: DataType,
    pub payload: Vec<u8>,
}

/// Literal meaning of an argument, before variables are resolved.
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    End,
    Int(i32),
    Float(f32),
    Str(String),
    /// Absolute address of a global variable.
    Global(u16),
    /// Index into the running thread's local slots.
    Local(u16),
}

impl Operand {
    pub fn as_int(&self) -> Option<i32> {
        match self {
            Operand::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::End => write!(f, "end"),
            Operand::Int(v) => write!(f, "{}", v),
            Operand::Float(v) => write!(f, "{:.3}", v),
            Operand::Str(s) => write!(f, "{:?}", s),
            Operand::Global(a) => write!(f, "${}", a),
            Operand::Local(i) => write!(f, "{}@", i),
        }
    }
}

fn until_nul(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

impl Argument {
    /// Tag byte plus payload.
    pub fn byte_length(&self) -> usize {
        1 + self.payload.len()
    }

    pub fn operand(&self) -> Operand {
        let p = &self.payload;
        match self.data_type {
            DataType::End => Operand::End,
            DataType::Int8 => Operand::Int(p[0] as i8 as i32),
            DataType::Int16 => Operand::Int(i16::from_le_bytes([p[0], p[1]]) as i32),
            DataType::Int32 => Operand::Int(i32::from_le_bytes([p[0], p[1], p[2], p[3]])),
            DataType::Float32 => Operand::Float(f32::from_le_bytes([p[0], p[1], p[2], p[3]])),
            DataType::GlobalVar => Operand::Global(u16::from_le_bytes([p[0], p[1]])),
            DataType::LocalVar => Operand::Local(u16::from_le_bytes([p[0], p[1]])),
            DataType::String8 => Operand::Str(until_nul(p)),
            DataType::VarString => Operand::Str(until_nul(&p[1..])),
            DataType::InlineString(tag) => {
                let mut bytes = Vec::with_capacity(1 + p.len());
                bytes.push(tag);
                bytes.extend_from_slice(p);
                Operand::Str(until_nul(&bytes))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Instruction {
    pub address: usize,
    pub opcode: OpcodeId,
    pub args: Vec<Argument>,
    /// Opcode plus every argument's tag and payload.
    pub byte_length: usize,
}

impl Instruction {
    /// Address of the instruction that follows this one.
    pub fn next_address(&self) -> usize {
        self.address + self.byte_length
    }
}

/// An instruction together with the negation flag it was encoded with.
#[derive(Clone, Debug, PartialEq)]
pub struct Decoded {
    pub instruction: Instruction,
    pub negated: bool,
}

impl Decoded {
    /// Renders `opcode: [not ]symbol args...`.
    pub fn render(&self, definition: &OpcodeDefinition) -> String {
        let mut out = format!("{}: ", definition.canonical_name());
        if self.negated {
            out.push_str("not ");
        }
        out.push_str(&definition.symbol);
        for arg in &self.instruction.args {
            if arg.data_type != DataType::End {
                out.push(' ');
                out.push_str(&arg.operand().to_string());
            }
        }
        out
    }
}

pub struct Decoder<'a> {
    memory: &'a Memory,
    registry: &'a OpcodeRegistry,
}

impl<'a> Decoder<'a> {
    pub fn new(memory: &'a Memory, registry: &'a OpcodeRegistry) -> Self {
        Self { memory, registry }
    }

    pub fn decode_at(&self, address: usize) -> Result<Decoded, VMError> {
        let raw = u16::from_le_bytes(self.memory.read_array::<OPCODE_LEN>(address)?);
        let (definition, negated) = self
            .registry
            .lookup(raw)
            .ok_or(VMError::UnknownOpcode {
                opcode: undo_negation(raw).0,
                address,
            })?;

        let mut cursor = address + OPCODE_LEN;
        let mut args = Vec::with_capacity(definition.params.len());
        for param in &definition.params {
            match param.kind {
                ParamKind::Single(_) => {
                    let arg = self.decode_argument(cursor, false)?;
                    cursor += arg.byte_length();
                    args.push(arg);
                }
                ParamKind::Variadic(_) => loop {
                    let arg = self.decode_argument(cursor, true)?;
                    cursor += arg.byte_length();
                    let end = arg.data_type == DataType::End;
                    args.push(arg);
                    if end {
                        break;
                    }
                },
            }
        }

        Ok(Decoded {
            instruction: Instruction {
                address,
                opcode: definition.opcode,
                args,
                byte_length: cursor - address,
            },
            negated,
        })
    }

    fn decode_argument(&self, address: usize, allow_end: bool) -> Result<Argument, VMError> {
        let tag = self.memory.read_u8(address)?;
        let data_type = DataType::from_tag(tag, address)?;
        if data_type == DataType::End && !allow_end {
            return Err(VMError::UnknownDataType { tag, address });
        }
        let width = match data_type.payload_width() {
            Some(width) => width,
            // length byte plus that many characters
            None => 1 + self.memory.read_u8(address + 1)? as usize,
        };
        Ok(Argument {
            data_type,
            payload: self.memory.read(address + 1, width)?.to_vec(),
        })
    }
}
