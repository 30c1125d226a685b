//! Typed argument view passed to opcode handlers.
//!
//! [`OpcodeArgs::resolve`] checks every decoded argument against its declared
//! constraint and turns it into a native [`Value`]. Variable pointers are
//! dereferenced: a global reads four bytes at its address (float if the
//! allocation overlay says so, int otherwise) and a local reads the running
//! thread's slot. The pointer itself is kept so handlers can write back.

use crate::virtual_machine::data_type::{DataType, TypeConstraint, Value};
use crate::virtual_machine::decoder::{Argument, Instruction, Operand};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::OpcodeId;
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::registry::{OpcodeDefinition, ParamKind};
use crate::virtual_machine::vm::ScriptThread;

/// Location a variable argument points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VarRef {
    /// Absolute memory address.
    Global(usize),
    /// Local slot of the running thread.
    Local(usize),
}

#[derive(Clone, Debug, PartialEq)]
pub struct ArgValue {
    pub data_type: DataType,
    pub value: Value,
    pub var: Option<VarRef>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct OpcodeArgs {
    opcode: OpcodeId,
    named: Vec<(String, ArgValue)>,
    var_args: Vec<ArgValue>,
}

impl OpcodeArgs {
    pub fn resolve(
        definition: &OpcodeDefinition,
        instruction: &Instruction,
        memory: &Memory,
        thread: &ScriptThread,
        now: u64,
    ) -> Result<Self, VMError> {
        let mut named = Vec::with_capacity(definition.params.len());
        let mut var_args = Vec::new();
        let mut args = instruction.args.iter().enumerate();

        for param in &definition.params {
            match param.kind {
                ParamKind::Single(constraint) => {
                    let Some((index, arg)) = args.next() else {
                        return Err(VMError::UnknownArgument {
                            opcode: definition.opcode,
                            name: param.name.clone(),
                        });
                    };
                    let value = resolve_argument(
                        definition.opcode,
                        constraint,
                        index,
                        arg,
                        memory,
                        thread,
                        now,
                    )?;
                    named.push((param.name.clone(), value));
                }
                ParamKind::Variadic(constraint) => {
                    for (index, arg) in args.by_ref() {
                        if arg.data_type == DataType::End {
                            break;
                        }
                        var_args.push(resolve_argument(
                            definition.opcode,
                            constraint,
                            index,
                            arg,
                            memory,
                            thread,
                            now,
                        )?);
                    }
                }
            }
        }

        Ok(Self {
            opcode: definition.opcode,
            named,
            var_args,
        })
    }

    pub fn opcode(&self) -> OpcodeId {
        self.opcode
    }

    pub fn get(&self, name: &str) -> Result<&ArgValue, VMError> {
        self.named
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
            .ok_or_else(|| VMError::UnknownArgument {
                opcode: self.opcode,
                name: name.to_string(),
            })
    }

    fn mismatch(&self, name: &str, expected: &'static str, actual: &Value) -> VMError {
        VMError::ArgumentTypeMismatch {
            opcode: self.opcode,
            arg_index: self
                .named
                .iter()
                .position(|(n, _)| n == name)
                .unwrap_or_default(),
            expected,
            actual: actual.type_name(),
        }
    }

    pub fn int(&self, name: &str) -> Result<i32, VMError> {
        match &self.get(name)?.value {
            Value::Int(v) => Ok(*v),
            other => Err(self.mismatch(name, "int", other)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f32, VMError> {
        match &self.get(name)?.value {
            Value::Float(v) => Ok(*v),
            other => Err(self.mismatch(name, "float", other)),
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, VMError> {
        match &self.get(name)?.value {
            Value::Str(s) => Ok(s),
            other => Err(self.mismatch(name, "string", other)),
        }
    }

    /// The variable an argument points at.
    pub fn var(&self, name: &str) -> Result<VarRef, VMError> {
        let arg = self.get(name)?;
        arg.var.ok_or_else(|| self.mismatch(name, "var", &arg.value))
    }

    pub fn data_type(&self, name: &str) -> Result<DataType, VMError> {
        Ok(self.get(name)?.data_type)
    }

    /// Resolved variadic arguments, without the end marker.
    pub fn var_args(&self) -> &[ArgValue] {
        &self.var_args
    }
}

fn resolve_argument(
    opcode: OpcodeId,
    constraint: TypeConstraint,
    index: usize,
    arg: &Argument,
    memory: &Memory,
    thread: &ScriptThread,
    now: u64,
) -> Result<ArgValue, VMError> {
    if !constraint.accepts(arg.data_type) {
        return Err(VMError::ArgumentTypeMismatch {
            opcode,
            arg_index: index,
            expected: constraint.name(),
            actual: arg.data_type.name(),
        });
    }
    let (value, var) = match arg.operand() {
        Operand::Int(v) => (Value::Int(v), None),
        Operand::Float(v) => (Value::Float(v), None),
        Operand::Str(s) => (Value::Str(s), None),
        Operand::Global(address) => {
            let address = address as usize;
            let value = match memory.allocation(address) {
                Some(a) if a.data_type == DataType::Float32 => Value::Float(memory.read_f32(address)?),
                _ => Value::Int(memory.read_i32(address)?),
            };
            (value, Some(VarRef::Global(address)))
        }
        Operand::Local(index) => {
            let index = index as usize;
            (thread.local(index, now)?, Some(VarRef::Local(index)))
        }
        Operand::End => {
            return Err(VMError::ArgumentTypeMismatch {
                opcode,
                arg_index: index,
                expected: constraint.name(),
                actual: DataType::End.name(),
            });
        }
    };
    Ok(ArgValue {
        data_type: arg.data_type,
        value,
        var,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::decoder::Decoder;
    use crate::virtual_machine::registry::OpcodeRegistry;

    fn resolve(bytes: &[u8], memory_setup: impl FnOnce(&mut Memory)) -> Result<OpcodeArgs, VMError> {
        let registry = OpcodeRegistry::builtin().unwrap();
        let mut memory = Memory::new(bytes.to_vec());
        memory_setup(&mut memory);
        let decoded = Decoder::new(&memory, &registry).decode_at(0)?;
        let definition = registry.definition(decoded.instruction.opcode).unwrap();
        let mut thread = ScriptThread::new(0, 0, 0);
        thread.set_local(2, Value::Int(77), 0).unwrap();
        OpcodeArgs::resolve(definition, &decoded.instruction, &memory, &thread, 0)
    }

    #[test]
    fn immediate_arguments_resolve_by_name() {
        // 0001 wait 250
        let args = resolve(&[0x01, 0x00, 0x05, 0xFA, 0x00], |_| {}).unwrap();
        assert_eq!(args.int("time").unwrap(), 250);
        assert_eq!(args.data_type("time").unwrap(), DataType::Int16);
        assert!(args.get("nope").is_err());
    }

    #[test]
    fn global_pointer_reads_memory() {
        // 0038 $8 == 5, with 12 bytes of padding for the variable
        let mut bytes = vec![0x38, 0x00, 0x02, 0x08, 0x00, 0x04, 0x05, 0];
        bytes.extend_from_slice(&[0; 8]);
        let args = resolve(&bytes, |m| {
            m.allocate(8, DataType::Int32, 41i32.to_le_bytes()).unwrap();
        })
        .unwrap();
        assert_eq!(args.int("var").unwrap(), 41);
        assert_eq!(args.var("var").unwrap(), VarRef::Global(8));
        assert_eq!(args.int("value").unwrap(), 5);
    }

    #[test]
    fn float_allocations_resolve_as_float() {
        let mut bytes = vec![0x38, 0x00, 0x02, 0x08, 0x00, 0x04, 0x05, 0];
        bytes.extend_from_slice(&[0; 8]);
        let args = resolve(&bytes, |m| {
            m.allocate(8, DataType::Float32, 2.5f32.to_le_bytes()).unwrap();
        })
        .unwrap();
        assert_eq!(args.float("var").unwrap(), 2.5);
        assert!(matches!(
            args.int("var"),
            Err(VMError::ArgumentTypeMismatch { .. })
        ));
    }

    #[test]
    fn local_pointer_reads_thread_slot() {
        // 0038 2@ == 5
        let args = resolve(&[0x38, 0x00, 0x03, 0x02, 0x00, 0x04, 0x05], |_| {}).unwrap();
        assert_eq!(args.int("var").unwrap(), 77);
        assert_eq!(args.var("var").unwrap(), VarRef::Local(2));
    }

    #[test]
    fn constraint_violation_is_reported() {
        // 0038 with an immediate where a variable is required
        let err = resolve(&[0x38, 0x00, 0x04, 0x01, 0x04, 0x05], |_| {}).unwrap_err();
        assert_eq!(
            err,
            VMError::ArgumentTypeMismatch {
                opcode: OpcodeId(0x0038),
                arg_index: 0,
                expected: "var",
                actual: "int8",
            }
        );
    }

    #[test]
    fn variadic_arguments_exclude_end_marker() {
        // 004F 32, 7, 2@, end
        let bytes = [
            0x4F, 0x00, 0x01, 0x20, 0, 0, 0, 0x04, 0x07, 0x03, 0x02, 0x00, 0x00,
        ];
        let args = resolve(&bytes, |_| {}).unwrap();
        let values: Vec<_> = args.var_args().iter().map(|a| a.value.clone()).collect();
        assert_eq!(values, vec![Value::Int(32), Value::Int(7), Value::Int(77)]);
    }

    #[test]
    fn immediates_are_not_variables() {
        let args = resolve(&[0x01, 0x00, 0x04, 0x01], |_| {}).unwrap();
        assert!(matches!(
            args.var("time"),
            Err(VMError::ArgumentTypeMismatch { .. })
        ));
    }
}
