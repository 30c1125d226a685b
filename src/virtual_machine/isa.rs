//! Opcode identity and the built-in control opcode table.
//!
//! An opcode is a 16-bit little-endian value. The high bit of the high byte
//! (bit 15) is the negation flag: a conditional opcode carrying it stores the
//! inverse of its result. [`undo_negation`] is the single place that strips it.
//!
//! The [`for_each_builtin_opcode!`](crate::for_each_builtin_opcode) macro
//! holds the canonical definitions of the opcodes the engine implements
//! itself (thread control, jumps, conditions and plain variable stores) and
//! invokes a callback macro for code generation. This module generates:
//! - The [`BuiltinOpcode`] enum with its opcode, symbol and flow class
//! - Typed parameter lists consumed by the registry
//!
//! Everything else in a game's catalogue is data-driven and comes from the
//! definition files (see [`definitions`](super::definitions)).

use crate::virtual_machine::data_type::TypeConstraint;
use crate::virtual_machine::registry::Param;
use std::fmt;
use std::str::FromStr;

/// Negation flag in the raw opcode word.
pub const NEGATION_BIT: u16 = 0x8000;

/// Encoded opcode width in bytes.
pub const OPCODE_LEN: usize = 2;

/// Canonical (non-negated) opcode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpcodeId(pub u16);

impl OpcodeId {
    /// Raw opcode word with the negation flag applied.
    pub const fn with_negation(self, negated: bool) -> u16 {
        if negated {
            self.0 | NEGATION_BIT
        } else {
            self.0
        }
    }

    pub const fn to_le_bytes(self, negated: bool) -> [u8; OPCODE_LEN] {
        self.with_negation(negated).to_le_bytes()
    }
}

/// Splits a raw opcode word into its canonical id and negation flag.
pub const fn undo_negation(raw: u16) -> (OpcodeId, bool) {
    (OpcodeId(raw & !NEGATION_BIT), raw & NEGATION_BIT != 0)
}

impl fmt::Display for OpcodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}", self.0)
    }
}

impl FromStr for OpcodeId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 4 {
            return Err(format!("opcode '{}' must be 4 hex digits", s));
        }
        let raw = u16::from_str_radix(s, 16).map_err(|e| format!("opcode '{}': {}", s, e))?;
        Ok(undo_negation(raw).0)
    }
}

/// Control-flow class of an opcode, a property of its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlowKind {
    Plain,
    UnconditionalJump,
    ConditionalJump,
    Terminator,
}

impl FlowKind {
    pub fn of(opcode: OpcodeId) -> FlowKind {
        BuiltinOpcode::from_id(opcode)
            .map(|b| b.flow())
            .unwrap_or(FlowKind::Plain)
    }

    /// Whether the first argument names a code address.
    pub const fn has_target(&self) -> bool {
        matches!(self, FlowKind::UnconditionalJump | FlowKind::ConditionalJump)
    }
}

/// Invokes a callback macro with the built-in opcode definition list.
///
/// Parameter kinds are [`TypeConstraint`] variant names, or `VarArgs` for a
/// variadic slot terminated by an end marker.
#[macro_export]
macro_rules! for_each_builtin_opcode {
    ($callback:ident) => {
        $callback! {
            // =========================
            // Threads
            // =========================
            /// 0001 wait time ; sleeps the running thread for `time` ticks
            Wait = 0x0001, "wait", Plain => [time: IntOrVar],
            /// 004E terminate_this_script ; sleeps the running thread forever
            TerminateThisScript = 0x004E, "terminate_this_script", Terminator => [],
            /// 004F start_new_script_with_args label, args... ; new thread with locals
            StartNewScriptWithArgs = 0x004F, "start_new_script_with_args", ConditionalJump => [args: VarArgs],
            /// 00D7 start_new_script label ; new thread at label
            StartNewScript = 0x00D7, "start_new_script", ConditionalJump => [label: IntOrVar],
            /// 03A4 script_name name ; names the running thread
            ScriptName = 0x03A4, "script_name", Plain => [name: String],
            /// 0417 start_mission id ; mission thread at the mission's start
            StartMission = 0x0417, "start_mission", Plain => [mission: IntOrVar],

            // =========================
            // Jumps and calls
            // =========================
            /// 0002 goto label
            Goto = 0x0002, "goto", UnconditionalJump => [label: IntOrVar],
            /// 004D goto_if_false label ; jumps when the condition block is false
            GotoIfFalse = 0x004D, "goto_if_false", ConditionalJump => [label: IntOrVar],
            /// 0050 gosub label ; pushes the return address
            Gosub = 0x0050, "gosub", Plain => [label: IntOrVar],
            /// 0051 return ; pops the return address
            Return = 0x0051, "return", Plain => [],

            // =========================
            // Conditions
            // =========================
            /// 00D6 andor mode ; opens a condition block
            Andor = 0x00D6, "andor", Plain => [mode: Int],
            /// 0018 is_int_var_greater_than_number var, value
            IsIntVarGreaterThanNumber = 0x0018, "is_int_var_greater_than_number", Plain => [var: Var, value: Int],
            /// 0038 is_int_var_equal_to_number var, value
            IsIntVarEqualToNumber = 0x0038, "is_int_var_equal_to_number", Plain => [var: Var, value: Int],

            // =========================
            // Variables
            // =========================
            /// 0004 set_var_int $var, value
            SetVarInt = 0x0004, "set_var_int", Plain => [var: Var, value: Int],
            /// 0005 set_var_float $var, value
            SetVarFloat = 0x0005, "set_var_float", Plain => [var: Var, value: Float],
            /// 0006 set_lvar_int lvar, value
            SetLvarInt = 0x0006, "set_lvar_int", Plain => [var: Var, value: Int],
            /// 0007 set_lvar_float lvar, value
            SetLvarFloat = 0x0007, "set_lvar_float", Plain => [var: Var, value: Float],
            /// 0008 add_val_to_int_var $var, value
            AddValToIntVar = 0x0008, "add_val_to_int_var", Plain => [var: Var, value: IntOrVar],
        }
    };
}

macro_rules! define_builtin_opcodes {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $symbol:literal, $flow:ident => [
                $( $field:ident : $kind:ident ),* $(,)?
            ]
        ),* $(,)?
    ) => {
        /// Opcodes with behavior implemented by the engine.
        #[derive(Copy, Clone, Debug, Eq, PartialEq)]
        pub enum BuiltinOpcode {
            $(
                $(#[$doc])*
                $name,
            )*
        }

        impl BuiltinOpcode {
            pub const ALL: &'static [BuiltinOpcode] = &[ $( BuiltinOpcode::$name, )* ];

            pub const fn id(&self) -> OpcodeId {
                match self {
                    $( BuiltinOpcode::$name => OpcodeId($opcode), )*
                }
            }

            pub const fn from_id(id: OpcodeId) -> Option<Self> {
                match id.0 {
                    $( $opcode => Some(BuiltinOpcode::$name), )*
                    _ => None,
                }
            }

            /// Returns the symbolic name used in listings and traces.
            pub const fn symbol(&self) -> &'static str {
                match self {
                    $( BuiltinOpcode::$name => $symbol, )*
                }
            }

            pub const fn flow(&self) -> FlowKind {
                match self {
                    $( BuiltinOpcode::$name => FlowKind::$flow, )*
                }
            }

            pub fn params(&self) -> Vec<Param> {
                match self {
                    $( BuiltinOpcode::$name => vec![ $( define_builtin_opcodes!(@param $field, $kind) ),* ], )*
                }
            }
        }
    };

    (@param $field:ident, VarArgs) => {
        Param::variadic(stringify!($field), TypeConstraint::Any)
    };
    (@param $field:ident, $kind:ident) => {
        Param::single(stringify!($field), TypeConstraint::$kind)
    };
}

for_each_builtin_opcode!(define_builtin_opcodes);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::registry::ParamKind;
    use std::collections::HashSet;

    #[test]
    fn negation_bit_is_high_bit_of_second_byte() {
        let raw = u16::from_le_bytes([0x4D, 0x80]);
        let (id, negated) = undo_negation(raw);
        assert_eq!(id, OpcodeId(0x004D));
        assert!(negated);
        assert_eq!(id.to_le_bytes(negated), [0x4D, 0x80]);
    }

    #[test]
    fn plain_opcode_is_not_negated() {
        let (id, negated) = undo_negation(0x0417);
        assert_eq!(id, OpcodeId(0x0417));
        assert!(!negated);
        assert_eq!(id.with_negation(false), 0x0417);
    }

    #[test]
    fn negation_round_trip_for_every_word() {
        for raw in 0..=u16::MAX {
            let (id, negated) = undo_negation(raw);
            assert_eq!(id.with_negation(negated), raw);
        }
    }

    #[test]
    fn display_and_parse() {
        assert_eq!(OpcodeId(0x4D).to_string(), "004D");
        assert_eq!("03a4".parse::<OpcodeId>().unwrap(), OpcodeId(0x03A4));
        assert_eq!("804D".parse::<OpcodeId>().unwrap(), OpcodeId(0x004D));
        assert!("4D".parse::<OpcodeId>().is_err());
        assert!("zzzz".parse::<OpcodeId>().is_err());
    }

    #[test]
    fn builtin_ids_are_unique_and_resolvable() {
        let mut seen = HashSet::new();
        for builtin in BuiltinOpcode::ALL {
            assert!(seen.insert(builtin.id()), "duplicate {}", builtin.id());
            assert_eq!(BuiltinOpcode::from_id(builtin.id()), Some(*builtin));
        }
    }

    #[test]
    fn flow_classification() {
        assert_eq!(FlowKind::of(OpcodeId(0x0002)), FlowKind::UnconditionalJump);
        for id in [0x004D, 0x004F, 0x00D7] {
            assert_eq!(FlowKind::of(OpcodeId(id)), FlowKind::ConditionalJump);
        }
        assert_eq!(FlowKind::of(OpcodeId(0x004E)), FlowKind::Terminator);
        assert_eq!(FlowKind::of(OpcodeId(0x0001)), FlowKind::Plain);
        assert_eq!(FlowKind::of(OpcodeId(0x0999)), FlowKind::Plain);
    }

    #[test]
    fn params_follow_table() {
        let params = BuiltinOpcode::StartNewScriptWithArgs.params();
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].kind, ParamKind::Variadic(TypeConstraint::Any));

        let params = BuiltinOpcode::SetVarFloat.params();
        assert_eq!(params[0].name, "var");
        assert_eq!(params[1].kind, ParamKind::Single(TypeConstraint::Float));
        assert!(BuiltinOpcode::Return.params().is_empty());
    }
}
