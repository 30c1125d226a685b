use crate::virtual_machine::isa::OpcodeId;
use thiserror::Error;

/// Errors raised while loading, decoding or executing a script.
///
/// Every error is fatal for the tick (or load) that produced it. The engine
/// leaves its state untouched when a tick fails so the caller can inspect,
/// rewind and retry.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VMError {
    /// A read or write touched bytes outside `[0, size)`.
    #[error("out of bounds access at {address} (length {length}, memory size {size})")]
    OutOfBoundsAccess {
        address: usize,
        length: usize,
        size: usize,
    },
    /// The opcode at `address` has no registered definition.
    #[error("unknown opcode {opcode} at {address}")]
    UnknownOpcode { opcode: OpcodeId, address: usize },
    /// An argument tag is neither a known data type nor an inline string.
    #[error("unknown data type 0x{tag:02x} at {address}")]
    UnknownDataType { tag: u8, address: usize },
    /// A decoded argument does not satisfy the declared constraint.
    #[error(
        "opcode {opcode} expected argument {arg_index} to be of type {expected} but got {actual}"
    )]
    ArgumentTypeMismatch {
        opcode: OpcodeId,
        arg_index: usize,
        expected: &'static str,
        actual: &'static str,
    },
    /// Region markers or mission table are missing or inconsistent.
    #[error("invalid script structure: {reason}")]
    InvalidScriptStructure { reason: String },
    /// A condition was written outside an open block, or past its capacity.
    #[error("branch condition misuse: {reason}")]
    BranchConditionMisuse { reason: &'static str },
    /// A handler's own precondition failed.
    #[error("assertion failed in {opcode}: {message}")]
    AssertionFailure { opcode: OpcodeId, message: String },
    /// The same opcode was defined or bound twice.
    #[error("duplicate opcode {opcode}")]
    DuplicateOpcode { opcode: OpcodeId },
    /// A built-in definition disagrees with the catalogue about argument shape.
    #[error("opcode {opcode} declared with {declared} arguments but catalogue has {catalogue}")]
    ArityConflict {
        opcode: OpcodeId,
        declared: String,
        catalogue: String,
    },
    /// A definition file line could not be parsed.
    #[error("line {line}: {reason}")]
    InvalidDefinition { line: usize, reason: String },
    /// Local variable index outside the thread's slots.
    #[error("local slot {index} out of bounds (available: {available})")]
    InvalidLocalSlot { index: usize, available: usize },
    /// Call stack is full.
    #[error("call stack overflow (depth {depth})")]
    CallStackOverflow { depth: usize },
    /// Return executed with an empty call stack.
    #[error("return without call")]
    CallStackUnderflow,
    /// A jump target cannot be resolved to an instruction start.
    #[error("invalid jump target {target} from {source_address}")]
    InvalidJumpTarget { target: i64, source_address: usize },
    /// A handler asked for an argument its definition does not declare.
    #[error("opcode {opcode} has no argument named {name}")]
    UnknownArgument { opcode: OpcodeId, name: String },
    /// No thread exists to run.
    #[error("no threads to schedule")]
    NoThreads,
    /// Every thread has terminated; nothing is left to run.
    #[error("all threads terminated")]
    AllThreadsTerminated,
    /// File I/O error while loading scripts or definitions.
    #[error("io error: {0}")]
    Io(String),
}
