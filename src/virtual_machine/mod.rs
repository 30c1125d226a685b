//! Bytecode interpreter for compiled mission scripts.
//!
//! A script image is loaded as one flat byte array that is both code and
//! global variable storage. The VM locates the header regions, maps every
//! instruction of the code, then executes cooperative script threads one
//! instruction per tick.
//!
//! # Script image
//!
//! - **Memory**: global variable storage, entered through a `goto` at address 0
//! - **Models**: table of fixed-width model names
//! - **Missions**: table of mission start addresses
//! - **Main code**, followed by the **mission code** of every mission
//!
//! # Instruction format
//!
//! A little-endian 16-bit opcode whose high bit negates a conditional result,
//! followed by tagged arguments. Variadic opcodes end their argument list
//! with an end marker.
//!
//! # Modules
//!
//! - [`args`]: Typed argument resolution for handlers
//! - [`data_type`]: Argument tags, runtime values and type constraints
//! - [`decoder`]: Instruction decoding
//! - [`definitions`]: Opcode catalogue and symbol file parsing
//! - [`errors`]: Execution error types
//! - [`inspect`]: Colored memory dumps
//! - [`isa`]: Opcode identity, negation and the built-in opcode table
//! - [`memory`]: Flat script memory with an allocation overlay
//! - [`opcode_map`]: Instruction starts and the jump graph
//! - [`opcodes`]: Built-in opcode behavior
//! - [`registry`]: Opcode definitions and handlers
//! - [`structure`]: Header region detection
//! - [`vm`]: Threads, scheduling and the execution engine

pub mod args;
pub mod data_type;
pub mod decoder;
pub mod definitions;
pub mod errors;
pub mod inspect;
pub mod isa;
pub mod memory;
pub mod opcode_map;
pub mod opcodes;
pub mod registry;
pub mod structure;
pub mod vm;
