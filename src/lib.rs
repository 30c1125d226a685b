//! Script virtual machine library.
//!
//! Loads compiled mission script images and executes them one instruction at a time.

pub mod utils;
pub mod virtual_machine;
