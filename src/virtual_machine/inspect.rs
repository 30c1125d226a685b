//! Colored hex dumps of script memory and disassembly listings.

use crate::virtual_machine::data_type::{ALLOCATION_SIZE, DataType};
use crate::virtual_machine::decoder::{Instruction, Operand};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::structure::RegionMap;
use crate::virtual_machine::vm::VM;
use std::fmt::{self, Write as _};
use std::io::{self, Write};
use std::ops::Range;
use termcolor::{Color, ColorSpec, WriteColor};

const ROW_WIDTH: usize = 16;

/// Writes `window` as rows of 16 bytes with an ASCII column.
///
/// Typed allocations are colored (int blue, float yellow). When `highlight`
/// is given, its bytes are bold and the globals its operands point at are
/// green.
pub fn dump_memory(
    memory: &Memory,
    window: Range<usize>,
    highlight: Option<&Instruction>,
    out: &mut dyn WriteColor,
) -> io::Result<()> {
    let end = window.end.min(memory.size());
    let start = window.start.min(end) / ROW_WIDTH * ROW_WIDTH;
    let bytes = memory.as_bytes();
    let pointers: Vec<Range<usize>> = highlight
        .map(|instruction| {
            instruction
                .args
                .iter()
                .filter_map(|arg| match arg.operand() {
                    Operand::Global(address) => {
                        let address = address as usize;
                        Some(address..address + ALLOCATION_SIZE)
                    }
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    let code = highlight.map(|i| i.address..i.next_address());

    for row in (start..end).step_by(ROW_WIDTH) {
        write!(out, "{:08X}  ", row)?;
        for address in row..row + ROW_WIDTH {
            if address < end {
                out.set_color(&byte_color(memory, address, code.as_ref(), &pointers))?;
                write!(out, "{:02X}", bytes[address])?;
                out.reset()?;
                write!(out, " ")?;
            } else {
                write!(out, "   ")?;
            }
        }
        write!(out, " ")?;
        for &byte in &bytes[row..(row + ROW_WIDTH).min(end)] {
            let c = if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            };
            write!(out, "{}", c)?;
        }
        writeln!(out)?;
    }
    Ok(())
}

/// Renders the region map followed by every mapped instruction.
///
/// Mission starts get a `:mission_N` label and jump targets list the
/// addresses that jump to them.
pub fn listing(vm: &VM) -> Result<String, VMError> {
    let mut lines = Vec::with_capacity(vm.opcode_map().len());
    for &address in vm.opcode_map().starts() {
        let decoded = vm.decode_at(address)?;
        let opcode = decoded.instruction.opcode;
        let definition = vm
            .registry()
            .definition(opcode)
            .ok_or(VMError::UnknownOpcode { opcode, address })?;
        lines.push((address, decoded.render(definition)));
    }

    let mut out = String::new();
    // writing into a String cannot fail
    let _ = write_listing(&mut out, vm, &lines);
    Ok(out)
}

fn write_listing(out: &mut String, vm: &VM, lines: &[(usize, String)]) -> fmt::Result {
    let regions = vm.regions();
    write_regions(out, regions)?;
    for (address, text) in lines {
        if let Some(id) = regions.missions.iter().position(|m| m.start() == address) {
            writeln!(out, "\n:mission_{}", id)?;
        }
        write!(out, "{:08}  {}", address, text)?;
        let sources = vm.opcode_map().jump_sources(*address);
        if !sources.is_empty() {
            let list: Vec<String> = sources.iter().map(|s| format!("{:08}", s)).collect();
            write!(out, "  ; from {}", list.join(", "))?;
        }
        writeln!(out)?;
    }
    Ok(())
}

fn write_regions(out: &mut String, regions: &RegionMap) -> fmt::Result {
    let ranges = [
        ("memory", &regions.memory),
        ("models", &regions.models),
        ("mission table", &regions.mission_table),
        ("main code", &regions.main_code),
        ("mission code", &regions.mission_code),
    ];
    for (name, range) in ranges {
        writeln!(out, "; {:<13} {:08}..{:08}", name, range.start, range.end)?;
    }
    for (index, name) in regions.model_names.iter().enumerate() {
        writeln!(out, "; model {} {}", -(index as i64), name)?;
    }
    Ok(())
}

fn byte_color(
    memory: &Memory,
    address: usize,
    code: Option<&Range<usize>>,
    pointers: &[Range<usize>],
) -> ColorSpec {
    let mut spec = ColorSpec::new();
    if pointers.iter().any(|p| p.contains(&address)) {
        spec.set_fg(Some(Color::Green));
    } else if let Some((_, allocation)) = memory.allocation_covering(address) {
        match allocation.data_type {
            DataType::Float32 => spec.set_fg(Some(Color::Yellow)),
            _ => spec.set_fg(Some(Color::Blue)),
        };
    }
    if code.is_some_and(|c| c.contains(&address)) {
        spec.set_bold(true);
    }
    spec
}
