//! Linear disassembly of the code regions.
//!
//! The map records the start address of every instruction from the start of
//! main code to the end of memory, plus a jump graph from each jump target to
//! the instructions that jump there. It answers "is this an instruction
//! boundary" queries for jump validation and tooling.

use crate::virtual_machine::decoder::Decoder;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::FlowKind;
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::registry::OpcodeRegistry;
use crate::virtual_machine::structure::RegionMap;
use std::collections::BTreeMap;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OpcodeMap {
    starts: Vec<usize>,
    jump_sources: BTreeMap<usize, Vec<usize>>,
}

impl OpcodeMap {
    /// Scans from `start` to the end of memory.
    ///
    /// Negative jump targets are resolved through `regions`; without one they
    /// fail with [`VMError::InvalidJumpTarget`]. Any decode failure aborts
    /// the scan.
    pub fn build(
        memory: &Memory,
        registry: &OpcodeRegistry,
        start: usize,
        regions: Option<&RegionMap>,
    ) -> Result<Self, VMError> {
        let decoder = Decoder::new(memory, registry);
        let mut map = OpcodeMap::default();
        let mut address = start;
        while address < memory.size() {
            let decoded = decoder.decode_at(address)?;
            let instruction = &decoded.instruction;
            map.starts.push(address);

            if FlowKind::of(instruction.opcode).has_target()
                && let Some(target) = instruction.args.first().and_then(|a| a.operand().as_int())
            {
                let target = match regions {
                    Some(regions) => regions.resolve_target(address, target)?,
                    None => usize::try_from(target).map_err(|_| VMError::InvalidJumpTarget {
                        target: target as i64,
                        source_address: address,
                    })?,
                };
                map.jump_sources.entry(target).or_default().push(address);
            }
            address = instruction.next_address();
        }
        Ok(map)
    }

    pub fn instruction_starts_at(&self, address: usize) -> bool {
        self.starts.binary_search(&address).is_ok()
    }

    /// Start of the instruction containing `address`.
    pub fn start_of_instruction_at(&self, address: usize) -> Option<usize> {
        let index = self.starts.partition_point(|&s| s <= address);
        index.checked_sub(1).map(|i| self.starts[i])
    }

    pub fn starts(&self) -> &[usize] {
        &self.starts
    }

    /// Addresses of instructions that jump to `target`.
    pub fn jump_sources(&self, target: usize) -> &[usize] {
        self.jump_sources
            .get(&target)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.starts.is_empty()
    }
}
