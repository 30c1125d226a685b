//! Execution engine.
//!
//! The [`VM`] owns memory, the opcode registry, the region map, the opcode
//! map, every script thread and the branch condition state. Each call to
//! [`VM::tick`] executes exactly one instruction of the current thread:
//!
//! 1. decode the instruction at the thread's PC
//! 2. resolve and type-check its arguments
//! 3. run the opcode handler inside a checkpoint
//! 4. advance the PC by the instruction length unless the handler jumped
//! 5. advance virtual time by one unit
//!
//! A failing step leaves the VM exactly as it was before the tick: decoding
//! and resolution never mutate, and handler effects are rolled back.

mod branch;
mod context;
mod scheduler;
#[cfg(test)]
mod tests;
mod thread;

pub use branch::{BranchConditions, Combine, MAX_CONDITIONS};
pub use context::ExecContext;
pub use scheduler::{Scheduler, WAKE_NEVER};
pub use thread::{CALL_STACK_DEPTH, LOCAL_SLOTS, ScriptThread, TIMER_SLOTS};

use crate::virtual_machine::args::OpcodeArgs;
use crate::virtual_machine::decoder::{Decoded, Decoder};
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::OpcodeId;
use crate::virtual_machine::memory::{Memory, StateDigest};
use crate::virtual_machine::opcode_map::OpcodeMap;
use crate::virtual_machine::registry::OpcodeRegistry;
use crate::virtual_machine::structure::{self, GameVariant, RegionMap};
use crate::{info, trace};
use std::ops::Range;

/// Engine configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmConfig {
    pub variant: GameVariant,
    /// Switch to a thread as soon as it is started.
    pub switch_on_new_thread: bool,
    /// Reject jumps into code that do not land on an instruction start.
    pub validate_jumps: bool,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            variant: GameVariant::default(),
            switch_on_new_thread: true,
            validate_jumps: true,
        }
    }
}

/// What one tick executed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TickRecord {
    pub tick: u64,
    pub thread: usize,
    pub address: usize,
    pub opcode: OpcodeId,
    pub negated: bool,
    pub byte_length: usize,
    pub jumped: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ThreadSummary {
    pub id: usize,
    pub pc: usize,
    pub wake_at: Option<u64>,
    pub is_mission: bool,
    pub name: Option<String>,
}

/// Diagnostic view of the engine between ticks.
#[derive(Clone, Debug, PartialEq)]
pub struct Snapshot {
    pub tick: u64,
    pub time: u64,
    pub current_thread: Option<usize>,
    pub pc: Option<usize>,
    /// Memory ranges written by the last tick.
    pub dirty: Vec<Range<usize>>,
    pub branch_conditions: Option<Vec<Option<bool>>>,
    pub threads: Vec<ThreadSummary>,
    pub memory_digest: StateDigest,
}

pub struct VM {
    memory: Memory,
    registry: OpcodeRegistry,
    regions: RegionMap,
    opcode_map: OpcodeMap,
    scheduler: Scheduler,
    branch: BranchConditions,
    config: VmConfig,
    ticks: u64,
}

impl VM {
    /// Loads a script blob: detects its regions, maps its code and starts
    /// the main thread at address 0.
    pub fn load(blob: Vec<u8>, registry: OpcodeRegistry, config: VmConfig) -> Result<Self, VMError> {
        let memory = Memory::new(blob);
        let regions = structure::detect(&memory, &registry, config.variant)?;
        let opcode_map =
            OpcodeMap::build(&memory, &registry, regions.main_code.start, Some(&regions))?;
        info!(
            "loaded {} script: {} bytes, {} instructions, {} models, {} missions",
            config.variant,
            memory.size(),
            opcode_map.len(),
            regions.model_names.len(),
            regions.missions.len()
        );

        let mut scheduler = Scheduler::new();
        scheduler.spawn(0, false);
        scheduler.pass();

        Ok(Self {
            memory,
            registry,
            regions,
            opcode_map,
            scheduler,
            branch: BranchConditions::default(),
            config,
            ticks: 0,
        })
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn registry(&self) -> &OpcodeRegistry {
        &self.registry
    }

    pub fn regions(&self) -> &RegionMap {
        &self.regions
    }

    pub fn opcode_map(&self) -> &OpcodeMap {
        &self.opcode_map
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn threads(&self) -> &[ScriptThread] {
        self.scheduler.threads()
    }

    pub fn current_thread(&self) -> Option<&ScriptThread> {
        self.scheduler
            .current()
            .and_then(|id| self.scheduler.thread(id))
    }

    pub fn branch_conditions(&self) -> &BranchConditions {
        &self.branch
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.scheduler.now()
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Moves a thread's PC, e.g. to retry after a failed tick.
    pub fn set_thread_pc(&mut self, id: usize, pc: usize) -> Result<(), VMError> {
        if pc >= self.memory.size() {
            return Err(VMError::OutOfBoundsAccess {
                address: pc,
                length: 0,
                size: self.memory.size(),
            });
        }
        let thread = self.scheduler.thread_mut(id).ok_or(VMError::NoThreads)?;
        thread.pc = pc;
        Ok(())
    }

    pub fn decode_at(&self, address: usize) -> Result<Decoded, VMError> {
        Decoder::new(&self.memory, &self.registry).decode_at(address)
    }

    /// Executes one instruction of the current thread.
    pub fn tick(&mut self) -> Result<TickRecord, VMError> {
        self.memory.clear_dirty();
        let thread_id = self.scheduler.runnable()?;
        let thread = self.scheduler.thread(thread_id).ok_or(VMError::NoThreads)?;
        let pc = thread.pc;

        let decoded = self.decode_at(pc)?;
        let opcode = decoded.instruction.opcode;
        let (definition, handler) = self.registry.entry(opcode).ok_or(VMError::UnknownOpcode {
            opcode,
            address: pc,
        })?;
        let args = OpcodeArgs::resolve(
            &definition,
            &decoded.instruction,
            &self.memory,
            thread,
            self.scheduler.now(),
        )?;
        trace!(
            "[{}] thread {} @ {:08}: {}",
            self.ticks,
            thread_id,
            pc,
            decoded.render(&definition)
        );

        let scheduler_checkpoint = self.scheduler.clone();
        let branch_checkpoint = self.branch.clone();
        self.memory.begin_journal();
        let mut ctx = ExecContext::new(self, thread_id, &decoded, &definition);
        let result = handler(&mut ctx, &args);
        let jumped = ctx.jumped();
        if let Err(e) = result {
            self.memory.rollback_journal();
            self.scheduler = scheduler_checkpoint;
            self.branch = branch_checkpoint;
            return Err(e);
        }
        self.memory.commit_journal();

        if !jumped && let Some(thread) = self.scheduler.thread_mut(thread_id) {
            thread.pc = decoded.instruction.next_address();
        }
        self.scheduler.advance_time();
        self.ticks += 1;

        Ok(TickRecord {
            tick: self.ticks,
            thread: thread_id,
            address: pc,
            opcode,
            negated: decoded.negated,
            byte_length: decoded.instruction.byte_length,
            jumped,
        })
    }

    /// Runs up to `max_ticks` ticks, stopping at the first error.
    pub fn run(&mut self, max_ticks: u64) -> Result<u64, VMError> {
        for _ in 0..max_ticks {
            self.tick()?;
        }
        Ok(max_ticks)
    }

    pub fn snapshot(&self) -> Snapshot {
        let current = self.current_thread();
        Snapshot {
            tick: self.ticks,
            time: self.now(),
            current_thread: current.map(|t| t.id),
            pc: current.map(|t| t.pc),
            dirty: self.memory.dirty().to_vec(),
            branch_conditions: self.branch.slots().map(<[_]>::to_vec),
            threads: self
                .threads()
                .iter()
                .map(|t| ThreadSummary {
                    id: t.id,
                    pc: t.pc,
                    wake_at: t.wake_at,
                    is_mission: t.is_mission,
                    name: t.name.clone(),
                })
                .collect(),
            memory_digest: self.memory.digest(),
        }
    }
}
