use super::VM;
use super::branch::Combine;
use super::scheduler::WAKE_NEVER;
use super::thread::ScriptThread;
use crate::virtual_machine::args::VarRef;
use crate::virtual_machine::data_type::Value;
use crate::virtual_machine::decoder::Decoded;
use crate::virtual_machine::errors::VMError;
use crate::virtual_machine::isa::OpcodeId;
use crate::virtual_machine::memory::Memory;
use crate::virtual_machine::registry::OpcodeDefinition;
use crate::virtual_machine::structure::RegionMap;

/// Mutable view of the engine handed to an opcode handler for one tick.
///
/// Everything a handler changes goes through this context, so the engine can
/// roll the tick back if the handler fails.
pub struct ExecContext<'a> {
    vm: &'a mut VM,
    thread: usize,
    decoded: &'a Decoded,
    definition: &'a OpcodeDefinition,
    jumped: bool,
}

impl<'a> ExecContext<'a> {
    pub(super) fn new(
        vm: &'a mut VM,
        thread: usize,
        decoded: &'a Decoded,
        definition: &'a OpcodeDefinition,
    ) -> Self {
        Self {
            vm,
            thread,
            decoded,
            definition,
            jumped: false,
        }
    }

    pub fn definition(&self) -> &OpcodeDefinition {
        self.definition
    }

    pub fn opcode(&self) -> OpcodeId {
        self.decoded.instruction.opcode
    }

    /// Address of the executing instruction.
    pub fn address(&self) -> usize {
        self.decoded.instruction.address
    }

    pub fn next_address(&self) -> usize {
        self.decoded.instruction.next_address()
    }

    pub fn negated(&self) -> bool {
        self.decoded.negated
    }

    pub fn now(&self) -> u64 {
        self.vm.scheduler.now()
    }

    pub fn thread_id(&self) -> usize {
        self.thread
    }

    pub fn thread(&self) -> Result<&ScriptThread, VMError> {
        self.vm.scheduler.thread(self.thread).ok_or(VMError::NoThreads)
    }

    fn thread_mut(&mut self) -> Result<&mut ScriptThread, VMError> {
        self.vm
            .scheduler
            .thread_mut(self.thread)
            .ok_or(VMError::NoThreads)
    }

    pub fn memory(&self) -> &Memory {
        &self.vm.memory
    }

    pub fn regions(&self) -> &RegionMap {
        &self.vm.regions
    }

    pub(super) fn jumped(&self) -> bool {
        self.jumped
    }

    /// Fails the tick with an assertion error unless `condition` holds.
    pub fn ensure(&self, condition: bool, message: &str) -> Result<(), VMError> {
        if condition {
            Ok(())
        } else {
            Err(VMError::AssertionFailure {
                opcode: self.opcode(),
                message: message.to_string(),
            })
        }
    }

    // ---- variables ----

    /// Stores a typed four-byte value at a global address.
    pub fn allocate(&mut self, address: usize, value: &Value) -> Result<(), VMError> {
        let (data_type, bytes) = value.to_storage().ok_or_else(|| VMError::AssertionFailure {
            opcode: self.opcode(),
            message: format!("cannot store {} in a variable", value.type_name()),
        })?;
        self.vm.memory.allocate(address, data_type, bytes)
    }

    /// Writes `value` to the variable `var` points at.
    pub fn assign(&mut self, var: VarRef, value: Value) -> Result<(), VMError> {
        match var {
            VarRef::Global(address) => self.allocate(address, &value),
            VarRef::Local(index) => {
                let now = self.now();
                self.thread_mut()?.set_local(index, value, now)
            }
        }
    }

    // ---- threads ----

    /// Starts a thread at `pc` and returns its id.
    ///
    /// The new thread inherits the mission base of the thread that started
    /// it. With `switch_on_new_thread` the scheduler passes immediately.
    pub fn start_thread(&mut self, pc: usize, is_mission: bool) -> Result<usize, VMError> {
        let inherited = self.thread()?.base_offset;
        let scheduler = &mut self.vm.scheduler;
        let id = scheduler.spawn(pc, is_mission);
        if !is_mission && let Some(thread) = scheduler.thread_mut(id) {
            thread.base_offset = inherited;
        }
        if self.vm.config.switch_on_new_thread {
            self.vm.scheduler.pass();
        }
        Ok(id)
    }

    pub fn set_thread_local(
        &mut self,
        id: usize,
        index: usize,
        value: Value,
    ) -> Result<(), VMError> {
        let now = self.now();
        self.vm
            .scheduler
            .thread_mut(id)
            .ok_or(VMError::NoThreads)?
            .set_local(index, value, now)
    }

    pub fn set_thread_name(&mut self, name: &str) -> Result<(), VMError> {
        self.thread_mut()?.name = Some(name.to_string());
        Ok(())
    }

    /// Puts the running thread to sleep and hands control to the scheduler.
    pub fn sleep_until(&mut self, wake_at: u64) -> Result<(), VMError> {
        self.vm.scheduler.sleep(self.thread, wake_at);
        self.vm.scheduler.pass();
        Ok(())
    }

    pub fn end_thread(&mut self) -> Result<(), VMError> {
        self.sleep_until(WAKE_NEVER)
    }

    // ---- conditions ----

    pub fn open_conditions(&mut self, capacity: usize, combine: Combine) -> Result<(), VMError> {
        self.vm.branch.open(capacity, combine)
    }

    /// Records a condition result, inverted if the opcode was negated.
    pub fn push_condition(&mut self, value: bool) -> Result<(), VMError> {
        let negated = self.negated();
        self.vm.branch.push(value, negated)
    }

    pub fn resolve_conditions(&mut self) -> Result<bool, VMError> {
        self.vm.branch.resolve()
    }

    // ---- control flow ----

    /// Turns a jump operand into an absolute address.
    ///
    /// Negative targets are relative to the running thread's mission base.
    pub fn resolve_target(&self, target: i32) -> Result<usize, VMError> {
        let invalid = VMError::InvalidJumpTarget {
            target: target as i64,
            source_address: self.address(),
        };
        let address = if target >= 0 {
            target as usize
        } else {
            let base = self.thread()?.base_offset.ok_or(invalid.clone())?;
            base + target.unsigned_abs() as usize
        };
        if address >= self.vm.memory.size() {
            return Err(invalid);
        }
        if self.vm.config.validate_jumps
            && address >= self.vm.regions.main_code.start
            && !self.vm.opcode_map.instruction_starts_at(address)
        {
            return Err(invalid);
        }
        Ok(address)
    }

    /// Jumps the running thread to a script target.
    pub fn jump(&mut self, target: i32) -> Result<(), VMError> {
        let address = self.resolve_target(target)?;
        self.set_pc(address)
    }

    /// Sets the running thread's PC; the engine will not advance it this tick.
    pub fn set_pc(&mut self, address: usize) -> Result<(), VMError> {
        self.thread_mut()?.pc = address;
        self.jumped = true;
        Ok(())
    }

    pub fn call(&mut self, target: i32) -> Result<(), VMError> {
        let address = self.resolve_target(target)?;
        let return_address = self.next_address();
        self.thread_mut()?.push_return(return_address)?;
        self.set_pc(address)
    }

    pub fn ret(&mut self) -> Result<(), VMError> {
        let address = self.thread_mut()?.pop_return()?;
        self.set_pc(address)
    }
}
