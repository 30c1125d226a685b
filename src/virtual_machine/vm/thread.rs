use super::scheduler::WAKE_NEVER;
use crate::virtual_machine::data_type::Value;
use crate::virtual_machine::errors::VMError;

/// Regular local variable slots per thread.
pub const LOCAL_SLOTS: usize = 32;
/// Timer slots per thread, addressed as the local indices after the regular slots.
pub const TIMER_SLOTS: usize = 2;
/// Maximum nesting of `gosub` calls.
pub const CALL_STACK_DEPTH: usize = 8;

/// One independent control point of a running script.
///
/// Threads are never destroyed: a finished thread sleeps forever.
#[derive(Clone, Debug, PartialEq)]
pub struct ScriptThread {
    pub id: usize,
    pub pc: usize,
    locals: [Option<Value>; LOCAL_SLOTS],
    /// Virtual time at which each timer read zero.
    timer_bases: [i64; TIMER_SLOTS],
    call_stack: [usize; CALL_STACK_DEPTH],
    stack_depth: usize,
    /// Virtual time the thread asked to sleep until.
    pub wake_at: Option<u64>,
    pub is_mission: bool,
    /// Mission start address that negative jump targets are relative to.
    pub base_offset: Option<usize>,
    pub name: Option<String>,
}

impl ScriptThread {
    pub fn new(id: usize, pc: usize, now: u64) -> Self {
        Self {
            id,
            pc,
            locals: std::array::from_fn(|_| None),
            timer_bases: [now as i64; TIMER_SLOTS],
            call_stack: [0; CALL_STACK_DEPTH],
            stack_depth: 0,
            wake_at: None,
            is_mission: false,
            base_offset: None,
            name: None,
        }
    }

    pub fn mission(id: usize, pc: usize, now: u64) -> Self {
        Self {
            is_mission: true,
            base_offset: Some(pc),
            ..Self::new(id, pc, now)
        }
    }

    /// Whether the thread has slept forever and can never be selected again.
    pub fn is_terminated(&self) -> bool {
        self.wake_at == Some(WAKE_NEVER)
    }

    fn slot_error(index: usize) -> VMError {
        VMError::InvalidLocalSlot {
            index,
            available: LOCAL_SLOTS + TIMER_SLOTS,
        }
    }

    /// Reads a local slot. Unset slots read as int 0, timers as elapsed time.
    pub fn local(&self, index: usize, now: u64) -> Result<Value, VMError> {
        if let Some(slot) = self.locals.get(index) {
            return Ok(slot.clone().unwrap_or(Value::Int(0)));
        }
        let timer = index - LOCAL_SLOTS;
        let base = self
            .timer_bases
            .get(timer)
            .ok_or_else(|| Self::slot_error(index))?;
        let elapsed = now as i64 - base;
        Ok(Value::Int(
            i32::try_from(elapsed).unwrap_or(if elapsed < 0 { i32::MIN } else { i32::MAX }),
        ))
    }

    pub fn set_local(&mut self, index: usize, value: Value, now: u64) -> Result<(), VMError> {
        if let Some(slot) = self.locals.get_mut(index) {
            *slot = Some(value);
            return Ok(());
        }
        let timer = index - LOCAL_SLOTS;
        let base = self
            .timer_bases
            .get_mut(timer)
            .ok_or_else(|| Self::slot_error(index))?;
        let elapsed = match value {
            Value::Int(v) => v as i64,
            Value::Float(v) => v as i64,
            Value::Str(_) => return Err(Self::slot_error(index)),
        };
        *base = now as i64 - elapsed;
        Ok(())
    }

    pub fn locals(&self) -> &[Option<Value>] {
        &self.locals
    }

    /// Pushes a return address for `gosub`.
    pub fn push_return(&mut self, address: usize) -> Result<(), VMError> {
        if self.stack_depth == CALL_STACK_DEPTH {
            return Err(VMError::CallStackOverflow {
                depth: CALL_STACK_DEPTH,
            });
        }
        self.call_stack[self.stack_depth] = address;
        self.stack_depth += 1;
        Ok(())
    }

    pub fn pop_return(&mut self) -> Result<usize, VMError> {
        if self.stack_depth == 0 {
            return Err(VMError::CallStackUnderflow);
        }
        self.stack_depth -= 1;
        Ok(self.call_stack[self.stack_depth])
    }

    pub fn call_stack(&self) -> &[usize] {
        &self.call_stack[..self.stack_depth]
    }
}
