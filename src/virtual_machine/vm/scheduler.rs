use super::thread::ScriptThread;
use crate::virtual_machine::errors::VMError;

/// Wake time of a thread that will never run again.
pub const WAKE_NEVER: u64 = u64::MAX;

/// Thread collection, virtual clock and the cooperative wake policy.
///
/// Threads only give up control by sleeping or by starting another thread.
/// A pass then selects the thread that is most overdue: a thread that never
/// slept ranks first, otherwise the largest `now - wake_at` wins, ties going
/// to the lowest thread id. Threads parked at [`WAKE_NEVER`] are never
/// selected again.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Scheduler {
    threads: Vec<ScriptThread>,
    current: Option<usize>,
    time: u64,
}

fn overdue(now: u64, wake_at: Option<u64>) -> i128 {
    match wake_at {
        None => i128::MAX,
        Some(at) => now as i128 - at as i128,
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current virtual time.
    pub fn now(&self) -> u64 {
        self.time
    }

    pub fn advance_time(&mut self) {
        self.time += 1;
    }

    pub fn current(&self) -> Option<usize> {
        self.current
    }

    pub fn threads(&self) -> &[ScriptThread] {
        &self.threads
    }

    pub fn thread(&self, id: usize) -> Option<&ScriptThread> {
        self.threads.get(id)
    }

    pub fn thread_mut(&mut self, id: usize) -> Option<&mut ScriptThread> {
        self.threads.get_mut(id)
    }

    /// Appends a new thread and returns its id.
    pub fn spawn(&mut self, pc: usize, is_mission: bool) -> usize {
        let id = self.threads.len();
        let thread = if is_mission {
            ScriptThread::mission(id, pc, self.time)
        } else {
            ScriptThread::new(id, pc, self.time)
        };
        self.threads.push(thread);
        id
    }

    /// Sets a thread's wake time without switching.
    pub fn sleep(&mut self, id: usize, until: u64) {
        if let Some(thread) = self.threads.get_mut(id) {
            thread.wake_at = Some(until);
        }
    }

    /// Hands control to the most overdue thread and returns its id, or
    /// `None` when every thread has terminated.
    pub fn pass(&mut self) -> Option<usize> {
        let now = self.time;
        if let Some(current) = self.current
            && let Some(thread) = self.threads.get_mut(current)
            && thread.wake_at.is_none()
        {
            thread.wake_at = Some(now);
        }

        let mut best: Option<(usize, i128)> = None;
        for thread in self.threads.iter().filter(|t| !t.is_terminated()) {
            let key = overdue(now, thread.wake_at);
            if best.is_none_or(|(_, k)| key > k) {
                best = Some((thread.id, key));
            }
        }
        self.current = best.map(|(id, _)| id);
        let selected = self.current?;
        self.threads[selected].wake_at = None;
        Some(selected)
    }

    /// Id of the thread to run next, or why there is none.
    pub fn runnable(&self) -> Result<usize, VMError> {
        match self.current {
            Some(id) => Ok(id),
            None if self.threads.is_empty() => Err(VMError::NoThreads),
            None => Err(VMError::AllThreadsTerminated),
        }
    }
}
