//! Deterministic engine driven by the caller

use super::{Executor, Task};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

struct InlineState {
    queue: VecDeque<Task>,
    timers: BTreeMap<(Instant, u64), Task>,
    timer_seq: u64,
    now: Instant,
    /// Thread currently draining the queue
    runner: Option<ThreadId>,
}

/// Engine that runs scheduled work only when asked to
///
/// Posted tasks wait in a FIFO queue until [`InlineEngine::run_pending`].
/// Timers fire when [`InlineEngine::advance`] moves the virtual clock past
/// their deadline. The serialized sub-context shares the single queue, so
/// every task is trivially serialized.
pub struct InlineEngine {
    state: Mutex<InlineState>,
}

impl Default for InlineEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InlineEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(InlineState {
                queue: VecDeque::new(),
                timers: BTreeMap::new(),
                timer_seq: 0,
                now: Instant::now(),
                runner: None,
            }),
        }
    }

    /// Run queued tasks, including those they schedule, until the queue is
    /// empty. Returns the number of tasks run.
    pub fn run_pending(&self) -> usize {
        {
            let mut state = self.state.lock();
            if state.runner.is_some() {
                return 0;
            }
            state.runner = Some(thread::current().id());
        }

        let mut ran = 0;
        loop {
            let task = self.state.lock().queue.pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        self.state.lock().runner = None;
        ran
    }

    /// Move the virtual clock forward, firing due timers in deadline order
    pub fn advance(&self, by: Duration) -> usize {
        let target = self.state.lock().now + by;
        let mut ran = self.run_pending();
        loop {
            let due = {
                let mut state = self.state.lock();
                match state.timers.first_key_value() {
                    Some((&(deadline, _), _)) if deadline <= target => {
                        state.now = state.now.max(deadline);
                        state.timers.pop_first().map(|(_, task)| task)
                    }
                    _ => None,
                }
            };
            let Some(task) = due else { break };
            self.state.lock().queue.push_back(task);
            ran += self.run_pending();
        }
        self.state.lock().now = target;
        ran
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.state.lock().queue.len()
    }

    /// Timers not yet fired
    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }
}

impl Executor for InlineEngine {
    fn dispatch(&self, task: Task) {
        let inline = self.state.lock().runner == Some(thread::current().id());
        if inline {
            task();
        } else {
            self.post(task);
        }
    }

    fn post(&self, task: Task) {
        self.state.lock().queue.push_back(task);
    }

    fn post_api(&self, task: Task) {
        self.post(task);
    }

    fn post_after(&self, delay: Duration, task: Task) {
        let mut state = self.state.lock();
        state.timer_seq += 1;
        let key = (state.now + delay, state.timer_seq);
        state.timers.insert(key, task);
    }

    fn now(&self) -> Instant {
        self.state.lock().now
    }
}
