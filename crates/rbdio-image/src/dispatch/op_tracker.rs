//! Counter of calls in progress inside a stage

use crate::completion::Context;
use parking_lot::Mutex;

#[derive(Default)]
struct TrackerState {
    count: usize,
    waiters: Vec<Context>,
}

/// Tracks in-progress calls so teardown can wait them out
#[derive(Default)]
pub struct AsyncOpTracker {
    state: Mutex<TrackerState>,
}

impl AsyncOpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_op(&self) {
        self.state.lock().count += 1;
    }

    pub fn finish_op(&self) {
        let waiters = {
            let mut state = self.state.lock();
            assert!(state.count > 0, "op tracker finished more ops than started");
            state.count -= 1;
            if state.count > 0 {
                return;
            }
            std::mem::take(&mut state.waiters)
        };
        for ctx in waiters {
            ctx.complete(0);
        }
    }

    /// Complete `on_finish` once no op is in progress
    pub fn wait_for_ops(&self, on_finish: Context) {
        {
            let mut state = self.state.lock();
            if state.count > 0 {
                state.waiters.push(on_finish);
                return;
            }
        }
        on_finish.complete(0);
    }

    pub fn is_idle(&self) -> bool {
        self.state.lock().count == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::SaferCond;

    #[test]
    fn test_wait_when_idle() {
        let tracker = AsyncOpTracker::new();
        let cond = SaferCond::new();
        tracker.wait_for_ops(cond.context());
        assert_eq!(cond.try_result(), Some(0));
    }

    #[test]
    fn test_wait_for_in_progress_ops() {
        let tracker = AsyncOpTracker::new();
        tracker.start_op();
        tracker.start_op();
        let cond = SaferCond::new();
        tracker.wait_for_ops(cond.context());

        tracker.finish_op();
        assert_eq!(cond.try_result(), None);
        tracker.finish_op();
        assert_eq!(cond.try_result(), Some(0));
        assert!(tracker.is_idle());
    }
}
