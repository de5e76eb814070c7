//! Internal completion handles

use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Single-shot completion carrying a status code
///
/// Consumed by [`Context::complete`], so it can only ever fire once.
pub struct Context {
    callback: Box<dyn FnOnce(i32) + Send>,
}

impl Context {
    pub fn new(callback: impl FnOnce(i32) + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    /// Context that ignores its status
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub fn complete(self, r: i32) {
        (self.callback)(r);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context").finish_non_exhaustive()
    }
}

struct GatherState {
    pending: usize,
    r: i32,
    activated: bool,
    on_finish: Option<Context>,
}

/// Completes a parent context once every sub-context has completed
///
/// The first negative status wins. Sub-contexts may complete before
/// [`Gather::activate`]; the parent only fires after activation.
pub struct Gather {
    state: Arc<Mutex<GatherState>>,
}

impl Gather {
    pub fn new(on_finish: Context) -> Self {
        Self {
            state: Arc::new(Mutex::new(GatherState {
                pending: 0,
                r: 0,
                activated: false,
                on_finish: Some(on_finish),
            })),
        }
    }

    /// Create a sub-context the parent waits for
    pub fn new_sub(&self) -> Context {
        self.state.lock().pending += 1;
        let state = self.state.clone();
        Context::new(move |r| Self::finish_one(&state, r, true))
    }

    /// Stop accepting sub-contexts and fire once all have completed
    pub fn activate(self) {
        Self::finish_one(&self.state, 0, false);
    }

    fn finish_one(state: &Mutex<GatherState>, r: i32, sub: bool) {
        let ready = {
            let mut state = state.lock();
            if sub {
                state.pending -= 1;
            } else {
                state.activated = true;
            }
            if r < 0 && state.r == 0 {
                state.r = r;
            }
            if state.activated && state.pending == 0 {
                state.on_finish.take().map(|ctx| (ctx, state.r))
            } else {
                None
            }
        };
        if let Some((ctx, r)) = ready {
            ctx.complete(r);
        }
    }
}

/// Blocking waiter for a single completion
///
/// Used by synchronous administrative calls. Must not be waited on from an
/// engine thread.
#[derive(Clone, Default)]
pub struct SaferCond {
    inner: Arc<(Mutex<Option<i32>>, Condvar)>,
}

impl SaferCond {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that wakes the waiter
    pub fn context(&self) -> Context {
        let inner = self.inner.clone();
        Context::new(move |r| {
            let (result, cond) = &*inner;
            *result.lock() = Some(r);
            cond.notify_all();
        })
    }

    /// Block until completed and return the status
    pub fn wait(&self) -> i32 {
        let (result, cond) = &*self.inner;
        let mut result = result.lock();
        loop {
            if let Some(r) = *result {
                return r;
            }
            cond.wait(&mut result);
        }
    }

    /// Block for at most `timeout`
    pub fn wait_timeout(&self, timeout: Duration) -> Option<i32> {
        let (result, cond) = &*self.inner;
        let mut result = result.lock();
        if result.is_none() {
            cond.wait_for(&mut result, timeout);
        }
        *result
    }

    /// Status if already completed
    pub fn try_result(&self) -> Option<i32> {
        *self.inner.0.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_context_completes_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let ctx = Context::new(move |r| seen2.lock().push(r));
        ctx.complete(-5);
        assert_eq!(*seen.lock(), vec![-5]);
    }

    #[test]
    fn test_gather_first_error_wins() {
        let cond = SaferCond::new();
        let gather = Gather::new(cond.context());
        let a = gather.new_sub();
        let b = gather.new_sub();
        let c = gather.new_sub();
        a.complete(0);
        b.complete(-libc::EIO);
        gather.activate();
        assert_eq!(cond.try_result(), None);
        c.complete(-libc::EINVAL);
        assert_eq!(cond.try_result(), Some(-libc::EIO));
    }

    #[test]
    fn test_gather_without_subs() {
        let cond = SaferCond::new();
        Gather::new(cond.context()).activate();
        assert_eq!(cond.try_result(), Some(0));
    }

    #[test]
    fn test_safer_cond_across_threads() {
        let cond = SaferCond::new();
        let ctx = cond.context();
        let handle = thread::spawn(move || ctx.complete(7));
        assert_eq!(cond.wait(), 7);
        handle.join().unwrap();
    }

    #[test]
    fn test_safer_cond_timeout() {
        let cond = SaferCond::new();
        assert_eq!(cond.wait_timeout(Duration::from_millis(5)), None);
    }
}
