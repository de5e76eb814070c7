//! Flush ordering against in-flight writes by tid

use crate::completion::Context;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Default)]
struct FlushState {
    in_flight: BTreeSet<u64>,
    /// Flushes keyed by their own tid
    flushes: BTreeMap<u64, Vec<Context>>,
}

/// Holds flushes until every write with a lower tid has completed
#[derive(Default)]
pub struct FlushTracker {
    state: Mutex<FlushState>,
}

impl FlushTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_io(&self, tid: u64) {
        self.state.lock().in_flight.insert(tid);
    }

    pub fn finish_io(&self, tid: u64) {
        let ready = {
            let mut state = self.state.lock();
            state.in_flight.remove(&tid);
            // flushes older than the oldest remaining write are released
            let split = state.in_flight.first().copied().unwrap_or(u64::MAX);
            let pending = state.flushes.split_off(&split);
            std::mem::replace(&mut state.flushes, pending)
        };
        for ctx in ready.into_values().flatten() {
            ctx.complete(0);
        }
    }

    /// Complete `ctx` once all writes issued before `flush_tid` completed
    pub fn flush(&self, flush_tid: u64, ctx: Context) {
        {
            let mut state = self.state.lock();
            if state.in_flight.range(..flush_tid).next().is_some() {
                state.flushes.entry(flush_tid).or_default().push(ctx);
                return;
            }
        }
        ctx.complete(0);
    }

    /// Release every parked flush
    pub fn shut_down(&self) {
        let flushes = std::mem::take(&mut self.state.lock().flushes);
        for ctx in flushes.into_values().flatten() {
            ctx.complete(0);
        }
    }

    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight.len()
    }
}
