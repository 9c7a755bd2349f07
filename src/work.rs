//! The pending-work queue and its synchronization.
//!
//! All background activity (erasing, wear-leveling moves, consolidation) is
//! expressed as [`Work`] items on a single queue, drained in order by one
//! consumer thread. Callers that need to synchronize hold a clone of the
//! `Arc<Work>` as a completion handle and block on it; the engine itself
//! never blocks while holding its queue lock.
//!
//! The queue knows nothing about what a work *does*; execution and the
//! shutdown cleanup of drained works live with the device, which owns the
//! consumer loop.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::Error;

/// What a queued work will do when the consumer reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkKind {
    /// One wear-leveling (or scrubbing) move.
    WearLevel { anchor: bool },
    /// Erase one PEB and return it to the free pool.
    Erase { pnum: u32, torture: bool },
    /// One consolidation cycle.
    Consolidate,
}

/// A unit of background work plus its completion cell.
#[derive(Debug)]
pub(crate) struct Work {
    pub kind: WorkKind,
    result: Mutex<Option<Result<(), Error>>>,
    done: Condvar,
}

impl Work {
    pub fn new(kind: WorkKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            result: Mutex::new(None),
            done: Condvar::new(),
        })
    }

    /// Block until the work has run (or was drained at shutdown).
    pub fn wait(&self) -> Result<(), Error> {
        let mut result = self.result.lock();
        while result.is_none() {
            self.done.wait(&mut result);
        }
        result.clone().unwrap()
    }

    /// Record the outcome and wake every waiter.
    pub fn complete(&self, res: Result<(), Error>) {
        let mut result = self.result.lock();
        debug_assert!(result.is_none());
        *result = Some(res);
        self.done.notify_all();
    }
}

struct EngineState {
    queue: VecDeque<Arc<Work>>,
    /// The work currently being executed by the consumer, already popped.
    cur: Option<Arc<Work>>,
    suspended: bool,
    enabled: bool,
    stopping: bool,
}

/// Single-consumer work queue with suspend/flush/shutdown support.
pub(crate) struct WorkEngine {
    state: Mutex<EngineState>,
    wake: Condvar,
}

impl WorkEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(EngineState {
                queue: VecDeque::new(),
                cur: None,
                suspended: false,
                enabled: true,
                stopping: false,
            }),
            wake: Condvar::new(),
        }
    }

    /// Append a work. Fails (returning the work back) once the engine has
    /// been disabled or is stopping; the caller then owns completion.
    pub fn schedule(&self, wrk: Arc<Work>) -> Result<(), Arc<Work>> {
        let mut st = self.state.lock();
        if !st.enabled || st.stopping {
            return Err(wrk);
        }
        st.queue.push_back(wrk);
        self.wake.notify_all();
        Ok(())
    }

    /// Consumer side: block until a work is runnable, pop it and mark it
    /// current. Returns `None` once the engine is stopping.
    pub fn next(&self, ro_mode: &AtomicBool) -> Option<Arc<Work>> {
        let mut st = self.state.lock();
        loop {
            if st.stopping {
                return None;
            }
            if st.enabled && !st.suspended && !ro_mode.load(Ordering::Relaxed) {
                if let Some(wrk) = st.queue.pop_front() {
                    st.cur = Some(Arc::clone(&wrk));
                    return Some(wrk);
                }
            }
            self.wake.wait(&mut st);
        }
    }

    /// Consumer side: record the outcome of the current work and signal its
    /// waiters.
    pub fn finish(&self, wrk: &Arc<Work>, res: Result<(), Error>) {
        {
            let mut st = self.state.lock();
            debug_assert!(st
                .cur
                .as_ref()
                .is_some_and(|cur| Arc::ptr_eq(cur, wrk)));
            st.cur = None;
        }
        wrk.complete(res);
    }

    /// Pause consumption and wait for the in-flight work (if any) to finish,
    /// so callers can take a consistent snapshot of the engine's side
    /// effects.
    pub fn suspend(&self) {
        let cur = {
            let mut st = self.state.lock();
            st.suspended = true;
            st.cur.clone()
        };
        if let Some(wrk) = cur {
            let _ = wrk.wait();
        }
    }

    pub fn resume(&self) {
        self.state.lock().suspended = false;
        self.wake.notify_all();
    }

    /// Wait for the currently running work, or the head of the queue if
    /// nothing is running. Returns whether that work completed successfully;
    /// `false` when there was nothing to join.
    pub fn join_one(&self) -> bool {
        let wrk = {
            let st = self.state.lock();
            st.cur.clone().or_else(|| st.queue.front().cloned())
        };
        match wrk {
            Some(wrk) => wrk.wait().is_ok(),
            None => false,
        }
    }

    /// Block until everything submitted so far (including works submitted by
    /// works) has completed. Reports the last failure seen, if any.
    pub fn flush(&self) -> Result<(), Error> {
        let mut ret = Ok(());
        loop {
            let wrk = {
                let st = self.state.lock();
                st.queue.back().cloned().or_else(|| st.cur.clone())
            };
            match wrk {
                Some(wrk) => {
                    if let Err(err) = wrk.wait() {
                        ret = Err(err);
                    }
                }
                None => return ret,
            }
        }
    }

    pub fn pending(&self) -> usize {
        let st = self.state.lock();
        st.queue.len() + usize::from(st.cur.is_some())
    }

    /// Refuse further submissions.
    pub fn disable(&self) {
        self.state.lock().enabled = false;
    }

    /// Ask the consumer loop to exit.
    pub fn stop(&self) {
        self.state.lock().stopping = true;
        self.wake.notify_all();
    }

    /// Remove and return every queued work, for shutdown draining.
    pub fn drain(&self) -> Vec<Arc<Work>> {
        self.state.lock().queue.drain(..).collect()
    }
}
