//! Background cleaning pool.
//!
//! One coordinator thread watches the thresholds and picks the next pass;
//! `merge_threads` workers drain the shared bucket queue by running the
//! rewrite operation. The coordinator advances the erase pointer only
//! after a reclamation pass fully drains, so no live bucket is ever left
//! inside a reclaimed erase unit.
//!
//! Pass priority, highest first: urgent cold reclamation, urgent hot
//! reclamation, log flush, opportunistic cold reclamation.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::{CleaningState, Core, MoveMode};
use crate::types::BucketId;

struct WorkState {
    queue: VecDeque<BucketId>,
    mode: MoveMode,
    active: usize,
    kill: bool,
}

struct Shared {
    state: Mutex<WorkState>,
    work_cv: Condvar,
    done_cv: Condvar,
}

pub(crate) struct Cleaner {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl Cleaner {
    pub(crate) fn spawn(core: Arc<Core>, workers: usize, poll: Duration) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(WorkState {
                queue: VecDeque::new(),
                mode: MoveMode::LogFlush,
                active: 0,
                kill: false,
            }),
            work_cv: Condvar::new(),
            done_cv: Condvar::new(),
        });

        let mut threads = Vec::with_capacity(workers + 1);
        for i in 0..workers {
            let core = core.clone();
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name(format!("kangaroo-merge-{i}"))
                .spawn(move || worker_loop(core, shared))
                .expect("failed to spawn merge worker");
            threads.push(handle);
        }
        {
            let shared = shared.clone();
            let handle = thread::Builder::new()
                .name("kangaroo-cleaner".to_string())
                .spawn(move || coordinator_loop(core, shared, poll))
                .expect("failed to spawn cleaner coordinator");
            threads.push(handle);
        }
        Self { shared, threads }
    }

    /// Signal every thread and join them. Workers finish the bucket they
    /// are on; queued work is abandoned.
    pub(crate) fn shutdown(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.kill = true;
        }
        self.shared.work_cv.notify_all();
        self.shared.done_cv.notify_all();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                tracing::error!("cleaner thread panicked during shutdown");
            }
        }
    }
}

fn worker_loop(core: Arc<Core>, shared: Arc<Shared>) {
    loop {
        let (bid, mode) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                // Kill wins over queued work: a worker finishes the
                // bucket it is on and never picks up another.
                if state.kill {
                    return;
                }
                if let Some(bid) = state.queue.pop_front() {
                    state.active += 1;
                    break (bid, state.mode);
                }
                state = shared.work_cv.wait(state).unwrap();
            }
        };

        if let Err(e) = core.move_bucket(bid, mode) {
            tracing::warn!(bucket = bid.index(), ?mode, error = %e, "bucket move failed");
        }

        let mut state = shared.state.lock().unwrap();
        state.active -= 1;
        if state.queue.is_empty() && state.active == 0 {
            shared.done_cv.notify_all();
        }
    }
}

fn coordinator_loop(core: Arc<Core>, shared: Arc<Shared>, poll: Duration) {
    loop {
        if shared.state.lock().unwrap().kill {
            return;
        }
        if core.should_gc_cold(core.gc_upper_threshold()) {
            run_gc(&core, &shared, MoveMode::ColdGc);
        } else if core.should_gc_hot(core.gc_upper_threshold()) {
            run_gc(&core, &shared, MoveMode::HotGc);
        } else if core.should_flush_log() {
            run_log_flush(&core, &shared);
        } else if core.should_gc_cold(core.gc_lower_threshold()) {
            run_gc(&core, &shared, MoveMode::ColdGc);
        } else {
            // Interruptible sleep: shutdown signals the condvar.
            let state = shared.state.lock().unwrap();
            let _ = shared
                .work_cv
                .wait_timeout_while(state, poll, |s| !s.kill)
                .unwrap();
        }
    }
}

/// Enqueue a pass and wait for the workers to drain it. Returns false
/// when shutdown interrupted the pass.
fn dispatch_and_drain(shared: &Shared, bids: Vec<BucketId>, mode: MoveMode) -> bool {
    let mut state = shared.state.lock().unwrap();
    state.mode = mode;
    state.queue.extend(bids);
    shared.work_cv.notify_all();
    let state = shared
        .done_cv
        .wait_while(state, |s| {
            !s.kill && !(s.queue.is_empty() && s.active == 0)
        })
        .unwrap();
    state.queue.is_empty() && state.active == 0
}

fn run_gc(core: &Arc<Core>, shared: &Arc<Shared>, mode: MoveMode) {
    let state = match mode {
        MoveMode::HotGc => CleaningState::HotGc,
        _ => CleaningState::ColdGc,
    };
    core.set_cleaning_state(state);
    let bids = core.gc_candidates(mode);
    tracing::debug!(buckets = bids.len(), ?mode, "starting zone reclamation");
    let drained = dispatch_and_drain(shared, bids, mode);
    if drained {
        if let Err(e) = core.finish_gc(mode) {
            tracing::error!(?mode, error = %e, "failed to reclaim erase unit");
        }
    }
    core.set_cleaning_state(CleaningState::Idle);
}

fn run_log_flush(core: &Arc<Core>, shared: &Arc<Shared>) {
    core.set_cleaning_state(CleaningState::LogFlush);
    let bids = core.flush_candidates();
    tracing::debug!(buckets = bids.len(), "starting log flush");
    let drained = dispatch_and_drain(shared, bids, MoveMode::LogFlush);
    if drained {
        core.note_log_flush_pass();
    }
    core.set_cleaning_state(CleaningState::Idle);
}
