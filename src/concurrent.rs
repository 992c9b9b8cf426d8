//! Concurrent marking tasks.
//!
//! Workers share exactly two things with the mutator: the scanning loop and
//! the bailout channel. They pop from the main channel only, hand anything
//! they cannot safely finish (progress-bar arrays) back through the bailout
//! channel, and publish scanned bytes over a channel that mutator steps
//! drain into the ahead-of-schedule credit. Lifecycle transitions never run
//! here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};

use crate::marker::IncrementalMarker;
use crate::object::HeapObject;
use crate::page::PageFlags;

/// Workers publish progress in batches of roughly this many bytes.
const PROGRESS_BATCH_BYTES: usize = 64 * 1024;

/// Handle to the concurrent marker worker pool.
pub struct ConcurrentMarking {
    pool: Option<rayon::ThreadPool>,
    pending_tasks: Arc<AtomicUsize>,
    progress_tx: Sender<usize>,
    progress_rx: Receiver<usize>,
    workers: usize,
}

impl ConcurrentMarking {
    pub fn new(workers: usize, enabled: bool) -> ConcurrentMarking {
        let pool = enabled.then(|| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(workers)
                .thread_name(|index| format!("gc-marker-{index}"))
                .build()
                .expect("failed to build concurrent marking pool")
        });
        let (progress_tx, progress_rx) = flume::unbounded();
        ConcurrentMarking {
            pool,
            pending_tasks: Arc::new(AtomicUsize::new(0)),
            progress_tx,
            progress_rx,
            workers,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    pub fn pending_tasks(&self) -> usize {
        self.pending_tasks.load(Ordering::Acquire)
    }

    /// Sum of worker progress published since the last drain, in bytes.
    pub fn drain_progress(&self) -> usize {
        self.progress_rx.try_iter().sum()
    }

    /// Spawn one scanning task per worker.
    pub fn schedule_tasks(&self, marker: &Arc<IncrementalMarker>) {
        let Some(pool) = &self.pool else {
            return;
        };
        for _ in 0..self.workers {
            self.spawn_task(pool, marker);
        }
    }

    /// Called at the end of every step: if work remains and no task is
    /// running, put one back.
    pub fn reschedule_tasks_if_needed(&self, marker: &Arc<IncrementalMarker>) {
        let Some(pool) = &self.pool else {
            return;
        };
        if marker.is_marking()
            && !marker.worklist().is_empty()
            && self.pending_tasks() == 0
        {
            self.spawn_task(pool, marker);
        }
    }

    fn spawn_task(&self, pool: &rayon::ThreadPool, marker: &Arc<IncrementalMarker>) {
        let marker = Arc::clone(marker);
        let pending = Arc::clone(&self.pending_tasks);
        let progress = self.progress_tx.clone();
        pending.fetch_add(1, Ordering::AcqRel);
        pool.spawn(move || {
            run_marking_task(&marker, &progress);
            pending.fetch_sub(1, Ordering::AcqRel);
        });
    }

    /// Test support: block until every spawned task has drained out.
    pub fn wait_for_idle(&self) {
        while self.pending_tasks() != 0 {
            std::thread::yield_now();
        }
    }
}

fn run_marking_task(marker: &Arc<IncrementalMarker>, progress: &Sender<usize>) {
    let mut batch = 0usize;
    loop {
        if !marker.is_marking() {
            break;
        }
        let Some(obj) = marker.worklist().pop_main() else {
            break;
        };
        if marker.heap().is_filler(obj) {
            continue;
        }
        let page = marker.heap().page_of_object(obj);
        if page.is_flag_set(PageFlags::HAS_PROGRESS_BAR) {
            // Progress-bar scanning mutates per-page state the mutator owns;
            // hand the array back.
            marker.worklist().push_bailout(obj);
            continue;
        }
        let map = HeapObject::new(obj).map();
        batch += marker.visit_object(map, obj);
        if batch >= PROGRESS_BATCH_BYTES {
            let _ = progress.send(batch);
            batch = 0;
        }
    }
    if batch > 0 {
        let _ = progress.send(batch);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_pool_is_inert() {
        let concurrent = ConcurrentMarking::new(4, false);
        assert!(!concurrent.is_enabled());
        assert_eq!(concurrent.pending_tasks(), 0);
        assert_eq!(concurrent.drain_progress(), 0);
    }

    #[test]
    fn progress_channel_accumulates() {
        let concurrent = ConcurrentMarking::new(1, true);
        concurrent.progress_tx.send(1000).unwrap();
        concurrent.progress_tx.send(234).unwrap();
        assert_eq!(concurrent.drain_progress(), 1234);
        assert_eq!(concurrent.drain_progress(), 0);
    }
}
