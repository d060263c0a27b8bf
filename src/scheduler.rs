//! Background depth sorting.
//!
//! One worker thread owns the splat buffer and its sorter. The caller posts
//! buffers and views into a single mailbox slot, so at most one view waits
//! while a sort runs and newer views overwrite older ones. Finished frames
//! come back over a channel and the caller picks up the newest without
//! blocking.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{SplatError, SplatResult};
use crate::sort::{DepthSorter, SortOutcome, SortedFrame, SorterConfig, ViewProjection};
use crate::splat::SplatBuffer;

#[derive(Debug)]
pub enum WorkerMessage {
    BufferUpdate(SplatBuffer),
    SortRequest(ViewProjection),
    Shutdown,
}

#[derive(Debug)]
pub struct SortResult {
    /// Which `load` the frame belongs to, starting at 1.
    pub epoch: u64,
    /// Sorts completed for this epoch, including this one.
    pub generation: u64,
    pub frame: SortedFrame,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub requested: u64,
    /// Requests that replaced a view still waiting in the slot.
    pub coalesced: u64,
    pub completed: u64,
    /// Sorts that ran and reported the view unchanged.
    pub skipped: u64,
}

#[derive(Default)]
struct Slot {
    pending_buffer: Option<SplatBuffer>,
    pending_view: Option<ViewProjection>,
    epoch: u64,
    running: bool,
    shutdown: bool,
    exited: bool,
    stats: SchedulerStats,
}

impl Slot {
    fn has_work(&self) -> bool {
        self.shutdown || self.pending_buffer.is_some() || self.pending_view.is_some()
    }
}

#[derive(Default)]
struct Mailbox {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Mailbox {
    fn lock(&self) -> SplatResult<MutexGuard<'_, Slot>> {
        self.slot
            .lock()
            .map_err(|_| SplatError::Transfer("sort mailbox poisoned".into()))
    }
}

/// Marks the worker as gone when its thread exits, including by panic.
struct ExitGuard(Arc<Mailbox>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut slot = self.0.slot.lock().unwrap_or_else(PoisonError::into_inner);
        slot.exited = true;
        slot.running = false;
    }
}

/// Everything the worker knows about the current buffer. Built on the first
/// buffer; later buffers replace it in place.
struct SortWorkerState {
    epoch: u64,
    buffer: SplatBuffer,
    sorter: Box<dyn DepthSorter>,
    generation: u64,
}

impl SortWorkerState {
    fn new(epoch: u64, buffer: SplatBuffer, config: &SorterConfig) -> Self {
        Self {
            epoch,
            buffer,
            sorter: config.build(),
            generation: 0,
        }
    }

    fn replace_buffer(&mut self, epoch: u64, buffer: SplatBuffer) {
        self.epoch = epoch;
        self.buffer = buffer;
        self.generation = 0;
        self.sorter.invalidate();
    }

    fn sort(&mut self, view: &ViewProjection) -> Option<SortResult> {
        assert!(view.is_finite(), "view-projection matrix must be finite: {:?}", view.0);
        let started = Instant::now();
        match self.sorter.sort(&self.buffer, view) {
            SortOutcome::Sorted(frame) => {
                self.generation += 1;
                Some(SortResult {
                    epoch: self.epoch,
                    generation: self.generation,
                    frame,
                    elapsed: started.elapsed(),
                })
            }
            SortOutcome::Unchanged => None,
        }
    }
}

pub struct SortScheduler {
    mailbox: Arc<Mailbox>,
    results: Receiver<SortResult>,
    worker: Option<JoinHandle<()>>,
}

impl SortScheduler {
    pub fn spawn(config: SorterConfig) -> SplatResult<Self> {
        let mailbox = Arc::new(Mailbox::default());
        let (tx, rx) = mpsc::channel();
        let worker_mailbox = Arc::clone(&mailbox);
        let worker = std::thread::Builder::new()
            .name("splat-sort".into())
            .spawn(move || run_worker(worker_mailbox, config, tx))
            .map_err(|e| SplatError::Transfer(format!("could not start sort worker: {e}")))?;
        debug!(strategy = ?config.strategy, "sort worker started");
        Ok(Self {
            mailbox,
            results: rx,
            worker: Some(worker),
        })
    }

    /// Hands `buffer` to the worker. Frames of earlier buffers are dropped
    /// from then on, and the last requested view is sorted again.
    pub fn load(&self, buffer: SplatBuffer) -> SplatResult<()> {
        self.post(WorkerMessage::BufferUpdate(buffer))
    }

    pub fn request_sort(&self, view: ViewProjection) -> SplatResult<()> {
        self.post(WorkerMessage::SortRequest(view))
    }

    fn post(&self, message: WorkerMessage) -> SplatResult<()> {
        let mut slot = self.mailbox.lock()?;
        if slot.exited || slot.shutdown {
            return Err(SplatError::Transfer("sort worker is not running".into()));
        }
        match message {
            WorkerMessage::BufferUpdate(buffer) => {
                slot.epoch += 1;
                debug!(epoch = slot.epoch, splats = buffer.vertex_count(), "posting buffer");
                slot.pending_buffer = Some(buffer);
            }
            WorkerMessage::SortRequest(view) => {
                slot.stats.requested += 1;
                if slot.pending_view.replace(view).is_some() {
                    slot.stats.coalesced += 1;
                    trace!("replaced pending view");
                }
            }
            WorkerMessage::Shutdown => slot.shutdown = true,
        }
        self.mailbox.ready.notify_one();
        Ok(())
    }

    /// Newest frame for the current buffer, if one finished since the last call.
    pub fn poll_frame(&self) -> SplatResult<Option<SortResult>> {
        let epoch = self.mailbox.lock()?.epoch;
        let mut newest = None;
        loop {
            match self.results.try_recv() {
                Ok(result) => newest = keep_newer(newest, result, epoch),
                Err(TryRecvError::Empty) => return Ok(newest),
                Err(TryRecvError::Disconnected) => {
                    return match newest {
                        Some(result) => Ok(Some(result)),
                        None => Err(worker_gone()),
                    }
                }
            }
        }
    }

    /// Like [`poll_frame`](Self::poll_frame) but waits up to `timeout` for a frame.
    pub fn wait_frame(&self, timeout: Duration) -> SplatResult<Option<SortResult>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.poll_frame()? {
                return Ok(Some(result));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match self.results.recv_timeout(remaining) {
                Ok(result) => {
                    let epoch = self.mailbox.lock()?.epoch;
                    if let Some(first) = keep_newer(None, result, epoch) {
                        return self.newest_since(first);
                    }
                }
                Err(RecvTimeoutError::Timeout) => return Ok(None),
                Err(RecvTimeoutError::Disconnected) => return Err(worker_gone()),
            }
        }
    }

    /// `first`, or a newer frame already queued behind it.
    fn newest_since(&self, first: SortResult) -> SplatResult<Option<SortResult>> {
        let later = self.poll_frame()?;
        Ok(Some(later.unwrap_or(first)))
    }

    pub fn stats(&self) -> SplatResult<SchedulerStats> {
        Ok(self.mailbox.lock()?.stats)
    }

    /// No buffer or view is waiting and no sort is running.
    #[cfg(test)]
    fn is_idle(&self) -> SplatResult<bool> {
        let slot = self.mailbox.lock()?;
        Ok(!slot.running && slot.pending_buffer.is_none() && slot.pending_view.is_none())
    }
}

impl Drop for SortScheduler {
    fn drop(&mut self) {
        let _ = self.post(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("sort worker panicked");
            }
        }
    }
}

fn worker_gone() -> SplatError {
    SplatError::Transfer("sort worker exited".into())
}

fn keep_newer(current: Option<SortResult>, candidate: SortResult, epoch: u64) -> Option<SortResult> {
    if candidate.epoch < epoch {
        trace!(stale = candidate.epoch, epoch, "discarding frame from an earlier buffer");
        return current;
    }
    if let Some(prev) = &current {
        trace!(generation = prev.generation, "discarding superseded frame");
    }
    Some(candidate)
}

fn run_worker(mailbox: Arc<Mailbox>, config: SorterConfig, results: Sender<SortResult>) {
    let _guard = ExitGuard(Arc::clone(&mailbox));
    let mut state: Option<SortWorkerState> = None;
    let mut last_view: Option<ViewProjection> = None;

    loop {
        let (buffer, view) = {
            let Ok(mut slot) = mailbox.slot.lock() else { return };
            while !slot.has_work() {
                slot = match mailbox.ready.wait(slot) {
                    Ok(slot) => slot,
                    Err(_) => return,
                };
            }
            if slot.shutdown {
                debug!("sort worker shutting down");
                return;
            }
            let buffer = slot.pending_buffer.take().map(|b| (slot.epoch, b));
            let view = slot.pending_view.take();
            slot.running = state.is_some() || buffer.is_some();
            (buffer, view)
        };

        if let Some((epoch, buffer)) = buffer {
            debug!(epoch, splats = buffer.vertex_count(), "sort worker took new buffer");
            if let Some(current) = state.as_mut() {
                current.replace_buffer(epoch, buffer);
            } else {
                state = Some(SortWorkerState::new(epoch, buffer, &config));
            }
        }
        if view.is_some() {
            last_view = view;
        }

        let mut completed = false;
        let mut ran = false;
        if let (Some(state), Some(view)) = (state.as_mut(), last_view.as_ref()) {
            ran = true;
            if let Some(result) = state.sort(view) {
                trace!(epoch = result.epoch, generation = result.generation, elapsed = ?result.elapsed, "sorted");
                if results.send(result).is_err() {
                    return;
                }
                completed = true;
            }
        }

        let Ok(mut slot) = mailbox.slot.lock() else { return };
        slot.running = false;
        if completed {
            slot.stats.completed += 1;
        } else if ran {
            slot.stats.skipped += 1;
        }
    }
}
