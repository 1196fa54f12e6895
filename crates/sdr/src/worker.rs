use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tl_dsp::Placement;

use crate::error::{Result, SdrError};
use crate::{lock, Side};

/// Body of a streaming thread. Runs until `control.is_running()` goes false.
pub(crate) trait StreamLoop: Send + 'static {
    fn run(&mut self, control: &WorkerControl);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Exited,
}

/// Counters published by a worker thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkerStats {
    /// Blocks moved to or from the hardware in full
    pub blocks: u64,
    /// Host-rate complex samples delivered (Rx) or consumed (Tx)
    pub samples: u64,
    pub shortfalls: u64,
    pub consecutive_shortfalls: u32,
    pub max_consecutive_shortfalls: u32,
    /// Rx blocks dropped on a full downstream queue
    pub dropped: u64,
    /// Tx blocks padded with silence
    pub underflows: u64,
    pub degraded: bool,
}

#[derive(Default)]
struct Counters {
    blocks: AtomicU64,
    samples: AtomicU64,
    shortfalls: AtomicU64,
    consecutive: AtomicU32,
    max_consecutive: AtomicU32,
    dropped: AtomicU64,
    underflows: AtomicU64,
    degraded: AtomicBool,
}

/// State shared between a worker thread and its controller.
pub struct WorkerControl {
    side: Side,
    running: AtomicBool,
    log2: AtomicU32,
    placement: AtomicU8,
    phase: Mutex<Phase>,
    cond: Condvar,
    counters: Counters,
    degraded_after: u32,
    backoff: Duration,
}

impl WorkerControl {
    fn new(side: Side, log2: u32, placement: Placement, degraded_after: u32, backoff: Duration) -> Self {
        Self {
            side,
            running: AtomicBool::new(false),
            log2: AtomicU32::new(log2),
            placement: AtomicU8::new(placement.as_u8()),
            phase: Mutex::new(Phase::Idle),
            cond: Condvar::new(),
            counters: Counters::default(),
            degraded_after,
            backoff,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn log2(&self) -> u32 {
        self.log2.load(Ordering::Relaxed)
    }

    pub fn placement(&self) -> Placement {
        Placement::from_u8(self.placement.load(Ordering::Relaxed))
    }

    fn set_phase(&self, phase: Phase) {
        *lock(&self.phase) = phase;
        self.cond.notify_all();
    }

    pub(crate) fn block_done(&self, host_samples: usize) {
        let c = &self.counters;
        let streak = c.consecutive.swap(0, Ordering::Relaxed);
        if c.degraded.swap(false, Ordering::Relaxed) {
            log::info!("{} stream recovered after {} short transfers", self.side, streak);
        }
        c.blocks.fetch_add(1, Ordering::Relaxed);
        c.samples.fetch_add(host_samples as u64, Ordering::Relaxed);
    }

    pub(crate) fn block_dropped(&self) {
        let n = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % 100 == 0 {
            log::warn!("{} downstream queue full, {} blocks dropped", self.side, n);
        }
    }

    pub(crate) fn underflow(&self) {
        self.counters.underflows.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a short or failed transfer and back off before the next one.
    pub(crate) fn shortfall(&self, err: &SdrError) {
        let c = &self.counters;
        c.shortfalls.fetch_add(1, Ordering::Relaxed);
        let streak = c.consecutive.fetch_add(1, Ordering::Relaxed) + 1;
        c.max_consecutive.fetch_max(streak, Ordering::Relaxed);

        if streak >= self.degraded_after {
            if !c.degraded.swap(true, Ordering::Relaxed) {
                log::warn!("{} stream degraded: {} consecutive short transfers ({})", self.side, streak, err);
            }
        } else {
            log::debug!("{} transfer: {}", self.side, err);
        }
        thread::sleep(self.backoff);
    }

    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            blocks: c.blocks.load(Ordering::Relaxed),
            samples: c.samples.load(Ordering::Relaxed),
            shortfalls: c.shortfalls.load(Ordering::Relaxed),
            consecutive_shortfalls: c.consecutive.load(Ordering::Relaxed),
            max_consecutive_shortfalls: c.max_consecutive.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            underflows: c.underflows.load(Ordering::Relaxed),
            degraded: c.degraded.load(Ordering::Relaxed),
        }
    }
}

/// Marks the thread exited even if the loop body panics.
struct ExitSignal<'a>(&'a WorkerControl);

impl Drop for ExitSignal<'_> {
    fn drop(&mut self) {
        self.0.set_phase(Phase::Exited);
    }
}

type LoopBox = Box<dyn StreamLoop>;

/// One streaming thread bound to a hardware buffer and a sample queue.
///
/// The loop state survives stop/start so a suspended worker resumes with its
/// filter history and queue endpoint intact.
pub struct StreamingWorker {
    name: String,
    control: Arc<WorkerControl>,
    body: Mutex<Option<LoopBox>>,
    thread: Mutex<Option<JoinHandle<LoopBox>>>,
}

impl StreamingWorker {
    pub(crate) fn new(
        side: Side,
        name: String,
        body: LoopBox,
        log2: u32,
        placement: Placement,
        degraded_after: u32,
        backoff: Duration,
    ) -> Self {
        Self {
            name,
            control: Arc::new(WorkerControl::new(side, log2, placement, degraded_after, backoff)),
            body: Mutex::new(Some(body)),
            thread: Mutex::new(None),
        }
    }

    pub fn side(&self) -> Side {
        self.control.side
    }

    pub fn is_running(&self) -> bool {
        lock(&self.thread).is_some() && self.control.is_running()
    }

    pub fn stats(&self) -> WorkerStats {
        self.control.stats()
    }

    /// Takes effect at the top of the next buffer.
    pub fn set_log2(&self, log2: u32) {
        self.control.log2.store(log2, Ordering::Relaxed);
    }

    pub fn set_placement(&self, placement: Placement) {
        self.control.placement.store(placement.as_u8(), Ordering::Relaxed);
    }

    /// Spawn the thread and wait until it has entered its run loop.
    /// No-op while running.
    pub fn start(&self, timeout: Duration) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_some() {
            if self.control.is_running() {
                return Ok(());
            }
            // A previous stop timed out. If the thread has not left yet,
            // withdraw the exit request; it checks under the phase lock.
            {
                let phase = lock(&self.control.phase);
                if *phase != Phase::Exited {
                    self.control.running.store(true, Ordering::SeqCst);
                    log::debug!("{} kept running", self.name);
                    return Ok(());
                }
            }
            self.reap(&mut thread, timeout)?;
        }

        let mut body = lock(&self.body)
            .take()
            .ok_or_else(|| SdrError::Backend(format!("{}: loop state lost", self.name)))?;

        *lock(&self.control.phase) = Phase::Idle;
        self.control.running.store(true, Ordering::SeqCst);

        let control = self.control.clone();
        let handle = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || {
                let _exit = ExitSignal(&control);
                control.set_phase(Phase::Running);
                loop {
                    body.run(&control);
                    let mut phase = lock(&control.phase);
                    if !control.is_running() {
                        *phase = Phase::Exited;
                        control.cond.notify_all();
                        break;
                    }
                }
                body
            })
            .map_err(|e| {
                self.control.running.store(false, Ordering::SeqCst);
                SdrError::Backend(format!("spawn {}: {}", self.name, e))
            })?;

        let phase = self
            .control
            .cond
            .wait_while(lock(&self.control.phase), |p| *p == Phase::Idle)
            .unwrap_or_else(PoisonError::into_inner);
        drop(phase);

        *thread = Some(handle);
        log::debug!("{} started", self.name);
        Ok(())
    }

    /// Ask the thread to leave its loop and join it. No-op while stopped.
    ///
    /// Fails with `SuspendTimeout` if the thread is still inside a transfer
    /// after `timeout`; it keeps its exit request and is joined later.
    pub fn stop(&self, timeout: Duration) -> Result<()> {
        let mut thread = lock(&self.thread);
        if thread.is_none() {
            return Ok(());
        }
        self.control.running.store(false, Ordering::SeqCst);
        self.reap(&mut thread, timeout)?;
        log::debug!("{} stopped", self.name);
        Ok(())
    }

    fn reap(&self, thread: &mut Option<JoinHandle<LoopBox>>, timeout: Duration) -> Result<()> {
        let (phase, wait) = self
            .control
            .cond
            .wait_timeout_while(lock(&self.control.phase), timeout, |p| *p != Phase::Exited)
            .unwrap_or_else(PoisonError::into_inner);
        drop(phase);
        if wait.timed_out() {
            return Err(SdrError::SuspendTimeout {
                side: self.control.side,
                waited: timeout,
            });
        }

        if let Some(handle) = thread.take() {
            match handle.join() {
                Ok(body) => *lock(&self.body) = Some(body),
                Err(_) => log::error!("{} thread panicked", self.name),
            }
        }
        Ok(())
    }
}

impl Drop for StreamingWorker {
    fn drop(&mut self) {
        self.control.running.store(false, Ordering::SeqCst);
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}
