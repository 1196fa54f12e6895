use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};
use tl_dsp::Interpolator;

use crate::error::SdrError;
use crate::port::{BufferHandle, HardwarePort};
use crate::worker::{StreamLoop, WorkerControl};
use crate::SampleBuf;

/// Upstream queue -> interpolator -> hardware buffer.
pub(crate) struct TxLoop {
    port: Arc<dyn HardwarePort>,
    buffer: BufferHandle,
    queue: Receiver<SampleBuf>,
    interpolator: Interpolator,
    poll_interval: Duration,
    /// Host-rate samples received but not yet sent, interleaved
    pending: Vec<i16>,
    block: Vec<i16>,
    out: Vec<i16>,
}

impl TxLoop {
    pub(crate) fn new(
        port: Arc<dyn HardwarePort>,
        buffer: BufferHandle,
        queue: Receiver<SampleBuf>,
        output_bits: u32,
        poll_interval: Duration,
    ) -> Self {
        Self {
            port,
            buffer,
            queue,
            interpolator: Interpolator::new(output_bits),
            poll_interval,
            pending: Vec::new(),
            block: Vec::new(),
            out: Vec::new(),
        }
    }

    /// Gather `needed` interleaved values into `self.block`. Returns false if
    /// the block had to be padded with silence.
    fn fill(&mut self, needed: usize) -> bool {
        self.block.clear();
        let take = needed.min(self.pending.len());
        self.block.extend(self.pending.drain(..take));

        let deadline = Instant::now() + self.poll_interval;
        while self.block.len() < needed {
            let wait = deadline.saturating_duration_since(Instant::now());
            match self.queue.recv_timeout(wait) {
                Ok(buf) => {
                    let want = needed - self.block.len();
                    if buf.data.len() > want {
                        self.block.extend_from_slice(&buf.data[..want]);
                        self.pending.extend_from_slice(&buf.data[want..]);
                    } else {
                        self.block.extend_from_slice(&buf.data);
                    }
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {
                    self.block.resize(needed, 0);
                    return false;
                }
            }
        }
        true
    }
}

impl StreamLoop for TxLoop {
    fn run(&mut self, control: &WorkerControl) {
        let requested = self.buffer.samples;
        while control.is_running() {
            let log2 = control.log2();
            let placement = control.placement();
            let host_samples = requested >> log2;

            if !self.fill(host_samples * 2) {
                control.underflow();
            }
            self.interpolator.process(log2, placement, &self.block, &mut self.out);

            match self.port.transmit(&self.buffer, &self.out) {
                Ok(n) if n >= requested => control.block_done(host_samples),
                Ok(n) => control.shortfall(&SdrError::TransferShortfall {
                    requested,
                    transferred: n,
                }),
                Err(e) => control.shortfall(&e),
            }
        }
    }
}
