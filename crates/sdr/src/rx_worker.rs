use std::sync::Arc;

use crossbeam::channel::{Sender, TrySendError};
use tl_dsp::Decimator;

use crate::error::SdrError;
use crate::port::{BufferHandle, HardwarePort};
use crate::worker::{StreamLoop, WorkerControl};
use crate::SampleBuf;

/// Hardware buffer -> decimator -> downstream queue.
pub(crate) struct RxLoop {
    port: Arc<dyn HardwarePort>,
    buffer: BufferHandle,
    queue: Sender<SampleBuf>,
    decimator: Decimator,
    raw: Vec<i16>,
}

impl RxLoop {
    pub(crate) fn new(port: Arc<dyn HardwarePort>, buffer: BufferHandle, queue: Sender<SampleBuf>, input_bits: u32) -> Self {
        let raw = vec![0i16; buffer.samples * 2];
        Self {
            port,
            buffer,
            queue,
            decimator: Decimator::new(input_bits),
            raw,
        }
    }
}

impl StreamLoop for RxLoop {
    fn run(&mut self, control: &WorkerControl) {
        let requested = self.buffer.samples;
        while control.is_running() {
            let log2 = control.log2();
            let placement = control.placement();

            match self.port.receive(&self.buffer, &mut self.raw) {
                Ok(n) if n >= requested => {}
                Ok(n) => {
                    control.shortfall(&SdrError::TransferShortfall {
                        requested,
                        transferred: n,
                    });
                    continue;
                }
                Err(e) => {
                    control.shortfall(&e);
                    continue;
                }
            }

            let mut data = Vec::with_capacity((requested >> log2) * 2);
            self.decimator.process(log2, placement, &self.raw, &mut data);
            let buf = SampleBuf::from_interleaved(data);
            let num_samples = buf.num_samples;

            match self.queue.try_send(buf) {
                Ok(()) => control.block_done(num_samples),
                Err(TrySendError::Full(_)) => control.block_dropped(),
                Err(TrySendError::Disconnected(_)) => {
                    log::info!("rx consumer gone, leaving stream loop");
                    break;
                }
            }
        }
    }
}
