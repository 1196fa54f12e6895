use crate::error::Result;
use crate::ident::DeviceId;
use crate::Side;

/// Open hardware connection, as issued by a [`HardwarePort`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortHandle(pub u64);

/// DMA-style sample buffer bound to one side of an open handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferHandle {
    pub id: u64,
    pub handle: PortHandle,
    pub side: Side,
    /// Complex samples per transfer
    pub samples: usize,
}

/// Hardware access used by the streaming core.
///
/// Attribute keys are the logical names in [`crate::attr`]; each backend
/// translates them to its own controls. Transfers block until the hardware
/// has filled or drained one buffer and are never cancelled.
pub trait HardwarePort: Send + Sync {
    /// Short backend name for logs.
    fn name(&self) -> &'static str;

    fn open(&self, id: &DeviceId) -> Result<PortHandle>;

    fn close(&self, handle: PortHandle);

    fn read_attribute(&self, handle: PortHandle, key: &str) -> Result<String>;

    fn write_attribute(&self, handle: PortHandle, key: &str, value: &str) -> Result<()>;

    fn allocate_buffer(&self, handle: PortHandle, samples: usize, side: Side) -> Result<BufferHandle>;

    fn free_buffer(&self, buffer: &BufferHandle);

    /// Blocking Rx transfer into interleaved I/Q. Returns complex samples read.
    fn receive(&self, buffer: &BufferHandle, data: &mut [i16]) -> Result<usize>;

    /// Blocking Tx transfer from interleaved I/Q. Returns complex samples written.
    fn transmit(&self, buffer: &BufferHandle, data: &[i16]) -> Result<usize>;

    /// Significant bits in the hardware sample words for a side.
    fn sample_bits(&self, _side: Side) -> u32 {
        16
    }

    /// Run the front-end's analog calibration for one side over `bandwidth`
    /// Hz. Both sides must be idle. Backends without one accept it as a no-op.
    fn calibrate(&self, _handle: PortHandle, _side: Side, _bandwidth: u32) -> Result<()> {
        Ok(())
    }
}
