use std::sync::{Arc, Mutex, MutexGuard};

use crate::attr::{self, SampleRateChain};
use crate::error::{Result, SdrError};
use crate::ident::DeviceId;
use crate::port::{HardwarePort, PortHandle};
use crate::settings::SharedSettings;
use crate::worker::StreamingWorker;
use crate::{lock, Side};

#[derive(Default)]
struct SideSlot {
    attached: bool,
    worker: Option<Arc<StreamingWorker>>,
    was_running: bool,
    rates: SampleRateChain,
}

struct RecordState {
    open: bool,
    rx: SideSlot,
    tx: SideSlot,
    shared: Option<SharedSettings>,
}

impl RecordState {
    fn slot(&mut self, side: Side) -> &mut SideSlot {
        match side {
            Side::Rx => &mut self.rx,
            Side::Tx => &mut self.tx,
        }
    }
}

/// One physical radio: the open handle, its shared analog state and the
/// worker active on each side.
pub struct SharedDeviceRecord {
    id: DeviceId,
    port: Arc<dyn HardwarePort>,
    handle: PortHandle,
    changes: Mutex<()>,
    state: Mutex<RecordState>,
}

impl SharedDeviceRecord {
    /// Open the hardware and create the record for it.
    pub fn open(port: Arc<dyn HardwarePort>, id: &DeviceId) -> Result<Arc<Self>> {
        let handle = port.open(id)?;
        log::info!("{}: opened {} (handle {})", port.name(), id, handle.0);
        Ok(Arc::new(Self {
            id: id.clone(),
            port,
            handle,
            changes: Mutex::new(()),
            state: Mutex::new(RecordState {
                open: true,
                rx: SideSlot::default(),
                tx: SideSlot::default(),
                shared: None,
            }),
        }))
    }

    pub fn id(&self) -> &DeviceId {
        &self.id
    }

    pub fn port(&self) -> &Arc<dyn HardwarePort> {
        &self.port
    }

    pub fn handle(&self) -> PortHandle {
        self.handle
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    /// Serializes shared changes with start and stop on either side.
    pub(crate) fn lock_changes(&self) -> MutexGuard<'_, ()> {
        lock(&self.changes)
    }

    pub(crate) fn attach(&self, side: Side) -> Result<()> {
        let mut state = lock(&self.state);
        if !state.open {
            return Err(SdrError::NotOpen);
        }
        let slot = state.slot(side);
        if slot.attached {
            return Err(SdrError::SideInUse {
                id: self.id.to_string(),
                side,
            });
        }
        slot.attached = true;
        Ok(())
    }

    /// Remove one side. Closes the handle when no side remains and returns
    /// true in that case.
    pub(crate) fn detach(&self, side: Side) -> bool {
        let mut state = lock(&self.state);
        let slot = state.slot(side);
        slot.attached = false;
        slot.worker = None;
        slot.was_running = false;

        if state.rx.attached || state.tx.attached || !state.open {
            return false;
        }
        state.open = false;
        drop(state);

        self.port.close(self.handle);
        log::info!("{}: closed {}", self.port.name(), self.id);
        true
    }

    pub fn is_attached(&self, side: Side) -> bool {
        lock(&self.state).slot(side).attached
    }

    pub(crate) fn set_worker(&self, side: Side, worker: Option<Arc<StreamingWorker>>) {
        lock(&self.state).slot(side).worker = worker;
    }

    pub(crate) fn worker(&self, side: Side) -> Option<Arc<StreamingWorker>> {
        lock(&self.state).slot(side).worker.clone()
    }

    pub(crate) fn set_was_running(&self, side: Side, was_running: bool) {
        lock(&self.state).slot(side).was_running = was_running;
    }

    pub(crate) fn was_running(&self, side: Side) -> bool {
        lock(&self.state).slot(side).was_running
    }

    /// Physical state last applied through the record, if any side set it.
    pub fn shared_settings(&self) -> Option<SharedSettings> {
        lock(&self.state).shared
    }

    pub(crate) fn set_shared_settings(&self, shared: SharedSettings) {
        lock(&self.state).shared = Some(shared);
    }

    pub fn sample_rates(&self, side: Side) -> SampleRateChain {
        lock(&self.state).slot(side).rates.clone()
    }

    /// Read the converter chain of both sides back from the hardware.
    pub(crate) fn refresh_sample_rates(&self) {
        for side in [Side::Rx, Side::Tx] {
            let parsed = self
                .port
                .read_attribute(self.handle, attr::sample_rates(side))
                .and_then(|v| SampleRateChain::parse(&v));
            match parsed {
                Ok(chain) => {
                    log::debug!("{} {} rates: {}", self.id, side, chain);
                    lock(&self.state).slot(side).rates = chain;
                }
                Err(e) => log::warn!("{} {} rates unavailable: {}", self.id, side, e),
            }
        }
    }
}

impl Drop for SharedDeviceRecord {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if state.open {
            drop(state);
            self.port.close(self.handle);
            log::info!("{}: closed {}", self.port.name(), self.id);
        }
    }
}
