use std::sync::Arc;
use std::time::Duration;

use crate::device::DeviceMessage;
use crate::error::Result;
use crate::ident::DeviceId;
use crate::port::HardwarePort;
use crate::registry::{DeviceRegistry, Member};
use crate::settings::{CrossNotification, SharedSettings};
use crate::shared::SharedDeviceRecord;
use crate::Side;

/// Coordinates one logical device with its sibling on the same radio.
pub struct BuddyCoordinator {
    side: Side,
    registry: Arc<DeviceRegistry>,
    record: Arc<SharedDeviceRecord>,
    suspend_timeout: Duration,
}

impl BuddyCoordinator {
    /// Attach to the sibling's record for `id` or open the hardware.
    ///
    /// When attaching, returns the physical state the sibling last applied
    /// so the caller can start from it.
    pub fn attach_or_open<F>(
        registry: &Arc<DeviceRegistry>,
        id: &DeviceId,
        member: Member,
        port: F,
        suspend_timeout: Duration,
    ) -> Result<(Self, Option<SharedSettings>)>
    where
        F: FnOnce() -> Result<Arc<dyn HardwarePort>>,
    {
        let side = member.side;
        let (record, reused) = registry.join(id, member, || SharedDeviceRecord::open(port()?, id))?;

        let inherited = if reused {
            log::info!("{} {}: attached to buddy record", id, side);
            record.shared_settings()
        } else {
            None
        };

        let coordinator = Self {
            side,
            registry: registry.clone(),
            record,
            suspend_timeout,
        };
        coordinator.notify(DeviceMessage::BuddyAttached(side));
        Ok((coordinator, inherited))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn record(&self) -> &Arc<SharedDeviceRecord> {
        &self.record
    }

    pub fn has_buddy(&self) -> bool {
        !self.registry.buddies(self.record.id(), self.side).is_empty()
    }

    /// Send `msg` to every sibling's inbox. Returns how many received it.
    pub fn notify(&self, msg: DeviceMessage) -> usize {
        self.registry
            .buddies(self.record.id(), self.side)
            .into_iter()
            .filter(|m| m.inbox.send(msg.clone()).is_ok())
            .count()
    }

    /// Apply a change to the shared analog chain.
    ///
    /// Both workers are stopped (sibling first) before `write` runs and
    /// restarted afterwards if they were running. `write` returns the shared
    /// state that is now in effect; it is stored in the record and sent to
    /// the sibling. A worker that cannot be stopped aborts the change before
    /// any hardware write; the workers already paused, and the one that
    /// timed out, are resumed before the error is returned.
    pub fn apply_shared<F>(&self, write: F) -> Result<SharedSettings>
    where
        F: FnOnce(&SharedDeviceRecord) -> SharedSettings,
    {
        let _changes = self.record.lock_changes();
        let order = [self.side.other(), self.side];

        let mut suspended = Vec::with_capacity(2);
        for side in order {
            match self.suspend(side) {
                Ok(true) => suspended.push(side),
                Ok(false) => {}
                Err(e) => {
                    log::error!("{}: shared change aborted: {}", self.record.id(), e);
                    suspended.push(side);
                    let _ = self.resume(&suspended);
                    return Err(e);
                }
            }
        }

        let shared = write(&self.record);
        self.record.set_shared_settings(shared);
        self.record.refresh_sample_rates();

        let restarted = self.resume(&suspended);

        self.notify(DeviceMessage::CrossReport(CrossNotification {
            from: self.side,
            shared,
        }));
        restarted.map(|_| shared)
    }

    /// Stop the worker active on `side`. Returns whether it was running.
    fn suspend(&self, side: Side) -> Result<bool> {
        let worker = match self.record.worker(side) {
            Some(w) if w.is_running() => w,
            _ => {
                self.record.set_was_running(side, false);
                return Ok(false);
            }
        };
        // A worker that times out has still been asked to exit, so it is
        // marked for resumption either way.
        self.record.set_was_running(side, true);
        worker.stop(self.suspend_timeout)?;
        log::debug!("{}: {} worker suspended", self.record.id(), side);
        Ok(true)
    }

    /// Restart the workers in `sides` that were running before suspension.
    fn resume(&self, sides: &[Side]) -> Result<()> {
        let mut first_err = None;
        for &side in sides.iter().rev() {
            if !self.record.was_running(side) {
                continue;
            }
            self.record.set_was_running(side, false);
            let Some(worker) = self.record.worker(side) else {
                continue;
            };
            match worker.start(self.suspend_timeout) {
                Ok(()) => log::debug!("{}: {} worker resumed", self.record.id(), side),
                Err(e) => {
                    log::error!("{}: {} worker failed to resume: {}", self.record.id(), side, e);
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Leave the radio. The last side out closes the hardware handle;
    /// returns true in that case.
    pub fn detach(self) -> bool {
        let id = self.record.id().clone();
        self.registry.leave(&id, self.side);
        self.notify(DeviceMessage::BuddyDetached(self.side));
        let closed = self.record.detach(self.side);
        if !closed {
            log::info!("{} {}: detached, buddy keeps the handle", id, self.side);
        }
        closed
    }
}

