use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crossbeam::channel::Sender;

use crate::device::DeviceMessage;
use crate::error::Result;
use crate::ident::DeviceId;
use crate::shared::SharedDeviceRecord;
use crate::{lock, Side};

/// A logical device as seen by its buddies: its side and its inbox.
#[derive(Clone)]
pub struct Member {
    pub side: Side,
    pub inbox: Sender<DeviceMessage>,
}

struct Entry {
    record: Weak<SharedDeviceRecord>,
    members: Vec<Member>,
}

/// Caller-owned map from physical identifier to the logical devices open on it.
///
/// Pass the same registry to every device that may share hardware; separate
/// registries never see each other's devices.
#[derive(Default)]
pub struct DeviceRegistry {
    entries: Mutex<HashMap<DeviceId, Entry>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the device `id` as `member`. Reuses the live record if one exists,
    /// otherwise calls `open` to create it. Returns the record and whether it
    /// was reused.
    pub fn join<F>(&self, id: &DeviceId, member: Member, open: F) -> Result<(Arc<SharedDeviceRecord>, bool)>
    where
        F: FnOnce() -> Result<Arc<SharedDeviceRecord>>,
    {
        let mut entries = lock(&self.entries);
        let existing = entries.get(id).and_then(|e| e.record.upgrade());

        let (record, reused) = match existing {
            Some(record) => (record, true),
            None => {
                let record = open()?;
                entries.insert(
                    id.clone(),
                    Entry {
                        record: Arc::downgrade(&record),
                        members: Vec::new(),
                    },
                );
                (record, false)
            }
        };

        record.attach(member.side)?;
        if let Some(entry) = entries.get_mut(id) {
            entry.members.push(member);
        }
        Ok((record, reused))
    }

    /// Remove the `side` member of `id`; drops the entry once it is empty.
    pub fn leave(&self, id: &DeviceId, side: Side) {
        let mut entries = lock(&self.entries);
        let empty = match entries.get_mut(id) {
            Some(entry) => {
                entry.members.retain(|m| m.side != side);
                entry.members.is_empty()
            }
            None => return,
        };
        if empty {
            entries.remove(id);
        }
    }

    /// Siblings of `side` on the same radio.
    pub fn buddies(&self, id: &DeviceId, side: Side) -> Vec<Member> {
        lock(&self.entries)
            .get(id)
            .map(|e| e.members.iter().filter(|m| m.side != side).cloned().collect())
            .unwrap_or_default()
    }

    pub fn sides(&self, id: &DeviceId) -> Vec<Side> {
        lock(&self.entries)
            .get(id)
            .map(|e| e.members.iter().map(|m| m.side).collect())
            .unwrap_or_default()
    }

    /// Live record for `id`, if any logical device holds it.
    pub fn record(&self, id: &DeviceId) -> Option<Arc<SharedDeviceRecord>> {
        lock(&self.entries).get(id).and_then(|e| e.record.upgrade())
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
