//! In-flight volume tracking.
//!
//! Two node calls for the same volume would race on the same sysfs scan
//! files and the same mount table. A call takes the volume's slot on
//! entry; a second call for that volume is rejected instead of queued.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::{NodeError, Result};
use crate::metrics;

#[derive(Debug, Default)]
pub struct VolumeLocks {
    in_flight: Mutex<HashSet<String>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self) -> MutexGuard<'_, HashSet<String>> {
        // The set stays consistent even if a holder panicked mid-insert
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `volume_id`, failing with `AlreadyProcessing` if it is held.
    pub fn try_acquire(&self, volume_id: &str) -> Result<VolumeLockGuard<'_>> {
        if !self.set().insert(volume_id.to_string()) {
            warn!(volume_id = %volume_id, "Volume is already being processed");
            metrics::record_conflict("in_flight");
            return Err(NodeError::AlreadyProcessing(volume_id.to_string()));
        }
        debug!(volume_id = %volume_id, "Acquired volume lock");
        Ok(VolumeLockGuard {
            locks: self,
            volume_id: volume_id.to_string(),
        })
    }

    pub fn is_held(&self, volume_id: &str) -> bool {
        self.set().contains(volume_id)
    }
}

/// Releases the volume when dropped, on every exit path.
#[derive(Debug)]
pub struct VolumeLockGuard<'a> {
    locks: &'a VolumeLocks,
    volume_id: String,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        self.locks.set().remove(&self.volume_id);
        debug!(volume_id = %self.volume_id, "Released volume lock");
    }
}
