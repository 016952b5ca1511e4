//! The capability-set trait a host application implements to hang its own
//! DSP/business logic off a [`crate::Module`]. All methods default to a
//! no-op so a module that only cares about, say, `process`, need not
//! implement the preset or halt machinery.

use crate::directive::{GlobalPatchState, SnapshotData};
use crate::{ModuleId, ProcessBlock};

pub trait EventHandler<const I: usize, const O: usize> {
    /// Called whenever this module's view of the global patch state changes.
    fn patch(&mut self, _state: GlobalPatchState) {}

    /// Called once per tick with the freshly received input blocks; fill in
    /// `block`'s output slots before returning.
    fn process(&mut self, _block: &mut ProcessBlock<I, O>) {}

    /// Serialize whatever state a preset needs to restore this module.
    fn get_snapshot(&mut self) -> SnapshotData {
        SnapshotData::new()
    }

    /// Apply a previously captured snapshot.
    fn set_snapshot(&mut self, _data: &SnapshotData) {}

    /// A snapshot broadcast by another module during preset capture.
    fn received_snapshot(&mut self, _uuid: &ModuleId, _data: &SnapshotData) {}

    /// The fabric is being torn down; release any external resources.
    fn halt(&mut self) {}
}
