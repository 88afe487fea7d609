// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VP I/O state.

use crate::channel::IoRequestSlot;
use crate::request::IoRequest;
use std::sync::Arc;

/// The I/O state of one virtual processor.
///
/// This is passed explicitly to every dispatch and completion operation.
/// The request slot is shared with the device model; everything else is
/// private to the VP and is what the completion path trusts.
#[derive(Debug)]
pub struct VcpuIo {
    vp_index: u32,
    slot: Arc<IoRequestSlot>,
    /// The request last handed to the device model.
    pub(crate) outstanding: Option<IoRequest>,
    /// A dispatched access is waiting for its result.
    pub(crate) io_in_progress: bool,
    /// An MMIO instruction emulation is waiting on `outstanding`.
    pub(crate) mmio_in_progress: bool,
    /// The result of the last completed inline read, not yet consumed.
    pub(crate) completed_read: Option<u64>,
    pub(crate) io_count: u64,
}

impl VcpuIo {
    pub fn new(vp_index: u32, slot: Arc<IoRequestSlot>) -> Self {
        Self {
            vp_index,
            slot,
            outstanding: None,
            io_in_progress: false,
            mmio_in_progress: false,
            completed_read: None,
            io_count: 0,
        }
    }

    pub fn vp_index(&self) -> u32 {
        self.vp_index
    }

    pub fn slot(&self) -> &Arc<IoRequestSlot> {
        &self.slot
    }

    /// The request currently forwarded to the device model, if any.
    pub fn outstanding(&self) -> Option<&IoRequest> {
        self.outstanding.as_ref()
    }

    pub fn mmio_in_progress(&self) -> bool {
        self.mmio_in_progress
    }

    /// Number of requests handed to the device model by this VP.
    pub fn io_count(&self) -> u64 {
        self.io_count
    }

    /// Takes the result of the last completed inline read.
    pub fn take_completed_read(&mut self) -> Option<u64> {
        self.completed_read.take()
    }
}
