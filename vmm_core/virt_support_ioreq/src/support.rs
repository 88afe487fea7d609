// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Services the I/O emulation core consumes from the rest of the hypervisor.

use crate::completion::ProtocolViolation;
use thiserror::Error;

/// A guest physical memory access failed.
#[derive(Debug, Error)]
#[error("failed to access guest memory at {gpa:#x} ({len} bytes)")]
pub struct GuestMemoryError {
    pub gpa: u64,
    pub len: usize,
}

/// Copies to and from guest physical memory.
pub trait GuestMemoryAccess: Send + Sync {
    /// Reads `data.len()` bytes at `gpa`.
    fn read_at(&self, gpa: u64, data: &mut [u8]) -> Result<(), GuestMemoryError>;

    /// Writes `data` at `gpa`.
    fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError>;
}

/// Notifies the device model that a VP's request slot has a request posted.
///
/// The caller suspends the VP after this returns; the device model's
/// completion wakes it up again and leads to
/// [`IoDispatcher::on_response`](crate::IoDispatcher::on_response).
pub trait DeviceModelNotify: Send + Sync {
    fn notify(&self, vp_index: u32);
}

/// Partition-wide control operations.
pub trait DomainControl: Send + Sync {
    /// Crashes the partition.
    ///
    /// Called when the device model has left shared state in a condition
    /// that cannot be trusted.
    fn crash(&self, vp_index: u32, reason: &ProtocolViolation);
}
