// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dispatcher configuration.

use ioreq_protocol::BUFFERED_SLOT_COUNT;
use serde::Deserialize;
use serde::Serialize;
use std::ops::RangeInclusive;

/// The legacy VGA window, the default home of buffered MMIO writes.
pub const VGA_MMIO_RANGE: RangeInclusive<u64> = 0xa0000..=0xbffff;

/// What to do when a VP issues a request while its slot is still occupied.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingRequestPolicy {
    /// Fail the new request.
    #[default]
    Reject,
    /// Log, then overwrite the outstanding request.
    Overwrite,
}

/// Configuration for an [`IoDispatcher`](crate::IoDispatcher).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct IoDispatcherConfig {
    /// Number of buffered ring slots. Zero disables buffering.
    pub buffered_slots: usize,
    /// MMIO ranges whose writes may be buffered.
    pub buffered_mmio_ranges: Vec<RangeInclusive<u64>>,
    pub pending_request_policy: PendingRequestPolicy,
}

impl Default for IoDispatcherConfig {
    fn default() -> Self {
        Self {
            buffered_slots: BUFFERED_SLOT_COUNT,
            buffered_mmio_ranges: vec![VGA_MMIO_RANGE],
            pending_request_policy: PendingRequestPolicy::default(),
        }
    }
}
