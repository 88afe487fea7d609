// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Requests that originate in the hypervisor rather than in a guest access.

use crate::dispatch::DispatchError;
use crate::dispatch::DispatchOutcome;
use crate::dispatch::IoDispatcher;
use crate::dispatch::IoStats;
use crate::request::AccessSize;
use crate::request::IoData;
use crate::request::IoDirection;
use crate::request::IoKind;
use crate::request::IoRequest;
use crate::vcpu::VcpuIo;

impl IoDispatcher {
    /// Tells the device model that the guest clock moved by `delta`.
    ///
    /// The update goes through the buffered ring when it can, and through
    /// the VP's request slot otherwise. Returns `None` if `delta` is zero, in
    /// which case nothing is sent.
    pub fn send_time_offset(
        &self,
        vcpu: &mut VcpuIo,
        delta: i64,
    ) -> Result<Option<DispatchOutcome>, DispatchError> {
        if delta == 0 {
            return Ok(None);
        }

        let request = IoRequest {
            dir: IoDirection::Write,
            kind: IoKind::TimeOffset,
            addr: 0,
            size: AccessSize::Qword,
            count: 1,
            data: IoData::Value(delta as u64),
            decrement: false,
        };

        if let Some(ring) = &self.buffered {
            match ring.enqueue(&request) {
                Ok(()) => {
                    IoStats::inc(&self.stats.buffered);
                    return Ok(Some(DispatchOutcome::Completed));
                }
                Err(reason) => {
                    tracing::warn!(
                        vp = vcpu.vp_index(),
                        reason = &reason as &dyn std::error::Error,
                        "unsuccessful buffered time offset update"
                    );
                }
            }
        }

        self.check_slot_free(vcpu, request.kind)?;
        Ok(Some(self.forward(vcpu, request)))
    }

    /// Asks the device model to drop its guest memory mapping cache.
    pub fn send_invalidate(&self, vcpu: &mut VcpuIo) -> Result<DispatchOutcome, DispatchError> {
        let request = IoRequest {
            dir: IoDirection::Write,
            kind: IoKind::Invalidate,
            addr: 0,
            size: AccessSize::Dword,
            count: 1,
            data: IoData::Value(!0),
            decrement: false,
        };
        self.check_slot_free(vcpu, request.kind)?;
        Ok(self.forward(vcpu, request))
    }
}
