// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Completion of I/O requests.
//!
//! The device model is not trusted. Its response is only accepted when the
//! slot is in `RESPONSE_READY` and this VP actually has a request
//! outstanding; anything else crashes the partition. The completed request
//! is always the VP's own copy, only the returned data comes from the slot.

use crate::channel::UnexpectedState;
use crate::dispatch::IoDispatcher;
use crate::dispatch::IoStats;
use crate::mmio::GuestRegisters;
use crate::mmio::MmioOutcome;
use crate::request::IoData;
use crate::request::IoRequest;
use crate::vcpu::VcpuIo;
use thiserror::Error;

/// A device model response that breaks the request protocol.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("bad request slot state")]
    BadState(#[source] UnexpectedState),
    #[error("response with no outstanding request")]
    UnsolicitedResponse,
}

/// The result of processing a device model response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The request is complete. Any inline read result is available from
    /// [`VcpuIo::take_completed_read`].
    Completed,
    /// The response fed an interrupted MMIO emulation, which was resumed.
    Resumed(MmioOutcome),
}

impl IoDispatcher {
    /// Processes the device model's response to the VP's outstanding
    /// request.
    ///
    /// Called on the VP's wakeup path after a dispatch returned
    /// [`Pending`](crate::DispatchOutcome::Pending). A protocol violation
    /// crashes the partition via [`DomainControl`](crate::DomainControl) and
    /// the VP must not run again.
    pub fn on_response(
        &self,
        vcpu: &mut VcpuIo,
        registers: &mut dyn GuestRegisters,
    ) -> Result<ResponseOutcome, ProtocolViolation> {
        let request = self.complete(vcpu, false)?;
        let resume = vcpu.mmio_in_progress && request.expects_value();
        vcpu.mmio_in_progress = false;
        if resume {
            Ok(ResponseOutcome::Resumed(self.handle_mmio(vcpu, registers)))
        } else {
            Ok(ResponseOutcome::Completed)
        }
    }

    /// Retires the outstanding request from a `RESPONSE_READY` slot.
    ///
    /// When `local` is set the request was completed by a fast path and its
    /// result is already in the VP's copy.
    pub(crate) fn complete(
        &self,
        vcpu: &mut VcpuIo,
        local: bool,
    ) -> Result<IoRequest, ProtocolViolation> {
        let response = vcpu
            .slot()
            .take_response()
            .map_err(|err| self.violation(vcpu, ProtocolViolation::BadState(err)))?;

        let Some(mut request) = vcpu.outstanding.take() else {
            return Err(self.violation(vcpu, ProtocolViolation::UnsolicitedResponse));
        };

        if vcpu.io_in_progress {
            vcpu.io_in_progress = false;
            if request.expects_value() {
                let value = match (local, request.data) {
                    (true, IoData::Value(value)) => value,
                    _ => response.data,
                };
                let value = value & request.size.mask();
                request.data = IoData::Value(value);
                vcpu.completed_read = Some(value);
            }
        }

        Ok(request)
    }

    fn violation(&self, vcpu: &VcpuIo, violation: ProtocolViolation) -> ProtocolViolation {
        tracing::error!(
            vp = vcpu.vp_index(),
            error = &violation as &dyn std::error::Error,
            "device model violated the request protocol, crashing partition"
        );
        IoStats::inc(&self.stats.protocol_violations);
        self.domain.crash(vcpu.vp_index(), &violation);
        violation
    }
}
