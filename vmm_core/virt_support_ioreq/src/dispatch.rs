// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Notable Exports: [`IoDispatcher`], [`IoDispatcherBuilder`]
//!
//! The dispatcher is the entry point for trapped port and memory-mapped I/O.
//! Each access is offered to the in-hypervisor fast paths first; anything
//! they decline is posted to the VP's request slot for the device model.

use crate::buffered::BufferedIoRing;
use crate::buffered::InvalidCapacity;
use crate::completion::ProtocolViolation;
use crate::config::IoDispatcherConfig;
use crate::config::PendingRequestPolicy;
use crate::intercept::InterceptConflict;
use crate::intercept::InterceptCounters;
use crate::intercept::InterceptResult;
use crate::intercept::IoInterceptTable;
use crate::intercept::MmioIntercept;
use crate::intercept::PortIoIntercept;
use crate::mmio::InstructionEmulator;
use crate::passthrough::HostPortIo;
use crate::passthrough::IoPortPermissions;
use crate::passthrough::PassthroughOutcome;
use crate::passthrough::PassthroughPortIntercept;
use crate::passthrough::PassthroughPorts;
use crate::ratelimit::warn_ratelimited;
use crate::request::AccessSize;
use crate::request::IoData;
use crate::request::IoDirection;
use crate::request::IoKind;
use crate::request::IoRequest;
use crate::support::DeviceModelNotify;
use crate::support::DomainControl;
use crate::support::GuestMemoryAccess;
use crate::vcpu::VcpuIo;
use ioreq_protocol::BUFFERED_ADDRESS_LIMIT;
use ioreq_protocol::IoreqState;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// The address space of a trapped access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AccessKind {
    Pio,
    Mmio,
}

/// A trapped guest access.
#[derive(Debug, Copy, Clone)]
pub struct IoAccess {
    pub kind: AccessKind,
    pub dir: IoDirection,
    pub addr: u64,
    /// Access size in bytes, as decoded from the guest.
    pub size: u32,
    /// Repetition count.
    pub count: u32,
    pub data: IoData,
    /// String operations walk memory downwards.
    pub decrement: bool,
}

impl IoAccess {
    /// A single inline read.
    pub fn read(kind: AccessKind, addr: u64, size: u32) -> Self {
        Self {
            kind,
            dir: IoDirection::Read,
            addr,
            size,
            count: 1,
            data: IoData::Value(0),
            decrement: false,
        }
    }

    /// A single inline write.
    pub fn write(kind: AccessKind, addr: u64, size: u32, value: u64) -> Self {
        Self {
            kind,
            dir: IoDirection::Write,
            addr,
            size,
            count: 1,
            data: IoData::Value(value),
            decrement: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unsupported access size {0}")]
    UnsupportedSize(u32),
    #[error("port address {0:#x} out of range")]
    InvalidPort(u64),
    #[error("invalid repeat count {0}")]
    InvalidRepeatCount(u32),
    #[error("request issued while the slot is in state {state:?}")]
    RequestPending { state: IoreqState },
    #[error("fast path completion failed")]
    ProtocolViolation(#[from] ProtocolViolation),
}

/// How a dispatched access was disposed of.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[must_use]
pub enum DispatchOutcome {
    /// A fast path completed the access. Any inline read result is available
    /// from [`VcpuIo::take_completed_read`].
    Completed,
    /// The request was posted to the device model. The VP must be suspended
    /// until the device model responds, at which point
    /// [`IoDispatcher::on_response`] must be called.
    Pending,
}

/// Partition-wide dispatch counters.
#[derive(Debug, Default)]
pub(crate) struct IoStats {
    pub forwarded: AtomicU64,
    pub fast_path: AtomicU64,
    pub buffered: AtomicU64,
    pub passthrough: AtomicU64,
    pub refused: AtomicU64,
    pub protocol_violations: AtomicU64,
}

impl IoStats {
    pub fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> IoStatsSnapshot {
        IoStatsSnapshot {
            forwarded: self.forwarded.load(Ordering::Relaxed),
            fast_path: self.fast_path.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            passthrough: self.passthrough.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            protocol_violations: self.protocol_violations.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of the dispatch counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    /// Requests posted to the device model.
    pub forwarded: u64,
    /// Requests completed without the device model, including the ones
    /// counted below.
    pub fast_path: u64,
    /// Writes placed in the buffered ring.
    pub buffered: u64,
    /// Passthrough port accesses performed.
    pub passthrough: u64,
    /// Passthrough port accesses refused.
    pub refused: u64,
    /// Responses that violated the request protocol.
    pub protocol_violations: u64,
}

/// An error constructing an [`IoDispatcher`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    BufferedCapacity(#[from] InvalidCapacity),
    #[error("buffered mmio range {0:#x?} is empty or beyond the bufferable address limit")]
    BufferedRange(RangeInclusive<u64>),
}

struct Passthrough {
    ports: Arc<PassthroughPorts>,
    hardware: Arc<dyn HostPortIo>,
    permissions: Arc<dyn IoPortPermissions>,
}

/// A builder for [`IoDispatcher`].
pub struct IoDispatcherBuilder {
    config: IoDispatcherConfig,
    guest_memory: Arc<dyn GuestMemoryAccess>,
    notify: Arc<dyn DeviceModelNotify>,
    domain: Arc<dyn DomainControl>,
    emulator: Option<Arc<dyn InstructionEmulator>>,
    passthrough: Option<Passthrough>,
    buffered: Option<Arc<BufferedIoRing>>,
}

impl IoDispatcherBuilder {
    pub fn new(
        config: IoDispatcherConfig,
        guest_memory: Arc<dyn GuestMemoryAccess>,
        notify: Arc<dyn DeviceModelNotify>,
        domain: Arc<dyn DomainControl>,
    ) -> Self {
        Self {
            config,
            guest_memory,
            notify,
            domain,
            emulator: None,
            passthrough: None,
            buffered: None,
        }
    }

    /// Sets the instruction emulator used to complete MMIO exits.
    pub fn emulator(mut self, emulator: Arc<dyn InstructionEmulator>) -> Self {
        self.emulator = Some(emulator);
        self
    }

    /// Enables port passthrough.
    pub fn passthrough(
        mut self,
        ports: Arc<PassthroughPorts>,
        hardware: Arc<dyn HostPortIo>,
        permissions: Arc<dyn IoPortPermissions>,
    ) -> Self {
        self.passthrough = Some(Passthrough {
            ports,
            hardware,
            permissions,
        });
        self
    }

    /// Uses an existing ring instead of allocating one from the config.
    pub fn buffered_ring(mut self, ring: Arc<BufferedIoRing>) -> Self {
        self.buffered = Some(ring);
        self
    }

    pub fn build(self) -> Result<IoDispatcher, BuildError> {
        let buffered = match self.buffered {
            Some(ring) => Some(ring),
            None if self.config.buffered_slots == 0 => None,
            None => Some(Arc::new(BufferedIoRing::new(self.config.buffered_slots)?)),
        };

        for range in &self.config.buffered_mmio_ranges {
            if range.is_empty() || *range.end() > BUFFERED_ADDRESS_LIMIT {
                return Err(BuildError::BufferedRange(range.clone()));
            }
        }

        Ok(IoDispatcher {
            pio: IoInterceptTable::new(),
            mmio: IoInterceptTable::new(),
            passthrough: self.passthrough,
            buffered,
            buffered_mmio_ranges: self.config.buffered_mmio_ranges,
            pending_request_policy: self.config.pending_request_policy,
            guest_memory: self.guest_memory,
            notify: self.notify,
            domain: self.domain,
            emulator: self.emulator,
            stats: IoStats::default(),
        })
    }
}

/// Routes trapped I/O for one partition.
pub struct IoDispatcher {
    pio: IoInterceptTable<u16, dyn PortIoIntercept>,
    mmio: IoInterceptTable<u64, dyn MmioIntercept>,
    passthrough: Option<Passthrough>,
    pub(crate) buffered: Option<Arc<BufferedIoRing>>,
    buffered_mmio_ranges: Vec<RangeInclusive<u64>>,
    pending_request_policy: PendingRequestPolicy,
    guest_memory: Arc<dyn GuestMemoryAccess>,
    notify: Arc<dyn DeviceModelNotify>,
    pub(crate) domain: Arc<dyn DomainControl>,
    pub(crate) emulator: Option<Arc<dyn InstructionEmulator>>,
    pub(crate) stats: IoStats,
}

impl IoDispatcher {
    /// Registers a fast-path port IO handler.
    pub fn register_pio(
        &self,
        range: RangeInclusive<u16>,
        name: impl Into<Arc<str>>,
        handler: Arc<dyn PortIoIntercept>,
    ) -> Result<(), InterceptConflict<u16>> {
        self.pio.register(range, name, handler)
    }

    /// Registers a fast-path MMIO handler.
    pub fn register_mmio(
        &self,
        range: RangeInclusive<u64>,
        name: impl Into<Arc<str>>,
        handler: Arc<dyn MmioIntercept>,
    ) -> Result<(), InterceptConflict<u64>> {
        self.mmio.register(range, name, handler)
    }

    pub fn revoke_pio(&self, start: u16) {
        self.pio.revoke(start)
    }

    pub fn revoke_mmio(&self, start: u64) {
        self.mmio.revoke(start)
    }

    /// The buffered ring shared with the device model, if enabled.
    pub fn buffered_ring(&self) -> Option<&Arc<BufferedIoRing>> {
        self.buffered.as_ref()
    }

    pub fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn pio_counters(&self) -> Vec<InterceptCounters<u16>> {
        self.pio.counters()
    }

    pub fn mmio_counters(&self) -> Vec<InterceptCounters<u64>> {
        self.mmio.counters()
    }

    /// Dispatches a trapped access.
    pub fn dispatch(
        &self,
        vcpu: &mut VcpuIo,
        access: IoAccess,
    ) -> Result<DispatchOutcome, DispatchError> {
        let size = AccessSize::new(access.size).ok_or_else(|| {
            warn_ratelimited!(
                vp = vcpu.vp_index(),
                kind = ?access.kind,
                address = access.addr,
                size = access.size,
                "unexpected io request size"
            );
            DispatchError::UnsupportedSize(access.size)
        })?;
        if access.count == 0 {
            return Err(DispatchError::InvalidRepeatCount(access.count));
        }
        let kind = match access.kind {
            AccessKind::Pio => {
                if access.addr > u16::MAX as u64 {
                    return Err(DispatchError::InvalidPort(access.addr));
                }
                IoKind::Pio
            }
            AccessKind::Mmio => IoKind::Mmio,
        };

        self.check_slot_free(vcpu, kind)?;

        let mut request = IoRequest {
            dir: access.dir,
            kind,
            addr: access.addr,
            size,
            count: access.count,
            data: access.data,
            decrement: access.decrement,
        };

        vcpu.io_in_progress = true;

        let handled = match kind {
            IoKind::Pio => self.try_pio_fast_path(&mut request),
            _ => self.try_mmio_fast_path(&mut request),
        };

        if handled {
            IoStats::inc(&self.stats.fast_path);
            vcpu.slot().publish(&request, IoreqState::RESPONSE_READY);
            vcpu.outstanding = Some(request);
            self.retire_local(vcpu)
        } else {
            Ok(self.forward(vcpu, request))
        }
    }

    /// Retires a request that a fast path completed in the VP's local copy.
    ///
    /// Fails only if the device model moved the slot out of
    /// `RESPONSE_READY` underneath the VP, in which case the partition has
    /// been crashed.
    fn retire_local(&self, vcpu: &mut VcpuIo) -> Result<DispatchOutcome, DispatchError> {
        self.complete(vcpu, true)?;
        Ok(DispatchOutcome::Completed)
    }

    /// Checks that the VP has no outstanding request, applying the pending
    /// request policy if it does.
    pub(crate) fn check_slot_free(
        &self,
        vcpu: &mut VcpuIo,
        kind: IoKind,
    ) -> Result<(), DispatchError> {
        let state = vcpu.slot().state();
        if state == IoreqState::NONE && vcpu.outstanding.is_none() {
            return Ok(());
        }
        match self.pending_request_policy {
            PendingRequestPolicy::Reject => {
                warn_ratelimited!(
                    vp = vcpu.vp_index(),
                    ?kind,
                    ?state,
                    "io request issued with another already pending, rejecting"
                );
                Err(DispatchError::RequestPending { state })
            }
            PendingRequestPolicy::Overwrite => {
                warn_ratelimited!(
                    vp = vcpu.vp_index(),
                    ?kind,
                    ?state,
                    "io request issued with another already pending, overwriting"
                );
                vcpu.outstanding = None;
                Ok(())
            }
        }
    }

    fn try_pio_fast_path(&self, request: &mut IoRequest) -> bool {
        if let Some(passthrough) = &self.passthrough {
            let intercept = PassthroughPortIntercept {
                ports: &passthrough.ports,
                hardware: passthrough.hardware.as_ref(),
                permissions: passthrough.permissions.as_ref(),
                guest_memory: self.guest_memory.as_ref(),
            };
            match intercept.try_handle(request) {
                PassthroughOutcome::NotHandled => {}
                PassthroughOutcome::Handled => {
                    IoStats::inc(&self.stats.passthrough);
                    return true;
                }
                PassthroughOutcome::Refused(_) => {
                    IoStats::inc(&self.stats.refused);
                    return true;
                }
            }
        }

        self.pio
            .lookup(request.addr as u16, request.is_read())
            .is_some_and(|handler| handler.handle_port_io(request) == InterceptResult::Handled)
    }

    fn try_mmio_fast_path(&self, request: &mut IoRequest) -> bool {
        if let Some(handler) = self.mmio.lookup(request.addr, request.is_read()) {
            if handler.handle_mmio(request) == InterceptResult::Handled {
                return true;
            }
        }

        if request.dir != IoDirection::Write
            || !self
                .buffered_mmio_ranges
                .iter()
                .any(|range| range.contains(&request.addr))
        {
            return false;
        }

        let Some(ring) = &self.buffered else {
            return false;
        };

        match ring.enqueue(request) {
            Ok(()) => {
                IoStats::inc(&self.stats.buffered);
                true
            }
            Err(reason) => {
                tracing::trace!(
                    address = request.addr,
                    reason = &reason as &dyn std::error::Error,
                    "buffered write rejected"
                );
                false
            }
        }
    }

    /// Posts `request` to the device model.
    pub(crate) fn forward(&self, vcpu: &mut VcpuIo, request: IoRequest) -> DispatchOutcome {
        tracing::trace!(
            vp = vcpu.vp_index(),
            kind = ?request.kind,
            address = request.addr,
            size = request.size.bytes(),
            count = request.count,
            "forwarding io request to device model"
        );
        vcpu.outstanding = Some(request);
        vcpu.slot().publish(&request, IoreqState::READY);
        vcpu.io_count += 1;
        IoStats::inc(&self.stats.forwarded);
        self.notify.notify(vcpu.vp_index());
        DispatchOutcome::Pending
    }
}
