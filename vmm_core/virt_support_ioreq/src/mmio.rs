// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Completion of memory-mapped I/O exits by instruction emulation.
//!
//! The emulator decodes and executes one guest instruction against a
//! register snapshot, issuing its device accesses through [`EmulatorIo`].
//! When an access has to go to the device model, the emulator is told to
//! retry, the VP waits, and the whole instruction is run again once the
//! response arrives. On that second run the first read returns the latched
//! result instead of being dispatched again.

use crate::dispatch::AccessKind;
use crate::dispatch::DispatchError;
use crate::dispatch::DispatchOutcome;
use crate::dispatch::IoAccess;
use crate::dispatch::IoDispatcher;
use crate::ratelimit::warn_ratelimited;
use crate::vcpu::VcpuIo;

/// The architectural state the emulator works on.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct CpuRegisters {
    /// General purpose registers, in encoding order.
    pub gps: [u64; 16],
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
}

/// An exception raised by the emulated instruction.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PendingException {
    pub vector: u8,
    pub error_code: Option<u32>,
}

/// Access to a VP's registers.
pub trait GuestRegisters {
    fn registers(&mut self) -> CpuRegisters;
    fn set_registers(&mut self, registers: &CpuRegisters);
    fn inject_exception(&mut self, exception: PendingException);
}

/// The working state of one emulation run.
#[derive(Debug, Clone)]
pub struct EmulationContext {
    /// Updated in place by the emulator. Written back only on success.
    pub registers: CpuRegisters,
    /// The instruction bytes the emulator fetched, for diagnostics.
    pub instruction_bytes: Vec<u8>,
}

/// The result of emulating one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulateResult {
    Completed,
    /// A device access is waiting on the device model. The instruction must
    /// be run again once it responds.
    Retry,
    /// The instruction could not be decoded or is not supported.
    Unhandleable,
    Exception(PendingException),
}

/// Device access for the emulator.
pub trait EmulatorIo {
    /// Reads `size` bytes at `addr`.
    ///
    /// Returns `None` if the read was forwarded to the device model, in which
    /// case the emulator must stop and return [`EmulateResult::Retry`].
    fn read(
        &mut self,
        kind: AccessKind,
        addr: u64,
        size: u32,
    ) -> Result<Option<u64>, DispatchError>;

    /// Writes `size` bytes at `addr`. Writes are posted: a write forwarded to
    /// the device model does not stop emulation.
    fn write(
        &mut self,
        kind: AccessKind,
        addr: u64,
        size: u32,
        value: u64,
    ) -> Result<(), DispatchError>;
}

/// A single-instruction emulator.
pub trait InstructionEmulator: Send + Sync {
    fn emulate_one(
        &self,
        context: &mut EmulationContext,
        io: &mut dyn EmulatorIo,
    ) -> EmulateResult;
}

/// The result of handling an MMIO exit.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MmioOutcome {
    /// The instruction retired and the registers were written back.
    Emulated,
    /// The instruction is waiting on the device model.
    Pending,
    /// The instruction could not be emulated. The registers are untouched.
    NotEmulated,
    /// The instruction raised an exception, which was injected.
    ExceptionInjected,
}

struct DispatcherIo<'a> {
    dispatcher: &'a IoDispatcher,
    vcpu: &'a mut VcpuIo,
}

impl EmulatorIo for DispatcherIo<'_> {
    fn read(
        &mut self,
        kind: AccessKind,
        addr: u64,
        size: u32,
    ) -> Result<Option<u64>, DispatchError> {
        if let Some(value) = self.vcpu.take_completed_read() {
            return Ok(Some(value));
        }
        match self
            .dispatcher
            .dispatch(self.vcpu, IoAccess::read(kind, addr, size))?
        {
            DispatchOutcome::Completed => Ok(self.vcpu.take_completed_read()),
            DispatchOutcome::Pending => Ok(None),
        }
    }

    fn write(
        &mut self,
        kind: AccessKind,
        addr: u64,
        size: u32,
        value: u64,
    ) -> Result<(), DispatchError> {
        let _ = self
            .dispatcher
            .dispatch(self.vcpu, IoAccess::write(kind, addr, size, value))?;
        Ok(())
    }
}

impl IoDispatcher {
    /// Emulates the instruction that caused an MMIO exit.
    ///
    /// Also called from [`on_response`](Self::on_response) to resume an
    /// instruction whose read was forwarded.
    pub fn handle_mmio(
        &self,
        vcpu: &mut VcpuIo,
        registers: &mut dyn GuestRegisters,
    ) -> MmioOutcome {
        let Some(emulator) = &self.emulator else {
            tracing::warn!(vp = vcpu.vp_index(), "no instruction emulator for mmio exit");
            return MmioOutcome::NotEmulated;
        };

        let initial = registers.registers();
        let mut context = EmulationContext {
            registers: initial,
            instruction_bytes: Vec::new(),
        };

        let result = emulator.emulate_one(
            &mut context,
            &mut DispatcherIo {
                dispatcher: self,
                vcpu: &mut *vcpu,
            },
        );

        // A latched read that the instruction did not consume is stale.
        vcpu.completed_read = None;

        match result {
            EmulateResult::Completed => {
                registers.set_registers(&context.registers);
                vcpu.mmio_in_progress = vcpu.io_in_progress && vcpu.outstanding.is_some();
                MmioOutcome::Emulated
            }
            EmulateResult::Retry => {
                if vcpu.outstanding.is_none() {
                    warn_ratelimited!(
                        vp = vcpu.vp_index(),
                        rip = initial.rip,
                        "emulator retried with no request outstanding"
                    );
                    vcpu.mmio_in_progress = false;
                    return MmioOutcome::NotEmulated;
                }
                vcpu.mmio_in_progress = true;
                MmioOutcome::Pending
            }
            EmulateResult::Unhandleable => {
                warn_ratelimited!(
                    vp = vcpu.vp_index(),
                    cs = initial.cs,
                    rip = initial.rip,
                    instruction_bytes = ?context.instruction_bytes,
                    "mmio emulation failed"
                );
                vcpu.mmio_in_progress = false;
                MmioOutcome::NotEmulated
            }
            EmulateResult::Exception(exception) => {
                tracing::debug!(
                    vp = vcpu.vp_index(),
                    vector = exception.vector,
                    "mmio emulation raised an exception"
                );
                vcpu.mmio_in_progress = false;
                registers.inject_exception(exception);
                MmioOutcome::ExceptionInjected
            }
        }
    }
}
