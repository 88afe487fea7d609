// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Mock collaborators shared by the integration tests.

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use virt_support_ioreq::AccessKind;
use virt_support_ioreq::CpuRegisters;
use virt_support_ioreq::DeviceModelNotify;
use virt_support_ioreq::DomainControl;
use virt_support_ioreq::EmulateResult;
use virt_support_ioreq::EmulationContext;
use virt_support_ioreq::EmulatorIo;
use virt_support_ioreq::GuestMemoryAccess;
use virt_support_ioreq::GuestMemoryError;
use virt_support_ioreq::GuestRegisters;
use virt_support_ioreq::HostPortIo;
use virt_support_ioreq::InstructionEmulator;
use virt_support_ioreq::IoDispatcher;
use virt_support_ioreq::IoDispatcherBuilder;
use virt_support_ioreq::IoDispatcherConfig;
use virt_support_ioreq::IoPortPermissions;
use virt_support_ioreq::IoRequestSlot;
use virt_support_ioreq::PendingException;
use virt_support_ioreq::ProtocolViolation;
use virt_support_ioreq::VcpuIo;

/// Routes `tracing` output to the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("trace")),
        )
        .try_init();
}

#[derive(Default)]
pub struct RecordingNotify {
    pub notified: Mutex<Vec<u32>>,
}

impl DeviceModelNotify for RecordingNotify {
    fn notify(&self, vp_index: u32) {
        self.notified.lock().push(vp_index);
    }
}

#[derive(Default)]
pub struct RecordingDomain {
    pub crashes: Mutex<Vec<(u32, String)>>,
}

impl DomainControl for RecordingDomain {
    fn crash(&self, vp_index: u32, reason: &ProtocolViolation) {
        self.crashes.lock().push((vp_index, reason.to_string()));
    }
}

/// Sparse guest memory. Unwritten bytes read as zero.
#[derive(Default)]
pub struct FlatMemory {
    pub bytes: Mutex<BTreeMap<u64, u8>>,
}

impl FlatMemory {
    pub fn get(&self, gpa: u64, len: usize) -> Vec<u8> {
        let mut data = vec![0; len];
        self.read_at(gpa, &mut data).unwrap();
        data
    }
}

impl GuestMemoryAccess for FlatMemory {
    fn read_at(&self, gpa: u64, data: &mut [u8]) -> Result<(), GuestMemoryError> {
        let bytes = self.bytes.lock();
        for (i, b) in data.iter_mut().enumerate() {
            *b = bytes.get(&(gpa + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }

    fn write_at(&self, gpa: u64, data: &[u8]) -> Result<(), GuestMemoryError> {
        let mut bytes = self.bytes.lock();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(gpa + i as u64, *b);
        }
        Ok(())
    }
}

/// Host ports that read back the last value written to them.
#[derive(Default)]
pub struct LatchPorts {
    pub values: Mutex<BTreeMap<u16, Vec<u8>>>,
    pub accesses: AtomicU32,
}

impl HostPortIo for LatchPorts {
    fn read(&self, port: u16, data: &mut [u8]) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        let values = self.values.lock();
        let value = values.get(&port).map(Vec::as_slice).unwrap_or(&[]);
        for (i, b) in data.iter_mut().enumerate() {
            *b = value.get(i).copied().unwrap_or(0);
        }
    }

    fn write(&self, port: u16, data: &[u8]) {
        self.accesses.fetch_add(1, Ordering::Relaxed);
        self.values.lock().insert(port, data.to_vec());
    }
}

pub struct PermittedPorts(pub RangeInclusive<u16>);

impl IoPortPermissions for PermittedPorts {
    fn access_permitted(&self, ports: RangeInclusive<u16>) -> bool {
        self.0.contains(ports.start()) && self.0.contains(ports.end())
    }
}

#[derive(Debug, Default)]
pub struct TestRegisters {
    pub state: CpuRegisters,
    pub writebacks: u32,
    pub injected: Vec<PendingException>,
}

impl GuestRegisters for TestRegisters {
    fn registers(&mut self) -> CpuRegisters {
        self.state
    }

    fn set_registers(&mut self, registers: &CpuRegisters) {
        self.state = *registers;
        self.writebacks += 1;
    }

    fn inject_exception(&mut self, exception: PendingException) {
        self.injected.push(exception);
    }
}

/// One step of a scripted instruction.
#[derive(Debug, Copy, Clone)]
pub enum Op {
    /// Load `size` bytes at `addr` into GP register `reg`.
    Load { addr: u64, size: u32, reg: usize },
    /// Store GP register `reg` to `size` bytes at `addr`.
    Store { addr: u64, size: u32, reg: usize },
    Undecodable,
    Fault(PendingException),
}

/// The length of every scripted instruction.
pub const INSTRUCTION_LEN: u64 = 6;

/// An emulator that runs the same scripted instruction every time.
pub struct ScriptedEmulator {
    pub ops: Vec<Op>,
    pub runs: AtomicU32,
}

impl ScriptedEmulator {
    pub fn new(ops: Vec<Op>) -> Arc<Self> {
        Arc::new(Self {
            ops,
            runs: AtomicU32::new(0),
        })
    }

    pub fn runs(&self) -> u32 {
        self.runs.load(Ordering::Relaxed)
    }
}

impl InstructionEmulator for ScriptedEmulator {
    fn emulate_one(
        &self,
        context: &mut EmulationContext,
        io: &mut dyn EmulatorIo,
    ) -> EmulateResult {
        self.runs.fetch_add(1, Ordering::Relaxed);
        context
            .instruction_bytes
            .extend_from_slice(&[0x8b, 0x05, 0x00, 0x10, 0x00, 0x00]);
        for op in &self.ops {
            match *op {
                Op::Load { addr, size, reg } => match io.read(AccessKind::Mmio, addr, size) {
                    Ok(Some(value)) => context.registers.gps[reg] = value,
                    Ok(None) => return EmulateResult::Retry,
                    Err(_) => return EmulateResult::Unhandleable,
                },
                Op::Store { addr, size, reg } => {
                    if io
                        .write(AccessKind::Mmio, addr, size, context.registers.gps[reg])
                        .is_err()
                    {
                        return EmulateResult::Unhandleable;
                    }
                }
                Op::Undecodable => return EmulateResult::Unhandleable,
                Op::Fault(exception) => return EmulateResult::Exception(exception),
            }
        }
        context.registers.rip += INSTRUCTION_LEN;
        EmulateResult::Completed
    }
}

/// A dispatcher with recording collaborators and a single VP.
pub struct Harness {
    pub dispatcher: IoDispatcher,
    pub vcpu: VcpuIo,
    pub notify: Arc<RecordingNotify>,
    pub domain: Arc<RecordingDomain>,
    pub memory: Arc<FlatMemory>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(IoDispatcherConfig::default(), |builder| builder)
    }

    pub fn with(
        config: IoDispatcherConfig,
        f: impl FnOnce(IoDispatcherBuilder) -> IoDispatcherBuilder,
    ) -> Self {
        init_tracing();
        let notify = Arc::new(RecordingNotify::default());
        let domain = Arc::new(RecordingDomain::default());
        let memory = Arc::new(FlatMemory::default());
        let builder =
            IoDispatcherBuilder::new(config, memory.clone(), notify.clone(), domain.clone());
        let dispatcher = f(builder).build().unwrap();
        Self {
            dispatcher,
            vcpu: VcpuIo::new(0, Arc::new(IoRequestSlot::new())),
            notify,
            domain,
            memory,
        }
    }

    /// Plays the device model: claims the posted request and responds.
    pub fn respond(&self, data: u64) {
        let dm = self.vcpu.slot().device_model();
        dm.start().unwrap();
        dm.respond(data);
    }
}
