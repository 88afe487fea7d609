// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::tests::common::*;
use ioreq_protocol::IoreqState;
use ioreq_protocol::IoreqType;
use std::sync::Arc;
use virt_support_ioreq::InterceptResult;
use virt_support_ioreq::IoData;
use virt_support_ioreq::IoDispatcherConfig;
use virt_support_ioreq::IoRequest;
use virt_support_ioreq::MmioIntercept;
use virt_support_ioreq::MmioOutcome;
use virt_support_ioreq::PendingException;
use virt_support_ioreq::ResponseOutcome;

const RAX: usize = 0;
const RCX: usize = 1;

fn harness(ops: Vec<Op>) -> (Harness, Arc<ScriptedEmulator>) {
    let emulator = ScriptedEmulator::new(ops);
    let h = Harness::with(IoDispatcherConfig::default(), |builder| {
        builder.emulator(emulator.clone())
    });
    (h, emulator)
}

fn registers() -> TestRegisters {
    let mut regs = TestRegisters::default();
    regs.state.rip = 0x1000;
    regs.state.cs = 0x10;
    regs
}

struct Register(u64);

impl MmioIntercept for Register {
    fn handle_mmio(&self, request: &mut IoRequest) -> InterceptResult {
        if request.is_read() {
            request.data = IoData::Value(self.0);
        }
        InterceptResult::Handled
    }
}

#[test]
fn fast_path_load_retires() {
    let (mut h, emulator) = harness(vec![Op::Load {
        addr: 0xfee00030,
        size: 4,
        reg: RAX,
    }]);
    h.dispatcher
        .register_mmio(0xfee00000..=0xfee00fff, "apic", Arc::new(Register(0x50014)))
        .unwrap();
    let mut regs = registers();

    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::Emulated);
    assert_eq!(regs.state.gps[RAX], 0x50014);
    assert_eq!(regs.state.rip, 0x1000 + INSTRUCTION_LEN);
    assert_eq!(regs.writebacks, 1);
    assert!(!h.vcpu.mmio_in_progress());
    assert_eq!(emulator.runs(), 1);
    assert!(h.notify.notified.lock().is_empty());
}

#[test]
fn forwarded_load_resumes_on_response() {
    let (mut h, emulator) = harness(vec![Op::Load {
        addr: 0xe0001000,
        size: 4,
        reg: RCX,
    }]);
    let mut regs = registers();

    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::Pending);
    assert!(h.vcpu.mmio_in_progress());
    assert_eq!(regs.writebacks, 0);
    assert_eq!(regs.state.rip, 0x1000);
    let wire = h.vcpu.slot().snapshot();
    assert_eq!(wire.state, IoreqState::READY);
    assert_eq!(wire.kind, IoreqType::COPY);
    assert_eq!(wire.addr, 0xe0001000);

    h.respond(0xcafe_f00d);
    let outcome = h.dispatcher.on_response(&mut h.vcpu, &mut regs).unwrap();
    assert_eq!(outcome, ResponseOutcome::Resumed(MmioOutcome::Emulated));
    assert_eq!(regs.state.gps[RCX], 0xcafe_f00d);
    assert_eq!(regs.state.rip, 0x1000 + INSTRUCTION_LEN);
    assert_eq!(emulator.runs(), 2);
    assert!(!h.vcpu.mmio_in_progress());
    assert!(h.vcpu.take_completed_read().is_none());
    // The read went to the device model exactly once.
    assert_eq!(h.vcpu.io_count(), 1);
}

#[test]
fn resumed_instruction_posts_store() {
    let (mut h, emulator) = harness(vec![
        Op::Load {
            addr: 0xe0001000,
            size: 4,
            reg: RAX,
        },
        Op::Store {
            addr: 0xe0002000,
            size: 4,
            reg: RAX,
        },
    ]);
    let mut regs = registers();

    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::Pending);

    // The resumed run consumes the load result and posts the store.
    h.respond(0x77);
    let outcome = h.dispatcher.on_response(&mut h.vcpu, &mut regs).unwrap();
    assert_eq!(outcome, ResponseOutcome::Resumed(MmioOutcome::Emulated));
    assert_eq!(regs.state.gps[RAX], 0x77);
    assert_eq!(regs.state.rip, 0x1000 + INSTRUCTION_LEN);
    assert_eq!(regs.writebacks, 1);
    let wire = h.vcpu.slot().snapshot();
    assert_eq!(wire.state, IoreqState::READY);
    assert_eq!(wire.addr, 0xe0002000);
    assert_eq!(wire.data, 0x77);
    assert!(wire.flags.write());
    assert!(h.vcpu.mmio_in_progress());
    assert_eq!(emulator.runs(), 2);
    assert_eq!(*h.notify.notified.lock(), vec![0, 0]);

    // The store's completion retires without running the instruction again.
    h.respond(0);
    let outcome = h.dispatcher.on_response(&mut h.vcpu, &mut regs).unwrap();
    assert_eq!(outcome, ResponseOutcome::Completed);
    assert_eq!(emulator.runs(), 2);
    assert_eq!(regs.writebacks, 1);
    assert!(!h.vcpu.mmio_in_progress());
    assert_eq!(h.vcpu.slot().state(), IoreqState::NONE);
    assert_eq!(h.vcpu.io_count(), 2);
    assert!(h.domain.crashes.lock().is_empty());
}

#[test]
fn posted_store_retires_immediately() {
    let (mut h, emulator) = harness(vec![Op::Store {
        addr: 0xe0002000,
        size: 8,
        reg: RAX,
    }]);
    let mut regs = registers();
    regs.state.gps[RAX] = 0x0123_4567_89ab_cdef;

    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::Emulated);
    assert_eq!(regs.state.rip, 0x1000 + INSTRUCTION_LEN);
    let wire = h.vcpu.slot().snapshot();
    assert!(wire.flags.write());
    assert_eq!(wire.data, 0x0123_4567_89ab_cdef);
    assert!(h.vcpu.mmio_in_progress());

    // The write's completion does not re-run the instruction.
    h.respond(0);
    let outcome = h.dispatcher.on_response(&mut h.vcpu, &mut regs).unwrap();
    assert_eq!(outcome, ResponseOutcome::Completed);
    assert_eq!(emulator.runs(), 1);
    assert!(!h.vcpu.mmio_in_progress());
    assert_eq!(regs.writebacks, 1);
}

#[test]
fn buffered_store() {
    let (mut h, _emulator) = harness(vec![Op::Store {
        addr: 0xb8000,
        size: 2,
        reg: RAX,
    }]);
    let mut regs = registers();
    regs.state.gps[RAX] = 0x0741;
    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::Emulated);
    assert!(!h.vcpu.mmio_in_progress());
    assert_eq!(h.vcpu.slot().state(), IoreqState::NONE);
    let entry = h.dispatcher.buffered_ring().unwrap().pop().unwrap();
    assert_eq!(entry.data, 0x0741);
}

#[test]
fn unhandleable_instruction() {
    let (mut h, _emulator) = harness(vec![Op::Undecodable]);
    let mut regs = registers();
    let before = regs.state;
    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::NotEmulated);
    assert_eq!(regs.state, before);
    assert_eq!(regs.writebacks, 0);
    assert!(regs.injected.is_empty());
    assert!(!h.vcpu.mmio_in_progress());
}

#[test]
fn exception_is_injected() {
    let gp = PendingException {
        vector: 13,
        error_code: Some(0),
    };
    let (mut h, _emulator) = harness(vec![Op::Fault(gp)]);
    let mut regs = registers();
    let outcome = h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs);
    assert_eq!(outcome, MmioOutcome::ExceptionInjected);
    assert_eq!(regs.injected, vec![gp]);
    assert_eq!(regs.writebacks, 0);
    assert_eq!(regs.state.rip, 0x1000);
}

#[test]
fn no_emulator() {
    let mut h = Harness::new();
    let mut regs = registers();
    assert_eq!(
        h.dispatcher.handle_mmio(&mut h.vcpu, &mut regs),
        MmioOutcome::NotEmulated
    );
}
