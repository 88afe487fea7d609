// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use crate::tests::common::*;
use ioreq_protocol::IoreqState;
use ioreq_protocol::IoreqType;
use std::sync::Arc;
use virt_support_ioreq::AccessKind;
use virt_support_ioreq::BufferedIoRing;
use virt_support_ioreq::DispatchError;
use virt_support_ioreq::DispatchOutcome;
use virt_support_ioreq::IoAccess;
use virt_support_ioreq::IoDispatcherConfig;
use virt_support_ioreq::ResponseOutcome;

#[test]
fn zero_time_offset_is_a_no_op() {
    let mut h = Harness::new();
    assert_eq!(h.dispatcher.send_time_offset(&mut h.vcpu, 0).unwrap(), None);
    let ring = h.dispatcher.buffered_ring().unwrap();
    assert_eq!(ring.write_pointer(), 0);
    assert_eq!(h.vcpu.slot().state(), IoreqState::NONE);
    assert!(h.notify.notified.lock().is_empty());
}

#[test]
fn time_offset_is_buffered() {
    let mut h = Harness::new();
    let outcome = h.dispatcher.send_time_offset(&mut h.vcpu, -5).unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Completed));

    let ring = h.dispatcher.buffered_ring().unwrap();
    assert_eq!(ring.write_pointer(), 2);
    let low = ring.pop().unwrap();
    let high = ring.pop().unwrap();
    assert_eq!(low.kind, IoreqType::TIMEOFFSET);
    assert_eq!(low.size_class, 3);
    assert_eq!(low.data | (high.data << 32), -5i64 as u64);
    assert_eq!(h.vcpu.slot().state(), IoreqState::NONE);
}

#[test]
fn time_offset_falls_back_when_ring_full() {
    let ring = Arc::new(BufferedIoRing::new(2).unwrap());
    let mut h = Harness::with(IoDispatcherConfig::default(), |builder| {
        builder.buffered_ring(ring.clone())
    });
    let _ = h
        .dispatcher
        .dispatch(&mut h.vcpu, IoAccess::write(AccessKind::Mmio, 0xa0000, 1, 1))
        .unwrap();

    let outcome = h.dispatcher.send_time_offset(&mut h.vcpu, 1000).unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Pending));
    let wire = h.vcpu.slot().snapshot();
    assert_eq!(wire.kind, IoreqType::TIMEOFFSET);
    assert_eq!(wire.state, IoreqState::READY);
    assert_eq!(wire.size, 8);
    assert_eq!(wire.data, 1000);
    assert!(wire.flags.write());
    assert_eq!(*h.notify.notified.lock(), vec![0]);

    // The response carries nothing for the VP.
    let mut regs = TestRegisters::default();
    h.respond(0);
    assert_eq!(
        h.dispatcher.on_response(&mut h.vcpu, &mut regs).unwrap(),
        ResponseOutcome::Completed
    );
    assert!(h.vcpu.take_completed_read().is_none());
}

#[test]
fn time_offset_without_ring_uses_channel() {
    let config = IoDispatcherConfig {
        buffered_slots: 0,
        ..Default::default()
    };
    let mut h = Harness::with(config, |builder| builder);
    let outcome = h.dispatcher.send_time_offset(&mut h.vcpu, 1).unwrap();
    assert_eq!(outcome, Some(DispatchOutcome::Pending));
}

#[test]
fn invalidate_goes_to_channel() {
    let mut h = Harness::new();
    let outcome = h.dispatcher.send_invalidate(&mut h.vcpu).unwrap();
    assert_eq!(outcome, DispatchOutcome::Pending);
    let wire = h.vcpu.slot().snapshot();
    assert_eq!(wire.kind, IoreqType::INVALIDATE);
    assert_eq!(wire.size, 4);
    assert_eq!(wire.data, !0);
    assert!(wire.flags.write());
    assert_eq!(h.dispatcher.buffered_ring().unwrap().write_pointer(), 0);

    // Only one request at a time.
    assert!(matches!(
        h.dispatcher.send_invalidate(&mut h.vcpu),
        Err(DispatchError::RequestPending { .. })
    ));
}
