// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The synchronous request slot shared with the device model.
//!
//! Each VP owns one slot. There is no lock: the guest side fills in the
//! request fields and publishes them with a release store of the state byte,
//! and the device model does the same in the other direction. A reader must
//! observe the state with acquire ordering before reading any other field.
//!
//! Everything read back from the slot was last written by the device model,
//! which is not trusted. Callers must validate what they read rather than
//! assume the slot still holds what they wrote.

use crate::request::IoRequest;
use ioreq_protocol::IoRequestFlags;
use ioreq_protocol::IoRequestWire;
use ioreq_protocol::IoreqState;
use ioreq_protocol::IoreqType;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use thiserror::Error;
use zerocopy::IntoBytes;

/// The slot was not in the expected state.
#[derive(Debug, Error)]
#[error("unexpected request slot state {found:?}, expected {expected:?}")]
pub struct UnexpectedState {
    pub found: IoreqState,
    pub expected: IoreqState,
}

/// A single synchronous request slot.
#[derive(Debug, Default)]
pub struct IoRequestSlot {
    addr: AtomicU64,
    data: AtomicU64,
    count: AtomicU32,
    size: AtomicU32,
    state: AtomicU8,
    flags: AtomicU8,
    kind: AtomicU8,
}

impl IoRequestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current state.
    pub fn state(&self) -> IoreqState {
        IoreqState(self.state.load(Ordering::Acquire))
    }

    fn store_fields(&self, wire: &IoRequestWire) {
        self.addr.store(wire.addr, Ordering::Relaxed);
        self.data.store(wire.data, Ordering::Relaxed);
        self.count.store(wire.count, Ordering::Relaxed);
        self.size.store(wire.size, Ordering::Relaxed);
        self.flags.store(wire.flags.into_bits(), Ordering::Relaxed);
        self.kind.store(wire.kind.0, Ordering::Relaxed);
    }

    fn load_fields(&self, state: IoreqState) -> IoRequestWire {
        IoRequestWire {
            addr: self.addr.load(Ordering::Relaxed),
            data: self.data.load(Ordering::Relaxed),
            count: self.count.load(Ordering::Relaxed),
            size: self.size.load(Ordering::Relaxed),
            state,
            flags: IoRequestFlags::from_bits(self.flags.load(Ordering::Relaxed)),
            kind: IoreqType(self.kind.load(Ordering::Relaxed)),
            reserved: [0; 5],
        }
    }

    /// Writes `request` into the slot and then publishes `state`.
    ///
    /// The release store on the state orders every field write before it, so
    /// a peer that acquires `state` sees the complete request.
    pub fn publish(&self, request: &IoRequest, state: IoreqState) {
        self.store_fields(&request.to_wire(state));
        self.state.store(state.0, Ordering::Release);
    }

    /// Consumes a response.
    ///
    /// Returns the slot contents as written by the device model and frees the
    /// slot. Fails without modifying the slot if the state is not
    /// [`IoreqState::RESPONSE_READY`].
    pub fn take_response(&self) -> Result<IoRequestWire, UnexpectedState> {
        let state = self.state();
        if state != IoreqState::RESPONSE_READY {
            return Err(UnexpectedState {
                found: state,
                expected: IoreqState::RESPONSE_READY,
            });
        }
        // See RESPONSE_READY, then read the contents.
        fence(Ordering::Acquire);
        let response = self.load_fields(state);
        self.state.store(IoreqState::NONE.0, Ordering::Release);
        Ok(response)
    }

    /// Returns a snapshot of the slot in its wire encoding.
    pub fn snapshot(&self) -> IoRequestWire {
        let state = self.state();
        self.load_fields(state)
    }

    /// Writes the slot's wire encoding into `buf`.
    pub fn write_to(&self, buf: &mut [u8; size_of::<IoRequestWire>()]) {
        buf.copy_from_slice(self.snapshot().as_bytes());
    }

    /// Loads the slot from its wire encoding, publishing the encoded state
    /// last.
    pub fn load_from(&self, buf: &[u8; size_of::<IoRequestWire>()]) {
        let wire: IoRequestWire = zerocopy::transmute!(*buf);
        self.store_fields(&wire);
        self.state.store(wire.state.0, Ordering::Release);
    }

    /// Returns the device model's view of this slot.
    pub fn device_model(&self) -> DeviceModelSlot<'_> {
        DeviceModelSlot { slot: self }
    }
}

/// The device model side of a request slot.
///
/// This is the peer half of the protocol, for in-process device models.
pub struct DeviceModelSlot<'a> {
    slot: &'a IoRequestSlot,
}

impl DeviceModelSlot<'_> {
    /// Returns the posted request, if there is one.
    pub fn pending(&self) -> Option<IoRequestWire> {
        let state = self.slot.state();
        (state == IoreqState::READY).then(|| self.slot.load_fields(state))
    }

    /// Claims the posted request.
    pub fn start(&self) -> Result<IoRequestWire, UnexpectedState> {
        self.slot
            .state
            .compare_exchange(
                IoreqState::READY.0,
                IoreqState::IN_PROCESS.0,
                Ordering::Acquire,
                Ordering::Acquire,
            )
            .map_err(|found| UnexpectedState {
                found: IoreqState(found),
                expected: IoreqState::READY,
            })?;
        Ok(self.slot.load_fields(IoreqState::IN_PROCESS))
    }

    /// Completes the claimed request, returning `data` to the requester.
    pub fn respond(&self, data: u64) {
        self.slot.data.store(data, Ordering::Relaxed);
        self.slot
            .state
            .store(IoreqState::RESPONSE_READY.0, Ordering::Release);
    }

    /// Stores an arbitrary state byte.
    ///
    /// Nothing stops a device model from writing any value here, so the
    /// requester side has to cope with it.
    pub fn store_raw_state(&self, state: u8) {
        self.slot.state.store(state, Ordering::Release);
    }
}
