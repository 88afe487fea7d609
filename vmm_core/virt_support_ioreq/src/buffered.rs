// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The buffered I/O ring, a fixed-size queue of fire-and-forget writes shared
//! with the device model.
//!
//! Producers are the partition's VPs, serialized by a short write lock. The
//! consumer is the device model, which never takes the lock: it observes
//! `write_pointer` with acquire ordering and publishes its progress through
//! `read_pointer`. The two pointers are updated together as one 64-bit word,
//! and are reduced modulo the capacity to index a slot. Before producing, the
//! writer pulls both pointers back by the same multiple of the capacity once
//! the read pointer has passed it, so they never reach the `u32` wrap, where
//! a capacity that is not a power of two would alias slots.

use crate::request::IoData;
use crate::request::IoDirection;
use crate::request::IoRequest;
use ioreq_protocol::BUFFERED_ADDRESS_LIMIT;
use ioreq_protocol::BUFFERED_SLOT_COUNT;
use ioreq_protocol::BufferedIoPageHeader;
use ioreq_protocol::BufferedIoreqWire;
use ioreq_protocol::IoreqDir;
use ioreq_protocol::PAGE_SIZE;
use ioreq_protocol::buffered_slot_offset;
use parking_lot::Mutex;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::atomic::fence;
use thiserror::Error;
use zerocopy::IntoBytes;

/// The reason a request was not placed in the ring.
///
/// None of these are failures of the request itself; the caller is expected
/// to send it through the synchronous channel instead.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum BufferedReject {
    #[error("address {0:#x} does not fit in a buffered entry")]
    AddressOutOfRange(u64),
    #[error("guest memory operands cannot be buffered")]
    GuestPointer,
    #[error("repeat count {0} cannot be buffered")]
    RepeatCount(u32),
    #[error("only writes can be buffered")]
    NotWrite,
    #[error("ring is full")]
    Full,
}

/// The requested capacity does not fit in the shared page.
#[derive(Debug, Error)]
#[error("invalid buffered ring capacity {0}, must be 1..={BUFFERED_SLOT_COUNT}")]
pub struct InvalidCapacity(pub usize);

/// One ring slot, stored as the two native-endian words of its wire image.
#[derive(Debug, Default)]
struct Slot {
    header: AtomicU64,
    data: AtomicU64,
}

impl Slot {
    fn store(&self, entry: &BufferedIoreqWire) {
        let bytes = entry.as_bytes();
        let mut header = [0; 8];
        header.copy_from_slice(&bytes[..8]);
        self.header
            .store(u64::from_ne_bytes(header), Ordering::Relaxed);
        self.data.store(entry.data, Ordering::Relaxed);
    }

    fn load(&self) -> BufferedIoreqWire {
        let mut bytes = [0u8; size_of::<BufferedIoreqWire>()];
        bytes[..8].copy_from_slice(&self.header.load(Ordering::Relaxed).to_ne_bytes());
        bytes[8..].copy_from_slice(&self.data.load(Ordering::Relaxed).to_ne_bytes());
        zerocopy::transmute!(bytes)
    }
}

/// Packs the read and write pointers the way they sit in the page header.
fn join(read: u32, write: u32) -> u64 {
    (read as u64) | ((write as u64) << 32)
}

fn split(pointers: u64) -> (u32, u32) {
    (pointers as u32, (pointers >> 32) as u32)
}

/// The buffered I/O ring for one partition.
#[derive(Debug)]
pub struct BufferedIoRing {
    slots: Box<[Slot]>,
    /// Read pointer in the low half, write pointer in the high half.
    pointers: AtomicU64,
    /// Serializes producers. Never held across anything that can block.
    write_lock: Mutex<()>,
}

impl BufferedIoRing {
    /// Creates a ring with `capacity` slots.
    pub fn new(capacity: usize) -> Result<Self, InvalidCapacity> {
        if capacity == 0 || capacity > BUFFERED_SLOT_COUNT {
            return Err(InvalidCapacity(capacity));
        }
        Ok(Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            pointers: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        })
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn pointers(&self) -> (u32, u32) {
        split(self.pointers.load(Ordering::Acquire))
    }

    pub fn read_pointer(&self) -> u32 {
        self.pointers().0
    }

    pub fn write_pointer(&self) -> u32 {
        self.pointers().1
    }

    /// The number of produced entries not yet consumed.
    ///
    /// The read pointer is written by the device model, so this may exceed
    /// the capacity if it has been corrupted.
    pub fn pending(&self) -> u32 {
        let (read, write) = self.pointers();
        write.wrapping_sub(read)
    }

    fn slot(&self, pointer: u32) -> &Slot {
        &self.slots[pointer as usize % self.slots.len()]
    }

    /// Pulls both pointers back by the largest multiple of the capacity not
    /// above the read pointer. Slot indices are unchanged.
    fn normalize(&self, read: u32, write: u32) -> (u32, u32) {
        let capacity = self.slots.len() as u32;
        let rebase = read / capacity * capacity;
        (read - rebase, write.wrapping_sub(rebase))
    }

    /// Appends a write to the ring.
    ///
    /// Never blocks on the consumer. A rejected request has not been queued
    /// and must be sent through the synchronous channel.
    pub fn enqueue(&self, request: &IoRequest) -> Result<(), BufferedReject> {
        if request.addr > BUFFERED_ADDRESS_LIMIT {
            return Err(BufferedReject::AddressOutOfRange(request.addr));
        }
        let IoData::Value(value) = request.data else {
            return Err(BufferedReject::GuestPointer);
        };
        if request.count != 1 {
            return Err(BufferedReject::RepeatCount(request.count));
        }
        if request.dir != IoDirection::Write {
            return Err(BufferedReject::NotWrite);
        }

        let mut entry = BufferedIoreqWire {
            kind: request.kind.to_wire(),
            dir: IoreqDir::WRITE,
            size_class: request.size.class(),
            reserved: 0,
            addr: request.addr as u32,
            data: value,
        };
        let needed = request.size.buffered_slots();

        let _guard = self.write_lock.lock();
        let (read, write) = self.pointers();
        // Computed in u64 so that a read pointer the device model moved past
        // the write pointer looks full rather than empty.
        if write.wrapping_sub(read) as u64 + needed as u64 > self.slots.len() as u64 {
            return Err(BufferedReject::Full);
        }
        let (_, write) = self.normalize(read, write);

        if needed == 2 {
            entry.data = value & 0xffff_ffff;
            self.slot(write).store(&entry);
            entry.data = value >> 32;
            self.slot(write.wrapping_add(1)).store(&entry);
        } else {
            self.slot(write).store(&entry);
        }

        // Make the entries visible before the write pointer.
        fence(Ordering::Release);
        // The consumer may move the read pointer concurrently. The write
        // half only changes under the lock.
        let mut observed = self.pointers.load(Ordering::Acquire);
        loop {
            let (read, write) = split(observed);
            let (read, write) = self.normalize(read, write);
            let next = join(read, write.wrapping_add(needed));
            match self.pointers.compare_exchange(
                observed,
                next,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => observed = actual,
            }
        }
        Ok(())
    }

    /// Consumes the oldest entry.
    ///
    /// This is the device model side of the ring, for in-process device
    /// models. It must only be called from a single consumer.
    pub fn pop(&self) -> Option<BufferedIoreqWire> {
        let (read, write) = self.pointers();
        if read == write {
            return None;
        }
        let entry = self.slot(read).load();
        self.advance_read(|read| read.wrapping_add(1));
        Some(entry)
    }

    /// Moves the read pointer, as the device model would.
    pub fn set_read_pointer(&self, value: u32) {
        self.advance_read(|_| value);
    }

    /// Rewrites the read half only. A producer may rebase both halves
    /// concurrently, which `f` sees as a different starting value.
    fn advance_read(&self, f: impl Fn(u32) -> u32) {
        let _ = self
            .pointers
            .fetch_update(Ordering::Release, Ordering::Acquire, |pointers| {
                let (read, write) = split(pointers);
                Some(join(f(read), write))
            });
    }

    /// Returns the entry at ring position `pointer`.
    pub fn entry(&self, pointer: u32) -> BufferedIoreqWire {
        self.slot(pointer).load()
    }

    /// Writes the shared page image of the ring into `page`.
    pub fn write_page(&self, page: &mut [u8; PAGE_SIZE]) {
        let (read_pointer, write_pointer) = self.pointers();
        let header = BufferedIoPageHeader {
            read_pointer,
            write_pointer,
            reserved: 0,
        };
        page.fill(0);
        page[..size_of::<BufferedIoPageHeader>()].copy_from_slice(header.as_bytes());
        for (i, slot) in self.slots.iter().enumerate() {
            let offset = buffered_slot_offset(i);
            page[offset..offset + size_of::<BufferedIoreqWire>()]
                .copy_from_slice(slot.load().as_bytes());
        }
    }
}
