// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared-memory layouts for I/O requests exchanged between the hypervisor
//! and an external device model.
//!
//! Two pages are shared with the device model:
//!
//! - a per-VP synchronous request page, holding one [`IoRequestWire`] slot
//!   per virtual processor, and
//! - a per-partition buffered I/O page ([`BufferedIoPageHeader`] followed by
//!   [`BUFFERED_SLOT_COUNT`] [`BufferedIoreqWire`] entries) used for
//!   fire-and-forget writes.
//!
//! The structures here are the wire contract. They contain explicit reserved
//! fields so that their encoding never depends on compiler-inserted padding,
//! and they should only be accessed through `zerocopy`.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;
use std::fmt;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Size of a shared page.
pub const PAGE_SIZE: usize = 4096;

/// The largest address that can be encoded in a buffered entry.
pub const BUFFERED_ADDRESS_LIMIT: u64 = (1 << 20) - 1;

/// Number of buffered entries that fit in the buffered I/O page.
pub const BUFFERED_SLOT_COUNT: usize =
    (PAGE_SIZE - size_of::<BufferedIoPageHeader>()) / size_of::<BufferedIoreqWire>();

/// Number of synchronous request slots in the per-VP request page.
pub const IOREQ_SLOTS_PER_PAGE: usize = PAGE_SIZE / size_of::<IoRequestWire>();

macro_rules! wire_enum {
    (
        $(#[$a:meta])*
        pub struct $name:ident: u8 {
            $($(#[$va:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$a])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, Immutable, KnownLayout, FromBytes)]
        pub struct $name(pub u8);

        impl $name {
            $($(#[$va])* pub const $variant: Self = Self($value);)*
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    Self(v) => write!(f, "{}({:#x})", stringify!($name), v),
                }
            }
        }
    };
}

wire_enum! {
    /// The state of a synchronous request slot.
    ///
    /// The state byte is the only field whose update orders the rest of the
    /// slot. Values outside the defined set can be written by a misbehaving
    /// device model and must be treated as a protocol violation.
    pub struct IoreqState: u8 {
        /// The slot is free.
        NONE = 0,
        /// The request has been posted to the device model.
        READY = 1,
        /// The device model is processing the request.
        IN_PROCESS = 2,
        /// The device model has written its response.
        RESPONSE_READY = 3,
    }
}

wire_enum! {
    /// The kind of an I/O request.
    pub struct IoreqType: u8 {
        /// Port I/O.
        PIO = 0,
        /// Memory-mapped I/O.
        COPY = 1,
        /// Guest clock offset update.
        TIMEOFFSET = 7,
        /// Invalidate the device model's guest memory mapping cache.
        INVALIDATE = 8,
    }
}

wire_enum! {
    /// The direction of a buffered entry.
    pub struct IoreqDir: u8 {
        /// Read from the device.
        READ = 0,
        /// Write to the device.
        WRITE = 1,
    }
}

/// Flags for a synchronous request slot.
#[bitfield(u8)]
#[derive(PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IoRequestFlags {
    /// The request is a write.
    pub write: bool,
    /// `data` holds a guest physical address of `count` elements rather than
    /// an inline value.
    pub data_is_ptr: bool,
    /// Elements are addressed in decreasing order.
    pub df: bool,
    #[bits(5)]
    _reserved: u8,
}

/// A synchronous request slot.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct IoRequestWire {
    /// Port number or guest physical address.
    pub addr: u64,
    /// Inline value or guest physical address of the data buffer.
    pub data: u64,
    /// Repetition count.
    pub count: u32,
    /// Access size in bytes.
    pub size: u32,
    /// Slot state.
    pub state: IoreqState,
    /// Request flags.
    pub flags: IoRequestFlags,
    /// Request kind.
    pub kind: IoreqType,
    /// Reserved, must be zero.
    pub reserved: [u8; 5],
}

const_assert_eq!(size_of::<IoRequestWire>(), 32);

/// A buffered request entry.
///
/// 8-byte writes are carried in two consecutive entries: the first holds the
/// low 32 bits of the value, the second the high 32 bits. Both carry the same
/// header fields.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BufferedIoreqWire {
    /// Request kind.
    pub kind: IoreqType,
    /// Request direction.
    pub dir: IoreqDir,
    /// Encoded access size, see [`size_class`].
    pub size_class: u8,
    /// Reserved, must be zero.
    pub reserved: u8,
    /// Address. Only the low 20 bits are significant.
    pub addr: u32,
    /// Inline value.
    pub data: u64,
}

const_assert_eq!(size_of::<BufferedIoreqWire>(), 16);

/// The header of the buffered I/O page.
///
/// Both pointers only ever increase; the slot index is the pointer modulo the
/// ring capacity. `write_pointer` is owned by the hypervisor, `read_pointer`
/// by the device model.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct BufferedIoPageHeader {
    /// Next entry the device model will consume.
    pub read_pointer: u32,
    /// Next entry the hypervisor will produce.
    pub write_pointer: u32,
    /// Reserved, must be zero.
    pub reserved: u64,
}

const_assert_eq!(size_of::<BufferedIoPageHeader>(), 16);
const_assert!(
    size_of::<BufferedIoPageHeader>() + BUFFERED_SLOT_COUNT * size_of::<BufferedIoreqWire>()
        <= PAGE_SIZE
);

/// Returns the size class for an access size in bytes.
pub const fn size_class(size: u32) -> Option<u8> {
    Some(match size {
        1 => 0,
        2 => 1,
        4 => 2,
        8 => 3,
        _ => return None,
    })
}

/// Returns the access size in bytes for a size class.
pub const fn size_from_class(class: u8) -> Option<u32> {
    Some(match class {
        0 => 1,
        1 => 2,
        2 => 4,
        3 => 8,
        _ => return None,
    })
}

/// Returns the byte offset of buffered slot `index` within the buffered page.
pub const fn buffered_slot_offset(index: usize) -> usize {
    size_of::<BufferedIoPageHeader>() + index * size_of::<BufferedIoreqWire>()
}
