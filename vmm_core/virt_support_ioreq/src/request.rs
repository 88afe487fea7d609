// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The in-memory representation of an I/O request.

use ioreq_protocol::IoRequestFlags;
use ioreq_protocol::IoRequestWire;
use ioreq_protocol::IoreqState;
use ioreq_protocol::IoreqType;

/// The direction of an access.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoDirection {
    Read,
    Write,
}

/// The kind of an I/O request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoKind {
    /// Port I/O.
    Pio,
    /// Memory-mapped I/O.
    Mmio,
    /// Guest clock offset update.
    TimeOffset,
    /// Device model mapping cache invalidation.
    Invalidate,
}

impl IoKind {
    pub(crate) fn to_wire(self) -> IoreqType {
        match self {
            IoKind::Pio => IoreqType::PIO,
            IoKind::Mmio => IoreqType::COPY,
            IoKind::TimeOffset => IoreqType::TIMEOFFSET,
            IoKind::Invalidate => IoreqType::INVALIDATE,
        }
    }
}

/// A valid access size.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum AccessSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
    Qword = 8,
}

impl AccessSize {
    /// Returns the access size for `size` bytes, if representable.
    pub fn new(size: u32) -> Option<Self> {
        Some(match size {
            1 => Self::Byte,
            2 => Self::Word,
            4 => Self::Dword,
            8 => Self::Qword,
            _ => return None,
        })
    }

    pub fn bytes(self) -> u32 {
        self as u32
    }

    /// The mask covering a value of this size.
    pub fn mask(self) -> u64 {
        match self {
            Self::Qword => !0,
            size => (1 << (size.bytes() * 8)) - 1,
        }
    }

    /// The number of buffered ring slots a write of this size consumes.
    pub fn buffered_slots(self) -> u32 {
        if self == Self::Qword { 2 } else { 1 }
    }

    pub(crate) fn class(self) -> u8 {
        match self {
            Self::Byte => 0,
            Self::Word => 1,
            Self::Dword => 2,
            Self::Qword => 3,
        }
    }
}

/// The data operand of a request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IoData {
    /// An inline value. For reads, this is replaced by the result.
    Value(u64),
    /// The guest physical address of a buffer holding `count` elements.
    GuestPointer(u64),
}

impl IoData {
    pub fn is_pointer(&self) -> bool {
        matches!(self, IoData::GuestPointer(_))
    }

    fn raw(&self) -> u64 {
        match *self {
            IoData::Value(v) | IoData::GuestPointer(v) => v,
        }
    }
}

/// A single I/O request.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct IoRequest {
    pub dir: IoDirection,
    pub kind: IoKind,
    /// Port number or guest physical address.
    pub addr: u64,
    pub size: AccessSize,
    /// Repetition count.
    pub count: u32,
    pub data: IoData,
    /// String operations walk memory downwards.
    pub decrement: bool,
}

impl IoRequest {
    pub fn is_read(&self) -> bool {
        self.dir == IoDirection::Read
    }

    /// Returns true if a response to this request carries a value that the
    /// requester consumes.
    pub fn expects_value(&self) -> bool {
        self.is_read() && !self.data.is_pointer()
    }

    /// Encodes the request into a slot in the given state.
    pub fn to_wire(&self, state: IoreqState) -> IoRequestWire {
        IoRequestWire {
            addr: self.addr,
            data: self.data.raw(),
            count: self.count,
            size: self.size.bytes(),
            state,
            flags: IoRequestFlags::new()
                .with_write(self.dir == IoDirection::Write)
                .with_data_is_ptr(self.data.is_pointer())
                .with_df(self.decrement),
            kind: self.kind.to_wire(),
            reserved: [0; 5],
        }
    }
}
