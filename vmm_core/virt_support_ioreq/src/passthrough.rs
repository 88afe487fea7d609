// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Port I/O passthrough to host hardware.
//!
//! A partition may own ranges of host I/O ports, remapped to guest port
//! ranges. Guest accesses to a mapped port are performed on the host port
//! directly, without involving the device model.

use crate::ratelimit::error_ratelimited;
use crate::request::AccessSize;
use crate::request::IoData;
use crate::request::IoDirection;
use crate::request::IoRequest;
use crate::support::GuestMemoryAccess;
use crate::support::GuestMemoryError;
use parking_lot::RwLock;
use std::ops::RangeInclusive;
use thiserror::Error;

/// Real port I/O on the host.
pub trait HostPortIo: Send + Sync {
    /// Reads `data.len()` bytes (1, 2 or 4) from `port`.
    fn read(&self, port: u16, data: &mut [u8]);

    /// Writes `data` (1, 2 or 4 bytes) to `port`.
    fn write(&self, port: u16, data: &[u8]);
}

/// The partition's host I/O port capabilities.
pub trait IoPortPermissions: Send + Sync {
    /// Returns true if every port in `ports` may be accessed.
    fn access_permitted(&self, ports: RangeInclusive<u16>) -> bool;
}

/// A guest port range backed by host ports.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PassthroughPortMapping {
    pub guest_base: u16,
    pub host_base: u16,
    /// Number of ports in the range.
    pub len: u16,
}

impl PassthroughPortMapping {
    pub fn contains(&self, port: u64) -> bool {
        port >= self.guest_base as u64 && port < self.guest_base as u64 + self.len as u64
    }

    fn overlaps(&self, other: &Self) -> bool {
        let end = self.guest_base as u32 + self.len as u32;
        let other_end = other.guest_base as u32 + other.len as u32;
        (self.guest_base as u32) < other_end && (other.guest_base as u32) < end
    }
}

#[derive(Debug, Error)]
pub enum PassthroughError {
    #[error("access to guest port {guest_port:#x} (host ports {host_ports:#x?}) denied")]
    PermissionDenied {
        guest_port: u16,
        host_ports: RangeInclusive<u64>,
    },
    #[error("unsupported port access size {0}")]
    UnsupportedSize(u32),
    #[error("guest memory copy failed after {completed} of {count} iterations")]
    GuestCopy {
        completed: u32,
        count: u32,
        #[source]
        error: GuestMemoryError,
    },
}

/// The result of offering a request to the passthrough intercept.
#[derive(Debug)]
pub enum PassthroughOutcome {
    /// The port is not passed through.
    NotHandled,
    /// The access was performed.
    Handled,
    /// The port is passed through but the access was not performed. This
    /// must not be forwarded anywhere else.
    Refused(PassthroughError),
}

/// The passthrough port mappings of a partition.
///
/// Mappings are searched linearly and the first match wins. Ranges are
/// expected not to overlap; overlapping ranges are accepted but logged, and
/// resolve in insertion order.
#[derive(Debug, Default)]
pub struct PassthroughPorts {
    mappings: RwLock<Vec<PassthroughPortMapping>>,
}

impl PassthroughPorts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, mapping: PassthroughPortMapping) {
        let mut mappings = self.mappings.write();
        if let Some(existing) = mappings.iter().find(|m| m.overlaps(&mapping)) {
            tracing::warn!(
                guest_base = mapping.guest_base,
                len = mapping.len,
                existing_guest_base = existing.guest_base,
                existing_len = existing.len,
                "overlapping passthrough port mapping, earlier mapping takes precedence"
            );
        }
        mappings.push(mapping);
    }

    /// Removes the mapping starting at guest port `guest_base`.
    pub fn remove(&self, guest_base: u16) -> Option<PassthroughPortMapping> {
        let mut mappings = self.mappings.write();
        let index = mappings.iter().position(|m| m.guest_base == guest_base)?;
        Some(mappings.remove(index))
    }

    pub fn find(&self, port: u64) -> Option<PassthroughPortMapping> {
        self.mappings
            .read()
            .iter()
            .find(|m| m.contains(port))
            .copied()
    }
}

/// Performs passthrough port I/O for a partition.
pub struct PassthroughPortIntercept<'a> {
    pub ports: &'a PassthroughPorts,
    pub hardware: &'a dyn HostPortIo,
    pub permissions: &'a dyn IoPortPermissions,
    pub guest_memory: &'a dyn GuestMemoryAccess,
}

impl PassthroughPortIntercept<'_> {
    /// Offers `request` to the intercept.
    ///
    /// For inline reads the result is written back to `request.data`.
    pub fn try_handle(&self, request: &mut IoRequest) -> PassthroughOutcome {
        let Some(mapping) = self.ports.find(request.addr) else {
            return PassthroughOutcome::NotHandled;
        };

        let host_port = request.addr - mapping.guest_base as u64 + mapping.host_base as u64;
        let host_ports = host_port..=host_port + request.size.bytes() as u64 - 1;

        let result = if *host_ports.end() > u16::MAX as u64
            || !self
                .permissions
                .access_permitted(host_port as u16..=*host_ports.end() as u16)
        {
            Err(PassthroughError::PermissionDenied {
                guest_port: request.addr as u16,
                host_ports,
            })
        } else if request.size == AccessSize::Qword {
            Err(PassthroughError::UnsupportedSize(request.size.bytes()))
        } else {
            match request.dir {
                IoDirection::Read => self.read(host_port as u16, request),
                IoDirection::Write => self.write(host_port as u16, request),
            }
        };

        if let Err(err) = &result {
            error_ratelimited!(
                guest_port = request.addr,
                host_port,
                size = request.size.bytes(),
                error = err as &dyn std::error::Error,
                "passthrough port access failed"
            );
        }

        match result {
            Ok(()) => PassthroughOutcome::Handled,
            // Iterations before the failure have already reached the hardware.
            Err(PassthroughError::GuestCopy { .. }) => PassthroughOutcome::Handled,
            Err(err) => {
                if let (IoDirection::Read, IoData::Value(v)) = (request.dir, &mut request.data) {
                    *v = request.size.mask();
                }
                PassthroughOutcome::Refused(err)
            }
        }
    }

    /// The guest address of element `i` of a pointer operand.
    fn element_gpa(request: &IoRequest, base: u64, i: u32) -> u64 {
        let offset = i as u64 * request.size.bytes() as u64;
        if request.decrement {
            base.wrapping_sub(offset)
        } else {
            base.wrapping_add(offset)
        }
    }

    fn read(&self, port: u16, request: &mut IoRequest) -> Result<(), PassthroughError> {
        let len = request.size.bytes() as usize;
        for i in 0..request.count {
            let mut buf = [0u8; 8];
            self.hardware.read(port, &mut buf[..len]);
            let data = request.data;
            match data {
                IoData::Value(_) => request.data = IoData::Value(u64::from_le_bytes(buf)),
                IoData::GuestPointer(base) => {
                    let gpa = Self::element_gpa(request, base, i);
                    self.guest_memory
                        .write_at(gpa, &buf[..len])
                        .map_err(|error| PassthroughError::GuestCopy {
                            completed: i,
                            count: request.count,
                            error,
                        })?;
                }
            }
        }
        Ok(())
    }

    fn write(&self, port: u16, request: &IoRequest) -> Result<(), PassthroughError> {
        let len = request.size.bytes() as usize;
        for i in 0..request.count {
            let buf = match request.data {
                IoData::Value(v) => v.to_le_bytes(),
                IoData::GuestPointer(base) => {
                    let mut buf = [0u8; 8];
                    let gpa = Self::element_gpa(request, base, i);
                    self.guest_memory
                        .read_at(gpa, &mut buf[..len])
                        .map_err(|error| PassthroughError::GuestCopy {
                            completed: i,
                            count: request.count,
                            error,
                        })?;
                    buf
                }
            };
            self.hardware.write(port, &buf[..len]);
        }
        Ok(())
    }
}
