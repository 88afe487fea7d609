// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! In-hypervisor fast-path I/O handlers, and [`IoInterceptTable`], which maps
//! address ranges to them.
//!
//! - e.g: `IoInterceptTable<u64, dyn MmioIntercept>` models MMIO.
//! - e.g: `IoInterceptTable<u16, dyn PortIoIntercept>` models x86 port IO.

use crate::request::IoRequest;
use parking_lot::RwLock;
use range_map_vec::RangeMap;
use std::fmt::Debug;
use std::fmt::LowerHex;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

/// The result of offering a request to a fast-path handler.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum InterceptResult {
    /// The request was completed. For inline reads, `request.data` holds the
    /// result.
    Handled,
    /// The handler declined the request; it continues down the dispatch
    /// path.
    NotHandled,
}

/// A fast-path port IO handler.
pub trait PortIoIntercept: Send + Sync {
    fn handle_port_io(&self, request: &mut IoRequest) -> InterceptResult;
}

/// A fast-path MMIO handler.
pub trait MmioIntercept: Send + Sync {
    fn handle_mmio(&self, request: &mut IoRequest) -> InterceptResult;
}

#[derive(Debug, Clone)]
pub struct InterceptConflict<T> {
    pub existing: (Arc<str>, RangeInclusive<T>),
    pub conflict: (Arc<str>, RangeInclusive<T>),
}

impl<T> std::error::Error for InterceptConflict<T> where T: LowerHex + Debug {}
impl<T> std::fmt::Display for InterceptConflict<T>
where
    T: LowerHex + Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{:#x?} conflicts with existing {}:{:#x?}",
            self.conflict.0, self.conflict.1, self.existing.0, self.existing.1,
        )
    }
}

struct Entry<H: ?Sized> {
    name: Arc<str>,
    handler: Arc<H>,
    read_count: AtomicU64,
    write_count: AtomicU64,
}

/// Per-range access counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptCounters<T> {
    pub name: Arc<str>,
    pub range: RangeInclusive<T>,
    pub reads: u64,
    pub writes: u64,
}

pub struct IoInterceptTable<T, H: ?Sized> {
    map: RwLock<RangeMap<T, Entry<H>>>,
}

impl<T, H> IoInterceptTable<T, H>
where
    T: Copy + Ord + LowerHex + Debug,
    H: ?Sized,
{
    pub fn new() -> Self {
        Self {
            map: RwLock::new(RangeMap::new()),
        }
    }

    /// Claims `range` for `handler`. Ranges may not overlap.
    pub fn register(
        &self,
        range: RangeInclusive<T>,
        name: impl Into<Arc<str>>,
        handler: Arc<H>,
    ) -> Result<(), InterceptConflict<T>> {
        let name = name.into();
        let mut map = self.map.write();
        match map.entry(range.clone()) {
            range_map_vec::Entry::Vacant(entry) => {
                entry.insert(Entry {
                    name,
                    handler,
                    read_count: AtomicU64::new(0),
                    write_count: AtomicU64::new(0),
                });
                Ok(())
            }
            range_map_vec::Entry::Overlapping(entry) => {
                let (start, end, existing) = entry.get();
                Err(InterceptConflict {
                    existing: (existing.name.clone(), *start..=*end),
                    conflict: (name, range),
                })
            }
        }
    }

    /// Removes the range starting at `start`.
    pub fn revoke(&self, start: T) {
        self.map.write().remove(&start);
    }

    /// Returns the handler claiming `addr`, counting the access against its
    /// range.
    pub fn lookup(&self, addr: T, is_read: bool) -> Option<Arc<H>> {
        let map = self.map.read();
        let entry = map.get(&addr)?;
        if is_read {
            entry.read_count.fetch_add(1, Ordering::Relaxed);
        } else {
            entry.write_count.fetch_add(1, Ordering::Relaxed);
        }
        Some(entry.handler.clone())
    }

    pub fn is_occupied(&self, addr: T) -> bool {
        self.map.read().contains(&addr)
    }

    pub fn counters(&self) -> Vec<InterceptCounters<T>> {
        self.map
            .read()
            .iter()
            .map(|(range, entry)| InterceptCounters {
                name: entry.name.clone(),
                range: range.clone(),
                reads: entry.read_count.load(Ordering::Relaxed),
                writes: entry.write_count.load(Ordering::Relaxed),
            })
            .collect()
    }
}

impl<T, H> Default for IoInterceptTable<T, H>
where
    T: Copy + Ord + LowerHex + Debug,
    H: ?Sized,
{
    fn default() -> Self {
        Self::new()
    }
}
