// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest I/O routing between the hypervisor and an external device model.
//!
//! Trapped port and MMIO accesses enter through [`IoDispatcher::dispatch`].
//! They are completed in place when a fast path can do so (host port
//! passthrough, registered in-hypervisor intercepts, or the buffered write
//! ring) and are otherwise posted to the VP's [`IoRequestSlot`], suspending
//! the VP until the device model responds and [`IoDispatcher::on_response`]
//! retires the request.

#![forbid(unsafe_code)]

mod buffered;
mod channel;
mod completion;
mod config;
mod dispatch;
mod intercept;
mod mmio;
mod passthrough;
mod ratelimit;
mod request;
mod special;
mod support;
mod vcpu;

pub use buffered::BufferedIoRing;
pub use buffered::BufferedReject;
pub use buffered::InvalidCapacity;
pub use channel::DeviceModelSlot;
pub use channel::IoRequestSlot;
pub use channel::UnexpectedState;
pub use completion::ProtocolViolation;
pub use completion::ResponseOutcome;
pub use config::IoDispatcherConfig;
pub use config::PendingRequestPolicy;
pub use config::VGA_MMIO_RANGE;
pub use dispatch::AccessKind;
pub use dispatch::BuildError;
pub use dispatch::DispatchError;
pub use dispatch::DispatchOutcome;
pub use dispatch::IoAccess;
pub use dispatch::IoDispatcher;
pub use dispatch::IoDispatcherBuilder;
pub use dispatch::IoStatsSnapshot;
pub use intercept::InterceptConflict;
pub use intercept::InterceptCounters;
pub use intercept::InterceptResult;
pub use intercept::IoInterceptTable;
pub use intercept::MmioIntercept;
pub use intercept::PortIoIntercept;
pub use mmio::CpuRegisters;
pub use mmio::EmulateResult;
pub use mmio::EmulationContext;
pub use mmio::EmulatorIo;
pub use mmio::GuestRegisters;
pub use mmio::InstructionEmulator;
pub use mmio::MmioOutcome;
pub use mmio::PendingException;
pub use passthrough::HostPortIo;
pub use passthrough::IoPortPermissions;
pub use passthrough::PassthroughError;
pub use passthrough::PassthroughOutcome;
pub use passthrough::PassthroughPortIntercept;
pub use passthrough::PassthroughPortMapping;
pub use passthrough::PassthroughPorts;
pub use request::AccessSize;
pub use request::IoData;
pub use request::IoDirection;
pub use request::IoKind;
pub use request::IoRequest;
pub use support::DeviceModelNotify;
pub use support::DomainControl;
pub use support::GuestMemoryAccess;
pub use support::GuestMemoryError;
pub use vcpu::VcpuIo;
