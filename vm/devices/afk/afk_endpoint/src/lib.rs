// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AFK endpoints: the host side of the EPIC channel protocol spoken with a
//! coprocessor over a pair of shared memory rings.
//!
//! An [`Endpoint`] runs the mailbox handshake that sets up its rings, drains
//! the receive ring on every doorbell, and multiplexes the services the
//! coprocessor announces onto channels. Each service is backed by a
//! [`Capability`] taken from the endpoint's [`CapabilityTable`]. Services
//! send commands to the coprocessor through a [`ServiceHandle`].

#![forbid(unsafe_code)]

mod capability;
mod command;
mod dispatch;
mod dma;
mod endpoint;
mod registry;
mod router;

#[cfg(test)]
mod test_support;

pub use capability::CallError;
pub use capability::Capability;
pub use capability::CapabilityTable;
pub use capability::NotFound;
pub use capability::ServiceInfo;
pub use command::CompleteError;
pub use command::NoSlot;
pub use command::TimedOut;
pub use command::MAX_PENDING_COMMANDS;
pub use dma::AllocError;
pub use dma::DmaAllocator;
pub use dma::DmaBuffer;
pub use dma::HeapDmaAllocator;
pub use endpoint::CommandError;
pub use endpoint::CommandReply;
pub use endpoint::Endpoint;
pub use endpoint::EndpointState;
pub use endpoint::SendError;
pub use endpoint::ServiceHandle;
pub use endpoint::ShutdownError;
pub use endpoint::StartError;
pub use registry::RegisterError;
pub use registry::Service;
pub use router::EndpointRouter;

use std::time::Duration;

/// The mailbox side of the transport.
pub trait Doorbell: Send + Sync {
    /// Sends the 64-bit mailbox message `value` to the coprocessor side of
    /// `endpoint`.
    fn send_doorbell(&self, endpoint: u8, value: u64);
}

/// Tunables of an [`Endpoint`].
#[derive(Clone, Debug)]
pub struct EndpointConfig {
    /// The number of services that can be registered between handshakes.
    pub max_channels: usize,
    /// How long a command waits for its reply.
    pub command_timeout: Duration,
    /// How long [`Endpoint::start`] waits for the rings to come up.
    pub start_timeout: Duration,
    /// How long [`Endpoint::shutdown`] waits for the acknowledgement.
    pub shutdown_timeout: Duration,
    /// The size of each of the two round-trip buffers.
    pub roundtrip_buffer_size: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_channels: 16,
            command_timeout: Duration::from_secs(1),
            start_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(1),
            roundtrip_buffer_size: 0x1000,
        }
    }
}
