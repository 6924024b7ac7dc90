// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The services registered on an endpoint, by channel.

use crate::capability::Capability;
use crate::capability::CapabilityTable;
use crate::capability::NotFound;
use crate::capability::ServiceInfo;
use crate::command::CommandTracker;
use crate::dma::DmaAllocator;
use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RegisterError {
    #[error("channel {0} already has a service")]
    AlreadyExists(u32),
    #[error("all {0} channels are in use")]
    Full(usize),
    #[error(transparent)]
    NotFound(#[from] NotFound),
}

/// A capability bound to a channel.
pub struct Service {
    info: ServiceInfo,
    enabled: AtomicBool,
    capability: Mutex<Box<dyn Capability>>,
    commands: CommandTracker,
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("info", &self.info)
            .field("enabled", &self.is_enabled())
            .field("commands", &self.commands)
            .finish()
    }
}

impl Service {
    pub fn channel(&self) -> u32 {
        self.info.channel
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.info
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// The number of commands still waiting for a reply, including ones
    /// whose callers gave up.
    pub fn pending_commands(&self) -> usize {
        self.commands.pending()
    }

    pub(crate) fn commands(&self) -> &CommandTracker {
        &self.commands
    }

    /// Runs `f` against the capability. Callbacks of one service never run
    /// concurrently.
    pub(crate) fn with_capability<R>(&self, f: impl FnOnce(&mut dyn Capability) -> R) -> R {
        f(self.capability.lock().as_mut())
    }

    /// Disables the service and runs its teardown once.
    pub(crate) fn teardown(&self) {
        if self.enabled.swap(false, Ordering::AcqRel) {
            self.with_capability(|cap| cap.teardown());
        }
    }
}

/// The per-endpoint table of services.
#[derive(Debug)]
pub(crate) struct Registry {
    table: Arc<CapabilityTable>,
    services: Vec<Arc<Service>>,
    max_channels: usize,
    /// Registrations since the last reset. Torn down services keep their
    /// slot.
    used: usize,
}

impl Registry {
    pub fn new(table: Arc<CapabilityTable>, max_channels: usize) -> Self {
        Self {
            table,
            services: Vec::new(),
            max_channels,
            used: 0,
        }
    }

    /// Returns the enabled service on `channel`.
    pub fn find_by_channel(&self, channel: u32) -> Option<&Arc<Service>> {
        self.services
            .iter()
            .rev()
            .find(|s| s.channel() == channel && s.is_enabled())
    }

    /// Returns the enabled service matched by `name`.
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<Service>> {
        self.services
            .iter()
            .find(|s| s.info.name == name && s.is_enabled())
    }

    /// Instantiates the capability for `info.name` and binds it to
    /// `info.channel`. The capability's `init` is left to the caller.
    pub fn register(
        &mut self,
        info: ServiceInfo,
        dma: Arc<dyn DmaAllocator>,
    ) -> Result<Arc<Service>, RegisterError> {
        if self.find_by_channel(info.channel).is_some() {
            return Err(RegisterError::AlreadyExists(info.channel));
        }
        if self.used >= self.max_channels {
            return Err(RegisterError::Full(self.max_channels));
        }
        let capability = self.table.match_by_name(&info.name)?;
        let service = Arc::new(Service {
            info,
            enabled: AtomicBool::new(true),
            capability: Mutex::new(capability),
            commands: CommandTracker::new(dma),
        });
        self.used += 1;
        self.services.push(service.clone());
        Ok(service)
    }

    /// Removes every service, leaving the table empty for a new handshake.
    pub fn drain(&mut self) -> Vec<Arc<Service>> {
        self.used = 0;
        std::mem::take(&mut self.services)
    }
}
