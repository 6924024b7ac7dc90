// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The contract between an endpoint and the services it hosts.

use crate::ServiceHandle;
use thiserror::Error;

/// What the coprocessor told us about a service when announcing it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServiceInfo {
    pub channel: u32,
    /// The name the service was matched by.
    pub name: String,
    /// `EPICName`, if the announcement carried properties.
    pub epic_name: Option<String>,
    /// `EPICProviderClass`, if the announcement carried properties.
    pub class: Option<String>,
    /// `EPICUnit`, if the announcement carried properties.
    pub unit: Option<i64>,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call type {0:#x} is not supported")]
    Unsupported(u32),
    #[error("call failed")]
    Failed(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// A service implementation bound to one channel of an endpoint.
///
/// All methods are invoked on the endpoint's worker thread, in the order the
/// coprocessor sent the corresponding frames.
pub trait Capability: Send {
    /// Called once the service is registered. `handle` can be kept to send
    /// commands to the coprocessor later.
    fn init(&mut self, handle: ServiceHandle, info: &ServiceInfo);

    /// Handles a call from the coprocessor and returns the reply data.
    fn call(&mut self, request_type: u32, request: &[u8]) -> Result<Vec<u8>, CallError> {
        let _ = request;
        Err(CallError::Unsupported(request_type))
    }

    /// Handles a report from the coprocessor.
    fn report(&mut self, subtype: u16, data: &[u8]) {
        tracing::debug!(subtype, len = data.len(), "unhandled report");
    }

    /// The coprocessor tore the service down. No more calls follow.
    fn teardown(&mut self) {}
}

type Constructor = Box<dyn Fn() -> Box<dyn Capability> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
#[error("no capability named {0:?}")]
pub struct NotFound(pub String);

/// The services an endpoint class knows how to host, by name.
#[derive(Default)]
pub struct CapabilityTable {
    entries: Vec<(String, Constructor)>,
}

impl std::fmt::Debug for CapabilityTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(name, _)| name))
            .finish()
    }
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a capability built by `ctor` for services named `name`.
    pub fn with(
        mut self,
        name: impl Into<String>,
        ctor: impl Fn() -> Box<dyn Capability> + Send + Sync + 'static,
    ) -> Self {
        self.entries.push((name.into(), Box::new(ctor)));
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instantiates the first capability whose name equals `name`.
    pub fn match_by_name(&self, name: &str) -> Result<Box<dyn Capability>, NotFound> {
        if name.is_empty() {
            return Err(NotFound(String::new()));
        }
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, ctor)| ctor())
            .ok_or_else(|| NotFound(name.to_owned()))
    }
}
