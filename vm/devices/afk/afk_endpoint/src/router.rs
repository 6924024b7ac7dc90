// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Routing of mailbox messages to the endpoints of one coprocessor.

use crate::endpoint::Endpoint;
use crate::endpoint::ShutdownError;
use crate::endpoint::StartError;
use std::collections::BTreeMap;

/// The endpoints of one coprocessor, by mailbox endpoint number.
#[derive(Debug, Default)]
pub struct EndpointRouter {
    endpoints: BTreeMap<u8, Endpoint>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `endpoint`, returning any endpoint it replaces.
    pub fn insert(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.endpoints.insert(endpoint.id(), endpoint)
    }

    pub fn get(&self, id: u8) -> Option<&Endpoint> {
        self.endpoints.get(&id)
    }

    pub fn remove(&mut self, id: u8) -> Option<Endpoint> {
        self.endpoints.remove(&id)
    }

    /// Delivers a mailbox message received for `endpoint`.
    pub fn route(&self, endpoint: u8, message: u64) {
        match self.endpoints.get(&endpoint) {
            Some(ep) => ep.on_doorbell(message),
            None => {
                tracing::warn!(endpoint, message, "message for unknown endpoint");
            }
        }
    }

    /// Starts every endpoint, sending all the INIT messages before waiting
    /// on any of them. Returns the endpoints that failed to start.
    pub fn start_all(&self) -> Vec<(u8, StartError)> {
        let mut failed = Vec::new();
        let mut started = Vec::new();
        for (&id, ep) in &self.endpoints {
            match ep.begin_start() {
                Ok(()) => started.push(ep),
                Err(err) => failed.push((id, err)),
            }
        }
        for ep in started {
            if let Err(err) = ep.wait_started(ep.start_timeout()) {
                failed.push((ep.id(), err));
            }
        }
        for (id, err) in &failed {
            tracing::warn!(
                endpoint = id,
                error = err as &dyn std::error::Error,
                "failed to start endpoint"
            );
        }
        failed
    }

    /// Shuts every endpoint down. Returns the endpoints that did not
    /// acknowledge in time.
    pub fn shutdown_all(&self) -> Vec<(u8, ShutdownError)> {
        self.endpoints
            .iter()
            .filter_map(|(&id, ep)| ep.shutdown().err().map(|err| (id, err)))
            .collect()
    }
}
