//! Bridge between the agent (node) and the proxy (service host).
//!
//! In production the bridge is a node-local IPC channel; for embedded
//! clusters and tests the loopback channel dispatches straight into a
//! proxy instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use peridot_types::FailoverUnitId;
use peridot_wire::{ProxyReply, ProxyRequest};

use crate::proxy::FailoverUnitProxy;

/// Request/reply channel to the failover unit proxies of one host.
pub trait ProxyChannel: Send + Sync {
    fn submit(&self, request: &ProxyRequest) -> ProxyReply;
}

/// In-process channel dispatching to registered proxies.
#[derive(Default)]
pub struct LoopbackChannel {
    proxies: Mutex<HashMap<FailoverUnitId, Arc<FailoverUnitProxy>>>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, proxy: Arc<FailoverUnitProxy>) {
        self.proxies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(proxy.ft_id(), proxy);
    }

    pub fn proxy(&self, ft_id: FailoverUnitId) -> Option<Arc<FailoverUnitProxy>> {
        self.proxies
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(&ft_id)
            .cloned()
    }
}

impl ProxyChannel for LoopbackChannel {
    fn submit(&self, request: &ProxyRequest) -> ProxyReply {
        match self.proxy(request.failover_unit.ft_id) {
            Some(proxy) => proxy.process_request(request),
            None => ProxyReply::failure(request, "no proxy registered for failover unit"),
        }
    }
}

/// Channel that records requests without executing them (agent tests).
#[derive(Default)]
pub struct RecordingChannel {
    requests: Mutex<Vec<ProxyRequest>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl ProxyChannel for RecordingChannel {
    fn submit(&self, request: &ProxyRequest) -> ProxyReply {
        self.requests
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(request.clone());
        ProxyReply::success(request)
    }
}

/// Sink for host-termination requests from the retryable-error ladder.
pub trait HostTerminator: Send + Sync {
    fn terminate(&self, runtime_id: &str, reason: &str);
}

/// Terminator that records requests (tests; embedders without process
/// control).
#[derive(Debug, Default)]
pub struct RecordingTerminator {
    terminations: Mutex<Vec<(String, String)>>,
}

impl RecordingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn terminations(&self) -> Vec<(String, String)> {
        self.terminations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

impl HostTerminator for RecordingTerminator {
    fn terminate(&self, runtime_id: &str, reason: &str) {
        self.terminations
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push((runtime_id.to_string(), reason.to_string()));
    }
}
