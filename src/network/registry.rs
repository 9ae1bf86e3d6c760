//! Deduplicating cache of communicators
//!
//! At most one live `Communicator` exists per port pair. Entries are weak, so
//! the registry never keeps a connection open on its own.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use super::communicator::{Communicator, PortPair, ProducerKind};
use super::error::NetworkError;
use super::transport::TransportConfig;

struct Entry {
    ports: PortPair,
    kind: ProducerKind,
    communicator: Weak<Communicator>,
}

/// Registry owned by one export session
pub struct CommunicatorRegistry {
    config: TransportConfig,
    entries: Mutex<Vec<Entry>>,
}

impl CommunicatorRegistry {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Shared communicator for `ports`, connecting if none is live
    pub fn get_or_create(
        &self,
        ports: PortPair,
        kind: ProducerKind,
    ) -> Result<Arc<Communicator>, NetworkError> {
        self.get_or_create_with(ports, kind, |ports, kind| {
            Communicator::connect(ports, kind, &self.config)
        })
    }

    /// Like `get_or_create`, building new instances with `factory`
    ///
    /// A live entry of another kind on the same ports is an error.
    pub fn get_or_create_with<F>(
        &self,
        ports: PortPair,
        kind: ProducerKind,
        factory: F,
    ) -> Result<Arc<Communicator>, NetworkError>
    where
        F: FnOnce(PortPair, ProducerKind) -> Result<Communicator, NetworkError>,
    {
        let mut entries = self.entries.lock();
        prune(&mut entries);

        for entry in entries.iter().filter(|e| e.ports == ports) {
            if let Some(communicator) = entry.communicator.upgrade() {
                if entry.kind != kind {
                    return Err(NetworkError::ProducerKindMismatch {
                        ports,
                        existing: entry.kind,
                        requested: kind,
                    });
                }
                debug!("Reusing {} communicator for {}", kind, ports);
                return Ok(communicator);
            }
        }

        let communicator = Arc::new(factory(ports, kind)?);
        entries.push(Entry {
            ports,
            kind,
            communicator: Arc::downgrade(&communicator),
        });
        debug!("Registered {} communicator for {}", kind, ports);
        Ok(communicator)
    }

    /// Live entries after pruning
    pub fn live_count(&self) -> usize {
        let mut entries = self.entries.lock();
        prune(&mut entries);
        entries.len()
    }

    pub fn contains(&self, ports: PortPair) -> bool {
        self.entries
            .lock()
            .iter()
            .any(|e| e.ports == ports && e.communicator.strong_count() > 0)
    }
}

impl Default for CommunicatorRegistry {
    fn default() -> Self {
        Self::new(TransportConfig::default())
    }
}

fn prune(entries: &mut Vec<Entry>) {
    entries.retain(|e| e.communicator.strong_count() > 0);
}
