use std::collections::HashMap;
use std::sync::Arc;

use once_cell::sync::Lazy;
use parking_lot::Mutex;

use super::{Identity, SignalingTransport, TransportConfig, TransportError};

static GLOBAL: Lazy<TransportRegistry> = Lazy::new(TransportRegistry::default);

/// Shares one relay socket between every surface that presents the same
/// credential. The socket closes when the last lease is released.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    entries: Arc<Mutex<HashMap<String, RegistryEntry>>>,
}

struct RegistryEntry {
    transport: SignalingTransport,
    holders: usize,
}

impl TransportRegistry {
    pub fn global() -> TransportRegistry {
        GLOBAL.clone()
    }

    pub fn acquire(
        &self,
        config: &TransportConfig,
        identity: &Identity,
    ) -> Result<TransportLease, TransportError> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&identity.token) {
            if !entry.transport.is_closed() {
                entry.holders += 1;
                tracing::debug!(
                    target = "transport",
                    holders = entry.holders,
                    "reusing shared signaling transport"
                );
                return Ok(TransportLease {
                    registry: self.clone(),
                    key: identity.token.clone(),
                    transport: Some(entry.transport.clone()),
                });
            }
            entries.remove(&identity.token);
        }

        let transport = SignalingTransport::new(config.clone(), identity.clone())?;
        entries.insert(
            identity.token.clone(),
            RegistryEntry {
                transport: transport.clone(),
                holders: 1,
            },
        );
        Ok(TransportLease {
            registry: self.clone(),
            key: identity.token.clone(),
            transport: Some(transport),
        })
    }

    pub fn holders(&self, token: &str) -> usize {
        self.entries
            .lock()
            .get(token)
            .map(|entry| entry.holders)
            .unwrap_or(0)
    }

    fn release(&self, key: &str, transport: &SignalingTransport) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        // A replaced entry belongs to a newer transport; leave it alone.
        if !entry.transport.same_as(transport) {
            return;
        }
        entry.holders = entry.holders.saturating_sub(1);
        if entry.holders == 0 {
            let entry = entries.remove(key);
            drop(entries);
            if let Some(entry) = entry {
                entry.transport.close();
            }
        }
    }
}

/// A counted claim on a shared transport. Released explicitly or on drop.
pub struct TransportLease {
    registry: TransportRegistry,
    key: String,
    transport: Option<SignalingTransport>,
}

impl TransportLease {
    pub fn transport(&self) -> Option<&SignalingTransport> {
        self.transport.as_ref()
    }

    pub fn release(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.registry.release(&self.key, &transport);
        }
    }
}

impl Drop for TransportLease {
    fn drop(&mut self) {
        self.release();
    }
}
