//! Callback subscription registry.
//!
//! Monitoring clients register their datagram source address with a TTL and
//! receive best-effort ACCOUNT_UPDATE notifications when balances change.
//! The registry tracks `clientId → (address, expiry)`; expired entries are
//! pruned lazily whenever addresses are collected. Registration refreshes
//! an existing entry, so registering is always safe to repeat.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

struct Registration {
    address: SocketAddr,
    expires_at: Instant,
}

/// Shared registry of callback subscribers.
///
/// Cloning is cheap and shares the underlying map. Safe for concurrent
/// register/unregister/addresses.
#[derive(Clone, Default)]
pub struct CallbackRegistry {
    registrations: Arc<Mutex<HashMap<u32, Registration>>>,
}

impl CallbackRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(clippy::expect_used)]
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Registration>> {
        self.registrations
            .lock()
            .expect("callback registry mutex poisoned")
    }

    /// Register or refresh a client's callback address.
    ///
    /// The address is the source address of the REGISTER_CALLBACK datagram;
    /// a client that reopens its socket must re-register.
    pub fn register(&self, client_id: u32, address: SocketAddr, ttl: Duration, now: Instant) {
        self.lock().insert(
            client_id,
            Registration {
                address,
                expires_at: now + ttl,
            },
        );
    }

    /// Remove a client's registration. Returns whether one existed.
    pub fn unregister(&self, client_id: u32) -> bool {
        self.lock().remove(&client_id).is_some()
    }

    /// Whether the client holds an unexpired registration.
    #[must_use]
    pub fn is_registered(&self, client_id: u32, now: Instant) -> bool {
        let mut registrations = self.lock();
        match registrations.get(&client_id) {
            Some(reg) if now < reg.expires_at => true,
            Some(_) => {
                registrations.remove(&client_id);
                false
            }
            None => false,
        }
    }

    /// Addresses of every unexpired registrant except `exclude`.
    ///
    /// Expired entries are pruned as a side effect. Addresses are
    /// deduplicated: two clients behind one address get one datagram.
    #[must_use]
    pub fn addresses(&self, exclude: u32, now: Instant) -> Vec<SocketAddr> {
        let mut registrations = self.lock();
        registrations.retain(|_, reg| now < reg.expires_at);
        let unique: HashSet<SocketAddr> = registrations
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, reg)| reg.address)
            .collect();
        unique.into_iter().collect()
    }

    /// Number of registrations still held (expired ones included until the
    /// next prune).
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no registrations are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
