//! Service advertisement capability.
//!
//! Registration and resolution are asynchronous: each call returns once the
//! request is issued and the outcome is reported later through the
//! advertiser's event listeners, possibly from another thread.

use crate::error::AdvertiserError;
use parking_lot::Mutex;
use std::collections::HashMap;
use streamkinect_core::Listeners;

/// Domain used for local-network service discovery.
pub const LOCAL_DOMAIN: &str = "local.";

/// Notifications delivered by a [`ServiceAdvertiser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiserEvent {
    /// A service registration completed under its canonical name.
    Registered {
        name: String,
        service_type: String,
        domain: String,
    },
    /// A service was resolved to a reachable host and port.
    Resolved {
        fullname: String,
        hostname: String,
        port: u16,
    },
}

/// Advertises a service on the local network and resolves its address.
pub trait ServiceAdvertiser: Send + Sync {
    /// Listeners notified with registration and resolution results.
    fn events(&self) -> &Listeners<AdvertiserEvent>;

    /// Starts registering `name` as a `service_type` instance on `port`.
    fn register(&self, name: &str, service_type: &str, port: u16) -> Result<(), AdvertiserError>;

    /// Starts resolving a registered service.
    fn resolve(&self, name: &str, service_type: &str, domain: &str)
        -> Result<(), AdvertiserError>;

    /// Removes every advertisement made through this advertiser.
    fn withdraw(&self);
}

/// Builds the DNS-SD full name of a service instance.
pub fn full_service_name(name: &str, service_type: &str, domain: &str) -> String {
    format!("{}.{}.{}", name, service_type, domain)
}

/// In-process advertiser that resolves every registered name to
/// `localhost`.
///
/// Events fire synchronously from `register` and `resolve`.
pub struct FakeAdvertiser {
    listeners: Listeners<AdvertiserEvent>,
    /// Name to port. Pre-seeded entries survive `register` and `withdraw`.
    entries: Mutex<HashMap<String, u16>>,
    /// Names added by `register`.
    registered: Mutex<Vec<String>>,
}

impl FakeAdvertiser {
    pub fn new() -> Self {
        Self {
            listeners: Listeners::new(),
            entries: Mutex::new(HashMap::new()),
            registered: Mutex::new(Vec::new()),
        }
    }

    /// Pre-seeds the port that `name` resolves to.
    pub fn with_entry(self, name: impl Into<String>, port: u16) -> Self {
        self.entries.lock().insert(name.into(), port);
        self
    }

    /// Returns the names currently registered through `register`.
    pub fn registrations(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    /// Returns the port `name` resolves to, if known.
    pub fn port_of(&self, name: &str) -> Option<u16> {
        self.entries.lock().get(name).copied()
    }
}

impl Default for FakeAdvertiser {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceAdvertiser for FakeAdvertiser {
    fn events(&self) -> &Listeners<AdvertiserEvent> {
        &self.listeners
    }

    fn register(&self, name: &str, service_type: &str, port: u16) -> Result<(), AdvertiserError> {
        {
            let mut entries = self.entries.lock();
            if !entries.contains_key(name) {
                entries.insert(name.to_string(), port);
                self.registered.lock().push(name.to_string());
            }
        }

        tracing::debug!("Registered '{}' ({}) on port {}", name, service_type, port);
        self.listeners.notify(&AdvertiserEvent::Registered {
            name: name.to_string(),
            service_type: service_type.to_string(),
            domain: LOCAL_DOMAIN.to_string(),
        });
        Ok(())
    }

    fn resolve(
        &self,
        name: &str,
        service_type: &str,
        domain: &str,
    ) -> Result<(), AdvertiserError> {
        let Some(port) = self.port_of(name) else {
            tracing::warn!("Cannot resolve unknown service '{}'", name);
            return Ok(());
        };

        self.listeners.notify(&AdvertiserEvent::Resolved {
            fullname: full_service_name(name, service_type, domain),
            hostname: "localhost".to_string(),
            port,
        });
        Ok(())
    }

    fn withdraw(&self) {
        let names: Vec<String> = self.registered.lock().drain(..).collect();
        let mut entries = self.entries.lock();
        for name in names {
            entries.remove(&name);
        }
    }
}
