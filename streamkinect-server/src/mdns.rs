//! Multicast DNS-SD advertiser.

use crate::advertiser::{full_service_name, AdvertiserEvent, ServiceAdvertiser, LOCAL_DOMAIN};
use crate::error::AdvertiserError;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use streamkinect_core::Listeners;

/// How long a resolve browses before giving up.
const DEFAULT_BROWSE_WINDOW: Duration = Duration::from_secs(10);

/// Advertises services with multicast DNS-SD.
///
/// Resolution browses the service type on a dedicated thread and reports the
/// first resolved instance whose full name matches.
pub struct MdnsAdvertiser {
    daemon: ServiceDaemon,
    listeners: Arc<Listeners<AdvertiserEvent>>,
    /// Full names registered through this advertiser.
    registered: Mutex<Vec<String>>,
    browse_window: Duration,
}

impl MdnsAdvertiser {
    pub fn new() -> Result<Self, AdvertiserError> {
        let daemon = ServiceDaemon::new()
            .map_err(|e| AdvertiserError::Construction(format!("mDNS daemon: {}", e)))?;
        Ok(Self {
            daemon,
            listeners: Arc::new(Listeners::new()),
            registered: Mutex::new(Vec::new()),
            browse_window: DEFAULT_BROWSE_WINDOW,
        })
    }

    /// Sets how long a resolve browses before giving up.
    pub fn with_browse_window(mut self, window: Duration) -> Self {
        self.browse_window = window;
        self
    }
}

impl ServiceAdvertiser for MdnsAdvertiser {
    fn events(&self) -> &Listeners<AdvertiserEvent> {
        &self.listeners
    }

    fn register(&self, name: &str, service_type: &str, port: u16) -> Result<(), AdvertiserError> {
        let registration_error = |reason: String| AdvertiserError::Registration {
            name: name.to_string(),
            reason,
        };

        let type_domain = format!("{}.{}", service_type, LOCAL_DOMAIN);
        let host = get_hostname();
        let ips = get_local_ips();
        let properties = [("version", "1")];

        let mut info = ServiceInfo::new(&type_domain, name, &host, &ips[..], port, &properties[..])
            .map_err(|e| registration_error(e.to_string()))?;
        if ips.is_empty() {
            info = info.enable_addr_auto();
        }

        let fullname = info.get_fullname().to_string();
        self.daemon
            .register(info)
            .map_err(|e| registration_error(e.to_string()))?;
        self.registered.lock().push(fullname.clone());

        tracing::info!("Advertising '{}' on port {}", fullname, port);
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
        let type_domain = format!("{}.{}", service_type, domain);
        let expected = full_service_name(name, service_type, domain);

        let receiver = self
            .daemon
            .browse(&type_domain)
            .map_err(|e| AdvertiserError::Resolution {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        let daemon = self.daemon.clone();
        let listeners = Arc::clone(&self.listeners);
        let window = self.browse_window;

        std::thread::Builder::new()
            .name("mdns-resolve".to_string())
            .spawn(move || {
                let deadline = Instant::now() + window;
                let mut resolved = false;

                while !resolved {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        break;
                    }
                    match receiver.recv_timeout(remaining) {
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            if info.get_fullname() != expected {
                                continue;
                            }
                            listeners.notify(&AdvertiserEvent::Resolved {
                                fullname: info.get_fullname().to_string(),
                                hostname: info.get_hostname().trim_end_matches('.').to_string(),
                                port: info.get_port(),
                            });
                            resolved = true;
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }

                if !resolved {
                    tracing::warn!("Gave up resolving '{}' after {:?}", expected, window);
                }
                let _ = daemon.stop_browse(&type_domain);
            })
            .map_err(|e| AdvertiserError::Resolution {
                name: name.to_string(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    fn withdraw(&self) {
        let names: Vec<String> = self.registered.lock().drain(..).collect();
        for fullname in names {
            match self.daemon.unregister(&fullname) {
                Ok(_) => tracing::info!("Withdrew '{}'", fullname),
                Err(e) => tracing::warn!("Failed to withdraw '{}': {}", fullname, e),
            }
        }
    }
}

impl Drop for MdnsAdvertiser {
    fn drop(&mut self) {
        self.withdraw();
        let _ = self.daemon.shutdown();
    }
}

/// Returns local non-loopback IPv4 addresses, excluding link-local (169.254.x.x).
pub fn get_local_ips() -> Vec<IpAddr> {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return Vec::new();
    };

    interfaces
        .into_iter()
        .filter(|iface| !iface.is_loopback())
        .filter_map(|iface| match iface.ip() {
            IpAddr::V4(ipv4) if !ipv4.is_loopback() && !ipv4.is_link_local() => {
                Some(IpAddr::V4(ipv4))
            }
            _ => None,
        })
        .collect()
}

/// Returns the local hostname suffixed with `.local.` as required by mDNS.
pub fn get_hostname() -> String {
    let name = short_hostname();
    if name.ends_with(".local.") {
        return name;
    }
    format!("{}.local.", name.trim_end_matches('.'))
}

/// Returns the machine's hostname without any domain suffix handling.
pub fn short_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".into())
}

/// Default instance name advertised by a server.
pub fn default_service_name() -> String {
    format!("Kinect stream on {}", short_hostname())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hostname_has_mdns_suffix() {
        let host = get_hostname();
        assert!(host.ends_with(".local."));
        assert!(!host.ends_with("..local."));
    }

    #[test]
    fn test_default_service_name() {
        let name = default_service_name();
        assert!(name.starts_with("Kinect stream on "));
        assert!(name.len() > "Kinect stream on ".len());
    }

    #[test]
    fn test_local_ips_exclude_loopback() {
        for ip in get_local_ips() {
            assert!(!ip.is_loopback());
        }
    }
}
