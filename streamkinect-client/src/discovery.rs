//! Finding servers on the local network.

use crate::error::ClientError;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use std::time::{Duration, Instant};
use streamkinect_protocol::SERVICE_TYPE;

/// A server found by browsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    /// Instance name as advertised.
    pub name: String,
    /// Full DNS-SD service name.
    pub fullname: String,
    /// Host name, without the trailing dot.
    pub hostname: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
}

impl DiscoveredServer {
    /// Returns the control endpoint address for this server.
    pub fn control_endpoint(&self) -> String {
        format!("tcp://{}:{}", self.hostname, self.port)
    }
}

/// Browses for servers until `window` elapses.
pub async fn browse(window: Duration) -> Result<Vec<DiscoveredServer>, ClientError> {
    let daemon = ServiceDaemon::new()
        .map_err(|e| ClientError::Discovery(format!("failed to create mDNS daemon: {e}")))?;

    let service_type = format!("{SERVICE_TYPE}.local.");
    let receiver = daemon
        .browse(&service_type)
        .map_err(|e| ClientError::Discovery(format!("failed to browse mDNS: {e}")))?;

    let mut servers: Vec<DiscoveredServer> = Vec::new();
    let deadline = Instant::now() + window;

    while Instant::now() < deadline {
        let event = tokio::task::spawn_blocking({
            let receiver = receiver.clone();
            move || receiver.recv_timeout(Duration::from_millis(100))
        })
        .await;

        if let Ok(Ok(ServiceEvent::ServiceResolved(info))) = event {
            let fullname = info.get_fullname().to_string();
            if servers.iter().any(|s| s.fullname == fullname) {
                continue;
            }
            let server = DiscoveredServer {
                name: instance_name(&fullname, &service_type),
                hostname: info.get_hostname().trim_end_matches('.').to_string(),
                port: info.get_port(),
                addresses: info.get_addresses().iter().copied().collect(),
                fullname,
            };
            tracing::debug!("Discovered {} at {}", server.name, server.control_endpoint());
            servers.push(server);
        }
    }

    let _ = daemon.stop_browse(&service_type);
    let _ = daemon.shutdown();
    Ok(servers)
}

fn instance_name(fullname: &str, service_type: &str) -> String {
    fullname
        .strip_suffix(service_type)
        .map(|name| name.trim_end_matches('.'))
        .unwrap_or(fullname)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_name() {
        assert_eq!(
            instance_name("Kinect stream on lab._kinect2._tcp.local.", "_kinect2._tcp.local."),
            "Kinect stream on lab"
        );
        assert_eq!(instance_name("odd", "_kinect2._tcp.local."), "odd");
    }

    #[test]
    fn test_control_endpoint() {
        let server = DiscoveredServer {
            name: "lab".into(),
            fullname: "lab._kinect2._tcp.local.".into(),
            hostname: "lab.local".into(),
            port: 5000,
            addresses: vec![],
        };
        assert_eq!(server.control_endpoint(), "tcp://lab.local:5000");
    }
}
