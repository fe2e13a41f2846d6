use local_ip_address::local_ip;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};

use crate::error::TransportError;
use crate::peer::PeerId;

/// TXT record version of the advertisement format
pub const ADVERTISEMENT_VERSION: &str = "1";

/// mDNS advertising and browsing for one local peer.
pub struct Discovery {
    daemon: ServiceDaemon,
    service_type: String,
    registered_service: Option<String>, // fullname of the registered instance
    browsing: bool,
}

impl Discovery {
    pub fn new(service_type: impl Into<String>) -> Result<Self, TransportError> {
        let daemon = ServiceDaemon::new().map_err(discovery_error)?;
        Ok(Self {
            daemon,
            service_type: service_type.into(),
            registered_service: None,
            browsing: false,
        })
    }

    /// Register (or re-register) this peer under the service type.
    pub fn register(&mut self, peer_id: &PeerId, port: u16) -> Result<(), TransportError> {
        self.unregister()?;

        let ip = local_ip().map_err(discovery_error)?;

        // The peer id is a display name; the mDNS host needs a DNS-safe label
        let m_hostname = format!("{}.local.", dns_label(peer_id.as_str()));

        let properties = [("v", ADVERTISEMENT_VERSION), ("id", peer_id.as_str())];

        let service_info = ServiceInfo::new(
            &self.service_type,
            peer_id.as_str(),
            &m_hostname,
            &ip.to_string(),
            port,
            &properties[..],
        )
        .map_err(discovery_error)?;

        let fullname = service_info.get_fullname().to_string();
        self.daemon.register(service_info).map_err(discovery_error)?;
        tracing::info!(peer = %peer_id, %ip, port, "Registered service {}", fullname);

        self.registered_service = Some(fullname);
        Ok(())
    }

    pub fn unregister(&mut self) -> Result<(), TransportError> {
        if let Some(fullname) = self.registered_service.take() {
            tracing::debug!("Unregistering service: {}", fullname);
            self.daemon.unregister(&fullname).map_err(discovery_error)?;
        }
        Ok(())
    }

    fn is_registered(&self) -> bool {
        self.registered_service.is_some()
    }

    pub fn browse(&mut self) -> Result<mdns_sd::Receiver<ServiceEvent>, TransportError> {
        if self.browsing {
            self.stop_browse()?;
        }
        let receiver = self.daemon.browse(&self.service_type).map_err(discovery_error)?;
        self.browsing = true;
        Ok(receiver)
    }

    pub fn stop_browse(&mut self) -> Result<(), TransportError> {
        if self.browsing {
            self.browsing = false;
            self.daemon
                .stop_browse(&self.service_type)
                .map_err(discovery_error)?;
        }
        Ok(())
    }
}

impl Drop for Discovery {
    fn drop(&mut self) {
        if self.is_registered() {
            if let Err(e) = self.unregister() {
                tracing::error!("Failed to unregister service: {}", e);
            }
            // Let the daemon send the goodbye packet before its thread goes away
            std::thread::sleep(std::time::Duration::from_millis(300));
        }
        let _ = self.daemon.shutdown();
    }
}

fn discovery_error(e: impl std::fmt::Display) -> TransportError {
    TransportError::Discovery(e.to_string())
}

/// Strip the `.<service type>` suffix from a service fullname.
///
/// Peer ids may contain dots, so splitting on the first dot is not enough.
pub(crate) fn instance_from_fullname<'a>(fullname: &'a str, service_type: &str) -> &'a str {
    fullname
        .strip_suffix(service_type)
        .and_then(|s| s.strip_suffix('.'))
        .unwrap_or_else(|| fullname.split('.').next().unwrap_or(fullname))
}

pub(crate) fn dns_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '-' })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "nearcast".to_string()
    } else {
        label.chars().take(63).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_instance_from_fullname() {
        let ty = "_nearcast._udp.local.";
        assert_eq!(instance_from_fullname("Kitchen iPad._nearcast._udp.local.", ty), "Kitchen iPad");
        assert_eq!(instance_from_fullname("v1.2 test._nearcast._udp.local.", ty), "v1.2 test");
        assert_eq!(instance_from_fullname("other._x._tcp.local.", ty), "other");
    }

    #[test]
    fn test_dns_label() {
        assert_eq!(dns_label("Kitchen iPad (sim-00af)"), "kitchen-ipad--sim-00af");
        assert_eq!(dns_label("***"), "nearcast");
        assert_eq!(dns_label(&"a".repeat(100)).len(), 63);
    }
}
