use std::collections::HashSet;
use std::net::IpAddr;

use thiserror::Error;

use crate::packet_parser;

#[derive(Error, Debug)]
pub enum ObserverError {
    #[error("Capture interface {0} not found")]
    InterfaceNotFound(String),
    #[error("Unable to open capture channel: {0}")]
    CaptureUnavailable(std::io::Error),
    #[error("Unhandled capture channel type")]
    UnhandledChannelType,
}

/// A single hostname sighting attributed to a hotspot client address.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub ts: chrono::DateTime<chrono::Utc>,
    pub src_ip: IpAddr,
    pub hostname: String,
}

pub struct Observer {
    interface: pnet_datalink::NetworkInterface,
    user_subnet: ipnetwork::IpNetwork,
    ignored_addresses: HashSet<IpAddr>,
    log: slog::Logger,
}

impl Observer {
    /// Locate the capture interface. Fails before any thread is spawned so
    /// a missing interface or insufficient capture privilege is a fatal
    /// startup error.
    pub fn new(
        interface_name: &str,
        user_subnet: ipnetwork::IpNetwork,
        ignored_addresses: HashSet<IpAddr>,
        log: slog::Logger,
    ) -> Result<Observer, ObserverError> {
        let interface = pnet_datalink::interfaces()
            .into_iter()
            .find(|iface| iface.name == interface_name)
            .ok_or_else(|| ObserverError::InterfaceNotFound(interface_name.to_owned()))?;
        Ok(Observer {
            interface,
            user_subnet,
            ignored_addresses,
            log,
        })
    }

    /// Run the capture loop, blocking the calling thread. Observations are
    /// pushed through `sender` with `try_send`; when the downstream writer
    /// lags, sightings are dropped here with a counter rather than stalling
    /// the tap. Returns when the shutdown signal flips or the tap dies.
    pub fn run(
        &self,
        sender: tokio::sync::mpsc::Sender<Observation>,
        shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<(), ObserverError> {
        let (_, mut rx) = match pnet_datalink::channel(&self.interface, Default::default()) {
            Ok(pnet_datalink::Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => return Err(ObserverError::UnhandledChannelType),
            Err(e) => return Err(ObserverError::CaptureUnavailable(e)),
        };

        let log = self
            .log
            .new(slog::o!("interface" => self.interface.name.clone()));
        slog::info!(log, "observer capture loop started");

        let has_link_layer = self.interface.mac.is_some();
        let mut dropped_observations: u64 = 0;

        loop {
            if *shutdown.borrow() {
                slog::info!(log, "observer shutting down";
                    "dropped_observations" => dropped_observations);
                return Ok(());
            }
            match rx.next() {
                Ok(packet) => {
                    let parsed = if has_link_layer {
                        packet_parser::parse_ethernet(packet, &log)
                    } else {
                        packet_parser::parse_ipv4(packet, &log)
                    };
                    let frame = match parsed {
                        Ok(frame) => frame,
                        Err(packet_parser::PacketParseError::BadPacket) => {
                            slog::debug!(log, "unparseable frame");
                            continue;
                        }
                        // Hostname-free frames are the common case and are
                        // silently dropped.
                        Err(_) => continue,
                    };
                    let user_addr = match normalize_user_address(
                        &self.user_subnet,
                        &self.ignored_addresses,
                        frame.src,
                        frame.dst,
                    ) {
                        Some(addr) => addr,
                        None => continue,
                    };
                    let observation = Observation {
                        ts: chrono::Utc::now(),
                        src_ip: user_addr,
                        hostname: frame.hostname,
                    };
                    if sender.try_send(observation).is_err() {
                        dropped_observations += 1;
                        if dropped_observations % 1000 == 1 {
                            slog::warn!(log, "observation channel full, dropping";
                                "dropped_observations" => dropped_observations);
                        }
                    }
                }
                Err(e) => {
                    // Transient read errors do not kill the tap.
                    slog::error!(log, "unable to receive packet: {}", e);
                }
            }
        }
    }
}

// Attribute the frame to whichever endpoint lives inside the hotspot subnet,
// so DNS responses from the resolver still count against the querying
// client. Flows with no user endpoint are dropped.
fn normalize_user_address(
    user_subnet: &ipnetwork::IpNetwork,
    ignored_addresses: &HashSet<IpAddr>,
    src: IpAddr,
    dst: IpAddr,
) -> Option<IpAddr> {
    let src_is_user = user_subnet.contains(src) && !ignored_addresses.contains(&src);
    let dst_is_user = user_subnet.contains(dst) && !ignored_addresses.contains(&dst);
    match (src_is_user, dst_is_user) {
        (true, _) => Some(src),
        (false, true) => Some(dst),
        (false, false) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn subnet() -> ipnetwork::IpNetwork {
        ipnetwork::IpNetwork::from_str("192.168.50.0/24").unwrap()
    }

    fn ignored() -> HashSet<IpAddr> {
        [IpAddr::from_str("192.168.50.1").unwrap()]
            .into_iter()
            .collect()
    }

    #[test]
    fn test_normalize_prefers_user_source() {
        let client = IpAddr::from_str("192.168.50.23").unwrap();
        let remote = IpAddr::from_str("93.184.216.34").unwrap();
        assert_eq!(
            normalize_user_address(&subnet(), &ignored(), client, remote),
            Some(client)
        );
    }

    #[test]
    fn test_normalize_attributes_responses_to_client() {
        let client = IpAddr::from_str("192.168.50.23").unwrap();
        let resolver = IpAddr::from_str("9.9.9.9").unwrap();
        assert_eq!(
            normalize_user_address(&subnet(), &ignored(), resolver, client),
            Some(client)
        );
    }

    #[test]
    fn test_normalize_ignores_gateway_and_foreign_flows() {
        let gateway = IpAddr::from_str("192.168.50.1").unwrap();
        let remote = IpAddr::from_str("93.184.216.34").unwrap();
        assert_eq!(
            normalize_user_address(&subnet(), &ignored(), gateway, remote),
            None
        );
        assert_eq!(
            normalize_user_address(&subnet(), &ignored(), remote, gateway),
            None
        );
    }
}
