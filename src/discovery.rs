//! Local and external address discovery for connection candidates.
//!
//! The OFFER needs two addresses: the LOCAL candidate (an interface address
//! the console can reach over the LAN) and the STATIC candidate (the
//! internet-visible address). The static address comes from the UPnP gateway
//! when one answers, otherwise from a single STUN query.

use crate::error::{HolepunchError, Result};
use igd::{PortMappingProtocol, SearchOptions};
use log::{debug, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, ToSocketAddrs};
use std::time::Duration;

/// Description attached to mappings so they are identifiable in router UIs.
const PORT_MAPPING_DESCRIPTION: &str = "punch-rs UDP holepunch";

/// A discovered UPnP gateway plus the UDP mappings installed through it.
///
/// Mappings live for the session; [`UpnpGateway::teardown`] removes them.
pub(crate) struct UpnpGateway {
    gateway: igd::aio::Gateway,
    mapped_ports: Vec<u16>,
}

impl UpnpGateway {
    /// Discover an internet gateway on the local network.
    pub async fn discover(timeout: Duration) -> Result<Self> {
        let options = SearchOptions {
            timeout: Some(timeout),
            ..Default::default()
        };
        let gateway = igd::aio::search_gateway(options)
            .await
            .map_err(|e| HolepunchError::network_with_source("UPnP gateway discovery failed", e))?;
        debug!("discovered UPnP gateway at {}", gateway.addr);
        Ok(Self {
            gateway,
            mapped_ports: Vec::new(),
        })
    }

    /// Address of the gateway's control endpoint.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::V4(self.gateway.addr)
    }

    /// The gateway's external (internet-visible) IP address.
    pub async fn external_ip(&self) -> Result<Ipv4Addr> {
        self.gateway.get_external_ip().await.map_err(|e| {
            HolepunchError::network_with_source("failed to read ExternalIPAddress", e)
        })
    }

    /// Map `port` on the gateway to the same port on `local_ip` for UDP.
    pub async fn add_udp_mapping(&mut self, local_ip: Ipv4Addr, port: u16) -> Result<()> {
        self.gateway
            .add_port(
                PortMappingProtocol::UDP,
                port,
                SocketAddrV4::new(local_ip, port),
                0,
                PORT_MAPPING_DESCRIPTION,
            )
            .await
            .map_err(|e| HolepunchError::network_with_source("failed to add port mapping", e))?;
        debug!("added UPnP UDP mapping {} -> {}:{}", port, local_ip, port);
        self.mapped_ports.push(port);
        Ok(())
    }

    /// Remove every mapping added through this gateway.
    pub async fn teardown(&mut self) {
        for port in self.mapped_ports.drain(..) {
            match self.gateway.remove_port(PortMappingProtocol::UDP, port).await {
                Ok(()) => debug!("removed UPnP UDP mapping for port {}", port),
                Err(e) => warn!("failed to remove UPnP mapping for port {}: {}", port, e),
            }
        }
    }
}

/// First non-loopback IPv4 interface address on the host.
pub(crate) fn local_address() -> Result<Ipv4Addr> {
    let interfaces = get_if_addrs::get_if_addrs()?;
    for interface in interfaces {
        if interface.is_loopback() {
            continue;
        }
        if let IpAddr::V4(addr) = interface.ip() {
            return Ok(addr);
        }
    }
    Err(HolepunchError::network("no usable local IPv4 address"))
}

/// IPv4 address of the interface that routes toward `target`.
pub(crate) fn local_ip_for_target(target: SocketAddr) -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(target)?;
    match socket.local_addr()?.ip() {
        IpAddr::V4(addr) => Ok(addr),
        IpAddr::V6(_) => Err(HolepunchError::network("route to target is not IPv4")),
    }
}

/// MAC address of the interface owning `addr`, zeroed when unavailable.
pub(crate) fn default_route_mac(addr: Ipv4Addr) -> [u8; 6] {
    let Ok(interfaces) = get_if_addrs::get_if_addrs() else {
        return [0u8; 6];
    };
    for interface in interfaces {
        if interface.ip() != IpAddr::V4(addr) {
            continue;
        }
        if let Ok(Some(mac)) = mac_address::mac_address_by_name(&interface.name) {
            return mac.bytes();
        }
    }
    [0u8; 6]
}

/// External IPv4 address via STUN, queried on a fresh wildcard socket.
pub(crate) async fn stun_external_address(stun_servers: &[String]) -> Result<Ipv4Addr> {
    for server in stun_servers {
        let Some(server_addr) = resolve_stun_addr(server) else {
            warn!("could not resolve STUN server {}", server);
            continue;
        };
        let socket = tokio::net::UdpSocket::bind("0.0.0.0:0").await?;
        let client = stunclient::StunClient::new(server_addr);
        match client.query_external_address_async(&socket).await {
            Ok(SocketAddr::V4(external)) => {
                debug!("STUN external address {} (via {})", external.ip(), server);
                return Ok(*external.ip());
            }
            Ok(SocketAddr::V6(_)) => continue,
            Err(e) => warn!("STUN query failed for {}: {}", server, e),
        }
    }
    Err(HolepunchError::network(
        "failed to get external address via STUN",
    ))
}

fn resolve_stun_addr(server: &str) -> Option<SocketAddr> {
    match server.to_socket_addrs() {
        Ok(mut addrs) => addrs.find(|addr| addr.is_ipv4()),
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_stun_addr_with_literal() {
        let addr = resolve_stun_addr("192.0.2.1:3478").expect("literal resolves");
        assert_eq!(addr, "192.0.2.1:3478".parse().expect("socket addr"));
    }

    #[test]
    fn test_resolve_stun_addr_rejects_garbage() {
        assert!(resolve_stun_addr("not a stun server").is_none());
    }

    #[test]
    fn test_default_route_mac_unknown_address_is_zeroed() {
        // 203.0.113.9 (TEST-NET-3) is never a local interface address
        assert_eq!(default_route_mac(Ipv4Addr::new(203, 0, 113, 9)), [0u8; 6]);
    }
}
