//! Self-identification of the node on the device LAN

use crate::config::NetworkConfig;
use crate::scanner::subnet_of;
use std::io;
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("cannot find local ip, check your connection: {0}")]
    NoRoute(#[source] io::Error),
    #[error("local address {0} is not IPv4")]
    NotIpv4(IpAddr),
    #[error("the local ip address {local} does not match the expected router subnet {router}/{prefix_len}")]
    SubnetMismatch {
        local: Ipv4Addr,
        router: Ipv4Addr,
        prefix_len: u8,
    },
    #[error("the ip of the node in the intranet should end in .{expected}; current ip = {local}")]
    UnexpectedHostPart { local: Ipv4Addr, expected: u8 },
}

/// Local address the kernel would use to reach `router`.
///
/// Connecting a UDP socket sends nothing; it only selects a route.
pub fn local_ip_towards(router: Ipv4Addr) -> Result<Ipv4Addr, NetworkError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(NetworkError::NoRoute)?;
    socket.connect((router, 80)).map_err(NetworkError::NoRoute)?;
    match socket.local_addr().map_err(NetworkError::NoRoute)?.ip() {
        IpAddr::V4(ip) => Ok(ip),
        other => Err(NetworkError::NotIpv4(other)),
    }
}

/// Checks that `local` sits in the router's subnet and carries the
/// expected host suffix
pub fn validate_node_address(
    local: Ipv4Addr,
    router: Ipv4Addr,
    prefix_len: u8,
    expected_suffix: Option<u8>,
) -> Result<(), NetworkError> {
    if subnet_of(local, prefix_len) != subnet_of(router, prefix_len) {
        return Err(NetworkError::SubnetMismatch { local, router, prefix_len });
    }
    if let Some(expected) = expected_suffix {
        if local.octets()[3] != expected {
            return Err(NetworkError::UnexpectedHostPart { local, expected });
        }
    }
    Ok(())
}

/// Address the scan is centred on: the configured override, or the
/// validated route towards the router
pub fn resolve_node_address(config: &NetworkConfig) -> Result<Ipv4Addr, NetworkError> {
    if let Some(ip) = config.local_ip {
        info!(%ip, "using configured node address");
        return Ok(ip);
    }
    let ip = local_ip_towards(config.router_ip)?;
    validate_node_address(ip, config.router_ip, config.prefix_len, config.node_host_suffix)?;
    info!(%ip, router = %config.router_ip, "node address resolved");
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROUTER: Ipv4Addr = Ipv4Addr::new(192, 168, 123, 254);

    #[test]
    fn test_node_address_ok() {
        assert!(validate_node_address(Ipv4Addr::new(192, 168, 123, 1), ROUTER, 24, Some(1)).is_ok());
        assert!(validate_node_address(Ipv4Addr::new(192, 168, 123, 17), ROUTER, 24, None).is_ok());
    }

    #[test]
    fn test_node_address_wrong_subnet() {
        let err = validate_node_address(Ipv4Addr::new(192, 168, 1, 1), ROUTER, 24, Some(1)).unwrap_err();
        assert!(matches!(err, NetworkError::SubnetMismatch { .. }));
    }

    #[test]
    fn test_node_address_wrong_suffix() {
        let err = validate_node_address(Ipv4Addr::new(192, 168, 123, 9), ROUTER, 24, Some(1)).unwrap_err();
        assert!(matches!(err, NetworkError::UnexpectedHostPart { expected: 1, .. }));
    }

    #[test]
    fn test_configured_override_wins() {
        let config = NetworkConfig {
            local_ip: Some(Ipv4Addr::new(10, 0, 0, 1)),
            ..NetworkConfig::default()
        };
        assert_eq!(resolve_node_address(&config).unwrap(), Ipv4Addr::new(10, 0, 0, 1));
    }
}
