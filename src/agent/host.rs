use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// Label value used when the host address cannot be determined.
pub const UNKNOWN_HOST: &str = "unknown";

const PROBE_TARGET: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 80);

/// Primary outbound IPv4 address of this host.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn host_ip() -> String {
    match probe_local_addr() {
        Ok(ip) => ip.to_string(),
        Err(e) => {
            tracing::debug!(error = %e, "host address probe failed");
            UNKNOWN_HOST.to_string()
        }
    }
}

fn probe_local_addr() -> std::io::Result<IpAddr> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect(PROBE_TARGET)?;
    Ok(socket.local_addr()?.ip())
}
