use std::fmt;
use std::net::Ipv4Addr;

/// Flow identity as written by the kernel hook.
/// Layout must match `struct flow_key` in the hook object.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub src_ip: u32,
    pub dst_ip: u32,
    /// Network byte order.
    pub src_port: u16,
    /// Network byte order.
    pub dst_port: u16,
    pub proto: u8,
    /// Low byte of the packet length, diagnostics only.
    pub pkt_len_low: u8,
    /// First two payload bytes, diagnostics only.
    pub first_u16: u16,
    pub padding: u32,
}

/// Size of a FlowKey record in the kernel table.
pub const FLOW_KEY_SIZE: usize = 20;

/// Size of a FlowStats record in the kernel table.
pub const FLOW_STATS_SIZE: usize = 24;

impl FlowKey {
    /// Builds a key from dotted-quad addresses and host-order ports.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, proto: u8) -> Self {
        Self {
            src_ip: u32::from_ne_bytes(src.octets()),
            dst_ip: u32::from_ne_bytes(dst.octets()),
            src_port: src_port.to_be(),
            dst_port: dst_port.to_be(),
            proto,
            ..Default::default()
        }
    }

    /// Source address. The kernel stores the address bytes in wire order.
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.src_ip.to_ne_bytes())
    }

    /// Destination address.
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.dst_ip.to_ne_bytes())
    }

    /// Source port in host byte order.
    pub fn src_port_host(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    /// Destination port in host byte order.
    pub fn dst_port_host(&self) -> u16 {
        u16::from_be(self.dst_port)
    }

    /// Placeholder records emitted by the hook for frames it could not parse.
    pub fn is_placeholder(&self) -> bool {
        self.src_ip == 0 && self.dst_ip == 0
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_addr(),
            self.src_port_host(),
            self.dst_addr(),
            self.dst_port_host(),
        )
    }
}

/// Cumulative counters for one flow.
/// Layout must match `struct flow_stats` in the hook object.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowStats {
    pub packets: u64,
    pub bytes: u64,
    /// Nanoseconds, kernel monotonic clock.
    pub last_update: u64,
}

impl FlowStats {
    pub const fn new(packets: u64, bytes: u64) -> Self {
        Self {
            packets,
            bytes,
            last_update: 0,
        }
    }

    /// Average packet length, or zero for an empty flow.
    pub fn avg_packet_len(&self) -> u64 {
        self.bytes.checked_div(self.packets).unwrap_or(0)
    }
}

// SAFETY: both records are plain C structs made of integers with explicit padding.
#[cfg(all(feature = "bpf", target_os = "linux"))]
unsafe impl aya::Pod for FlowKey {}

// SAFETY: see above.
#[cfg(all(feature = "bpf", target_os = "linux"))]
unsafe impl aya::Pod for FlowStats {}

/// One polled table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub stats: FlowStats,
}

impl FlowRecord {
    pub const fn new(key: FlowKey, stats: FlowStats) -> Self {
        Self { key, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_sizes_match_kernel_layout() {
        assert_eq!(std::mem::size_of::<FlowKey>(), FLOW_KEY_SIZE);
        assert_eq!(std::mem::size_of::<FlowStats>(), FLOW_STATS_SIZE);
    }

    #[test]
    fn test_flow_key_addresses_roundtrip() {
        let key = FlowKey::new(
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 0, 0, 2),
            4791,
            50000,
            17,
        );
        assert_eq!(key.src_addr(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(key.dst_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(key.src_port_host(), 4791);
        assert_eq!(key.dst_port_host(), 50000);
        assert_eq!(key.src_port, 4791u16.to_be());
    }

    #[test]
    fn test_flow_key_display() {
        let key = FlowKey::new(
            Ipv4Addr::new(192, 168, 1, 10),
            Ipv4Addr::new(192, 168, 1, 20),
            443,
            51000,
            6,
        );
        assert_eq!(key.to_string(), "192.168.1.10:443 -> 192.168.1.20:51000");
    }

    #[test]
    fn test_placeholder_detection() {
        let mut key = FlowKey::default();
        assert!(key.is_placeholder());
        key.dst_ip = 1;
        assert!(!key.is_placeholder());
    }

    #[test]
    fn test_avg_packet_len() {
        assert_eq!(FlowStats::new(0, 0).avg_packet_len(), 0);
        assert_eq!(FlowStats::new(10, 15000).avg_packet_len(), 1500);
    }
}
