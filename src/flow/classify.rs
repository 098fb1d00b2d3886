use std::fmt;
use std::net::Ipv4Addr;

/// RoCE v2 UDP destination port (host byte order).
pub const ROCE_V2_UDP_PORT: u16 = 4791;

/// Protocol markers written by the hook into the key's protocol byte.
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
/// Dedicated RoCE v2 marker.
pub const PROTO_ROCE_V2: u8 = 0xFE;
/// Low byte of ether-type 0x8915.
pub const PROTO_ROCE_V1: u8 = 0x15;
/// Low byte of ether-type 0x8914.
pub const PROTO_INFINIBAND: u8 = 0x14;

/// Public resolvers whose traffic can be suppressed from reports.
pub const DNS_RESOLVERS: [Ipv4Addr; 8] = [
    Ipv4Addr::new(223, 5, 5, 5),
    Ipv4Addr::new(223, 6, 6, 6),
    Ipv4Addr::new(114, 114, 114, 114),
    Ipv4Addr::new(114, 114, 115, 115),
    Ipv4Addr::new(8, 8, 8, 8),
    Ipv4Addr::new(8, 8, 4, 4),
    Ipv4Addr::new(1, 1, 1, 1),
    Ipv4Addr::new(1, 0, 0, 1),
];

/// Transport or fabric protocol of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    RoceV2,
    RoceV2Udp,
    Udp,
    Tcp,
    RoceV1Iboe,
    InfiniBand,
    Other,
}

impl Category {
    /// Metric label value.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoceV2 => "RoCE_v2",
            Self::RoceV2Udp => "RoCE_v2_UDP",
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::RoceV1Iboe => "RoCE_v1_IBoE",
            Self::InfiniBand => "InfiniBand",
            Self::Other => "Other",
        }
    }

    /// Bracketed console tag.
    pub const fn console_tag(self) -> &'static str {
        match self {
            Self::RoceV2 => "[RoCE v2]",
            Self::RoceV2Udp => "[RoCE v2/UDP]",
            Self::Udp => "[UDP]",
            Self::Tcp => "[TCP]",
            Self::RoceV1Iboe => "[RoCE v1/IBoE]",
            Self::InfiniBand => "[InfiniBand]",
            Self::Other => "[Other]",
        }
    }

    /// All categories.
    pub const fn all() -> &'static [Category] {
        &[
            Self::RoceV2,
            Self::RoceV2Udp,
            Self::Udp,
            Self::Tcp,
            Self::RoceV1Iboe,
            Self::InfiniBand,
            Self::Other,
        ]
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a flow. Ports are taken as stored in the table, in network byte order.
pub fn classify(proto: u8, src_port_net: u16, dst_port_net: u16) -> Category {
    match proto {
        PROTO_ROCE_V2 => Category::RoceV2,
        PROTO_TCP => Category::Tcp,
        PROTO_UDP => {
            if u16::from_be(src_port_net) == ROCE_V2_UDP_PORT
                || u16::from_be(dst_port_net) == ROCE_V2_UDP_PORT
            {
                Category::RoceV2Udp
            } else {
                Category::Udp
            }
        }
        PROTO_ROCE_V1 => Category::RoceV1Iboe,
        PROTO_INFINIBAND => Category::InfiniBand,
        _ => Category::Other,
    }
}

/// Reporting filter selected by category name.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TrafficFilter {
    #[default]
    All,
    /// RoCE v1 and v2, including the UDP encapsulation.
    Roce,
    RoceV1,
    RoceV2,
    Tcp,
    /// Everything carried over UDP, RoCE v2 encapsulation included.
    Udp,
    Ib,
}

impl TrafficFilter {
    /// Parse a filter name. `None` for unrecognized names.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "all" => Some(Self::All),
            "roce" => Some(Self::Roce),
            "roce_v1" => Some(Self::RoceV1),
            "roce_v2" => Some(Self::RoceV2),
            "tcp" => Some(Self::Tcp),
            "udp" => Some(Self::Udp),
            "ib" => Some(Self::Ib),
            _ => None,
        }
    }

    /// Parse a filter name, falling back to showing everything.
    pub fn resolve(name: &str) -> Self {
        Self::from_name(name).unwrap_or_else(|| {
            tracing::warn!(filter = %name, "unknown traffic filter, showing all traffic");
            Self::All
        })
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::All => "all",
            Self::Roce => "roce",
            Self::RoceV1 => "roce_v1",
            Self::RoceV2 => "roce_v2",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Ib => "ib",
        }
    }

    /// Whether flows of `category` pass this filter.
    pub fn accepts(self, category: Category) -> bool {
        match self {
            Self::All => true,
            Self::Roce => matches!(
                category,
                Category::RoceV1Iboe | Category::RoceV2 | Category::RoceV2Udp
            ),
            Self::RoceV1 => category == Category::RoceV1Iboe,
            Self::RoceV2 => matches!(category, Category::RoceV2 | Category::RoceV2Udp),
            Self::Tcp => category == Category::Tcp,
            Self::Udp => matches!(category, Category::Udp | Category::RoceV2Udp),
            Self::Ib => category == Category::InfiniBand,
        }
    }
}

impl fmt::Display for TrafficFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a flow of `category` is reported under `filter`.
pub fn should_display(category: Category, filter: TrafficFilter) -> bool {
    filter.accepts(category)
}

/// Whether `dst` is one of the well-known public DNS resolvers.
pub fn is_excluded_dns(dst: Ipv4Addr) -> bool {
    DNS_RESOLVERS.contains(&dst)
}
