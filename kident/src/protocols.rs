use clap::ValueEnum;

/// Transport protocols that show up in the connection tracking tables.
/// Numbers from /etc/protocols, names as printed by the kernel.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum, Debug)]
pub enum Protocol {
    /// No protocol
    None = 0,
    /// Icmp 1 ICMP # internet control message protocol
    Icmp = 1,
    /// Tcp 6 TCP # transmission control protocol
    Tcp = 6,
    /// Udp 17 UDP # user datagram protocol
    Udp = 17,
    /// Dccp 33 DCCP # Datagram Congestion Control Prot. [RFC4340]
    Dccp = 33,
    /// Gre 47 GRE # General Routing Encapsulation
    Gre = 47,
    /// Ipv6-icmp 58 IPv6-ICMP # ICMP for IPv6
    Ipv6Icmp = 58,
    /// Sctp 132 SCTP # Stream Control Transmission Protocol
    Sctp = 132,
    /// Udplite 136 UDPLite # UDP-Lite [RFC3828]
    Udplite = 136,
}

impl From<u8> for Protocol {
    fn from(v: u8) -> Self {
        for e in Self::value_variants() {
            if *e as u8 == v {
                return e.clone();
            }
        }
        Self::None
    }
}

impl Protocol {
    /// Name used by the conntrack text tables
    pub fn name(&self) -> &'static str {
        match self {
            Self::None => "unknown",
            Self::Icmp => "icmp",
            Self::Tcp => "tcp",
            Self::Udp => "udp",
            Self::Dccp => "dccp",
            Self::Gre => "gre",
            Self::Ipv6Icmp => "icmpv6",
            Self::Sctp => "sctp",
            Self::Udplite => "udplite",
        }
    }

    /// Case insensitive lookup by table name
    pub fn from_name(name: &str) -> Self {
        Self::value_variants()
            .iter()
            .find(|p| p.name().eq_ignore_ascii_case(name))
            .copied()
            .unwrap_or(Self::None)
    }
}
