use crate::protocols::Protocol;
use anyhow::anyhow;
use std::{
    fmt,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    str::FromStr,
};

/// One side of a connection. The port is always kept in host byte order,
/// conversions to network order happen only when building kernel requests.
#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq)]
pub struct EndPoint {
    pub ipaddr: IpAddr,
    pub port: u16,
}

impl Default for EndPoint {
    fn default() -> Self {
        Self {
            ipaddr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.ipaddr {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for EndPoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let sa: SocketAddr = s
            .parse()
            .map_err(|e| anyhow!("Invalid endpoint '{}', {}", s, e))?;
        Ok(Self::new(sa.ip(), sa.port()))
    }
}

impl EndPoint {
    pub fn new(ipaddr: IpAddr, port: u16) -> Self {
        Self { ipaddr, port }
    }

    pub fn v4(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            ipaddr: IpAddr::V4(ip),
            port,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.ipaddr.is_ipv6()
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        match self.ipaddr {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        }
    }
}

/// The connection a client asks about: `local` is on this host,
/// `foreign` is the asking peer. Always TCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnQuery {
    pub local: EndPoint,
    pub foreign: EndPoint,
    pub proto: Protocol,
}

impl ConnQuery {
    pub fn new(local: EndPoint, foreign: EndPoint) -> Self {
        Self {
            local,
            foreign,
            proto: Protocol::Tcp,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        self.foreign.is_ipv6()
    }
}

impl fmt::Display for ConnQuery {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}: {} -> {}", self.proto, self.local, self.foreign)
    }
}

/// Owner of a socket, or nothing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupResult {
    Uid(u32),
    Missing,
}

impl LookupResult {
    /// Builds a result from the uid and inode reported by the kernel.
    /// A dead socket (inode 0) whose owner reverted to root is not an owner.
    pub fn from_owner(uid: u32, inode: u64) -> Self {
        if uid == 0 && inode == 0 {
            Self::Missing
        } else {
            Self::Uid(uid)
        }
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, Self::Missing)
    }

    pub fn uid(&self) -> Option<u32> {
        match self {
            Self::Uid(uid) => Some(*uid),
            Self::Missing => None,
        }
    }
}

/// A single NAT session in canonical form.
///
/// `orig_src -> orig_dst` is the connection as the internal host opened it,
/// `reply_src -> reply_dst` is the same connection after translation, as seen
/// from the outside. For a masqueraded session `reply_dst.port` is the port
/// this host uses externally and `reply_src` is the foreign peer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NatRecord {
    pub proto: Protocol,
    pub orig_src: EndPoint,
    pub orig_dst: EndPoint,
    pub reply_src: EndPoint,
    pub reply_dst: EndPoint,
}

impl NatRecord {
    /// Host and port of the connection owner behind the NAT
    pub fn internal(&self) -> &EndPoint {
        &self.orig_src
    }

    /// Host talking to itself through NAT, nothing was masqueraded
    pub fn is_local_loop(&self) -> bool {
        self.orig_src.ipaddr == self.reply_dst.ipaddr
    }
}
