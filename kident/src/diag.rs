//! Owner lookup through the kernel socket diagnostics protocol.
//!
//! One request per query on a process wide datagram channel. The channel is
//! opened at start-up and, once the kernel refuses it, stays closed for the
//! rest of the process lifetime.

use crate::{
    endpoint::{ConnQuery, LookupResult},
    helpers::ip_octets,
    netlink::{build_message, NetlinkSocket, NlMessages, NlTransport},
};
use kident_common::{
    InetDiagMsg, InetDiagReq, InetDiagSockId, NlmFlags, TcpStates, Wire, INET_DIAG_NOCOOKIE,
    NETLINK_INET_DIAG, NLMSG_DONE, NLMSG_ERROR, TCPDIAG_GETSOCK,
};
use log::{debug, warn};
use std::{io, net::IpAddr};

const RECV_BUF_SIZE: usize = 8192;

fn family(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => libc::AF_INET as u8,
        IpAddr::V6(_) => libc::AF_INET6 as u8,
    }
}

fn addr_len(ip: &IpAddr) -> usize {
    match ip {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

fn sock_id(query: &ConnQuery) -> InetDiagSockId {
    InetDiagSockId {
        sport: query.local.port.to_be(),
        dport: query.foreign.port.to_be(),
        src: ip_octets(&query.local.ipaddr),
        dst: ip_octets(&query.foreign.ipaddr),
        ifindex: 0,
        cookie: [INET_DIAG_NOCOOKIE, INET_DIAG_NOCOOKIE],
    }
}

/// Builds the single request datagram for `query`
pub fn build_request(query: &ConnQuery, seq: u32) -> Vec<u8> {
    let req = InetDiagReq {
        family: family(&query.foreign.ipaddr),
        states: TcpStates::any().bits(),
        id: sock_id(query),
        ..Default::default()
    };
    build_message(
        TCPDIAG_GETSOCK,
        NlmFlags::REQUEST.bits(),
        seq,
        &[req.as_bytes()],
    )
}

fn reply_matches(msg: &InetDiagMsg, query: &ConnQuery) -> bool {
    let want = sock_id(query);
    let alen = addr_len(&query.foreign.ipaddr);
    msg.id.sport == want.sport
        && msg.id.dport == want.dport
        && msg.id.src[..alen] == want.src[..alen]
        && msg.id.dst[..alen] == want.dst[..alen]
}

/// Outcome of parsing one received datagram
#[derive(Debug, PartialEq, Eq)]
enum Parsed {
    /// Only replies to other conversations, keep receiving
    Continue,
    Done(LookupResult),
}

fn parse_datagram(buf: &[u8], truncated: bool, seq: u32, query: &ConnQuery) -> Parsed {
    let mut msgs = NlMessages::new(buf);
    while let Some(msg) = msgs.next() {
        if msg.hdr.seq != seq {
            continue;
        }
        if msg.hdr.kind == NLMSG_DONE || msg.hdr.kind == NLMSG_ERROR {
            return Parsed::Done(LookupResult::Missing);
        }
        let result = match InetDiagMsg::read_from(msg.payload) {
            Some(r) if reply_matches(&r, query) => LookupResult::from_owner(r.uid, r.inode as u64),
            _ => LookupResult::Missing,
        };
        return Parsed::Done(result);
    }

    if truncated || msgs.remaining() != 0 {
        Parsed::Done(LookupResult::Missing)
    } else {
        Parsed::Continue
    }
}

pub struct DiagClient<T: NlTransport = NetlinkSocket> {
    sock: Option<T>,
    seq: u32,
}

impl DiagClient<NetlinkSocket> {
    /// Opens the diagnostics channel. Failing to open it only disables this
    /// lookup method.
    pub fn open() -> Self {
        match NetlinkSocket::open(libc::SOCK_DGRAM, NETLINK_INET_DIAG) {
            Ok(sock) => Self::with_transport(sock),
            Err(e) => {
                warn!("Socket diagnostics channel unavailable, {}", e);
                Self::disabled()
            }
        }
    }
}

impl<T: NlTransport> DiagClient<T> {
    pub fn with_transport(sock: T) -> Self {
        Self {
            sock: Some(sock),
            seq: 0,
        }
    }

    pub fn disabled() -> Self {
        Self { sock: None, seq: 0 }
    }

    pub fn is_open(&self) -> bool {
        self.sock.is_some()
    }

    /// Asks the kernel for the owner of `query`. Any failure is `Missing`;
    /// a refused channel is closed for good.
    pub fn query(&mut self, query: &ConnQuery) -> LookupResult {
        if query.local.is_ipv6() != query.foreign.is_ipv6() {
            return LookupResult::Missing;
        }
        let Some(sock) = self.sock.as_mut() else {
            return LookupResult::Missing;
        };

        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let request = build_request(query, seq);

        if let Err(e) = sock.send(&request) {
            if e.raw_os_error() == Some(libc::ECONNREFUSED) {
                warn!("Socket diagnostics refused by kernel, channel closed");
                self.sock = None;
            } else {
                debug!("sendmsg: {}", e);
            }
            return LookupResult::Missing;
        }

        let mut buf = vec![0_u8; RECV_BUF_SIZE];
        loop {
            let received = match sock.recv(&mut buf) {
                Ok(r) => r,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    debug!("recvmsg: {}", e);
                    return LookupResult::Missing;
                }
            };
            if received.len == 0 {
                return LookupResult::Missing;
            }
            match parse_datagram(&buf[..received.len], received.truncated, seq, query) {
                Parsed::Continue => continue,
                Parsed::Done(result) => return result,
            }
        }
    }
}
