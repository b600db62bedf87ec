//! Minimal netlink plumbing shared by the socket diagnostics and the
//! conntrack dump clients.

use crate::helpers::str_errno;
use kident_common::{nlmsg_align, NlMsgHdr, Wire, NLMSG_HDRLEN};
use std::{
    io,
    mem::{size_of, zeroed},
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

/// Result of one receive call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Received {
    pub len: usize,
    /// The datagram didn't fit the buffer
    pub truncated: bool,
}

/// Datagram transport to the kernel. Abstracted so the protocol code can be
/// driven without a kernel.
pub trait NlTransport {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received>;
}

pub struct NetlinkSocket {
    fd: OwnedFd,
}

fn kernel_addr() -> libc::sockaddr_nl {
    let mut nladdr: libc::sockaddr_nl = unsafe { zeroed() };
    nladdr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
    nladdr
}

impl NetlinkSocket {
    /// Opens a netlink socket of `kind` (SOCK_DGRAM or SOCK_RAW) for `protocol`
    pub fn open(kind: i32, protocol: i32) -> io::Result<Self> {
        let fd = unsafe { libc::socket(libc::AF_NETLINK, kind | libc::SOCK_CLOEXEC, protocol) };
        if fd < 0 {
            let err = io::Error::last_os_error();
            log::debug!("socket(AF_NETLINK, {}): {}", protocol, str_errno());
            return Err(err);
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }
}

impl NlTransport for NetlinkSocket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        let nladdr = kernel_addr();
        let rc = unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                &nladdr as *const libc::sockaddr_nl as *const libc::sockaddr,
                size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as usize)
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        let mut nladdr = kernel_addr();
        let mut iov = libc::iovec {
            iov_base: buf.as_mut_ptr() as *mut libc::c_void,
            iov_len: buf.len(),
        };
        let mut msg: libc::msghdr = unsafe { zeroed() };
        msg.msg_name = &mut nladdr as *mut libc::sockaddr_nl as *mut libc::c_void;
        msg.msg_namelen = size_of::<libc::sockaddr_nl>() as libc::socklen_t;
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let rc = unsafe { libc::recvmsg(self.fd.as_raw_fd(), &mut msg, 0) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Received {
            len: rc as usize,
            truncated: msg.msg_flags & libc::MSG_TRUNC != 0,
        })
    }
}

impl NlTransport for netlink_sys::Socket {
    fn send(&mut self, buf: &[u8]) -> io::Result<usize> {
        netlink_sys::Socket::send(self, buf, 0)
    }

    fn recv(&mut self, buf: &mut [u8]) -> io::Result<Received> {
        let (data, _) = self.recv_from_full()?;
        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok(Received {
            len,
            truncated: data.len() > buf.len(),
        })
    }
}

/// One netlink message within a received buffer
pub struct NlMessage<'a> {
    pub hdr: NlMsgHdr,
    pub payload: &'a [u8],
}

/// Walks the messages of a buffer. `remaining()` tells how many bytes were
/// left unparsed once the iterator stops.
pub struct NlMessages<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> NlMessages<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, off: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.off)
    }
}

impl<'a> Iterator for NlMessages<'a> {
    type Item = NlMessage<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let rest = &self.buf[self.off.min(self.buf.len())..];
        let hdr = NlMsgHdr::read_from(rest)?;
        let len = hdr.len as usize;
        if len < NLMSG_HDRLEN || len > rest.len() {
            return None;
        }
        self.off += nlmsg_align(len);
        Some(NlMessage {
            hdr,
            payload: &rest[NLMSG_HDRLEN..len],
        })
    }
}

/// Builds a request: header followed by the given body parts
pub fn build_message(kind: u16, flags: u16, seq: u32, body: &[&[u8]]) -> Vec<u8> {
    let body_len: usize = body.iter().map(|b| nlmsg_align(b.len())).sum();
    let hdr = NlMsgHdr {
        len: (NLMSG_HDRLEN + body_len) as u32,
        kind,
        flags,
        seq,
        pid: 0,
    };
    let mut msg = Vec::with_capacity(hdr.len as usize);
    msg.extend_from_slice(hdr.as_bytes());
    for part in body {
        msg.extend_from_slice(part);
        msg.resize(nlmsg_align(msg.len()), 0);
    }
    msg
}
