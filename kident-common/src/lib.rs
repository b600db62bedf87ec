#![no_std]

//! Kernel wire structures shared by the diagnostics and conntrack clients.
//!
//! All structs mirror the kernel uapi layouts byte for byte. Multi-byte
//! fields are kept in the byte order the kernel uses on the wire; the
//! user app converts at the edges.

use core::mem::size_of;

/// Netlink protocol numbers
pub const NETLINK_INET_DIAG: i32 = 4;

/// Generic netlink message types
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

/// Legacy tcpdiag request type, same as `inet_diag` TCPDIAG_GETSOCK
pub const TCPDIAG_GETSOCK: u16 = 18;
pub const INET_DIAG_NOCOOKIE: u32 = !0;

/// ctnetlink subsystem and message type
pub const NFNL_SUBSYS_CTNETLINK: u8 = 1;
pub const IPCTNL_MSG_CT_GET: u8 = 1;
pub const NFNETLINK_V0: u8 = 0;

/// Top level conntrack attributes
pub mod cta {
    pub const TUPLE_ORIG: u16 = 1;
    pub const TUPLE_REPLY: u16 = 2;
    pub const PROTOINFO: u16 = 4;
    pub const TIMEOUT: u16 = 7;
    pub const COUNTERS_ORIG: u16 = 9;

    pub const TUPLE_IP: u16 = 1;
    pub const TUPLE_PROTO: u16 = 2;

    pub const IP_V4_SRC: u16 = 1;
    pub const IP_V4_DST: u16 = 2;

    pub const PROTO_NUM: u16 = 1;
    pub const PROTO_SRC_PORT: u16 = 2;
    pub const PROTO_DST_PORT: u16 = 3;

    pub const PROTOINFO_TCP: u16 = 1;
    pub const PROTOINFO_TCP_STATE: u16 = 1;

    pub const COUNTERS_PACKETS: u16 = 1;
    pub const COUNTERS_BYTES: u16 = 2;
}

/// Attribute type bits that are not part of the type value
pub const NLA_TYPE_MASK: u16 = !(0x8000 | 0x4000);

/// Capabilities used by the privilege retention code
pub const CAP_SETPCAP: u32 = 8;
pub const CAP_NET_ADMIN: u32 = 12;
pub const LINUX_CAPABILITY_VERSION_3: u32 = 0x20080522;

bitflags::bitflags! {
/// Netlink header flags
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NlmFlags: u16 {
    const REQUEST = 0x1;
    const MULTI = 0x2;
    const ACK = 0x4;
    const ROOT = 0x100;
    const MATCH = 0x200;
    const DUMP = 0x300;
}
}

bitflags::bitflags! {
/// TCP states accepted by an inet_diag request, one bit per state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpStates: u32 {
    const ESTABLISHED = 1 << 1;
    const SYN_SENT = 1 << 2;
    const SYN_RECV = 1 << 3;
    const FIN_WAIT1 = 1 << 4;
    const FIN_WAIT2 = 1 << 5;
    const TIME_WAIT = 1 << 6;
    const CLOSE = 1 << 7;
    const CLOSE_WAIT = 1 << 8;
    const LAST_ACK = 1 << 9;
    const LISTEN = 1 << 10;
    const CLOSING = 1 << 11;
}
}

impl TcpStates {
    /// Wildcard mask, matches sockets in any state
    pub fn any() -> Self {
        Self::from_bits_retain(!0)
    }
}

/// Plain old data that can be copied to and from a netlink buffer.
///
/// # Safety
/// Implementors must be `#[repr(C)]`, contain only integer fields and
/// be valid for every bit pattern.
pub unsafe trait Wire: Copy + Sized {
    fn as_bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self as *const Self as *const u8, size_of::<Self>()) }
    }

    /// Reads an instance from the start of `buf`, `None` if it is too short.
    fn read_from(buf: &[u8]) -> Option<Self> {
        if buf.len() < size_of::<Self>() {
            return None;
        }
        Some(unsafe { core::ptr::read_unaligned(buf.as_ptr() as *const Self) })
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct NlMsgHdr {
    pub len: u32,
    pub kind: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

unsafe impl Wire for NlMsgHdr {}

pub const NLMSG_ALIGNTO: usize = 4;

pub const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

pub const NLMSG_HDRLEN: usize = nlmsg_align(size_of::<NlMsgHdr>());

/// Identifies one socket, addresses and ports in network byte order.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InetDiagSockId {
    pub sport: u16,
    pub dport: u16,
    pub src: [u8; 16],
    pub dst: [u8; 16],
    pub ifindex: u32,
    pub cookie: [u32; 2],
}

unsafe impl Wire for InetDiagSockId {}

/// The legacy `inet_diag_req` (tcpdiagreq) body.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InetDiagReq {
    pub family: u8,
    pub src_len: u8,
    pub dst_len: u8,
    pub ext: u8,
    pub id: InetDiagSockId,
    pub states: u32,
    pub dbug: u32,
}

unsafe impl Wire for InetDiagReq {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct InetDiagMsg {
    pub family: u8,
    pub state: u8,
    pub timer: u8,
    pub retrans: u8,
    pub id: InetDiagSockId,
    pub expires: u32,
    pub rqueue: u32,
    pub wqueue: u32,
    pub uid: u32,
    pub inode: u32,
}

unsafe impl Wire for InetDiagMsg {}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CapUserHeader {
    pub version: u32,
    pub pid: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct CapUserData {
    pub effective: u32,
    pub permitted: u32,
    pub inheritable: u32,
}
