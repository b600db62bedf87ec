//! Live NAT records through a ctnetlink dump.
//!
//! Every conntrack entry pushed by the kernel is rendered into the
//! nf_conntrack text grammar so the file and live backends share one parser.

use crate::{netlink::NlTransport, protocols::Protocol};
use anyhow::Context;
use kident_common::{
    cta, IPCTNL_MSG_CT_GET, NFNETLINK_V0, NFNL_SUBSYS_CTNETLINK, NLA_TYPE_MASK,
};
use log::debug;
use netlink_packet_core::{
    NetlinkHeader, NetlinkMessage, NetlinkPayload, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_netfilter::{NetfilterHeader, NetfilterMessage, NetfilterMessageInner};
use netlink_packet_utils::{
    nla::{DefaultNla, Nla, NlasIterator},
    parsers::{parse_u16_be, parse_u32_be, parse_u8},
};
use netlink_sys::{protocols::NETLINK_NETFILTER, Socket, SocketAddr};
use std::{collections::VecDeque, io, net::Ipv4Addr};

const RECV_BUF_SIZE: usize = 65536;
const DUMP_SEQ: u32 = 1;

static TCP_STATES: [&str; 10] = [
    "NONE",
    "SYN_SENT",
    "SYN_RECV",
    "ESTABLISHED",
    "FIN_WAIT",
    "CLOSE_WAIT",
    "LAST_ACK",
    "TIME_WAIT",
    "CLOSE",
    "SYN_SENT2",
];

/// Nested attributes of `buf` as `(type, value)` pairs, flag bits cleared
fn nested(buf: &[u8]) -> Vec<(u16, Vec<u8>)> {
    NlasIterator::new(buf)
        .filter_map(|nla| nla.ok())
        .map(|nla| (nla.kind() & NLA_TYPE_MASK, nla.value().to_vec()))
        .collect()
}

fn nla_value(nla: &DefaultNla) -> Vec<u8> {
    let mut value = vec![0_u8; nla.value_len()];
    nla.emit_value(&mut value);
    value
}

fn parse_u64_be(buf: &[u8]) -> Option<u64> {
    Some(u64::from_be_bytes(buf.get(..8)?.try_into().ok()?))
}

#[derive(Default)]
struct Tuple {
    src: Option<Ipv4Addr>,
    dst: Option<Ipv4Addr>,
    proto: Option<u8>,
    sport: Option<u16>,
    dport: Option<u16>,
}

impl Tuple {
    fn parse(buf: &[u8]) -> Self {
        let mut t = Self::default();
        for (kind, value) in nested(buf) {
            match kind {
                cta::TUPLE_IP => {
                    for (kind, value) in nested(&value) {
                        let ip = parse_u32_be(&value).ok().map(Ipv4Addr::from);
                        match kind {
                            cta::IP_V4_SRC => t.src = ip,
                            cta::IP_V4_DST => t.dst = ip,
                            _ => {}
                        }
                    }
                }
                cta::TUPLE_PROTO => {
                    for (kind, value) in nested(&value) {
                        match kind {
                            cta::PROTO_NUM => t.proto = parse_u8(&value).ok(),
                            cta::PROTO_SRC_PORT => t.sport = parse_u16_be(&value).ok(),
                            cta::PROTO_DST_PORT => t.dport = parse_u16_be(&value).ok(),
                            _ => {}
                        }
                    }
                }
                _ => {}
            }
        }
        t
    }

    fn render(&self) -> Option<String> {
        let addrs = format!("src={} dst={}", self.src?, self.dst?);
        match (self.sport, self.dport) {
            (Some(sport), Some(dport)) => {
                Some(format!("{} sport={} dport={}", addrs, sport, dport))
            }
            _ => Some(addrs),
        }
    }
}

fn tcp_state(buf: &[u8]) -> Option<u8> {
    let (_, tcp) = nested(buf)
        .into_iter()
        .find(|(kind, _)| *kind == cta::PROTOINFO_TCP)?;
    let (_, state) = nested(&tcp)
        .into_iter()
        .find(|(kind, _)| *kind == cta::PROTOINFO_TCP_STATE)?;
    parse_u8(&state).ok()
}

fn counters(buf: &[u8]) -> Option<(u64, u64)> {
    let mut packets = None;
    let mut bytes = None;
    for (kind, value) in nested(buf) {
        match kind {
            cta::COUNTERS_PACKETS => packets = parse_u64_be(&value),
            cta::COUNTERS_BYTES => bytes = parse_u64_be(&value),
            _ => {}
        }
    }
    Some((packets?, bytes?))
}

/// Renders one conntrack message as a nf_conntrack line. Only IPv4
/// entries are rendered.
pub fn render_conntrack(msg: &NetfilterMessage) -> Option<String> {
    if msg.header.family as i32 != libc::AF_INET {
        return None;
    }
    let nlas = match &msg.inner {
        NetfilterMessageInner::Other { subsys, nlas, .. } if *subsys == NFNL_SUBSYS_CTNETLINK => {
            nlas
        }
        _ => return None,
    };

    let mut orig = None;
    let mut reply = None;
    let mut timeout = 0;
    let mut state = None;
    let mut acct = None;
    for nla in nlas {
        let value = nla_value(nla);
        match nla.kind() & NLA_TYPE_MASK {
            cta::TUPLE_ORIG => orig = Some(Tuple::parse(&value)),
            cta::TUPLE_REPLY => reply = Some(Tuple::parse(&value)),
            cta::TIMEOUT => timeout = parse_u32_be(&value).unwrap_or_default(),
            cta::PROTOINFO => state = tcp_state(&value),
            cta::COUNTERS_ORIG => acct = counters(&value),
            _ => {}
        }
    }

    let orig = orig?;
    let proto_num = orig.proto?;
    let proto = Protocol::from(proto_num);
    let mut line = format!(
        "{:<8} {} {:<8} {} {} ",
        "ipv4",
        libc::AF_INET,
        proto.name(),
        proto_num,
        timeout
    );
    if let Some(state) = state {
        line.push_str(TCP_STATES.get(state as usize).unwrap_or(&"UNKNOWN"));
        line.push(' ');
    }
    line.push_str(&orig.render()?);
    if let Some((packets, bytes)) = acct {
        line.push_str(&format!(" packets={} bytes={}", packets, bytes));
    }
    line.push(' ');
    line.push_str(&reply?.render()?);
    Some(line)
}

fn connect() -> io::Result<Socket> {
    let mut sock = Socket::new(NETLINK_NETFILTER)?;
    sock.bind_auto()?;
    sock.connect(&SocketAddr::new(0, 0))?;
    Ok(sock)
}

/// One-shot dump of the kernel conntrack table
pub struct CtDump<T: NlTransport = Socket> {
    sock: T,
    buf: Vec<u8>,
    pending: VecDeque<String>,
    done: bool,
}

impl CtDump<Socket> {
    pub fn open(family: u8) -> Result<Self, anyhow::Error> {
        let sock = connect().context("Can't open ctnetlink socket")?;
        CtDump::start(sock, family)
    }

    /// Whether a ctnetlink channel can be opened at all
    pub fn available() -> bool {
        match connect() {
            Ok(_) => true,
            Err(e) => {
                debug!("ctnetlink socket: {}", e);
                false
            }
        }
    }
}

pub fn dump_request(family: u8) -> Vec<u8> {
    let nfmsg = NetfilterMessage::new(
        NetfilterHeader {
            family,
            version: NFNETLINK_V0,
            res_id: 0,
        },
        NetfilterMessageInner::Other {
            subsys: NFNL_SUBSYS_CTNETLINK,
            message_type: IPCTNL_MSG_CT_GET,
            nlas: vec![],
        },
    );
    let mut hdr = NetlinkHeader::default();
    hdr.flags = NLM_F_REQUEST | NLM_F_DUMP;
    hdr.sequence_number = DUMP_SEQ;

    let mut msg = NetlinkMessage::new(hdr, NetlinkPayload::InnerMessage(nfmsg));
    msg.finalize();
    let mut buf = vec![0_u8; msg.buffer_len()];
    msg.serialize(&mut buf[..]);
    buf
}

impl<T: NlTransport> CtDump<T> {
    pub fn start(mut sock: T, family: u8) -> Result<Self, anyhow::Error> {
        sock.send(&dump_request(family))
            .context("Can't send ctnetlink dump request")?;
        Ok(Self {
            sock,
            buf: vec![0_u8; RECV_BUF_SIZE],
            pending: VecDeque::new(),
            done: false,
        })
    }

    fn receive(&mut self) {
        let received = loop {
            match self.sock.recv(&mut self.buf) {
                Ok(r) => break r,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("ctnetlink recv: {}", e);
                    self.done = true;
                    return;
                }
            }
        };
        if received.len == 0 {
            self.done = true;
            return;
        }
        if received.truncated {
            debug!("ctnetlink message truncated, dump stopped");
            self.done = true;
            return;
        }

        let mut off = 0;
        while off < received.len {
            let msg = match NetlinkMessage::<NetfilterMessage>::deserialize(
                &self.buf[off..received.len],
            ) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("ctnetlink message not decoded: {}", e);
                    break;
                }
            };
            let len = msg.header.length as usize;
            if len == 0 {
                break;
            }
            off += kident_common::nlmsg_align(len);
            if msg.header.sequence_number != DUMP_SEQ {
                continue;
            }
            match msg.payload {
                NetlinkPayload::Done(_) => {
                    self.done = true;
                    break;
                }
                NetlinkPayload::Error(e) => {
                    debug!("ctnetlink dump failed: {:?}", e);
                    self.done = true;
                    break;
                }
                NetlinkPayload::InnerMessage(nfmsg) => {
                    if let Some(line) = render_conntrack(&nfmsg) {
                        self.pending.push_back(line);
                    }
                }
                _ => {}
            }
        }
    }
}

impl<T: NlTransport> Iterator for CtDump<T> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.pending.pop_front() {
                return Some(line);
            }
            if self.done {
                return None;
            }
            self.receive();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conntrack::{parse_line, BackendKind},
        endpoint::EndPoint,
        netlink::{build_message, tests::FakeTransport},
    };
    use kident_common::{NlMsgHdr, Wire, NLMSG_DONE, NLMSG_ERROR};
    use netlink_packet_utils::Emitable;

    const NESTED: u16 = 0x8000;

    fn nest(kind: u16, nlas: &[DefaultNla]) -> DefaultNla {
        let mut value = vec![0_u8; nlas.buffer_len()];
        nlas.emit(&mut value);
        DefaultNla::new(kind | NESTED, value)
    }

    fn ip_tuple(kind: u16, src: [u8; 4], dst: [u8; 4], sport: u16, dport: u16) -> DefaultNla {
        let ip = nest(
            cta::TUPLE_IP,
            &[
                DefaultNla::new(cta::IP_V4_SRC, src.to_vec()),
                DefaultNla::new(cta::IP_V4_DST, dst.to_vec()),
            ],
        );
        let proto = nest(
            cta::TUPLE_PROTO,
            &[
                DefaultNla::new(cta::PROTO_NUM, vec![6]),
                DefaultNla::new(cta::PROTO_SRC_PORT, sport.to_be_bytes().to_vec()),
                DefaultNla::new(cta::PROTO_DST_PORT, dport.to_be_bytes().to_vec()),
            ],
        );
        nest(kind, &[ip, proto])
    }

    fn conntrack(family: u8, state: u8, with_counters: bool) -> NetfilterMessage {
        let mut nlas = vec![
            ip_tuple(cta::TUPLE_ORIG, [10, 0, 0, 2], [93, 184, 216, 34], 40000, 80),
            ip_tuple(cta::TUPLE_REPLY, [93, 184, 216, 34], [203, 0, 113, 1], 80, 61000),
            DefaultNla::new(cta::TIMEOUT, 431999_u32.to_be_bytes().to_vec()),
            nest(
                cta::PROTOINFO,
                &[nest(
                    cta::PROTOINFO_TCP,
                    &[DefaultNla::new(cta::PROTOINFO_TCP_STATE, vec![state])],
                )],
            ),
        ];
        if with_counters {
            nlas.push(nest(
                cta::COUNTERS_ORIG,
                &[
                    DefaultNla::new(cta::COUNTERS_PACKETS, 3_u64.to_be_bytes().to_vec()),
                    DefaultNla::new(cta::COUNTERS_BYTES, 180_u64.to_be_bytes().to_vec()),
                ],
            ));
        }
        NetfilterMessage::new(
            NetfilterHeader {
                family,
                version: NFNETLINK_V0,
                res_id: 0,
            },
            NetfilterMessageInner::Other {
                subsys: NFNL_SUBSYS_CTNETLINK,
                message_type: 0,
                nlas,
            },
        )
    }

    fn wire(nfmsg: NetfilterMessage, seq: u32) -> Vec<u8> {
        let mut hdr = NetlinkHeader::default();
        hdr.sequence_number = seq;
        let mut msg = NetlinkMessage::new(hdr, NetlinkPayload::InnerMessage(nfmsg));
        msg.finalize();
        let mut buf = vec![0_u8; msg.buffer_len()];
        msg.serialize(&mut buf[..]);
        buf
    }

    fn ipv4(state: u8, with_counters: bool) -> NetfilterMessage {
        conntrack(libc::AF_INET as u8, state, with_counters)
    }

    #[test]
    fn renders_nf_conntrack_lines() {
        let line = render_conntrack(&ipv4(3, true)).unwrap();
        assert_eq!(
            line,
            "ipv4     2 tcp      6 431999 ESTABLISHED src=10.0.0.2 dst=93.184.216.34 sport=40000 dport=80 packets=3 bytes=180 src=93.184.216.34 dst=203.0.113.1 sport=80 dport=61000"
        );
        let line = render_conntrack(&ipv4(3, false)).unwrap();
        let rec = parse_line(BackendKind::Netlink, &line).unwrap();
        assert_eq!(rec.orig_src, "10.0.0.2:40000".parse::<EndPoint>().unwrap());
        assert_eq!(rec.reply_dst.port, 61000);

        let line = render_conntrack(&ipv4(7, false)).unwrap();
        assert!(line.contains(" TIME_WAIT "));
        assert!(parse_line(BackendKind::Netlink, &line).is_none());

        assert!(render_conntrack(&conntrack(libc::AF_INET6 as u8, 3, false)).is_none());
    }

    #[test]
    fn dump_yields_lines_until_done() {
        let mut first = wire(ipv4(3, true), DUMP_SEQ);
        first.extend(wire(ipv4(7, false), DUMP_SEQ));
        first.extend(wire(ipv4(3, false), DUMP_SEQ + 1));
        let mut fake = FakeTransport::default();
        fake.replies.push_back(Ok((first, false)));
        fake.replies.push_back(Ok((wire(ipv4(3, false), DUMP_SEQ), false)));
        fake.replies.push_back(Ok((
            build_message(NLMSG_DONE, 0, DUMP_SEQ, &[&0_i32.to_ne_bytes()]),
            false,
        )));
        fake.replies.push_back(Ok((wire(ipv4(3, false), DUMP_SEQ), false)));

        let dump = CtDump::start(fake, libc::AF_INET as u8).unwrap();
        assert_eq!(dump.sock.sent[0], dump_request(libc::AF_INET as u8));
        assert_eq!(dump.count(), 3);
    }

    #[test]
    fn dump_request_layout() {
        let req = dump_request(libc::AF_INET as u8);
        let hdr = NlMsgHdr::read_from(&req).unwrap();
        assert_eq!(hdr.len as usize, req.len());
        assert_eq!(hdr.kind, 0x0101);
        assert_eq!(hdr.flags, 0x0301);
        assert_eq!(hdr.seq, DUMP_SEQ);
        assert_eq!(req[16], libc::AF_INET as u8);
    }

    #[test]
    fn dump_stops_on_error_or_truncation() {
        let req = dump_request(libc::AF_INET as u8);
        let mut fake = FakeTransport::default();
        fake.replies.push_back(Ok((
            build_message(
                NLMSG_ERROR,
                0,
                DUMP_SEQ,
                &[&(-libc::EPERM).to_ne_bytes(), &req[..16]],
            ),
            false,
        )));
        fake.replies.push_back(Ok((wire(ipv4(3, false), DUMP_SEQ), false)));
        assert_eq!(CtDump::start(fake, libc::AF_INET as u8).unwrap().count(), 0);

        let mut fake = FakeTransport::default();
        fake.replies.push_back(Ok((wire(ipv4(3, false), DUMP_SEQ), true)));
        fake.replies.push_back(Ok((wire(ipv4(3, false), DUMP_SEQ), false)));
        assert_eq!(CtDump::start(fake, libc::AF_INET as u8).unwrap().count(), 0);

        let mut fake = FakeTransport::default();
        fake.send_errors
            .push_back(io::Error::from_raw_os_error(libc::EPERM));
        assert!(CtDump::start(fake, libc::AF_INET as u8).is_err());
    }
}
