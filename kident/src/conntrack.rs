use crate::{
    ctnetlink::CtDump,
    endpoint::{EndPoint, NatRecord},
    helpers::{stou16, stou32},
    options::{Flags, Options},
    protocols::Protocol,
    scanner::{PROC_TCP, PROC_TCP6},
};
use anyhow::{anyhow, Context};
use log::{error, info};
use std::{
    fmt,
    fs::File,
    io::{self, BufRead, BufReader, Seek, SeekFrom},
    net::Ipv4Addr,
    path::{Path, PathBuf},
};

pub const PROC_MASQ: &str = "/proc/net/ip_masquerade";
pub const PROC_IP_CONNTRACK: &str = "/proc/net/ip_conntrack";
pub const PROC_NF_CONNTRACK: &str = "/proc/net/nf_conntrack";

/// Locations of the kernel tables
#[derive(Clone, Debug, PartialEq)]
pub struct KernelPaths {
    pub tcp: PathBuf,
    pub tcp6: PathBuf,
    pub masq: PathBuf,
    pub ip_conntrack: PathBuf,
    pub nf_conntrack: PathBuf,
}

impl Default for KernelPaths {
    fn default() -> Self {
        Self {
            tcp: PathBuf::from(PROC_TCP),
            tcp6: PathBuf::from(PROC_TCP6),
            masq: PathBuf::from(PROC_MASQ),
            ip_conntrack: PathBuf::from(PROC_IP_CONNTRACK),
            nf_conntrack: PathBuf::from(PROC_NF_CONNTRACK),
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BackendKind {
    /// Static masquerade table, /proc/net/ip_masquerade
    MasqFile,
    /// Legacy connection tracking, /proc/net/ip_conntrack
    IpConntrack,
    /// Modern connection tracking, /proc/net/nf_conntrack
    NfConntrack,
    /// Live ctnetlink dump
    Netlink,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Self::MasqFile => "ip_masquerade",
            Self::IpConntrack => "ip_conntrack",
            Self::NfConntrack => "nf_conntrack",
            Self::Netlink => "ctnetlink",
        };
        write!(f, "{}", name)
    }
}

/// The NAT data source picked at start-up. It never changes afterwards.
///
/// File variants keep their handle open for the process lifetime and rewind
/// it before every scan, so one backend must serve one query at a time.
pub enum TrackingBackend {
    Disabled,
    MasqFile(File),
    IpConntrack(File),
    NfConntrack(File),
    Netlink,
}

fn open_source(path: &Path) -> Result<Option<File>, anyhow::Error> {
    match File::open(path) {
        Ok(file) => Ok(Some(file)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(anyhow!("fopen: {}: {}", path.display(), e)),
    }
}

impl TrackingBackend {
    /// Probes the NAT sources in priority order. A source that exists but
    /// can't be opened is fatal; no source at all disables masquerading.
    pub fn select<F>(paths: &KernelPaths, netlink_available: F) -> Result<Self, anyhow::Error>
    where
        F: FnOnce() -> bool,
    {
        if let Some(file) = open_source(&paths.masq)? {
            return Ok(Self::MasqFile(file));
        }
        if let Some(file) = open_source(&paths.ip_conntrack)? {
            return Ok(Self::IpConntrack(file));
        }
        if let Some(file) = open_source(&paths.nf_conntrack)? {
            return Ok(Self::NfConntrack(file));
        }
        if netlink_available() {
            return Ok(Self::Netlink);
        }
        Ok(Self::Disabled)
    }

    pub fn kind(&self) -> Option<BackendKind> {
        match self {
            Self::Disabled => None,
            Self::MasqFile(_) => Some(BackendKind::MasqFile),
            Self::IpConntrack(_) => Some(BackendKind::IpConntrack),
            Self::NfConntrack(_) => Some(BackendKind::NfConntrack),
            Self::Netlink => Some(BackendKind::Netlink),
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Self::Netlink)
    }

    /// Starts a scan over the current NAT sessions. Only TCP records are
    /// yielded, and only those whose translated ports equal the given ones.
    pub fn nat_records(
        &mut self,
        lport: Option<u16>,
        fport: Option<u16>,
    ) -> Result<NatRecords<'_>, anyhow::Error> {
        let Some(kind) = self.kind() else {
            return Err(anyhow!("NAT/IP masquerading support is unavailable"));
        };
        let lines: Box<dyn Iterator<Item = String> + '_> = match self {
            Self::MasqFile(file) | Self::IpConntrack(file) | Self::NfConntrack(file) => {
                file.seek(SeekFrom::Start(0))
                    .context(format!("Can't rewind {} table", kind))?;
                let lines = BufReader::new(file)
                    .split(b'\n')
                    .map_while(|line| line.ok())
                    .map(|line| String::from_utf8_lossy(&line).into_owned());
                if kind == BackendKind::MasqFile {
                    Box::new(lines.skip(1))
                } else {
                    Box::new(lines)
                }
            }
            Self::Netlink => Box::new(CtDump::open(libc::AF_INET as u8)?),
            Self::Disabled => return Err(anyhow!("No NAT tracking backend")),
        };

        Ok(NatRecords {
            lines,
            kind,
            lport,
            fport,
        })
    }
}

/// Lazy scan over NAT records. Dropping it early stops a live dump.
pub struct NatRecords<'a> {
    lines: Box<dyn Iterator<Item = String> + 'a>,
    kind: BackendKind,
    lport: Option<u16>,
    fport: Option<u16>,
}

impl<'a> Iterator for NatRecords<'a> {
    type Item = NatRecord;

    fn next(&mut self) -> Option<Self::Item> {
        for line in self.lines.by_ref() {
            let Some(rec) = parse_line(self.kind, &line) else {
                continue;
            };
            if rec.proto != Protocol::Tcp {
                continue;
            }
            if self.lport.is_some_and(|p| p != rec.reply_dst.port)
                || self.fport.is_some_and(|p| p != rec.reply_src.port)
            {
                continue;
            }
            return Some(rec);
        }
        None
    }
}

/// Parses one line in the grammar of `kind`
pub fn parse_line(kind: BackendKind, line: &str) -> Option<NatRecord> {
    match kind {
        BackendKind::MasqFile => parse_masq_line(line),
        BackendKind::IpConntrack => parse_conntrack_line(line, false),
        BackendKind::NfConntrack | BackendKind::Netlink => parse_conntrack_line(line, true),
    }
}

fn hex_endpoint(token: &str) -> Option<EndPoint> {
    let (addr, port) = token.split_once(':')?;
    Some(EndPoint::v4(
        Ipv4Addr::from(stou32(addr, 16)?),
        stou16(port, 16)?,
    ))
}

/// `PROTO LADDR:LPORT FADDR:FPORT MPORT NPORT ...` all hex, host order.
/// The table has no reply tuple: the foreign end stands in as reply source
/// and this host's address is left unspecified.
pub fn parse_masq_line(line: &str) -> Option<NatRecord> {
    let mut tokens = line.split_whitespace();
    let proto = Protocol::from_name(tokens.next()?);
    let local = hex_endpoint(tokens.next()?)?;
    let remote = hex_endpoint(tokens.next()?)?;
    let mport = stou16(tokens.next()?, 16)?;
    let nport = stou16(tokens.next()?, 16)?;

    Some(NatRecord {
        proto,
        orig_src: local,
        orig_dst: remote,
        reply_src: EndPoint::new(remote.ipaddr, nport),
        reply_dst: EndPoint::v4(Ipv4Addr::UNSPECIFIED, mport),
    })
}

fn key_value<'a>(token: Option<&'a str>, key: &str) -> Option<&'a str> {
    let (k, v) = token?.split_once('=')?;
    if k == key {
        Some(v)
    } else {
        None
    }
}

fn tuple<'a, I>(tokens: &mut std::iter::Peekable<I>) -> Option<(EndPoint, EndPoint)>
where
    I: Iterator<Item = &'a str>,
{
    let src = key_value(tokens.next(), "src")?.parse::<Ipv4Addr>().ok()?;
    let dst = key_value(tokens.next(), "dst")?.parse::<Ipv4Addr>().ok()?;
    let sport = key_value(tokens.next(), "sport")?.parse::<u16>().ok()?;
    let dport = key_value(tokens.next(), "dport")?.parse::<u16>().ok()?;
    Some((EndPoint::v4(src, sport), EndPoint::v4(dst, dport)))
}

/// `[FAMILY FNUM] PROTO PNUM TIMEOUT ESTABLISHED src= dst= sport= dport=
/// [packets= bytes=] src= dst= sport= dport= ...`
///
/// The counters are only present with conntrack accounting enabled.
pub fn parse_conntrack_line(line: &str, with_family: bool) -> Option<NatRecord> {
    let mut tokens = line.split_whitespace().peekable();
    if with_family {
        let family = tokens.next()?;
        tokens.next()?.parse::<u32>().ok()?;
        if !family.eq_ignore_ascii_case("ipv4") {
            return None;
        }
    }
    let proto = Protocol::from_name(tokens.next()?);
    tokens.next()?.parse::<u32>().ok()?;
    tokens.next()?.parse::<u64>().ok()?;
    if tokens.next()? != "ESTABLISHED" {
        return None;
    }

    let (orig_src, orig_dst) = tuple(&mut tokens)?;
    if tokens.peek()?.starts_with("packets=") {
        key_value(tokens.next(), "packets")?.parse::<u64>().ok()?;
        key_value(tokens.next(), "bytes")?.parse::<u64>().ok()?;
    }
    let (reply_src, reply_dst) = tuple(&mut tokens)?;

    Some(NatRecord {
        proto,
        orig_src,
        orig_dst,
        reply_src,
        reply_dst,
    })
}

/// Selects the tracking backend when masquerading is enabled. Called once,
/// before privileges are dropped.
pub fn core_init(opts: &mut Options, paths: &KernelPaths) -> Result<TrackingBackend, anyhow::Error> {
    if !opts.enabled(Flags::MASQ) {
        return Ok(TrackingBackend::Disabled);
    }

    let backend = TrackingBackend::select(paths, CtDump::available)?;
    match backend.kind() {
        Some(kind) => info!("NAT tracking backend: {}", kind),
        None => {
            error!("NAT/IP masquerading support is unavailable");
            opts.disable(Flags::MASQ);
        }
    }
    Ok(backend)
}
