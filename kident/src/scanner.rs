//! Owner lookup by scanning the kernel's text tables of live TCP sockets.
//!
//! Tables are re-read on every query since their content changes constantly.

use crate::{
    endpoint::{ConnQuery, LookupResult},
    helpers::{proc_endpoint, stou32},
};
use log::debug;
use std::{
    fs::File,
    io::{BufRead, BufReader},
    net::IpAddr,
    path::{Path, PathBuf},
};

pub const PROC_TCP: &str = "/proc/net/tcp";
pub const PROC_TCP6: &str = "/proc/net/tcp6";

// sl local_address rem_address st tx_queue:rx_queue tr:tm->when retrnsmt uid timeout inode
const COL_LOCAL: usize = 1;
const COL_REMOTE: usize = 2;
const COL_UID: usize = 7;
const COL_INODE: usize = 9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct SocketEntry {
    local: IpAddr,
    lport: u16,
    remote: IpAddr,
    rport: u16,
    uid: u32,
    inode: u64,
}

fn parse_line(line: &str, ipv6: bool) -> Option<SocketEntry> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() <= COL_INODE || !fields[0].ends_with(':') {
        return None;
    }
    let (local, lport) = proc_endpoint(fields[COL_LOCAL], ipv6)?;
    let (remote, rport) = proc_endpoint(fields[COL_REMOTE], ipv6)?;
    let uid = fields[COL_UID].parse::<u32>().ok()?;
    let inode = fields[COL_INODE].parse::<u64>().ok()?;
    // The state column is hex, reject lines that are shifted
    stou32(fields[3], 16)?;

    Some(SocketEntry {
        local,
        lport,
        remote,
        rport,
        uid,
        inode,
    })
}

fn entry_matches(entry: &SocketEntry, query: &ConnQuery, proxy: Option<IpAddr>) -> bool {
    let ports = entry.lport == query.local.port && entry.rport == query.foreign.port;
    if !ports {
        return false;
    }

    // Lookups relayed by the proxy: the proxy asks about a connection to a
    // third party, so only the ports are known to match.
    if let Some(proxy) = proxy.filter(|p| p.is_ipv4()) {
        if query.foreign.ipaddr == proxy && entry.remote != proxy {
            return true;
        }
    }

    entry.local == query.local.ipaddr && entry.remote == query.foreign.ipaddr
}

/// Scans a socket table, the first line is a header. First match wins.
pub fn scan_table<R: BufRead>(
    reader: R,
    query: &ConnQuery,
    ipv6: bool,
    proxy: Option<IpAddr>,
) -> LookupResult {
    for line in reader.split(b'\n').skip(1) {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                debug!("Socket table read failed, {}", e);
                break;
            }
        };
        let line = String::from_utf8_lossy(&line);
        let Some(entry) = parse_line(&line, ipv6) else {
            continue;
        };
        if entry_matches(&entry, query, proxy) {
            return LookupResult::from_owner(entry.uid, entry.inode);
        }
    }

    LookupResult::Missing
}

/// The per family socket tables
#[derive(Clone, Debug)]
pub struct SocketTables {
    pub tcp: PathBuf,
    pub tcp6: PathBuf,
    /// Proxy address when proxy support is enabled
    pub proxy: Option<IpAddr>,
}

impl Default for SocketTables {
    fn default() -> Self {
        Self {
            tcp: PathBuf::from(PROC_TCP),
            tcp6: PathBuf::from(PROC_TCP6),
            proxy: None,
        }
    }
}

impl SocketTables {
    pub fn new<P: AsRef<Path>>(tcp: P, tcp6: P, proxy: Option<IpAddr>) -> Self {
        Self {
            tcp: tcp.as_ref().to_path_buf(),
            tcp6: tcp6.as_ref().to_path_buf(),
            proxy,
        }
    }

    /// Finds the uid owning the queried connection. The family is taken from
    /// the foreign address. A table that can't be opened yields `Missing`.
    pub fn find_owner(&self, query: &ConnQuery) -> LookupResult {
        let ipv6 = query.foreign.is_ipv6();
        if query.local.is_ipv6() != ipv6 {
            return LookupResult::Missing;
        }
        let path = if ipv6 { &self.tcp6 } else { &self.tcp };
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) => {
                debug!("fopen: {}: {}", path.display(), e);
                return LookupResult::Missing;
            }
        };
        let proxy = if ipv6 { None } else { self.proxy };
        scan_table(BufReader::new(file), query, ipv6, proxy)
    }
}
