//! Relaying a lookup to the ident server of an internal host.

use crate::overrides::MasqIdentity;
use anyhow::{anyhow, Context};
use log::debug;
use std::{
    io::{BufRead, BufReader, Write},
    net::{Ipv4Addr, SocketAddr, TcpStream},
    time::Duration,
};

pub trait Forwarder {
    /// Asks `host` who owns its side of the connection `lport -> fport`
    /// (ports as the internal host sees them).
    fn forward(&mut self, host: Ipv4Addr, lport: u16, fport: u16) -> Option<MasqIdentity>;
}

/// Parses `lport , fport : USERID : os : user`. Anything else, error replies
/// included, is `None`.
pub fn parse_userid_reply(line: &str) -> Option<MasqIdentity> {
    let mut fields = line.trim_end_matches(['\r', '\n']).splitn(4, ':');
    let ports = fields.next()?;
    let (lport, fport) = ports.split_once(',')?;
    lport.trim().parse::<u16>().ok()?;
    fport.trim().parse::<u16>().ok()?;
    if fields.next()?.trim() != "USERID" {
        return None;
    }
    let os = fields.next()?.trim();
    let user = fields.next()?.trim();
    if user.is_empty() {
        return None;
    }
    Some(MasqIdentity {
        user: user.to_string(),
        os: os.to_string(),
    })
}

/// Forwards over TCP with a bounded wait
pub struct TcpForwarder {
    pub port: u16,
    pub timeout: Duration,
}

impl TcpForwarder {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }

    fn exchange(&self, host: Ipv4Addr, lport: u16, fport: u16) -> Result<String, anyhow::Error> {
        let addr = SocketAddr::from((host, self.port));
        let mut stream = TcpStream::connect_timeout(&addr, self.timeout)
            .context(format!("connect {}", addr))?;
        stream.set_read_timeout(Some(self.timeout))?;
        stream.set_write_timeout(Some(self.timeout))?;
        write!(stream, "{} , {}\r\n", lport, fport)?;

        let mut line = String::new();
        let size = BufReader::new(stream).read_line(&mut line)?;
        if size == 0 {
            return Err(anyhow!("{} closed without reply", addr));
        }
        Ok(line)
    }
}

impl Forwarder for TcpForwarder {
    fn forward(&mut self, host: Ipv4Addr, lport: u16, fport: u16) -> Option<MasqIdentity> {
        match self.exchange(host, lport, fport) {
            Ok(line) => {
                let ident = parse_userid_reply(&line);
                if ident.is_none() {
                    debug!("Forward to {}: unusable reply '{}'", host, line.trim_end());
                }
                ident
            }
            Err(e) => {
                debug!("Forward to {}: {:#}", host, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{net::TcpListener, thread};

    #[test]
    fn userid_replies() {
        assert_eq!(
            parse_userid_reply("4000 , 80 : USERID : UNIX : alice\r\n"),
            Some(MasqIdentity {
                user: "alice".to_string(),
                os: "UNIX".to_string()
            })
        );
        assert_eq!(
            parse_userid_reply("4000,80:USERID:UNIX,UTF-8:bob:x").unwrap().user,
            "bob:x"
        );
        assert!(parse_userid_reply("4000,80:ERROR:NO-USER").is_none());
        assert!(parse_userid_reply("4000:USERID:UNIX:alice").is_none());
        assert!(parse_userid_reply("").is_none());
    }

    #[test]
    fn forward_over_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut request = String::new();
            reader.read_line(&mut request).unwrap();
            let mut stream = stream;
            write!(stream, "4000 , 80 : USERID : UNIX : alice\r\n").unwrap();
            request
        });

        let mut fwd = TcpForwarder::new(port, Duration::from_secs(5));
        let ident = fwd.forward(Ipv4Addr::LOCALHOST, 4000, 80).unwrap();
        assert_eq!(ident.user, "alice");
        assert_eq!(server.join().unwrap(), "4000 , 80\r\n");
    }

    #[test]
    fn unreachable_host_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut fwd = TcpForwarder::new(port, Duration::from_secs(1));
        assert!(fwd.forward(Ipv4Addr::LOCALHOST, 4000, 80).is_none());
    }
}
