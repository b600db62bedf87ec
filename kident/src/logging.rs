use crate::endpoint::EndPoint;
use chrono::Local;
use log::LevelFilter;
use std::{io::Write, net::Ipv4Addr};

/// Target of the lookup audit trail
pub const AUDIT: &str = "kident::audit";

/// Initialises the process logger. `RUST_LOG` wins over the verbosity count.
pub fn init_log(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_env("RUST_LOG")
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} [{}] {}",
                Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

fn port_pair(port: u16, internal: Option<u16>) -> String {
    match internal {
        Some(internal) => format!("{} ({})", port, internal),
        None => port.to_string(),
    }
}

/// Answer from a local socket owner. `masq` holds the ports of the inner
/// connection when the host reached itself through NAT.
pub fn audit_local(
    peer: &EndPoint,
    lport: u16,
    fport: u16,
    masq: Option<(u16, u16)>,
    user: &str,
) {
    log::info!(
        target: AUDIT,
        "[{}] Successful lookup: {} , {} : {}",
        peer.ipaddr,
        port_pair(lport, masq.map(|m| m.0)),
        port_pair(fport, masq.map(|m| m.1)),
        user
    );
}

pub fn audit_hidden(
    peer: &EndPoint,
    lport: u16,
    fport: u16,
    masq: Option<(u16, u16)>,
    user: &str,
) {
    log::info!(
        target: AUDIT,
        "[{}] {} , {} : HIDDEN-USER ({})",
        peer.ipaddr,
        port_pair(lport, masq.map(|m| m.0)),
        port_pair(fport, masq.map(|m| m.1)),
        user
    );
}

/// Answered from a static masquerade entry. `masq` holds the ports of the
/// internal host's connection.
pub fn audit_masqueraded(
    peer: &EndPoint,
    lport: u16,
    fport: u16,
    masq: Option<(u16, u16)>,
    user: &str,
    os: &str,
) {
    log::info!(
        target: AUDIT,
        "[{}] (Masqueraded) Successful lookup: {} , {} : {} ({})",
        peer.ipaddr,
        port_pair(lport, masq.map(|m| m.0)),
        port_pair(fport, masq.map(|m| m.1)),
        user,
        os
    );
}

pub fn audit_forwarded(
    peer: &EndPoint,
    host: Ipv4Addr,
    lport: u16,
    fport: u16,
    masq: Option<(u16, u16)>,
    user: &str,
    os: &str,
) {
    log::info!(
        target: AUDIT,
        "[{}] (Forwarded lookup to {}) Successful lookup: {} , {} : {} ({})",
        peer.ipaddr,
        host,
        port_pair(lport, masq.map(|m| m.0)),
        port_pair(fport, masq.map(|m| m.1)),
        user,
        os
    );
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use log::{Log, Metadata, Record};
    use std::{cell::RefCell, sync::Once};

    thread_local! {
        static AUDIT_LINES: RefCell<Vec<String>> = const { RefCell::new(Vec::new()) };
    }

    /// Keeps the audit records of the calling thread
    struct AuditCapture;

    impl Log for AuditCapture {
        fn enabled(&self, metadata: &Metadata) -> bool {
            metadata.target() == AUDIT
        }

        fn log(&self, record: &Record) {
            if self.enabled(record.metadata()) {
                AUDIT_LINES.with(|lines| lines.borrow_mut().push(record.args().to_string()));
            }
        }

        fn flush(&self) {}
    }

    static CAPTURE: AuditCapture = AuditCapture;

    /// Runs `f` and returns the audit lines it logged on this thread
    pub fn audit_lines<F: FnOnce()>(f: F) -> Vec<String> {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            if log::set_logger(&CAPTURE).is_ok() {
                log::set_max_level(LevelFilter::Trace);
            }
        });
        AUDIT_LINES.with(|lines| lines.borrow_mut().clear());
        f();
        AUDIT_LINES.with(|lines| lines.take())
    }

    fn peer() -> EndPoint {
        "198.51.100.7:40000".parse().unwrap()
    }

    #[test]
    fn audit_ports() {
        assert_eq!(port_pair(5000, Some(4000)), "5000 (4000)");
        assert_eq!(port_pair(113, None), "113");
    }

    #[test]
    fn audit_lines_carry_both_port_pairs() {
        let lines = audit_lines(|| {
            audit_local(&peer(), 6191, 23, None, "alice");
            audit_hidden(&peer(), 6191, 23, Some((5000, 80)), "bob");
            audit_masqueraded(&peer(), 6191, 23, Some((5000, 80)), "carol", "UNIX");
            audit_forwarded(
                &peer(),
                Ipv4Addr::new(192, 168, 1, 20),
                6191,
                23,
                Some((5000, 80)),
                "dave",
                "OTHER",
            );
        });
        assert_eq!(
            lines,
            vec![
                "[198.51.100.7] Successful lookup: 6191 , 23 : alice",
                "[198.51.100.7] 6191 (5000) , 23 (80) : HIDDEN-USER (bob)",
                "[198.51.100.7] (Masqueraded) Successful lookup: 6191 (5000) , 23 (80) : carol (UNIX)",
                "[198.51.100.7] (Forwarded lookup to 192.168.1.20) Successful lookup: 6191 (5000) , 23 (80) : dave (OTHER)",
            ]
        );
    }
}
