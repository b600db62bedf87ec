use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

pub const MASQ: &str = "masq";
pub const PROXY: &str = "proxy";
pub const FORWARD: &str = "forward";
pub const MASQ_OVERRIDE: &str = "masq_override";
pub const NO_DIAG: &str = "no_diag";

/// Default identd port used when forwarding to internal hosts
pub const IDENT_PORT: u16 = 113;

bitflags::bitflags! {
/// Features switched on for the whole process
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Flags: u32 {
    /// Answer for hosts masquerading through this one
    const MASQ = 1;
    /// Accept lookups relayed by a proxy host
    const PROXY = 2;
    /// Forward masqueraded lookups to the internal host
    const FORWARD = 4;
    /// Prefer the static masquerade entries over forwarding
    const MASQ_OVERRIDE = 8;
    /// Never open the socket diagnostics channel
    const NO_DIAG = 16;
    /// Switch to the configured user once initialised
    const CHANGE_UID = 32;
    /// Switch to the configured group once initialised
    const CHANGE_GID = 64;
}
}

#[derive(Clone)]
pub struct Options {
    pub props: BTreeMap<String, String>,
    pub flags: Flags,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            props: BTreeMap::default(),
            flags: Flags::default(),
        }
    }
}

impl fmt::Display for Options {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for opt in self.to_options() {
            write!(f, "{} ", opt)?
        }
        Ok(())
    }
}

impl Options {
    pub fn to_options(&self) -> Vec<String> {
        let mut opt = vec![];
        for flag in self.flags {
            let name = match flag {
                Flags::MASQ => MASQ,
                Flags::MASQ_OVERRIDE => MASQ_OVERRIDE,
                Flags::NO_DIAG => NO_DIAG,
                Flags::PROXY if !self.props.contains_key(PROXY) => PROXY,
                Flags::FORWARD if !self.props.contains_key(FORWARD) => FORWARD,
                _ => continue,
            };
            opt.push(name.to_string());
        }
        for (k, v) in &self.props {
            opt.push(format!("{}={}", k, v));
        }
        opt
    }

    pub fn from_option_args(args: &[String]) -> Self {
        let mut opts = Self::default();
        opts.merge_option_args(args);
        opts
    }

    /// Parses option words on top of the current set, later words win.
    pub fn merge_option_args(&mut self, args: &[String]) {
        for arg in args {
            let kv = arg.split_once('=');
            let (key, value) = match kv {
                None => {
                    match arg.as_str() {
                        MASQ => self.flags.insert(Flags::MASQ),
                        MASQ_OVERRIDE => self.flags.insert(Flags::MASQ_OVERRIDE),
                        NO_DIAG | "no_netlink" => self.flags.insert(Flags::NO_DIAG),
                        FORWARD => self.flags.insert(Flags::FORWARD),
                        PROXY => log::error!("Option '{}' needs an address, {}=<ipv4>", arg, arg),
                        _ => log::error!("Unknown flag '{}' ", arg),
                    }
                    continue;
                }
                Some(kv) => kv,
            };
            match key {
                PROXY => match value.parse::<Ipv4Addr>() {
                    Ok(_) => {
                        self.flags.insert(Flags::PROXY);
                        self.props.insert(key.to_string(), value.to_string());
                    }
                    Err(e) => log::error!("Invalid proxy address '{}', {}", value, e),
                },
                FORWARD => match value.parse::<u16>() {
                    Ok(port) if port != 0 => {
                        self.flags.insert(Flags::FORWARD);
                        self.props.insert(key.to_string(), value.to_string());
                    }
                    _ => log::error!("Invalid forward port '{}' in option '{}'", value, arg),
                },
                _ => log::error!("Unknown key '{}' in option '{}'", key, arg),
            };
        }
    }

    pub fn enabled(&self, flag: Flags) -> bool {
        self.flags.contains(flag)
    }

    pub fn disable(&mut self, flag: Flags) {
        self.flags.remove(flag);
    }

    /// The proxy address when proxy support is on
    pub fn proxy(&self) -> Option<IpAddr> {
        if !self.enabled(Flags::PROXY) {
            return None;
        }
        self.props
            .get(PROXY)
            .and_then(|v| v.parse::<Ipv4Addr>().ok())
            .map(IpAddr::V4)
    }

    pub fn forward_port(&self) -> u16 {
        self.props
            .get(FORWARD)
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or(IDENT_PORT)
    }
}
