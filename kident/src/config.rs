use crate::{conntrack::KernelPaths, options::Options};
use anyhow::{anyhow, Context};
use serde::{Deserialize, Serialize};
use std::{fs::OpenOptions, io::Read, net::Ipv4Addr, path::Path};

pub const DEFAULT_CONFIG: &str = "/etc/kident.toml";

/// Static answer for a host masquerading through this one
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MasqEntry {
    pub host: Ipv4Addr,
    pub user: String,
    #[serde(default = "default_os")]
    pub os: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct Paths {
    pub tcp: Option<String>,
    pub tcp6: Option<String>,
    pub masq: Option<String>,
    pub ip_conntrack: Option<String>,
    pub nf_conntrack: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Operating system name reported in USERID replies
    pub os: String,
    /// Drop to this user after start-up
    pub user: Option<String>,
    /// Drop to this group after start-up
    pub group: Option<String>,
    /// Option words, same syntax as `--option`
    pub options: Vec<String>,
    /// Users reported as HIDDEN-USER
    pub hidden_users: Vec<String>,
    /// Seconds to wait for a forwarded lookup
    pub forward_timeout: u64,
    #[serde(rename = "masq_entry")]
    pub masq_entries: Vec<MasqEntry>,
    pub paths: Paths,
}

fn default_os() -> String {
    String::from("UNIX")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            os: default_os(),
            user: None,
            group: None,
            options: vec![],
            hidden_users: vec![],
            forward_timeout: 10,
            masq_entries: vec![],
            paths: Paths::default(),
        }
    }
}

impl Config {
    pub fn description(&self) -> String {
        format!(
            "os: {}, options: [{}], {} masq entries, {} hidden users",
            self.os,
            self.options.join(" "),
            self.masq_entries.len(),
            self.hidden_users.len()
        )
    }

    pub fn options(&self) -> Options {
        Options::from_option_args(&self.options)
    }

    pub fn kernel_paths(&self) -> KernelPaths {
        let mut kp = KernelPaths::default();
        let p = &self.paths;
        if let Some(tcp) = &p.tcp {
            kp.tcp = tcp.into();
        }
        if let Some(tcp6) = &p.tcp6 {
            kp.tcp6 = tcp6.into();
        }
        if let Some(masq) = &p.masq {
            kp.masq = masq.into();
        }
        if let Some(ct) = &p.ip_conntrack {
            kp.ip_conntrack = ct.into();
        }
        if let Some(ct) = &p.nf_conntrack {
            kp.nf_conntrack = ct.into();
        }
        kp
    }
}

pub struct ConfigFile {
    path: String,
}

impl ConfigFile {
    pub fn new<S: AsRef<str>>(filename: &S) -> Self {
        Self {
            path: String::from(filename.as_ref()),
        }
    }

    /// Loads the config, a missing file yields the defaults when `required`
    /// is false.
    pub fn load(&self, required: bool) -> Result<Config, anyhow::Error> {
        if !Path::new(&self.path).try_exists()? {
            if required {
                return Err(anyhow!("Config file does not exits, {}", self.path));
            }
            log::info!("No config file at {}, using defaults", self.path);
            return Ok(Config::default());
        }
        let mut file = OpenOptions::new()
            .read(true)
            .open(&self.path)
            .context(format!("Can't read config file: {}", self.path))?;
        let mut contents = String::new();
        let size = file.read_to_string(&mut contents)?;

        log::info!("Read {} bytes from: {}", size, self.path);

        let cfg: Config = toml::from_str(&contents)
            .context(format!("Invalid config file: {}", self.path))?;

        log::info!("Found in config: {}", cfg.description());
        Ok(cfg)
    }
}
