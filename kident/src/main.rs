use anyhow::Context;
use clap::{Parser, Subcommand};
use log::{debug, info};
use std::{
    io::{self, Write},
    time::Duration,
};

mod config;
mod conntrack;
mod ctnetlink;
mod diag;
mod endpoint;
mod forward;
mod helpers;
mod ident;
mod info;
mod logging;
mod lookup;
mod masq;
mod netlink;
mod options;
mod overrides;
mod privs;
mod protocols;
mod reply;
mod scanner;

use config::{Config, ConfigFile, DEFAULT_CONFIG};
use conntrack::{core_init, TrackingBackend};
use diag::DiagClient;
use endpoint::{ConnQuery, EndPoint};
use forward::TcpForwarder;
use ident::{IdentSource, Identity, PasswdIdents};
use lookup::{OwnerLookup, UserLookup};
use masq::MasqResolver;
use options::{Flags, Options};
use overrides::StaticMasqTable;
use privs::{Ids, Privileges};
use reply::{write_error, write_userid, IdentError};
use scanner::SocketTables;

#[derive(Debug, Parser)]
#[clap(version, about = "Kernel side lookups of an RFC 1413 ident responder")]
struct Opt {
    /// Configuration file, the default one may be missing
    #[clap(short, long, global = true)]
    config: Option<String>,

    /// Option words merged over the configured ones:
    /// masq, proxy=<ipv4>, forward[=<port>], masq_override, no_diag
    #[clap(short = 'o', long = "option", global = true)]
    options: Vec<String>,

    /// More logging, repeat for trace
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Resolve the owner of one TCP connection and print the ident reply
    Lookup {
        /// Address and port on this host, ip:port or [ip6]:port
        local: EndPoint,
        /// Address and port of the asking peer
        foreign: EndPoint,
        /// Try the masqueraded connections first
        #[clap(long)]
        masq: bool,
    },
    /// List the NAT records of the active tracking backend
    Conntrack {
        /// Only records translated to this local port
        #[clap(long)]
        port: Option<u16>,
        /// Only records with this foreign port
        #[clap(long)]
        fport: Option<u16>,
    },
    /// Show the selected tracking backend and the diagnostics channel state
    Probe,
}

fn load_config(path: Option<&str>) -> Result<Config, anyhow::Error> {
    match path {
        Some(path) => ConfigFile::new(&path).load(true),
        None => ConfigFile::new(&DEFAULT_CONFIG).load(false),
    }
}

/// Answers from a local socket owner
fn answer_direct<W: Write>(
    out: &mut W,
    query: &ConnQuery,
    owners: &mut dyn OwnerLookup,
    idents: &dyn IdentSource,
    os: &str,
) -> io::Result<()> {
    let (lport, fport) = (query.local.port, query.foreign.port);
    let Some(uid) = owners.owner(query).uid() else {
        debug!("No owner for {}", query);
        return write_error(out, lport, fport, IdentError::NoUser);
    };
    match idents.identity(uid) {
        Identity::User(name) => {
            write_userid(out, lport, fport, os, &name)?;
            logging::audit_local(&query.foreign, lport, fport, None, &name);
            Ok(())
        }
        Identity::Hidden(name) => {
            write_error(out, lport, fport, IdentError::HiddenUser)?;
            logging::audit_hidden(&query.foreign, lport, fport, None, &name);
            Ok(())
        }
        Identity::Unknown => write_error(out, lport, fport, IdentError::NoUser),
    }
}

fn run_lookup(
    cfg: &Config,
    opts: &Options,
    query: ConnQuery,
    owners: &mut dyn OwnerLookup,
    backend: &mut TrackingBackend,
) -> Result<(), anyhow::Error> {
    let idents = PasswdIdents::new(cfg.hidden_users.iter().cloned());
    let mut out = io::stdout().lock();

    if opts.enabled(Flags::MASQ) {
        let overrides = StaticMasqTable::new(&cfg.masq_entries);
        debug!("{} static masquerade entries", overrides.len());
        let mut forwarder = TcpForwarder::new(
            opts.forward_port(),
            Duration::from_secs(cfg.forward_timeout),
        );
        let mut resolver = MasqResolver {
            owners: &mut *owners,
            overrides: &overrides,
            forwarder: &mut forwarder,
            idents: &idents,
            opts,
            os: &cfg.os,
        };
        if resolver
            .resolve_masquerade(&mut out, &query, backend)?
            .replied()
        {
            return Ok(());
        }
        debug!("No masquerade answer for {}", query);
    }

    answer_direct(&mut out, &query, owners, &idents, &cfg.os).context("Can't write reply")
}

fn main() -> Result<(), anyhow::Error> {
    let opt = Opt::parse();

    logging::init_log(opt.verbose);

    let cfg = load_config(opt.config.as_deref())?;
    let mut opts = cfg.options();
    opts.merge_option_args(&opt.options);
    match &opt.command {
        Command::Lookup { masq: true, .. } | Command::Conntrack { .. } | Command::Probe => {
            opts.flags.insert(Flags::MASQ)
        }
        _ => {}
    }
    let ids = Ids::resolve(cfg.user.as_deref(), cfg.group.as_deref())
        .context("Can't resolve the configured user/group")?;
    ids.apply_to(&mut opts);
    info!("Options: {}", opts);

    let masq_requested = opts.enabled(Flags::MASQ);

    let paths = cfg.kernel_paths();
    let diag = if opts.enabled(Flags::NO_DIAG) {
        DiagClient::disabled()
    } else {
        DiagClient::open()
    };
    let mut backend = core_init(&mut opts, &paths).context("NAT tracking init failed")?;

    let mut privs = Privileges::new(ids);
    privs
        .maybe_retain_admin_capability(&backend, &mut opts)
        .context("Can't keep CAP_NET_ADMIN across the privilege drop")?;
    privs
        .drop_privileges(&opts)
        .context("Can't drop privileges")?;
    debug!("Capability state: {:?}", privs.state());

    let tables = SocketTables::new(&paths.tcp, &paths.tcp6, opts.proxy());
    let mut owners = UserLookup::new(diag, tables);

    match opt.command {
        Command::Lookup { local, foreign, .. } => {
            let query = ConnQuery::new(local, foreign);
            info!("Lookup {}", query);
            run_lookup(&cfg, &opts, query, &mut owners, &mut backend)?;
        }
        Command::Conntrack { port, fport } => {
            let tab = info::nat_table(backend.nat_records(port, fport)?);
            if tab.is_empty() {
                println!("No NAT records");
            } else {
                tab.print("NAT tracking records");
            }
        }
        Command::Probe => {
            info::probe_table(&backend, &owners.diag, masq_requested).print("kident probe");
        }
    }

    Ok(())
}
