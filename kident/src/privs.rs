//! Leaving root: either a plain uid/gid switch or, for the live conntrack
//! channel, a switch that keeps CAP_NET_ADMIN.

use crate::{
    conntrack::TrackingBackend,
    ident::{group_id, user_id},
    options::{Flags, Options},
};
use anyhow::{anyhow, Context};
use kident_common::{
    CapUserData, CapUserHeader, CAP_NET_ADMIN, CAP_SETPCAP, LINUX_CAPABILITY_VERSION_3,
};
use log::{debug, info};
use std::{fs, io};

const CAP_LAST_CAP_PATH: &str = "/proc/sys/kernel/cap_last_cap";
const CAP_LAST_CAP_DEFAULT: u32 = 40;

/// Where the process stands; it only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum CapabilityState {
    Full,
    AdminRetained,
    Dropped,
}

/// Target ids of the privilege drop
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ids {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

impl Ids {
    /// Resolves the configured user and group names
    pub fn resolve(user: Option<&str>, group: Option<&str>) -> Result<Self, anyhow::Error> {
        Ok(Self {
            uid: user.map(user_id).transpose()?,
            gid: group.map(group_id).transpose()?,
        })
    }

    /// Turns on CHANGE_UID/CHANGE_GID for the ids that are set
    pub fn apply_to(&self, opts: &mut Options) {
        if self.uid.is_some() {
            opts.flags.insert(Flags::CHANGE_UID);
        }
        if self.gid.is_some() {
            opts.flags.insert(Flags::CHANGE_GID);
        }
    }
}

/// Process credential calls
pub trait CredentialOps {
    fn keep_caps(&mut self, keep: bool) -> io::Result<()>;
    fn last_cap(&mut self) -> u32;
    fn drop_bounding(&mut self, cap: u32) -> io::Result<()>;
    fn clear_groups(&mut self) -> io::Result<()>;
    fn set_gid(&mut self, gid: u32) -> io::Result<()>;
    fn set_uid(&mut self, uid: u32) -> io::Result<()>;
    /// Sets the effective and permitted sets, clears the inheritable one
    fn set_caps(&mut self, caps: u64) -> io::Result<()>;
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// The calling process
pub struct Kernel;

impl CredentialOps for Kernel {
    fn keep_caps(&mut self, keep: bool) -> io::Result<()> {
        check(unsafe { libc::prctl(libc::PR_SET_KEEPCAPS, keep as libc::c_ulong, 0, 0, 0) })
    }

    fn last_cap(&mut self) -> u32 {
        fs::read_to_string(CAP_LAST_CAP_PATH)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .unwrap_or(CAP_LAST_CAP_DEFAULT)
    }

    fn drop_bounding(&mut self, cap: u32) -> io::Result<()> {
        match check(unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap as libc::c_ulong, 0, 0, 0) }) {
            // unknown to this kernel
            Err(e) if e.raw_os_error() == Some(libc::EINVAL) => Ok(()),
            r => r,
        }
    }

    fn clear_groups(&mut self) -> io::Result<()> {
        check(unsafe { libc::setgroups(0, std::ptr::null()) })
    }

    fn set_gid(&mut self, gid: u32) -> io::Result<()> {
        check(unsafe { libc::setresgid(gid, gid, gid) })
    }

    fn set_uid(&mut self, uid: u32) -> io::Result<()> {
        check(unsafe { libc::setresuid(uid, uid, uid) })
    }

    fn set_caps(&mut self, caps: u64) -> io::Result<()> {
        let mut hdr = CapUserHeader {
            version: LINUX_CAPABILITY_VERSION_3,
            pid: 0,
        };
        let data = [
            CapUserData {
                effective: caps as u32,
                permitted: caps as u32,
                inheritable: 0,
            },
            CapUserData {
                effective: (caps >> 32) as u32,
                permitted: (caps >> 32) as u32,
                inheritable: 0,
            },
        ];
        let rc = unsafe {
            libc::syscall(
                libc::SYS_capset,
                &mut hdr as *mut CapUserHeader,
                data.as_ptr(),
            )
        };
        check(rc as libc::c_int)
    }
}

pub struct Privileges<C: CredentialOps = Kernel> {
    ops: C,
    ids: Ids,
    state: CapabilityState,
}

impl Privileges<Kernel> {
    pub fn new(ids: Ids) -> Self {
        Self::with_ops(Kernel, ids)
    }
}

impl<C: CredentialOps> Privileges<C> {
    pub fn with_ops(ops: C, ids: Ids) -> Self {
        Self {
            ops,
            ids,
            state: CapabilityState::Full,
        }
    }

    pub fn state(&self) -> CapabilityState {
        self.state
    }

    fn target_ids(&self, opts: &Options) -> (Option<u32>, Option<u32>) {
        let uid = self.ids.uid.filter(|_| opts.enabled(Flags::CHANGE_UID));
        let gid = self.ids.gid.filter(|_| opts.enabled(Flags::CHANGE_GID));
        (uid, gid)
    }

    fn switch_ids(&mut self, uid: Option<u32>, gid: Option<u32>) -> Result<(), anyhow::Error> {
        self.ops.clear_groups().context("setgroups")?;
        if let Some(gid) = gid {
            self.ops.set_gid(gid).context(format!("setresgid({})", gid))?;
        }
        if let Some(uid) = uid {
            self.ops.set_uid(uid).context(format!("setresuid({})", uid))?;
        }
        Ok(())
    }

    /// Keeps CAP_NET_ADMIN across the id switch when the live conntrack
    /// channel is in use. Returns whether it did anything; once it did, the
    /// general drop is turned off. Errors are fatal.
    pub fn maybe_retain_admin_capability(
        &mut self,
        backend: &TrackingBackend,
        opts: &mut Options,
    ) -> Result<bool, anyhow::Error> {
        if !backend.is_live() || self.state != CapabilityState::Full {
            return Ok(false);
        }
        let (uid, gid) = self.target_ids(opts);

        self.ops.keep_caps(true).context("prctl(PR_SET_KEEPCAPS)")?;
        let last = self.ops.last_cap();
        // PR_CAPBSET_DROP needs CAP_SETPCAP in the effective set, which the
        // uid switch clears, so SETPCAP goes last and before the switch.
        let caps = (0..=last)
            .filter(|&c| c != CAP_NET_ADMIN && c != CAP_SETPCAP)
            .chain([CAP_SETPCAP]);
        for cap in caps {
            self.ops
                .drop_bounding(cap)
                .context(format!("prctl(PR_CAPBSET_DROP, {})", cap))?;
        }
        self.switch_ids(uid, gid)?;
        self.ops.keep_caps(false).context("prctl(PR_SET_KEEPCAPS)")?;
        self.ops
            .set_caps(1 << CAP_NET_ADMIN)
            .context("capset(CAP_NET_ADMIN)")?;

        opts.disable(Flags::CHANGE_UID | Flags::CHANGE_GID);
        self.state = CapabilityState::AdminRetained;
        info!(
            "Privileges dropped to uid {:?} gid {:?}, keeping CAP_NET_ADMIN",
            uid, gid
        );
        Ok(true)
    }

    /// Switches to the configured ids. Does nothing when they were already
    /// switched or none are enabled.
    pub fn drop_privileges(&mut self, opts: &Options) -> Result<(), anyhow::Error> {
        if self.state == CapabilityState::Dropped {
            return Ok(());
        }
        let (uid, gid) = self.target_ids(opts);
        if uid.is_none() && gid.is_none() {
            debug!("No uid/gid change requested");
            return Ok(());
        }
        if self.state == CapabilityState::AdminRetained {
            return Err(anyhow!("Ids already switched with CAP_NET_ADMIN retained"));
        }
        self.switch_ids(uid, gid)?;
        self.state = CapabilityState::Dropped;
        info!("Privileges dropped to uid {:?} gid {:?}", uid, gid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs::File, io::Write};
    use tempfile::NamedTempFile;

    #[derive(Default)]
    struct Calls {
        log: Vec<String>,
        fail: Option<&'static str>,
        /// A non-zero uid clears the effective set like the kernel does
        unprivileged: bool,
    }

    impl Calls {
        fn call(&mut self, name: String) -> io::Result<()> {
            let failed = self.fail.is_some_and(|f| name.starts_with(f));
            self.log.push(name);
            if failed {
                Err(io::Error::from_raw_os_error(libc::EPERM))
            } else {
                Ok(())
            }
        }
    }

    impl CredentialOps for Calls {
        fn keep_caps(&mut self, keep: bool) -> io::Result<()> {
            self.call(format!("keepcaps {}", keep))
        }
        fn last_cap(&mut self) -> u32 {
            13
        }
        fn drop_bounding(&mut self, cap: u32) -> io::Result<()> {
            if self.unprivileged {
                self.log.push(format!("bset {} EPERM", cap));
                return Err(io::Error::from_raw_os_error(libc::EPERM));
            }
            self.call(format!("bset {}", cap))
        }
        fn clear_groups(&mut self) -> io::Result<()> {
            self.call("setgroups".to_string())
        }
        fn set_gid(&mut self, gid: u32) -> io::Result<()> {
            self.call(format!("gid {}", gid))
        }
        fn set_uid(&mut self, uid: u32) -> io::Result<()> {
            self.call(format!("uid {}", uid))?;
            self.unprivileged = uid != 0;
            Ok(())
        }
        fn set_caps(&mut self, caps: u64) -> io::Result<()> {
            self.call(format!("caps {:x}", caps))
        }
    }

    const IDS: Ids = Ids {
        uid: Some(65534),
        gid: Some(65533),
    };

    fn opts() -> Options {
        let mut opts = Options::default();
        IDS.apply_to(&mut opts);
        opts
    }

    fn file_backend() -> (NamedTempFile, TrackingBackend) {
        let mut f = NamedTempFile::new().unwrap();
        writeln!(f).unwrap();
        let backend = TrackingBackend::NfConntrack(File::open(f.path()).unwrap());
        (f, backend)
    }

    #[test]
    fn plain_drop_is_ordered_and_idempotent() {
        let mut privs = Privileges::with_ops(Calls::default(), IDS);
        let (_f, backend) = file_backend();
        let mut opts = opts();

        assert!(!privs.maybe_retain_admin_capability(&backend, &mut opts).unwrap());
        assert!(privs.ops.log.is_empty());

        privs.drop_privileges(&opts).unwrap();
        privs.drop_privileges(&opts).unwrap();
        assert_eq!(privs.ops.log, vec!["setgroups", "gid 65533", "uid 65534"]);
        assert_eq!(privs.state(), CapabilityState::Dropped);
    }

    #[test]
    fn live_backend_keeps_net_admin() {
        let mut privs = Privileges::with_ops(Calls::default(), IDS);
        let mut opts = opts();

        assert!(privs
            .maybe_retain_admin_capability(&TrackingBackend::Netlink, &mut opts)
            .unwrap());
        assert!(!opts.enabled(Flags::CHANGE_UID));
        assert!(!opts.enabled(Flags::CHANGE_GID));
        assert_eq!(privs.state(), CapabilityState::AdminRetained);

        let log = &privs.ops.log;
        assert_eq!(log[0], "keepcaps true");
        let dropped = log.iter().filter(|l| l.starts_with("bset")).collect::<Vec<_>>();
        assert_eq!(dropped.len(), 13);
        assert!(!log.contains(&format!("bset {}", CAP_NET_ADMIN)));
        assert_eq!(
            log[log.len() - 6..],
            [
                "bset 8",
                "setgroups",
                "gid 65533",
                "uid 65534",
                "keepcaps false",
                "caps 1000"
            ]
        );

        // the general drop no longer applies
        let before = log.len();
        privs.drop_privileges(&opts).unwrap();
        assert_eq!(privs.ops.log.len(), before);
    }

    #[test]
    fn bounding_set_is_trimmed_before_uid_switch() {
        let mut privs = Privileges::with_ops(Calls::default(), IDS);
        let mut opts = opts();
        privs
            .maybe_retain_admin_capability(&TrackingBackend::Netlink, &mut opts)
            .unwrap();

        let log = &privs.ops.log;
        let pos = |entry: &str| log.iter().position(|l| l == entry).unwrap();
        assert!(pos("bset 8") < pos("uid 65534"));
        let last_bset = log.iter().rposition(|l| l.starts_with("bset")).unwrap();
        assert!(last_bset < pos("setgroups"));
        assert!(!log.iter().any(|l| l.ends_with("EPERM")));
    }

    #[test]
    fn retain_failure_is_fatal() {
        for step in ["keepcaps", "bset", "setgroups", "uid", "caps"] {
            let calls = Calls {
                fail: Some(step),
                ..Default::default()
            };
            let mut privs = Privileges::with_ops(calls, IDS);
            let mut opts = opts();
            assert!(privs
                .maybe_retain_admin_capability(&TrackingBackend::Netlink, &mut opts)
                .is_err());
            assert!(opts.enabled(Flags::CHANGE_UID));
            assert_eq!(privs.state(), CapabilityState::Full);
        }
    }

    #[test]
    fn only_enabled_ids_change() {
        let mut privs = Privileges::with_ops(Calls::default(), IDS);
        let mut opts = opts();
        opts.disable(Flags::CHANGE_GID);
        privs.drop_privileges(&opts).unwrap();
        assert_eq!(privs.ops.log, vec!["setgroups", "uid 65534"]);

        let mut privs = Privileges::with_ops(Calls::default(), Ids::default());
        privs.drop_privileges(&Options::default()).unwrap();
        assert!(privs.ops.log.is_empty());
        assert_eq!(privs.state(), CapabilityState::Full);
    }

    #[test]
    fn resolve_ids() {
        let ids = Ids::resolve(Some("root"), Some("0")).unwrap();
        assert_eq!(ids, Ids { uid: Some(0), gid: Some(0) });
        assert!(Ids::resolve(Some("no-such-user-kident"), None).is_err());
        let mut opts = Options::default();
        Ids { uid: None, gid: Some(5) }.apply_to(&mut opts);
        assert!(opts.enabled(Flags::CHANGE_GID));
        assert!(!opts.enabled(Flags::CHANGE_UID));
    }
}
