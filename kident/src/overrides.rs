use crate::config::MasqEntry;
use std::{collections::HashMap, net::Ipv4Addr};

/// User and operating system reported for a masqueraded connection
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MasqIdentity {
    pub user: String,
    pub os: String,
}

/// Fixed answers for internal hosts
pub trait MasqOverrides {
    fn find(&self, host: Ipv4Addr) -> Option<MasqIdentity>;
}

#[derive(Default)]
pub struct StaticMasqTable {
    entries: HashMap<Ipv4Addr, MasqIdentity>,
}

impl StaticMasqTable {
    /// The first entry for a host wins
    pub fn new(entries: &[MasqEntry]) -> Self {
        let mut table = Self::default();
        for e in entries {
            table.entries.entry(e.host).or_insert_with(|| MasqIdentity {
                user: e.user.clone(),
                os: e.os.clone(),
            });
        }
        table
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl MasqOverrides for StaticMasqTable {
    fn find(&self, host: Ipv4Addr) -> Option<MasqIdentity> {
        self.entries.get(&host).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_host_match() {
        let entry = |host: [u8; 4], user: &str| MasqEntry {
            host: host.into(),
            user: user.to_string(),
            os: "UNIX".to_string(),
        };
        let table = StaticMasqTable::new(&[
            entry([192, 168, 1, 10], "alice"),
            entry([192, 168, 1, 10], "mallory"),
            entry([192, 168, 1, 11], "bob"),
        ]);
        assert_eq!(table.len(), 2);
        assert_eq!(
            table.find(Ipv4Addr::new(192, 168, 1, 10)).unwrap().user,
            "alice"
        );
        assert!(table.find(Ipv4Addr::new(192, 168, 1, 12)).is_none());
    }
}
