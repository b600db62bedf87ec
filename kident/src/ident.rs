//! User identities from the passwd and group databases.

use anyhow::{anyhow, Context};
use nix::unistd::{Group, Uid, User};
use std::collections::HashSet;

/// What a uid resolves to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Identity {
    User(String),
    /// Exists but must not be disclosed
    Hidden(String),
    Unknown,
}

pub trait IdentSource {
    fn identity(&self, uid: u32) -> Identity;
}

/// Login name of `uid`
pub fn user_name(uid: u32) -> Result<Option<String>, anyhow::Error> {
    let user =
        User::from_uid(Uid::from_raw(uid)).with_context(|| format!("getpwuid({})", uid))?;
    Ok(user.map(|u| u.name))
}

/// The uid of a login name, numeric names are taken as is
pub fn user_id(name: &str) -> Result<u32, anyhow::Error> {
    if let Ok(uid) = name.parse::<u32>() {
        return Ok(uid);
    }
    match User::from_name(name) {
        Ok(Some(user)) => Ok(user.uid.as_raw()),
        Ok(None) => Err(anyhow!("Unknown user '{}'", name)),
        Err(e) => Err(anyhow!("Failed to resolve user '{}': {}", name, e)),
    }
}

/// The gid of a group name, numeric names are taken as is
pub fn group_id(name: &str) -> Result<u32, anyhow::Error> {
    if let Ok(gid) = name.parse::<u32>() {
        return Ok(gid);
    }
    match Group::from_name(name) {
        Ok(Some(group)) => Ok(group.gid.as_raw()),
        Ok(None) => Err(anyhow!("Unknown group '{}'", name)),
        Err(e) => Err(anyhow!("Failed to resolve group '{}': {}", name, e)),
    }
}

/// Identities from the passwd database
pub struct PasswdIdents {
    hidden: HashSet<String>,
}

impl PasswdIdents {
    pub fn new<I: IntoIterator<Item = String>>(hidden_users: I) -> Self {
        Self {
            hidden: hidden_users.into_iter().collect(),
        }
    }
}

impl IdentSource for PasswdIdents {
    fn identity(&self, uid: u32) -> Identity {
        match user_name(uid) {
            Ok(Some(name)) if self.hidden.contains(&name) => Identity::Hidden(name),
            Ok(Some(name)) => Identity::User(name),
            Ok(None) => {
                log::debug!("getpwuid({}): no such user", uid);
                Identity::Unknown
            }
            Err(e) => {
                log::debug!("{}", e);
                Identity::Unknown
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_known() {
        assert_eq!(user_name(0).unwrap().as_deref(), Some("root"));
        assert_eq!(user_id("root").unwrap(), 0);
        assert_eq!(group_id("0").unwrap(), 0);
        assert_eq!(user_id("1234").unwrap(), 1234);
        assert!(user_id("no-such-user-kident").is_err());
        assert!(user_id("bad\0name").is_err());
        assert!(group_id("no-such-group-kident").is_err());
        assert_eq!(group_id("root").unwrap(), 0);
    }

    #[test]
    fn hidden_users() {
        let idents = PasswdIdents::new(vec!["root".to_string()]);
        assert_eq!(idents.identity(0), Identity::Hidden("root".to_string()));
        assert_eq!(
            PasswdIdents::new(vec![]).identity(0),
            Identity::User("root".to_string())
        );
        assert_eq!(idents.identity(4_000_000_000), Identity::Unknown);
    }
}
