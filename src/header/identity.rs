//! Owner and group name resolution for the `uname`/`gname` header fields.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

use nix::unistd::{Gid, Group, Uid, User};
use tracing::debug;

use super::HeaderError;

/// Which identity database a lookup went to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityKind {
    User,
    Group,
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IdentityKind::User => "user",
            IdentityKind::Group => "group",
        })
    }
}

/// What to do when a uid or gid has no name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IdentityPolicy {
    /// Leave the name empty; readers then fall back to the numeric id.
    #[default]
    Fallback,
    /// Fail the entry with [`HeaderError::IdentityLookupFailure`].
    Strict,
}

/// Maps numeric ids to names. `Ok(None)` means the database has no such entry.
pub trait IdentityResolver {
    fn user_name(&self, uid: u32) -> Result<Option<String>, HeaderError>;
    fn group_name(&self, gid: u32) -> Result<Option<String>, HeaderError>;
}

/// Resolver backed by the passwd and group databases, caching every answer for the run.
#[derive(Default)]
pub struct SystemIdentities {
    cache: RefCell<HashMap<(IdentityKind, u32), Option<String>>>,
}

impl SystemIdentities {
    fn lookup(&self, kind: IdentityKind, id: u32) -> Result<Option<String>, HeaderError> {
        if let Some(hit) = self.cache.borrow().get(&(kind, id)) {
            return Ok(hit.clone());
        }

        let found = match kind {
            IdentityKind::User => User::from_uid(Uid::from_raw(id)).map(|u| u.map(|u| u.name)),
            IdentityKind::Group => Group::from_gid(Gid::from_raw(id)).map(|g| g.map(|g| g.name)),
        }
        .map_err(|errno| HeaderError::IdentityDatabase { kind, id, source: errno.into() })?;

        if found.is_none() {
            debug!(%kind, id, "no name in identity database");
        }
        self.cache.borrow_mut().insert((kind, id), found.clone());
        Ok(found)
    }
}

impl IdentityResolver for SystemIdentities {
    fn user_name(&self, uid: u32) -> Result<Option<String>, HeaderError> {
        self.lookup(IdentityKind::User, uid)
    }

    fn group_name(&self, gid: u32) -> Result<Option<String>, HeaderError> {
        self.lookup(IdentityKind::Group, gid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_has_a_name() {
        let ids = SystemIdentities::default();
        assert!(ids.user_name(0).unwrap().is_some());
        // Second lookup is served from the cache.
        assert_eq!(ids.user_name(0).unwrap(), ids.user_name(0).unwrap());
        assert!(ids.cache.borrow().contains_key(&(IdentityKind::User, 0)));
    }

    #[test]
    fn unassigned_id_has_no_name() {
        let ids = SystemIdentities::default();
        assert_eq!(ids.group_name(u32::MAX - 7).unwrap(), None);
    }
}
