//! User identity for attach and auth.
//!
//! The client sends a user descriptor with `Tauth`/`Tattach`; the server
//! resolves the wire identity through a [`Users`] pool before any capability
//! sees the request.

use std::sync::Arc;

/// A user known to one side of a connection.
pub trait User: Send + Sync + std::fmt::Debug {
    /// User name, as carried in `uname`.
    fn name(&self) -> &str;

    /// Numeric id, as carried in `n_uname` under 9P2000.u.
    fn id(&self) -> u32;
}

/// Lookup pool the server engine resolves identities against.
pub trait Users: Send + Sync {
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>>;
    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>>;
}

/// A plain (name, id) pair.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SimpleUser {
    name: String,
    id: u32,
}

impl SimpleUser {
    pub fn new<S: Into<String>>(name: S, id: u32) -> SimpleUser {
        SimpleUser {
            name: name.into(),
            id,
        }
    }
}

impl User for SimpleUser {
    fn name(&self) -> &str {
        &self.name
    }

    fn id(&self) -> u32 {
        self.id
    }
}

/// Users resolved from the operating system's passwd database.
#[derive(Clone, Copy, Debug, Default)]
pub struct OsUsers;

impl OsUsers {
    /// The user owning the current process.
    pub fn current() -> Option<Arc<dyn User>> {
        OsUsers.uid2user(nix::unistd::geteuid().as_raw())
    }
}

impl Users for OsUsers {
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>> {
        let pw = nix::unistd::User::from_name(uname).ok().flatten()?;
        Some(Arc::new(SimpleUser::new(pw.name, pw.uid.as_raw())))
    }

    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>> {
        let pw = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()?;
        Some(Arc::new(SimpleUser::new(pw.name, pw.uid.as_raw())))
    }
}

/// A pool that accepts any identity, fabricating users on demand.
///
/// Useful for tests and for servers that do their own access control.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnyUsers;

impl Users for AnyUsers {
    fn uname2user(&self, uname: &str) -> Option<Arc<dyn User>> {
        Some(Arc::new(SimpleUser::new(uname, 0)))
    }

    fn uid2user(&self, uid: u32) -> Option<Arc<dyn User>> {
        Some(Arc::new(SimpleUser::new(format!("u{}", uid), uid)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn any_users_accepts_everything() {
        let pool = AnyUsers;
        assert_eq!(pool.uname2user("glenda").unwrap().name(), "glenda");
        assert_eq!(pool.uid2user(1001).unwrap().id(), 1001);
    }
}
