use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::path::PathBuf;

/// A pair of Unix user and group ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

impl User {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self { uid, gid }
    }
}

/// The parts of a passwd entry needed to impersonate an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountRecord {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl AccountRecord {
    pub fn user(&self) -> User {
        User::new(self.uid, self.gid)
    }
}

pub trait IdentityResolver: Send + Sync {
    /// Identity of the controlling process.
    fn current_user(&self) -> User;

    fn resolve_user(&self, username: &str) -> Result<User>;

    fn account(&self, uid: u32) -> Result<AccountRecord>;
}

/// Looks accounts up in the system user database.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemIdentity;

enum Lookup<'a> {
    Uid(u32),
    Name(&'a CStr),
}

const PASSWD_BUF_LEN: usize = 16 * 1024;

fn passwd_entry(lookup: Lookup<'_>) -> Option<AccountRecord> {
    let mut buf = vec![0 as libc::c_char; PASSWD_BUF_LEN];
    // SAFETY: passwd is plain old data; every pointer field is filled by the
    // *_r call before it is read, and only when `result` is non-null.
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut result: *mut libc::passwd = std::ptr::null_mut();

    let rc = unsafe {
        match lookup {
            Lookup::Uid(uid) => libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result),
            Lookup::Name(name) => {
                libc::getpwnam_r(name.as_ptr(), &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result)
            }
        }
    };
    if rc != 0 || result.is_null() {
        return None;
    }

    // SAFETY: on success pw_name and pw_dir point into `buf`, which is still alive.
    let (name, home) = unsafe {
        (
            CStr::from_ptr(pwd.pw_name).to_string_lossy().into_owned(),
            CStr::from_ptr(pwd.pw_dir).to_string_lossy().into_owned(),
        )
    };

    Some(AccountRecord {
        name,
        uid: pwd.pw_uid,
        gid: pwd.pw_gid,
        home: PathBuf::from(home),
    })
}

impl IdentityResolver for SystemIdentity {
    fn current_user(&self) -> User {
        // SAFETY: getuid/getgid cannot fail.
        unsafe { User::new(libc::getuid(), libc::getgid()) }
    }

    fn resolve_user(&self, username: &str) -> Result<User> {
        let name = CString::new(username)
            .map_err(|_| SandboxError::configuration(format!("invalid user name {:?}", username)))?;
        passwd_entry(Lookup::Name(&name))
            .map(|record| record.user())
            .ok_or_else(|| SandboxError::ResourceNotFound {
                resource: format!("user {}", username),
                available: Vec::new(),
            })
    }

    fn account(&self, uid: u32) -> Result<AccountRecord> {
        passwd_entry(Lookup::Uid(uid)).ok_or_else(|| SandboxError::ResourceNotFound {
            resource: format!("user uid={}", uid),
            available: Vec::new(),
        })
    }
}
