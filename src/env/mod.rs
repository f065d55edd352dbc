pub mod identity;
pub mod spawn;

pub use identity::{AccountRecord, IdentityResolver, SystemIdentity, User};
pub use spawn::{LocalSpawner, ProcessHandle, ProcessSpawner};

use std::collections::BTreeMap;
use std::ffi::OsString;
use tracing::warn;

/// Variables replaced with the target account's values when impersonating.
pub const ACCOUNT_VARS: [&str; 3] = ["HOME", "LOGNAME", "USER"];

/// Process environment entries that are valid UTF-8; others are skipped with a warning.
pub fn utf8_vars(
    vars: impl IntoIterator<Item = (OsString, OsString)>,
) -> impl Iterator<Item = (String, String)> {
    vars.into_iter()
        .filter_map(|(key, value)| match (key.into_string(), value.into_string()) {
            (Ok(key), Ok(value)) => Some((key, value)),
            (Ok(key), Err(_)) => {
                warn!(%key, "Skipping environment variable with a non UTF-8 value");
                None
            }
            (Err(key), _) => {
                warn!(key = %key.to_string_lossy(), "Skipping environment variable with a non UTF-8 name");
                None
            }
        })
}

/// Inherited environment with `HOME`, `LOGNAME` and `USER` taken from `account`.
pub fn impersonation_env(
    inherited: impl IntoIterator<Item = (String, String)>,
    account: &AccountRecord,
) -> BTreeMap<String, String> {
    let mut env: BTreeMap<String, String> = inherited.into_iter().collect();
    env.insert("HOME".to_string(), account.home.display().to_string());
    env.insert("LOGNAME".to_string(), account.name.clone());
    env.insert("USER".to_string(), account.name.clone());
    env
}
