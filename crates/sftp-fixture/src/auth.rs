//! Authentication policy
//!
//! The fixture authenticates clients by username/password only. The policy
//! is deliberately permissive: as long as no user has been registered, every
//! pair is accepted, which keeps simple tests free of credential setup.
//! Registering the first user switches the server to exact matching.

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::debug;

/// Mutable username/password store consulted on every authentication
/// attempt.
///
/// Reads happen live from concurrently running client sessions, so lookups
/// take a read lock only for the duration of the comparison. Repeated
/// registrations of the same username keep the last password.
#[derive(Default)]
pub struct CredentialStore {
    users: RwLock<HashMap<String, String>>,
}

impl CredentialStore {
    /// Create an empty store that accepts every username/password pair.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `username` with `password`, replacing any earlier password
    /// for the same username.
    pub fn add_user(&self, username: impl Into<String>, password: impl Into<String>) {
        let username = username.into();
        debug!("registering credentials for user: {username}");
        let mut users = self.users.write().unwrap_or_else(|e| e.into_inner());
        users.insert(username, password.into());
    }

    /// Decide whether a username/password pair is accepted.
    ///
    /// Returns `true` if no user has been registered, or if `username` is
    /// registered with exactly `password`. No side effects.
    pub fn authenticate(&self, username: &str, password: &str) -> bool {
        let users = self.users.read().unwrap_or_else(|e| e.into_inner());
        users.is_empty() || users.get(username).map(String::as_str) == Some(password)
    }
}
