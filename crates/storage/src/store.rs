//! The persistence interface the relay core talks to.
//!
//! `Storage` is implemented by [`FjallStore`](crate::FjallStore) for real
//! deployments and by [`MemoryStore`](crate::MemoryStore) for tests. The
//! dispatch loop calls it synchronously from a single task, so
//! implementations need interior mutability but never see concurrent
//! callers in practice.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::StorageError;

/// A known user as stored in the directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserRecord {
    pub name: String,
    pub last_login: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_logout: Option<DateTime<Utc>>,
}

/// One row of login history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoginRecord {
    pub user: String,
    pub when: DateTime<Utc>,
    pub ip: std::net::IpAddr,
    pub port: u16,
}

/// Per-user message counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageStats {
    pub user: String,
    pub sent: u64,
    pub received: u64,
}

/// Durable user, contact and activity records.
pub trait Storage: Send + Sync {
    /// Upserts `user` in the directory, stamps its last login and appends
    /// a login-history row for `addr`.
    fn record_login(&self, user: &str, addr: SocketAddr) -> Result<(), StorageError>;

    /// Stamps `user`'s last logout. A no-op for unknown users.
    fn record_logout(&self, user: &str) -> Result<(), StorageError>;

    /// True when `name` has logged in at least once.
    fn is_known_user(&self, name: &str) -> Result<bool, StorageError>;

    /// All known user names, sorted.
    fn list_users(&self) -> Result<Vec<String>, StorageError>;

    /// All known users with their login/logout stamps, sorted by name.
    fn users(&self) -> Result<Vec<UserRecord>, StorageError>;

    /// Adds `contact` to `user`'s contact list.
    ///
    /// Fails with [`StorageError::UnknownUser`] when `contact` is not in
    /// the directory; adding an existing contact is a no-op.
    fn add_contact(&self, user: &str, contact: &str) -> Result<(), StorageError>;

    /// Removes `contact` from `user`'s contact list.
    ///
    /// Fails with [`StorageError::UnknownUser`] when `contact` is not in
    /// the directory; removing an absent pair is a no-op.
    fn remove_contact(&self, user: &str, contact: &str) -> Result<(), StorageError>;

    /// `user`'s contacts, sorted.
    fn list_contacts(&self, user: &str) -> Result<Vec<String>, StorageError>;

    /// Counts one relayed message from `sender` to `recipient`.
    ///
    /// The recipient side is only counted for known users; a message
    /// queued toward a name nobody has ever registered still counts as
    /// sent.
    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StorageError>;

    /// Login-history rows, oldest first, optionally for one user.
    fn login_history(&self, user: Option<&str>) -> Result<Vec<LoginRecord>, StorageError>;

    /// Message counters for every user that has sent or received.
    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError>;
}
