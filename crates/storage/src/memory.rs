//! In-memory storage for tests and throwaway runs.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::sync::Mutex;

use chrono::{DateTime, Utc};

use crate::StorageError;
use crate::store::{LoginRecord, MessageStats, Storage, UserRecord};

#[derive(Debug, Default)]
struct MemoryInner {
    users: BTreeMap<String, (DateTime<Utc>, Option<DateTime<Utc>>)>,
    contacts: BTreeSet<(String, String)>,
    history: Vec<LoginRecord>,
    stats: BTreeMap<String, (u64, u64)>,
}

/// [`Storage`] double holding everything in maps. Same observable
/// behavior as [`FjallStore`](crate::FjallStore), nothing on disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStore {
    fn record_login(&self, user: &str, addr: SocketAddr) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();
        let last_logout = inner.users.get(user).and_then(|(_, out)| *out);
        inner.users.insert(user.to_owned(), (now, last_logout));
        inner.history.push(LoginRecord {
            user: user.to_owned(),
            when: now,
            ip: addr.ip(),
            port: addr.port(),
        });
        Ok(())
    }

    fn record_logout(&self, user: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.users.get_mut(user) {
            entry.1 = Some(Utc::now());
        }
        Ok(())
    }

    fn is_known_user(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.inner.lock().unwrap().users.contains_key(name))
    }

    fn list_users(&self) -> Result<Vec<String>, StorageError> {
        Ok(self.inner.lock().unwrap().users.keys().cloned().collect())
    }

    fn users(&self) -> Result<Vec<UserRecord>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .users
            .iter()
            .map(|(name, (last_login, last_logout))| UserRecord {
                name: name.clone(),
                last_login: *last_login,
                last_logout: *last_logout,
            })
            .collect())
    }

    fn add_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(contact) {
            return Err(StorageError::UnknownUser(contact.to_owned()));
        }
        inner.contacts.insert((user.to_owned(), contact.to_owned()));
        Ok(())
    }

    fn remove_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.users.contains_key(contact) {
            return Err(StorageError::UnknownUser(contact.to_owned()));
        }
        inner.contacts.remove(&(user.to_owned(), contact.to_owned()));
        Ok(())
    }

    fn list_contacts(&self, user: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .contacts
            .iter()
            .filter(|(owner, _)| owner == user)
            .map(|(_, contact)| contact.clone())
            .collect())
    }

    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.entry(sender.to_owned()).or_default().0 += 1;
        if inner.users.contains_key(recipient) {
            inner.stats.entry(recipient.to_owned()).or_default().1 += 1;
        }
        Ok(())
    }

    fn login_history(&self, user: Option<&str>) -> Result<Vec<LoginRecord>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .history
            .iter()
            .filter(|row| user.is_none_or(|u| row.user == u))
            .cloned()
            .collect())
    }

    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .stats
            .iter()
            .map(|(user, (sent, received))| MessageStats {
                user: user.clone(),
                sent: *sent,
                received: *received,
            })
            .collect())
    }
}
