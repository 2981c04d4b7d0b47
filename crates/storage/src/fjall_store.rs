//! Fjall-backed storage.
//!
//! One keyspace with four partitions:
//!
//! ```text
//! users:          name                      -> JSON { last_login, last_logout? }
//! contacts:       user \0 contact          -> (empty)
//! login_history:  user \0 micros_be seq_be -> JSON { when, ip, port }
//! message_stats:  name                     -> JSON { sent, received }
//! ```
//!
//! Names are NUL-free by protocol validation, so the `\0` separator in
//! composite keys is unambiguous. Partition iteration is key-ordered,
//! which gives sorted user lists and per-user history runs for free.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use fjall::{Config, Keyspace, PartitionCreateOptions, PartitionHandle};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::StorageError;
use crate::store::{LoginRecord, MessageStats, Storage, UserRecord};

#[derive(Debug, Serialize, Deserialize)]
struct UserValue {
    last_login: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_logout: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryValue {
    when: DateTime<Utc>,
    ip: std::net::IpAddr,
    port: u16,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StatsValue {
    sent: u64,
    received: u64,
}

/// Durable [`Storage`] implementation on a fjall keyspace.
pub struct FjallStore {
    inner: Mutex<FjallInner>,
}

struct FjallInner {
    _tmpdir: Option<tempfile::TempDir>,
    keyspace: Keyspace,
    users: PartitionHandle,
    contacts: PartitionHandle,
    login_history: PartitionHandle,
    message_stats: PartitionHandle,
    // Breaks ties between logins landing on the same microsecond.
    history_seq: u32,
}

fn pair_key(user: &str, second: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(user.len() + 1 + second.len());
    key.extend_from_slice(user.as_bytes());
    key.push(0);
    key.extend_from_slice(second);
    key
}

impl FjallStore {
    /// Opens (or creates) the store at `path`.
    ///
    /// With `None` the keyspace lives in a temporary directory that is
    /// removed when the store is dropped.
    pub fn open(path: Option<&Path>) -> Result<Self, StorageError> {
        let (tmpdir, path) = match path {
            Some(path) => (None, path.to_path_buf()),
            None => {
                let tmpdir = tempfile::TempDir::new()?;
                let path = tmpdir.path().to_path_buf();
                (Some(tmpdir), path)
            }
        };

        info!("opening relay database at {:?}", path);
        let keyspace = Config::new(&path).open()?;

        let users = keyspace.open_partition("users", PartitionCreateOptions::default())?;
        let contacts = keyspace.open_partition("contacts", PartitionCreateOptions::default())?;
        let login_history =
            keyspace.open_partition("login_history", PartitionCreateOptions::default())?;
        let message_stats =
            keyspace.open_partition("message_stats", PartitionCreateOptions::default())?;

        Ok(Self {
            inner: Mutex::new(FjallInner {
                _tmpdir: tmpdir,
                keyspace,
                users,
                contacts,
                login_history,
                message_stats,
                history_seq: 0,
            }),
        })
    }

    /// Flushes the journal to disk.
    pub fn sync(&self) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();
        inner.keyspace.persist(fjall::PersistMode::SyncAll)?;
        Ok(())
    }
}

impl Storage for FjallStore {
    fn record_login(&self, user: &str, addr: SocketAddr) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Utc::now();

        let last_logout = match inner.users.get(user.as_bytes())? {
            Some(bytes) => serde_json::from_slice::<UserValue>(&bytes)?.last_logout,
            None => None,
        };
        let value = UserValue {
            last_login: now,
            last_logout,
        };
        inner
            .users
            .insert(user.as_bytes(), serde_json::to_vec(&value)?)?;

        inner.history_seq = inner.history_seq.wrapping_add(1);
        let mut suffix = (now.timestamp_micros() as u64).to_be_bytes().to_vec();
        suffix.extend_from_slice(&inner.history_seq.to_be_bytes());
        let history = HistoryValue {
            when: now,
            ip: addr.ip(),
            port: addr.port(),
        };
        inner
            .login_history
            .insert(pair_key(user, &suffix), serde_json::to_vec(&history)?)?;
        Ok(())
    }

    fn record_logout(&self, user: &str) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();
        let Some(bytes) = inner.users.get(user.as_bytes())? else {
            return Ok(());
        };
        let mut value: UserValue = serde_json::from_slice(&bytes)?;
        value.last_logout = Some(Utc::now());
        inner
            .users
            .insert(user.as_bytes(), serde_json::to_vec(&value)?)?;
        Ok(())
    }

    fn is_known_user(&self, name: &str) -> Result<bool, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.users.get(name.as_bytes())?.is_some())
    }

    fn list_users(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut names = Vec::new();
        for entry in inner.users.iter() {
            let (key, _) = entry?;
            names.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(names)
    }

    fn users(&self) -> Result<Vec<UserRecord>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut records = Vec::new();
        for entry in inner.users.iter() {
            let (key, value) = entry?;
            let value: UserValue = serde_json::from_slice(&value)?;
            records.push(UserRecord {
                name: String::from_utf8_lossy(&key).into_owned(),
                last_login: value.last_login,
                last_logout: value.last_logout,
            });
        }
        Ok(records)
    }

    fn add_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();
        if inner.users.get(contact.as_bytes())?.is_none() {
            return Err(StorageError::UnknownUser(contact.to_owned()));
        }
        inner
            .contacts
            .insert(pair_key(user, contact.as_bytes()), [])?;
        Ok(())
    }

    fn remove_contact(&self, user: &str, contact: &str) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();
        if inner.users.get(contact.as_bytes())?.is_none() {
            return Err(StorageError::UnknownUser(contact.to_owned()));
        }
        inner.contacts.remove(pair_key(user, contact.as_bytes()))?;
        Ok(())
    }

    fn list_contacts(&self, user: &str) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let prefix = pair_key(user, &[]);
        let mut contacts = Vec::new();
        for entry in inner.contacts.iter() {
            let (key, _) = entry?;
            if let Some(rest) = key.strip_prefix(prefix.as_slice()) {
                contacts.push(String::from_utf8_lossy(rest).into_owned());
            }
        }
        Ok(contacts)
    }

    fn record_message(&self, sender: &str, recipient: &str) -> Result<(), StorageError> {
        let inner = self.inner.lock().unwrap();

        let mut sent: StatsValue = match inner.message_stats.get(sender.as_bytes())? {
            Some(bytes) => serde_json::from_slice(&bytes)?,
            None => StatsValue::default(),
        };
        sent.sent += 1;
        inner
            .message_stats
            .insert(sender.as_bytes(), serde_json::to_vec(&sent)?)?;

        // The destination may never have registered; only known users get
        // a received count.
        if inner.users.get(recipient.as_bytes())?.is_some() {
            let mut received: StatsValue = match inner.message_stats.get(recipient.as_bytes())? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => StatsValue::default(),
            };
            received.received += 1;
            inner
                .message_stats
                .insert(recipient.as_bytes(), serde_json::to_vec(&received)?)?;
        }
        Ok(())
    }

    fn login_history(&self, user: Option<&str>) -> Result<Vec<LoginRecord>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        for entry in inner.login_history.iter() {
            let (key, value) = entry?;
            let Some(sep) = key.iter().position(|&b| b == 0) else {
                continue;
            };
            let name = String::from_utf8_lossy(&key[..sep]).into_owned();
            if let Some(filter) = user {
                if name != filter {
                    continue;
                }
            }
            let value: HistoryValue = serde_json::from_slice(&value)?;
            rows.push(LoginRecord {
                user: name,
                when: value.when,
                ip: value.ip,
                port: value.port,
            });
        }
        Ok(rows)
    }

    fn message_stats(&self) -> Result<Vec<MessageStats>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut rows = Vec::new();
        for entry in inner.message_stats.iter() {
            let (key, value) = entry?;
            let value: StatsValue = serde_json::from_slice(&value)?;
            rows.push(MessageStats {
                user: String::from_utf8_lossy(&key).into_owned(),
                sent: value.sent,
                received: value.received,
            });
        }
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn login_makes_user_known() {
        let store = FjallStore::open(None).unwrap();
        assert!(!store.is_known_user("alice").unwrap());

        store.record_login("alice", addr(50001)).unwrap();
        assert!(store.is_known_user("alice").unwrap());
        assert_eq!(store.list_users().unwrap(), vec!["alice"]);
    }

    #[test]
    fn users_are_listed_sorted() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("carol", addr(1)).unwrap();
        store.record_login("alice", addr(2)).unwrap();
        store.record_login("bob", addr(3)).unwrap();
        assert_eq!(store.list_users().unwrap(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn logout_stamps_known_user_only() {
        let store = FjallStore::open(None).unwrap();
        store.record_logout("ghost").unwrap();
        assert!(store.users().unwrap().is_empty());

        store.record_login("alice", addr(4)).unwrap();
        store.record_logout("alice").unwrap();
        let users = store.users().unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].last_logout.is_some());
    }

    #[test]
    fn login_history_filtering() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(10)).unwrap();
        store.record_login("bob", addr(11)).unwrap();
        store.record_login("alice", addr(12)).unwrap();

        assert_eq!(store.login_history(None).unwrap().len(), 3);

        let alice = store.login_history(Some("alice")).unwrap();
        assert_eq!(alice.len(), 2);
        assert!(alice.iter().all(|r| r.user == "alice"));
        assert_eq!(alice[0].port, 10);
        assert_eq!(alice[1].port, 12);
    }

    #[test]
    fn contacts_roundtrip() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(20)).unwrap();
        store.record_login("bob", addr(21)).unwrap();

        store.add_contact("alice", "bob").unwrap();
        assert_eq!(store.list_contacts("alice").unwrap(), vec!["bob"]);
        // Contacts are one-directional.
        assert!(store.list_contacts("bob").unwrap().is_empty());

        store.remove_contact("alice", "bob").unwrap();
        assert!(store.list_contacts("alice").unwrap().is_empty());
    }

    #[test]
    fn unknown_contact_is_rejected() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(22)).unwrap();

        let err = store.add_contact("alice", "nobody").unwrap_err();
        assert!(matches!(err, StorageError::UnknownUser(name) if name == "nobody"));
        let err = store.remove_contact("alice", "nobody").unwrap_err();
        assert!(matches!(err, StorageError::UnknownUser(_)));
    }

    #[test]
    fn duplicate_and_absent_contact_ops_are_noops() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(23)).unwrap();
        store.record_login("bob", addr(24)).unwrap();

        store.add_contact("alice", "bob").unwrap();
        store.add_contact("alice", "bob").unwrap();
        assert_eq!(store.list_contacts("alice").unwrap(), vec!["bob"]);

        store.remove_contact("alice", "bob").unwrap();
        store.remove_contact("alice", "bob").unwrap();
        assert!(store.list_contacts("alice").unwrap().is_empty());
    }

    #[test]
    fn message_stats_count_both_sides() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(30)).unwrap();
        store.record_login("bob", addr(31)).unwrap();

        store.record_message("alice", "bob").unwrap();
        store.record_message("alice", "bob").unwrap();
        store.record_message("bob", "alice").unwrap();

        let stats = store.message_stats().unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].user, "alice");
        assert_eq!(stats[0].sent, 2);
        assert_eq!(stats[0].received, 1);
        assert_eq!(stats[1].user, "bob");
        assert_eq!(stats[1].sent, 1);
        assert_eq!(stats[1].received, 2);
    }

    #[test]
    fn message_to_unknown_name_counts_sender_only() {
        let store = FjallStore::open(None).unwrap();
        store.record_login("alice", addr(32)).unwrap();

        store.record_message("alice", "nobody").unwrap();
        let stats = store.message_stats().unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].user, "alice");
        assert_eq!(stats[0].sent, 1);
    }

    #[test]
    fn data_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = FjallStore::open(Some(dir.path())).unwrap();
            store.record_login("alice", addr(40)).unwrap();
            store.record_login("bob", addr(41)).unwrap();
            store.add_contact("alice", "bob").unwrap();
            store.sync().unwrap();
        }

        let store = FjallStore::open(Some(dir.path())).unwrap();
        assert_eq!(store.list_users().unwrap(), vec!["alice", "bob"]);
        assert_eq!(store.list_contacts("alice").unwrap(), vec!["bob"]);
        assert_eq!(store.login_history(None).unwrap().len(), 2);
    }
}
