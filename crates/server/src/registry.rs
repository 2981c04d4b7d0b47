//! The live directory of who is online.

use std::collections::HashMap;
use std::fmt;

/// Identifies one accepted connection for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// A name is already bound to a live connection.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("name already taken")]
pub struct NameTaken;

/// Bidirectional user name <-> connection map.
///
/// Owned exclusively by the dispatch task; every method is a plain
/// `&mut self` call, so mutations are atomic with respect to one
/// dispatch tick by construction.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    by_name: HashMap<String, ConnId>,
    by_conn: HashMap<ConnId, String>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `name` to `conn`.
    ///
    /// Fails when the name is already bound, including to `conn` itself;
    /// callers decide whether that is a collision or an idempotent retry
    /// by checking [`name_of`](Self::name_of) first. `conn` must not hold
    /// another session.
    pub fn register(&mut self, name: &str, conn: ConnId) -> Result<(), NameTaken> {
        if self.by_name.contains_key(name) {
            return Err(NameTaken);
        }
        self.by_name.insert(name.to_owned(), conn);
        self.by_conn.insert(conn, name.to_owned());
        Ok(())
    }

    pub fn lookup(&self, name: &str) -> Option<ConnId> {
        self.by_name.get(name).copied()
    }

    pub fn is_online(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Name bound to `conn`, if it has a session.
    pub fn name_of(&self, conn: ConnId) -> Option<&str> {
        self.by_conn.get(&conn).map(String::as_str)
    }

    /// Drops the session for `name`, returning its connection.
    pub fn unregister(&mut self, name: &str) -> Option<ConnId> {
        let conn = self.by_name.remove(name)?;
        self.by_conn.remove(&conn);
        Some(conn)
    }

    /// Drops whatever session `conn` holds, returning the name.
    pub fn unregister_conn(&mut self, conn: ConnId) -> Option<String> {
        let name = self.by_conn.remove(&conn)?;
        self.by_name.remove(&name);
        Some(name)
    }
}
