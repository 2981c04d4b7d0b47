//! The protocol state machine.
//!
//! Handling a frame happens in two halves. [`classify`] is pure: it
//! checks an envelope's action and required fields and produces a
//! [`Command`] or a violation, touching nothing. [`RelayState`] then
//! applies the command against the session registry, the storage backend
//! and the pending outbox, yielding a [`FrameDisposition`] that tells the
//! dispatch loop what to send and whether to close the connection.

use std::net::SocketAddr;
use std::sync::Arc;

use parley_protocol::{Action, Envelope, MAX_NAME_LEN};
use parley_storage::{Storage, StorageError};

use crate::outbox::PendingOutbox;
use crate::registry::{ConnId, SessionRegistry};

/// A validated request, ready to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Presence { user: String },
    Chat { sender: String, destination: String },
    Exit { user: String },
    GetContacts { user: String },
    AddContact { user: String, contact: String },
    RemoveContact { user: String, contact: String },
    ListUsers { user: String },
}

/// Rejection of an envelope before any state is touched.
///
/// The display text goes to the client in the 400 reply.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolViolation {
    #[error("missing action")]
    MissingAction,

    #[error("unknown action")]
    UnknownAction,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid name in field {0}")]
    InvalidName(&'static str),
}

fn require<'a>(
    field: &'a Option<String>,
    name: &'static str,
) -> Result<&'a str, ProtocolViolation> {
    field
        .as_deref()
        .ok_or(ProtocolViolation::MissingField(name))
}

fn require_name<'a>(
    field: &'a Option<String>,
    name: &'static str,
) -> Result<&'a str, ProtocolViolation> {
    let value = require(field, name)?;
    // Names key the registry and composite storage keys; an empty name
    // or an embedded NUL would corrupt both.
    if value.is_empty() || value.len() > MAX_NAME_LEN || value.contains('\0') {
        return Err(ProtocolViolation::InvalidName(name));
    }
    Ok(value)
}

/// Validates required fields per action and produces a [`Command`].
pub fn classify(envelope: &Envelope) -> Result<Command, ProtocolViolation> {
    let action = envelope.action.ok_or(ProtocolViolation::MissingAction)?;
    match action {
        Action::Presence => {
            let user = require_name(&envelope.user, "user")?;
            envelope
                .time
                .ok_or(ProtocolViolation::MissingField("time"))?;
            Ok(Command::Presence { user: user.into() })
        }
        Action::Message => {
            let sender = require_name(&envelope.sender, "from")?;
            let destination = require_name(&envelope.destination, "to")?;
            require(&envelope.text, "mess_text")?;
            envelope
                .time
                .ok_or(ProtocolViolation::MissingField("time"))?;
            Ok(Command::Chat {
                sender: sender.into(),
                destination: destination.into(),
            })
        }
        Action::Exit => {
            let user = require_name(&envelope.account_name, "account_name")?;
            Ok(Command::Exit { user: user.into() })
        }
        Action::GetContacts => {
            let user = require_name(&envelope.user, "user")?;
            Ok(Command::GetContacts { user: user.into() })
        }
        Action::AddContact => {
            let user = require_name(&envelope.user, "user")?;
            let contact = require_name(&envelope.account_name, "account_name")?;
            Ok(Command::AddContact {
                user: user.into(),
                contact: contact.into(),
            })
        }
        Action::RemoveContact => {
            let user = require_name(&envelope.user, "user")?;
            let contact = require_name(&envelope.account_name, "account_name")?;
            Ok(Command::RemoveContact {
                user: user.into(),
                contact: contact.into(),
            })
        }
        Action::GetUsers => {
            let user = require_name(&envelope.account_name, "account_name")?;
            Ok(Command::ListUsers { user: user.into() })
        }
        Action::Unknown => Err(ProtocolViolation::UnknownAction),
    }
}

/// Session lifecycle notification for whoever embeds the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    SessionOpened { user: String, addr: SocketAddr },
    SessionClosed { user: String },
}

/// What the dispatch loop must do after one frame was handled.
#[derive(Debug, Default)]
pub struct FrameDisposition {
    pub reply: Option<Envelope>,
    /// Close the connection after the reply (if any) is flushed.
    pub close: bool,
}

impl FrameDisposition {
    fn silent() -> Self {
        Self::default()
    }

    fn reply(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            close: false,
        }
    }

    fn reply_and_close(envelope: Envelope) -> Self {
        Self {
            reply: Some(envelope),
            close: true,
        }
    }

    fn close() -> Self {
        Self {
            reply: None,
            close: true,
        }
    }
}

/// Registry, outbox and storage behind the dispatch loop.
pub struct RelayState {
    pub registry: SessionRegistry,
    pub outbox: PendingOutbox,
    storage: Arc<dyn Storage>,
    events: Vec<RelayEvent>,
}

impl RelayState {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            registry: SessionRegistry::new(),
            outbox: PendingOutbox::new(),
            storage,
            events: Vec::new(),
        }
    }

    /// Drains the session events produced since the last call.
    pub fn take_events(&mut self) -> Vec<RelayEvent> {
        std::mem::take(&mut self.events)
    }

    /// Classifies and applies one inbound envelope.
    pub fn handle_frame(
        &mut self,
        conn: ConnId,
        peer_addr: SocketAddr,
        envelope: Envelope,
    ) -> FrameDisposition {
        let command = match classify(&envelope) {
            Ok(command) => command,
            Err(violation) => {
                tracing::debug!(%conn, "rejected frame: {violation}");
                return FrameDisposition::reply(Envelope::bad_request(violation.to_string()));
            }
        };

        match command {
            Command::Presence { user } => self.apply_presence(conn, peer_addr, user),
            Command::Chat {
                sender,
                destination,
            } => self.apply_chat(conn, &sender, &destination, envelope),
            Command::Exit { user } => self.apply_exit(conn, &user),
            Command::GetContacts { user } => self.apply_get_contacts(conn, &user),
            Command::AddContact { user, contact } => {
                self.apply_contact_change(conn, &user, &contact, true)
            }
            Command::RemoveContact { user, contact } => {
                self.apply_contact_change(conn, &user, &contact, false)
            }
            Command::ListUsers { user } => self.apply_list_users(conn, &user),
        }
    }

    /// Cleans up after a connection vanished without an exit frame.
    ///
    /// Returns the name whose session was torn down, if it had one.
    pub fn client_gone(&mut self, conn: ConnId) -> Option<String> {
        let name = self.registry.unregister_conn(conn)?;
        if let Err(e) = self.storage.record_logout(&name) {
            tracing::error!(user = %name, "failed to record logout: {e}");
        }
        self.events.push(RelayEvent::SessionClosed { user: name.clone() });
        Some(name)
    }

    fn owns(&self, conn: ConnId, name: &str) -> bool {
        self.registry.lookup(name) == Some(conn)
    }

    fn apply_presence(
        &mut self,
        conn: ConnId,
        peer_addr: SocketAddr,
        user: String,
    ) -> FrameDisposition {
        match self.registry.name_of(conn) {
            // The same client re-announcing itself is harmless.
            Some(current) if current == user => return FrameDisposition::reply(Envelope::ok()),
            Some(current) => {
                return FrameDisposition::reply(Envelope::bad_request(format!(
                    "connection already registered as {current}"
                )));
            }
            None => {}
        }

        if self.registry.register(&user, conn).is_err() {
            tracing::info!(user = %user, %conn, "rejecting duplicate name");
            return FrameDisposition::reply_and_close(Envelope::bad_request(
                "name already taken",
            ));
        }

        if let Err(e) = self.storage.record_login(&user, peer_addr) {
            // A session whose user never made it into the directory would
            // break the directory invariant; back the registration out.
            tracing::error!(user = %user, "failed to record login: {e}");
            self.registry.unregister(&user);
            return FrameDisposition::reply(Envelope::bad_request("internal error"));
        }

        tracing::debug!(user = %user, %conn, %peer_addr, "session opened");
        self.events.push(RelayEvent::SessionOpened {
            user,
            addr: peer_addr,
        });
        FrameDisposition::reply(Envelope::ok())
    }

    fn apply_chat(
        &mut self,
        conn: ConnId,
        sender: &str,
        destination: &str,
        envelope: Envelope,
    ) -> FrameDisposition {
        if !self.owns(conn, sender) {
            tracing::debug!(%conn, sender, "chat from a connection that does not own the name");
            return FrameDisposition::reply(Envelope::bad_request(
                "sender is not registered on this connection",
            ));
        }

        if let Err(e) = self.storage.record_message(sender, destination) {
            tracing::error!(sender, destination, "failed to record message: {e}");
            return FrameDisposition::reply(Envelope::bad_request("internal error"));
        }

        // Queue the envelope exactly as received; the destination gets a
        // byte-identical copy.
        self.outbox.enqueue(envelope);
        FrameDisposition::silent()
    }

    fn apply_exit(&mut self, conn: ConnId, user: &str) -> FrameDisposition {
        if !self.owns(conn, user) {
            return FrameDisposition::reply(Envelope::bad_request(
                "not registered on this connection",
            ));
        }

        self.registry.unregister(user);
        if let Err(e) = self.storage.record_logout(user) {
            tracing::error!(user, "failed to record logout: {e}");
        }
        tracing::debug!(user, %conn, "session closed by exit");
        self.events.push(RelayEvent::SessionClosed { user: user.into() });
        FrameDisposition::close()
    }

    fn apply_get_contacts(&self, conn: ConnId, user: &str) -> FrameDisposition {
        if !self.owns(conn, user) {
            return FrameDisposition::reply(Envelope::bad_request(
                "not registered on this connection",
            ));
        }
        match self.storage.list_contacts(user) {
            Ok(contacts) => FrameDisposition::reply(Envelope::data(contacts)),
            Err(e) => {
                tracing::error!(user, "failed to list contacts: {e}");
                FrameDisposition::reply(Envelope::bad_request("internal error"))
            }
        }
    }

    fn apply_contact_change(
        &self,
        conn: ConnId,
        user: &str,
        contact: &str,
        add: bool,
    ) -> FrameDisposition {
        if !self.owns(conn, user) {
            return FrameDisposition::reply(Envelope::bad_request(
                "not registered on this connection",
            ));
        }
        let result = if add {
            self.storage.add_contact(user, contact)
        } else {
            self.storage.remove_contact(user, contact)
        };
        match result {
            Ok(()) => FrameDisposition::reply(Envelope::ok()),
            Err(e @ StorageError::UnknownUser(_)) => {
                FrameDisposition::reply(Envelope::bad_request(e.to_string()))
            }
            Err(e) => {
                tracing::error!(user, contact, "contact change failed: {e}");
                FrameDisposition::reply(Envelope::bad_request("internal error"))
            }
        }
    }

    fn apply_list_users(&self, conn: ConnId, user: &str) -> FrameDisposition {
        if !self.owns(conn, user) {
            return FrameDisposition::reply(Envelope::bad_request(
                "not registered on this connection",
            ));
        }
        match self.storage.list_users() {
            Ok(users) => FrameDisposition::reply(Envelope::data(users)),
            Err(e) => {
                tracing::error!(user, "failed to list users: {e}");
                FrameDisposition::reply(Envelope::bad_request("internal error"))
            }
        }
    }
}
