use serde::{Deserialize, Serialize};

/// Default TCP port the relay listens on.
pub const DEFAULT_PORT: u16 = 7000;

/// Default maximum frame payload size in bytes.
///
/// Counts the JSON payload only, not the 2-byte length prefix. Deployments
/// may raise it, but never past what the prefix can express (`u16::MAX`).
pub const DEFAULT_MAX_FRAME: usize = 1024;

/// Maximum user name length in bytes.
pub const MAX_NAME_LEN: usize = 64;

/// Wire action identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    // Session lifecycle
    #[serde(rename = "presence")]
    Presence,
    #[serde(rename = "exit")]
    Exit,

    // Messaging
    #[serde(rename = "message")]
    Message,

    // Directory queries and mutations
    #[serde(rename = "get_contacts")]
    GetContacts,
    #[serde(rename = "add_contact")]
    AddContact,
    #[serde(rename = "remove")]
    RemoveContact,
    #[serde(rename = "get_users")]
    GetUsers,

    /// Forward compatibility: unknown actions deserialize here.
    #[serde(other)]
    Unknown,
}

/// Response status: request carried out.
pub const RESPONSE_OK: u16 = 200;
/// Response status: query answered, `data_list` carries the result.
pub const RESPONSE_DATA: u16 = 202;
/// Response status: request rejected, `error` carries the reason.
pub const RESPONSE_BAD_REQUEST: u16 = 400;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serialization() {
        assert_eq!(
            serde_json::to_string(&Action::Presence).unwrap(),
            "\"presence\""
        );
        assert_eq!(
            serde_json::to_string(&Action::GetContacts).unwrap(),
            "\"get_contacts\""
        );
        assert_eq!(
            serde_json::to_string(&Action::RemoveContact).unwrap(),
            "\"remove\""
        );
    }

    #[test]
    fn action_deserialization() {
        let action: Action = serde_json::from_str("\"message\"").unwrap();
        assert_eq!(action, Action::Message);
    }

    #[test]
    fn unknown_action() {
        let action: Action = serde_json::from_str("\"some_future_action\"").unwrap();
        assert_eq!(action, Action::Unknown);
    }
}
