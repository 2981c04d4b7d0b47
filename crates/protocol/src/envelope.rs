use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::{Action, RESPONSE_BAD_REQUEST, RESPONSE_DATA, RESPONSE_OK};

/// Envelope for all relay communication.
///
/// Mirrors the wire JSON object one field per key. Every field is optional
/// at this layer; which combination is required depends on the action and
/// is checked by the server's classifier, not here. Absent fields are
/// omitted from the serialized form.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Client-supplied send time, seconds since the Unix epoch.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    #[serde(rename = "from", skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(rename = "to", skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_name: Option<String>,
    #[serde(rename = "mess_text", skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_list: Option<Vec<String>>,
}

fn epoch_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl Envelope {
    /// Creates a presence (registration) request for `user`.
    pub fn presence(user: impl Into<String>) -> Self {
        Self {
            action: Some(Action::Presence),
            time: Some(epoch_now()),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Creates a directed chat message.
    pub fn chat(
        sender: impl Into<String>,
        destination: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        Self {
            action: Some(Action::Message),
            time: Some(epoch_now()),
            sender: Some(sender.into()),
            destination: Some(destination.into()),
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Creates an exit notification for `account_name`.
    pub fn exit(account_name: impl Into<String>) -> Self {
        Self {
            action: Some(Action::Exit),
            time: Some(epoch_now()),
            account_name: Some(account_name.into()),
            ..Self::default()
        }
    }

    /// Creates a contact-list query for `user`.
    pub fn get_contacts(user: impl Into<String>) -> Self {
        Self {
            action: Some(Action::GetContacts),
            time: Some(epoch_now()),
            user: Some(user.into()),
            ..Self::default()
        }
    }

    /// Creates a request adding `contact` to `user`'s contact list.
    pub fn add_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            action: Some(Action::AddContact),
            time: Some(epoch_now()),
            user: Some(user.into()),
            account_name: Some(contact.into()),
            ..Self::default()
        }
    }

    /// Creates a request removing `contact` from `user`'s contact list.
    pub fn remove_contact(user: impl Into<String>, contact: impl Into<String>) -> Self {
        Self {
            action: Some(Action::RemoveContact),
            time: Some(epoch_now()),
            user: Some(user.into()),
            account_name: Some(contact.into()),
            ..Self::default()
        }
    }

    /// Creates a known-users query on behalf of `account_name`.
    pub fn get_users(account_name: impl Into<String>) -> Self {
        Self {
            action: Some(Action::GetUsers),
            time: Some(epoch_now()),
            account_name: Some(account_name.into()),
            ..Self::default()
        }
    }

    /// Creates a 200 OK response.
    pub fn ok() -> Self {
        Self {
            response: Some(RESPONSE_OK),
            ..Self::default()
        }
    }

    /// Creates a 202 response carrying `data_list`.
    pub fn data(list: Vec<String>) -> Self {
        Self {
            response: Some(RESPONSE_DATA),
            data_list: Some(list),
            ..Self::default()
        }
    }

    /// Creates a 400 response with an error description.
    pub fn bad_request(error: impl Into<String>) -> Self {
        Self {
            response: Some(RESPONSE_BAD_REQUEST),
            error: Some(error.into()),
            ..Self::default()
        }
    }

    /// True for a 200 or 202 response.
    pub fn is_ok(&self) -> bool {
        matches!(self.response, Some(RESPONSE_OK) | Some(RESPONSE_DATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presence_fields() {
        let env = Envelope::presence("alice");
        assert_eq!(env.action, Some(Action::Presence));
        assert_eq!(env.user.as_deref(), Some("alice"));
        assert!(env.time.unwrap() > 0.0);
        assert!(env.response.is_none());
    }

    #[test]
    fn chat_fields() {
        let env = Envelope::chat("alice", "bob", "hi there");
        assert_eq!(env.action, Some(Action::Message));
        assert_eq!(env.sender.as_deref(), Some("alice"));
        assert_eq!(env.destination.as_deref(), Some("bob"));
        assert_eq!(env.text.as_deref(), Some("hi there"));
    }

    #[test]
    fn wire_field_names() {
        let env = Envelope::chat("alice", "bob", "hi");
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains("\"from\":\"alice\""));
        assert!(json.contains("\"to\":\"bob\""));
        assert!(json.contains("\"mess_text\":\"hi\""));
        assert!(json.contains("\"action\":\"message\""));
    }

    #[test]
    fn envelope_omits_absent_fields() {
        let env = Envelope::ok();
        let json = serde_json::to_string(&env).unwrap();
        assert_eq!(json, "{\"response\":200}");
    }

    #[test]
    fn bad_request_carries_error() {
        let env = Envelope::bad_request("name already taken");
        assert_eq!(env.response, Some(400));
        assert_eq!(env.error.as_deref(), Some("name already taken"));
        assert!(!env.is_ok());
    }

    #[test]
    fn data_response_roundtrip() {
        let env = Envelope::data(vec!["alice".into(), "bob".into()]);
        let json = serde_json::to_string(&env).unwrap();
        let parsed: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.response, Some(202));
        assert_eq!(
            parsed.data_list,
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
        assert!(parsed.is_ok());
    }

    #[test]
    fn unrecognized_keys_are_ignored() {
        let parsed: Envelope =
            serde_json::from_str("{\"action\":\"exit\",\"account_name\":\"a\",\"extra\":1}")
                .unwrap();
        assert_eq!(parsed.action, Some(Action::Exit));
    }

    #[test]
    fn missing_action_deserializes_as_none() {
        let parsed: Envelope = serde_json::from_str("{\"time\":1.5}").unwrap();
        assert!(parsed.action.is_none());
        assert_eq!(parsed.time, Some(1.5));
    }
}
