use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Sessions whose role starts with this prefix are broker-side helpers
/// (relay, cleanup, ...) and are listed separately from regular agents.
pub const SYSTEM_ROLE_PREFIX: &str = "system-";

/// Broadcast recipient marker for the `to` field.
pub const BROADCAST: &str = "*";

/// The event kinds a channel can carry.
///
/// Serialized lowercase with hyphens on the wire (`chat-text`,
/// `webrtc-signaling`, ...). The broker routes on the kind but never
/// interprets the payload behind it.
///
/// ```
/// use courier_server_codec::message::EventType;
///
/// assert_eq!(
///     serde_json::to_string(&EventType::WebrtcSignaling).unwrap(),
///     "\"webrtc-signaling\""
/// );
///
/// assert_eq!(
///     serde_json::from_str::<EventType>("\"password-request\"").unwrap(),
///     EventType::PasswordRequest
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ChatText,
    Connect,
    Disconnect,
    UdpData,
    Custom,
    PasswordRequest,
    PasswordReply,
    WebrtcSignaling,
    File,
}

impl EventType {
    /// Kinds that bypass the per-session custom event type gate and are
    /// offered to every session the addressing rules select.
    pub fn always_delivered(&self) -> bool {
        matches!(
            self,
            Self::ChatText | Self::Connect | Self::Disconnect | Self::WebrtcSignaling
        )
    }
}

/// An outbound event as submitted by a client on `send`.
///
/// `to` and `filter` are mutually exclusive; the broker fills in `from`
/// itself, a client-supplied value is never trusted.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMessage {
    #[serde(default)]
    pub to: Option<String>,
    #[serde(default)]
    pub filter: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<EventType>,
    #[serde(default)]
    pub custom_type: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub ephemeral: bool,
}

/// A routed event as stored in the durable log or the ephemeral cache and
/// as returned from `receive`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    #[serde(rename = "type")]
    pub kind: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_type: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    pub content: String,
    /// Server wall clock at append, in milliseconds since the unix epoch.
    pub date: u64,
    pub global_offset: u64,
    /// Absent for ephemeral events, which never advance the durable
    /// counter.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_offset: Option<u64>,
    #[serde(default)]
    pub ephemeral: bool,
    /// Set on DISCONNECT events appended by the idle reaper rather than by
    /// an explicit client call.
    #[serde(default)]
    pub system_event: bool,
}

impl Envelope {
    /// Whether the envelope is addressed to everyone in the channel.
    pub fn is_broadcast(&self) -> bool {
        self.to.as_deref() == Some(BROADCAST)
    }
}

/// Roster projection of a connected session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentInfo {
    pub agent_name: String,
    #[serde(default)]
    pub agent_type: String,
    #[serde(default)]
    pub descriptor: String,
    #[serde(default)]
    pub ip_address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_event_type: Option<String>,
    #[serde(default)]
    pub restricted_capabilities: Vec<String>,
    /// Server-assigned, strictly monotonic within a channel. Clients
    /// compute the host as the live agent with the smallest value.
    #[serde(default)]
    pub connection_time: u64,
}

impl AgentInfo {
    /// Flat field namespace used by filter evaluation: `name` and `role`
    /// are first-class, anything else is a metadata lookup.
    ///
    /// ```
    /// use courier_server_codec::message::AgentInfo;
    ///
    /// let mut agent = AgentInfo::default();
    /// agent.agent_name = "alice".to_string();
    /// agent.role = "client".to_string();
    /// agent.metadata.insert("tags".to_string(), "premium,beta".to_string());
    ///
    /// assert_eq!(agent.field("name"), Some("alice"));
    /// assert_eq!(agent.field("role"), Some("client"));
    /// assert_eq!(agent.field("tags"), Some("premium,beta"));
    /// assert_eq!(agent.field("plan"), None);
    /// ```
    pub fn field(&self, key: &str) -> Option<&str> {
        match key {
            "name" => Some(self.agent_name.as_str()),
            "role" => Some(self.role.as_str()),
            _ => self.metadata.get(key).map(|value| value.as_str()),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role.starts_with(SYSTEM_ROLE_PREFIX)
    }
}

/// Scope of a developer api key.
///
/// Public channels derive their identity from (name, password) alone, so
/// two developers sharing both reach the same channel; private channels
/// additionally mix the developer key id in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiKeyScope {
    #[default]
    Private,
    Public,
}

/// How a `receive` call wants to trade latency for request volume. Only
/// the wait budget differs between the variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollSource {
    #[default]
    Auto,
    Blocking,
    Poll,
}

/// Caller position for a `receive` call.
///
/// Both offsets absent means "from the start of the current channel
/// instance".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiveConfig {
    #[serde(default)]
    pub global_offset: Option<u64>,
    #[serde(default)]
    pub local_offset: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub poll_source: PollSource,
}

/// An ICE server handed to connecting agents, straight from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    /// TURN entries carry credentials; plain STUN does not. Used to strip
    /// relay servers for sessions that did not ask for relay support.
    pub fn is_relay(&self) -> bool {
        self.credential.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_wire_names() {
        for (kind, name) in [
            (EventType::ChatText, "\"chat-text\""),
            (EventType::Connect, "\"connect\""),
            (EventType::Disconnect, "\"disconnect\""),
            (EventType::UdpData, "\"udp-data\""),
            (EventType::Custom, "\"custom\""),
            (EventType::PasswordRequest, "\"password-request\""),
            (EventType::PasswordReply, "\"password-reply\""),
            (EventType::WebrtcSignaling, "\"webrtc-signaling\""),
            (EventType::File, "\"file\""),
        ] {
            assert_eq!(serde_json::to_string(&kind).unwrap(), name);
        }
    }

    #[test]
    fn unknown_event_type_is_rejected() {
        assert!(serde_json::from_str::<EventType>("\"carrier-pigeon\"").is_err());
    }

    #[test]
    fn always_delivered_covers_lifecycle_chat_and_signaling() {
        for kind in [
            EventType::ChatText,
            EventType::Connect,
            EventType::Disconnect,
            EventType::WebrtcSignaling,
        ] {
            assert!(kind.always_delivered(), "{kind:?}");
        }

        for kind in [
            EventType::UdpData,
            EventType::Custom,
            EventType::PasswordRequest,
            EventType::PasswordReply,
            EventType::File,
        ] {
            assert!(!kind.always_delivered(), "{kind:?}");
        }
    }

    #[test]
    fn envelope_round_trip_keeps_content_opaque() {
        let envelope = Envelope {
            from: "alice".to_string(),
            to: Some("*".to_string()),
            filter: None,
            kind: EventType::ChatText,
            custom_type: None,
            encrypted: true,
            content: "{\"not\":\"parsed\"}".to_string(),
            date: 1_700_000_000_000,
            global_offset: 7,
            local_offset: Some(3),
            ephemeral: false,
            system_event: false,
        };

        let text = serde_json::to_string(&envelope).unwrap();
        let back: Envelope = serde_json::from_str(&text).unwrap();
        assert_eq!(back, envelope);
        assert!(back.is_broadcast());
    }
}
