//! Frames and payloads of the pubsub remote-control protocol.
//!
//! The pubsub service speaks a line-oriented text protocol over a websocket.
//! Each frame starts with an operation name:
//!
//! ```text
//! CONNECT <token>|{"player":{"canRemote":true,"name":"_remoteslave_042133"}}
//! CONNECTED
//! SUB <user>/<channel>
//! PUB <user>/<channel>|<json payload>
//! ```
//!
//! Channel names are scoped to a user; this player subscribes to four
//! logical channels of the account it runs for, see [`Topic`].
//!
//! Payloads are JSON objects tagged by an `event` field. Remote commands
//! arrive as `{"event":"remote","command":{"type":...}}` on the private
//! channel and are narrowed into the closed [`Command`] set.

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use veil::Redact;

use crate::error::{Error, Result};

/// Logical channels of a user.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr)]
pub enum Topic {
    /// Remote commands addressed at the user's players.
    Private,

    /// Online presence of the user's clients.
    Presence,

    /// Field updates of the user's profile.
    Fields,

    /// Master player negotiation.
    Player,

    /// Any channel this player does not act on.
    Other(String),
}

impl Topic {
    /// Channels to subscribe to on every (re)connection, in order.
    pub const SUBSCRIPTIONS: [Self; 4] = [Self::Private, Self::Presence, Self::Fields, Self::Player];

    const PRIVATE: &'static str = "private";
    const PRESENCE: &'static str = "presence";
    const FIELDS: &'static str = "fields";
    const PLAYER: &'static str = "player";
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "{}", Self::PRIVATE),
            Self::Presence => write!(f, "{}", Self::PRESENCE),
            Self::Fields => write!(f, "{}", Self::FIELDS),
            Self::Player => write!(f, "{}", Self::PLAYER),
            Self::Other(other) => write!(f, "{other}"),
        }
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let variant = match s {
            Self::PRIVATE => Self::Private,
            Self::PRESENCE => Self::Presence,
            Self::FIELDS => Self::Fields,
            Self::PLAYER => Self::Player,
            "" => return Err(Error::invalid_argument("channel name should not be empty")),
            other => Self::Other(other.to_owned()),
        };

        Ok(variant)
    }
}

/// A user-scoped channel name such as `s1234/player`.
#[derive(Clone, Debug, Hash, PartialEq, Eq, SerializeDisplay, DeserializeFromStr)]
pub struct ChannelName {
    pub user: String,
    pub topic: Topic,
}

impl ChannelName {
    /// Wire character that separates the user from the channel.
    pub(crate) const SEPARATOR: char = '/';

    #[must_use]
    pub fn new(user: &str, topic: Topic) -> Self {
        Self {
            user: user.to_owned(),
            topic,
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.user, Self::SEPARATOR, self.topic)
    }
}

impl FromStr for ChannelName {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (user, topic) = s.split_once(Self::SEPARATOR).ok_or_else(|| {
            Error::invalid_argument(format!("channel name `{s}` should hold a user part"))
        })?;

        Ok(Self {
            user: user.to_owned(),
            topic: topic.parse()?,
        })
    }
}

/// Capabilities announced in the `CONNECT` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    player: PlayerCapabilities,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlayerCapabilities {
    can_remote: bool,
    name: String,
}

impl Capabilities {
    #[must_use]
    pub fn remote_player(player_id: &str) -> Self {
        Self {
            player: PlayerCapabilities {
                can_remote: true,
                name: player_id.to_owned(),
            },
        }
    }
}

/// Frames received from the pubsub service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Inbound {
    /// The handshake completed; subscriptions may be issued.
    Connected,

    /// A payload published on a channel.
    Publish { channel: ChannelName, payload: String },
}

impl Inbound {
    const CONNECTED: &'static str = "CONNECTED";
    const PUB: &'static str = "PUB";
}

impl FromStr for Inbound {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (op, rest) = s.split_once(' ').unwrap_or((s, ""));
        match op {
            Self::CONNECTED => Ok(Self::Connected),
            Self::PUB => {
                let (channel, payload) = rest.split_once('|').ok_or_else(|| {
                    Error::invalid_argument(format!("publish frame should hold a payload: `{s}`"))
                })?;
                Ok(Self::Publish {
                    channel: channel.parse()?,
                    payload: payload.to_owned(),
                })
            }
            _ => Err(Error::invalid_argument(format!("unexpected pubsub operation `{op}`"))),
        }
    }
}

/// Frames sent to the pubsub service.
#[derive(Clone, PartialEq, Eq, Redact)]
pub enum Outbound {
    Connect {
        #[redact]
        token: String,
        capabilities: Capabilities,
    },
    Subscribe(ChannelName),
    Publish(ChannelName, String),
}

impl Outbound {
    const CONNECT: &'static str = "CONNECT";
    const SUB: &'static str = "SUB";
    const PUB: &'static str = "PUB";
}

impl fmt::Display for Outbound {
    /// Formats the frame as it goes on the wire.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect {
                token,
                capabilities,
            } => {
                let capabilities =
                    serde_json::to_string(capabilities).map_err(|_| fmt::Error)?;
                write!(f, "{} {token}|{capabilities}", Self::CONNECT)
            }
            Self::Subscribe(channel) => write!(f, "{} {channel}", Self::SUB),
            Self::Publish(channel, payload) => write!(f, "{} {channel}|{payload}", Self::PUB),
        }
    }
}

/// Master player announcement, published on the `player` channel.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterPlayer {
    pub name: String,

    /// `1` when playing, `0` when idle.
    #[serde(default)]
    pub play_state: u8,

    #[serde(default)]
    pub volume: f32,
}

/// Payloads of published frames, tagged by their `event` field.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum Event {
    /// A remote command; narrowed with [`Command::parse`].
    Remote { command: serde_json::Value },

    /// Someone asks which player is master.
    MasterQuery,

    /// A player claims or confirms master.
    MasterPlayer(MasterPlayer),

    #[serde(other)]
    Other,
}

/// Remote commands this player acts upon.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Command {
    TogglePause,

    Next,

    Previous,

    PlaySource {
        key: String,
        #[serde(default)]
        index: Option<usize>,
    },

    #[serde(rename_all = "camelCase")]
    PlayQueuedSource {
        queue_index: usize,
        #[serde(default)]
        source_index: Option<usize>,
    },

    QueueSource {
        key: String,
    },

    Set {
        key: String,
        #[serde(default)]
        value: serde_json::Value,
    },
}

impl Command {
    /// Wire names of every known command type.
    const TYPES: [&'static str; 7] = [
        "togglePause",
        "next",
        "previous",
        "playSource",
        "playQueuedSource",
        "queueSource",
        "set",
    ];

    /// Narrows a raw command object into a [`Command`].
    ///
    /// # Errors
    ///
    /// Returns `Unimplemented` for command types outside the known set, which
    /// signals protocol drift. Returns `InvalidArgument` if a known command
    /// lacks required fields.
    pub fn parse(value: serde_json::Value) -> Result<Self> {
        let kind = value
            .get("type")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_owned();
        if !Self::TYPES.contains(&kind.as_str()) {
            return Err(Error::unrecognized_command(format!(
                "unrecognized remote command: {value}"
            )));
        }

        serde_json::from_value(value)
            .map_err(|e| Error::invalid_argument(format!("malformed {kind} command: {e}")))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TogglePause => write!(f, "toggle pause"),
            Self::Next => write!(f, "next"),
            Self::Previous => write!(f, "previous"),
            Self::PlaySource { key, index } => match index {
                Some(index) => write!(f, "play {key} from {index}"),
                None => write!(f, "play {key}"),
            },
            Self::PlayQueuedSource {
                queue_index,
                source_index,
            } => match source_index {
                Some(index) => write!(f, "play queued #{queue_index} from {index}"),
                None => write!(f, "play queued #{queue_index}"),
            },
            Self::QueueSource { key } => write!(f, "queue {key}"),
            Self::Set { key, value } => write!(f, "set {key} to {value}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_inbound_frames() {
        assert_eq!("CONNECTED".parse::<Inbound>().unwrap(), Inbound::Connected);

        let frame: Inbound = r#"PUB s1/private|{"event":"remote","command":{"type":"next"}}"#
            .parse()
            .unwrap();
        assert_eq!(
            frame,
            Inbound::Publish {
                channel: ChannelName::new("s1", Topic::Private),
                payload: r#"{"event":"remote","command":{"type":"next"}}"#.to_owned(),
            }
        );

        assert!("PUB s1/private".parse::<Inbound>().is_err());
        assert!("HELLO".parse::<Inbound>().is_err());
    }

    #[test]
    fn payload_may_contain_separators() {
        let frame: Inbound = r#"PUB s1/fields|{"a":"x|y"}"#.parse().unwrap();
        let Inbound::Publish { payload, .. } = frame else {
            panic!("expected publish frame");
        };
        assert_eq!(payload, r#"{"a":"x|y"}"#);
    }

    #[test]
    fn formats_outbound_frames() {
        let connect = Outbound::Connect {
            token: "s3cr3t".to_owned(),
            capabilities: Capabilities::remote_player("_remoteslave_000001"),
        };
        assert_eq!(
            connect.to_string(),
            r#"CONNECT s3cr3t|{"player":{"canRemote":true,"name":"_remoteslave_000001"}}"#
        );
        assert!(!format!("{connect:?}").contains("s3cr3t"));

        let subscribe = Outbound::Subscribe(ChannelName::new("s1", Topic::Presence));
        assert_eq!(subscribe.to_string(), "SUB s1/presence");
    }

    #[test]
    fn unknown_topics_are_kept() {
        let channel: ChannelName = "s1/lobby".parse().unwrap();
        assert_eq!(channel.topic, Topic::Other("lobby".to_owned()));
        assert_eq!(channel.to_string(), "s1/lobby");
        assert!("s1".parse::<ChannelName>().is_err());
    }

    #[test]
    fn parses_events() {
        let event: Event = serde_json::from_value(json!({
            "event": "masterPlayer",
            "name": "_web_1",
            "playState": 1,
            "volume": 0.5,
        }))
        .unwrap();
        assert_eq!(
            event,
            Event::MasterPlayer(MasterPlayer {
                name: "_web_1".to_owned(),
                play_state: 1,
                volume: 0.5,
            })
        );

        let event: Event = serde_json::from_value(json!({"event": "masterQuery"})).unwrap();
        assert_eq!(event, Event::MasterQuery);

        let event: Event = serde_json::from_value(json!({"event": "typing"})).unwrap();
        assert_eq!(event, Event::Other);
    }

    #[test]
    fn announces_master() {
        let event = Event::MasterPlayer(MasterPlayer {
            name: "_remoteslave_000001".to_owned(),
            play_state: 0,
            volume: 1.0,
        });
        assert_eq!(
            serde_json::to_value(event).unwrap(),
            json!({
                "event": "masterPlayer",
                "name": "_remoteslave_000001",
                "playState": 0,
                "volume": 1.0,
            })
        );
    }

    #[test]
    fn narrows_commands() {
        assert_eq!(
            Command::parse(json!({"type": "playSource", "key": "al1", "index": 2})).unwrap(),
            Command::PlaySource {
                key: "al1".to_owned(),
                index: Some(2)
            }
        );
        assert_eq!(
            Command::parse(json!({"type": "playQueuedSource", "queueIndex": 0})).unwrap(),
            Command::PlayQueuedSource {
                queue_index: 0,
                source_index: None
            }
        );
        assert_eq!(
            Command::parse(json!({"type": "togglePause"})).unwrap(),
            Command::TogglePause
        );
    }

    #[test]
    fn unknown_command_types_are_fatal() {
        let err = Command::parse(json!({"type": "shuffle"})).unwrap_err();
        assert!(err.is_fatal());

        let err = Command::parse(json!({"key": "al1"})).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_known_commands_are_not_fatal() {
        let err = Command::parse(json!({"type": "playSource"})).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("malformed playSource command"));
    }
}
