//! MQTT control packets.
//!
//! The broker speaks MQTT 3.1 (`MQIsdp`, level 3) and 3.1.1 (`MQTT`, level 4).
//! Every packet kind is a variant of the closed [`Packet`] enum, so the session
//! state machine gets exhaustiveness checking whenever a kind is added.
//!
//! - `decode`: async `read_packet` plus the body parser.
//! - `encode`: `Packet::encode` and async `write_packet`.

mod decode;
mod encode;

use std::convert::TryFrom;
use std::fmt;

use bytes::Bytes;
use thiserror::Error;

pub use decode::{decode_packet, read_packet};
pub use encode::write_packet;

/// Largest value the four-byte remaining-length varint can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

pub const PROTOCOL_NAME_V31: &str = "MQIsdp";
pub const PROTOCOL_LEVEL_V31: u8 = 3;
pub const PROTOCOL_NAME_V311: &str = "MQTT";
pub const PROTOCOL_LEVEL_V311: u8 = 4;

/// MQTT 3.1 caps client identifiers at 23 bytes.
const V31_MAX_CLIENT_ID_LEN: usize = 23;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl From<QoS> for u8 {
    fn from(q: QoS) -> Self {
        q as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQoS(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Connect = 1,
    Connack = 2,
    Publish = 3,
    Puback = 4,
    Pubrec = 5,
    Pubrel = 6,
    Pubcomp = 7,
    Subscribe = 8,
    Suback = 9,
    Unsubscribe = 10,
    Unsuback = 11,
    Pingreq = 12,
    Pingresp = 13,
    Disconnect = 14,
}

impl From<PacketType> for u8 {
    fn from(t: PacketType) -> Self {
        t as u8
    }
}

impl TryFrom<u8> for PacketType {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::Connack),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::Puback),
            5 => Ok(PacketType::Pubrec),
            6 => Ok(PacketType::Pubrel),
            7 => Ok(PacketType::Pubcomp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::Suback),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::Unsuback),
            12 => Ok(PacketType::Pingreq),
            13 => Ok(PacketType::Pingresp),
            14 => Ok(PacketType::Disconnect),
            other => Err(CodecError::UnknownPacketType(other)),
        }
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PacketType::Connect => "CONNECT",
            PacketType::Connack => "CONNACK",
            PacketType::Publish => "PUBLISH",
            PacketType::Puback => "PUBACK",
            PacketType::Pubrec => "PUBREC",
            PacketType::Pubrel => "PUBREL",
            PacketType::Pubcomp => "PUBCOMP",
            PacketType::Subscribe => "SUBSCRIBE",
            PacketType::Suback => "SUBACK",
            PacketType::Unsubscribe => "UNSUBSCRIBE",
            PacketType::Unsuback => "UNSUBACK",
            PacketType::Pingreq => "PINGREQ",
            PacketType::Pingresp => "PINGRESP",
            PacketType::Disconnect => "DISCONNECT",
        };
        f.write_str(name)
    }
}

/// Handshake verdict carried by CONNACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    BadProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadCredentials = 4,
    NotAuthorized = 5,
}

impl From<ConnectReturnCode> for u8 {
    fn from(c: ConnectReturnCode) -> Self {
        c as u8
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = CodecError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::BadProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadCredentials),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            _ => Err(CodecError::Malformed("unknown CONNACK return code")),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ConnectReturnCode::Accepted => "Connection Accepted",
            ConnectReturnCode::BadProtocolVersion => "Connection Refused: Bad Protocol Version",
            ConnectReturnCode::IdentifierRejected => {
                "Connection Refused: Client Identifier Rejected"
            }
            ConnectReturnCode::ServerUnavailable => "Connection Refused: Server Unavailable",
            ConnectReturnCode::BadCredentials => {
                "Connection Refused: Username or Password in unknown format"
            }
            ConnectReturnCode::NotAuthorized => "Connection Refused: Not Authorised",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("malformed remaining length")]
    MalformedRemainingLength,

    #[error("packet too large: {0} bytes")]
    PacketTooLarge(usize),

    #[error("invalid fixed header flags {flags:#06b} for {packet_type}")]
    InvalidFlags { packet_type: PacketType, flags: u8 },

    #[error("invalid QoS level: {0}")]
    InvalidQoS(u8),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("string field is not valid UTF-8")]
    InvalidUtf8,

    #[error("field too long to encode: {0} bytes")]
    FieldTooLong(usize),
}

impl CodecError {
    /// True when the peer closed the stream cleanly between packets.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Message registered at handshake and published on ungraceful disconnect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn into_publish(self) -> Publish {
        Publish {
            dup: false,
            qos: self.qos,
            retain: self.retain,
            topic: self.topic,
            packet_id: None,
            payload: self.payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub clean_session: bool,
    pub keep_alive: u16,
    pub client_id: String,
    pub will: Option<LastWill>,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// A 3.1.1 CONNECT with clean session and no will or credentials.
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME_V311.to_string(),
            protocol_level: PROTOCOL_LEVEL_V311,
            clean_session: true,
            keep_alive,
            client_id: client_id.into(),
            will: None,
            username: None,
            password: None,
        }
    }

    /// Protocol-level checks that do not involve credentials.
    pub fn validate(&self) -> ConnectReturnCode {
        match (self.protocol_name.as_str(), self.protocol_level) {
            (PROTOCOL_NAME_V311, PROTOCOL_LEVEL_V311) => {
                if self.client_id.is_empty() && !self.clean_session {
                    return ConnectReturnCode::IdentifierRejected;
                }
            }
            (PROTOCOL_NAME_V31, PROTOCOL_LEVEL_V31) => {
                if self.client_id.is_empty() || self.client_id.len() > V31_MAX_CLIENT_ID_LEN {
                    return ConnectReturnCode::IdentifierRejected;
                }
            }
            _ => return ConnectReturnCode::BadProtocolVersion,
        }
        ConnectReturnCode::Accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connack {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
    pub topic: String,
    /// Present iff `qos` is above [`QoS::AtMostOnce`].
    pub packet_id: Option<u16>,
    pub payload: Bytes,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS) -> Self {
        Self {
            dup: false,
            qos,
            retain: false,
            topic: topic.into(),
            packet_id: None,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub packet_id: u16,
    pub filters: Vec<(String, QoS)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubackCode {
    Granted(QoS),
    Failure,
}

impl From<SubackCode> for u8 {
    fn from(code: SubackCode) -> Self {
        match code {
            SubackCode::Granted(qos) => qos.into(),
            SubackCode::Failure => 0x80,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Suback {
    pub packet_id: u16,
    pub codes: Vec<SubackCode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub packet_id: u16,
    pub filters: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    Connack(Connack),
    Publish(Publish),
    Puback(u16),
    Pubrec(u16),
    Pubrel(u16),
    Pubcomp(u16),
    Subscribe(Subscribe),
    Suback(Suback),
    Unsubscribe(Unsubscribe),
    Unsuback(u16),
    Pingreq,
    Pingresp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::Connack(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::Puback(_) => PacketType::Puback,
            Packet::Pubrec(_) => PacketType::Pubrec,
            Packet::Pubrel(_) => PacketType::Pubrel,
            Packet::Pubcomp(_) => PacketType::Pubcomp,
            Packet::Subscribe(_) => PacketType::Subscribe,
            Packet::Suback(_) => PacketType::Suback,
            Packet::Unsubscribe(_) => PacketType::Unsubscribe,
            Packet::Unsuback(_) => PacketType::Unsuback,
            Packet::Pingreq => PacketType::Pingreq,
            Packet::Pingresp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_accepts_both_protocol_revisions() {
        let v311 = Connect::new("client-1", 30);
        assert_eq!(v311.validate(), ConnectReturnCode::Accepted);

        let mut v31 = Connect::new("client-1", 30);
        v31.protocol_name = PROTOCOL_NAME_V31.to_string();
        v31.protocol_level = PROTOCOL_LEVEL_V31;
        assert_eq!(v31.validate(), ConnectReturnCode::Accepted);
    }

    #[test]
    fn validate_rejects_unknown_protocol_level() {
        let mut c = Connect::new("client-1", 0);
        c.protocol_level = 5;
        assert_eq!(c.validate(), ConnectReturnCode::BadProtocolVersion);
    }

    #[test]
    fn validate_rejects_empty_id_without_clean_session() {
        let mut c = Connect::new("", 0);
        assert_eq!(c.validate(), ConnectReturnCode::Accepted);
        c.clean_session = false;
        assert_eq!(c.validate(), ConnectReturnCode::IdentifierRejected);
    }

    #[test]
    fn validate_enforces_v31_client_id_length() {
        let mut c = Connect::new("x".repeat(24), 0);
        c.protocol_name = PROTOCOL_NAME_V31.to_string();
        c.protocol_level = PROTOCOL_LEVEL_V31;
        assert_eq!(c.validate(), ConnectReturnCode::IdentifierRejected);
    }

    #[test]
    fn qos_orders_by_level() {
        assert_eq!(QoS::ExactlyOnce.min(QoS::AtLeastOnce), QoS::AtLeastOnce);
        assert!(QoS::try_from(3).is_err());
    }
}
