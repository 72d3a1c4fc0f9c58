use crate::error::MqttError;
use std::fmt;

/// Protocol name sent in every CONNECT (MQTT 3.1).
pub const PROTOCOL_NAME: &str = "MQIsdp";
/// Protocol level sent in every CONNECT (MQTT 3.1).
pub const PROTOCOL_VERSION: u8 = 3;

/// MQTT control packet types. Only CONNECT, CONNACK, PUBLISH, PINGREQ,
/// PINGRESP and DISCONNECT are encoded or decoded; the rest are reserved.
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

impl PacketType {
    /// Maps the high nibble of a fixed header byte to a packet type.
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        let packet_type = match nibble {
            1 => PacketType::Connect,
            2 => PacketType::Connack,
            3 => PacketType::Publish,
            4 => PacketType::Puback,
            5 => PacketType::Pubrec,
            6 => PacketType::Pubrel,
            7 => PacketType::Pubcomp,
            8 => PacketType::Subscribe,
            9 => PacketType::Suback,
            10 => PacketType::Unsubscribe,
            11 => PacketType::Unsuback,
            12 => PacketType::Pingreq,
            13 => PacketType::Pingresp,
            14 => PacketType::Disconnect,
            _ => return None,
        };
        Some(packet_type)
    }

    pub fn is_supported(self) -> bool {
        matches!(
            self,
            PacketType::Connect
                | PacketType::Connack
                | PacketType::Publish
                | PacketType::Pingreq
                | PacketType::Pingresp
                | PacketType::Disconnect
        )
    }

    /// Fails with `UnsupportedPacketType` for the reserved types.
    pub fn ensure_supported(self) -> Result<Self, MqttError> {
        if self.is_supported() {
            Ok(self)
        } else {
            Err(MqttError::UnsupportedPacketType(self))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl TryFrom<u8> for QoS {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(MqttError::InvalidQos(other)),
        }
    }
}

/// CONNACK return codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectReturnCode {
    Accepted = 0,
    UnacceptableProtocolVersion = 1,
    IdentifierRejected = 2,
    ServerUnavailable = 3,
    BadUserNameOrPassword = 4,
    NotAuthorized = 5,
}

impl ConnectReturnCode {
    pub fn code(self) -> u8 {
        self as u8
    }

    /// Human-readable reason reported for this code.
    pub fn reason(self) -> &'static str {
        match self {
            ConnectReturnCode::Accepted => "Connection Accepted",
            ConnectReturnCode::UnacceptableProtocolVersion => {
                "Connection Refused: unacceptable protocol version"
            }
            ConnectReturnCode::IdentifierRejected => "Connection Refused: identifier rejected",
            ConnectReturnCode::ServerUnavailable => "Connection Refused: server unavailable",
            ConnectReturnCode::BadUserNameOrPassword => {
                "Connection Refused: bad user name or password"
            }
            ConnectReturnCode::NotAuthorized => "Connection Refused: not authorized",
        }
    }
}

impl TryFrom<u8> for ConnectReturnCode {
    type Error = MqttError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ConnectReturnCode::Accepted),
            1 => Ok(ConnectReturnCode::UnacceptableProtocolVersion),
            2 => Ok(ConnectReturnCode::IdentifierRejected),
            3 => Ok(ConnectReturnCode::ServerUnavailable),
            4 => Ok(ConnectReturnCode::BadUserNameOrPassword),
            5 => Ok(ConnectReturnCode::NotAuthorized),
            other => Err(MqttError::UnknownReturnCode(other)),
        }
    }
}

impl fmt::Display for ConnectReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}
