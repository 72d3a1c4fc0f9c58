use crate::error::MqttError;
use crate::protocol::{ConnectReturnCode, PacketType, QoS, PROTOCOL_NAME, PROTOCOL_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Largest value the 4-digit remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;
const MAX_LENGTH_DIGITS: usize = 4;
const CONTINUATION_BIT: u8 = 0x80;
const DIGIT_MASK: u8 = 0x7F;

const DUP_FLAG: u8 = 0x08;
const QOS_MASK: u8 = 0x06;
const QOS_SHIFT: u8 = 1;
const RETAIN_FLAG: u8 = 0x01;

const USER_NAME_FLAG: u8 = 0x80;
const PASSWORD_FLAG: u8 = 0x40;
const WILL_RETAIN_FLAG: u8 = 0x20;
const WILL_QOS_MASK: u8 = 0x18;
const WILL_QOS_SHIFT: u8 = 3;
const WILL_FLAG: u8 = 0x04;
const CLEAN_SESSION_FLAG: u8 = 0x02;
const RESERVED_CONNECT_FLAG: u8 = 0x01;

const PINGREQ_FRAME: [u8; 2] = [(PacketType::Pingreq as u8) << 4, 0x00];
const DISCONNECT_FRAME: [u8; 2] = [(PacketType::Disconnect as u8) << 4, 0x00];

/// Appends `length` as a remaining-length VLQ, least significant digit first.
/// Returns the number of bytes written (1 to 4).
pub fn encode_remaining_length(mut length: usize, buf: &mut BytesMut) -> Result<usize, MqttError> {
    if length > MAX_REMAINING_LENGTH {
        return Err(MqttError::PacketTooLarge(format!(
            "remaining length {} exceeds {}",
            length, MAX_REMAINING_LENGTH
        )));
    }
    let mut written = 0;
    loop {
        let mut digit = (length % 128) as u8;
        length /= 128;
        if length > 0 {
            digit |= CONTINUATION_BIT;
        }
        buf.put_u8(digit);
        written += 1;
        if length == 0 {
            break;
        }
    }
    Ok(written)
}

/// Decodes a remaining-length VLQ from the start of `data`.
/// Returns `(length, bytes_consumed)`.
pub fn decode_remaining_length(data: &[u8]) -> Result<(usize, usize), MqttError> {
    let mut length = 0usize;
    let mut multiplier = 1usize;
    for (i, &digit) in data.iter().take(MAX_LENGTH_DIGITS).enumerate() {
        length += (digit & DIGIT_MASK) as usize * multiplier;
        if digit & CONTINUATION_BIT == 0 {
            return Ok((length, i + 1));
        }
        multiplier *= 128;
    }
    Err(MqttError::MalformedLength)
}

/// First byte of every packet: type nibble plus DUP, QoS and RETAIN bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    pub packet_type: PacketType,
    pub dup: bool,
    pub qos: QoS,
    pub retain: bool,
}

impl FixedHeader {
    pub fn new(packet_type: PacketType) -> Self {
        FixedHeader {
            packet_type,
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn to_byte(&self) -> Result<u8, MqttError> {
        let packet_type = self.packet_type.ensure_supported()?;
        let mut byte = (packet_type as u8) << 4;
        if self.dup {
            byte |= DUP_FLAG;
        }
        byte |= ((self.qos as u8) << QOS_SHIFT) & QOS_MASK;
        if self.retain {
            byte |= RETAIN_FLAG;
        }
        Ok(byte)
    }

    /// Parses a header byte. Reserved packet types parse successfully so the
    /// caller can report them as unsupported.
    pub fn from_byte(byte: u8) -> Result<Self, MqttError> {
        let packet_type = PacketType::from_nibble(byte >> 4).ok_or_else(|| {
            MqttError::MalformedResponse(format!("invalid packet type in header 0x{:02X}", byte))
        })?;
        let qos = QoS::try_from((byte & QOS_MASK) >> QOS_SHIFT)?;
        Ok(FixedHeader {
            packet_type,
            dup: byte & DUP_FLAG != 0,
            qos,
            retain: byte & RETAIN_FLAG != 0,
        })
    }
}

/// CONNECT flag byte. Will, user name and password only affect the bits;
/// their payload fields are never written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectFlags {
    pub clean_session: bool,
    pub will_flag: bool,
    /// Two-bit will QoS, 0 to 3. Higher bits are ignored.
    pub will_qos: u8,
    pub will_retain: bool,
    pub has_user_name: bool,
    pub has_password: bool,
}

impl Default for ConnectFlags {
    fn default() -> Self {
        ConnectFlags {
            clean_session: true,
            will_flag: false,
            will_qos: 0,
            will_retain: false,
            has_user_name: false,
            has_password: false,
        }
    }
}

impl ConnectFlags {
    pub fn to_byte(&self) -> u8 {
        let mut byte = 0u8;
        if self.has_user_name {
            byte |= USER_NAME_FLAG;
        }
        if self.has_password {
            byte |= PASSWORD_FLAG;
        }
        if self.will_retain {
            byte |= WILL_RETAIN_FLAG;
        }
        byte |= (self.will_qos << WILL_QOS_SHIFT) & WILL_QOS_MASK;
        if self.will_flag {
            byte |= WILL_FLAG;
        }
        if self.clean_session {
            byte |= CLEAN_SESSION_FLAG;
        }
        byte
    }

    pub fn from_byte(byte: u8) -> Result<Self, MqttError> {
        if byte & RESERVED_CONNECT_FLAG != 0 {
            return Err(MqttError::MalformedResponse(
                "reserved connect flag is set".to_string(),
            ));
        }
        Ok(ConnectFlags {
            clean_session: byte & CLEAN_SESSION_FLAG != 0,
            will_flag: byte & WILL_FLAG != 0,
            will_qos: (byte & WILL_QOS_MASK) >> WILL_QOS_SHIFT,
            will_retain: byte & WILL_RETAIN_FLAG != 0,
            has_user_name: byte & USER_NAME_FLAG != 0,
            has_password: byte & PASSWORD_FLAG != 0,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    client_id: String,
    keep_alive: u16,
    flags: ConnectFlags,
}

impl Connect {
    pub fn new(client_id: impl Into<String>, keep_alive: u16) -> Result<Self, MqttError> {
        let client_id = client_id.into();
        check_string_length("client ID", &client_id)?;
        Ok(Connect {
            client_id,
            keep_alive,
            flags: ConnectFlags::default(),
        })
    }

    pub fn with_flags(mut self, flags: ConnectFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn keep_alive(&self) -> u16 {
        self.keep_alive
    }

    pub fn flags(&self) -> ConnectFlags {
        self.flags
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_mqtt_string(buf, PROTOCOL_NAME);
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(self.flags.to_byte());
        buf.put_u16(self.keep_alive);
        put_mqtt_string(buf, &self.client_id);
    }

    fn decode_body(data: &[u8]) -> Result<Self, MqttError> {
        let mut offset = 0;
        let protocol_name = parse_mqtt_string(data, &mut offset)?;
        let version = read_u8(data, &mut offset)?;
        if protocol_name != PROTOCOL_NAME || version != PROTOCOL_VERSION {
            return Err(MqttError::MalformedResponse(format!(
                "unsupported protocol '{}' version {}",
                protocol_name, version
            )));
        }
        let flags = ConnectFlags::from_byte(read_u8(data, &mut offset)?)?;
        let keep_alive = read_u16(data, &mut offset)?;
        let client_id = parse_mqtt_string(data, &mut offset)?;
        Ok(Connect {
            client_id,
            keep_alive,
            flags,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub return_code: ConnectReturnCode,
}

impl ConnAck {
    pub fn code(&self) -> u8 {
        self.return_code.code()
    }

    pub fn reason(&self) -> &'static str {
        self.return_code.reason()
    }

    pub fn is_accepted(&self) -> bool {
        self.return_code == ConnectReturnCode::Accepted
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    topic: String,
    payload: Bytes,
    qos: QoS,
    dup: bool,
    retain: bool,
}

impl Publish {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Result<Self, MqttError> {
        let topic = topic.into();
        check_string_length("topic", &topic)?;
        Ok(Publish {
            topic,
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            dup: false,
            retain: false,
        })
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn with_dup(mut self, dup: bool) -> Self {
        self.dup = dup;
        self
    }

    pub fn with_retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn qos(&self) -> QoS {
        self.qos
    }

    pub fn dup(&self) -> bool {
        self.dup
    }

    pub fn retain(&self) -> bool {
        self.retain
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        put_mqtt_string(buf, &self.topic);
        buf.extend_from_slice(&self.payload);
    }

    fn decode_body(header: FixedHeader, data: &[u8]) -> Result<Self, MqttError> {
        let mut offset = 0;
        let topic = parse_mqtt_string(data, &mut offset)?;
        Ok(Publish {
            topic,
            payload: Bytes::copy_from_slice(&data[offset..]),
            qos: header.qos,
            dup: header.dup,
            retain: header.retain,
        })
    }
}

/// The packets this client understands, one variant per supported type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Connect(_) => PacketType::Connect,
            Packet::ConnAck(_) => PacketType::Connack,
            Packet::Publish(_) => PacketType::Publish,
            Packet::PingReq => PacketType::Pingreq,
            Packet::PingResp => PacketType::Pingresp,
            Packet::Disconnect => PacketType::Disconnect,
        }
    }

    fn fixed_header(&self) -> FixedHeader {
        let mut header = FixedHeader::new(self.packet_type());
        if let Packet::Publish(publish) = self {
            header.dup = publish.dup;
            header.qos = publish.qos;
            header.retain = publish.retain;
        }
        header
    }

    pub fn encode(&self) -> Result<Bytes, MqttError> {
        let mut body = BytesMut::new();
        match self {
            Packet::Connect(connect) => connect.encode_body(&mut body),
            Packet::ConnAck(connack) => {
                body.put_u8(0x00);
                body.put_u8(connack.code());
            }
            Packet::Publish(publish) => publish.encode_body(&mut body),
            Packet::PingReq | Packet::PingResp | Packet::Disconnect => {}
        }

        let mut buf = BytesMut::with_capacity(1 + MAX_LENGTH_DIGITS + body.len());
        buf.put_u8(self.fixed_header().to_byte()?);
        encode_remaining_length(body.len(), &mut buf)?;
        buf.extend_from_slice(&body);
        Ok(buf.freeze())
    }

    /// Decodes one complete frame (fixed header included).
    pub fn decode(frame: &[u8]) -> Result<Self, MqttError> {
        let first_byte = *frame
            .first()
            .ok_or_else(|| MqttError::MalformedResponse("empty packet".to_string()))?;
        let header = FixedHeader::from_byte(first_byte)?;
        let (remaining_length, consumed) = decode_remaining_length(&frame[1..])?;
        let body = &frame[1 + consumed..];
        if body.len() != remaining_length {
            return Err(MqttError::MalformedResponse(format!(
                "remaining length {} does not match body of {} bytes",
                remaining_length,
                body.len()
            )));
        }

        match header.packet_type {
            PacketType::Connect => Connect::decode_body(body).map(Packet::Connect),
            PacketType::Connack => decode_connack(frame).map(Packet::ConnAck),
            PacketType::Publish => Publish::decode_body(header, body).map(Packet::Publish),
            PacketType::Pingreq => expect_empty(body, PacketType::Pingreq).map(|_| Packet::PingReq),
            PacketType::Pingresp => decode_pingresp(frame).map(|_| Packet::PingResp),
            PacketType::Disconnect => {
                expect_empty(body, PacketType::Disconnect).map(|_| Packet::Disconnect)
            }
            other => Err(MqttError::UnsupportedPacketType(other)),
        }
    }
}

pub fn encode_connect(connect: &Connect) -> Result<Bytes, MqttError> {
    Packet::Connect(connect.clone()).encode()
}

pub fn encode_publish(publish: &Publish) -> Result<Bytes, MqttError> {
    Packet::Publish(publish.clone()).encode()
}

pub fn encode_pingreq() -> Bytes {
    Bytes::from_static(&PINGREQ_FRAME)
}

pub fn encode_disconnect() -> Bytes {
    Bytes::from_static(&DISCONNECT_FRAME)
}

/// Decodes a CONNACK frame: header, remaining length, reserved byte and
/// return code, exactly 4 bytes.
pub fn decode_connack(data: &[u8]) -> Result<ConnAck, MqttError> {
    if data.len() != 4 {
        return Err(MqttError::MalformedResponse(format!(
            "CONNACK must be 4 bytes, got {}",
            data.len()
        )));
    }
    expect_type(data[0], PacketType::Connack)?;
    let return_code = ConnectReturnCode::try_from(data[3])?;
    Ok(ConnAck { return_code })
}

/// Decodes a PINGRESP frame, exactly `[0xD0, 0x00]` on the wire.
pub fn decode_pingresp(data: &[u8]) -> Result<(), MqttError> {
    if data.len() != 2 {
        return Err(MqttError::MalformedResponse(format!(
            "PINGRESP must be 2 bytes, got {}",
            data.len()
        )));
    }
    expect_type(data[0], PacketType::Pingresp)?;
    if data[1] != 0 {
        return Err(MqttError::MalformedResponse(format!(
            "PINGRESP remaining length must be 0, got {}",
            data[1]
        )));
    }
    Ok(())
}

/// Reads exactly one packet from the stream, returning the whole frame.
/// Frames larger than `limit` bytes are rejected before their body is read.
pub async fn read_frame<R: AsyncRead + Unpin>(read_stream: &mut R, limit: usize) -> Result<Bytes, MqttError> {
    let first_byte = read_stream.read_u8().await?;
    let mut frame = BytesMut::with_capacity(1 + MAX_LENGTH_DIGITS);
    frame.put_u8(first_byte);

    let mut remaining_length = 0usize;
    let mut multiplier = 1usize;
    let mut terminated = false;
    for _ in 0..MAX_LENGTH_DIGITS {
        let byte = read_stream.read_u8().await?;
        frame.put_u8(byte);
        remaining_length += ((byte & DIGIT_MASK) as usize) * multiplier;
        if byte & CONTINUATION_BIT == 0 {
            terminated = true;
            break;
        }
        multiplier *= 128;
    }
    if !terminated {
        return Err(MqttError::MalformedLength);
    }

    let header_len = frame.len();
    if header_len + remaining_length > limit {
        return Err(MqttError::PacketTooLarge(format!(
            "{} byte packet exceeds receive limit of {}",
            header_len + remaining_length,
            limit
        )));
    }
    frame.resize(header_len + remaining_length, 0);
    read_stream.read_exact(&mut frame[header_len..]).await?;
    Ok(frame.freeze())
}

/// Reads a length-prefixed UTF-8 string and advances `offset` past it.
pub fn parse_mqtt_string(data: &[u8], offset: &mut usize) -> Result<String, MqttError> {
    let len = usize::from(read_u16(data, offset)?);
    let raw = take(data, offset, len)?;
    let value = std::str::from_utf8(raw).map_err(|e| {
        MqttError::MalformedResponse(format!("string field is not UTF-8: {}", e))
    })?;
    Ok(value.to_owned())
}

fn take<'a>(data: &'a [u8], offset: &mut usize, len: usize) -> Result<&'a [u8], MqttError> {
    let end = offset.checked_add(len).filter(|&end| end <= data.len());
    let slice = end.and_then(|end| data.get(*offset..end)).ok_or_else(|| {
        MqttError::MalformedResponse(format!(
            "{} byte field overruns a {} byte packet at offset {}",
            len,
            data.len(),
            offset
        ))
    })?;
    *offset += len;
    Ok(slice)
}

fn read_u8(data: &[u8], offset: &mut usize) -> Result<u8, MqttError> {
    Ok(take(data, offset, 1)?[0])
}

fn read_u16(data: &[u8], offset: &mut usize) -> Result<u16, MqttError> {
    let raw = take(data, offset, 2)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

/// Length checked by the constructors, so the prefix never truncates.
fn put_mqtt_string(buf: &mut BytesMut, value: &str) {
    buf.put_u16(value.len() as u16);
    buf.extend_from_slice(value.as_bytes());
}

pub(crate) fn check_string_length(field: &'static str, value: &str) -> Result<(), MqttError> {
    if value.len() > u16::MAX as usize {
        return Err(MqttError::StringTooLong {
            field,
            len: value.len(),
        });
    }
    Ok(())
}

fn expect_type(byte: u8, expected: PacketType) -> Result<(), MqttError> {
    if byte >> 4 != expected as u8 {
        return Err(MqttError::MalformedResponse(format!(
            "expected {:?}, got header 0x{:02X}",
            expected, byte
        )));
    }
    Ok(())
}

fn expect_empty(body: &[u8], packet_type: PacketType) -> Result<(), MqttError> {
    if !body.is_empty() {
        return Err(MqttError::MalformedResponse(format!(
            "{:?} carries {} unexpected bytes",
            packet_type,
            body.len()
        )));
    }
    Ok(())
}
