use std::convert::TryFrom;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{
    CodecError, Connack, Connect, ConnectReturnCode, LastWill, Packet, PacketType, Publish, QoS,
    Suback, SubackCode, Subscribe, Unsubscribe,
};

const CONNECT_FLAG_RESERVED: u8 = 0x01;
const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
const CONNECT_FLAG_WILL: u8 = 0x04;
const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
const CONNECT_FLAG_PASSWORD: u8 = 0x40;
const CONNECT_FLAG_USERNAME: u8 = 0x80;

/// Reads exactly one control packet from `reader`.
///
/// Bodies larger than `max_packet_size` are rejected before any allocation.
pub async fn read_packet<R>(reader: &mut R, max_packet_size: usize) -> Result<Packet, CodecError>
where
    R: AsyncRead + Unpin,
{
    let header = reader.read_u8().await?;
    let remaining = read_remaining_length(reader).await?;
    if remaining > max_packet_size {
        return Err(CodecError::PacketTooLarge(remaining));
    }

    let mut body = BytesMut::zeroed(remaining);
    reader.read_exact(&mut body).await?;
    decode_packet(header, body.freeze())
}

async fn read_remaining_length<R>(reader: &mut R) -> Result<usize, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut value = 0usize;
    for shift in [0u32, 7, 14, 21] {
        let byte = reader.read_u8().await?;
        value |= usize::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CodecError::MalformedRemainingLength)
}

/// Parses a packet body given its first fixed-header byte.
pub fn decode_packet(header: u8, mut body: Bytes) -> Result<Packet, CodecError> {
    let packet_type = PacketType::try_from(header >> 4)?;
    let flags = header & 0x0f;

    match packet_type {
        PacketType::Publish => {}
        PacketType::Pubrel | PacketType::Subscribe | PacketType::Unsubscribe => {
            expect_flags(packet_type, flags, 0b0010)?
        }
        _ => expect_flags(packet_type, flags, 0)?,
    }

    match packet_type {
        PacketType::Connect => decode_connect(body).map(Packet::Connect),
        PacketType::Connack => decode_connack(body).map(Packet::Connack),
        PacketType::Publish => decode_publish(flags, body).map(Packet::Publish),
        PacketType::Puback => packet_id_only(&mut body).map(Packet::Puback),
        PacketType::Pubrec => packet_id_only(&mut body).map(Packet::Pubrec),
        PacketType::Pubrel => packet_id_only(&mut body).map(Packet::Pubrel),
        PacketType::Pubcomp => packet_id_only(&mut body).map(Packet::Pubcomp),
        PacketType::Subscribe => decode_subscribe(body).map(Packet::Subscribe),
        PacketType::Suback => decode_suback(body).map(Packet::Suback),
        PacketType::Unsubscribe => decode_unsubscribe(body).map(Packet::Unsubscribe),
        PacketType::Unsuback => packet_id_only(&mut body).map(Packet::Unsuback),
        PacketType::Pingreq => empty(&body).map(|_| Packet::Pingreq),
        PacketType::Pingresp => empty(&body).map(|_| Packet::Pingresp),
        PacketType::Disconnect => empty(&body).map(|_| Packet::Disconnect),
    }
}

fn expect_flags(packet_type: PacketType, flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags == expected {
        Ok(())
    } else {
        Err(CodecError::InvalidFlags { packet_type, flags })
    }
}

fn empty(body: &Bytes) -> Result<(), CodecError> {
    if body.is_empty() {
        Ok(())
    } else {
        Err(CodecError::Malformed("unexpected packet body"))
    }
}

fn get_u8(buf: &mut Bytes) -> Result<u8, CodecError> {
    if buf.remaining() < 1 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> Result<u16, CodecError> {
    if buf.remaining() < 2 {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(buf.get_u16())
}

fn get_binary(buf: &mut Bytes) -> Result<Bytes, CodecError> {
    let len = usize::from(get_u16(buf)?);
    if buf.remaining() < len {
        return Err(CodecError::Malformed("truncated packet"));
    }
    Ok(buf.split_to(len))
}

fn get_string(buf: &mut Bytes) -> Result<String, CodecError> {
    let raw = get_binary(buf)?;
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError::InvalidUtf8)
}

fn packet_id_only(body: &mut Bytes) -> Result<u16, CodecError> {
    let id = get_u16(body)?;
    empty(body)?;
    Ok(id)
}

fn decode_connect(mut body: Bytes) -> Result<Connect, CodecError> {
    let protocol_name = get_string(&mut body)?;
    let protocol_level = get_u8(&mut body)?;
    let flags = get_u8(&mut body)?;
    let keep_alive = get_u16(&mut body)?;

    if flags & CONNECT_FLAG_RESERVED != 0 {
        return Err(CodecError::Malformed("reserved CONNECT flag set"));
    }

    let client_id = get_string(&mut body)?;

    let will_qos = QoS::try_from((flags >> 3) & 0x03)?;
    let will_retain = flags & CONNECT_FLAG_WILL_RETAIN != 0;
    let will = if flags & CONNECT_FLAG_WILL != 0 {
        let topic = get_string(&mut body)?;
        let payload = get_binary(&mut body)?;
        Some(LastWill {
            topic,
            payload,
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        if will_qos != QoS::AtMostOnce || will_retain {
            return Err(CodecError::Malformed("will QoS or retain set without will flag"));
        }
        None
    };

    let username = if flags & CONNECT_FLAG_USERNAME != 0 {
        Some(get_string(&mut body)?)
    } else {
        None
    };

    let password = if flags & CONNECT_FLAG_PASSWORD != 0 {
        if username.is_none() {
            return Err(CodecError::Malformed("password flag set without username"));
        }
        Some(get_binary(&mut body)?)
    } else {
        None
    };

    empty(&body)?;

    Ok(Connect {
        protocol_name,
        protocol_level,
        clean_session: flags & CONNECT_FLAG_CLEAN_SESSION != 0,
        keep_alive,
        client_id,
        will,
        username,
        password,
    })
}

fn decode_connack(mut body: Bytes) -> Result<Connack, CodecError> {
    let ack_flags = get_u8(&mut body)?;
    let code = ConnectReturnCode::try_from(get_u8(&mut body)?)?;
    empty(&body)?;
    Ok(Connack {
        session_present: ack_flags & 0x01 != 0,
        code,
    })
}

fn decode_publish(flags: u8, mut body: Bytes) -> Result<Publish, CodecError> {
    let dup = flags & 0x08 != 0;
    let qos = QoS::try_from((flags >> 1) & 0x03)?;
    let retain = flags & 0x01 != 0;

    let topic = get_string(&mut body)?;
    let packet_id = match qos {
        QoS::AtMostOnce => None,
        QoS::AtLeastOnce | QoS::ExactlyOnce => Some(get_u16(&mut body)?),
    };

    Ok(Publish {
        dup,
        qos,
        retain,
        topic,
        packet_id,
        payload: body,
    })
}

fn decode_subscribe(mut body: Bytes) -> Result<Subscribe, CodecError> {
    let packet_id = get_u16(&mut body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        let filter = get_string(&mut body)?;
        let requested = get_u8(&mut body)?;
        if requested & 0xfc != 0 {
            return Err(CodecError::Malformed("reserved SUBSCRIBE option bits set"));
        }
        filters.push((filter, QoS::try_from(requested)?));
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("SUBSCRIBE without topic filters"));
    }
    Ok(Subscribe { packet_id, filters })
}

fn decode_suback(mut body: Bytes) -> Result<Suback, CodecError> {
    let packet_id = get_u16(&mut body)?;
    let mut codes = Vec::with_capacity(body.remaining());
    while body.has_remaining() {
        let code = match body.get_u8() {
            0x80 => SubackCode::Failure,
            other => SubackCode::Granted(QoS::try_from(other)?),
        };
        codes.push(code);
    }
    Ok(Suback { packet_id, codes })
}

fn decode_unsubscribe(mut body: Bytes) -> Result<Unsubscribe, CodecError> {
    let packet_id = get_u16(&mut body)?;
    let mut filters = Vec::new();
    while body.has_remaining() {
        filters.push(get_string(&mut body)?);
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("UNSUBSCRIBE without topic filters"));
    }
    Ok(Unsubscribe { packet_id, filters })
}
