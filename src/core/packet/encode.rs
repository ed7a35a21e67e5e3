use std::convert::TryFrom;

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{CodecError, Packet, QoS, MAX_REMAINING_LENGTH};

/// Encodes `packet` and writes it to `writer` in one `write_all`, then flushes.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(64);
    packet.encode(&mut buf)?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

impl Packet {
    /// Appends the wire form of this packet to `out`.
    pub fn encode(&self, out: &mut BytesMut) -> Result<(), CodecError> {
        let mut body = BytesMut::new();
        let flags = self.encode_body(&mut body)?;

        if body.len() > MAX_REMAINING_LENGTH {
            return Err(CodecError::PacketTooLarge(body.len()));
        }

        out.reserve(1 + 4 + body.len());
        out.put_u8(u8::from(self.packet_type()) << 4 | flags);
        put_remaining_length(out, body.len());
        out.extend_from_slice(&body);
        Ok(())
    }

    /// Writes the variable header and payload, returning the fixed-header flags.
    fn encode_body(&self, body: &mut BytesMut) -> Result<u8, CodecError> {
        match self {
            Packet::Connect(connect) => {
                put_string(body, &connect.protocol_name)?;
                body.put_u8(connect.protocol_level);

                let mut flags = 0u8;
                if connect.clean_session {
                    flags |= 0x02;
                }
                if let Some(will) = &connect.will {
                    flags |= 0x04 | u8::from(will.qos) << 3;
                    if will.retain {
                        flags |= 0x20;
                    }
                }
                if connect.password.is_some() {
                    flags |= 0x40;
                }
                if connect.username.is_some() {
                    flags |= 0x80;
                }
                body.put_u8(flags);
                body.put_u16(connect.keep_alive);

                put_string(body, &connect.client_id)?;
                if let Some(will) = &connect.will {
                    put_string(body, &will.topic)?;
                    put_binary(body, &will.payload)?;
                }
                if let Some(username) = &connect.username {
                    put_string(body, username)?;
                }
                if let Some(password) = &connect.password {
                    put_binary(body, password)?;
                }
                Ok(0)
            }
            Packet::Connack(connack) => {
                body.put_u8(u8::from(connack.session_present));
                body.put_u8(connack.code.into());
                Ok(0)
            }
            Packet::Publish(publish) => {
                put_string(body, &publish.topic)?;
                if publish.qos != QoS::AtMostOnce {
                    let id = publish
                        .packet_id
                        .ok_or(CodecError::Malformed("QoS > 0 PUBLISH without packet id"))?;
                    body.put_u16(id);
                }
                body.extend_from_slice(&publish.payload);

                let mut flags = u8::from(publish.qos) << 1;
                if publish.dup {
                    flags |= 0x08;
                }
                if publish.retain {
                    flags |= 0x01;
                }
                Ok(flags)
            }
            Packet::Puback(id) | Packet::Pubrec(id) | Packet::Pubcomp(id) | Packet::Unsuback(id) => {
                body.put_u16(*id);
                Ok(0)
            }
            Packet::Pubrel(id) => {
                body.put_u16(*id);
                Ok(0b0010)
            }
            Packet::Subscribe(subscribe) => {
                body.put_u16(subscribe.packet_id);
                for (filter, qos) in &subscribe.filters {
                    put_string(body, filter)?;
                    body.put_u8((*qos).into());
                }
                Ok(0b0010)
            }
            Packet::Suback(suback) => {
                body.put_u16(suback.packet_id);
                for code in &suback.codes {
                    body.put_u8((*code).into());
                }
                Ok(0)
            }
            Packet::Unsubscribe(unsubscribe) => {
                body.put_u16(unsubscribe.packet_id);
                for filter in &unsubscribe.filters {
                    put_string(body, filter)?;
                }
                Ok(0b0010)
            }
            Packet::Pingreq | Packet::Pingresp | Packet::Disconnect => Ok(0),
        }
    }
}

fn put_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut digit = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            digit |= 0x80;
        }
        out.put_u8(digit);
        if len == 0 {
            break;
        }
    }
}

fn put_binary(out: &mut BytesMut, field: &[u8]) -> Result<(), CodecError> {
    let len = u16::try_from(field.len()).map_err(|_| CodecError::FieldTooLong(field.len()))?;
    out.put_u16(len);
    out.put_slice(field);
    Ok(())
}

fn put_string(out: &mut BytesMut, field: &str) -> Result<(), CodecError> {
    put_binary(out, field.as_bytes())
}
