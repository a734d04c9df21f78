//! MQTT 3.1.1 wire codec: just the packets a mock broker needs.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    Connect {
        client_id: String,
        username: Option<String>,
        password: Option<String>,
        clean_session: bool,
        keep_alive: u16,
    },
    ConnAck {
        session_present: bool,
        code: u8,
    },
    Publish {
        topic: String,
        payload: Bytes,
        qos: u8,
        retain: bool,
        dup: bool,
        packet_id: Option<u16>,
    },
    PubAck(u16),
    PubRec(u16),
    PubRel(u16),
    PubComp(u16),
    Subscribe {
        packet_id: u16,
        filters: Vec<(String, u8)>,
    },
    SubAck {
        packet_id: u16,
        codes: Vec<u8>,
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<String>,
    },
    UnsubAck(u16),
    PingReq,
    PingResp,
    Disconnect,
}

// CONNACK return codes.
pub const CONNACK_ACCEPTED: u8 = 0x00;
pub const CONNACK_BAD_CREDENTIALS: u8 = 0x04;
pub const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

/// SUBACK failure code.
pub const SUBACK_FAILURE: u8 = 0x80;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}

/// Read one packet. `Ok(None)` means the peer closed the stream cleanly.
pub async fn read_packet<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Packet>, CodecError> {
    let mut first = [0u8; 1];
    match r.read(&mut first).await {
        Ok(0) => return Ok(None),
        Ok(_) => {}
        Err(e) => return Err(e.into()),
    }
    let packet_type = first[0] >> 4;
    let flags = first[0] & 0x0F;

    let remaining = read_remaining_length(r).await?;
    let mut body = vec![0u8; remaining];
    r.read_exact(&mut body).await?;
    let mut buf = Cursor::new(body);

    let packet = match packet_type {
        1 => parse_connect(&mut buf)?,
        3 => parse_publish(&mut buf, flags)?,
        4 => Packet::PubAck(buf.read_u16()?),
        5 => Packet::PubRec(buf.read_u16()?),
        6 => Packet::PubRel(buf.read_u16()?),
        7 => Packet::PubComp(buf.read_u16()?),
        8 => parse_subscribe(&mut buf)?,
        10 => parse_unsubscribe(&mut buf)?,
        12 => Packet::PingReq,
        14 => Packet::Disconnect,
        _ => return Err(CodecError::Malformed("unsupported packet type")),
    };
    Ok(Some(packet))
}

async fn read_remaining_length<R: AsyncRead + Unpin>(r: &mut R) -> Result<usize, CodecError> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    for _ in 0..4 {
        let mut byte = [0u8; 1];
        r.read_exact(&mut byte).await?;
        value += (byte[0] & 0x7F) as usize * multiplier;
        if byte[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 128;
    }
    Err(CodecError::Malformed("remaining length overflow"))
}

struct Cursor {
    data: Vec<u8>,
    pos: usize,
}

impl Cursor {
    fn new(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        if self.remaining() < 1 {
            return Err(CodecError::Malformed("short read"));
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        if self.remaining() < 2 {
            return Err(CodecError::Malformed("short read"));
        }
        let v = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    fn read_bytes(&mut self, len: usize) -> Result<&[u8], CodecError> {
        if self.remaining() < len {
            return Err(CodecError::Malformed("short read"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CodecError::Malformed("invalid utf8"))
    }

    fn rest(&mut self) -> Bytes {
        let out = Bytes::copy_from_slice(&self.data[self.pos..]);
        self.pos = self.data.len();
        out
    }
}

fn parse_connect(buf: &mut Cursor) -> Result<Packet, CodecError> {
    let protocol = buf.read_string()?;
    if protocol != "MQTT" && protocol != "MQIsdp" {
        return Err(CodecError::Malformed("unknown protocol name"));
    }
    let _level = buf.read_u8()?;
    let connect_flags = buf.read_u8()?;
    let keep_alive = buf.read_u16()?;

    let client_id = buf.read_string()?;

    // Will topic/message are parsed past but a mock broker does not act on
    // them.
    if connect_flags & 0x04 != 0 {
        let _will_topic = buf.read_string()?;
        let len = buf.read_u16()? as usize;
        let _ = buf.read_bytes(len)?;
    }
    let username = if connect_flags & 0x80 != 0 {
        Some(buf.read_string()?)
    } else {
        None
    };
    let password = if connect_flags & 0x40 != 0 {
        let len = buf.read_u16()? as usize;
        Some(String::from_utf8_lossy(buf.read_bytes(len)?).to_string())
    } else {
        None
    };

    Ok(Packet::Connect {
        client_id,
        username,
        password,
        clean_session: connect_flags & 0x02 != 0,
        keep_alive,
    })
}

fn parse_publish(buf: &mut Cursor, flags: u8) -> Result<Packet, CodecError> {
    let retain = flags & 0x01 != 0;
    let qos = (flags >> 1) & 0x03;
    let dup = flags & 0x08 != 0;
    if qos > 2 {
        return Err(CodecError::Malformed("invalid QoS"));
    }

    let topic = buf.read_string()?;
    let packet_id = if qos > 0 { Some(buf.read_u16()?) } else { None };
    let payload = buf.rest();

    Ok(Packet::Publish {
        topic,
        payload,
        qos,
        retain,
        dup,
        packet_id,
    })
}

fn parse_subscribe(buf: &mut Cursor) -> Result<Packet, CodecError> {
    let packet_id = buf.read_u16()?;
    let mut filters = Vec::new();
    while buf.remaining() > 0 {
        let filter = buf.read_string()?;
        let qos = buf.read_u8()? & 0x03;
        filters.push((filter, qos));
    }
    if filters.is_empty() {
        return Err(CodecError::Malformed("subscribe without filters"));
    }
    Ok(Packet::Subscribe { packet_id, filters })
}

fn parse_unsubscribe(buf: &mut Cursor) -> Result<Packet, CodecError> {
    let packet_id = buf.read_u16()?;
    let mut filters = Vec::new();
    while buf.remaining() > 0 {
        filters.push(buf.read_string()?);
    }
    Ok(Packet::Unsubscribe { packet_id, filters })
}

/// Write one packet.
pub async fn write_packet<W: AsyncWrite + Unpin>(
    w: &mut W,
    packet: &Packet,
) -> Result<(), CodecError> {
    let (first, body) = encode(packet)?;
    let mut out = BytesMut::with_capacity(body.len() + 5);
    out.put_u8(first);
    encode_remaining_length(&mut out, body.len());
    out.put_slice(&body);
    w.write_all(&out).await?;
    w.flush().await?;
    Ok(())
}

fn encode_remaining_length(out: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        out.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

fn put_string(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

fn encode(packet: &Packet) -> Result<(u8, BytesMut), CodecError> {
    let mut body = BytesMut::new();
    let first = match packet {
        Packet::ConnAck {
            session_present,
            code,
        } => {
            body.put_u8(u8::from(*session_present));
            body.put_u8(*code);
            0x20
        }
        Packet::Publish {
            topic,
            payload,
            qos,
            retain,
            dup,
            packet_id,
        } => {
            put_string(&mut body, topic);
            if *qos > 0 {
                body.put_u16(packet_id.unwrap_or(1));
            }
            body.put_slice(payload);
            0x30 | (u8::from(*dup) << 3) | (qos << 1) | u8::from(*retain)
        }
        Packet::PubAck(id) => {
            body.put_u16(*id);
            0x40
        }
        Packet::PubRec(id) => {
            body.put_u16(*id);
            0x50
        }
        Packet::PubRel(id) => {
            body.put_u16(*id);
            0x62
        }
        Packet::PubComp(id) => {
            body.put_u16(*id);
            0x70
        }
        Packet::SubAck { packet_id, codes } => {
            body.put_u16(*packet_id);
            for code in codes {
                body.put_u8(*code);
            }
            0x90
        }
        Packet::UnsubAck(id) => {
            body.put_u16(*id);
            0xB0
        }
        Packet::PingReq => 0xC0,
        Packet::PingResp => 0xD0,
        Packet::Disconnect => 0xE0,
        Packet::Connect { .. } | Packet::Subscribe { .. } | Packet::Unsubscribe { .. } => {
            // The broker never sends client-side packets.
            return Err(CodecError::Malformed("server cannot send this packet"));
        }
    };
    Ok((first, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn round_trip_publish(packet: Packet) -> Packet {
        let mut buf = Vec::new();
        write_packet(&mut buf, &packet).await.unwrap();
        let mut reader = std::io::Cursor::new(buf);
        read_packet(&mut reader).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn publish_round_trips() {
        let packet = Packet::Publish {
            topic: "devices/status".into(),
            payload: Bytes::from_static(b"online"),
            qos: 1,
            retain: true,
            dup: false,
            packet_id: Some(7),
        };
        assert_eq!(round_trip_publish(packet.clone()).await, packet);
    }

    #[tokio::test]
    async fn qos0_publish_has_no_packet_id() {
        let packet = Packet::Publish {
            topic: "t".into(),
            payload: Bytes::from_static(b"x"),
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        };
        assert_eq!(round_trip_publish(packet.clone()).await, packet);
    }

    #[tokio::test]
    async fn connect_parses() {
        // CONNECT with MQTT 3.1.1, clean session, client id "c1",
        // username "u" and password "p".
        let mut body = BytesMut::new();
        put_string(&mut body, "MQTT");
        body.put_u8(4);
        body.put_u8(0x02 | 0x80 | 0x40); // clean session + username + password
        body.put_u16(60);
        put_string(&mut body, "c1");
        put_string(&mut body, "u");
        put_string(&mut body, "p");

        let mut wire = BytesMut::new();
        wire.put_u8(0x10);
        encode_remaining_length(&mut wire, body.len());
        wire.put_slice(&body);

        let mut reader = std::io::Cursor::new(wire.to_vec());
        let packet = read_packet(&mut reader).await.unwrap().unwrap();
        match packet {
            Packet::Connect {
                client_id,
                username,
                password,
                clean_session,
                keep_alive,
            } => {
                assert_eq!(client_id, "c1");
                assert_eq!(username.as_deref(), Some("u"));
                assert_eq!(password.as_deref(), Some("p"));
                assert!(clean_session);
                assert_eq!(keep_alive, 60);
            }
            other => panic!("expected connect, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn large_remaining_length_round_trips() {
        let payload = Bytes::from(vec![b'x'; 300]);
        let packet = Packet::Publish {
            topic: "big".into(),
            payload,
            qos: 0,
            retain: false,
            dup: false,
            packet_id: None,
        };
        assert_eq!(round_trip_publish(packet.clone()).await, packet);
    }

    #[tokio::test]
    async fn eof_reads_as_none() {
        let mut reader = std::io::Cursor::new(Vec::new());
        assert!(read_packet(&mut reader).await.unwrap().is_none());
    }
}
