use crate::shared::{ErrorType, LinkError, LinkResult, MacAddr};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fmt;
use std::io::Cursor;
use uuid::Uuid;

/// EtherType claimed by LinkChat traffic. Everything else on the wire is
/// ignored.
pub const ETHERTYPE: u16 = 0x1234;

pub const VERSION: u8 = 1;

/// version(1) + kind(1) + channel(1) + seq(4) + id(16) + payload_len(2)
pub const HEADER_SIZE: usize = 25;

/// dest(6) + src(6) + ethertype(2)
pub const ETHERNET_HEADER_SIZE: usize = 14;

/// Payload length is carried in a u16.
pub const MAX_PAYLOAD_SIZE: usize = 0xFFFF;

/// Largest raw frame the receive paths must accommodate.
pub const MAX_FRAME_SIZE: usize = ETHERNET_HEADER_SIZE + HEADER_SIZE + MAX_PAYLOAD_SIZE;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Kind {
    Msg = 0x01,
    FileStart = 0x02,
    FileChunk = 0x03,
    FileEnd = 0x04,
    Ack = 0x05,
    Discover = 0x06,
    DiscoverResp = 0x07,
}

impl Kind {
    #[inline]
    pub fn from_u8(raw: u8) -> Option<Kind> {
        match raw {
            0x01 => Some(Kind::Msg),
            0x02 => Some(Kind::FileStart),
            0x03 => Some(Kind::FileChunk),
            0x04 => Some(Kind::FileEnd),
            0x05 => Some(Kind::Ack),
            0x06 => Some(Kind::Discover),
            0x07 => Some(Kind::DiscoverResp),
            _ => None,
        }
    }
}

impl From<Kind> for u8 {
    #[inline]
    fn from(kind: Kind) -> Self {
        kind as u8
    }
}

/// In-band demultiplexer byte. Independent handlers coexist on the single
/// EtherType by claiming a channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Channel {
    Chat = 0x01,
    File = 0x02,
    Discovery = 0x03,
}

impl From<Channel> for u8 {
    #[inline]
    fn from(channel: Channel) -> Self {
        channel as u8
    }
}

const TRANSFER_ID_SIZE: usize = 16;

/// Random 128-bit identifier tying together the START, CHUNKs, END and ACKs
/// of one transfer. The nil id is carried by frames with no transfer context.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct TransferId([u8; TRANSFER_ID_SIZE]);

impl TransferId {
    pub const NIL: TransferId = TransferId([0; TRANSFER_ID_SIZE]);

    #[inline]
    pub fn random() -> TransferId {
        TransferId(*Uuid::new_v4().as_bytes())
    }

    pub fn from_slice(raw: &[u8]) -> LinkResult<TransferId> {
        if raw.len() != TRANSFER_ID_SIZE {
            return Err(LinkError::Fatal(ErrorType::InvalidTransferId));
        }

        let mut id = [0u8; TRANSFER_ID_SIZE];
        id.copy_from_slice(raw);
        Ok(TransferId(id))
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; TRANSFER_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in self.0.iter() {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// A decoded application frame. The payload borrows from the receive buffer;
/// handlers copy out whatever they keep.
#[derive(Debug, Eq, PartialEq)]
pub struct Packet<'a> {
    pub kind: Kind,
    pub channel: u8,
    pub seq: u32,
    pub id: TransferId,
    pub payload: &'a [u8],
}

/// Builds the 25-byte application header followed by the payload.
pub fn encode_app(
    kind: Kind,
    channel: Channel,
    seq: u32,
    id: &TransferId,
    payload: &[u8],
) -> LinkResult<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(LinkError::Fatal(ErrorType::PayloadTooLarge));
    }

    let mut data = Vec::with_capacity(HEADER_SIZE + payload.len());

    data.write_u8(VERSION)?;
    data.write_u8(kind.into())?;
    data.write_u8(channel.into())?;
    data.write_u32::<BigEndian>(seq)?;
    data.extend_from_slice(id.as_bytes());
    data.write_u16::<BigEndian>(payload.len() as u16)?;
    data.extend_from_slice(payload);

    Ok(data)
}

/// Parses an application frame. Trailing bytes past `payload_len` are
/// ignored since short Ethernet frames get padded to the minimum size.
pub fn decode_app(data: &[u8]) -> LinkResult<Packet> {
    if data.len() < HEADER_SIZE {
        return Err(LinkError::Fatal(ErrorType::MalformedHeader));
    }

    let mut stream = Cursor::new(data);

    let version = stream.read_u8()?;
    if version != VERSION {
        return Err(LinkError::Fatal(ErrorType::VersionMismatch));
    }

    let kind = Kind::from_u8(stream.read_u8()?)
        .ok_or(LinkError::Fatal(ErrorType::MalformedHeader))?;
    let channel = stream.read_u8()?;
    let seq = stream.read_u32::<BigEndian>()?;
    let id = TransferId::from_slice(&data[7..23])
        .map_err(|_| LinkError::Fatal(ErrorType::MalformedHeader))?;

    let mut stream = Cursor::new(&data[23..]);
    let payload_len = stream.read_u16::<BigEndian>()? as usize;

    if HEADER_SIZE + payload_len > data.len() {
        return Err(LinkError::Fatal(ErrorType::MalformedHeader));
    }

    Ok(Packet {
        kind,
        channel,
        seq,
        id,
        payload: &data[HEADER_SIZE..HEADER_SIZE + payload_len],
    })
}

/// A parsed Ethernet frame. The payload borrows from the receive buffer.
#[derive(Debug, Eq, PartialEq)]
pub struct EtherFrame<'a> {
    pub dest: MacAddr,
    pub src: MacAddr,
    pub ethertype: u16,
    pub payload: &'a [u8],
}

/// Assembles a complete Ethernet frame around the payload.
pub fn encode_frame(dest: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_SIZE + payload.len());

    frame.extend_from_slice(dest.octets());
    frame.extend_from_slice(src.octets());
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);

    frame
}

/// Splits a raw frame into its Ethernet header fields. Short frames yield
/// `None` and must be discarded by the caller.
pub fn decode_frame(raw: &[u8]) -> Option<EtherFrame> {
    if raw.len() < ETHERNET_HEADER_SIZE {
        return None;
    }

    Some(EtherFrame {
        dest: MacAddr::from_slice(&raw[0..6]),
        src: MacAddr::from_slice(&raw[6..12]),
        ethertype: u16::from_be_bytes([raw[12], raw[13]]),
        payload: &raw[ETHERNET_HEADER_SIZE..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let id = TransferId::from_slice(&[7u8; 16]).unwrap();
        let data = encode_app(Kind::FileChunk, Channel::File, 0x01020304, &id, b"abc").unwrap();

        assert_eq!(data.len(), HEADER_SIZE + 3);
        assert_eq!(data[0], 1);
        assert_eq!(data[1], 0x03);
        assert_eq!(data[2], 0x02);
        assert_eq!(&data[3..7], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&data[7..23], &[7u8; 16]);
        assert_eq!(&data[23..25], &[0x00, 0x03]);
        assert_eq!(&data[25..], b"abc");
    }

    #[test]
    fn test_app_roundtrip() {
        let id = TransferId::random();
        let payload = vec![0xabu8; 1200];
        let data = encode_app(Kind::Msg, Channel::Chat, 42, &id, &payload).unwrap();

        let packet = decode_app(&data).unwrap();

        assert_eq!(packet.kind, Kind::Msg);
        assert_eq!(packet.channel, u8::from(Channel::Chat));
        assert_eq!(packet.seq, 42);
        assert_eq!(packet.id, id);
        assert_eq!(packet.payload, &payload[..]);
    }

    #[test]
    fn test_decode_err_short() {
        for len in 0..HEADER_SIZE {
            let buf = vec![1u8; len];
            let result = decode_app(&buf);

            assert_eq!(
                result.unwrap_err(),
                LinkError::Fatal(ErrorType::MalformedHeader),
                "len {} must be rejected",
                len
            );
        }
    }

    #[test]
    fn test_decode_err_version() {
        let id = TransferId::NIL;
        let mut data = encode_app(Kind::Msg, Channel::Chat, 0, &id, b"x").unwrap();
        data[0] = 2;

        let result = decode_app(&data);

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::VersionMismatch));
    }

    #[test]
    fn test_decode_err_kind() {
        let id = TransferId::NIL;
        let mut data = encode_app(Kind::Msg, Channel::Chat, 0, &id, b"x").unwrap();
        data[1] = 0x7f;

        let result = decode_app(&data);

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::MalformedHeader));
    }

    #[test]
    fn test_decode_err_truncated_payload() {
        let id = TransferId::NIL;
        let mut data = encode_app(Kind::Msg, Channel::Chat, 0, &id, b"hello").unwrap();
        data.truncate(HEADER_SIZE + 2);

        let result = decode_app(&data);

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::MalformedHeader));
    }

    #[test]
    fn test_decode_ignores_padding() {
        let id = TransferId::NIL;
        let mut data = encode_app(Kind::Msg, Channel::Chat, 0, &id, b"hi").unwrap();
        // Minimum sized Ethernet frames arrive padded with zeros.
        data.resize(60, 0);

        let packet = decode_app(&data).unwrap();

        assert_eq!(packet.payload, b"hi");
    }

    #[test]
    fn test_encode_err_payload_too_large() {
        let id = TransferId::NIL;
        let payload = vec![0u8; MAX_PAYLOAD_SIZE + 1];

        let result = encode_app(Kind::FileChunk, Channel::File, 1, &id, &payload);

        assert_eq!(result.unwrap_err(), LinkError::Fatal(ErrorType::PayloadTooLarge));
    }

    #[test]
    fn test_transfer_id_err_size() {
        let result = TransferId::from_slice(&[1u8; 15]);

        assert_eq!(
            result.unwrap_err(),
            LinkError::Fatal(ErrorType::InvalidTransferId)
        );
    }

    #[test]
    fn test_message_wire_bytes() {
        let src: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let app = encode_app(Kind::Msg, Channel::Chat, 0, &TransferId::NIL, b"hello").unwrap();
        let frame = encode_frame(MacAddr::BROADCAST, src, ETHERTYPE, &app);

        let mut expected = vec![0xffu8; 6];
        expected.extend_from_slice(&[0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        expected.extend_from_slice(&[0x12, 0x34]);
        expected.extend_from_slice(&[0x01, 0x01, 0x01, 0x00, 0x00, 0x00, 0x00]);
        expected.extend_from_slice(&[0x00; 16]);
        expected.extend_from_slice(&[0x00, 0x05]);
        expected.extend_from_slice(b"hello");

        assert_eq!(frame, expected);
    }

    #[test]
    fn test_ether_frame_roundtrip() {
        let dest: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let src: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let raw = encode_frame(dest, src, ETHERTYPE, b"payload");

        let frame = decode_frame(&raw).unwrap();

        assert_eq!(frame.dest, dest);
        assert_eq!(frame.src, src);
        assert_eq!(frame.ethertype, ETHERTYPE);
        assert_eq!(frame.payload, b"payload");
    }

    #[test]
    fn test_ether_frame_short() {
        assert!(decode_frame(&[0u8; 13]).is_none());
    }
}
