pub mod serial;

use crate::ack_bits::AckBitArray;
use crate::message::{self, Message, Registry};
use crate::Error;

/// Width of the selective acknowledgement field, in bytes.
pub const ACKED_BITS_BYTES: usize = 8;

/// Encoded size of a [`Header`], identical for every packet type.
pub const HEADER_SIZE: usize = 2 + 2 + ACKED_BITS_BYTES + 1 + 8;

/// Largest datagram the protocol will ever produce.
pub const MAX_PACKET_SIZE: usize = 1200;

/// Space remaining for message records once the header has been written.
pub const MAX_PACKET_DATA_SIZE: usize = MAX_PACKET_SIZE - HEADER_SIZE;

const ACK_FIELDS_OFFSET: usize = 2;
#[cfg(test)]
const TYPE_OFFSET: usize = 2 + 2 + ACKED_BITS_BYTES;

const PACKET_TYPE_DATA_RELIABLE: u8 = 0x00;
const PACKET_TYPE_DATA_UNRELIABLE: u8 = 0x01;
const PACKET_TYPE_CLIENT_CONNECTION_REQUEST: u8 = 0x02;
const PACKET_TYPE_CLIENT_CHALLENGE_RESPONSE: u8 = 0x03;
const PACKET_TYPE_KEEPALIVE: u8 = 0x04;
const PACKET_TYPE_DISCONNECT: u8 = 0x05;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum PacketType {
    DataReliable,
    DataUnreliable,
    ClientConnectionRequest,
    ClientChallengeResponse,
    Keepalive,
    Disconnect,
}

impl PacketType {
    pub fn to_u8(self) -> u8 {
        match self {
            Self::DataReliable => PACKET_TYPE_DATA_RELIABLE,
            Self::DataUnreliable => PACKET_TYPE_DATA_UNRELIABLE,
            Self::ClientConnectionRequest => PACKET_TYPE_CLIENT_CONNECTION_REQUEST,
            Self::ClientChallengeResponse => PACKET_TYPE_CLIENT_CHALLENGE_RESPONSE,
            Self::Keepalive => PACKET_TYPE_KEEPALIVE,
            Self::Disconnect => PACKET_TYPE_DISCONNECT,
        }
    }

    pub fn from_u8(bits: u8) -> Option<Self> {
        let packet_type = match bits {
            PACKET_TYPE_DATA_RELIABLE => Self::DataReliable,
            PACKET_TYPE_DATA_UNRELIABLE => Self::DataUnreliable,
            PACKET_TYPE_CLIENT_CONNECTION_REQUEST => Self::ClientConnectionRequest,
            PACKET_TYPE_CLIENT_CHALLENGE_RESPONSE => Self::ClientChallengeResponse,
            PACKET_TYPE_KEEPALIVE => Self::Keepalive,
            PACKET_TYPE_DISCONNECT => Self::Disconnect,
            _ => return None,
        };

        Some(packet_type)
    }

    /// Whether packets of this type carry message records.
    pub fn carries_payload(self) -> bool {
        matches!(self, Self::DataReliable | Self::DataUnreliable)
    }

    /// Whether packets of this type are padded to [`MAX_PACKET_SIZE`]. A connection request is
    /// therefore never smaller than the challenge it provokes.
    pub fn is_padded(self) -> bool {
        matches!(
            self,
            Self::ClientConnectionRequest | Self::ClientChallengeResponse
        )
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Header {
    /// Sequence number of this packet
    pub id: u16,
    /// Most recent sequence number received from the remote host
    pub ack_id: u16,
    /// Bit `i` is set if `ack_id - 1 - i` was received
    pub acked_bits: AckBitArray,
    pub packet_type: PacketType,
    /// Connection token
    pub salt: u64,
}

impl Header {
    pub fn new(packet_type: PacketType, salt: u64) -> Self {
        Self {
            id: 0,
            ack_id: 0,
            acked_bits: AckBitArray::new(ACKED_BITS_BYTES, 0),
            packet_type,
            salt,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Packet<M> {
    pub header: Header,
    pub messages: Vec<M>,
}

impl<M> Packet<M> {
    pub fn new(header: Header) -> Self {
        Self {
            header,
            messages: Vec::new(),
        }
    }

    /// Fully decodes a datagram, resolving message records through `registry`.
    pub fn deserialize(bytes: &[u8], registry: &Registry<M>) -> Result<Self, Error> {
        serial::read_packet(bytes, registry)
    }
}

impl<M> Packet<M>
where
    M: Message,
{
    /// Serialized size of this packet.
    pub fn len(&self) -> usize {
        if self.header.packet_type.is_padded() {
            MAX_PACKET_SIZE
        } else {
            HEADER_SIZE + self.data_len()
        }
    }

    /// Serialized size of the message records in this packet.
    pub fn data_len(&self) -> usize {
        self.messages.iter().map(|m| m.len()).sum()
    }

    pub fn serialize(&self) -> Result<Box<[u8]>, Error> {
        serial::write_packet(self)
    }

    /// Serializes into the front of `buffer`, returning the number of bytes written.
    pub fn serialize_into(&self, buffer: &mut [u8]) -> Result<usize, Error> {
        serial::write_packet_into(self, buffer)
    }
}

/// Decodes only the header of a datagram, leaving the payload untouched.
pub fn decode_header(bytes: &[u8]) -> Result<Header, Error> {
    serial::read_header(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{RawMessage, RECORD_HEADER_SIZE};

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_data_packet(rng: &mut StdRng) -> Packet<RawMessage> {
        let mut header = Header::new(
            if rng.gen::<bool>() {
                PacketType::DataReliable
            } else {
                PacketType::DataUnreliable
            },
            rng.gen(),
        );
        header.id = rng.gen();
        header.ack_id = rng.gen();
        header.acked_bits = AckBitArray::new(ACKED_BITS_BYTES, rng.gen());

        let mut packet = Packet::new(header);
        let mut remaining = rng.gen_range(0..=MAX_PACKET_DATA_SIZE);

        while remaining >= RECORD_HEADER_SIZE {
            let size = rng.gen_range(0..=(remaining - RECORD_HEADER_SIZE).min(200));
            let data = (0..size).map(|_| rng.gen::<u8>()).collect::<Vec<_>>();

            remaining -= RECORD_HEADER_SIZE + size;
            packet.messages.push(RawMessage::new(rng.gen(), data));
        }

        packet
    }

    #[test]
    fn random_round_trip() {
        let mut rng = StdRng::seed_from_u64(0);
        let registry = RawMessage::registry();

        for _ in 0..64 {
            let packet = random_data_packet(&mut rng);

            let bytes = packet.serialize().unwrap();
            assert_eq!(bytes.len(), packet.len());
            assert!(bytes.len() <= MAX_PACKET_SIZE);

            let header = decode_header(&bytes).unwrap();
            assert_eq!(header, packet.header);

            let decoded = Packet::deserialize(&bytes, &registry).unwrap();
            assert_eq!(decoded.header.id, packet.header.id);
            assert_eq!(decoded.header.ack_id, packet.header.ack_id);
            assert_eq!(decoded.header.salt, packet.header.salt);
            assert_eq!(decoded.header.packet_type, packet.header.packet_type);
            assert_eq!(decoded.header.acked_bits, packet.header.acked_bits);
            assert_eq!(decoded.messages, packet.messages);
        }
    }

    #[test]
    fn minimal_data_packet_length() {
        let mut packet = Packet::new(Header::new(PacketType::DataReliable, 12345));
        packet.messages.push(RawMessage::new(0, Vec::new()));

        assert_eq!(packet.len(), HEADER_SIZE + RECORD_HEADER_SIZE);
        assert_eq!(packet.serialize().unwrap().len(), packet.len());
    }

    #[test]
    fn full_data_packet_length() {
        let mut packet = Packet::new(Header::new(PacketType::DataUnreliable, 1));
        packet.messages.push(RawMessage::new(
            0xFF,
            vec![0xFF; MAX_PACKET_DATA_SIZE - RECORD_HEADER_SIZE],
        ));

        assert_eq!(packet.len(), MAX_PACKET_SIZE);

        let bytes = packet.serialize().unwrap();
        assert_eq!(bytes.len(), MAX_PACKET_SIZE);

        let decoded = Packet::deserialize(&bytes, &RawMessage::registry()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn oversize_packet_rejected() {
        let mut packet = Packet::new(Header::new(PacketType::DataReliable, 1));
        packet.messages.push(RawMessage::new(
            0,
            vec![0; MAX_PACKET_DATA_SIZE - RECORD_HEADER_SIZE + 1],
        ));

        assert_eq!(
            packet.serialize(),
            Err(Error::PacketTooLarge {
                size: MAX_PACKET_SIZE + 1,
                max: MAX_PACKET_SIZE
            })
        );
    }

    #[test]
    fn handshake_packets_are_padded() {
        for packet_type in [
            PacketType::ClientConnectionRequest,
            PacketType::ClientChallengeResponse,
        ] {
            let packet = Packet::<RawMessage>::new(Header::new(packet_type, 1));

            assert_eq!(packet.len(), MAX_PACKET_SIZE);

            let bytes = packet.serialize().unwrap();
            assert_eq!(bytes.len(), MAX_PACKET_SIZE);
            assert!(bytes[HEADER_SIZE..].iter().all(|&b| b == 0));

            let decoded = Packet::deserialize(&bytes, &RawMessage::registry()).unwrap();
            assert_eq!(decoded.header.packet_type, packet_type);
            assert!(decoded.messages.is_empty());

            // Truncated handshakes are not accepted
            assert!(Packet::deserialize(&bytes[..HEADER_SIZE], &RawMessage::registry()).is_err());
        }
    }

    #[test]
    fn serialize_into_reused_buffer() {
        let mut buffer = [0xEEu8; MAX_PACKET_SIZE];

        let mut packet = Packet::new(Header::new(PacketType::DataReliable, 7));
        packet.messages.push(RawMessage::new(3, vec![1, 2, 3]));

        let len = packet.serialize_into(&mut buffer).unwrap();
        assert_eq!(&buffer[..len], &packet.serialize().unwrap()[..]);

        // Stale bytes are not mistaken for padding
        let request = Packet::<RawMessage>::new(Header::new(PacketType::ClientConnectionRequest, 0));
        assert_eq!(request.serialize_into(&mut buffer), Ok(MAX_PACKET_SIZE));
        assert!(buffer[HEADER_SIZE..].iter().all(|&b| b == 0));

        assert_eq!(
            request.serialize_into(&mut buffer[..HEADER_SIZE]),
            Err(Error::PacketTooLarge {
                size: MAX_PACKET_SIZE,
                max: HEADER_SIZE
            })
        );
    }

    #[test]
    fn control_packet_payload_rejected() {
        let mut packet = Packet::new(Header::new(PacketType::ClientConnectionRequest, 1));
        packet.messages.push(RawMessage::new(0, vec![1]));

        assert_eq!(packet.serialize(), Err(Error::PayloadNotAllowed));

        let keepalive = Packet::<RawMessage>::new(Header::new(PacketType::Keepalive, 1));
        let mut bytes = keepalive.serialize().unwrap().into_vec();
        assert_eq!(bytes.len(), HEADER_SIZE);

        bytes.push(0);
        assert!(Packet::deserialize(&bytes, &RawMessage::registry()).is_err());
    }

    #[test]
    fn overrunning_record_rejected() {
        let mut packet = Packet::new(Header::new(PacketType::DataReliable, 1));
        packet.messages.push(RawMessage::new(9, vec![1, 2, 3, 4]));

        let bytes = packet.serialize().unwrap();

        assert_eq!(
            Packet::deserialize(&bytes[..bytes.len() - 1], &RawMessage::registry()),
            Err(Error::MalformedPacket("message length overruns packet"))
        );
    }

    #[test]
    fn trailing_bytes_rejected() {
        let mut packet = Packet::new(Header::new(PacketType::DataReliable, 1));
        packet.messages.push(RawMessage::new(9, vec![1, 2, 3, 4]));

        let mut bytes = packet.serialize().unwrap().into_vec();
        bytes.extend_from_slice(&[0xAA, 0xBB]);

        assert!(Packet::deserialize(&bytes, &RawMessage::registry()).is_err());
    }
}
