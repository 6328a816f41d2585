//! Application payload records.
//!
//! Every record on the wire is framed as `tag: u8 | length: u16 | body`, where `length` counts
//! the body only. The transport never looks inside a body: it only needs a record's tag and
//! length to pack it, and a decoder looked up by tag to unpack it.

use std::fmt;

use crate::packet::serial::{Reader, Writer};
use crate::Error;

/// Size of the tag and length fields preceding each record body.
pub const RECORD_HEADER_SIZE: usize = 1 + 2;

/// Decodes a record body carrying the given tag. Returns `None` if the body is invalid.
pub type Decoder<M> = fn(tag: u8, body: &[u8]) -> Option<M>;

/// A kind of record which may be carried in a data packet.
pub trait Message: Sized {
    /// Tag identifying this kind of record on the wire.
    fn type_tag(&self) -> u8;

    /// Encoded size of the body, excluding framing.
    fn body_len(&self) -> usize;

    /// Writes the body into `dst`, which is exactly `body_len()` bytes long.
    fn write_body(&self, dst: &mut [u8]);

    /// Returns the decoders for every record kind of this family.
    fn registry() -> Registry<Self>;

    /// Encoded size of this record, including framing.
    fn len(&self) -> usize {
        RECORD_HEADER_SIZE + self.body_len()
    }
}

/// Maps record tags to decoders.
pub struct Registry<M> {
    decoders: [Option<Decoder<M>>; 256],
    fallback: Option<Decoder<M>>,
}

impl<M> Default for Registry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> Registry<M> {
    pub fn new() -> Self {
        Self {
            decoders: [None; 256],
            fallback: None,
        }
    }

    /// Associates a decoder with `tag`.
    ///
    /// Panics if `tag` is already registered.
    pub fn register(mut self, tag: u8, decoder: Decoder<M>) -> Self {
        let ref mut slot = self.decoders[usize::from(tag)];
        assert!(slot.is_none(), "message tag {} registered twice", tag);
        *slot = Some(decoder);
        self
    }

    /// Sets a decoder to be used for every tag without a registered decoder.
    pub fn with_fallback(mut self, decoder: Decoder<M>) -> Self {
        self.fallback = Some(decoder);
        self
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.decoders[usize::from(tag)].is_some() || self.fallback.is_some()
    }

    pub fn decode(&self, tag: u8, body: &[u8]) -> Result<M, Error> {
        let decoder = self.decoders[usize::from(tag)]
            .or(self.fallback)
            .ok_or(Error::MalformedPacket("unknown message tag"))?;

        decoder(tag, body).ok_or(Error::MalformedPacket("invalid message body"))
    }
}

impl<M> fmt::Debug for Registry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tags = (0..=u8::MAX)
            .filter(|&tag| self.decoders[usize::from(tag)].is_some())
            .collect::<Vec<_>>();

        f.debug_struct("Registry")
            .field("tags", &tags)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Writes `message` as a framed record at `offset`, returning the number of bytes written.
pub fn write_record<M>(buffer: &mut [u8], offset: usize, message: &M) -> Result<usize, Error>
where
    M: Message,
{
    let size = message.len();
    let too_large = Error::PacketTooLarge {
        size: offset + size,
        max: buffer.len(),
    };

    let body_len = u16::try_from(message.body_len()).map_err(|_| too_large.clone())?;

    if offset > buffer.len() {
        return Err(too_large);
    }

    let mut wr = Writer::new(&mut buffer[offset..]);

    wr.write_u8(message.type_tag()).ok_or(too_large.clone())?;
    wr.write_u16(body_len).ok_or(too_large.clone())?;

    let body = wr.reserve(usize::from(body_len)).ok_or(too_large)?;
    message.write_body(body);

    Ok(size)
}

/// Reads one framed record at `offset`, returning it along with the number of bytes consumed.
pub fn read_record<M>(
    buffer: &[u8],
    offset: usize,
    registry: &Registry<M>,
) -> Result<(M, usize), Error> {
    let tail = buffer
        .get(offset..)
        .ok_or(Error::MalformedPacket("record offset beyond packet"))?;

    let mut rd = Reader::new(tail);

    let tag = rd
        .read_u8()
        .ok_or(Error::MalformedPacket("truncated message record"))?;

    if !registry.contains(tag) {
        return Err(Error::MalformedPacket("unknown message tag"));
    }

    let body_len = rd
        .read_u16()
        .ok_or(Error::MalformedPacket("truncated message record"))?;
    let body = rd
        .read_slice(usize::from(body_len))
        .ok_or(Error::MalformedPacket("message length overruns packet"))?;

    let message = registry.decode(tag, body)?;

    Ok((message, rd.bytes_read()))
}

/// An uninterpreted record: a tag and the bytes of its body.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RawMessage {
    pub tag: u8,
    pub data: Box<[u8]>,
}

impl RawMessage {
    pub fn new<D>(tag: u8, data: D) -> Self
    where
        D: Into<Box<[u8]>>,
    {
        Self {
            tag,
            data: data.into(),
        }
    }

    fn decode(tag: u8, body: &[u8]) -> Option<Self> {
        Some(Self::new(tag, body))
    }
}

impl Message for RawMessage {
    fn type_tag(&self) -> u8 {
        self.tag
    }

    fn body_len(&self) -> usize {
        self.data.len()
    }

    fn write_body(&self, dst: &mut [u8]) {
        dst.copy_from_slice(&self.data);
    }

    fn registry() -> Registry<Self> {
        Registry::new().with_fallback(Self::decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    enum GameMessage {
        Chat(String),
        Position { x: i32, y: i32 },
    }

    const TAG_CHAT: u8 = 1;
    const TAG_POSITION: u8 = 2;

    impl GameMessage {
        fn decode_chat(_: u8, body: &[u8]) -> Option<Self> {
            String::from_utf8(body.to_vec()).ok().map(Self::Chat)
        }

        fn decode_position(_: u8, body: &[u8]) -> Option<Self> {
            let x = i32::from_be_bytes(body.get(0..4)?.try_into().ok()?);
            let y = i32::from_be_bytes(body.get(4..8)?.try_into().ok()?);
            Some(Self::Position { x, y })
        }
    }

    impl Message for GameMessage {
        fn type_tag(&self) -> u8 {
            match self {
                Self::Chat(_) => TAG_CHAT,
                Self::Position { .. } => TAG_POSITION,
            }
        }

        fn body_len(&self) -> usize {
            match self {
                Self::Chat(text) => text.len(),
                Self::Position { .. } => 8,
            }
        }

        fn write_body(&self, dst: &mut [u8]) {
            match self {
                Self::Chat(text) => dst.copy_from_slice(text.as_bytes()),
                Self::Position { x, y } => {
                    dst[0..4].copy_from_slice(&x.to_be_bytes());
                    dst[4..8].copy_from_slice(&y.to_be_bytes());
                }
            }
        }

        fn registry() -> Registry<Self> {
            Registry::new()
                .register(TAG_CHAT, Self::decode_chat)
                .register(TAG_POSITION, Self::decode_position)
        }
    }

    #[test]
    fn records_at_offsets() {
        let registry = GameMessage::registry();
        let messages = [
            GameMessage::Chat("gg".into()),
            GameMessage::Position { x: -4, y: 1 << 20 },
            GameMessage::Chat(String::new()),
        ];

        let mut buffer = [0u8; 64];
        let mut offset = 5;

        for message in messages.iter() {
            let size = write_record(&mut buffer, offset, message).unwrap();
            assert_eq!(size, message.len());
            offset += size;
        }

        let mut read_offset = 5;

        for message in messages.iter() {
            let (decoded, size) = read_record(&buffer, read_offset, &registry).unwrap();
            assert_eq!(&decoded, message);
            read_offset += size;
        }

        assert_eq!(read_offset, offset);
    }

    #[test]
    fn unknown_tag() {
        let registry = GameMessage::registry();
        let buffer = [0x07, 0x00, 0x00];

        assert!(!registry.contains(0x07));
        assert_eq!(
            read_record(&buffer, 0, &registry),
            Err(Error::MalformedPacket("unknown message tag"))
        );

        // Rejected by tag before the length is considered
        assert_eq!(
            read_record(&[0x07, 0xFF, 0xFF], 0, &registry),
            Err(Error::MalformedPacket("unknown message tag"))
        );
    }

    #[test]
    fn invalid_body() {
        let registry = GameMessage::registry();
        let buffer = [TAG_POSITION, 0x00, 0x02, 0x00, 0x00];

        assert_eq!(
            read_record(&buffer, 0, &registry),
            Err(Error::MalformedPacket("invalid message body"))
        );
    }

    #[test]
    fn record_does_not_fit() {
        let mut buffer = [0u8; 8];
        let message = RawMessage::new(0, vec![0; 6]);

        assert!(write_record(&mut buffer, 0, &message).is_err());
        assert_eq!(write_record(&mut buffer, 0, &RawMessage::new(0, vec![0; 5])), Ok(8));
    }

    #[test]
    #[should_panic]
    fn duplicate_registration() {
        let _ = Registry::<RawMessage>::new()
            .register(1, RawMessage::decode)
            .register(1, RawMessage::decode);
    }
}
