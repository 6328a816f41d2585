use super::*;

/// Bounds-checked big-endian reader over a byte slice.
pub struct Reader<'a> {
    buffer: &'a [u8],
    read_idx: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buffer: &'a [u8]) -> Self {
        Self {
            buffer,
            read_idx: 0,
        }
    }

    pub fn bytes_read(&self) -> usize {
        self.read_idx
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.read_idx
    }

    pub fn read_slice(&mut self, len: usize) -> Option<&'a [u8]> {
        if self.remaining() < len {
            return None;
        }

        let slice = &self.buffer[self.read_idx..self.read_idx + len];
        self.read_idx += len;
        Some(slice)
    }

    fn read_array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.read_slice(N)?.try_into().ok()
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.read_array::<1>().map(u8::from_be_bytes)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.read_array::<2>().map(u16::from_be_bytes)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.read_array::<8>().map(u64::from_be_bytes)
    }

    /// Reads an unsigned integer `len` bytes wide (at most 8).
    pub fn read_uint(&mut self, len: usize) -> Option<u64> {
        debug_assert!(len <= 8);

        let bytes = self.read_slice(len)?;
        Some(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
    }
}

/// Bounds-checked big-endian writer over a byte slice.
pub struct Writer<'a> {
    buffer: &'a mut [u8],
    write_idx: usize,
}

impl<'a> Writer<'a> {
    pub fn new(buffer: &'a mut [u8]) -> Self {
        Self {
            buffer,
            write_idx: 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        self.write_idx
    }

    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.write_idx
    }

    pub fn write_slice(&mut self, bytes: &[u8]) -> Option<()> {
        if self.remaining() < bytes.len() {
            return None;
        }

        self.buffer[self.write_idx..self.write_idx + bytes.len()].copy_from_slice(bytes);
        self.write_idx += bytes.len();
        Some(())
    }

    /// Returns the next `len` bytes for the caller to fill in directly.
    pub fn reserve(&mut self, len: usize) -> Option<&mut [u8]> {
        if self.remaining() < len {
            return None;
        }

        let begin_idx = self.write_idx;
        self.write_idx += len;
        Some(&mut self.buffer[begin_idx..begin_idx + len])
    }

    pub fn write_u8(&mut self, value: u8) -> Option<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_u16(&mut self, value: u16) -> Option<()> {
        self.write_slice(&value.to_be_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Option<()> {
        self.write_slice(&value.to_be_bytes())
    }

    /// Writes the low `len` bytes of `value` (at most 8).
    pub fn write_uint(&mut self, value: u64, len: usize) -> Option<()> {
        debug_assert!(len <= 8);

        self.write_slice(&value.to_be_bytes()[8 - len..])
    }
}

const MALFORMED_TRUNCATED_HEADER: Error = Error::MalformedPacket("truncated header");
const MALFORMED_PACKET_TYPE: Error = Error::MalformedPacket("unknown packet type");

fn write_acks(wr: &mut Writer, ack_id: u16, acked_bits: &AckBitArray) -> Option<()> {
    debug_assert_eq!(acked_bits.width_bytes(), ACKED_BITS_BYTES);

    wr.write_u16(ack_id)?;
    wr.write_uint(acked_bits.to_u64(), ACKED_BITS_BYTES)
}

pub fn write_header(wr: &mut Writer, header: &Header) -> Option<()> {
    wr.write_u16(header.id)?;
    write_acks(wr, header.ack_id, &header.acked_bits)?;
    wr.write_u8(header.packet_type.to_u8())?;
    wr.write_u64(header.salt)?;

    debug_assert_eq!(wr.bytes_written(), HEADER_SIZE);

    Some(())
}

/// Decodes only the fixed-size header of a datagram.
pub fn read_header(bytes: &[u8]) -> Result<Header, Error> {
    let mut rd = Reader::new(bytes);

    let id = rd.read_u16().ok_or(MALFORMED_TRUNCATED_HEADER)?;
    let ack_id = rd.read_u16().ok_or(MALFORMED_TRUNCATED_HEADER)?;
    let acked_bits = rd
        .read_uint(ACKED_BITS_BYTES)
        .ok_or(MALFORMED_TRUNCATED_HEADER)?;
    let type_bits = rd.read_u8().ok_or(MALFORMED_TRUNCATED_HEADER)?;
    let salt = rd.read_u64().ok_or(MALFORMED_TRUNCATED_HEADER)?;

    let packet_type = PacketType::from_u8(type_bits).ok_or(MALFORMED_PACKET_TYPE)?;

    Ok(Header {
        id,
        ack_id,
        acked_bits: AckBitArray::new(ACKED_BITS_BYTES, acked_bits),
        packet_type,
        salt,
    })
}

/// Overwrites the acknowledgement fields of a serialized packet, leaving its id, type, salt and
/// payload untouched.
pub fn restamp_acks(packet_bytes: &mut [u8], ack_id: u16, acked_bits: &AckBitArray) {
    assert!(packet_bytes.len() >= HEADER_SIZE);

    let mut wr = Writer::new(&mut packet_bytes[ACK_FIELDS_OFFSET..]);

    // Length asserted above
    let _ = write_acks(&mut wr, ack_id, acked_bits);
}

pub fn write_packet<M>(packet: &Packet<M>) -> Result<Box<[u8]>, Error>
where
    M: Message,
{
    let mut buffer = vec![0u8; packet.len().min(MAX_PACKET_SIZE)].into_boxed_slice();

    write_packet_into(packet, &mut buffer)?;

    Ok(buffer)
}

/// Writes `packet` to the front of `buffer`, returning the number of bytes written.
pub fn write_packet_into<M>(packet: &Packet<M>, buffer: &mut [u8]) -> Result<usize, Error>
where
    M: Message,
{
    let packet_type = packet.header.packet_type;

    if !packet_type.carries_payload() && !packet.messages.is_empty() {
        return Err(Error::PayloadNotAllowed);
    }

    let size = packet.len();

    if size > MAX_PACKET_SIZE {
        return Err(Error::PacketTooLarge {
            size,
            max: MAX_PACKET_SIZE,
        });
    }

    if size > buffer.len() {
        return Err(Error::PacketTooLarge {
            size,
            max: buffer.len(),
        });
    }

    let buffer = &mut buffer[..size];

    let mut wr = Writer::new(&mut *buffer);
    write_header(&mut wr, &packet.header).ok_or(Error::PacketTooLarge {
        size,
        max: MAX_PACKET_SIZE,
    })?;

    let mut offset = HEADER_SIZE;

    for message in packet.messages.iter() {
        offset += message::write_record(buffer, offset, message)?;
    }

    if packet_type.is_padded() {
        buffer[offset..].fill(0);
        offset = size;
    }

    debug_assert_eq!(offset, size);

    Ok(size)
}

pub fn read_packet<M>(bytes: &[u8], registry: &Registry<M>) -> Result<Packet<M>, Error> {
    if bytes.len() > MAX_PACKET_SIZE {
        return Err(Error::MalformedPacket("datagram exceeds maximum packet size"));
    }

    let header = read_header(bytes)?;
    let packet_type = header.packet_type;

    if packet_type.is_padded() {
        if bytes.len() != MAX_PACKET_SIZE {
            return Err(Error::MalformedPacket("handshake packet is not padded"));
        }

        return Ok(Packet::new(header));
    }

    if !packet_type.carries_payload() {
        if bytes.len() != HEADER_SIZE {
            return Err(Error::MalformedPacket("unexpected payload"));
        }

        return Ok(Packet::new(header));
    }

    let mut messages = Vec::new();
    let mut offset = HEADER_SIZE;

    while offset < bytes.len() {
        let (message, size) = message::read_record(bytes, offset, registry)?;

        messages.push(message);
        offset += size;
    }

    Ok(Packet { header, messages })
}
