use std::time;

use rand::Rng;
use saltline::RawMessage;

pub const EVENT_TIMEOUT: time::Duration = time::Duration::from_millis(2000);

pub const TAG_RELIABLE: u8 = 0x00;
pub const TAG_UNRELIABLE: u8 = 0x01;
pub const TAG_SUMMARY_REQUEST: u8 = 0x02;
pub const TAG_SUMMARY: u8 = 0x03;

/// A message numbered by `index`, padded out with a random number of random bytes.
pub fn data_message<R: Rng>(rng: &mut R, tag: u8, index: u32, size_max: usize) -> RawMessage {
    let size = rng.gen_range(0..=size_max);

    let mut data = index.to_be_bytes().to_vec();
    data.extend((0..size).map(|_| rng.gen::<u8>()));

    RawMessage::new(tag, data)
}

pub fn message_index(message: &RawMessage) -> u32 {
    u32::from_be_bytes(message.data[..4].try_into().unwrap())
}

/// Requests a summary once `count` reliable messages have been received.
pub fn summary_request(count: u32) -> RawMessage {
    RawMessage::new(TAG_SUMMARY_REQUEST, count.to_be_bytes().to_vec())
}

pub fn summary_request_count(message: &RawMessage) -> u32 {
    u32::from_be_bytes(message.data[..4].try_into().unwrap())
}

#[derive(Debug, PartialEq)]
pub struct Summary {
    pub reliable_md5: [u8; 16],
    pub reliable_count: u32,
    pub unreliable_count: u32,
}

impl Summary {
    pub fn to_message(&self) -> RawMessage {
        let mut data = self.reliable_md5.to_vec();
        data.extend_from_slice(&self.reliable_count.to_be_bytes());
        data.extend_from_slice(&self.unreliable_count.to_be_bytes());

        RawMessage::new(TAG_SUMMARY, data)
    }

    pub fn from_message(message: &RawMessage) -> Self {
        assert_eq!(message.tag, TAG_SUMMARY);
        assert_eq!(message.data.len(), 24);

        Self {
            reliable_md5: message.data[0..16].try_into().unwrap(),
            reliable_count: u32::from_be_bytes(message.data[16..20].try_into().unwrap()),
            unreliable_count: u32::from_be_bytes(message.data[20..24].try_into().unwrap()),
        }
    }
}

/// Digest of a sequence of message bodies, in order.
pub fn digest<'a, I>(bodies: I) -> [u8; 16]
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut ctx = md5::Context::new();

    for body in bodies {
        ctx.consume(body);
    }

    ctx.compute().0
}
