/*!

A connection-oriented transport over UDP for real-time applications.

Every datagram begins with the same fixed header:

```text
id: u16 | ack_id: u16 | acked_bits: u64 | type: u8 | salt: u64
```

All fields are big-endian. Data packets follow the header with a sequence of message records,
each framed as `tag: u8 | length: u16 | body`, and packed greedily into datagrams of at most
1200 bytes.

# Handshake

A client opens a connection by repeatedly sending a connection request, padded to the maximum
packet size so that it is never smaller than the reply it provokes. The server answers with a
challenge carrying a random, nonzero salt. The client adopts the salt and sends a keepalive
carrying it, and once the server sees the salt echoed, the connection is established on both
ends. From then on every packet carries the salt, and packets with any other salt are dropped.

# Reliability

Every packet sent after the handshake acknowledges the most recent sequence number received from
the remote host, along with a 64-bit window of the sequence numbers before it. Reliable packets
are resent with their original sequence number until acknowledged, up to a configured number of
times, after which the connection is considered lost. Unreliable packets are sent once and never
delay delivery of later packets. Duplicate packets are acknowledged again, but their messages are
not delivered twice.

Messages are delivered in the order their packets arrive. No ordering is imposed between packets.

*/

mod ack_bits;
pub mod client;
mod error;
pub mod manager;
pub mod message;
pub mod packet;
pub mod server;
mod socket;
mod timer_queue;

pub use ack_bits::AckBitArray;
pub use error::{Error, ErrorKind};
pub use message::{Message, RawMessage, Registry};

/// Delivery guarantee requested for a message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendMode {
    /// The message is resent until acknowledged, or until the connection is declared lost.
    Reliable,
    /// The message is sent once.
    Unreliable,
}

pub type Client<M = RawMessage> = client::Client<M>;
pub type Server<M = RawMessage> = server::Server<M>;
pub type ClientEvent<M = RawMessage> = client::Event<M>;
pub type ServerEvent<M = RawMessage> = server::Event<M>;
