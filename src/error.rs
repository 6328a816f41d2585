/// Errors produced by the packet codec and the connection state machine.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    /// A packet or message would not fit in a single datagram.
    #[error("packet of {size} bytes exceeds the maximum of {max} bytes")]
    PacketTooLarge { size: usize, max: usize },
    /// Messages were attached to a packet type which carries no payload.
    #[error("packet type does not carry a payload")]
    PayloadNotAllowed,
    /// A datagram could not be decoded.
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    /// A packet arrived on a connection with a salt other than the connection's.
    #[error("packet salt does not match the connection")]
    SpoofSuspected,
    /// All resend attempts for a reliable packet were exhausted.
    #[error("connection lost")]
    ConnectionLost,
    /// A bit index outside of an ack window was accessed.
    #[error("bit index {index} is out of range for a {width}-bit window")]
    IndexOutOfRange { index: usize, width: usize },
}

/// Reason a connection was terminated, as reported by client and server events.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    /// The remote host stopped responding, or never completed the handshake.
    Timeout,
    /// A reliable packet was resent the maximum number of times without acknowledgement.
    ConnectionLost,
}
