use std::collections::VecDeque;

use tracing::{debug, error, info, trace, warn};

use super::message::{Message, Registry};
use super::packet::{self, Header, Packet, PacketType};
use super::{Error, ErrorKind, SendMode};

mod outstanding;
mod window;

use outstanding::OutstandingTable;
use window::{Receipt, ReceiveWindow};

/// Number of copies of a disconnect packet sent when closing a connection.
pub const DISCONNECT_REPEAT: usize = 3;

/// Largest span of ids between the oldest unacknowledged reliable packet and the next id sent.
/// Keeps every resend inside the remote host's acknowledgement window.
pub const SEND_WINDOW_SIZE: usize = packet::ACKED_BITS_BYTES * 8;

const RESEND_TIMEOUT_DEFAULT_MS: u64 = 200;
const RESEND_TIMEOUT_MIN_MS: u64 = 10;

const RESEND_COUNT_MAX_DEFAULT: u8 = 10;
const RESEND_COUNT_MAX_MAX: u8 = 64;

const KEEPALIVE_INTERVAL_DEFAULT_MS: u64 = 1_000;
const KEEPALIVE_INTERVAL_MIN_MS: u64 = 10;

const CONNECTION_TIMEOUT_DEFAULT_MS: u64 = 10_000;
const CONNECTION_TIMEOUT_MIN_MS: u64 = 2_000;

const HANDSHAKE_RESEND_DEFAULT_MS: u64 = 250;
const HANDSHAKE_RESEND_MIN_MS: u64 = 10;

const HANDSHAKE_TIMEOUT_DEFAULT_MS: u64 = 10_000;
const HANDSHAKE_TIMEOUT_MIN_MS: u64 = 1_000;

/// Timing and retry parameters for a single connection.
#[derive(Clone, Debug)]
pub struct Config {
    /// Time after which an unacknowledged reliable packet is resent, in milliseconds.
    ///
    /// Minimum value: 10 \
    /// Default value: 200
    pub resend_timeout_ms: u64,

    /// Number of times a reliable packet may be resent before the connection is considered
    /// lost.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 64 \
    /// Default value: 10
    pub resend_count_max: u8,

    /// Idle time after which a keepalive packet is sent, in milliseconds.
    ///
    /// Minimum value: 10 \
    /// Default value: 1,000
    pub keepalive_interval_ms: u64,

    /// Time without receiving anything after which an established connection times out, in
    /// milliseconds.
    ///
    /// Minimum value: 2,000 \
    /// Default value: 10,000
    pub connection_timeout_ms: u64,

    /// Interval at which unanswered handshake packets are repeated, in milliseconds.
    ///
    /// Minimum value: 10 \
    /// Default value: 250
    pub handshake_resend_ms: u64,

    /// Time allowed for the handshake to complete, in milliseconds.
    ///
    /// Minimum value: 1,000 \
    /// Default value: 10,000
    pub handshake_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resend_timeout_ms: RESEND_TIMEOUT_DEFAULT_MS,
            resend_count_max: RESEND_COUNT_MAX_DEFAULT,
            keepalive_interval_ms: KEEPALIVE_INTERVAL_DEFAULT_MS,
            connection_timeout_ms: CONNECTION_TIMEOUT_DEFAULT_MS,
            handshake_resend_ms: HANDSHAKE_RESEND_DEFAULT_MS,
            handshake_timeout_ms: HANDSHAKE_TIMEOUT_DEFAULT_MS,
        }
    }
}

impl Config {
    pub fn validate(&self) {
        assert!(
            self.resend_timeout_ms >= RESEND_TIMEOUT_MIN_MS,
            "invalid connection configuration: resend_timeout_ms < {}",
            RESEND_TIMEOUT_MIN_MS
        );
        assert!(
            self.resend_count_max > 0,
            "invalid connection configuration: resend_count_max == 0"
        );
        assert!(
            self.resend_count_max <= RESEND_COUNT_MAX_MAX,
            "invalid connection configuration: resend_count_max > {}",
            RESEND_COUNT_MAX_MAX
        );
        assert!(
            self.keepalive_interval_ms >= KEEPALIVE_INTERVAL_MIN_MS,
            "invalid connection configuration: keepalive_interval_ms < {}",
            KEEPALIVE_INTERVAL_MIN_MS
        );
        assert!(
            self.connection_timeout_ms >= CONNECTION_TIMEOUT_MIN_MS,
            "invalid connection configuration: connection_timeout_ms < {}",
            CONNECTION_TIMEOUT_MIN_MS
        );
        assert!(
            self.handshake_resend_ms >= HANDSHAKE_RESEND_MIN_MS,
            "invalid connection configuration: handshake_resend_ms < {}",
            HANDSHAKE_RESEND_MIN_MS
        );
        assert!(
            self.handshake_timeout_ms >= HANDSHAKE_TIMEOUT_MIN_MS,
            "invalid connection configuration: handshake_timeout_ms < {}",
            HANDSHAKE_TIMEOUT_MIN_MS
        );
    }
}

pub trait HostContext<M> {
    // Called to send a datagram to the remote host
    fn send_packet(&mut self, packet_bytes: &[u8]);

    // Called when the handshake has completed
    fn on_connect(&mut self);

    // Called when the connection has been closed by either side
    fn on_disconnect(&mut self);

    // Called for each message received from the remote host
    fn on_receive(&mut self, message: M);

    // Called when the connection has been terminated due to an error
    fn on_error(&mut self, kind: ErrorKind);
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Phase {
    Idle,
    AwaitingChallenge,
    AwaitingConfirmation,
    Connected,
    Disconnected,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Role {
    /// Initiates the handshake and echoes the salt it is issued
    Requester,
    /// Answers a connection request by issuing a salt
    Acceptor,
}

#[derive(Debug, Eq, PartialEq)]
pub enum TimeoutAction {
    Continue,
    Terminate,
}

/// Counters describing the traffic on a connection.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_resent: u64,
    pub packets_acked: u64,
    pub duplicates_received: u64,
    pub ids_lost: u64,
    pub outstanding: usize,
}

/// Sequencing, acknowledgement and handshake state for a connection with one remote host.
pub struct PacketManager<M> {
    config: Config,
    role: Role,
    phase: Phase,
    // Zero until issued by the acceptor
    salt: u64,
    next_id: u16,
    window: ReceiveWindow,
    outstanding: OutstandingTable,
    reliable_queue: VecDeque<M>,
    unreliable_queue: VecDeque<M>,
    registry: Registry<M>,
    // A reliable packet was received and has not been acknowledged since
    ack_pending: bool,
    // The remote host has acknowledged at least one of our packets
    remote_acked: bool,
    handshake_timeout_time_ms: u64,
    handshake_resend_time_ms: Option<u64>,
    last_send_ms: u64,
    last_receive_ms: u64,
    stats: Stats,
}

impl<M> PacketManager<M>
where
    M: Message,
{
    pub fn new(config: Config, role: Role, now_ms: u64) -> Self {
        config.validate();

        Self {
            config,
            role,
            phase: Phase::Idle,
            salt: 0,
            next_id: 0,
            window: ReceiveWindow::new(),
            outstanding: OutstandingTable::new(),
            reliable_queue: VecDeque::new(),
            unreliable_queue: VecDeque::new(),
            registry: M::registry(),
            ack_pending: false,
            remote_acked: false,
            handshake_timeout_time_ms: now_ms,
            handshake_resend_time_ms: None,
            last_send_ms: now_ms,
            last_receive_ms: now_ms,
            stats: Stats::default(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn salt(&self) -> u64 {
        self.salt
    }

    pub fn is_connected(&self) -> bool {
        self.phase == Phase::Connected
    }

    pub fn stats(&self) -> Stats {
        Stats {
            ids_lost: self.window.lost_count(),
            outstanding: self.outstanding.len(),
            ..self.stats.clone()
        }
    }

    /// Begins a handshake by sending a connection request.
    pub fn connect(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) {
        assert_eq!(self.role, Role::Requester);
        assert_eq!(self.phase, Phase::Idle);

        debug!("requesting connection");

        self.phase = Phase::AwaitingChallenge;
        self.handshake_timeout_time_ms = now_ms + self.config.handshake_timeout_ms;

        self.send_handshake(now_ms, ctx);
    }

    /// Answers a connection request by issuing `salt`.
    pub fn accept(&mut self, salt: u64, now_ms: u64, ctx: &mut impl HostContext<M>) {
        assert_eq!(self.role, Role::Acceptor);
        assert_eq!(self.phase, Phase::Idle);
        assert_ne!(salt, 0, "salt must be nonzero");

        debug!("issuing challenge");

        self.salt = salt;
        self.phase = Phase::AwaitingConfirmation;
        self.handshake_timeout_time_ms = now_ms + self.config.handshake_timeout_ms;

        self.send_handshake(now_ms, ctx);
    }

    /// Queues a message for sending. Messages queued before the connection has been
    /// established are sent once it has.
    pub fn enqueue(&mut self, message: M, mode: SendMode) -> Result<(), Error> {
        if message.len() > packet::MAX_PACKET_DATA_SIZE {
            return Err(Error::PacketTooLarge {
                size: packet::HEADER_SIZE + message.len(),
                max: packet::MAX_PACKET_SIZE,
            });
        }

        if self.phase == Phase::Disconnected {
            trace!("discarding message queued after disconnect");
            return Ok(());
        }

        match mode {
            SendMode::Reliable => self.reliable_queue.push_back(message),
            SendMode::Unreliable => self.unreliable_queue.push_back(message),
        }

        Ok(())
    }

    /// Sends all queued messages, and a standalone acknowledgement if one is owed.
    pub fn flush(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) {
        if self.phase != Phase::Connected {
            return;
        }

        self.flush_queue(PacketType::DataReliable, now_ms, ctx);
        self.flush_queue(PacketType::DataUnreliable, now_ms, ctx);

        if self.ack_pending {
            self.send_session_control(PacketType::Keepalive, now_ms, ctx);
        }
    }

    /// Processes a datagram received from the remote host. Returned errors describe why a
    /// datagram was dropped; the connection state is unchanged in that case.
    pub fn handle_packet(
        &mut self,
        packet_bytes: &[u8],
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) -> Result<(), Error> {
        let header = packet::decode_header(packet_bytes)?;

        match header.packet_type {
            PacketType::ClientConnectionRequest => {
                self.handle_connection_request(&header, packet_bytes, now_ms, ctx)
            }
            PacketType::ClientChallengeResponse => {
                self.handle_challenge_response(&header, packet_bytes, now_ms, ctx)
            }
            _ => self.handle_session_packet(&header, packet_bytes, now_ms, ctx),
        }
    }

    fn handle_connection_request(
        &mut self,
        header: &Header,
        packet_bytes: &[u8],
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) -> Result<(), Error> {
        if self.role != Role::Acceptor {
            return Ok(());
        }

        Packet::deserialize(packet_bytes, &self.registry)?;

        match self.phase {
            Phase::AwaitingConfirmation => {
                // Our challenge may have been lost
                self.send_handshake(now_ms, ctx);
                Ok(())
            }
            Phase::Connected if header.salt != self.salt => Err(Error::SpoofSuspected),
            _ => Ok(()),
        }
    }

    fn handle_challenge_response(
        &mut self,
        header: &Header,
        packet_bytes: &[u8],
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) -> Result<(), Error> {
        if self.role != Role::Requester {
            return Ok(());
        }

        Packet::deserialize(packet_bytes, &self.registry)?;

        match self.phase {
            Phase::AwaitingChallenge => {
                if header.salt == 0 {
                    return Err(Error::MalformedPacket("challenge carries no salt"));
                }

                debug!("challenge received, confirming");

                self.salt = header.salt;
                self.phase = Phase::AwaitingConfirmation;
                self.handshake_timeout_time_ms = now_ms + self.config.handshake_timeout_ms;

                self.send_handshake(now_ms, ctx);

                Ok(())
            }
            Phase::AwaitingConfirmation | Phase::Connected if header.salt != self.salt => {
                Err(Error::SpoofSuspected)
            }
            Phase::AwaitingConfirmation => {
                // Our confirmation may have been lost
                self.send_handshake(now_ms, ctx);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn handle_session_packet(
        &mut self,
        header: &Header,
        packet_bytes: &[u8],
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) -> Result<(), Error> {
        match self.phase {
            Phase::AwaitingConfirmation | Phase::Connected => (),
            _ => return Ok(()),
        }

        if header.salt != self.salt {
            return Err(Error::SpoofSuspected);
        }

        // Decode fully before touching any state
        let packet = Packet::deserialize(packet_bytes, &self.registry)?;

        if header.packet_type == PacketType::Disconnect {
            info!("connection closed by remote host");

            self.terminate();
            ctx.on_disconnect();

            return Ok(());
        }

        if self.phase == Phase::AwaitingConfirmation {
            info!(salt = self.salt, "connection established");

            self.phase = Phase::Connected;
            self.handshake_resend_time_ms = None;

            ctx.on_connect();
        }

        if !self.remote_acked {
            if header.ack_id != window::INITIAL_ACK_ID || header.acked_bits.count_ones() > 0 {
                self.remote_acked = true;
            } else if self.role == Role::Acceptor {
                // The requester is still confirming, and is only connected once it hears from us
                self.ack_pending = true;
            }
        }

        self.last_receive_ms = now_ms;
        self.stats.packets_received += 1;

        let receipt = self.window.record(header.id);

        let acked = self.outstanding.acknowledge(header.ack_id, &header.acked_bits);
        self.stats.packets_acked += acked as u64;

        trace!(
            id = header.id,
            ack_id = header.ack_id,
            acked_bits = header.acked_bits.count_ones(),
            acked,
            packet_type = ?header.packet_type,
            "packet received"
        );

        match header.packet_type {
            PacketType::DataReliable | PacketType::DataUnreliable => {
                if header.packet_type == PacketType::DataReliable {
                    self.ack_pending = true;
                }

                match receipt {
                    Receipt::New => {
                        for message in packet.messages.into_iter() {
                            ctx.on_receive(message);
                        }
                    }
                    Receipt::Duplicate => {
                        trace!(id = header.id, "duplicate packet");
                        self.stats.duplicates_received += 1;
                    }
                }
            }
            _ => (),
        }

        self.flush(now_ms, ctx);

        Ok(())
    }

    /// Returns the time at which [`PacketManager::handle_timer`] should next be called.
    pub fn next_timer_ms(&self) -> Option<u64> {
        match self.phase {
            Phase::Idle | Phase::Disconnected => None,
            Phase::AwaitingChallenge | Phase::AwaitingConfirmation => {
                let timeout_time_ms = self.handshake_timeout_time_ms;

                Some(match self.handshake_resend_time_ms {
                    Some(t) => t.min(timeout_time_ms),
                    None => timeout_time_ms,
                })
            }
            Phase::Connected => {
                let timeout_time_ms = self.last_receive_ms + self.config.connection_timeout_ms;
                let keepalive_time_ms = self.last_send_ms + self.config.keepalive_interval_ms;

                let mut t = timeout_time_ms.min(keepalive_time_ms);

                if let Some(resend_time_ms) =
                    self.outstanding.next_resend_ms(self.config.resend_timeout_ms)
                {
                    t = t.min(resend_time_ms);
                }

                Some(t)
            }
        }
    }

    /// Performs any resends, keepalives and timeouts which have come due.
    pub fn handle_timer(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) -> TimeoutAction {
        match self.phase {
            Phase::Idle => TimeoutAction::Continue,
            Phase::Disconnected => TimeoutAction::Terminate,
            Phase::AwaitingChallenge | Phase::AwaitingConfirmation => {
                if now_ms >= self.handshake_timeout_time_ms {
                    warn!(phase = ?self.phase, "handshake timed out");

                    self.terminate();
                    ctx.on_error(ErrorKind::Timeout);

                    return TimeoutAction::Terminate;
                }

                if let Some(resend_time_ms) = self.handshake_resend_time_ms {
                    if now_ms >= resend_time_ms {
                        self.send_handshake(now_ms, ctx);
                    }
                }

                TimeoutAction::Continue
            }
            Phase::Connected => {
                if now_ms >= self.last_receive_ms + self.config.connection_timeout_ms {
                    warn!("connection timed out");

                    self.terminate();
                    ctx.on_error(ErrorKind::Timeout);

                    return TimeoutAction::Terminate;
                }

                if let Err(err) = self.resend_due(now_ms, ctx) {
                    warn!(%err, "giving up on connection");

                    self.terminate();
                    ctx.on_error(ErrorKind::ConnectionLost);

                    return TimeoutAction::Terminate;
                }

                if self.ack_pending
                    || now_ms >= self.last_send_ms + self.config.keepalive_interval_ms
                {
                    self.send_session_control(PacketType::Keepalive, now_ms, ctx);
                }

                TimeoutAction::Continue
            }
        }
    }

    /// Closes the connection, discarding anything not yet sent or acknowledged.
    pub fn disconnect(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) {
        match self.phase {
            Phase::Disconnected => return,
            Phase::AwaitingConfirmation | Phase::Connected => {
                self.reliable_queue.clear();
                self.unreliable_queue.clear();
                self.outstanding.clear();

                for _ in 0..DISCONNECT_REPEAT {
                    self.send_session_control(PacketType::Disconnect, now_ms, ctx);
                }
            }
            Phase::Idle | Phase::AwaitingChallenge => (),
        }

        info!("connection closed");

        self.terminate();
        ctx.on_disconnect();
    }

    fn terminate(&mut self) {
        self.phase = Phase::Disconnected;
        self.reliable_queue.clear();
        self.unreliable_queue.clear();
        self.outstanding.clear();
        self.handshake_resend_time_ms = None;
        self.ack_pending = false;
    }

    /// True if sending another packet under a fresh id would let the oldest unacknowledged
    /// reliable packet fall out of the remote host's acknowledgement window.
    fn send_window_full(&self) -> bool {
        match self.outstanding.oldest(self.next_id) {
            Some(oldest) => usize::from(self.next_id.wrapping_sub(oldest)) >= SEND_WINDOW_SIZE,
            None => false,
        }
    }

    fn resend_due(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) -> Result<(), Error> {
        let resend_timeout_ms = self.config.resend_timeout_ms;

        for id in self.outstanding.due(now_ms, resend_timeout_ms) {
            let entry = match self.outstanding.get_mut(id) {
                Some(entry) => entry,
                None => continue,
            };

            if entry.resend_count >= self.config.resend_count_max {
                return Err(Error::ConnectionLost);
            }

            packet::serial::restamp_acks(
                &mut entry.packet,
                self.window.ack_id(),
                &self.window.acked_bits(),
            );

            trace!(id, resend_count = entry.resend_count + 1, "resending packet");

            ctx.send_packet(&entry.packet);

            entry.resend_count += 1;
            entry.send_time_ms = now_ms;

            self.stats.packets_resent += 1;
            self.last_send_ms = now_ms;
            self.ack_pending = false;
        }

        Ok(())
    }

    /// Assigns a sequence number and the current acknowledgement state to an outgoing header.
    fn stamp(&mut self, header: &mut Header, now_ms: u64) {
        header.id = match self.outstanding.oldest(self.next_id) {
            // Headers without a payload reuse an id the remote host no longer waits on
            Some(oldest) if !header.packet_type.carries_payload() && self.send_window_full() => {
                oldest.wrapping_sub(1)
            }
            _ => {
                let id = self.next_id;
                self.next_id = id.wrapping_add(1);
                id
            }
        };
        header.ack_id = self.window.ack_id();
        header.acked_bits = self.window.acked_bits();

        self.ack_pending = false;
        self.last_send_ms = now_ms;
        self.stats.packets_sent += 1;
    }

    fn send_handshake(&mut self, now_ms: u64, ctx: &mut impl HostContext<M>) {
        let (packet_type, resend) = match (self.role, self.phase) {
            (Role::Requester, Phase::AwaitingChallenge) => {
                (PacketType::ClientConnectionRequest, true)
            }
            (Role::Requester, Phase::AwaitingConfirmation) => (PacketType::Keepalive, true),
            (Role::Acceptor, Phase::AwaitingConfirmation) => {
                (PacketType::ClientChallengeResponse, false)
            }
            _ => return,
        };

        if packet_type == PacketType::Keepalive {
            self.send_session_control(packet_type, now_ms, ctx);
        } else {
            let packet = Packet::<M>::new(Header::new(packet_type, self.salt));
            self.send(&packet, ctx);
        }

        self.handshake_resend_time_ms = if resend {
            Some(now_ms + self.config.handshake_resend_ms)
        } else {
            None
        };
    }

    fn send_session_control(
        &mut self,
        packet_type: PacketType,
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) {
        let mut packet = Packet::<M>::new(Header::new(packet_type, self.salt));
        self.stamp(&mut packet.header, now_ms);
        self.send(&packet, ctx);
    }

    fn send(&mut self, packet: &Packet<M>, ctx: &mut impl HostContext<M>) -> Option<Box<[u8]>> {
        match packet.serialize() {
            Ok(packet_bytes) => {
                ctx.send_packet(&packet_bytes);
                Some(packet_bytes)
            }
            Err(err) => {
                error!(%err, packet_type = ?packet.header.packet_type, "failed to serialize packet");
                None
            }
        }
    }

    fn flush_queue(
        &mut self,
        packet_type: PacketType,
        now_ms: u64,
        ctx: &mut impl HostContext<M>,
    ) {
        loop {
            let window_full = self.send_window_full();

            let queue = match packet_type {
                PacketType::DataReliable => &mut self.reliable_queue,
                _ => &mut self.unreliable_queue,
            };

            if queue.is_empty() {
                break;
            }

            if window_full {
                trace!(queued = queue.len(), "send window full, holding messages");
                break;
            }

            let mut packet = Packet::new(Header::new(packet_type, self.salt));
            let mut data_size = 0;

            // Every queued message fits in an empty packet
            while let Some(message) = queue.front() {
                let size = message.len();

                if data_size + size > packet::MAX_PACKET_DATA_SIZE {
                    break;
                }

                data_size += size;

                if let Some(message) = queue.pop_front() {
                    packet.messages.push(message);
                }
            }

            self.stamp(&mut packet.header, now_ms);

            trace!(
                id = packet.header.id,
                message_count = packet.messages.len(),
                packet_type = ?packet_type,
                "sending packet"
            );

            if let Some(packet_bytes) = self.send(&packet, ctx) {
                if packet_type == PacketType::DataReliable {
                    self.outstanding
                        .insert(packet.header.id, packet_bytes, now_ms);
                }
            }
        }
    }
}
