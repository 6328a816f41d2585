mod peer;

use std::collections::HashMap;
use std::net;
use std::sync::Arc;
use std::time;

use parking_lot::Mutex;
use tracing::{debug, info};

use super::manager::{self, Phase, TimeoutAction};
use super::message::{Message, RawMessage, Registry};
use super::packet::{self, Header, Packet, PacketType};
use super::socket;
use super::timer_queue;
use super::ErrorKind;

pub use peer::PeerHandle;
use peer::{EventQueue, Peer, PeerRef};

const PEER_COUNT_MAX_DEFAULT: usize = 8;
const PEER_COUNT_MAX_MAX: usize = 65536;

const TIMER_TEST_LIMIT: usize = 24;
const TIMER_TEST_INTERVAL: time::Duration = time::Duration::from_millis(20);

// Bounds waits when no peers exist
const IDLE_WAIT_TIMEOUT: time::Duration = time::Duration::from_millis(1_000);

/// Configuration for a [`Server`] object.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of clients which may be connected or connecting at any given time.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 65,536 \
    /// Default value: 8
    pub peer_count_max: usize,

    /// Timing and retry parameters applied to each connection.
    pub reliability: manager::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            peer_count_max: PEER_COUNT_MAX_DEFAULT,
            reliability: Default::default(),
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.peer_count_max > 0,
            "invalid server configuration: peer_count_max == 0"
        );
        assert!(
            self.peer_count_max <= PEER_COUNT_MAX_MAX,
            "invalid server configuration: peer_count_max > {}",
            PEER_COUNT_MAX_MAX
        );

        self.reliability.validate();
    }
}

type TimerQueue<M> = timer_queue::TimerQueue<Mutex<Peer<M>>>;

/// Represents a server event.
#[derive(Debug)]
pub enum Event<M = RawMessage> {
    /// Produced when a new client has connected.
    Connect(PeerHandle<M>),
    /// Produced when a connection terminates gracefully.
    Disconnect(PeerHandle<M>),
    /// Produced when a message has been received.
    Receive(PeerHandle<M>, M),
    /// Produced in response to a fatal connection error.
    Error(PeerHandle<M>, ErrorKind),
}

struct ServerCore<M> {
    // Saved configuration
    config: Config,
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    // Socket send handle
    socket_tx: Arc<socket::SocketTx>,
    // Used to validate connection requests before a peer exists
    registry: Registry<M>,
    // Table of connected and connecting peers
    peers: HashMap<net::SocketAddr, PeerRef<M>>,
    // Pending timer events
    timer_queue: TimerQueue<M>,
    // Queue of pending events
    events: EventQueue<M>,
}

/// A server accepting connections from any number of clients, up to a configured maximum.
pub struct Server<M = RawMessage> {
    // Interesting server data
    core: ServerCore<M>,
    // Socket receive handle
    socket_rx: socket::SocketRx,
    // Always-allocated timer expiration buffer
    timer_data_buffer: Vec<PeerRef<M>>,
}

fn random_salt() -> u64 {
    loop {
        let salt = rand::random::<u64>();

        if salt != 0 {
            return salt;
        }
    }
}

impl<M> ServerCore<M>
where
    M: Message,
{
    fn time_now_ms(&self) -> u64 {
        self.time_ref.elapsed().as_millis() as u64
    }

    /// Returns a duration representing the time until the next timer event, if one exists.
    fn next_timer_timeout(&self) -> Option<time::Duration> {
        if self.timer_queue.is_empty() {
            None
        } else {
            Some(TIMER_TEST_INTERVAL)
        }
    }

    /// Processes all pending timer events.
    fn handle_timeouts(&mut self, timer_data_buffer: &mut Vec<PeerRef<M>>) {
        let now_ms = self.time_now_ms();

        self.timer_queue
            .poll(TIMER_TEST_LIMIT, now_ms, |peer_ref| timer_data_buffer.push(peer_ref));

        for peer_ref in timer_data_buffer.drain(..) {
            match peer::handle_timer(&peer_ref) {
                TimeoutAction::Continue => (),
                TimeoutAction::Terminate => {
                    let addr = *peer_ref.lock().addr();

                    // The address may have been taken over by a newer session
                    let current = self
                        .peers
                        .get(&addr)
                        .map_or(false, |entry| Arc::ptr_eq(entry, &peer_ref));

                    if current {
                        debug!(%addr, "removing peer");
                        self.peers.remove(&addr);
                    }
                }
            }
        }
    }

    fn admit(&mut self, sender_addr: &net::SocketAddr) {
        if self.peers.len() >= self.config.peer_count_max {
            debug!(%sender_addr, "peer table full, ignoring connection request");
            return;
        }

        let peer = Peer::new(
            *sender_addr,
            self.config.reliability.clone(),
            self.time_ref,
            Arc::clone(&self.socket_tx),
            Arc::clone(&self.events),
        );

        let peer_ref = Arc::new(Mutex::new(peer));

        // Associate with given address
        self.peers.insert(*sender_addr, Arc::clone(&peer_ref));

        // Add to the timer queue
        self.timer_queue.insert(Arc::downgrade(&peer_ref));

        debug!(%sender_addr, "accepting connection request");

        peer::accept(&peer_ref, random_salt());
    }

    fn handle_connection_request(
        &mut self,
        header: &Header,
        packet_bytes: &[u8],
        sender_addr: &net::SocketAddr,
    ) {
        if let Err(err) = Packet::deserialize(packet_bytes, &self.registry) {
            debug!(%sender_addr, %err, "dropping malformed connection request");
            return;
        }

        if let Some(peer_ref) = self.peers.get(sender_addr).cloned() {
            let (phase, salt) = {
                let peer = peer_ref.lock();
                (peer.phase(), peer.salt())
            };

            match phase {
                Phase::Connected if header.salt == salt => {
                    info!(%sender_addr, "client restarting session");

                    peer::disconnect(&peer_ref);
                    self.peers.remove(sender_addr);
                }
                Phase::Disconnected => {
                    self.peers.remove(sender_addr);
                }
                _ => {
                    // Either repeats a lost challenge or is rejected as spoofed
                    if let Err(err) = peer::handle_packet(&peer_ref, packet_bytes) {
                        debug!(%sender_addr, %err, "dropping connection request");
                    }
                    return;
                }
            }
        }

        self.admit(sender_addr);
    }

    fn handle_datagram(&mut self, packet_bytes: &[u8], sender_addr: &net::SocketAddr) {
        let header = match packet::decode_header(packet_bytes) {
            Ok(header) => header,
            Err(err) => {
                debug!(%sender_addr, %err, "dropping malformed packet");
                return;
            }
        };

        if header.packet_type == PacketType::ClientConnectionRequest {
            // Handled here, since a new peer may need to be created
            self.handle_connection_request(&header, packet_bytes, sender_addr);
        } else if let Some(peer_ref) = self.peers.get(sender_addr) {
            if let Err(err) = peer::handle_packet(peer_ref, packet_bytes) {
                debug!(%sender_addr, %err, packet_type = ?header.packet_type, "dropping packet");
            }
        } else {
            debug!(%sender_addr, packet_type = ?header.packet_type, "dropping packet from unknown address");
        }
    }

    /// Processes as many datagrams as possible from socket_rx without blocking.
    fn handle_datagrams(&mut self, socket_rx: &socket::SocketRx) {
        while let Some((packet_bytes, sender_addr)) = socket_rx.try_recv() {
            self.handle_datagram(&packet_bytes, &sender_addr);
        }
    }

    /// Processes as many datagrams as possible from socket_rx, waiting up to `wait_timeout` for
    /// the first.
    fn handle_datagrams_wait(&mut self, socket_rx: &socket::SocketRx, wait_timeout: time::Duration) {
        if let Some((packet_bytes, sender_addr)) = socket_rx.recv_timeout(wait_timeout) {
            self.handle_datagram(&packet_bytes, &sender_addr);
            // Process any further datagrams without blocking
            self.handle_datagrams(socket_rx);
        }
    }

    fn pop_event(&self) -> Option<Event<M>> {
        self.events.lock().pop_front()
    }

    fn has_events(&self) -> bool {
        !self.events.lock().is_empty()
    }
}

impl<M> Server<M>
where
    M: Message,
{
    /// Equivalent to calling [`Server::bind_with_config`] with default configuration.
    pub fn bind<A>(bind_addr: A) -> std::io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::bind_with_config(bind_addr, Default::default())
    }

    /// Binds a UDP socket at the provided address, and returns a new server object. Errors
    /// encountered during socket initialization are forwarded to the caller.
    pub fn bind_with_config<A>(bind_addr: A, config: Config) -> std::io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let (socket_tx, socket_rx) = socket::bind(bind_addr)?;

        let core = ServerCore {
            config,
            time_ref: time::Instant::now(),
            socket_tx: Arc::new(socket_tx),
            registry: M::registry(),
            peers: HashMap::new(),
            timer_queue: Default::default(),
            events: Default::default(),
        };

        Ok(Self {
            core,
            socket_rx,
            timer_data_buffer: Vec::new(),
        })
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts in an attempt to produce an event.
    ///
    /// Returns `None` if no events are available.
    pub fn poll_event(&mut self) -> Option<Event<M>> {
        let ref mut core = self.core;

        if !core.has_events() {
            core.handle_datagrams(&self.socket_rx);

            core.handle_timeouts(&mut self.timer_data_buffer);
        }

        core.pop_event()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts until an event can be returned.
    pub fn wait_event(&mut self) -> Event<M> {
        let ref mut core = self.core;

        loop {
            if let Some(event) = core.pop_event() {
                return event;
            }

            let wait_timeout = core.next_timer_timeout().unwrap_or(IDLE_WAIT_TIMEOUT);

            core.handle_datagrams_wait(&self.socket_rx, wait_timeout);

            core.handle_timeouts(&mut self.timer_data_buffer);
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts until an event can be returned. Waits for a
    /// maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event<M>> {
        let ref mut core = self.core;

        if !core.has_events() {
            let mut remaining_timeout = timeout;
            let mut wait_begin = time::Instant::now();

            loop {
                let wait_timeout = match core.next_timer_timeout() {
                    Some(timer_timeout) => remaining_timeout.min(timer_timeout),
                    None => remaining_timeout,
                };

                core.handle_datagrams_wait(&self.socket_rx, wait_timeout);

                core.handle_timeouts(&mut self.timer_data_buffer);

                if core.has_events() {
                    // Found what we're looking for
                    break;
                }

                let now = time::Instant::now();
                let elapsed_time = now - wait_begin;

                if elapsed_time >= remaining_timeout {
                    // No time left
                    break;
                }

                remaining_timeout -= elapsed_time;
                wait_begin = now;
            }
        }

        core.pop_event()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the number of peers in the peer table.
    ///
    /// *Note*: Peers may exist in the peer table for some time after they have disconnected.
    pub fn peer_count(&self) -> usize {
        self.core.peers.len()
    }
}
