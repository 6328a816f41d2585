use std::collections::VecDeque;
use std::net;
use std::time;

use tracing::debug;

use super::manager;
use super::message::{Message, RawMessage};
use super::socket;
use super::Error;
use super::ErrorKind;
use super::SendMode;

// Bounds waits when no timer is pending
const IDLE_WAIT_TIMEOUT: time::Duration = time::Duration::from_millis(1_000);

/// Configuration for a [`Client`] object.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// Timing and retry parameters for the connection.
    pub reliability: manager::Config,
}

impl Config {
    fn validate(&self) {
        self.reliability.validate();
    }
}

/// Represents a client event.
#[derive(Debug)]
pub enum Event<M = RawMessage> {
    /// Produced when a connection to the server has been established.
    Connect,
    /// Produced when the connection terminates gracefully.
    Disconnect,
    /// Produced when a message has been received.
    Receive(M),
    /// Produced in response to a fatal connection error.
    Error(ErrorKind),
}

struct ManagerContext<'a, M> {
    socket_tx: &'a socket::ConnectedSocketTx,
    events: &'a mut VecDeque<Event<M>>,
}

impl<'a, M> manager::HostContext<M> for ManagerContext<'a, M> {
    fn send_packet(&mut self, packet_bytes: &[u8]) {
        self.socket_tx.send(packet_bytes);
    }

    fn on_connect(&mut self) {
        self.events.push_back(Event::Connect);
    }

    fn on_disconnect(&mut self) {
        self.events.push_back(Event::Disconnect);
    }

    fn on_receive(&mut self, message: M) {
        self.events.push_back(Event::Receive(message));
    }

    fn on_error(&mut self, kind: ErrorKind) {
        self.events.push_back(Event::Error(kind));
    }
}

struct ClientCore<M> {
    // Timestamps are computed relative to this instant
    time_ref: time::Instant,
    // Socket send handle
    socket_tx: socket::ConnectedSocketTx,
    // Connection state
    manager: manager::PacketManager<M>,
    // Queue of events
    events: VecDeque<Event<M>>,
}

/// A client connection.
pub struct Client<M = RawMessage> {
    // Interesting client data
    core: ClientCore<M>,
    // Socket receive handle
    socket_rx: socket::SocketRx,
    // Resolved at connection time
    server_addr: net::SocketAddr,
}

impl<M> ClientCore<M>
where
    M: Message,
{
    /// Returns the number of whole milliseconds elapsed since the client object was created.
    fn time_now_ms(&self) -> u64 {
        self.time_ref.elapsed().as_millis() as u64
    }

    fn with_context<F, R>(&mut self, f: F) -> R
    where
        F: FnOnce(&mut manager::PacketManager<M>, &mut ManagerContext<M>, u64) -> R,
    {
        let now_ms = self.time_now_ms();

        let Self {
            manager,
            socket_tx,
            events,
            ..
        } = self;

        let ref mut ctx = ManagerContext { socket_tx, events };

        f(manager, ctx, now_ms)
    }

    /// Returns the time remaining until the next timer expires.
    fn next_timer_timeout(&self) -> Option<time::Duration> {
        let now_ms = self.time_now_ms();

        self.manager
            .next_timer_ms()
            .map(|t_ms| time::Duration::from_millis(t_ms.saturating_sub(now_ms)))
    }

    fn process_timeouts(&mut self) {
        self.with_context(|manager, ctx, now_ms| {
            if let Some(t_ms) = manager.next_timer_ms() {
                if now_ms >= t_ms {
                    manager.handle_timer(now_ms, ctx);
                }
            }
        });
    }

    fn handle_datagram(&mut self, packet_bytes: &[u8]) {
        let result =
            self.with_context(|manager, ctx, now_ms| manager.handle_packet(packet_bytes, now_ms, ctx));

        if let Err(err) = result {
            debug!(%err, "dropping packet from server");
        }
    }

    /// Processes as many datagrams as possible from socket_rx without blocking.
    fn handle_datagrams(&mut self, socket_rx: &socket::SocketRx) {
        while let Some((packet_bytes, _)) = socket_rx.try_recv() {
            self.handle_datagram(&packet_bytes);
        }
    }

    /// Processes as many datagrams as possible from socket_rx, waiting up to `wait_timeout` for
    /// the first.
    fn handle_datagrams_wait(&mut self, socket_rx: &socket::SocketRx, wait_timeout: time::Duration) {
        if let Some((packet_bytes, _)) = socket_rx.recv_timeout(wait_timeout) {
            self.handle_datagram(&packet_bytes);
            // Process any further datagrams without blocking
            self.handle_datagrams(socket_rx);
        }
    }
}

impl<M> Client<M>
where
    M: Message,
{
    /// Equivalent to calling [`Client::connect_with_config`] with default configuration.
    pub fn connect<A>(server_addr: A) -> std::io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        Self::connect_with_config(server_addr, Default::default())
    }

    /// Binds a UDP socket to an ephemeral address, initiates a connection to a server at the
    /// provided address, and returns a new client object. Errors encountered during socket
    /// initialization are forwarded to the caller.
    pub fn connect_with_config<A>(server_addr: A, config: Config) -> std::io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        config.validate();

        let bind_address = (net::Ipv4Addr::UNSPECIFIED, 0);

        let (socket_tx, socket_rx, server_addr) = socket::connect(bind_address, server_addr)?;

        let manager = manager::PacketManager::new(config.reliability, manager::Role::Requester, 0);

        let mut core = ClientCore {
            time_ref: time::Instant::now(),
            socket_tx,
            manager,
            events: VecDeque::new(),
        };

        core.with_context(|manager, ctx, now_ms| manager.connect(now_ms, ctx));

        Ok(Self {
            core,
            socket_rx,
            server_addr,
        })
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts in an attempt to produce an event.
    ///
    /// Returns `None` if no events are available.
    pub fn poll_event(&mut self) -> Option<Event<M>> {
        let ref mut core = self.core;

        if core.events.is_empty() {
            core.handle_datagrams(&self.socket_rx);

            core.process_timeouts();
        }

        core.events.pop_front()
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts until an event can be returned.
    pub fn wait_event(&mut self) -> Event<M> {
        let ref mut core = self.core;

        loop {
            if let Some(event) = core.events.pop_front() {
                return event;
            }

            let wait_timeout = core.next_timer_timeout().unwrap_or(IDLE_WAIT_TIMEOUT);

            core.handle_datagrams_wait(&self.socket_rx, wait_timeout);

            core.process_timeouts();
        }
    }

    /// If any events are ready to be processed, returns the next event immediately. Otherwise,
    /// reads inbound packets and processes timeouts until an event can be returned. Waits for a
    /// maximum duration of `timeout`.
    ///
    /// Returns `None` if no events were available within `timeout`.
    pub fn wait_event_timeout(&mut self, timeout: time::Duration) -> Option<Event<M>> {
        let ref mut core = self.core;

        if core.events.is_empty() {
            let mut remaining_timeout = timeout;
            let mut wait_begin = time::Instant::now();

            loop {
                let wait_timeout = match core.next_timer_timeout() {
                    Some(timer_timeout) => remaining_timeout.min(timer_timeout),
                    None => remaining_timeout,
                };

                core.handle_datagrams_wait(&self.socket_rx, wait_timeout);

                core.process_timeouts();

                if !core.events.is_empty() {
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

        core.events.pop_front()
    }

    /// Equivalent to calling [`Client::enqueue`] followed by [`Client::flush`].
    pub fn send(&mut self, message: M, mode: SendMode) -> Result<(), Error> {
        self.enqueue(message, mode)?;
        self.flush();
        Ok(())
    }

    /// Enqueues a message to be sent. Messages enqueued during the handshake are sent once the
    /// connection has been established.
    ///
    /// Returns [`Error::PacketTooLarge`] if the message cannot fit in a single packet.
    pub fn enqueue(&mut self, message: M, mode: SendMode) -> Result<(), Error> {
        self.core.manager.enqueue(message, mode)
    }

    /// Sends as much data as possible on the underlying socket.
    pub fn flush(&mut self) {
        self.core
            .with_context(|manager, ctx, now_ms| manager.flush(now_ms, ctx));
    }

    /// Disconnects gracefully. No more messages will be sent or received once this function has
    /// been called.
    pub fn disconnect(&mut self) {
        self.core
            .with_context(|manager, ctx, now_ms| manager.disconnect(now_ms, ctx));
    }

    /// Returns true once the handshake has completed, until the connection ends.
    pub fn is_connected(&self) -> bool {
        self.core.manager.is_connected()
    }

    /// Returns a snapshot of this connection's traffic counters.
    pub fn stats(&self) -> manager::Stats {
        self.core.manager.stats()
    }

    /// Returns the local address of the internal UDP socket.
    pub fn local_addr(&self) -> net::SocketAddr {
        self.socket_rx.local_addr()
    }

    /// Returns the server address for this connection.
    pub fn server_addr(&self) -> net::SocketAddr {
        self.server_addr
    }
}
