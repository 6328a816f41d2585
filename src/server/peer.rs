use std::any;
use std::collections::VecDeque;
use std::fmt;
use std::net;
use std::sync::Arc;
use std::time;

use parking_lot::Mutex;

use crate::manager::{self, PacketManager, Phase, Role, TimeoutAction};
use crate::message::Message;
use crate::socket;
use crate::timer_queue;
use crate::{Error, ErrorKind, SendMode};

use super::Event;

pub type EventQueue<M> = Arc<Mutex<VecDeque<Event<M>>>>;

struct PeerCore<M> {
    // Remote address
    addr: net::SocketAddr,
    // Independent user data associated with this peer
    data: Option<Arc<dyn any::Any + Send + Sync>>,
    // Server timestamps are computed relative to this instant
    time_ref: time::Instant,
    // Permits sending packets from a peer handle
    socket_tx: Arc<socket::SocketTx>,
    // Next time the manager's timer should be handled
    timer_ms: Option<u64>,
    // Permits signaling events from a peer handle
    events: EventQueue<M>,
}

pub struct Peer<M> {
    // Peer metadata
    core: PeerCore<M>,
    // Connection state for this peer
    manager: PacketManager<M>,
}

impl<M> PeerCore<M> {
    fn time_now_ms(&self) -> u64 {
        self.time_ref.elapsed().as_millis() as u64
    }

    fn push_event(&self, event: Event<M>) {
        self.events.lock().push_back(event);
    }
}

impl<M> Peer<M>
where
    M: Message,
{
    pub fn new(
        addr: net::SocketAddr,
        config: manager::Config,
        time_ref: time::Instant,
        socket_tx: Arc<socket::SocketTx>,
        events: EventQueue<M>,
    ) -> Self {
        let core = PeerCore {
            addr,
            data: None,
            time_ref,
            socket_tx,
            timer_ms: None,
            events,
        };

        let manager = PacketManager::new(config, Role::Acceptor, core.time_now_ms());

        Self { core, manager }
    }

    pub fn addr(&self) -> &net::SocketAddr {
        &self.core.addr
    }

    pub fn phase(&self) -> Phase {
        self.manager.phase()
    }

    pub fn salt(&self) -> u64 {
        self.manager.salt()
    }
}

struct ManagerContext<'a, M> {
    peer: &'a mut PeerCore<M>,
    peer_ref: &'a PeerRef<M>,
}

impl<'a, M> ManagerContext<'a, M> {
    fn handle(&self) -> PeerHandle<M> {
        PeerHandle::new(Arc::clone(self.peer_ref))
    }
}

impl<'a, M> manager::HostContext<M> for ManagerContext<'a, M> {
    fn send_packet(&mut self, packet_bytes: &[u8]) {
        self.peer.socket_tx.send(packet_bytes, &self.peer.addr);
    }

    fn on_connect(&mut self) {
        self.peer.push_event(Event::Connect(self.handle()));
    }

    fn on_disconnect(&mut self) {
        self.peer.push_event(Event::Disconnect(self.handle()));
    }

    fn on_receive(&mut self, message: M) {
        self.peer.push_event(Event::Receive(self.handle(), message));
    }

    fn on_error(&mut self, kind: ErrorKind) {
        self.peer.push_event(Event::Error(self.handle(), kind));
    }
}

pub type PeerRef<M> = Arc<Mutex<Peer<M>>>;

impl<M> timer_queue::Timer for Mutex<Peer<M>> {
    fn is_due(&self, now_ms: u64) -> bool {
        match self.lock().core.timer_ms {
            Some(t) => t <= now_ms,
            None => false,
        }
    }
}

/// Runs `f` against a peer's manager while holding the peer's lock, then reschedules its timer.
fn with_context<M, F, R>(peer_ref: &PeerRef<M>, f: F) -> R
where
    M: Message,
    F: FnOnce(&mut PacketManager<M>, &mut ManagerContext<M>, u64) -> R,
{
    let ref mut peer = *peer_ref.lock();

    let Peer { core, manager } = peer;

    let now_ms = core.time_now_ms();

    let result = {
        let ref mut ctx = ManagerContext {
            peer: &mut *core,
            peer_ref,
        };

        f(manager, ctx, now_ms)
    };

    core.timer_ms = match manager.phase() {
        // Due immediately, so that the server may drop it from the peer table
        Phase::Disconnected => Some(now_ms),
        _ => manager.next_timer_ms(),
    };

    result
}

/// Represents a client connection.
pub struct PeerHandle<M> {
    peer: PeerRef<M>,
}

impl<M> Clone for PeerHandle<M> {
    fn clone(&self) -> Self {
        Self {
            peer: Arc::clone(&self.peer),
        }
    }
}

impl<M> PeerHandle<M> {
    pub(super) fn new(peer: PeerRef<M>) -> Self {
        Self { peer }
    }

    /// Returns the user data associated with this peer.
    pub fn data(&self) -> Option<Arc<dyn any::Any + Send + Sync>> {
        self.peer.lock().core.data.clone()
    }

    /// Associates user data with this peer.
    pub fn set_data(&self, data: Option<Arc<dyn any::Any + Send + Sync>>) {
        self.peer.lock().core.data = data;
    }

    /// Returns the remote address of this peer.
    pub fn addr(&self) -> net::SocketAddr {
        self.peer.lock().core.addr
    }
}

impl<M> PeerHandle<M>
where
    M: Message,
{
    /// Equivalent to calling [`PeerHandle::enqueue`] followed by [`PeerHandle::flush`].
    ///
    /// *Note*: When sending many messages, it is more efficient to call `enqueue` multiple times
    /// followed by a final call to `flush`, as messages are packed into as few packets as
    /// possible.
    pub fn send(&mut self, message: M, mode: SendMode) -> Result<(), Error> {
        with_context(&self.peer, |manager, ctx, now_ms| -> Result<(), Error> {
            manager.enqueue(message, mode)?;
            manager.flush(now_ms, ctx);
            Ok(())
        })
    }

    /// Enqueues a message to be sent to this peer.
    ///
    /// Returns [`Error::PacketTooLarge`] if the message cannot fit in a single packet.
    pub fn enqueue(&mut self, message: M, mode: SendMode) -> Result<(), Error> {
        self.peer.lock().manager.enqueue(message, mode)
    }

    /// Sends all queued messages for this peer on the underlying socket.
    pub fn flush(&mut self) {
        with_context(&self.peer, |manager, ctx, now_ms| manager.flush(now_ms, ctx));
    }

    /// Disconnects this peer gracefully. No more messages will be sent or received once this
    /// function has been called.
    pub fn disconnect(&mut self) {
        with_context(&self.peer, |manager, ctx, now_ms| {
            manager.disconnect(now_ms, ctx)
        });
    }

    /// Returns true once the handshake has completed, until the connection ends.
    pub fn is_connected(&self) -> bool {
        self.peer.lock().manager.is_connected()
    }

    /// Returns a snapshot of this connection's traffic counters.
    pub fn stats(&self) -> manager::Stats {
        self.peer.lock().manager.stats()
    }
}

impl<M> PartialEq for PeerHandle<M> {
    fn eq(&self, other: &PeerHandle<M>) -> bool {
        Arc::ptr_eq(&self.peer, &other.peer)
    }
}

impl<M> Eq for PeerHandle<M> {}

impl<M> fmt::Debug for PeerHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerHandle")
            .field("addr", &self.addr())
            .finish()
    }
}

pub fn accept<M>(peer_ref: &PeerRef<M>, salt: u64)
where
    M: Message,
{
    with_context(peer_ref, |manager, ctx, now_ms| manager.accept(salt, now_ms, ctx));
}

pub fn handle_packet<M>(peer_ref: &PeerRef<M>, packet_bytes: &[u8]) -> Result<(), Error>
where
    M: Message,
{
    with_context(peer_ref, |manager, ctx, now_ms| {
        manager.handle_packet(packet_bytes, now_ms, ctx)
    })
}

pub fn disconnect<M>(peer_ref: &PeerRef<M>)
where
    M: Message,
{
    with_context(peer_ref, |manager, ctx, now_ms| manager.disconnect(now_ms, ctx));
}

pub fn handle_timer<M>(peer_ref: &PeerRef<M>) -> TimeoutAction
where
    M: Message,
{
    let ref mut peer = *peer_ref.lock();

    let Peer { core, manager } = peer;

    let now_ms = core.time_now_ms();

    let action = {
        let ref mut ctx = ManagerContext {
            peer: &mut *core,
            peer_ref,
        };

        manager.handle_timer(now_ms, ctx)
    };

    core.timer_ms = match action {
        TimeoutAction::Continue => manager.next_timer_ms(),
        TimeoutAction::Terminate => None,
    };

    action
}
