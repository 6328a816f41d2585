use std::io;
use std::net;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use tracing::{debug, error, trace};

use crate::packet::MAX_PACKET_SIZE;

const SOCKET_POLLING_KEY: usize = 0;

/// Number of received datagrams which may be waiting to be processed.
pub const RECEIVE_QUEUE_SIZE: usize = 1024;

// Upper bound on how long the receive thread takes to notice a shutdown
const SHUTDOWN_POLL_INTERVAL: time::Duration = time::Duration::from_millis(50);

/// A received datagram and its sender.
pub type Datagram = (Box<[u8]>, net::SocketAddr);

pub struct SocketTx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
}

pub struct ConnectedSocketTx {
    // Reference to non-blocking socket
    socket: Arc<net::UdpSocket>,
}

pub struct SocketRx {
    // Filled by the receive thread
    receiver: Receiver<Datagram>,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SocketTx {
    pub fn send(&self, packet_bytes: &[u8], addr: &net::SocketAddr) {
        let _ = self.socket.send_to(packet_bytes, addr);
    }
}

impl ConnectedSocketTx {
    pub fn send(&self, packet_bytes: &[u8]) {
        let _ = self.socket.send(packet_bytes);
    }
}

impl SocketRx {
    /// Returns the next received datagram, if one is waiting.
    pub fn try_recv(&self) -> Option<Datagram> {
        match self.receiver.try_recv() {
            Ok(datagram) => Some(datagram),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks for up to `timeout` for a datagram to arrive. Returns `None` if none arrived in
    /// the allotted time.
    pub fn recv_timeout(&self, timeout: time::Duration) -> Option<Datagram> {
        match self.receiver.recv_timeout(timeout) {
            Ok(datagram) => Some(datagram),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => {
                // The receive thread has exited, but the caller still expects to wait
                thread::sleep(timeout);
                None
            }
        }
    }

    pub fn local_addr(&self) -> net::SocketAddr {
        self.local_addr
    }
}

impl Drop for SocketRx {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);

        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn receive_loop(
    socket: Arc<net::UdpSocket>,
    poller: polling::Poller,
    sender: Sender<Datagram>,
    shutdown: Arc<AtomicBool>,
) {
    let mut poller_events = polling::Events::new();

    // One byte of headroom so that oversized datagrams remain detectable
    let mut recv_buffer = vec![0u8; MAX_PACKET_SIZE + 1].into_boxed_slice();

    while !shutdown.load(Ordering::Relaxed) {
        loop {
            match socket.recv_from(&mut recv_buffer) {
                Ok((len, sender_addr)) => {
                    let datagram = (recv_buffer[..len].into(), sender_addr);

                    match sender.try_send(datagram) {
                        Ok(()) => (),
                        Err(TrySendError::Full(_)) => {
                            trace!(%sender_addr, len, "receive queue full, dropping datagram");
                        }
                        Err(TrySendError::Disconnected(_)) => return,
                    }
                }
                Err(err) => match err.kind() {
                    io::ErrorKind::WouldBlock => break,
                    // ICMP errors reported for previously sent datagrams
                    io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::Interrupted => {
                        debug!(%err, "ignoring socket error");
                    }
                    _ => {
                        error!(%err, "socket receive failed");
                        return;
                    }
                },
            }
        }

        // Readable interest must be re-armed prior to each wait() call
        if let Err(err) = poller.modify(&*socket, polling::Event::readable(SOCKET_POLLING_KEY)) {
            error!(%err, "failed to poll socket");
            return;
        }

        poller_events.clear();

        if let Err(err) = poller.wait(&mut poller_events, Some(SHUTDOWN_POLL_INTERVAL)) {
            if err.kind() != io::ErrorKind::Interrupted {
                error!(%err, "failed to poll socket");
                return;
            }
        }
    }
}

fn spawn_rx(socket: &Arc<net::UdpSocket>) -> io::Result<SocketRx> {
    let local_addr = socket.local_addr()?;

    let poller = polling::Poller::new()?;

    unsafe {
        poller.add(&**socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
    }

    let (sender, receiver) = crossbeam_channel::bounded(RECEIVE_QUEUE_SIZE);
    let shutdown = Arc::new(AtomicBool::new(false));

    let thread = {
        let socket = Arc::clone(socket);
        let shutdown = Arc::clone(&shutdown);

        thread::Builder::new()
            .name(format!("saltline-rx-{}", local_addr))
            .spawn(move || receive_loop(socket, poller, sender, shutdown))?
    };

    Ok(SocketRx {
        receiver,
        local_addr,
        shutdown,
        thread: Some(thread),
    })
}

/// Binds a socket which may exchange datagrams with any address.
pub fn bind<A>(bind_address: A) -> io::Result<(SocketTx, SocketRx)>
where
    A: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;

    let socket_rc = Arc::new(socket);

    let rx = spawn_rx(&socket_rc)?;

    let tx = SocketTx { socket: socket_rc };

    Ok((tx, rx))
}

/// Binds a socket which only exchanges datagrams with `connect_address`. Returns the peer's
/// resolved address along with the socket halves.
pub fn connect<A, B>(
    bind_address: A,
    connect_address: B,
) -> io::Result<(ConnectedSocketTx, SocketRx, net::SocketAddr)>
where
    A: net::ToSocketAddrs,
    B: net::ToSocketAddrs,
{
    let socket = net::UdpSocket::bind(bind_address)?;
    socket.set_nonblocking(true)?;
    socket.connect(connect_address)?;

    let peer_addr = socket.peer_addr()?;

    let socket_rc = Arc::new(socket);

    let rx = spawn_rx(&socket_rc)?;

    let tx = ConnectedSocketTx { socket: socket_rc };

    Ok((tx, rx, peer_addr))
}
