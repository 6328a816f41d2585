use saltline::server::{Config, Event, Server};
use saltline::{RawMessage, SendMode};

static EVENT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = Config {
        peer_count_max: 4,
        ..Default::default()
    };

    let mut server: Server<RawMessage> = Server::bind_with_config(("127.0.0.1", 8888), config)
        .expect("failed to create saltline server");

    tracing::info!(addr = %server.local_addr(), "echo server listening");

    loop {
        while let Some(event) = server.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                Event::Connect(peer) => {
                    tracing::info!(addr = %peer.addr(), "peer connected");
                }
                Event::Disconnect(peer) => {
                    tracing::info!(addr = %peer.addr(), "peer disconnected");
                }
                Event::Receive(mut peer, message) => {
                    tracing::info!(addr = %peer.addr(), tag = message.tag, data = ?message.data, "echoing message");

                    if let Err(err) = peer.send(message, SendMode::Reliable) {
                        tracing::warn!(%err, "failed to echo message");
                    }
                }
                Event::Error(peer, kind) => {
                    tracing::warn!(addr = %peer.addr(), ?kind, "peer connection failed");
                }
            }
        }
    }
}
