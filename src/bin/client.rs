use saltline::client::{Client, Config, Event};
use saltline::{RawMessage, SendMode};

static EVENT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let mut client: Client<RawMessage> =
        Client::connect_with_config(("127.0.0.1", 8888), Config::default())
            .expect("failed to create saltline client");

    let mut counter = 0u8;

    loop {
        let message = RawMessage::new(0x01, vec![counter, 0x01, 0x02]);
        counter = counter.wrapping_add(1);

        if let Err(err) = client.send(message, SendMode::Reliable) {
            tracing::warn!(%err, "failed to send message");
        }

        while let Some(event) = client.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                Event::Connect => {
                    tracing::info!(server = %client.server_addr(), "connected");
                }
                Event::Disconnect => {
                    tracing::info!("disconnected");
                    return;
                }
                Event::Receive(message) => {
                    tracing::info!(tag = message.tag, data = ?message.data, "received echo");
                }
                Event::Error(kind) => {
                    tracing::warn!(?kind, "connection failed");
                    return;
                }
            }
        }

        tracing::debug!(stats = ?client.stats(), "no event after {}ms", EVENT_TIMEOUT.as_millis());
    }
}
