use std::time;

use saltline::client::{self, Client};
use saltline::server::{self, Server};
use saltline::{RawMessage, SendMode};

static MESSAGE_COUNT: u8 = 5;

fn client_task(server_addr: std::net::SocketAddr) -> Vec<(time::Instant, RawMessage)> {
    // Connect to the server, and receive MESSAGE_COUNT messages. Return the messages as well as
    // the time they were each received.

    let mut client: Client = Client::connect(server_addr).expect("failed to create client");

    match client.wait_event() {
        client::Event::Connect => (),
        event => panic!("expected connect event, got {:?}", event),
    }

    let mut received_messages = Vec::new();

    loop {
        match client.wait_event_timeout(time::Duration::from_millis(200)) {
            Some(client::Event::Receive(message)) => {
                received_messages.push((time::Instant::now(), message));

                if received_messages.len() == MESSAGE_COUNT as usize {
                    return received_messages;
                }
            }
            None => (),
            Some(event) => panic!("expected receive, got {:?}", event),
        }
    }
}

#[test]
fn send_while_blocking() {
    // Spin up a server and spawn a client thread in the background.

    let mut server: Server = Server::bind(("127.0.0.1", 0)).expect("failed to create server");
    let server_addr = server.local_addr();

    let client_thread = std::thread::spawn(move || client_task(server_addr));

    // Wait until the client connects, then send the peer to a background thread and start waiting
    // for events. Send messages periodically to the client from the background thread.

    let mut peer = match server.wait_event() {
        server::Event::Connect(peer) => peer,
        event => panic!("expected connect event, got {:?}", event),
    };

    let blocking_start = time::Instant::now();

    let sender_thread = std::thread::spawn(move || {
        for i in 0..MESSAGE_COUNT {
            std::thread::sleep(time::Duration::from_millis(100));

            peer.send(RawMessage::new(i, vec![i, i, i]), SendMode::Reliable)
                .expect("failed to send message");
        }
    });

    let event = server.wait_event_timeout(time::Duration::from_secs(1));

    assert!(event.is_none());

    let blocking_end = time::Instant::now();

    sender_thread.join().unwrap();

    // Verify that those messages were received by the client while we were blocking.

    let received_messages = client_thread.join().unwrap();

    for (idx, (time, message)) in received_messages.into_iter().enumerate() {
        let i = idx as u8;

        assert_eq!(message, RawMessage::new(i, vec![i, i, i]));

        assert!(time >= blocking_start);
        assert!(time <= blocking_end);
    }
}
