use std::net;
use std::thread;

use saltline::client::{self, Client};
use saltline::server::{self, Server};

static EVENT_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(1000);

fn run_server(mut server: Server) {
    let mut x = 0;

    'outer: loop {
        while let Some(event) = server.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                server::Event::Connect(peer) => {
                    assert!(peer.is_connected());

                    assert_eq!(x, 0);
                    x += 1;
                }
                server::Event::Disconnect(peer) => {
                    assert!(!peer.is_connected());

                    assert_eq!(x, 1);
                    x += 1;

                    break 'outer;
                }
                server::Event::Receive(_, _) => {
                    panic!("server::Event::Receive");
                }
                server::Event::Error(_, kind) => {
                    panic!("server::Event::Error({:?})", kind);
                }
            }
        }
    }

    assert_eq!(x, 2);
}

fn run_client(server_addr: net::SocketAddr) {
    let mut client: Client = Client::connect(server_addr).expect("failed to create client");

    assert_eq!(client.server_addr(), server_addr);
    assert!(!client.is_connected());

    let mut x = 0;

    'outer: loop {
        while let Some(event) = client.wait_event_timeout(EVENT_TIMEOUT) {
            match event {
                client::Event::Connect => {
                    assert!(client.is_connected());

                    client.disconnect();

                    assert_eq!(x, 0);
                    x += 1;
                }
                client::Event::Disconnect => {
                    assert_eq!(x, 1);
                    x += 1;

                    break 'outer;
                }
                client::Event::Receive(_) => {
                    panic!("client::Event::Receive");
                }
                client::Event::Error(kind) => {
                    panic!("client::Event::Error({:?})", kind);
                }
            }
        }
    }

    assert_eq!(x, 2);
}

#[test]
fn connect_disconnect() {
    let server: Server = Server::bind(("127.0.0.1", 0)).expect("failed to create server");
    let server_addr = server.local_addr();

    let server_thread = thread::spawn(move || run_server(server));
    let client_thread = thread::spawn(move || run_client(server_addr));

    server_thread.join().unwrap();
    client_thread.join().unwrap();
}

#[test]
fn handshake_timeout() {
    // Nothing is listening here
    let silent_socket = net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();

    let config = client::Config {
        reliability: saltline::manager::Config {
            handshake_timeout_ms: 1_000,
            ..Default::default()
        },
    };

    let mut client: Client =
        Client::connect_with_config(silent_socket.local_addr().unwrap(), config)
            .expect("failed to create client");

    match client.wait_event_timeout(std::time::Duration::from_secs(5)) {
        Some(client::Event::Error(saltline::ErrorKind::Timeout)) => (),
        other => panic!("expected timeout, got {:?}", other),
    }

    assert!(!client.is_connected());
}

#[test]
fn peer_table_limit() {
    let config = server::Config {
        peer_count_max: 1,
        ..Default::default()
    };

    let mut server: Server =
        Server::bind_with_config(("127.0.0.1", 0), config).expect("failed to create server");
    let server_addr = server.local_addr();

    let mut first: Client = Client::connect(server_addr).unwrap();
    let mut second: Client = Client::connect(server_addr).unwrap();

    let deadline = std::time::Instant::now() + std::time::Duration::from_millis(1500);
    let mut connected = 0;

    while std::time::Instant::now() < deadline {
        if let Some(server::Event::Connect(_)) =
            server.wait_event_timeout(std::time::Duration::from_millis(10))
        {
            connected += 1;
        }

        let _ = first.poll_event();
        let _ = second.poll_event();
    }

    assert_eq!(connected, 1);
    assert_eq!(server.peer_count(), 1);
    assert!(first.is_connected());
    assert!(!second.is_connected());
}
