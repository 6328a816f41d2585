use saltline::client::Client;
use saltline::server::{PeerHandle, Server};
use saltline::RawMessage;

fn assert_send<T: Send>() {}
fn assert_sync<T: Sync>() {}

#[test]
fn handles_are_thread_safe() {
    assert_send::<Client<RawMessage>>();
    assert_send::<Server<RawMessage>>();
    assert_send::<PeerHandle<RawMessage>>();
    assert_sync::<PeerHandle<RawMessage>>();
}

#[test]
fn client_send() {
    let socket = std::net::UdpSocket::bind(("127.0.0.1", 0)).unwrap();

    // Create client object in main thread to verify it implements Send
    let mut client: Client = Client::connect(socket.local_addr().unwrap())
        .expect("failed to create client");

    let thread = std::thread::spawn(move || {
        client.poll_event();
    });

    thread.join().unwrap();
}

#[test]
fn server_send() {
    // Create server object in main thread to verify it implements Send
    let mut server: Server =
        Server::bind(("127.0.0.1", 0)).expect("failed to create server");

    let thread = std::thread::spawn(move || {
        server.poll_event();
    });

    thread.join().unwrap();
}
