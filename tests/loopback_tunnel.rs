//! End-to-end loopback test: a rendezvous server plus two in-process clients, forwarding a
//! real TCP connection across the tunnel to a plain echo service. This is the closest a
//! single-host test can get to two NATed peers punching through to each other, since both
//! clients' dial attempts race on real `connect()` calls over `127.0.0.1` rather than anything
//! mocked out.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use holepunch_tunnel::{rendezvous_client, rendezvous_server};

fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port()
}

/// A minimal echo server standing in for "the real local service" one side of the tunnel
/// exposes.
fn spawn_echo_server(port: u16) {
    let listener = TcpListener::bind(("127.0.0.1", port)).expect("echo server must bind its port");
    thread::spawn(move || {
        for incoming in listener.incoming() {
            let mut stream = match incoming {
                Ok(s) => s,
                Err(_) => continue,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
}

fn connect_with_retry(port: u16, deadline: Instant) -> TcpStream {
    loop {
        match TcpStream::connect(("127.0.0.1", port)) {
            Ok(s) => return s,
            Err(e) => {
                assert!(Instant::now() < deadline, "never managed to connect to 127.0.0.1:{}: {}", port, e);
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
}

#[test]
fn forwards_a_tcp_connection_end_to_end_over_the_tunnel() {
    let server_port = free_port();
    thread::Builder::new()
        .name("test-rendezvous-server".into())
        .spawn(move || {
            let _ = rendezvous_server::run(server_port);
        })
        .unwrap();
    // Give the listener a moment to bind before clients race to connect to it.
    thread::sleep(Duration::from_millis(200));

    let accessor_forward_port = free_port();
    let exposer_forward_port = free_port();

    // The "real service" lives behind the exposer side.
    spawn_echo_server(exposer_forward_port);
    thread::sleep(Duration::from_millis(100));

    let timeout_secs = 10;
    thread::Builder::new()
        .name("test-client-accessor".into())
        .spawn(move || {
            let _ = rendezvous_client::run("127.0.0.1", server_port, accessor_forward_port, timeout_secs);
        })
        .unwrap();
    thread::Builder::new()
        .name("test-client-exposer".into())
        .spawn(move || {
            let _ = rendezvous_client::run("127.0.0.1", server_port, exposer_forward_port, timeout_secs);
        })
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(20);
    let mut conn = connect_with_retry(accessor_forward_port, deadline);

    conn.write_all(b"hello through the tunnel").unwrap();
    conn.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    let mut reply = [0u8; "hello through the tunnel".len()];
    conn.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"hello through the tunnel");
}

#[test]
fn resolving_an_unreachable_server_fails_promptly() {
    // A server port nobody is listening on; the client should give up rather than hang forever
    // retrying the control connection itself (the retry budget applies to the post-introduction
    // dial race, not to the very first connect to the rendezvous server).
    let port = free_port();
    let result = rendezvous_client::run("127.0.0.1", port, free_port(), 1);
    assert!(result.is_err());
}
