//! The rendezvous server: accepts client registrations in pairs, then either introduces both
//! clients to each other's public/private endpoints (direct hole-punch path) or bridges their
//! control sockets together (relay fallback path).

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::endpoint::Endpoint;
use crate::error::{CapacityError, TransportError};
use crate::protocol::{ClientMessage, ControlStream, PeerName, ServerMessage};

/// How often a parked (not-yet-paired) client's watcher thread wakes up to check whether it
/// has been told to stand down. Also the worst-case extra latency paid before a relay bridge
/// can safely start reading a socket the watcher was also reading.
const WATCH_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// One registered-but-not-yet-consumed client: its writable socket, anything already buffered
/// by its control-plane reader beyond the parsed `register` message, and the endpoints it
/// reported.
#[derive(Debug)]
struct SlotHandle {
    stream: TcpStream,
    leftover: Vec<u8>,
    public: Endpoint,
    private: Endpoint,
    relay: bool,
    retire: Arc<AtomicBool>,
    watcher: thread::JoinHandle<()>,
}

/// Exactly two optional slots. Process-wide mutable state, serialized by the mutex that wraps
/// it; every mutation happens in response to a server I/O event (`register` or disconnect).
#[derive(Default)]
struct ClientPair {
    slot_a: Option<SlotHandle>,
    slot_b: Option<SlotHandle>,
}

impl ClientPair {
    fn contains_public(&self, ep: &Endpoint) -> bool {
        self.slot_a.as_ref().map_or(false, |h| &h.public == ep) || self.slot_b.as_ref().map_or(false, |h| &h.public == ep)
    }

    fn complete(&self) -> bool {
        self.slot_a.is_some() && self.slot_b.is_some()
    }

    fn insert(&mut self, handle: SlotHandle) -> Result<PeerName, (SlotHandle, CapacityError)> {
        if self.slot_a.is_none() {
            self.slot_a = Some(handle);
            Ok(PeerName::A)
        } else if self.slot_b.is_none() {
            self.slot_b = Some(handle);
            Ok(PeerName::B)
        } else {
            Err((handle, CapacityError::PairFull))
        }
    }

    fn take_both(&mut self) -> (SlotHandle, SlotHandle) {
        (
            self.slot_a.take().expect("pair complete implies slot_a filled"),
            self.slot_b.take().expect("pair complete implies slot_b filled"),
        )
    }

    fn remove_by_public(&mut self, ep: &Endpoint) -> bool {
        if self.slot_a.as_ref().map_or(false, |h| &h.public == ep) {
            self.slot_a = None;
            true
        } else if self.slot_b.as_ref().map_or(false, |h| &h.public == ep) {
            self.slot_b = None;
            true
        } else {
            false
        }
    }
}

type SharedPair = Arc<Mutex<ClientPair>>;

/// Binds `port` and serves forever. A listener error is fatal to the process, per the error
/// handling design; a per-connection error only tears down that one connection.
pub fn run(port: u16) -> Result<(), TransportError> {
    let listener = TcpListener::bind(("0.0.0.0", port)).map_err(TransportError::Bind)?;
    info!("rendezvous server listening on port {}", port);
    let pair: SharedPair = Arc::new(Mutex::new(ClientPair::default()));

    for incoming in listener.incoming() {
        let stream = incoming.map_err(TransportError::Io)?;
        let pair = pair.clone();
        thread::Builder::new()
            .name("rendezvous-conn".into())
            .spawn(move || handle_connection(stream, pair))
            .expect("failed to spawn connection handler thread");
    }
    Ok(())
}

fn handle_connection(stream: TcpStream, pair: SharedPair) {
    let mut control = match ControlStream::new(stream) {
        Ok(c) => c,
        Err(e) => {
            warn!("failed to wrap incoming connection: {}", e);
            return;
        }
    };

    loop {
        match control.recv::<ClientMessage>() {
            Ok(Some(ClientMessage::Register {
                local_port,
                local_address,
                relay,
            })) => {
                if local_address.is_empty() || local_port == 0 {
                    error!("malformed register (missing local address/port); closing connection");
                    return;
                }
                let public: Endpoint = match control.peer_addr() {
                    Ok(addr) => addr.into(),
                    Err(e) => {
                        error!("could not determine remote address of registering socket: {}", e);
                        return;
                    }
                };
                let private = Endpoint::new(local_address, local_port);

                match register(&pair, control, public, private, relay) {
                    RegisterOutcome::KeepReading(returned) => {
                        control = returned;
                        continue;
                    }
                    RegisterOutcome::Done => return,
                }
            }
            Ok(Some(_other)) => {
                // No other command variants exist on the wire today; unreachable in practice.
            }
            Ok(None) => return,
            Err(e) => {
                warn!("ignoring malformed message from a client: {}", e);
            }
        }
    }
}

enum RegisterOutcome {
    /// A duplicate (idempotent) registration; this thread keeps reading the same socket.
    KeepReading(ControlStream),
    /// The socket's fate (closed, handed to a watcher, or consumed by pair completion) has been
    /// decided; this thread's job is over.
    Done,
}

fn register(pair: &SharedPair, control: ControlStream, public: Endpoint, private: Endpoint, relay: bool) -> RegisterOutcome {
    {
        let guard = pair.lock().expect("pair mutex poisoned");
        if guard.contains_public(&public) {
            info!("duplicate registration from {}; treating as idempotent no-op", public);
            return RegisterOutcome::KeepReading(control);
        }
    }

    let (raw_stream, leftover) = match control.into_parts() {
        Ok(parts) => parts,
        Err(e) => {
            error!("failed to take ownership of control socket for {}: {}", public, e);
            return RegisterOutcome::Done;
        }
    };

    let watcher_stream = match raw_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to clone control socket for {}: {}", public, e);
            return RegisterOutcome::Done;
        }
    };
    if let Err(e) = watcher_stream.set_read_timeout(Some(WATCH_POLL_INTERVAL)) {
        warn!("failed to set watcher read timeout for {}: {}", public, e);
    }

    let slot_stream = match raw_stream.try_clone() {
        Ok(s) => s,
        Err(e) => {
            error!("failed to clone control socket for {}: {}", public, e);
            return RegisterOutcome::Done;
        }
    };

    let retire = Arc::new(AtomicBool::new(false));
    let watcher = {
        let pair = pair.clone();
        let public = public.clone();
        let retire = retire.clone();
        thread::Builder::new()
            .name("rendezvous-watch".into())
            .spawn(move || watch_for_disconnect(watcher_stream, pair, public, retire))
            .expect("failed to spawn disconnect watcher thread")
    };

    let handle = SlotHandle {
        stream: slot_stream,
        leftover,
        public: public.clone(),
        private,
        relay,
        retire,
        watcher,
    };

    let mut guard = pair.lock().expect("pair mutex poisoned");
    if guard.contains_public(&public) {
        info!("duplicate registration from {} raced with another thread; dropping the later one", public);
        handle.retire.store(true, Ordering::SeqCst);
        drop(guard);
        let _ = handle.watcher.join();
        let mut s = handle.stream;
        let _ = s.shutdown(Shutdown::Both);
        return RegisterOutcome::Done;
    }

    match guard.insert(handle) {
        Err((returned_handle, CapacityError::PairFull)) => {
            error!("rejecting registration from {}: pair already has two registered clients", public);
            drop(guard);
            returned_handle.retire.store(true, Ordering::SeqCst);
            let _ = returned_handle.watcher.join();
            let mut s = returned_handle.stream;
            let _ = s.shutdown(Shutdown::Both);
            RegisterOutcome::Done
        }
        Ok(_name) => {
            if guard.complete() {
                let (a, b) = guard.take_both();
                drop(guard);
                finish_pair(a, b, relay);
            }
            RegisterOutcome::Done
        }
    }
}

fn watch_for_disconnect(mut stream: TcpStream, pair: SharedPair, public: Endpoint, retire: Arc<AtomicBool>) {
    let mut buf = [0u8; 256];
    loop {
        if retire.load(Ordering::SeqCst) {
            return;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                info!("{} disconnected before a peer arrived; freeing its slot", public);
                pair.lock().expect("pair mutex poisoned").remove_by_public(&public);
                return;
            }
            Ok(_) => {
                debug!("unexpected bytes from {} while it awaits a peer; ignoring", public);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut => {
                continue;
            }
            Err(e) => {
                warn!("error watching {} for disconnect: {}", public, e);
                pair.lock().expect("pair mutex poisoned").remove_by_public(&public);
                return;
            }
        }
    }
}

/// Runs once a pair completes: decides relay vs. direct based on the flag of the registration
/// that just completed it, notifies both clients, and then either closes both sockets (direct
/// path — mandatory so both clients can rebind their ephemeral port) or bridges them forever
/// (relay path).
fn finish_pair(a: SlotHandle, b: SlotHandle, relay: bool) {
    a.retire.store(true, Ordering::SeqCst);
    b.retire.store(true, Ordering::SeqCst);
    // Join before touching either stream: otherwise the relay bridge below could race the
    // watcher thread for the same inbound bytes.
    let _ = a.watcher.join();
    let _ = b.watcher.join();

    let mut stream_a = a.stream;
    let mut stream_b = b.stream;

    if relay {
        info!("pair complete; bridging via relay");
        let msg_a = ServerMessage::InitiateRelayedCommunication {
            name: PeerName::A,
            peer_name: PeerName::B,
        };
        let msg_b = ServerMessage::InitiateRelayedCommunication {
            name: PeerName::B,
            peer_name: PeerName::A,
        };
        if let Err(e) = write_message(&mut stream_a, &msg_a) {
            warn!("failed to notify A of relay handoff: {}", e);
        }
        if let Err(e) = write_message(&mut stream_b, &msg_b) {
            warn!("failed to notify B of relay handoff: {}", e);
        }
        bridge_relay(stream_a, a.leftover, stream_b, b.leftover);
    } else {
        info!("pair complete; introducing A and B to each other's endpoints");
        let msg_a = ServerMessage::TryConnectToPeer {
            name: PeerName::A,
            peer_name: PeerName::B,
            public: b.public.clone(),
            private: b.private.clone(),
        };
        let msg_b = ServerMessage::TryConnectToPeer {
            name: PeerName::B,
            peer_name: PeerName::A,
            public: a.public.clone(),
            private: a.private.clone(),
        };
        if let Err(e) = write_message(&mut stream_a, &msg_a) {
            warn!("failed to notify A of its peer: {}", e);
        }
        if let Err(e) = write_message(&mut stream_b, &msg_b) {
            warn!("failed to notify B of its peer: {}", e);
        }
        // Mandatory: some kernels refuse to let a client rebind its just-freed ephemeral port
        // for a new outbound connection unless the server itself closed this socket first.
        let _ = stream_a.shutdown(Shutdown::Both);
        let _ = stream_b.shutdown(Shutdown::Both);
    }
}

fn write_message<T: serde::Serialize>(stream: &mut TcpStream, msg: &T) -> io::Result<()> {
    let bytes = serde_json::to_vec(msg).expect("server messages are always serializable");
    stream.write_all(&bytes)
}

/// Bridges two control sockets bidirectionally, raw bytes, forever (until either side closes).
/// Flushes each side's already-buffered-but-unparsed bytes into the other side first, so a
/// `register` write that was only partially received at handoff time is not lost.
fn bridge_relay(stream_a: TcpStream, leftover_a: Vec<u8>, stream_b: TcpStream, leftover_b: Vec<u8>) {
    let mut stream_a_w = match stream_a.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to clone A's stream for relay: {}", e);
            return;
        }
    };
    let mut stream_b_w = match stream_b.try_clone() {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to clone B's stream for relay: {}", e);
            return;
        }
    };

    if !leftover_a.is_empty() {
        let _ = stream_b_w.write_all(&leftover_a);
    }
    if !leftover_b.is_empty() {
        let _ = stream_a_w.write_all(&leftover_b);
    }

    let mut a_reader = stream_a;
    let mut b_writer = stream_b_w;
    let a_to_b = thread::Builder::new()
        .name("relay-a-to-b".into())
        .spawn(move || {
            let _ = io::copy(&mut a_reader, &mut b_writer);
            let _ = b_writer.shutdown(Shutdown::Both);
        })
        .expect("failed to spawn relay thread");

    let mut b_reader = stream_b;
    let mut a_writer = stream_a_w;
    let b_to_a = thread::Builder::new()
        .name("relay-b-to-a".into())
        .spawn(move || {
            let _ = io::copy(&mut b_reader, &mut a_writer);
            let _ = a_writer.shutdown(Shutdown::Both);
        })
        .expect("failed to spawn relay thread");

    let _ = a_to_b.join();
    let _ = b_to_a.join();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener as StdTcpListener;

    fn loopback_stream() -> TcpStream {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (_server, _) = listener.accept().unwrap();
        client
    }

    fn dummy_slot(public: Endpoint) -> SlotHandle {
        SlotHandle {
            stream: loopback_stream(),
            leftover: Vec::new(),
            public,
            private: Endpoint::new("10.0.0.1", 1),
            relay: false,
            retire: Arc::new(AtomicBool::new(true)),
            watcher: thread::spawn(|| {}),
        }
    }

    #[test]
    fn first_registration_takes_slot_a() {
        let mut pair = ClientPair::default();
        let name = pair.insert(dummy_slot(Endpoint::new("1.1.1.1", 1))).unwrap();
        assert_eq!(name, PeerName::A);
        assert!(!pair.complete());
    }

    #[test]
    fn second_distinct_registration_completes_the_pair() {
        let mut pair = ClientPair::default();
        pair.insert(dummy_slot(Endpoint::new("1.1.1.1", 1))).unwrap();
        let name = pair.insert(dummy_slot(Endpoint::new("2.2.2.2", 2))).unwrap();
        assert_eq!(name, PeerName::B);
        assert!(pair.complete());
    }

    #[test]
    fn duplicate_public_endpoint_is_detected_before_insert() {
        let mut pair = ClientPair::default();
        let ep = Endpoint::new("1.1.1.1", 1);
        pair.insert(dummy_slot(ep.clone())).unwrap();
        assert!(pair.contains_public(&ep));
    }

    #[test]
    fn third_registration_is_rejected_for_capacity() {
        let mut pair = ClientPair::default();
        pair.insert(dummy_slot(Endpoint::new("1.1.1.1", 1))).unwrap();
        pair.insert(dummy_slot(Endpoint::new("2.2.2.2", 2))).unwrap();
        let result = pair.insert(dummy_slot(Endpoint::new("3.3.3.3", 3)));
        assert!(result.is_err());
    }

    #[test]
    fn remove_by_public_empties_only_the_matching_slot() {
        let mut pair = ClientPair::default();
        let ep_a = Endpoint::new("1.1.1.1", 1);
        pair.insert(dummy_slot(ep_a.clone())).unwrap();
        assert!(pair.remove_by_public(&ep_a));
        assert!(!pair.complete());
        assert!(!pair.contains_public(&ep_a));
    }
}
