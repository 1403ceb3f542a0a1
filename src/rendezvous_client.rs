//! Client rendezvous driver: register with the server, wait for an introduction or a relay
//! handoff, and — for an introduction — race a public-endpoint dial against a private-endpoint
//! dial, keeping whichever connects first.

use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use net2::TcpStreamExt;

use crate::endpoint::Endpoint;
use crate::error::{ExhaustionError, TransportError};
use crate::forwarder;
use crate::multiplex::spawn_writer;
use crate::protocol::{ClientMessage, ControlStream, ServerMessage};

const RETRY_DELAY: Duration = Duration::from_millis(1000);

/// Runs the client end-to-end: connect, register, wait for the server's decision, punch or
/// relay, then forward forever. Returns only on an unrecoverable transport error.
pub fn run(server_host: &str, server_port: u16, forward_port: u16, timeout_secs: u64) -> Result<(), TransportError> {
    let mut control = connect_and_register(server_host, server_port, false)?;

    loop {
        match control.recv::<ServerMessage>() {
            Ok(Some(ServerMessage::TryConnectToPeer {
                name,
                peer_name,
                public,
                private,
            })) => {
                info!(
                    "registered as {:?}, peer {:?} is at public={} private={}",
                    name, peer_name, public, private
                );
                wait_for_server_close(&mut control);
                // The server only half-closed its side; close ours too rather than merely
                // observing the EOF. Symmetric closure (not just read-side EOF) is what frees
                // the ephemeral port for the dial race below on kernels that key port reuse off
                // full socket teardown, and leaving this open would otherwise leak the fd for
                // the entire forwarding session.
                let _ = control.shutdown();
                let local_port = control
                    .local_addr()
                    .map_err(TransportError::Io)?
                    .port();

                return match race_dial(&public, &private, local_port, timeout_secs) {
                    Ok(stream) => run_forwarder_over(stream, forward_port, Vec::new()),
                    Err(ExhaustionError::BothAttemptsFailed) => {
                        warn!("both public and private dial attempts failed; falling back to relay");
                        relay_fallback(server_host, server_port, forward_port)
                    }
                };
            }
            Ok(Some(ServerMessage::InitiateRelayedCommunication { name, peer_name })) => {
                info!("server initiated relayed communication; name={:?} peer={:?}", name, peer_name);
                let (stream, leftover) = control.into_parts().map_err(TransportError::Io)?;
                return run_forwarder_over(stream, forward_port, leftover);
            }
            Ok(None) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "rendezvous server closed the connection before introducing a peer",
                )));
            }
            Err(e) => {
                warn!("ignoring malformed message from rendezvous server: {}", e);
            }
        }
    }
}

fn connect_and_register(host: &str, port: u16, relay: bool) -> Result<ControlStream, TransportError> {
    let addr = resolve_one(host, port).map_err(TransportError::Connect)?;
    let stream = TcpStream::connect(addr).map_err(TransportError::Connect)?;
    let mut control = ControlStream::new(stream).map_err(TransportError::Io)?;

    let local_addr = control.local_addr().map_err(TransportError::Io)?;
    control
        .send(&ClientMessage::Register {
            local_port: local_addr.port(),
            local_address: local_addr.ip().to_string(),
            relay,
        })
        .map_err(TransportError::Io)?;
    Ok(control)
}

/// Block until the server half-closes the control socket. Some kernels refuse to let us rebind
/// the just-freed ephemeral port for a new outbound connection while the 4-tuple to the
/// rendezvous server is still alive in any state, so this sequencing is load-bearing, not
/// cosmetic.
fn wait_for_server_close(control: &mut ControlStream) {
    use std::io::Read;
    let mut sink = [0u8; 256];
    loop {
        match control.read(&mut sink) {
            Ok(0) => return,
            Ok(_) => continue, // the server isn't expected to send anything else here
            Err(e) => {
                debug!("error while waiting for server to close control socket: {}", e);
                return;
            }
        }
    }
}

fn run_forwarder_over(stream: TcpStream, forward_port: u16, initial_bytes: Vec<u8>) -> Result<(), TransportError> {
    let read_half = stream.try_clone().map_err(TransportError::Io)?;
    let sender = spawn_writer(stream);
    forwarder::run(forward_port, read_half, sender, initial_bytes).map_err(TransportError::Io)
}

fn relay_fallback(server_host: &str, server_port: u16, forward_port: u16) -> Result<(), TransportError> {
    let mut control = connect_and_register(server_host, server_port, true)?;
    loop {
        match control.recv::<ServerMessage>() {
            Ok(Some(ServerMessage::InitiateRelayedCommunication { .. })) => {
                let (stream, leftover) = control.into_parts().map_err(TransportError::Io)?;
                return run_forwarder_over(stream, forward_port, leftover);
            }
            Ok(Some(other)) => {
                warn!("ignoring unexpected message while awaiting relay handoff: {:?}", other);
            }
            Ok(None) => {
                return Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "rendezvous server closed the connection before the relay handoff",
                )));
            }
            Err(e) => {
                warn!("ignoring malformed message while awaiting relay handoff: {}", e);
            }
        }
    }
}

/// Races a dial to `public` against a dial to `private`, both reusing `local_port`. The first
/// to connect wins and cancels the other; if both exhaust their retry budget, the whole race
/// fails.
fn race_dial(public: &Endpoint, private: &Endpoint, local_port: u16, timeout_secs: u64) -> Result<TcpStream, ExhaustionError> {
    let cancel = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();

    for (label, target) in [("public", public.clone()), ("private", private.clone())] {
        let cancel = cancel.clone();
        let tx = tx.clone();
        thread::Builder::new()
            .name(format!("dial-{}", label))
            .spawn(move || {
                let result = dial_with_retry(&target, local_port, timeout_secs, &cancel);
                let _ = tx.send((label, result));
            })
            .expect("failed to spawn dial thread");
    }
    drop(tx);

    let mut winner = None;
    for _ in 0..2 {
        match rx.recv() {
            Ok((label, Ok(stream))) => {
                cancel.store(true, Ordering::SeqCst);
                info!("{} dial attempt won the race", label);
                winner = Some(stream);
                break;
            }
            Ok((label, Err(()))) => {
                debug!("{} dial attempt exhausted its retry budget", label);
            }
            Err(_) => break,
        }
    }

    winner.ok_or(ExhaustionError::BothAttemptsFailed)
}

/// Retries `connect()` toward `target` once per second, rebinding the same reused local port
/// each time, until either it succeeds, `cancel` is set by the winning sibling attempt, or the
/// `timeout_secs` retry budget is exhausted.
fn dial_with_retry(target: &Endpoint, local_port: u16, timeout_secs: u64, cancel: &AtomicBool) -> Result<TcpStream, ()> {
    let target_addr = match resolve_one(&target.host, target.port) {
        Ok(addr) => addr,
        Err(e) => {
            warn!("could not resolve dial target {}: {}", target, e);
            return Err(());
        }
    };
    let attempts = timeout_secs.max(1);

    for attempt in 0..attempts {
        if cancel.load(Ordering::SeqCst) {
            return Err(());
        }
        match connect_reusable(local_port, target_addr) {
            Ok(stream) => {
                let _ = stream.set_keepalive(Some(Duration::from_secs(30)));
                return Ok(stream);
            }
            Err(e) => {
                debug!("dial attempt {} to {} failed: {}", attempt, target, e);
            }
        }

        let wait_until = Instant::now() + RETRY_DELAY;
        while Instant::now() < wait_until {
            if cancel.load(Ordering::SeqCst) {
                return Err(());
            }
            thread::sleep(Duration::from_millis(50));
        }
    }
    Err(())
}

/// Binds a fresh socket to `local_port` with `SO_REUSEADDR`/`SO_REUSEPORT` set, then connects
/// it to `target`. Reusing the exact port we used toward the rendezvous server is what lets the
/// NAT's existing mapping forward the peer's inbound SYN.
fn connect_reusable(local_port: u16, target: SocketAddr) -> io::Result<TcpStream> {
    let bind_addr: SocketAddr = ([0, 0, 0, 0], local_port).into();
    let builder = net2::TcpBuilder::new_v4()?;
    builder.reuse_address(true)?;
    #[cfg(unix)]
    {
        use net2::unix::UnixTcpBuilderExt;
        builder.reuse_port(true)?;
    }
    builder.bind(bind_addr)?;
    builder.connect(target)
}

fn resolve_one(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, format!("could not resolve {}:{}", host, port)))
}
