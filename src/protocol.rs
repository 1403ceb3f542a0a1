//! The control-plane protocol spoken between a client and the rendezvous server: JSON
//! objects written back-to-back on the same TCP connection, with no delimiter between them.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::TcpStream;

use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};

use crate::endpoint::Endpoint;
use crate::error::ProtocolError;

/// Which half of a pair a client is. Mirrors the server's slot assignment back to the client
/// so log lines and any future diagnostics can refer to "A" and "B" instead of raw addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerName {
    A,
    B,
}

impl PeerName {
    pub fn other(self) -> PeerName {
        match self {
            PeerName::A => PeerName::B,
            PeerName::B => PeerName::A,
        }
    }
}

/// Messages a client sends to the rendezvous server.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ClientMessage {
    #[serde(rename = "register")]
    Register {
        #[serde(rename = "localPort")]
        local_port: u16,
        #[serde(rename = "localAddress")]
        local_address: String,
        #[serde(default)]
        relay: bool,
    },
}

/// Messages the rendezvous server sends to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "command")]
pub enum ServerMessage {
    #[serde(rename = "tryConnectToPeer")]
    TryConnectToPeer {
        name: PeerName,
        #[serde(rename = "peerName")]
        peer_name: PeerName,
        public: Endpoint,
        private: Endpoint,
    },
    #[serde(rename = "initiateRelayedCommunication")]
    InitiateRelayedCommunication {
        name: PeerName,
        #[serde(rename = "peerName")]
        peer_name: PeerName,
    },
}

/// A buffered reader/writer over a control-plane TCP socket.
///
/// Incoming messages are undelimited JSON values; `serde_json`'s streaming deserializer reads
/// exactly as many bytes as one value needs and leaves the rest sitting in the `BufReader`.
/// When the control socket is about to be repurposed as a peer multiplex socket (relay
/// fallback) or handed off entirely, `into_parts` recovers both the raw stream and whatever
/// bytes `BufReader` had already read ahead, so nothing already on the wire is lost.
pub struct ControlStream {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
}

impl ControlStream {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        let writer = stream.try_clone()?;
        Ok(ControlStream {
            reader: BufReader::new(stream),
            writer,
        })
    }

    /// Read and parse the next JSON value as `T`.
    ///
    /// A JSON parse failure is reported as a `ProtocolError` so the caller can log it and
    /// continue reading, per the spec's "malformed message is a no-op" rule — it does not
    /// tear down the connection. Returns `Ok(None)` on clean EOF.
    pub fn recv<T: DeserializeOwned>(&mut self) -> Result<Option<T>, ProtocolError> {
        // Detect EOF up front: `Deserializer::from_reader` would otherwise report a generic
        // "EOF while parsing a value" error indistinguishable from a truncated message.
        match self.reader.fill_buf() {
            Ok(buf) if buf.is_empty() => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(ProtocolError::Io(e)),
        }
        let mut de = serde_json::Deserializer::from_reader(&mut self.reader);
        match T::deserialize(&mut de) {
            Ok(value) => Ok(Some(value)),
            Err(e) => Err(ProtocolError::MalformedJson(e)),
        }
    }

    pub fn send<T: serde::Serialize>(&mut self, msg: &T) -> io::Result<()> {
        let bytes = serde_json::to_vec(msg).expect("control messages are always serializable");
        self.writer.write_all(&bytes)
    }

    /// Half-close then fully close the socket from this side.
    ///
    /// Some kernels refuse to let a client rebind its just-freed ephemeral port for a new
    /// outbound connection while the 4-tuple to the rendezvous server is still alive in any
    /// state; the server must end the socket itself rather than merely stop writing to it.
    pub fn shutdown(&mut self) -> io::Result<()> {
        self.writer.shutdown(std::net::Shutdown::Both)
    }

    pub fn peer_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.writer.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.writer.local_addr()
    }

    /// Recover the raw stream plus any bytes already buffered ahead of the last parsed value.
    ///
    /// Uses `BufReader::buffer()`, not `fill_buf()`: once `recv` has drained the buffer down to
    /// empty, `fill_buf()` would issue a fresh blocking read, which hangs forever when the peer
    /// has nothing left to send until after this call returns (exactly the case right after a
    /// single `register` write). `buffer()` only reports what is already sitting in memory.
    pub fn into_parts(self) -> io::Result<(TcpStream, Vec<u8>)> {
        let leftover = self.reader.buffer().to_vec();
        Ok((self.reader.into_inner(), leftover))
    }
}

impl Read for ControlStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_back_to_back_json_values_with_no_delimiter() {
        let mut payload = Vec::new();
        payload.extend_from_slice(
            br#"{"command":"register","localPort":4242,"localAddress":"10.0.0.2","relay":false}"#,
        );
        payload.extend_from_slice(br#"{"command":"register","localPort":1,"localAddress":"x"}"#);

        let mut de = serde_json::Deserializer::from_reader(Cursor::new(&payload[..]));
        let first: ClientMessage = serde::Deserialize::deserialize(&mut de).unwrap();
        match first {
            ClientMessage::Register {
                local_port,
                local_address,
                relay,
            } => {
                assert_eq!(local_port, 4242);
                assert_eq!(local_address, "10.0.0.2");
                assert!(!relay);
            }
        }
    }

    #[test]
    fn relay_defaults_to_false_when_absent() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"command":"register","localPort":1,"localAddress":"a"}"#)
                .unwrap();
        match msg {
            ClientMessage::Register { relay, .. } => assert!(!relay),
        }
    }

    #[test]
    fn peer_name_round_trips_through_json() {
        let msg = ServerMessage::TryConnectToPeer {
            name: PeerName::A,
            peer_name: PeerName::B,
            public: Endpoint::new("1.2.3.4", 1000),
            private: Endpoint::new("10.0.0.1", 2000),
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"tryConnectToPeer\""));
        assert!(json.contains("\"A\""));
        let back: ServerMessage = serde_json::from_str(&json).unwrap();
        match back {
            ServerMessage::TryConnectToPeer { name, peer_name, .. } => {
                assert_eq!(name, PeerName::A);
                assert_eq!(peer_name, PeerName::B);
            }
            _ => panic!("wrong variant"),
        }
    }
}
