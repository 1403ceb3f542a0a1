//! Length-prefixed framing and the multi-channel abstraction that rides on top of a single
//! peer socket (direct, NAT-punched, or relayed — the framing does not care which).
//!
//! Wire format of one frame: 14 ASCII decimal digits (the payload length, left-padded with
//! `'0'`), followed by that many payload bytes. The payload's first 36 bytes are a channel id
//! rendered as UUID text; everything after that is the channel's user data.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;

use log::warn;
use uuid::Uuid;

pub const CHANNEL_ID_LEN: usize = 36;
pub const LENGTH_PREFIX_DIGITS: usize = 14;

/// A 36-character channel identifier (canonical UUID text).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(String);

impl ChannelId {
    /// Mint a fresh, (practically) globally-unique channel id.
    pub fn generate() -> Self {
        let text = Uuid::new_v4().to_string();
        debug_assert_eq!(text.len(), CHANNEL_ID_LEN);
        ChannelId(text)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        debug_assert_eq!(bytes.len(), CHANNEL_ID_LEN);
        ChannelId(String::from_utf8_lossy(bytes).into_owned())
    }
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Encode one frame: `pad14(len(channel_id) + len(data)) || channel_id || data`.
pub fn encode_frame(channel_id: &ChannelId, data: &[u8]) -> Vec<u8> {
    let payload_len = CHANNEL_ID_LEN + data.len();
    let mut out = Vec::with_capacity(LENGTH_PREFIX_DIGITS + payload_len);
    out.extend_from_slice(format!("{:0width$}", payload_len, width = LENGTH_PREFIX_DIGITS).as_bytes());
    out.extend_from_slice(channel_id.as_str().as_bytes());
    out.extend_from_slice(data);
    out
}

/// Incrementally parses frames out of a growing receive buffer fed by successive `push`es.
///
/// Malformed frames (a payload declared shorter than a channel id can fit) are logged and
/// skipped rather than killing the connection, per the protocol-error recovery rule: parsing
/// resumes immediately after the malformed frame's declared (undersized) payload, since the
/// sender's length prefix is still self-consistent even when the payload itself is bogus.
pub struct FrameParser {
    buf: Vec<u8>,
}

impl FrameParser {
    pub fn new() -> Self {
        FrameParser { buf: Vec::new() }
    }

    /// Seed the parser with bytes that arrived before this parser existed (used when a control
    /// socket is promoted to a peer multiplex socket mid-stream).
    pub fn with_initial_bytes(bytes: Vec<u8>) -> Self {
        FrameParser { buf: bytes }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Drop everything buffered. Used when a socket is repurposed (e.g. relay takeover).
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Pull the next complete frame out of the buffer, if any, skipping malformed ones along
    /// the way. Returns `None` when more bytes are needed.
    pub fn next_frame(&mut self) -> Option<(ChannelId, Vec<u8>)> {
        loop {
            if self.buf.len() < LENGTH_PREFIX_DIGITS {
                return None;
            }
            let len_digits = &self.buf[..LENGTH_PREFIX_DIGITS];
            let len_str = match std::str::from_utf8(len_digits) {
                Ok(s) => s,
                Err(_) => {
                    warn!("multiplex frame length prefix was not valid ASCII; dropping connection buffer");
                    self.buf.clear();
                    return None;
                }
            };
            let payload_len: usize = match len_str.parse() {
                Ok(n) => n,
                Err(_) => {
                    warn!("multiplex frame length prefix {:?} did not parse as decimal", len_str);
                    self.buf.clear();
                    return None;
                }
            };
            if self.buf.len() < LENGTH_PREFIX_DIGITS + payload_len {
                return None;
            }

            let frame_end = LENGTH_PREFIX_DIGITS + payload_len;
            if payload_len < CHANNEL_ID_LEN {
                warn!(
                    "malformed multiplex frame: payload length {} is shorter than a channel id ({} bytes); skipping",
                    payload_len, CHANNEL_ID_LEN
                );
                self.buf.drain(..frame_end);
                continue;
            }

            let channel_id = ChannelId::from_bytes(&self.buf[LENGTH_PREFIX_DIGITS..LENGTH_PREFIX_DIGITS + CHANNEL_ID_LEN]);
            let data = self.buf[LENGTH_PREFIX_DIGITS + CHANNEL_ID_LEN..frame_end].to_vec();
            self.buf.drain(..frame_end);
            return Some((channel_id, data));
        }
    }
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

/// The write side of a multiplexed peer socket.
///
/// Exclusivity of in-flight writes ("only one frame in flight at a time, gated by a `sending`
/// flag, with the rest queued FIFO") is realized structurally: a single dedicated writer
/// thread owns the socket and drains an ordered channel of already-encoded frames, so there is
/// no flag to maintain and no way for two writes to interleave.
#[derive(Clone)]
pub struct MultiplexSender {
    tx: mpsc::Sender<Vec<u8>>,
}

impl MultiplexSender {
    /// Enqueue a frame for `channel_id` carrying `data`. Never blocks on the network; at most
    /// it blocks briefly to push onto the in-process queue.
    pub fn send(&self, channel_id: &ChannelId, data: &[u8]) -> Result<(), io::Error> {
        self.tx
            .send(encode_frame(channel_id, data))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "multiplex writer thread exited"))
    }
}

/// Spawns the writer thread for `stream` and returns a cloneable handle to enqueue frames.
/// The thread exits (and drops its stream handle) once every `MultiplexSender` clone is
/// dropped and the queue drains.
pub fn spawn_writer(stream: TcpStream) -> MultiplexSender {
    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    thread::Builder::new()
        .name("multiplex-writer".into())
        .spawn(move || {
            let mut stream = stream;
            while let Ok(frame) = rx.recv() {
                if let Err(e) = stream.write_all(&frame) {
                    warn!("multiplex write failed, peer socket is dead: {}", e);
                    break;
                }
            }
        })
        .expect("failed to spawn multiplex writer thread");
    MultiplexSender { tx }
}

/// Blocking read loop: feeds bytes into a `FrameParser` and invokes `on_frame` for each decoded
/// frame, in arrival order. Returns when the stream reaches EOF or a read fails.
pub fn run_receive_loop<F>(mut stream: TcpStream, mut parser: FrameParser, mut on_frame: F) -> io::Result<()>
where
    F: FnMut(ChannelId, Vec<u8>),
{
    // Drain anything seeded into the parser (e.g. leftover control-plane read-ahead bytes)
    // before blocking on the network for more.
    while let Some((id, data)) = parser.next_frame() {
        on_frame(id, data);
    }

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Ok(());
        }
        parser.push(&buf[..n]);
        while let Some((id, data)) = parser.next_frame() {
            on_frame(id, data);
        }
    }
}
