//! Error kinds, per the error-handling design: one enum per error class, `quick_error`-defined
//! in the idiom the rest of this lineage uses rather than pulled in from a generic crate.

use std::io;

use quick_error::quick_error;

quick_error! {
    /// Fatal at startup: a missing or malformed command-line flag.
    #[derive(Debug)]
    pub enum ConfigError {
        MissingFlag(name: &'static str) {
            display("missing required flag: --{}", name)
        }
        InvalidPort(raw: String) {
            display("invalid port (must be 1..65535): {:?}", raw)
        }
    }
}

quick_error! {
    /// Logged and ignored: malformed JSON, an unknown command, or a malformed multiplex frame.
    /// Never tears down the connection it was read from.
    #[derive(Debug)]
    pub enum ProtocolError {
        Io(e: io::Error) {
            display("i/o error while reading a control message: {}", e)
            cause(e)
            from()
        }
        MalformedJson(e: serde_json::Error) {
            display("malformed control-plane message: {}", e)
            cause(e)
            from()
        }
        UnknownCommand(raw: String) {
            display("unrecognised control-plane command: {}", raw)
        }
        MalformedFrame(reason: &'static str) {
            display("malformed multiplex frame: {}", reason)
        }
    }
}

quick_error! {
    /// A dial failed, or a write to an established socket failed.
    #[derive(Debug)]
    pub enum TransportError {
        Bind(e: io::Error) {
            display("error binding reusable socket: {}", e)
            cause(e)
        }
        Connect(e: io::Error) {
            display("error connecting: {}", e)
            cause(e)
        }
        Io(e: io::Error) {
            display("transport i/o error: {}", e)
            cause(e)
            from()
        }
    }
}

quick_error! {
    /// A third client tried to register against an already-full pair.
    #[derive(Debug)]
    pub enum CapacityError {
        PairFull {
            display("rendezvous pair already has two registered clients")
        }
    }
}

quick_error! {
    /// Both the public and the private dial attempts exhausted their retry budget.
    #[derive(Debug)]
    pub enum ExhaustionError {
        BothAttemptsFailed {
            display("both public and private dial attempts exhausted their retry budget")
        }
    }
}
