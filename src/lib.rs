//! TCP hole punching and a multiplexed port tunnel over the punched (or relayed) connection.
//!
//! The three pieces live in their own modules and are wired together by the two binaries in
//! `src/bin/`: [`rendezvous_server`] pairs up clients, [`rendezvous_client`] drives one client's
//! side of the introduction and the punch/relay race, and [`multiplex`] + [`forwarder`] carry
//! the forwarded TCP traffic once a peer socket exists, however it was obtained.

pub mod endpoint;
pub mod error;
pub mod forwarder;
pub mod multiplex;
pub mod protocol;
pub mod rendezvous_client;
pub mod rendezvous_server;
