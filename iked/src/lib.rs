//! # iked
//!
//! An IKEv2 (RFC 7296) daemon core: the protocol engine negotiating IKE
//! and child security associations, the certificate authority engine, the
//! kernel IPsec coupling and the privilege-separated process plumbing
//! tying them together.
//!
//! The crate is structured around a sans-I/O [engine](crate::engine):
//! every state transition of an SA happens inside [engine::Engine] in
//! response to an input event (datagram, timer, CA verdict, control
//! command) and yields output actions (datagrams to send, CA requests,
//! kernel operations already applied). The tokio event loops in
//! [proc] wrap the engine with real sockets.

#![warn(missing_docs, clippy::unwrap_used, clippy::expect_used)]

use thiserror::Error;

pub mod ca;
pub mod config;
pub mod control;
pub mod cookie;
pub mod crypto;
pub mod engine;
pub mod envelope;
pub mod exchange;
pub mod frag;
pub mod ipc;
pub mod kdf;
pub mod kernel;
pub mod msg;
pub mod nat;
pub mod policy;
pub mod pool;
pub mod proc;
pub mod proposal;
pub mod sa;
pub mod timer;
pub mod vroute;

pub mod eap;

/// The error kinds of the daemon
///
/// Each kind has fixed propagation semantics: `Parse` on a stateless path
/// drops the datagram and on a stateful path closes the SA after an
/// INVALID_SYNTAX notify; `Crypto` is always a silent discard; `Kernel`
/// closes the affected child SA but never its parent; `Config` at reload
/// keeps the previous configuration in force; `Internal` is fatal: the
/// engine surfaces it as [engine::Output::Fatal], the event loop exits,
/// and the parent runs its teardown (routes removed, children told to
/// shut down) once the dead child's channel breaks.
#[derive(Debug, Error)]
#[allow(missing_docs)]
pub enum Error {
    #[error("parse: {0}")]
    Parse(#[from] ikewire::parser::ParserError),
    #[error("protocol: {0}")]
    Protocol(&'static str),
    #[error("authentication: {0}")]
    Authentication(&'static str),
    #[error("crypto: {0}")]
    Crypto(&'static str),
    #[error("kernel: {0}")]
    Kernel(String),
    #[error("resource: {0}")]
    Resource(&'static str),
    #[error("config: {0}")]
    Config(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl From<ikewire::generator::GeneratorError> for Error {
    fn from(value: ikewire::generator::GeneratorError) -> Self {
        Self::Internal(value.to_string())
    }
}

/// Convenience alias used throughout the crate
pub type Result<T, E = Error> = std::result::Result<T, E>;
